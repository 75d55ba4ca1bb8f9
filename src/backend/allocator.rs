// Deferred memory allocator
//
// Resources handed to the allocator stay unbound until somebody needs
// them. The first MemoryBlockNeeded from any tracked resource, or an
// explicit bake(), binds memory for everything queued so far:
// - non-sparse resources with compatible requirements share one block and
//   get derived sub-blocks
// - sparse buffers and opaque sparse images get a block each, bound over
//   their whole range on a sparse binding queue

use anyhow::{anyhow, bail, Result};
use ash::vk;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

use super::buffer::Buffer;
use super::callback::SubscriptionToken;
use super::device::Device;
use super::image::{Image, SparseResidencyScope};
use super::memory::{MemoryBlock, MemoryCallbackId, MemoryEvent, MemoryResource};
use super::object::ObjectIdentity;
use super::sparse::SparseMemoryBindingUpdateInfo;
use super::sync::Fence;

struct PendingItem {
    resource: MemoryResource,
    properties: vk::MemoryPropertyFlags,
    tokens: Vec<SubscriptionToken>,
}

impl PendingItem {
    fn requirements(&self) -> vk::MemoryRequirements {
        match &self.resource {
            MemoryResource::Buffer(buffer) => buffer.memory_requirements(),
            MemoryResource::Image(image) => image.memory_requirements(),
        }
    }

    fn is_sparse(&self) -> bool {
        match &self.resource {
            MemoryResource::Buffer(buffer) => buffer.is_sparse(),
            MemoryResource::Image(image) => image.is_sparse(),
        }
    }

    fn is_linear(&self) -> bool {
        match &self.resource {
            MemoryResource::Buffer(_) => true,
            MemoryResource::Image(image) => image.create_info().tiling() == vk::ImageTiling::LINEAR,
        }
    }

    fn unsubscribe(&self) {
        for token in &self.tokens {
            match &self.resource {
                MemoryResource::Buffer(buffer) => buffer.unsubscribe(*token),
                MemoryResource::Image(image) => image.unsubscribe(*token),
            };
        }
    }
}

/// Non-sparse items that will share one memory block.
struct AllocationGroup {
    properties: vk::MemoryPropertyFlags,
    linear: bool,
    memory_type_bits: u32,
    items: Vec<PendingItem>,
}

fn align_up(value: vk::DeviceSize, alignment: vk::DeviceSize) -> vk::DeviceSize {
    value.next_multiple_of(alignment.max(1))
}

pub struct MemoryAllocator {
    device: Arc<Device>,
    pending: Mutex<Vec<PendingItem>>,
    self_ref: Weak<MemoryAllocator>,
}

impl MemoryAllocator {
    pub fn create(device: &Arc<Device>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            device: Arc::clone(device),
            pending: Mutex::new(Vec::new()),
            self_ref: self_ref.clone(),
        })
    }

    pub fn add_buffer(&self, buffer: &Arc<Buffer>, properties: vk::MemoryPropertyFlags) -> Result<()> {
        if buffer.parent().is_some() {
            bail!("child buffer '{}' takes its memory from its parent", buffer.name());
        }
        if !buffer.is_sparse() && buffer.is_memory_bound() {
            bail!("buffer '{}' already has memory", buffer.name());
        }
        self.track(MemoryResource::Buffer(Arc::clone(buffer)), properties)
    }

    pub fn add_image(&self, image: &Arc<Image>, properties: vk::MemoryPropertyFlags) -> Result<()> {
        match image.create_info().residency_scope() {
            Some(SparseResidencyScope::None) => {}
            Some(scope) => bail!(
                "image '{}' has residency scope {:?}; bind its tiles explicitly",
                image.name(),
                scope
            ),
            None if image.is_memory_bound() => bail!("image '{}' already has memory", image.name()),
            None => {}
        }
        self.track(MemoryResource::Image(Arc::clone(image)), properties)
    }

    fn track(&self, resource: MemoryResource, properties: vk::MemoryPropertyFlags) -> Result<()> {
        let identity = resource.identity();
        if self.is_pending(identity) {
            bail!("'{}' is already queued for allocation", resource.name());
        }

        let needed = {
            let allocator = self.self_ref.clone();
            move |_: &MemoryEvent| {
                if let Some(allocator) = allocator.upgrade() {
                    if let Err(e) = allocator.bake() {
                        log::error!("Deferred allocation failed: {:#}", e);
                    }
                }
            }
        };
        let pending = {
            let allocator = self.self_ref.clone();
            move |event: &MemoryEvent| {
                let MemoryEvent::IsAllocPending { resource, pending } = event else {
                    return;
                };
                let Some(allocator) = allocator.upgrade() else {
                    return;
                };
                if allocator.is_pending(resource.identity()) {
                    pending.set(true);
                    if let Err(e) = allocator.bake() {
                        log::error!("Deferred allocation failed: {:#}", e);
                    }
                }
            }
        };

        let tokens = match &resource {
            MemoryResource::Buffer(buffer) => vec![
                buffer.subscribe(MemoryCallbackId::MemoryBlockNeeded, needed),
                buffer.subscribe(MemoryCallbackId::IsAllocPending, pending),
            ],
            MemoryResource::Image(image) => vec![
                image.subscribe(MemoryCallbackId::MemoryBlockNeeded, needed),
                image.subscribe(MemoryCallbackId::IsAllocPending, pending),
            ],
        };

        log::trace!("Queued '{}' for deferred allocation", resource.name());
        self.pending.lock().push(PendingItem {
            resource,
            properties,
            tokens,
        });
        Ok(())
    }

    pub fn is_pending(&self, identity: ObjectIdentity) -> bool {
        self.pending
            .lock()
            .iter()
            .any(|item| item.resource.identity() == identity)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Bind memory to every queued resource. Resources that could not be
    /// bound stay queued.
    pub fn bake(&self) -> Result<()> {
        let items = std::mem::take(&mut *self.pending.lock());
        if items.is_empty() {
            return Ok(());
        }
        log::debug!("Baking {} deferred allocations", items.len());

        let (sparse, regular): (Vec<_>, Vec<_>) = items.into_iter().partition(PendingItem::is_sparse);

        let mut failed = Vec::new();
        let mut error = None;

        for group in Self::group(regular) {
            if error.is_some() {
                failed.extend(group.items);
                continue;
            }
            if let Err((e, rest)) = self.bind_group(group) {
                error = Some(e);
                failed.extend(rest);
            }
        }

        for item in sparse {
            if error.is_some() {
                failed.push(item);
                continue;
            }
            match self.bind_sparse(&item) {
                Ok(()) => item.unsubscribe(),
                Err(e) => {
                    error = Some(e);
                    failed.push(item);
                }
            }
        }

        if !failed.is_empty() {
            log::warn!("{} deferred allocations left pending", failed.len());
            self.pending.lock().extend(failed);
        }
        match error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn group(items: Vec<PendingItem>) -> Vec<AllocationGroup> {
        let mut groups: Vec<AllocationGroup> = Vec::new();
        for item in items {
            let requirements = item.requirements();
            let linear = item.is_linear();
            let slot = groups.iter_mut().find(|g| {
                g.properties == item.properties
                    && g.linear == linear
                    && g.memory_type_bits & requirements.memory_type_bits != 0
            });
            match slot {
                Some(group) => {
                    group.memory_type_bits &= requirements.memory_type_bits;
                    group.items.push(item);
                }
                None => groups.push(AllocationGroup {
                    properties: item.properties,
                    linear,
                    memory_type_bits: requirements.memory_type_bits,
                    items: vec![item],
                }),
            }
        }
        groups
    }

    /// On failure returns the items that are still unbound.
    fn bind_group(&self, group: AllocationGroup) -> std::result::Result<(), (anyhow::Error, Vec<PendingItem>)> {
        let mut offsets = Vec::with_capacity(group.items.len());
        let mut cursor = 0;
        let mut alignment = 1;
        for item in &group.items {
            let requirements = item.requirements();
            let offset = align_up(cursor, requirements.alignment);
            offsets.push((offset, requirements.size));
            cursor = offset + requirements.size;
            alignment = alignment.max(requirements.alignment);
        }

        let block = MemoryBlock::create(
            &self.device,
            "deferred allocation",
            vk::MemoryRequirements {
                size: cursor,
                alignment,
                memory_type_bits: group.memory_type_bits,
            },
            group.properties,
            group.linear,
        );
        let block = match block {
            Ok(block) => block,
            Err(e) => return Err((e, group.items)),
        };

        let mut items = group.items.into_iter().zip(offsets);
        while let Some((item, (offset, size))) = items.next() {
            let bound = MemoryBlock::create_derived(&block, offset, size).and_then(|derived| match &item.resource {
                MemoryResource::Buffer(buffer) => buffer.set_memory(derived),
                MemoryResource::Image(image) => image.set_memory(derived),
            });
            match bound {
                Ok(()) => item.unsubscribe(),
                Err(e) => {
                    let mut rest = vec![item];
                    rest.extend(items.map(|(item, _)| item));
                    return Err((e, rest));
                }
            }
        }
        Ok(())
    }

    fn bind_sparse(&self, item: &PendingItem) -> Result<()> {
        let queue = self
            .device
            .sparse_binding_queues()
            .first()
            .map(|q| Arc::clone(q))
            .ok_or_else(|| anyhow!("no sparse binding queue to bind '{}'", item.resource.name()))?;

        let requirements = item.requirements();
        let block = MemoryBlock::create(
            &self.device,
            item.resource.name(),
            requirements,
            item.properties,
            item.is_linear(),
        )?;

        let mut update = SparseMemoryBindingUpdateInfo::new();
        let batch = update.add_bind_batch(&[], &[]);
        match &item.resource {
            MemoryResource::Buffer(buffer) => {
                update.append_buffer_memory_update(batch, buffer, 0, buffer.size(), Some(&block), 0, true)?
            }
            MemoryResource::Image(image) => update.append_opaque_image_memory_update(
                batch,
                image,
                0,
                requirements.size,
                vk::SparseMemoryBindFlags::empty(),
                Some(&block),
                0,
                true,
            )?,
        }

        let fence = Fence::create(&self.device, false)?;
        update.set_fence(Some(Arc::clone(&fence)));
        queue.bind_sparse_memory(&mut update)?;
        fence.wait(u64::MAX)
    }
}

impl Drop for MemoryAllocator {
    fn drop(&mut self) {
        let items = std::mem::take(&mut *self.pending.lock());
        if !items.is_empty() {
            log::warn!("Memory allocator dropped with {} resources never bound", items.len());
        }
        for item in items {
            item.unsubscribe();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::buffer::{BufferCreateInfo, SparseBufferResidency};
    use crate::backend::device::DeviceCreateInfo;
    use crate::backend::image::ImageCreateInfo;
    use crate::backend::null_driver::{NullBackend, NullDriver};
    use crate::backend::registry::ObjectRegistry;

    fn device() -> (Arc<Device>, Arc<NullDriver>) {
        let backend = NullBackend::new();
        let device = Device::create(
            &backend,
            DeviceCreateInfo::default().with_registry(ObjectRegistry::new()),
        )
        .unwrap();
        let driver = backend.last_driver().unwrap();
        (device, driver)
    }

    fn buffer(device: &Arc<Device>, name: &str, size: vk::DeviceSize) -> Arc<Buffer> {
        Buffer::create(BufferCreateInfo::create_nonsparse_no_alloc(
            device,
            name,
            size,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
        ))
        .unwrap()
    }

    #[test]
    fn first_use_binds_every_queued_resource() {
        let (device, driver) = device();
        let allocator = MemoryAllocator::create(&device);
        let a = buffer(&device, "a", 100);
        let b = buffer(&device, "b", 300);
        allocator.add_buffer(&a, vk::MemoryPropertyFlags::HOST_VISIBLE).unwrap();
        allocator.add_buffer(&b, vk::MemoryPropertyFlags::HOST_VISIBLE).unwrap();
        assert_eq!(allocator.pending_count(), 2);

        a.get_buffer();

        assert_eq!(allocator.pending_count(), 0);
        assert!(b.is_memory_bound());
        let (block_a, block_b) = (a.get_memory_block().unwrap(), b.get_memory_block().unwrap());
        assert_eq!(block_a.memory(), block_b.memory());
        assert_eq!(block_b.start_offset(), 256);
        assert_eq!(driver.live_allocation_count(), 1);
    }

    #[test]
    fn incompatible_properties_get_separate_blocks() {
        let (device, driver) = device();
        let allocator = MemoryAllocator::create(&device);
        let a = buffer(&device, "a", 100);
        let b = buffer(&device, "b", 100);
        allocator.add_buffer(&a, vk::MemoryPropertyFlags::HOST_VISIBLE).unwrap();
        allocator.add_buffer(&b, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap();
        allocator.bake().unwrap();

        assert_ne!(
            a.get_memory_block().unwrap().memory(),
            b.get_memory_block().unwrap().memory()
        );
        assert_eq!(driver.live_allocation_count(), 2);
    }

    #[test]
    fn pending_sparse_buffers_are_flushed_before_use() {
        let (device, driver) = device();
        let allocator = MemoryAllocator::create(&device);
        let sparse = Buffer::create(BufferCreateInfo::create_sparse_no_alloc(
            &device,
            "sparse",
            3 * 65536,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            SparseBufferResidency::NonResident,
        ))
        .unwrap();
        allocator.add_buffer(&sparse, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap();

        assert!(sparse.is_alloc_pending());
        assert!(sparse.is_range_bound(0, 3 * 65536));
        assert!(!sparse.is_alloc_pending());
        assert_eq!(driver.journal().sparse_submits.len(), 1);
    }

    #[test]
    fn resident_sparse_images_are_refused() {
        let (device, _) = device();
        let allocator = MemoryAllocator::create(&device);
        let image = Image::create(ImageCreateInfo::create_sparse_no_alloc(
            &device,
            "tiles",
            vk::Format::R8G8B8A8_UNORM,
            vk::Extent3D {
                width: 256,
                height: 256,
                depth: 1,
            },
            vk::ImageUsageFlags::SAMPLED,
            SparseResidencyScope::NonAliased,
        ))
        .unwrap();
        assert!(allocator
            .add_image(&image, vk::MemoryPropertyFlags::DEVICE_LOCAL)
            .is_err());
    }

    #[test]
    fn dropping_the_allocator_releases_subscriptions() {
        let (device, _) = device();
        let allocator = MemoryAllocator::create(&device);
        let a = buffer(&device, "a", 64);
        allocator.add_buffer(&a, vk::MemoryPropertyFlags::HOST_VISIBLE).unwrap();
        drop(allocator);

        a.get_buffer();
        assert!(!a.is_memory_bound());
    }
}
