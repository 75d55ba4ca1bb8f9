// Sparse bind batches
//
// An update info is a list of bind batches. Each batch waits on and signals
// its own semaphores and carries buffer, image-tile and image-opaque
// updates. Updates are validated when appended, flattened into driver
// arrays by bake(), and written into the resources' trackers once the
// queue has accepted the submission.

use anyhow::{bail, Result};
use ash::vk;
use std::collections::BTreeSet;
use std::sync::Arc;

use super::{BlockRef, SparseBinding};
use crate::backend::buffer::Buffer;
use crate::backend::driver::{DeviceGroupIndices, SparseBindSubmitDesc};
use crate::backend::image::Image;
use crate::backend::memory::{MemoryBlock, MemoryResource};
use crate::backend::sync::{Fence, Semaphore};
use crate::AnvilError;

/// Memory behind an update. `owned` hands a reference to the resource.
#[derive(Clone, Debug)]
pub struct MemoryRef {
    pub block: Arc<MemoryBlock>,
    pub memory_offset: vk::DeviceSize,
    pub owned: bool,
}

impl MemoryRef {
    fn binding(&self) -> SparseBinding {
        SparseBinding {
            block: BlockRef::new(&self.block, self.owned),
            memory_offset: self.memory_offset,
        }
    }

    fn driver_bind(memory: &Option<MemoryRef>) -> (vk::DeviceMemory, vk::DeviceSize) {
        match memory {
            Some(m) => (m.block.memory(), m.block.start_offset() + m.memory_offset),
            None => (vk::DeviceMemory::null(), 0),
        }
    }
}

#[derive(Clone, Debug)]
pub struct BufferMemoryUpdate {
    pub buffer: Arc<Buffer>,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
    pub memory: Option<MemoryRef>,
}

#[derive(Clone, Debug)]
pub struct ImageMemoryUpdate {
    pub image: Arc<Image>,
    pub subresource: vk::ImageSubresource,
    pub offset: vk::Offset3D,
    pub extent: vk::Extent3D,
    pub flags: vk::SparseMemoryBindFlags,
    pub memory: Option<MemoryRef>,
}

#[derive(Clone, Debug)]
pub struct ImageOpaqueMemoryUpdate {
    pub image: Arc<Image>,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
    pub flags: vk::SparseMemoryBindFlags,
    pub memory: Option<MemoryRef>,
}

#[derive(Clone, Debug, Default)]
struct BindBatch {
    wait_semaphores: Vec<Arc<Semaphore>>,
    signal_semaphores: Vec<Arc<Semaphore>>,
    buffer_updates: Vec<BufferMemoryUpdate>,
    image_updates: Vec<ImageMemoryUpdate>,
    image_opaque_updates: Vec<ImageOpaqueMemoryUpdate>,
    resource_device_index: u32,
    memory_device_index: u32,
}

#[derive(Debug, Default)]
pub struct SparseMemoryBindingUpdateInfo {
    batches: Vec<BindBatch>,
    fence: Option<Arc<Fence>>,
    dirty: bool,
    baked: Vec<SparseBindSubmitDesc>,
}

impl SparseMemoryBindingUpdateInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new batch and return its index.
    pub fn add_bind_batch(&mut self, wait_semaphores: &[Arc<Semaphore>], signal_semaphores: &[Arc<Semaphore>]) -> u32 {
        self.batches.push(BindBatch {
            wait_semaphores: wait_semaphores.to_vec(),
            signal_semaphores: signal_semaphores.to_vec(),
            ..Default::default()
        });
        self.dirty = true;
        (self.batches.len() - 1) as u32
    }

    fn batch_mut(&mut self, batch: u32) -> Result<&mut BindBatch> {
        let count = self.batches.len();
        self.batches
            .get_mut(batch as usize)
            .ok_or_else(|| anyhow::anyhow!("bind batch {} does not exist ({} batches)", batch, count))
    }

    /// Device-group indices for the batch; both default to 0.
    pub fn set_device_indices(&mut self, batch: u32, resource_device_index: u32, memory_device_index: u32) -> Result<()> {
        let entry = self.batch_mut(batch)?;
        entry.resource_device_index = resource_device_index;
        entry.memory_device_index = memory_device_index;
        self.dirty = true;
        Ok(())
    }

    /// Bind `[offset, offset + size)` of a sparse buffer, or unbind it when
    /// `memory` is None.
    #[allow(clippy::too_many_arguments)]
    pub fn append_buffer_memory_update(
        &mut self,
        batch: u32,
        buffer: &Arc<Buffer>,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
        memory: Option<&Arc<MemoryBlock>>,
        memory_offset: vk::DeviceSize,
        owned: bool,
    ) -> Result<()> {
        buffer.validate_sparse_update(offset, size)?;
        let memory = Self::memory_ref(memory, memory_offset, size, owned)?;
        self.batch_mut(batch)?.buffer_updates.push(BufferMemoryUpdate {
            buffer: Arc::clone(buffer),
            offset,
            size,
            memory,
        });
        self.dirty = true;
        Ok(())
    }

    /// Bind a tile-aligned region of one subresource of an image with a
    /// residency scope.
    #[allow(clippy::too_many_arguments)]
    pub fn append_image_memory_update(
        &mut self,
        batch: u32,
        image: &Arc<Image>,
        subresource: vk::ImageSubresource,
        offset: vk::Offset3D,
        extent: vk::Extent3D,
        memory: Option<&Arc<MemoryBlock>>,
        memory_offset: vk::DeviceSize,
        owned: bool,
    ) -> Result<()> {
        image.validate_tile_update(subresource, offset, extent)?;

        let tiles = image
            .sparse_occupancy()
            .and_then(|o| o.aspect(subresource.aspect_mask).map(|a| a.granularity()))
            .map_or(1, |g| {
                u64::from(extent.width.div_ceil(g.width.max(1)))
                    * u64::from(extent.height.div_ceil(g.height.max(1)))
                    * u64::from(extent.depth.div_ceil(g.depth.max(1)))
            });
        let size = tiles * image.memory_requirements().alignment;
        let memory = Self::memory_ref(memory, memory_offset, size, owned)?;

        self.batch_mut(batch)?.image_updates.push(ImageMemoryUpdate {
            image: Arc::clone(image),
            subresource,
            offset,
            extent,
            flags: vk::SparseMemoryBindFlags::empty(),
            memory,
        });
        self.dirty = true;
        Ok(())
    }

    /// Opaque bind into a sparse image: any page range for images without a
    /// residency scope, mip tail pages or (with METADATA) a whole metadata
    /// tail otherwise.
    #[allow(clippy::too_many_arguments)]
    pub fn append_opaque_image_memory_update(
        &mut self,
        batch: u32,
        image: &Arc<Image>,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
        flags: vk::SparseMemoryBindFlags,
        memory: Option<&Arc<MemoryBlock>>,
        memory_offset: vk::DeviceSize,
        owned: bool,
    ) -> Result<()> {
        image.validate_opaque_update(offset, size, flags)?;
        let memory = Self::memory_ref(memory, memory_offset, size, owned)?;
        self.batch_mut(batch)?.image_opaque_updates.push(ImageOpaqueMemoryUpdate {
            image: Arc::clone(image),
            offset,
            size,
            flags,
            memory,
        });
        self.dirty = true;
        Ok(())
    }

    fn memory_ref(
        memory: Option<&Arc<MemoryBlock>>,
        memory_offset: vk::DeviceSize,
        size: vk::DeviceSize,
        owned: bool,
    ) -> Result<Option<MemoryRef>> {
        let Some(block) = memory else {
            return Ok(None);
        };
        if memory_offset.checked_add(size).map_or(true, |end| end > block.size()) {
            return Err(AnvilError::InvalidSparseRegion(format!(
                "memory range {}+{} exceeds a block of {} bytes",
                memory_offset,
                size,
                block.size()
            ))
            .into());
        }
        Ok(Some(MemoryRef {
            block: Arc::clone(block),
            memory_offset,
            owned,
        }))
    }

    /// Fence signalled when the whole submission retires.
    pub fn set_fence(&mut self, fence: Option<Arc<Fence>>) {
        self.fence = fence;
    }

    pub fn fence(&self) -> Option<&Arc<Fence>> {
        self.fence.as_ref()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn batch_count(&self) -> usize {
        self.batches.len()
    }

    /// Flatten the batches into driver submissions.
    pub fn bake(&mut self) -> &[SparseBindSubmitDesc] {
        self.baked = self.batches.iter().map(Self::bake_batch).collect();
        self.dirty = false;
        &self.baked
    }

    /// Result of the last bake.
    pub fn baked(&self) -> &[SparseBindSubmitDesc] {
        &self.baked
    }

    fn bake_batch(batch: &BindBatch) -> SparseBindSubmitDesc {
        let mut desc = SparseBindSubmitDesc {
            wait_semaphores: batch.wait_semaphores.iter().map(|s| s.handle()).collect(),
            signal_semaphores: batch.signal_semaphores.iter().map(|s| s.handle()).collect(),
            ..Default::default()
        };

        for update in &batch.buffer_updates {
            let (memory, memory_offset) = MemoryRef::driver_bind(&update.memory);
            let bind = vk::SparseMemoryBind {
                resource_offset: update.offset,
                size: update.size,
                memory,
                memory_offset,
                flags: vk::SparseMemoryBindFlags::empty(),
            };
            push_grouped(&mut desc.buffer_binds, update.buffer.handle(), bind);
        }

        for update in &batch.image_opaque_updates {
            let (memory, memory_offset) = MemoryRef::driver_bind(&update.memory);
            let bind = vk::SparseMemoryBind {
                resource_offset: update.offset,
                size: update.size,
                memory,
                memory_offset,
                flags: update.flags,
            };
            push_grouped(&mut desc.image_opaque_binds, update.image.handle(), bind);
        }

        for update in &batch.image_updates {
            let (memory, memory_offset) = MemoryRef::driver_bind(&update.memory);
            let bind = vk::SparseImageMemoryBind {
                subresource: update.subresource,
                offset: update.offset,
                extent: update.extent,
                memory,
                memory_offset,
                flags: update.flags,
            };
            push_grouped(&mut desc.image_binds, update.image.handle(), bind);
        }

        if batch.resource_device_index != 0 || batch.memory_device_index != 0 {
            desc.device_group = Some(DeviceGroupIndices {
                resource_device_index: batch.resource_device_index,
                memory_device_index: batch.memory_device_index,
            });
        }
        desc
    }

    /// Every resource touched by any batch, once each.
    pub fn resources(&self) -> Vec<MemoryResource> {
        let mut seen = BTreeSet::new();
        let mut resources = Vec::new();
        for batch in &self.batches {
            let touched = batch
                .buffer_updates
                .iter()
                .map(|u| MemoryResource::Buffer(Arc::clone(&u.buffer)))
                .chain(batch.image_updates.iter().map(|u| MemoryResource::Image(Arc::clone(&u.image))))
                .chain(
                    batch
                        .image_opaque_updates
                        .iter()
                        .map(|u| MemoryResource::Image(Arc::clone(&u.image))),
                );
            for resource in touched {
                if seen.insert(resource.identity()) {
                    resources.push(resource);
                }
            }
        }
        resources
    }

    /// Check every update against its resource without touching any tracker.
    pub(crate) fn validate(&self) -> Result<()> {
        for batch in &self.batches {
            for update in &batch.buffer_updates {
                update.buffer.validate_sparse_update(update.offset, update.size)?;
            }
            for update in &batch.image_opaque_updates {
                update
                    .image
                    .validate_opaque_update(update.offset, update.size, update.flags)?;
            }
            for update in &batch.image_updates {
                update
                    .image
                    .validate_tile_update(update.subresource, update.offset, update.extent)?;
            }
        }
        Ok(())
    }

    /// Write every update into the trackers, in submission order, then move
    /// touched images out of their post-create layout.
    ///
    /// Nothing is written unless every update validates.
    pub(crate) fn apply(&self) -> Result<()> {
        if self.dirty {
            bail!("sparse binding update changed after it was submitted");
        }
        self.validate()?;

        for batch in &self.batches {
            for update in &batch.buffer_updates {
                update
                    .buffer
                    .apply_sparse_update(update.offset, update.size, update.memory.as_ref().map(MemoryRef::binding))?;
            }
            for update in &batch.image_opaque_updates {
                update.image.apply_opaque_update(
                    update.offset,
                    update.size,
                    update.flags,
                    update.memory.as_ref().map(MemoryRef::binding),
                )?;
            }
            for update in &batch.image_updates {
                update.image.apply_tile_update(
                    update.subresource,
                    update.offset,
                    update.extent,
                    update.memory.as_ref().map(MemoryRef::binding),
                )?;
            }
        }

        for resource in self.resources() {
            if let MemoryResource::Image(image) = resource {
                image.transition_to_post_alloc_layout()?;
            }
        }
        Ok(())
    }
}

fn push_grouped<H: PartialEq + Copy, B>(groups: &mut Vec<(H, Vec<B>)>, handle: H, bind: B) {
    match groups.iter_mut().find(|(h, _)| *h == handle) {
        Some((_, binds)) => binds.push(bind),
        None => groups.push((handle, vec![bind])),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::buffer::{BufferCreateInfo, SparseBufferResidency};
    use crate::backend::device::{Device, DeviceCreateInfo};
    use crate::backend::image::{ImageCreateInfo, SparseResidencyScope};
    use crate::backend::null_driver::NullBackend;
    use crate::backend::registry::ObjectRegistry;

    const PAGE: vk::DeviceSize = 65536;

    fn device() -> Arc<Device> {
        Device::create(
            &NullBackend::new(),
            DeviceCreateInfo::default().with_registry(ObjectRegistry::new()),
        )
        .unwrap()
    }

    fn sparse_buffer(device: &Arc<Device>, pages: u64) -> Arc<Buffer> {
        Buffer::create(BufferCreateInfo::create_sparse_no_alloc(
            device,
            "sparse",
            pages * PAGE,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            SparseBufferResidency::Resident,
        ))
        .unwrap()
    }

    fn block(device: &Arc<Device>, size: vk::DeviceSize) -> Arc<MemoryBlock> {
        MemoryBlock::create(
            device,
            "pages",
            vk::MemoryRequirements {
                size,
                alignment: PAGE,
                memory_type_bits: 1,
            },
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            true,
        )
        .unwrap()
    }

    #[test]
    fn bake_groups_binds_per_resource_and_clears_dirty() {
        let device = device();
        let a = sparse_buffer(&device, 4);
        let b = sparse_buffer(&device, 4);
        let memory = block(&device, 4 * PAGE);

        let mut update = SparseMemoryBindingUpdateInfo::new();
        let batch = update.add_bind_batch(&[], &[]);
        update
            .append_buffer_memory_update(batch, &a, 0, PAGE, Some(&memory), 0, true)
            .unwrap();
        update
            .append_buffer_memory_update(batch, &b, 0, PAGE, Some(&memory), PAGE, true)
            .unwrap();
        update
            .append_buffer_memory_update(batch, &a, 2 * PAGE, PAGE, None, 0, false)
            .unwrap();
        assert!(update.is_dirty());

        let baked = update.bake();
        assert_eq!(baked.len(), 1);
        assert_eq!(baked[0].buffer_binds.len(), 2);
        assert_eq!(baked[0].buffer_binds[0].1.len(), 2);
        assert_eq!(baked[0].buffer_binds[0].1[1].memory, vk::DeviceMemory::null());
        assert!(baked[0].device_group.is_none());
        assert!(!update.is_dirty());
        assert_eq!(update.resources().len(), 2);
    }

    #[test]
    fn device_group_info_only_for_non_zero_indices() {
        let mut update = SparseMemoryBindingUpdateInfo::new();
        let first = update.add_bind_batch(&[], &[]);
        let second = update.add_bind_batch(&[], &[]);
        update.set_device_indices(first, 0, 0).unwrap();
        update.set_device_indices(second, 1, 0).unwrap();
        assert!(update.set_device_indices(2, 0, 0).is_err());

        let baked = update.bake();
        assert!(baked[0].device_group.is_none());
        assert_eq!(
            baked[1].device_group,
            Some(DeviceGroupIndices {
                resource_device_index: 1,
                memory_device_index: 0,
            })
        );
    }

    #[test]
    fn memory_ranges_past_the_block_are_rejected() {
        let device = device();
        let buffer = sparse_buffer(&device, 2);
        let memory = block(&device, PAGE);

        let mut update = SparseMemoryBindingUpdateInfo::new();
        let batch = update.add_bind_batch(&[], &[]);
        let err = update
            .append_buffer_memory_update(batch, &buffer, 0, 2 * PAGE, Some(&memory), 0, true)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AnvilError>(),
            Some(AnvilError::InvalidSparseRegion(_))
        ));
    }

    #[test]
    fn failed_transition_leaves_every_tracker_written() {
        let backend = NullBackend::new();
        let device = Device::create(
            &backend,
            DeviceCreateInfo::default().with_registry(ObjectRegistry::new()),
        )
        .unwrap();
        let driver = backend.last_driver().unwrap();

        let tiled = |name: &str| {
            Image::create(
                ImageCreateInfo::create_sparse_no_alloc(
                    &device,
                    name,
                    vk::Format::R8G8B8A8_UNORM,
                    vk::Extent3D {
                        width: 256,
                        height: 256,
                        depth: 1,
                    },
                    vk::ImageUsageFlags::SAMPLED,
                    SparseResidencyScope::NonAliased,
                )
                .with_post_alloc_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
            )
            .unwrap()
        };
        let first = tiled("first");
        let second = tiled("second");
        let memory = block(&device, 2 * PAGE);

        let mut update = SparseMemoryBindingUpdateInfo::new();
        let batch = update.add_bind_batch(&[], &[]);
        let color = vk::ImageSubresource {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            array_layer: 0,
        };
        let tile = vk::Extent3D {
            width: 128,
            height: 128,
            depth: 1,
        };
        for (image, offset) in [(&first, 0), (&second, PAGE)] {
            update
                .append_image_memory_update(
                    batch,
                    image,
                    color,
                    vk::Offset3D::default(),
                    tile,
                    Some(&memory),
                    offset,
                    true,
                )
                .unwrap();
        }

        driver.fail_next_layout_transition(vk::Result::ERROR_DEVICE_LOST);
        let queue = Arc::clone(device.sparse_binding_queues()[0]);
        assert!(queue.bind_sparse_memory(&mut update).is_err());

        // The driver accepted the bind, so both trackers reflect it.
        for image in [&first, &second] {
            assert!(image.is_memory_bound_for_texel(vk::ImageAspectFlags::COLOR, 0, 0, 0, 0, 0));
            assert!(!image.is_memory_bound_for_texel(vk::ImageAspectFlags::COLOR, 0, 0, 128, 0, 0));
        }
        assert!(!first.has_transitioned());
        assert!(driver.journal().layout_transitions.is_empty());
    }
}
