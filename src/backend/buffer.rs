// Buffers
//
// A buffer is created in one of four modes:
// - create_alloc: memory is allocated and bound right away
// - create_nonsparse_no_alloc: memory is bound later by whoever answers
//   MemoryBlockNeeded (usually a MemoryAllocator)
// - create_nonsparse_no_alloc_child: a sub-range of another buffer, sharing
//   its driver buffer and memory
// - create_sparse_no_alloc: pages are bound through sparse bind batches and
//   tracked by a PageTracker

use anyhow::{bail, Context, Result};
use ash::vk;
use parking_lot::Mutex;
use std::cell::Cell;
use std::fmt;
use std::sync::{Arc, OnceLock, Weak};

use super::callback::{CallbackHub, SubscriptionToken};
use super::device::Device;
use super::driver::BufferDesc;
use super::memory::{MemoryBlock, MemoryCallbackId, MemoryEvent, MemoryResource};
use super::object::{MtLock, MtSafety, ObjectKind};
use super::registry::Registration;
use super::sparse::page_tracker::{BoundRange, PageTracker};
use super::sparse::SparseBinding;
use crate::AnvilError;

/// Residency model of a sparse buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SparseBufferResidency {
    /// Fully bound before use.
    NonResident,
    /// May be partially bound.
    Resident,
    /// Partially bound, and pages may alias each other.
    ResidentAliased,
}

impl SparseBufferResidency {
    fn create_flags(self) -> vk::BufferCreateFlags {
        match self {
            SparseBufferResidency::NonResident => vk::BufferCreateFlags::SPARSE_BINDING,
            SparseBufferResidency::Resident => {
                vk::BufferCreateFlags::SPARSE_BINDING | vk::BufferCreateFlags::SPARSE_RESIDENCY
            }
            SparseBufferResidency::ResidentAliased => {
                vk::BufferCreateFlags::SPARSE_BINDING
                    | vk::BufferCreateFlags::SPARSE_RESIDENCY
                    | vk::BufferCreateFlags::SPARSE_ALIASED
            }
        }
    }
}

#[derive(Clone, Debug)]
enum BufferCreateMode {
    Alloc { properties: vk::MemoryPropertyFlags },
    NoAlloc,
    NoAllocChild { parent: Arc<Buffer>, offset: vk::DeviceSize },
    SparseNoAlloc { residency: SparseBufferResidency },
}

#[derive(Clone, Debug)]
pub struct BufferCreateInfo {
    device: Arc<Device>,
    name: String,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    queue_families: Vec<u32>,
    mt_safety: MtSafety,
    mode: BufferCreateMode,
}

impl BufferCreateInfo {
    fn with_mode(
        device: &Arc<Device>,
        name: &str,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        mode: BufferCreateMode,
    ) -> Self {
        Self {
            device: Arc::clone(device),
            name: name.to_string(),
            size,
            usage,
            queue_families: Vec::new(),
            mt_safety: MtSafety::Inherit,
            mode,
        }
    }

    /// Buffer with memory of the given properties bound at creation.
    pub fn create_alloc(
        device: &Arc<Device>,
        name: &str,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> Self {
        Self::with_mode(device, name, size, usage, BufferCreateMode::Alloc { properties })
    }

    pub fn create_nonsparse_no_alloc(
        device: &Arc<Device>,
        name: &str,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> Self {
        Self::with_mode(device, name, size, usage, BufferCreateMode::NoAlloc)
    }

    /// `[offset, offset + size)` of `parent`. Usage and sharing are inherited.
    pub fn create_nonsparse_no_alloc_child(
        parent: &Arc<Buffer>,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> Self {
        let parent_info = parent.create_info();
        Self {
            name: format!("{}[{}..{}]", parent_info.name, offset, offset.saturating_add(size)),
            queue_families: parent_info.queue_families.clone(),
            mt_safety: parent_info.mt_safety,
            ..Self::with_mode(
                &parent_info.device,
                "",
                size,
                parent_info.usage,
                BufferCreateMode::NoAllocChild {
                    parent: Arc::clone(parent),
                    offset,
                },
            )
        }
    }

    pub fn create_sparse_no_alloc(
        device: &Arc<Device>,
        name: &str,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        residency: SparseBufferResidency,
    ) -> Self {
        Self::with_mode(
            device,
            name,
            size,
            usage,
            BufferCreateMode::SparseNoAlloc { residency },
        )
    }

    /// Share the buffer between these queue families (concurrent mode).
    pub fn with_queue_families(mut self, families: Vec<u32>) -> Self {
        self.queue_families = families;
        self
    }

    pub fn with_mt_safety(mut self, mt_safety: MtSafety) -> Self {
        self.mt_safety = mt_safety;
        self
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    pub fn sparse_residency(&self) -> Option<SparseBufferResidency> {
        match self.mode {
            BufferCreateMode::SparseNoAlloc { residency } => Some(residency),
            _ => None,
        }
    }
}

enum BufferMemory {
    Unbound,
    Bound(Arc<MemoryBlock>),
    Sparse(PageTracker),
}

pub struct Buffer {
    handle: vk::Buffer,
    create_info: BufferCreateInfo,
    requirements: vk::MemoryRequirements,
    memory: Mutex<BufferMemory>,
    callbacks: CallbackHub<MemoryEvent>,
    self_ref: Weak<Buffer>,
    mt_lock: MtLock,
    registration: OnceLock<Registration>,
}

impl Buffer {
    pub fn create(create_info: BufferCreateInfo) -> Result<Arc<Self>> {
        let device = Arc::clone(&create_info.device);
        let mt_safe = device.context().resolve_mt_safety(create_info.mt_safety);

        let (handle, requirements) = match &create_info.mode {
            BufferCreateMode::NoAllocChild { parent, offset } => {
                if parent.is_sparse() {
                    bail!("child buffers of sparse buffers are not supported");
                }
                if offset.checked_add(create_info.size).map_or(true, |end| end > parent.size()) {
                    bail!(
                        "child range {}+{} exceeds parent '{}' of {} bytes",
                        offset,
                        create_info.size,
                        parent.name(),
                        parent.size()
                    );
                }
                let requirements = vk::MemoryRequirements {
                    size: create_info.size,
                    ..parent.memory_requirements()
                };
                (parent.handle, requirements)
            }
            mode => {
                let flags = match mode {
                    BufferCreateMode::SparseNoAlloc { residency } => {
                        Self::check_sparse_support(&device, *residency)?;
                        residency.create_flags()
                    }
                    _ => vk::BufferCreateFlags::empty(),
                };
                let handle = device
                    .driver()
                    .create_buffer(&BufferDesc {
                        flags,
                        size: create_info.size,
                        usage: create_info.usage,
                        queue_families: create_info.queue_families.clone(),
                    })
                    .map_err(AnvilError::Driver)
                    .with_context(|| format!("Failed to create buffer '{}'", create_info.name))?;
                (handle, device.driver().buffer_memory_requirements(handle))
            }
        };

        let memory = match &create_info.mode {
            BufferCreateMode::SparseNoAlloc { .. } => {
                BufferMemory::Sparse(PageTracker::new(create_info.size, requirements.alignment))
            }
            _ => BufferMemory::Unbound,
        };

        let buffer = Arc::new_cyclic(|self_ref| Self {
            handle,
            create_info,
            requirements,
            memory: Mutex::new(memory),
            callbacks: CallbackHub::new(),
            self_ref: self_ref.clone(),
            mt_lock: MtLock::new(mt_safe),
            registration: OnceLock::new(),
        });
        Registration::attach(
            &buffer.registration,
            device.registry(),
            ObjectKind::Buffer,
            &buffer,
        );

        if let BufferCreateMode::Alloc { properties } = buffer.create_info.mode {
            let block = MemoryBlock::create(&device, &buffer.create_info.name, requirements, properties, true)?;
            buffer.set_memory(block)?;
        }

        log::debug!(
            "Buffer '{}' created: {} bytes, {:?}",
            buffer.create_info.name,
            buffer.create_info.size,
            buffer.create_info.usage
        );
        Ok(buffer)
    }

    fn check_sparse_support(device: &Device, residency: SparseBufferResidency) -> Result<()> {
        let features = &device.physical_device().features;
        let supported = match residency {
            SparseBufferResidency::NonResident => features.sparse_binding,
            SparseBufferResidency::Resident => features.sparse_residency_buffer,
            SparseBufferResidency::ResidentAliased => {
                features.sparse_residency_buffer & features.sparse_residency_aliased
            }
        };
        if supported == vk::FALSE {
            bail!("device does not support {:?} sparse buffers", residency);
        }
        Ok(())
    }

    /// Driver buffer. Unbound non-sparse buffers ask their subscribers for
    /// memory first.
    pub fn get_buffer(&self) -> vk::Buffer {
        let _guard = self.mt_lock.lock();
        if let BufferCreateMode::NoAllocChild { parent, .. } = &self.create_info.mode {
            return parent.get_buffer();
        }
        self.request_memory();
        self.handle
    }

    /// Memory backing a non-sparse buffer, requesting it first if needed.
    pub fn get_memory_block(&self) -> Result<Arc<MemoryBlock>> {
        let _guard = self.mt_lock.lock();

        if let BufferCreateMode::NoAllocChild { parent, offset } = &self.create_info.mode {
            if let BufferMemory::Bound(block) = &*self.memory.lock() {
                return Ok(Arc::clone(block));
            }
            let parent_block = parent.get_memory_block()?;
            let block = MemoryBlock::create_derived(&parent_block, *offset, self.create_info.size)?;
            *self.memory.lock() = BufferMemory::Bound(Arc::clone(&block));
            return Ok(block);
        }

        self.request_memory();
        match &*self.memory.lock() {
            BufferMemory::Bound(block) => Ok(Arc::clone(block)),
            BufferMemory::Unbound => Err(AnvilError::MemoryNotBound("buffer").into()),
            BufferMemory::Sparse(_) => bail!(
                "sparse buffer '{}' has no single memory block",
                self.create_info.name
            ),
        }
    }

    fn request_memory(&self) {
        let unbound = matches!(*self.memory.lock(), BufferMemory::Unbound);
        if !unbound {
            return;
        }
        if let Some(me) = self.self_ref.upgrade() {
            log::trace!("Buffer '{}' needs memory", self.create_info.name);
            self.callbacks.fire(&MemoryEvent::MemoryBlockNeeded {
                resource: MemoryResource::Buffer(me),
            });
        }
    }

    /// Bind `block` to a non-sparse buffer. Memory can be bound once.
    pub fn set_memory(&self, block: Arc<MemoryBlock>) -> Result<()> {
        let _guard = self.mt_lock.lock();
        let mut memory = self.memory.lock();
        match &*memory {
            BufferMemory::Unbound => {}
            BufferMemory::Bound(_) => return Err(AnvilError::MemoryAlreadyBound("buffer").into()),
            BufferMemory::Sparse(_) => bail!(
                "sparse buffer '{}' is bound through sparse bind batches",
                self.create_info.name
            ),
        }
        if matches!(self.create_info.mode, BufferCreateMode::NoAllocChild { .. }) {
            bail!("child buffer '{}' shares its parent's memory", self.create_info.name);
        }
        if block.device_id() != self.create_info.device.id() {
            bail!("memory block belongs to another device");
        }
        if block.size() < self.requirements.size
            || block.start_offset() % self.requirements.alignment.max(1) != 0
        {
            bail!(
                "memory block ({} bytes at {}) does not satisfy buffer '{}' ({} bytes, alignment {})",
                block.size(),
                block.start_offset(),
                self.create_info.name,
                self.requirements.size,
                self.requirements.alignment
            );
        }

        self.create_info
            .device
            .driver()
            .bind_buffer_memory(self.handle, block.memory(), block.start_offset())
            .map_err(AnvilError::Driver)
            .with_context(|| format!("Failed to bind memory to buffer '{}'", self.create_info.name))?;

        *memory = BufferMemory::Bound(block);
        Ok(())
    }

    /// Ask subscribers whether an allocation for this buffer is still
    /// queued; they flush it before answering yes.
    pub fn is_alloc_pending(&self) -> bool {
        let Some(me) = self.self_ref.upgrade() else {
            return false;
        };
        let event = MemoryEvent::IsAllocPending {
            resource: MemoryResource::Buffer(me),
            pending: Cell::new(false),
        };
        self.callbacks.fire(&event);
        match event {
            MemoryEvent::IsAllocPending { pending, .. } => pending.get(),
            MemoryEvent::MemoryBlockNeeded { .. } => false,
        }
    }

    pub fn subscribe<F>(&self, id: MemoryCallbackId, handler: F) -> SubscriptionToken
    where
        F: Fn(&MemoryEvent) + Send + Sync + 'static,
    {
        self.callbacks.register(id, handler)
    }

    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        self.callbacks.unregister(token)
    }

    pub(crate) fn validate_sparse_update(&self, offset: vk::DeviceSize, size: vk::DeviceSize) -> Result<()> {
        match &*self.memory.lock() {
            BufferMemory::Sparse(tracker) => tracker
                .validate(offset, size)
                .map_err(|e| AnvilError::InvalidSparseRegion(format!("{:#}", e)).into()),
            _ => bail!("buffer '{}' is not sparse", self.create_info.name),
        }
    }

    pub(crate) fn apply_sparse_update(
        &self,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
        binding: Option<SparseBinding>,
    ) -> Result<()> {
        let _guard = self.mt_lock.lock();
        match &mut *self.memory.lock() {
            BufferMemory::Sparse(tracker) => tracker.update(offset, size, binding),
            _ => bail!("buffer '{}' is not sparse", self.create_info.name),
        }
    }

    /// Every byte of the range is backed by memory.
    pub fn is_range_bound(&self, offset: vk::DeviceSize, size: vk::DeviceSize) -> bool {
        match &*self.memory.lock() {
            BufferMemory::Unbound => false,
            BufferMemory::Bound(_) => offset.saturating_add(size) <= self.create_info.size,
            BufferMemory::Sparse(tracker) => tracker.is_bound(offset, size),
        }
    }

    /// Bound page ranges of a sparse buffer; empty for other buffers.
    pub fn sparse_bound_ranges(&self) -> Vec<BoundRange> {
        match &*self.memory.lock() {
            BufferMemory::Sparse(tracker) => tracker.bound_ranges(),
            _ => Vec::new(),
        }
    }

    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }

    pub fn create_info(&self) -> &BufferCreateInfo {
        &self.create_info
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.create_info.device
    }

    pub fn name(&self) -> &str {
        &self.create_info.name
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.create_info.size
    }

    /// Offset inside the driver buffer; non-zero for child buffers only.
    pub fn start_offset(&self) -> vk::DeviceSize {
        match &self.create_info.mode {
            BufferCreateMode::NoAllocChild { parent, offset } => parent.start_offset() + offset,
            _ => 0,
        }
    }

    pub fn parent(&self) -> Option<&Arc<Buffer>> {
        match &self.create_info.mode {
            BufferCreateMode::NoAllocChild { parent, .. } => Some(parent),
            _ => None,
        }
    }

    pub fn memory_requirements(&self) -> vk::MemoryRequirements {
        self.requirements
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self.create_info.mode, BufferCreateMode::SparseNoAlloc { .. })
    }

    pub fn is_memory_bound(&self) -> bool {
        !matches!(*self.memory.lock(), BufferMemory::Unbound)
    }

    pub fn is_mt_safe(&self) -> bool {
        self.mt_lock.is_mt_safe()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if self.parent().is_none() {
            self.create_info.device.driver().destroy_buffer(self.handle);
        }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("name", &self.create_info.name)
            .field("handle", &self.handle)
            .field("size", &self.create_info.size)
            .field("sparse", &self.is_sparse())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::device::DeviceCreateInfo;
    use crate::backend::null_driver::{NullBackend, NullDriver};
    use crate::backend::registry::ObjectRegistry;
    use std::sync::atomic::{AtomicUsize, Ordering};

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

    fn block_for(buffer: &Buffer) -> Arc<MemoryBlock> {
        MemoryBlock::create(
            buffer.device(),
            buffer.name(),
            buffer.memory_requirements(),
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            true,
        )
        .unwrap()
    }

    #[test]
    fn create_alloc_binds_immediately() {
        let (device, driver) = device();
        let buffer = Buffer::create(BufferCreateInfo::create_alloc(
            &device,
            "vertices",
            1000,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        ))
        .unwrap();

        assert!(buffer.is_memory_bound());
        assert_eq!(buffer.get_memory_block().unwrap().size(), 1024);
        assert_eq!(driver.journal().buffer_binds.len(), 1);
    }

    #[test]
    fn memory_can_only_be_bound_once() {
        let (device, _) = device();
        let buffer = Buffer::create(BufferCreateInfo::create_nonsparse_no_alloc(
            &device,
            "staging",
            256,
            vk::BufferUsageFlags::TRANSFER_SRC,
        ))
        .unwrap();

        let err = buffer.get_memory_block().unwrap_err();
        assert_eq!(
            err.downcast_ref::<AnvilError>(),
            Some(&AnvilError::MemoryNotBound("buffer"))
        );

        buffer.set_memory(block_for(&buffer)).unwrap();
        let err = buffer.set_memory(block_for(&buffer)).unwrap_err();
        assert_eq!(
            err.downcast_ref::<AnvilError>(),
            Some(&AnvilError::MemoryAlreadyBound("buffer"))
        );
    }

    #[test]
    fn child_buffer_pulls_memory_through_its_parent() {
        let (device, _) = device();
        let parent = Buffer::create(BufferCreateInfo::create_nonsparse_no_alloc(
            &device,
            "arena",
            4096,
            vk::BufferUsageFlags::STORAGE_BUFFER,
        ))
        .unwrap();

        let requests = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&requests);
        parent.subscribe(MemoryCallbackId::MemoryBlockNeeded, move |event| {
            if let MemoryEvent::MemoryBlockNeeded {
                resource: MemoryResource::Buffer(buffer),
            } = event
            {
                seen.fetch_add(1, Ordering::SeqCst);
                buffer.set_memory(block_for(buffer)).unwrap();
            }
        });

        let child = Buffer::create(BufferCreateInfo::create_nonsparse_no_alloc_child(&parent, 1024, 512)).unwrap();
        assert_eq!(child.get_buffer(), parent.handle());
        assert_eq!(child.start_offset(), 1024);

        let block = child.get_memory_block().unwrap();
        assert_eq!(block.size(), 512);
        assert_eq!(block.start_offset(), parent.get_memory_block().unwrap().start_offset() + 1024);
        assert_eq!(requests.load(Ordering::SeqCst), 1);

        assert!(Buffer::create(BufferCreateInfo::create_nonsparse_no_alloc_child(&parent, 4000, 512)).is_err());
    }

    #[test]
    fn sparse_updates_are_validated_against_the_page_size() {
        let (device, _) = device();
        let buffer = Buffer::create(BufferCreateInfo::create_sparse_no_alloc(
            &device,
            "sparse",
            4 * 65536,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            SparseBufferResidency::Resident,
        ))
        .unwrap();

        assert!(buffer.validate_sparse_update(0, 65536).is_ok());
        assert!(matches!(
            buffer.validate_sparse_update(100, 65536).unwrap_err().downcast_ref::<AnvilError>(),
            Some(AnvilError::InvalidSparseRegion(_))
        ));
        assert!(buffer.set_memory(block_for(&buffer)).is_err());
        assert!(!buffer.is_range_bound(0, 65536));
    }
}
