// Memory blocks
//
// A MemoryBlock is a range of driver memory that can back a buffer, an image
// or sparse pages of either. Root blocks own their driver allocation and free
// it on drop; derived blocks are sub-ranges that keep their parent alive.
//
// Buffers and images that are created without memory announce it through
// MemoryEvent. A deferred allocator subscribes to those events and binds
// memory on demand.

use anyhow::{Context, Result};
use ash::vk;
use std::cell::Cell;
use std::sync::{Arc, OnceLock};

use super::buffer::Buffer;
use super::callback::CallbackEvent;
use super::device::{Device, DeviceContext};
use super::driver::{DriverAllocation, MemoryAllocationDesc};
use super::image::Image;
use super::object::{ObjectIdentity, ObjectKind};
use super::registry::Registration;
use crate::AnvilError;

pub struct MemoryBlock {
    allocation: DriverAllocation,
    parent: Option<Arc<MemoryBlock>>,
    context: Arc<DeviceContext>,
    registration: OnceLock<Registration>,
}

impl MemoryBlock {
    /// Allocate a fresh block satisfying `requirements` with the given memory properties.
    pub fn create(
        device: &Device,
        name: &str,
        requirements: vk::MemoryRequirements,
        properties: vk::MemoryPropertyFlags,
        linear: bool,
    ) -> Result<Arc<Self>> {
        let context = Arc::clone(device.context());
        let allocation = context
            .driver()
            .allocate_memory(&MemoryAllocationDesc {
                name: name.to_string(),
                requirements,
                properties,
                linear,
            })
            .map_err(AnvilError::Driver)
            .with_context(|| format!("Failed to allocate {} bytes for {}", requirements.size, name))?;

        log::debug!(
            "Allocated memory block '{}': {} bytes (type {})",
            name,
            allocation.size,
            allocation.memory_type_index
        );

        Ok(Self::wrap(allocation, None, context))
    }

    /// Sub-range of `parent`. `offset` is relative to the parent's start.
    pub fn create_derived(
        parent: &Arc<MemoryBlock>,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> Result<Arc<Self>> {
        let end = offset.checked_add(size);
        if size == 0 || end.map_or(true, |end| end > parent.size()) {
            anyhow::bail!(
                "derived range [{}, {}+{}) exceeds parent block of {} bytes",
                offset,
                offset,
                size,
                parent.size()
            );
        }

        let allocation = DriverAllocation {
            offset: parent.allocation.offset + offset,
            size,
            ..parent.allocation
        };

        Ok(Self::wrap(
            allocation,
            Some(Arc::clone(parent)),
            Arc::clone(&parent.context),
        ))
    }

    fn wrap(
        allocation: DriverAllocation,
        parent: Option<Arc<MemoryBlock>>,
        context: Arc<DeviceContext>,
    ) -> Arc<Self> {
        let block = Arc::new(Self {
            allocation,
            parent,
            context,
            registration: OnceLock::new(),
        });
        Registration::attach(
            &block.registration,
            block.context.registry(),
            ObjectKind::MemoryBlock,
            &block,
        );
        block
    }

    pub fn memory(&self) -> vk::DeviceMemory {
        self.allocation.memory
    }

    /// Offset of this block inside the driver memory object.
    pub fn start_offset(&self) -> vk::DeviceSize {
        self.allocation.offset
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.allocation.size
    }

    pub fn memory_type_index(&self) -> u32 {
        self.allocation.memory_type_index
    }

    pub fn parent(&self) -> Option<&Arc<MemoryBlock>> {
        self.parent.as_ref()
    }

    pub fn device_id(&self) -> u64 {
        self.context.id()
    }
}

impl Drop for MemoryBlock {
    fn drop(&mut self) {
        if self.parent.is_none() {
            self.context.driver().free_memory(&self.allocation);
        }
    }
}

impl std::fmt::Debug for MemoryBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBlock")
            .field("memory", &self.allocation.memory)
            .field("offset", &self.allocation.offset)
            .field("size", &self.allocation.size)
            .field("derived", &self.parent.is_some())
            .finish()
    }
}

/// A resource that can have memory bound to it.
#[derive(Clone, Debug)]
pub enum MemoryResource {
    Buffer(Arc<Buffer>),
    Image(Arc<Image>),
}

impl MemoryResource {
    pub fn identity(&self) -> ObjectIdentity {
        match self {
            MemoryResource::Buffer(buffer) => ObjectIdentity::of_arc(buffer),
            MemoryResource::Image(image) => ObjectIdentity::of_arc(image),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            MemoryResource::Buffer(buffer) => buffer.name(),
            MemoryResource::Image(image) => image.name(),
        }
    }

    /// Ask subscribers to flush an allocation still queued for this resource.
    pub fn is_alloc_pending(&self) -> bool {
        match self {
            MemoryResource::Buffer(buffer) => buffer.is_alloc_pending(),
            MemoryResource::Image(image) => image.is_alloc_pending(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryCallbackId {
    MemoryBlockNeeded,
    IsAllocPending,
}

pub enum MemoryEvent {
    /// The resource was used before any memory was bound. Subscribers are
    /// expected to bind memory before returning.
    MemoryBlockNeeded { resource: MemoryResource },
    /// A subscriber that still has an allocation queued for `resource` sets
    /// `pending` and flushes it.
    IsAllocPending {
        resource: MemoryResource,
        pending: Cell<bool>,
    },
}

impl CallbackEvent for MemoryEvent {
    type Id = MemoryCallbackId;

    fn id(&self) -> MemoryCallbackId {
        match self {
            MemoryEvent::MemoryBlockNeeded { .. } => MemoryCallbackId::MemoryBlockNeeded,
            MemoryEvent::IsAllocPending { .. } => MemoryCallbackId::IsAllocPending,
        }
    }
}
