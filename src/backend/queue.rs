// Queues
//
// Every submission to a queue happens under its submission lock, so
// wrappers on different threads can share a queue. Device::wait_idle takes
// all of them at once.

use anyhow::{bail, Context, Result};
use ash::vk;
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::{Arc, OnceLock};

use super::device::{CommandPool, DeviceContext, PlannedQueue, QueueFamilyType};
use super::driver::LayoutTransitionDesc;
use super::object::ObjectKind;
use super::registry::Registration;
use super::sparse::SparseMemoryBindingUpdateInfo;
use crate::AnvilError;

pub struct Queue {
    handle: vk::Queue,
    family_type: QueueFamilyType,
    family_index: u32,
    queue_index: u32,
    family_flags: vk::QueueFlags,
    create_flags: vk::DeviceQueueCreateFlags,
    submissions: Mutex<()>,
    context: Arc<DeviceContext>,
    registration: OnceLock<Registration>,
}

impl Queue {
    pub(crate) fn new(context: &Arc<DeviceContext>, planned: &PlannedQueue, family_flags: vk::QueueFlags) -> Arc<Self> {
        let handle = context
            .driver()
            .get_device_queue(planned.family_index, planned.queue_index, planned.flags);

        let queue = Arc::new(Self {
            handle,
            family_type: planned.family_type,
            family_index: planned.family_index,
            queue_index: planned.queue_index,
            family_flags,
            create_flags: planned.flags,
            submissions: Mutex::new(()),
            context: Arc::clone(context),
            registration: OnceLock::new(),
        });
        Registration::attach(&queue.registration, context.registry(), ObjectKind::Queue, &queue);

        log::debug!(
            "{:?} queue {} of family {} ({:?})",
            planned.family_type,
            planned.queue_index,
            planned.family_index,
            family_flags
        );
        queue
    }

    pub fn handle(&self) -> vk::Queue {
        self.handle
    }

    pub fn family_type(&self) -> QueueFamilyType {
        self.family_type
    }

    pub fn family_index(&self) -> u32 {
        self.family_index
    }

    pub fn queue_index(&self) -> u32 {
        self.queue_index
    }

    pub fn family_flags(&self) -> vk::QueueFlags {
        self.family_flags
    }

    pub fn supports_sparse_binding(&self) -> bool {
        self.family_flags.contains(vk::QueueFlags::SPARSE_BINDING)
    }

    pub fn is_protected(&self) -> bool {
        self.create_flags.contains(vk::DeviceQueueCreateFlags::PROTECTED)
    }

    /// Held for the duration of every driver call that touches the queue.
    pub fn lock_submissions(&self) -> MutexGuard<'_, ()> {
        self.submissions.lock()
    }

    pub fn wait_idle(&self) -> Result<()> {
        let _submissions = self.lock_submissions();
        self.context
            .driver()
            .queue_wait_idle(self.handle)
            .map_err(AnvilError::Driver)?;
        Ok(())
    }

    /// Record one image barrier, submit it and wait for it.
    pub fn submit_layout_transition(&self, pool: &CommandPool, transition: &LayoutTransitionDesc) -> Result<()> {
        if pool.family_index() != self.family_index {
            bail!(
                "command pool of family {} used on a queue of family {}",
                pool.family_index(),
                self.family_index
            );
        }
        let _submissions = self.lock_submissions();
        self.context
            .driver()
            .submit_layout_transition(self.handle, pool.handle(), transition)
            .map_err(AnvilError::Driver)?;
        Ok(())
    }

    /// Submit a sparse bind update and record its bindings in the resources.
    ///
    /// Pending allocations of the touched resources are flushed before the
    /// submission. Nothing is submitted or recorded unless every region fits
    /// its resource, and nothing is recorded if the driver rejects it.
    pub fn bind_sparse_memory(&self, update: &mut SparseMemoryBindingUpdateInfo) -> Result<()> {
        if !self.supports_sparse_binding() {
            bail!(
                "queue family {} does not support sparse binding",
                self.family_index
            );
        }
        update.validate()?;
        if update.is_dirty() {
            update.bake();
        }

        for resource in update.resources() {
            if resource.is_alloc_pending() {
                log::debug!("Flushed pending allocation of '{}' before sparse bind", resource.name());
            }
        }

        let fence = update
            .fence()
            .map_or(vk::Fence::null(), |fence| fence.handle());
        {
            let _submissions = self.lock_submissions();
            self.context
                .driver()
                .queue_bind_sparse(self.handle, update.baked(), fence)
                .map_err(AnvilError::Driver)
                .context("Failed to submit sparse bind")?;
        }

        log::trace!(
            "Sparse bind of {} batches on {:?} queue {}",
            update.batch_count(),
            self.family_type,
            self.queue_index
        );
        update.apply()
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("handle", &self.handle)
            .field("family_type", &self.family_type)
            .field("family_index", &self.family_index)
            .field("queue_index", &self.queue_index)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::buffer::{Buffer, BufferCreateInfo, SparseBufferResidency};
    use crate::backend::device::{Device, DeviceCreateInfo};
    use crate::backend::memory::MemoryBlock;
    use crate::backend::null_driver::NullBackend;
    use crate::backend::registry::ObjectRegistry;
    use crate::backend::sync::Semaphore;

    const PAGE: vk::DeviceSize = 65536;

    #[test]
    fn failed_sparse_bind_leaves_trackers_untouched() {
        let backend = NullBackend::new();
        let device = Device::create(
            &backend,
            DeviceCreateInfo::default().with_registry(ObjectRegistry::new()),
        )
        .unwrap();
        let driver = backend.last_driver().unwrap();

        let buffer = Buffer::create(BufferCreateInfo::create_sparse_no_alloc(
            &device,
            "sparse",
            2 * PAGE,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            SparseBufferResidency::NonResident,
        ))
        .unwrap();
        let memory = MemoryBlock::create(
            &device,
            "pages",
            buffer.memory_requirements(),
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            true,
        )
        .unwrap();

        let signal = Semaphore::create(&device).unwrap();
        let mut update = SparseMemoryBindingUpdateInfo::new();
        let batch = update.add_bind_batch(&[], &[Arc::clone(&signal)]);
        update
            .append_buffer_memory_update(batch, &buffer, 0, 2 * PAGE, Some(&memory), 0, false)
            .unwrap();

        let queue = Arc::clone(device.sparse_binding_queues()[0]);
        driver.fail_next_sparse_bind(vk::Result::ERROR_DEVICE_LOST);
        let err = queue.bind_sparse_memory(&mut update).unwrap_err();
        assert_eq!(crate::driver_result(&err), Some(vk::Result::ERROR_DEVICE_LOST));
        assert!(!buffer.is_range_bound(0, 2 * PAGE));

        queue.bind_sparse_memory(&mut update).unwrap();
        assert!(buffer.is_range_bound(0, 2 * PAGE));
        let submits = driver.journal().sparse_submits;
        assert_eq!(submits.len(), 1);
        assert_eq!(submits[0].signal_semaphores, vec![signal.handle()]);
    }

    #[test]
    fn queues_without_sparse_support_refuse_binds() {
        let device = Device::create(
            &NullBackend::new(),
            DeviceCreateInfo::default().with_registry(ObjectRegistry::new()),
        )
        .unwrap();
        let compute = device.compute_queue(0).unwrap();
        assert!(!compute.supports_sparse_binding());
        assert!(compute
            .bind_sparse_memory(&mut SparseMemoryBindingUpdateInfo::new())
            .is_err());
    }
}
