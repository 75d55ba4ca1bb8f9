// Synchronization primitives
//
// Owned semaphore and fence wrappers. Sparse binding batches wait on and
// signal semaphores; one-shot submissions block on fences.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::{Arc, OnceLock};

use super::device::{Device, DeviceContext};
use super::object::ObjectKind;
use super::registry::Registration;
use crate::AnvilError;

pub struct Semaphore {
    handle: vk::Semaphore,
    context: Arc<DeviceContext>,
    registration: OnceLock<Registration>,
}

impl Semaphore {
    pub fn create(device: &Device) -> Result<Arc<Self>> {
        let context = Arc::clone(device.context());
        let handle = context
            .driver()
            .create_semaphore()
            .map_err(AnvilError::Driver)
            .context("Failed to create semaphore")?;

        let semaphore = Arc::new(Self {
            handle,
            context,
            registration: OnceLock::new(),
        });
        Registration::attach(
            &semaphore.registration,
            semaphore.context.registry(),
            ObjectKind::Semaphore,
            &semaphore,
        );
        Ok(semaphore)
    }

    pub fn handle(&self) -> vk::Semaphore {
        self.handle
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        self.context.driver().destroy_semaphore(self.handle);
    }
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Semaphore").field(&self.handle).finish()
    }
}

pub struct Fence {
    handle: vk::Fence,
    context: Arc<DeviceContext>,
    registration: OnceLock<Registration>,
}

impl Fence {
    pub fn create(device: &Device, signaled: bool) -> Result<Arc<Self>> {
        let context = Arc::clone(device.context());
        let handle = context
            .driver()
            .create_fence(signaled)
            .map_err(AnvilError::Driver)
            .context("Failed to create fence")?;

        let fence = Arc::new(Self {
            handle,
            context,
            registration: OnceLock::new(),
        });
        Registration::attach(
            &fence.registration,
            fence.context.registry(),
            ObjectKind::Fence,
            &fence,
        );
        Ok(fence)
    }

    pub fn handle(&self) -> vk::Fence {
        self.handle
    }

    /// Block until the fence is signaled or `timeout_ns` elapses.
    pub fn wait(&self, timeout_ns: u64) -> Result<()> {
        self.context
            .driver()
            .wait_for_fence(self.handle, timeout_ns)
            .map_err(AnvilError::Driver)?;
        Ok(())
    }

    pub fn reset(&self) -> Result<()> {
        self.context
            .driver()
            .reset_fence(self.handle)
            .map_err(AnvilError::Driver)?;
        Ok(())
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        self.context.driver().destroy_fence(self.handle);
    }
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Fence").field(&self.handle).finish()
    }
}
