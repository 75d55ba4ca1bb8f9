// Pipeline cache
//
// The driver cache is not documented as re-entrant, so every call that
// touches it (pipeline creation, merge, serialization) runs under `lock`.

use anyhow::{Context, Result};
use ash::vk;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use crate::backend::device::{Device, DeviceContext};
use crate::backend::object::{MtSafety, ObjectKind};
use crate::backend::registry::Registration;
use crate::AnvilError;

pub struct PipelineCache {
    handle: vk::PipelineCache,
    lock: Mutex<()>,
    mt_safe: bool,
    context: Arc<DeviceContext>,
    registration: OnceLock<Registration>,
}

impl PipelineCache {
    /// Driver cache seeded with `initial_data`, which may be empty.
    pub fn create(
        context: &Arc<DeviceContext>,
        initial_data: &[u8],
        mt_safety: MtSafety,
    ) -> Result<Arc<Self>> {
        let handle = context
            .driver()
            .create_pipeline_cache(initial_data)
            .map_err(AnvilError::Driver)
            .context("Failed to create pipeline cache")?;

        log::debug!("Pipeline cache created ({} seed bytes)", initial_data.len());

        let cache = Arc::new(Self {
            handle,
            lock: Mutex::new(()),
            mt_safe: context.resolve_mt_safety(mt_safety),
            context: Arc::clone(context),
            registration: OnceLock::new(),
        });
        Registration::attach(
            &cache.registration,
            context.registry(),
            ObjectKind::PipelineCache,
            &cache,
        );
        Ok(cache)
    }

    /// Standalone cache on `device`, e.g. for merging into the device cache later.
    pub fn create_for(device: &Device, initial_data: &[u8]) -> Result<Arc<Self>> {
        Self::create(device.context(), initial_data, MtSafety::Inherit)
    }

    pub fn handle(&self) -> vk::PipelineCache {
        self.handle
    }

    pub fn is_mt_safe(&self) -> bool {
        self.mt_safe
    }

    /// Run `f` with exclusive access to the driver cache.
    pub(crate) fn with_handle<R>(&self, f: impl FnOnce(vk::PipelineCache) -> R) -> R {
        let _guard = self.lock.lock();
        f(self.handle)
    }

    /// Serialized cache contents.
    pub fn get_data(&self) -> Result<Vec<u8>> {
        let data = self
            .with_handle(|handle| self.context.driver().get_pipeline_cache_data(handle))
            .map_err(AnvilError::Driver)
            .context("Failed to read pipeline cache data")?;
        Ok(data)
    }

    /// Merge the contents of `sources` into this cache.
    pub fn merge(&self, sources: &[&PipelineCache]) -> Result<()> {
        let handles: Vec<vk::PipelineCache> = sources
            .iter()
            .filter(|s| !std::ptr::eq(**s, self))
            .map(|s| s.handle)
            .collect();
        if handles.is_empty() {
            return Ok(());
        }

        // Sources are read by the driver; hold their locks too.
        let _source_guards: Vec<_> = sources
            .iter()
            .filter(|s| !std::ptr::eq(**s, self))
            .map(|s| s.lock.lock())
            .collect();

        self.with_handle(|dst| self.context.driver().merge_pipeline_caches(dst, &handles))
            .map_err(AnvilError::Driver)
            .context("Failed to merge pipeline caches")?;
        Ok(())
    }

    /// Write the serialized cache to `path`.
    pub fn save_to(&self, path: &Path) -> Result<usize> {
        let data = self.get_data()?;
        std::fs::write(path, &data)
            .with_context(|| format!("Failed to write pipeline cache to {:?}", path))?;
        log::info!("Saved {} bytes of pipeline cache to {:?}", data.len(), path);
        Ok(data.len())
    }
}

impl Drop for PipelineCache {
    fn drop(&mut self) {
        self.context.driver().destroy_pipeline_cache(self.handle);
    }
}

impl std::fmt::Debug for PipelineCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PipelineCache").field(&self.handle).finish()
    }
}
