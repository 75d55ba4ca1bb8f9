// Shader modules and the per-device shader module cache
//
// Modules are deduplicated by SPIR-V contents plus the six per-stage entry
// point names. The cache learns about new modules through the object
// registry: every module publishes itself on registration and the cache of
// the owning device files it under an xxh3 hash of its contents.
//
// The cache holds strong references, so a cached module can only go away
// when the cache itself is torn down together with its device.

use anyhow::{Context, Result};
use ash::vk;
use parking_lot::{Mutex, ReentrantMutex};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use xxhash_rust::xxh3::Xxh3;

use super::device::{Device, DeviceContext};
use super::object::{ObjectIdentity, ObjectKind};
use super::registry::{Registration, RegistryCallbackId, RegistryEvent};
use super::callback::SubscriptionToken;
use crate::AnvilError;

/// Pipeline stages a shader module can provide an entry point for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShaderStage {
    Compute,
    Fragment,
    Geometry,
    TessellationControl,
    TessellationEvaluation,
    Vertex,
}

impl ShaderStage {
    pub const ALL: [ShaderStage; 6] = [
        ShaderStage::Compute,
        ShaderStage::Fragment,
        ShaderStage::Geometry,
        ShaderStage::TessellationControl,
        ShaderStage::TessellationEvaluation,
        ShaderStage::Vertex,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn to_vk(self) -> vk::ShaderStageFlags {
        match self {
            ShaderStage::Compute => vk::ShaderStageFlags::COMPUTE,
            ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
            ShaderStage::Geometry => vk::ShaderStageFlags::GEOMETRY,
            ShaderStage::TessellationControl => vk::ShaderStageFlags::TESSELLATION_CONTROL,
            ShaderStage::TessellationEvaluation => vk::ShaderStageFlags::TESSELLATION_EVALUATION,
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
        }
    }
}

/// Convert a SPIR-V byte blob (as written by a shader compiler) to words.
pub fn spirv_from_bytes(bytes: &[u8]) -> Result<Vec<u32>> {
    ash::util::read_spv(&mut Cursor::new(bytes)).context("Invalid SPIR-V blob")
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShaderModuleCreateInfo {
    pub spirv: Vec<u32>,
    /// Indexed by `ShaderStage::index()`.
    pub entry_points: [Option<String>; 6],
}

impl ShaderModuleCreateInfo {
    pub fn new(spirv: Vec<u32>) -> Self {
        Self {
            spirv,
            entry_points: Default::default(),
        }
    }

    pub fn with_entry_point(mut self, stage: ShaderStage, name: impl Into<String>) -> Self {
        self.entry_points[stage.index()] = Some(name.into());
        self
    }

    fn content_hash(&self) -> u64 {
        let mut hasher = Xxh3::new();
        for word in &self.spirv {
            hasher.update(&word.to_le_bytes());
        }
        for name in &self.entry_points {
            match name {
                Some(name) => {
                    hasher.update(&[1]);
                    hasher.update(name.as_bytes());
                    hasher.update(&[0]);
                }
                None => hasher.update(&[0]),
            }
        }
        hasher.digest()
    }
}

pub struct ShaderModule {
    handle: vk::ShaderModule,
    create_info: ShaderModuleCreateInfo,
    context: Arc<DeviceContext>,
    registration: OnceLock<Registration>,
}

impl ShaderModule {
    /// Returns the cached module when the device has an identical one.
    pub fn create(device: &Device, create_info: ShaderModuleCreateInfo) -> Result<Arc<Self>> {
        match device.shader_module_cache() {
            Some(cache) => cache.get_or_create(create_info, |info| {
                Self::create_uncached(device.context(), info)
            }),
            None => Self::create_uncached(device.context(), create_info),
        }
    }

    fn create_uncached(
        context: &Arc<DeviceContext>,
        create_info: ShaderModuleCreateInfo,
    ) -> Result<Arc<Self>> {
        let handle = context
            .driver()
            .create_shader_module(&create_info.spirv)
            .map_err(AnvilError::Driver)
            .context("Failed to create shader module")?;

        let module = Arc::new(Self {
            handle,
            create_info,
            context: Arc::clone(context),
            registration: OnceLock::new(),
        });
        Registration::attach_published(
            &module.registration,
            context.registry(),
            ObjectKind::ShaderModule,
            &module,
        );
        Ok(module)
    }

    pub fn handle(&self) -> vk::ShaderModule {
        self.handle
    }

    pub fn create_info(&self) -> &ShaderModuleCreateInfo {
        &self.create_info
    }

    pub fn entry_point(&self, stage: ShaderStage) -> Option<&str> {
        self.create_info.entry_points[stage.index()].as_deref()
    }

    pub fn device_id(&self) -> u64 {
        self.context.id()
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        self.context.driver().destroy_shader_module(self.handle);
    }
}

impl fmt::Debug for ShaderModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShaderModule")
            .field("handle", &self.handle)
            .field("words", &self.create_info.spirv.len())
            .finish()
    }
}

// =============================================================================
// CACHE
// =============================================================================

#[derive(Default)]
struct CacheState {
    buckets: HashMap<u64, Vec<Arc<ShaderModule>>>,
}

impl CacheState {
    fn find(&self, hash: u64, info: &ShaderModuleCreateInfo) -> Option<Arc<ShaderModule>> {
        self.buckets
            .get(&hash)?
            .iter()
            .find(|m| m.create_info == *info)
            .cloned()
    }
}

pub struct ShaderModuleCache {
    device_id: u64,
    state: ReentrantMutex<RefCell<CacheState>>,
    // Identities of cached modules. Checked by the unregistration observer
    // without taking `state`.
    identities: Mutex<HashSet<ObjectIdentity>>,
    tokens: Mutex<Vec<SubscriptionToken>>,
    torn_down: AtomicBool,
    context: Arc<DeviceContext>,
}

impl ShaderModuleCache {
    pub(crate) fn new(context: &Arc<DeviceContext>) -> Arc<Self> {
        let cache = Arc::new(Self {
            device_id: context.id(),
            state: ReentrantMutex::new(RefCell::new(CacheState::default())),
            identities: Mutex::new(HashSet::new()),
            tokens: Mutex::new(Vec::new()),
            torn_down: AtomicBool::new(false),
            context: Arc::clone(context),
        });

        let registry = context.registry();
        let weak = Arc::downgrade(&cache);
        let on_registered = registry.subscribe(
            RegistryCallbackId::Registered(ObjectKind::ShaderModule),
            move |event| {
                if let Some(cache) = weak.upgrade() {
                    cache.on_module_registered(event);
                }
            },
        );
        let weak: Weak<Self> = Arc::downgrade(&cache);
        let on_unregistered = registry.subscribe(
            RegistryCallbackId::AboutToBeUnregistered(ObjectKind::ShaderModule),
            move |event| {
                if let Some(cache) = weak.upgrade() {
                    cache.on_module_about_to_be_unregistered(event);
                }
            },
        );
        cache.tokens.lock().extend([on_registered, on_unregistered]);

        log::debug!("Shader module cache enabled for device #{}", context.id());
        cache
    }

    fn on_module_registered(&self, event: &RegistryEvent) {
        let RegistryEvent::Registered {
            allocation,
            object: Some(object),
            ..
        } = event
        else {
            return;
        };
        let Ok(module) = Arc::clone(object).downcast::<ShaderModule>() else {
            return;
        };
        // Modules of other devices share the registry but not this cache.
        if module.device_id() != self.device_id || self.torn_down.load(Ordering::Acquire) {
            return;
        }

        let hash = module.create_info.content_hash();
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        if state.find(hash, &module.create_info).is_some() {
            return;
        }
        state.buckets.entry(hash).or_default().push(module);
        self.identities.lock().insert(allocation.identity);
    }

    fn on_module_about_to_be_unregistered(&self, event: &RegistryEvent) {
        let RegistryEvent::AboutToBeUnregistered { identity, .. } = event else {
            return;
        };
        if self.torn_down.load(Ordering::Acquire) {
            return;
        }
        assert!(
            !self.identities.lock().contains(identity),
            "cached shader module {:?} released while its cache is alive",
            identity
        );
    }

    /// Module identical to `info`, if one was created on this device.
    pub fn lookup(&self, info: &ShaderModuleCreateInfo) -> Option<Arc<ShaderModule>> {
        let hash = info.content_hash();
        let guard = self.state.lock();
        let state = guard.borrow();
        state.find(hash, info)
    }

    /// Lookup and, on a miss, `create` under one lock, so that concurrent
    /// callers with the same contents end up with the same module.
    pub fn get_or_create<F>(&self, info: ShaderModuleCreateInfo, create: F) -> Result<Arc<ShaderModule>>
    where
        F: FnOnce(ShaderModuleCreateInfo) -> Result<Arc<ShaderModule>>,
    {
        let hash = info.content_hash();
        let guard = self.state.lock();

        if let Some(hit) = guard.borrow().find(hash, &info) {
            log::trace!("Shader module cache hit ({:#018x})", hash);
            return Ok(hit);
        }

        // Registration re-enters through on_module_registered and inserts.
        let module = create(info)?;

        if guard.borrow().find(hash, &module.create_info).is_none() {
            if let Some(registration) = module.registration.get() {
                self.identities.lock().insert(registration.identity());
            }
            guard
                .borrow_mut()
                .buckets
                .entry(hash)
                .or_default()
                .push(Arc::clone(&module));
        }
        Ok(module)
    }

    pub fn len(&self) -> usize {
        let guard = self.state.lock();
        let state = guard.borrow();
        state.buckets.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop observing the registry and release every cached module.
    pub(crate) fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }

        for token in self.tokens.lock().drain(..) {
            self.context.registry().unsubscribe(token);
        }

        // Modules are dropped after the lock is released; their
        // unregistration must not find the cache locked.
        let released = {
            let guard = self.state.lock();
            let mut state = guard.borrow_mut();
            std::mem::take(&mut state.buckets)
        };
        self.identities.lock().clear();

        log::debug!(
            "Shader module cache of device #{} released {} modules",
            self.device_id,
            released.values().map(Vec::len).sum::<usize>()
        );
        drop(released);
    }
}

impl Drop for ShaderModuleCache {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl fmt::Debug for ShaderModuleCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShaderModuleCache")
            .field("device_id", &self.device_id)
            .finish()
    }
}
