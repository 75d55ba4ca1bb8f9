// Pipeline managers
//
// Pipelines are not created when they are added. A manager keeps two maps:
// outstanding records (no driver handle yet) and baked ones. The first
// request for a handle, or an explicit bake(), turns every outstanding record
// into a driver pipeline in as few driver calls as possible, resolving
// derivative parents along the way.
//
// compute.rs and graphics.rs provide the per-flavor state baking; the
// bookkeeping below is shared.

pub mod cache;
pub mod compute;
pub mod graphics;

use anyhow::{Context, Result};
use ash::vk;
use parking_lot::ReentrantMutex;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::ffi::CString;
use std::fmt;
use std::sync::Arc;

use self::cache::PipelineCache;
use super::callback::{CallbackEvent, CallbackHub, SubscriptionToken};
use super::device::DeviceContext;
use super::driver::{BaseReference, ShaderStageBakeInfo, SpecializationBakeInfo};
use super::layout::{DescriptorSetLayout, PipelineLayout, PipelineLayoutManager, PushConstantRange};
use super::object::ObjectKind;
use super::registry::Registration;
use super::shader::{ShaderModule, ShaderStage};
use crate::AnvilError;

pub use self::compute::{ComputePipelineCreateInfo, ComputePipelines};
pub use self::graphics::{
    ColorBlendAttachment, GraphicsPipelineCreateInfo, GraphicsPipelines, VertexAttribute,
};

pub type ComputePipelineManager = PipelineManager<ComputePipelines>;
pub type GraphicsPipelineManager = PipelineManager<GraphicsPipelines>;

/// Identifies a pipeline within one manager. Ids are handed out in
/// increasing order and never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PipelineId(pub u32);

#[derive(Clone, Debug)]
pub struct SpecializationConstant {
    pub constant_id: u32,
    pub data: Vec<u8>,
}

/// One shader stage of a pipeline.
#[derive(Clone, Debug)]
pub struct ShaderStageInfo {
    pub stage: ShaderStage,
    pub module: Arc<ShaderModule>,
    pub entry_point: String,
    pub specialization_constants: Vec<SpecializationConstant>,
}

impl ShaderStageInfo {
    pub fn new(stage: ShaderStage, module: Arc<ShaderModule>, entry_point: impl Into<String>) -> Self {
        Self {
            stage,
            module,
            entry_point: entry_point.into(),
            specialization_constants: Vec::new(),
        }
    }

    pub fn with_specialization_constant(mut self, constant_id: u32, data: &[u8]) -> Self {
        self.specialization_constants.push(SpecializationConstant {
            constant_id,
            data: data.to_vec(),
        });
        self
    }

    /// Flatten into the driver form. Map entries index into one data blob.
    pub(crate) fn bake(&self) -> Result<ShaderStageBakeInfo> {
        let entry_point = CString::new(self.entry_point.as_str())
            .with_context(|| format!("Entry point {:?} contains a NUL byte", self.entry_point))?;

        let specialization = (!self.specialization_constants.is_empty()).then(|| {
            let mut baked = SpecializationBakeInfo::default();
            for constant in &self.specialization_constants {
                baked.map_entries.push(vk::SpecializationMapEntry {
                    constant_id: constant.constant_id,
                    offset: baked.data.len() as u32,
                    size: constant.data.len(),
                });
                baked.data.extend_from_slice(&constant.data);
            }
            baked
        });

        Ok(ShaderStageBakeInfo {
            stage: self.stage.to_vk(),
            module: self.module.handle(),
            entry_point,
            specialization,
        })
    }
}

/// State every pipeline flavor carries.
#[derive(Clone, Debug, Default)]
pub struct PipelineCommonInfo {
    pub flags: vk::PipelineCreateFlags,
    pub allow_derivatives: bool,
    pub base_pipeline: Option<PipelineId>,
    /// Proxies never reach the driver. They exist to be derived from.
    pub proxy: bool,
    pub set_layouts: Vec<Arc<DescriptorSetLayout>>,
    pub push_constant_ranges: Vec<PushConstantRange>,
    pub stages: Vec<ShaderStageInfo>,
}

impl PipelineCommonInfo {
    pub fn stage(&self, stage: ShaderStage) -> Option<&ShaderStageInfo> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    pub(crate) fn bake_stages(&self) -> Result<Vec<ShaderStageBakeInfo>> {
        self.stages.iter().map(ShaderStageInfo::bake).collect()
    }

    /// Flags for the driver: user flags plus the derivative bits.
    pub(crate) fn create_flags(&self, base: &BatchBase) -> vk::PipelineCreateFlags {
        let mut flags = self.flags;
        if self.allow_derivatives {
            flags |= vk::PipelineCreateFlags::ALLOW_DERIVATIVES;
        }
        if !matches!(base, BatchBase::None) {
            flags |= vk::PipelineCreateFlags::DERIVATIVE;
        }
        flags
    }
}

/// Where the parent of a pipeline in a bake batch lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchBase {
    None,
    /// Position of the parent in the same batch.
    InBatch(usize),
    Baked(vk::Pipeline),
}

/// One pipeline in a bake batch, in insertion order.
pub struct BatchEntry<'a, C> {
    pub id: PipelineId,
    pub info: &'a C,
    pub layout: &'a Arc<PipelineLayout>,
    pub base: BatchBase,
}

/// A driver pipeline and the parent reference it was created with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CreatedPipeline {
    pub handle: vk::Pipeline,
    pub base: BaseReference,
}

/// A pipeline flavor: how its create info looks and how a batch of them
/// reaches the driver.
pub trait PipelineKind: Send + Sync + 'static {
    type CreateInfo: Clone + Send + Sync + 'static;

    const OBJECT_KIND: ObjectKind;

    fn common(info: &Self::CreateInfo) -> &PipelineCommonInfo;

    fn common_mut(info: &mut Self::CreateInfo) -> &mut PipelineCommonInfo;

    /// Create driver pipelines for `batch`, returned in batch order. Either
    /// every pipeline is created or none survives.
    fn create_pipelines(
        context: &DeviceContext,
        cache: &PipelineCache,
        batch: &[BatchEntry<'_, Self::CreateInfo>],
    ) -> Result<Vec<CreatedPipeline>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineCallbackId {
    NewPipelineCreated,
}

pub enum PipelineEvent {
    NewPipelineCreated { id: PipelineId },
}

impl CallbackEvent for PipelineEvent {
    type Id = PipelineCallbackId;

    fn id(&self) -> PipelineCallbackId {
        match self {
            PipelineEvent::NewPipelineCreated { .. } => PipelineCallbackId::NewPipelineCreated,
        }
    }
}

struct PipelineRecord<C> {
    info: Arc<C>,
    layout: Option<Arc<PipelineLayout>>,
    handle: Option<vk::Pipeline>,
    base: BaseReference,
    _registration: Registration,
}

struct ManagerState<C> {
    next_id: u32,
    outstanding: BTreeMap<PipelineId, PipelineRecord<C>>,
    baked: BTreeMap<PipelineId, PipelineRecord<C>>,
}

impl<C> ManagerState<C> {
    fn record(&self, id: PipelineId) -> Option<&PipelineRecord<C>> {
        self.outstanding.get(&id).or_else(|| self.baked.get(&id))
    }
}

/// Owned copy of one batch entry, taken so no state borrow is held while
/// the driver runs.
struct PendingBake<C> {
    id: PipelineId,
    info: Arc<C>,
    layout: Arc<PipelineLayout>,
    base: BatchBase,
}

/// Holds a re-entrant lock across every public entry point. Registry and
/// pipeline callbacks fire while it is held, so observers may call back
/// into the manager; `RefCell` borrows never outlive a single step.
pub struct PipelineManager<K: PipelineKind> {
    state: ReentrantMutex<RefCell<ManagerState<K::CreateInfo>>>,
    callbacks: CallbackHub<PipelineEvent>,
    layouts: Arc<PipelineLayoutManager>,
    cache: Arc<PipelineCache>,
    context: Arc<DeviceContext>,
}

impl<K: PipelineKind> PipelineManager<K> {
    pub(crate) fn new(
        context: &Arc<DeviceContext>,
        layouts: Arc<PipelineLayoutManager>,
        cache: Arc<PipelineCache>,
    ) -> Self {
        Self {
            state: ReentrantMutex::new(RefCell::new(ManagerState {
                next_id: 0,
                outstanding: BTreeMap::new(),
                baked: BTreeMap::new(),
            })),
            callbacks: CallbackHub::new(),
            layouts,
            cache,
            context: Arc::clone(context),
        }
    }

    /// Queue a pipeline for baking. Proxies are recorded as baked right away
    /// and never get a driver handle.
    pub fn add(&self, info: K::CreateInfo) -> PipelineId {
        let guard = self.state.lock();
        let info = Arc::new(info);
        let proxy = K::common(&info).proxy;
        let registration = Registration::new(self.context.registry(), K::OBJECT_KIND, &info, false);

        let id = {
            let mut state = guard.borrow_mut();
            let id = PipelineId(state.next_id);
            state.next_id += 1;

            let record = PipelineRecord {
                info,
                layout: None,
                handle: None,
                base: BaseReference::None,
                _registration: registration,
            };
            if proxy {
                state.baked.insert(id, record);
            } else {
                state.outstanding.insert(id, record);
            }
            id
        };

        log::trace!("{} {:?} added{}", K::OBJECT_KIND, id, if proxy { " (proxy)" } else { "" });
        self.callbacks
            .fire(&PipelineEvent::NewPipelineCreated { id });
        id
    }

    /// Copy of the create info of `parent`, set up to derive from it.
    pub fn derive_create_info(&self, parent: PipelineId) -> Result<K::CreateInfo> {
        let guard = self.state.lock();
        let parent_info = guard
            .borrow()
            .record(parent)
            .map(|r| Arc::clone(&r.info))
            .ok_or(AnvilError::UnknownPipeline(parent))?;

        let mut info = (*parent_info).clone();
        let common = K::common_mut(&mut info);
        common.base_pipeline = Some(parent);
        common.proxy = false;
        common.allow_derivatives = false;
        Ok(info)
    }

    /// Forget `id`, destroying its driver pipeline if it was baked.
    pub fn delete(&self, id: PipelineId) -> bool {
        let guard = self.state.lock();
        let record = {
            let mut state = guard.borrow_mut();
            match state.outstanding.remove(&id) {
                Some(record) => Some(record),
                None => state.baked.remove(&id),
            }
        };

        // Dropping the record unregisters it, which may re-enter the manager.
        match record {
            Some(record) => {
                if let Some(handle) = record.handle {
                    self.context.driver().destroy_pipeline(handle);
                }
                drop(record);
                true
            }
            None => false,
        }
    }

    /// Driver handle of `id`, baking every outstanding pipeline first if
    /// `id` is one of them.
    pub fn get_pipeline_handle(&self, id: PipelineId) -> Result<vk::Pipeline> {
        let guard = self.state.lock();
        let pending = guard.borrow().outstanding.contains_key(&id);
        if pending {
            self.bake()?;
        }

        let state = guard.borrow();
        let record = state.baked.get(&id).ok_or(AnvilError::UnknownPipeline(id))?;
        match record.handle {
            Some(handle) => Ok(handle),
            None => Err(AnvilError::ProxyPipeline(id).into()),
        }
    }

    /// Pipeline layout of `id`, baking first if no layout was acquired yet.
    pub fn get_layout(&self, id: PipelineId) -> Result<Arc<PipelineLayout>> {
        let guard = self.state.lock();
        let baked_info = {
            let state = guard.borrow();
            match state.baked.get(&id) {
                Some(record) => match &record.layout {
                    Some(layout) => return Ok(Arc::clone(layout)),
                    None => Some(Arc::clone(&record.info)),
                },
                None if state.outstanding.contains_key(&id) => None,
                None => return Err(AnvilError::UnknownPipeline(id).into()),
            }
        };

        // Proxies are baked without ever acquiring a layout.
        if let Some(info) = baked_info {
            let layout = self.acquire_layout(&info)?;
            if let Some(record) = guard.borrow_mut().baked.get_mut(&id) {
                record.layout.get_or_insert_with(|| Arc::clone(&layout));
            }
            return Ok(layout);
        }

        self.bake()?;
        let state = guard.borrow();
        state
            .baked
            .get(&id)
            .and_then(|r| r.layout.clone())
            .ok_or_else(|| AnvilError::UnknownPipeline(id).into())
    }

    pub fn create_info(&self, id: PipelineId) -> Option<Arc<K::CreateInfo>> {
        let guard = self.state.lock();
        let state = guard.borrow();
        state.record(id).map(|r| Arc::clone(&r.info))
    }

    /// Parent of `id` as handed to the driver at bake time. `Index` is the
    /// position within the driver call that created `id`. `None` until baked.
    pub fn base_reference(&self, id: PipelineId) -> Option<BaseReference> {
        let guard = self.state.lock();
        let state = guard.borrow();
        state
            .baked
            .get(&id)
            .filter(|r| r.handle.is_some())
            .map(|r| r.base)
    }

    pub fn is_baked(&self, id: PipelineId) -> bool {
        self.state.lock().borrow().baked.contains_key(&id)
    }

    pub fn is_proxy(&self, id: PipelineId) -> bool {
        let guard = self.state.lock();
        let state = guard.borrow();
        state
            .baked
            .get(&id)
            .map_or(false, |r| K::common(&r.info).proxy)
    }

    pub fn outstanding_count(&self) -> usize {
        self.state.lock().borrow().outstanding.len()
    }

    pub fn baked_count(&self) -> usize {
        self.state.lock().borrow().baked.len()
    }

    pub fn subscribe<F>(&self, id: PipelineCallbackId, handler: F) -> SubscriptionToken
    where
        F: Fn(&PipelineEvent) + Send + Sync + 'static,
    {
        self.callbacks.register(id, handler)
    }

    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        self.callbacks.unregister(token)
    }

    /// Turn every outstanding pipeline into a driver pipeline.
    ///
    /// On failure nothing moves: the outstanding set is left as it was (bar
    /// any layouts acquired on the way) and the call may be retried.
    pub fn bake(&self) -> Result<()> {
        let guard = self.state.lock();

        // Layout acquisition may register objects and re-enter; loop until
        // every outstanding record, including ones added meanwhile, has one.
        loop {
            let missing = guard
                .borrow()
                .outstanding
                .iter()
                .find(|(_, r)| r.layout.is_none())
                .map(|(id, r)| (*id, Arc::clone(&r.info)));
            let Some((id, info)) = missing else { break };

            let layout = self.acquire_layout(&info)?;
            if let Some(record) = guard.borrow_mut().outstanding.get_mut(&id) {
                record.layout.get_or_insert(layout);
            }
        }

        let pending = {
            let state = guard.borrow();
            if state.outstanding.is_empty() {
                return Ok(());
            }
            let ids: Vec<PipelineId> = state.outstanding.keys().copied().collect();
            let bases = Self::resolve_bases(&state, &ids)?;

            let mut pending = Vec::with_capacity(ids.len());
            for (id, base) in ids.into_iter().zip(bases) {
                let record = &state.outstanding[&id];
                let layout = record.layout.clone().ok_or(AnvilError::UnknownPipeline(id))?;
                pending.push(PendingBake {
                    id,
                    info: Arc::clone(&record.info),
                    layout,
                    base,
                });
            }
            pending
        };

        let batch: Vec<BatchEntry<'_, K::CreateInfo>> = pending
            .iter()
            .map(|p| BatchEntry {
                id: p.id,
                info: p.info.as_ref(),
                layout: &p.layout,
                base: p.base,
            })
            .collect();

        let created = match K::create_pipelines(&self.context, &self.cache, &batch) {
            Ok(created) => created,
            Err(e) => {
                log::error!(
                    "Failed to bake {} {} pipelines: {:#}",
                    batch.len(),
                    K::OBJECT_KIND,
                    e
                );
                return Err(e);
            }
        };

        {
            let mut state = guard.borrow_mut();
            for (entry, created) in pending.iter().zip(created) {
                if let Some(mut record) = state.outstanding.remove(&entry.id) {
                    record.handle = Some(created.handle);
                    record.base = created.base;
                    state.baked.insert(entry.id, record);
                }
            }
        }

        log::debug!("Baked {} {} pipelines", pending.len(), K::OBJECT_KIND);
        Ok(())
    }

    fn acquire_layout(&self, info: &K::CreateInfo) -> Result<Arc<PipelineLayout>> {
        let common = K::common(info);
        self.layouts
            .get_layout(&common.set_layouts, &common.push_constant_ranges)
    }

    fn resolve_bases(
        state: &ManagerState<K::CreateInfo>,
        ids: &[PipelineId],
    ) -> Result<Vec<BatchBase>> {
        let mut bases = Vec::with_capacity(ids.len());

        for (pos, id) in ids.iter().enumerate() {
            let record = &state.outstanding[id];
            let Some(parent) = K::common(&record.info).base_pipeline else {
                bases.push(BatchBase::None);
                continue;
            };

            let resolution_error = |reason| AnvilError::DerivativeResolution {
                child: *id,
                parent,
                reason,
            };

            let (parent_record, in_batch) = if let Some(parent_pos) = ids.iter().position(|p| *p == parent) {
                if parent_pos >= pos {
                    return Err(resolution_error("parent is queued after the child").into());
                }
                (&state.outstanding[&parent], Some(parent_pos))
            } else if let Some(parent_record) = state.baked.get(&parent) {
                (parent_record, None)
            } else {
                return Err(resolution_error("parent pipeline no longer exists").into());
            };

            let parent_common = K::common(&parent_record.info);
            if parent_common.proxy {
                // Proxies only lend their state.
                bases.push(BatchBase::None);
                continue;
            }
            if !parent_common.allow_derivatives {
                return Err(resolution_error("parent does not allow derivatives").into());
            }
            let same_layout = match (&parent_record.layout, &record.layout) {
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                _ => false,
            };
            if !same_layout {
                return Err(resolution_error("parent uses a different pipeline layout").into());
            }

            bases.push(match (in_batch, parent_record.handle) {
                (Some(parent_pos), _) => BatchBase::InBatch(parent_pos),
                (None, Some(handle)) => BatchBase::Baked(handle),
                (None, None) => {
                    return Err(resolution_error("parent has no driver pipeline").into())
                }
            });
        }

        Ok(bases)
    }
}

impl<K: PipelineKind> Drop for PipelineManager<K> {
    fn drop(&mut self) {
        let state = self.state.get_mut().get_mut();
        for record in state.baked.values() {
            if let Some(handle) = record.handle {
                self.context.driver().destroy_pipeline(handle);
            }
        }
    }
}

impl<K: PipelineKind> fmt::Debug for PipelineManager<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.state.lock();
        let state = guard.borrow();
        f.debug_struct("PipelineManager")
            .field("kind", &K::OBJECT_KIND)
            .field("outstanding", &state.outstanding.len())
            .field("baked", &state.baked.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn specialization_constants_pack_into_one_blob() {
        let registry = crate::backend::registry::ObjectRegistry::new();
        let device = crate::backend::device::Device::create(
            &crate::backend::null_driver::NullBackend::new(),
            crate::backend::device::DeviceCreateInfo::default().with_registry(registry),
        )
        .unwrap();
        let module = ShaderModule::create(
            &device,
            crate::backend::shader::ShaderModuleCreateInfo::new(vec![0x0723_0203, 0, 0, 1, 0])
                .with_entry_point(ShaderStage::Compute, "main"),
        )
        .unwrap();

        let stage = ShaderStageInfo::new(ShaderStage::Compute, module, "main")
            .with_specialization_constant(3, &7u32.to_le_bytes())
            .with_specialization_constant(5, &[1u8])
            .bake()
            .unwrap();

        let specialization = stage.specialization.unwrap();
        assert_eq!(specialization.data, vec![7, 0, 0, 0, 1]);
        assert_eq!(specialization.map_entries[1].constant_id, 5);
        assert_eq!(specialization.map_entries[1].offset, 4);
        assert_eq!(specialization.map_entries[1].size, 1);
    }
}
