// Descriptor set layouts and pipeline layouts
//
// Both are deduplicated per device. Descriptor set layouts are keyed by their
// binding list and carry a stable numeric id; pipeline layouts are keyed by
// the ordered list of those ids plus the push constant ranges. Managers keep
// weak references only: a layout lives as long as some pipeline (or the
// application) holds it.

use anyhow::{Context, Result};
use ash::vk;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock, Weak};

use super::device::DeviceContext;
use super::driver::DescriptorBindingDesc;
use super::object::ObjectKind;
use super::registry::Registration;
use crate::AnvilError;

pub struct DescriptorSetLayout {
    id: u32,
    handle: vk::DescriptorSetLayout,
    bindings: Vec<DescriptorBindingDesc>,
    context: Arc<DeviceContext>,
    registration: OnceLock<Registration>,
}

impl DescriptorSetLayout {
    /// Manager-assigned id, unique per device and never reused.
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.handle
    }

    pub fn bindings(&self) -> &[DescriptorBindingDesc] {
        &self.bindings
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        self.context
            .driver()
            .destroy_descriptor_set_layout(self.handle);
    }
}

impl fmt::Debug for DescriptorSetLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorSetLayout")
            .field("id", &self.id)
            .field("bindings", &self.bindings.len())
            .finish()
    }
}

#[derive(Default)]
struct DescriptorSetLayoutState {
    next_id: u32,
    layouts: HashMap<Vec<DescriptorBindingDesc>, Weak<DescriptorSetLayout>>,
}

pub struct DescriptorSetLayoutManager {
    state: Mutex<DescriptorSetLayoutState>,
    context: Arc<DeviceContext>,
}

impl DescriptorSetLayoutManager {
    pub(crate) fn new(context: &Arc<DeviceContext>) -> Self {
        Self {
            state: Mutex::new(DescriptorSetLayoutState::default()),
            context: Arc::clone(context),
        }
    }

    /// Layout for `bindings`, shared with every earlier request for the same
    /// binding list. Binding order does not matter.
    pub fn get_or_create(
        &self,
        mut bindings: Vec<DescriptorBindingDesc>,
    ) -> Result<Arc<DescriptorSetLayout>> {
        bindings.sort_by_key(|b| b.binding);

        let mut state = self.state.lock();
        if let Some(existing) = state.layouts.get(&bindings).and_then(Weak::upgrade) {
            return Ok(existing);
        }

        let handle = self
            .context
            .driver()
            .create_descriptor_set_layout(&bindings)
            .map_err(AnvilError::Driver)
            .context("Failed to create descriptor set layout")?;

        let id = state.next_id;
        state.next_id += 1;

        let layout = Arc::new(DescriptorSetLayout {
            id,
            handle,
            bindings: bindings.clone(),
            context: Arc::clone(&self.context),
            registration: OnceLock::new(),
        });
        Registration::attach(
            &layout.registration,
            self.context.registry(),
            ObjectKind::DescriptorSetLayout,
            &layout,
        );

        state.layouts.retain(|_, weak| weak.strong_count() > 0);
        state.layouts.insert(bindings, Arc::downgrade(&layout));
        Ok(layout)
    }
}

/// Push constant range in a hashable form.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PushConstantRange {
    pub offset: u32,
    pub size: u32,
    pub stages: vk::ShaderStageFlags,
}

impl PushConstantRange {
    pub fn new(offset: u32, size: u32, stages: vk::ShaderStageFlags) -> Self {
        Self {
            offset,
            size,
            stages,
        }
    }

    pub fn to_vk(self) -> vk::PushConstantRange {
        vk::PushConstantRange {
            stage_flags: self.stages,
            offset: self.offset,
            size: self.size,
        }
    }
}

/// Two pipelines with equal keys share one pipeline layout.
///
/// Set layout ids are kept in set-index order, not sorted: swapping two sets
/// changes which descriptors a shader sees, so it yields a different layout.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PipelineLayoutKey {
    /// Descriptor set layout ids in set-index order.
    pub set_layout_ids: Vec<u32>,
    /// Sorted by offset.
    pub push_constant_ranges: Vec<PushConstantRange>,
}

impl PipelineLayoutKey {
    pub fn new(
        set_layouts: &[Arc<DescriptorSetLayout>],
        push_constant_ranges: &[PushConstantRange],
    ) -> Self {
        let mut ranges = push_constant_ranges.to_vec();
        ranges.sort();
        Self {
            set_layout_ids: set_layouts.iter().map(|l| l.id()).collect(),
            push_constant_ranges: ranges,
        }
    }
}

pub struct PipelineLayout {
    handle: vk::PipelineLayout,
    key: PipelineLayoutKey,
    // Keeps the set layouts alive for as long as the pipeline layout.
    set_layouts: Vec<Arc<DescriptorSetLayout>>,
    context: Arc<DeviceContext>,
    registration: OnceLock<Registration>,
}

impl PipelineLayout {
    pub fn handle(&self) -> vk::PipelineLayout {
        self.handle
    }

    pub fn key(&self) -> &PipelineLayoutKey {
        &self.key
    }

    pub fn set_layouts(&self) -> &[Arc<DescriptorSetLayout>] {
        &self.set_layouts
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        self.context.driver().destroy_pipeline_layout(self.handle);
    }
}

impl fmt::Debug for PipelineLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineLayout")
            .field("handle", &self.handle)
            .field("key", &self.key)
            .finish()
    }
}

pub struct PipelineLayoutManager {
    layouts: Mutex<HashMap<PipelineLayoutKey, Weak<PipelineLayout>>>,
    context: Arc<DeviceContext>,
}

impl PipelineLayoutManager {
    pub(crate) fn new(context: &Arc<DeviceContext>) -> Self {
        Self {
            layouts: Mutex::new(HashMap::new()),
            context: Arc::clone(context),
        }
    }

    pub fn get_layout(
        &self,
        set_layouts: &[Arc<DescriptorSetLayout>],
        push_constant_ranges: &[PushConstantRange],
    ) -> Result<Arc<PipelineLayout>> {
        let key = PipelineLayoutKey::new(set_layouts, push_constant_ranges);

        let mut layouts = self.layouts.lock();
        if let Some(existing) = layouts.get(&key).and_then(Weak::upgrade) {
            return Ok(existing);
        }

        let set_layout_handles: Vec<vk::DescriptorSetLayout> =
            set_layouts.iter().map(|l| l.handle()).collect();
        let ranges: Vec<vk::PushConstantRange> =
            key.push_constant_ranges.iter().map(|r| r.to_vk()).collect();

        let handle = self
            .context
            .driver()
            .create_pipeline_layout(&set_layout_handles, &ranges)
            .map_err(AnvilError::Driver)
            .context("Failed to create pipeline layout")?;

        log::debug!(
            "Pipeline layout created: {} sets, {} push constant ranges",
            set_layouts.len(),
            ranges.len()
        );

        let layout = Arc::new(PipelineLayout {
            handle,
            key: key.clone(),
            set_layouts: set_layouts.to_vec(),
            context: Arc::clone(&self.context),
            registration: OnceLock::new(),
        });
        Registration::attach(
            &layout.registration,
            self.context.registry(),
            ObjectKind::PipelineLayout,
            &layout,
        );

        layouts.retain(|_, weak| weak.strong_count() > 0);
        layouts.insert(key, Arc::downgrade(&layout));
        Ok(layout)
    }

    /// Number of layouts currently alive.
    pub fn live_count(&self) -> usize {
        self.layouts
            .lock()
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }
}
