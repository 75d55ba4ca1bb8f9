// Device facade
//
// Responsibilities:
// - Queue family classification into compute / universal / transfer buckets
// - Queue create planning (global priority, protected queues)
// - Logical device creation through a Backend
// - Ownership of command pools, the pipeline cache and the layout / pipeline
//   managers, plus the optional shader module cache

use anyhow::{Context, Result};
use ash::vk;
use parking_lot::MutexGuard;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use super::driver::{Backend, DeviceCreateDesc, Driver, PhysicalDeviceDesc, QueueCreatePlan};
use super::layout::{DescriptorSetLayoutManager, PipelineLayoutManager};
use super::object::{MtSafety, ObjectKind};
use super::pipeline::cache::PipelineCache;
use super::pipeline::{ComputePipelineManager, GraphicsPipelineManager};
use super::queue::Queue;
use super::registry::{ObjectRegistry, Registration};
use super::shader::ShaderModuleCache;
use crate::config::AnvilConfig;
use crate::AnvilError;

static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(1);

pub const EXT_SWAPCHAIN: &str = "VK_KHR_swapchain";
pub const EXT_MAINTENANCE2: &str = "VK_KHR_maintenance2";
pub const EXT_VERTEX_ATTRIBUTE_DIVISOR: &str = "VK_EXT_vertex_attribute_divisor";
pub const EXT_DEPTH_CLIP_ENABLE: &str = "VK_EXT_depth_clip_enable";
pub const EXT_SAMPLE_LOCATIONS: &str = "VK_EXT_sample_locations";
pub const EXT_CONSERVATIVE_RASTERIZATION: &str = "VK_EXT_conservative_rasterization";
pub const EXT_TRANSFORM_FEEDBACK: &str = "VK_EXT_transform_feedback";
pub const EXT_RASTERIZATION_ORDER_AMD: &str = "VK_AMD_rasterization_order";
pub const EXT_GLOBAL_PRIORITY: &str = "VK_EXT_global_priority";

/// Extensions the wrappers care about, as enabled on the logical device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceExtensions {
    pub swapchain: bool,
    pub maintenance2: bool,
    pub vertex_attribute_divisor: bool,
    pub depth_clip_enable: bool,
    pub sample_locations: bool,
    pub conservative_rasterization: bool,
    pub transform_feedback: bool,
    pub rasterization_order_amd: bool,
    pub global_priority: bool,
}

impl DeviceExtensions {
    pub fn from_enabled(enabled: &[String]) -> Self {
        let has = |name: &str| enabled.iter().any(|e| e == name);
        Self {
            swapchain: has(EXT_SWAPCHAIN),
            maintenance2: has(EXT_MAINTENANCE2),
            vertex_attribute_divisor: has(EXT_VERTEX_ATTRIBUTE_DIVISOR),
            depth_clip_enable: has(EXT_DEPTH_CLIP_ENABLE),
            sample_locations: has(EXT_SAMPLE_LOCATIONS),
            conservative_rasterization: has(EXT_CONSERVATIVE_RASTERIZATION),
            transform_feedback: has(EXT_TRANSFORM_FEEDBACK),
            rasterization_order_amd: has(EXT_RASTERIZATION_ORDER_AMD),
            global_priority: has(EXT_GLOBAL_PRIORITY),
        }
    }
}

/// State shared by the device and everything it creates.
///
/// Children hold this instead of the Device itself, so that the device can
/// own caches and managers that in turn reference the driver.
pub struct DeviceContext {
    id: u64,
    driver: Arc<dyn Driver>,
    registry: Arc<ObjectRegistry>,
    mt_safe: bool,
    extensions: DeviceExtensions,
    physical_device: PhysicalDeviceDesc,
}

impl DeviceContext {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn registry(&self) -> &Arc<ObjectRegistry> {
        &self.registry
    }

    pub fn is_mt_safe(&self) -> bool {
        self.mt_safe
    }

    pub fn resolve_mt_safety(&self, requested: MtSafety) -> bool {
        requested.resolve(self.mt_safe)
    }

    pub fn extensions(&self) -> &DeviceExtensions {
        &self.extensions
    }

    pub fn physical_device(&self) -> &PhysicalDeviceDesc {
        &self.physical_device
    }

    /// First memory type allowed by `type_bits` that has all of `properties`.
    pub fn find_memory_type(&self, type_bits: u32, properties: vk::MemoryPropertyFlags) -> Option<u32> {
        let memory = &self.physical_device.memory_properties;
        (0..memory.memory_type_count).find(|&i| {
            type_bits & (1 << i) != 0
                && memory.memory_types[i as usize]
                    .property_flags
                    .contains(properties)
        })
    }
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("id", &self.id)
            .field("physical_device", &self.physical_device.name)
            .field("mt_safe", &self.mt_safe)
            .finish()
    }
}

// =============================================================================
// QUEUE FAMILIES
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueueFamilyType {
    Compute,
    Universal,
    Transfer,
}

/// Queue family indices sorted by capability. Every family lands in at most
/// one of the three typed buckets; sparse binding support is tracked
/// separately.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueFamilyBuckets {
    pub compute: Vec<u32>,
    pub universal: Vec<u32>,
    pub transfer: Vec<u32>,
    pub sparse_binding: Vec<u32>,
}

impl QueueFamilyBuckets {
    pub fn classify(families: &[vk::QueueFamilyProperties]) -> Self {
        let mut buckets = Self::default();

        for (index, family) in families.iter().enumerate() {
            let index = index as u32;
            let flags = family.queue_flags;
            if family.queue_count == 0 {
                continue;
            }

            if flags.contains(vk::QueueFlags::COMPUTE) && !flags.contains(vk::QueueFlags::GRAPHICS) {
                buckets.compute.push(index);
            } else if flags.contains(vk::QueueFlags::GRAPHICS) {
                buckets.universal.push(index);
            } else if flags.contains(vk::QueueFlags::TRANSFER) {
                buckets.transfer.push(index);
            }

            if flags.contains(vk::QueueFlags::SPARSE_BINDING) {
                buckets.sparse_binding.push(index);
            }
        }

        buckets
    }

    pub fn families(&self, family_type: QueueFamilyType) -> &[u32] {
        match family_type {
            QueueFamilyType::Compute => &self.compute,
            QueueFamilyType::Universal => &self.universal,
            QueueFamilyType::Transfer => &self.transfer,
        }
    }

    pub fn family_type(&self, family_index: u32) -> Option<QueueFamilyType> {
        [
            QueueFamilyType::Compute,
            QueueFamilyType::Universal,
            QueueFamilyType::Transfer,
        ]
        .into_iter()
        .find(|t| self.families(*t).contains(&family_index))
    }

    /// Family to serve a request of `family_type`, falling back to a more
    /// capable bucket when the dedicated one is absent.
    fn family_for(&self, family_type: QueueFamilyType) -> Option<u32> {
        let order: &[QueueFamilyType] = match family_type {
            QueueFamilyType::Universal => &[QueueFamilyType::Universal],
            QueueFamilyType::Compute => &[QueueFamilyType::Compute, QueueFamilyType::Universal],
            QueueFamilyType::Transfer => &[
                QueueFamilyType::Transfer,
                QueueFamilyType::Compute,
                QueueFamilyType::Universal,
            ],
        };
        order
            .iter()
            .find_map(|t| self.families(*t).first().copied())
    }
}

/// One queue the application wants.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QueueRequest {
    pub family_type: QueueFamilyType,
    pub priority: f32,
    /// `None` and `Some(MEDIUM)` both mean the default priority.
    pub global_priority: Option<vk::QueueGlobalPriorityEXT>,
    pub protected: bool,
}

impl QueueRequest {
    pub fn new(family_type: QueueFamilyType) -> Self {
        Self {
            family_type,
            priority: 1.0,
            global_priority: None,
            protected: false,
        }
    }

    fn non_default_priority(&self) -> Option<vk::QueueGlobalPriorityEXT> {
        self.global_priority
            .filter(|p| *p != vk::QueueGlobalPriorityEXT::MEDIUM)
    }
}

/// Where a requested queue ended up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlannedQueue {
    pub family_type: QueueFamilyType,
    pub family_index: u32,
    pub queue_index: u32,
    pub flags: vk::DeviceQueueCreateFlags,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueuePlan {
    pub create_infos: Vec<QueueCreatePlan>,
    pub queues: Vec<PlannedQueue>,
}

impl QueuePlan {
    /// Queues with a non-default global priority, and protected queues, each
    /// get a create info of their own. The rest are merged per family.
    /// Requests the families cannot hold are dropped with a warning.
    pub fn build(
        families: &[vk::QueueFamilyProperties],
        buckets: &QueueFamilyBuckets,
        requests: &[QueueRequest],
    ) -> Self {
        let mut plan = QueuePlan::default();
        let mut used: BTreeMap<u32, u32> = BTreeMap::new();
        let mut next_index: BTreeMap<(u32, u32), u32> = BTreeMap::new();
        let mut merged: BTreeMap<u32, usize> = BTreeMap::new();

        for request in requests {
            let Some(family_index) = buckets.family_for(request.family_type) else {
                log::warn!("No queue family can serve a {:?} queue", request.family_type);
                continue;
            };

            let capacity = families[family_index as usize].queue_count;
            let count = used.entry(family_index).or_insert(0);
            if *count >= capacity {
                log::warn!(
                    "Queue family {} exposes only {} queues, dropping {:?} request",
                    family_index,
                    capacity,
                    request.family_type
                );
                continue;
            }
            *count += 1;

            let flags = if request.protected {
                vk::DeviceQueueCreateFlags::PROTECTED
            } else {
                vk::DeviceQueueCreateFlags::empty()
            };
            let priority = request.non_default_priority();

            if request.protected || priority.is_some() {
                plan.create_infos.push(QueueCreatePlan {
                    family_index,
                    flags,
                    global_priority: priority,
                    priorities: vec![request.priority],
                });
            } else if let Some(&slot) = merged.get(&family_index) {
                plan.create_infos[slot].priorities.push(request.priority);
            } else {
                merged.insert(family_index, plan.create_infos.len());
                plan.create_infos.push(QueueCreatePlan {
                    family_index,
                    flags,
                    global_priority: None,
                    priorities: vec![request.priority],
                });
            }

            let index = next_index
                .entry((family_index, flags.as_raw()))
                .or_insert(0);
            plan.queues.push(PlannedQueue {
                family_type: request.family_type,
                family_index,
                queue_index: *index,
                flags,
            });
            *index += 1;
        }

        plan
    }
}

// =============================================================================
// DEVICE CREATION
// =============================================================================

pub struct DeviceCreateInfo {
    pub physical_device_index: usize,
    /// Optional extensions; unsupported ones are skipped with a warning.
    pub extensions: Vec<String>,
    pub queues: Vec<QueueRequest>,
    pub mt_safe: bool,
    pub enable_shader_module_cache: bool,
    pub pipeline_cache_data: Vec<u8>,
    /// Registry the device and its children report to. Defaults to the
    /// process-wide one.
    pub registry: Option<Arc<ObjectRegistry>>,
}

impl Default for DeviceCreateInfo {
    fn default() -> Self {
        Self {
            physical_device_index: 0,
            extensions: [
                EXT_SWAPCHAIN,
                EXT_MAINTENANCE2,
                EXT_VERTEX_ATTRIBUTE_DIVISOR,
                EXT_DEPTH_CLIP_ENABLE,
                EXT_SAMPLE_LOCATIONS,
                EXT_CONSERVATIVE_RASTERIZATION,
                EXT_TRANSFORM_FEEDBACK,
                EXT_RASTERIZATION_ORDER_AMD,
                EXT_GLOBAL_PRIORITY,
            ]
            .iter()
            .map(|e| e.to_string())
            .collect(),
            queues: vec![
                QueueRequest::new(QueueFamilyType::Universal),
                QueueRequest::new(QueueFamilyType::Compute),
                QueueRequest::new(QueueFamilyType::Transfer),
            ],
            mt_safe: true,
            enable_shader_module_cache: true,
            pipeline_cache_data: Vec::new(),
            registry: None,
        }
    }
}

impl DeviceCreateInfo {
    pub fn from_config(config: &AnvilConfig) -> Result<Self> {
        let global_priority = config.global_priority()?;
        let request = |family_type| QueueRequest {
            global_priority: Some(global_priority),
            ..QueueRequest::new(family_type)
        };

        let mut queues = Vec::new();
        for _ in 0..config.queues.universal {
            queues.push(request(QueueFamilyType::Universal));
        }
        for _ in 0..config.queues.compute {
            queues.push(request(QueueFamilyType::Compute));
        }
        for _ in 0..config.queues.transfer {
            queues.push(request(QueueFamilyType::Transfer));
        }
        if config.queues.protected_compute {
            queues.push(QueueRequest {
                protected: true,
                ..request(QueueFamilyType::Compute)
            });
        }

        let pipeline_cache_data = match &config.device.pipeline_cache_path {
            Some(path) if path.exists() => std::fs::read(path)
                .with_context(|| format!("Failed to read pipeline cache {:?}", path))?,
            _ => Vec::new(),
        };

        Ok(Self {
            physical_device_index: config.device.physical_device_index,
            queues,
            mt_safe: config.device.mt_safe,
            enable_shader_module_cache: config.device.enable_shader_module_cache,
            pipeline_cache_data,
            ..Self::default()
        })
    }

    pub fn with_registry(mut self, registry: Arc<ObjectRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }
}

/// Helper command pool for one queue family.
pub struct CommandPool {
    handle: vk::CommandPool,
    family_index: u32,
    context: Arc<DeviceContext>,
    registration: OnceLock<Registration>,
}

impl CommandPool {
    fn create(context: &Arc<DeviceContext>, family_index: u32) -> Result<Arc<Self>> {
        let handle = context
            .driver()
            .create_command_pool(family_index)
            .map_err(AnvilError::Driver)
            .with_context(|| format!("Failed to create command pool for family {}", family_index))?;

        let pool = Arc::new(Self {
            handle,
            family_index,
            context: Arc::clone(context),
            registration: OnceLock::new(),
        });
        Registration::attach(
            &pool.registration,
            context.registry(),
            ObjectKind::CommandPool,
            &pool,
        );
        Ok(pool)
    }

    pub fn handle(&self) -> vk::CommandPool {
        self.handle
    }

    pub fn family_index(&self) -> u32 {
        self.family_index
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        self.context.driver().destroy_command_pool(self.handle);
    }
}

/// Logical device and the per-device singletons hanging off it.
pub struct Device {
    // Drop order matters: pipelines before layouts before the cache.
    compute_pipelines: ComputePipelineManager,
    graphics_pipelines: GraphicsPipelineManager,
    pipeline_layouts: Arc<PipelineLayoutManager>,
    descriptor_set_layouts: DescriptorSetLayoutManager,
    shader_module_cache: Option<Arc<ShaderModuleCache>>,
    pipeline_cache: Arc<PipelineCache>,
    command_pools: BTreeMap<u32, Arc<CommandPool>>,
    queues: Vec<Arc<Queue>>,
    buckets: QueueFamilyBuckets,
    registration: OnceLock<Registration>,
    context: Arc<DeviceContext>,
}

impl Device {
    pub fn create(backend: &dyn Backend, info: DeviceCreateInfo) -> Result<Arc<Self>> {
        let physical_devices = backend
            .physical_devices()
            .context("Failed to enumerate physical devices")?;
        let physical_device = physical_devices
            .get(info.physical_device_index)
            .cloned()
            .ok_or_else(|| {
                AnvilError::InvalidConfiguration(format!(
                    "physical device {} requested but only {} present",
                    info.physical_device_index,
                    physical_devices.len()
                ))
            })?;

        log::info!(
            "Creating device on '{}' via {} backend",
            physical_device.name,
            backend.name()
        );

        let mut extensions = Vec::new();
        for name in &info.extensions {
            if physical_device.supports_extension(name) {
                extensions.push(name.clone());
            } else {
                log::warn!("{} not supported by '{}', skipping", name, physical_device.name);
            }
        }
        let enabled = DeviceExtensions::from_enabled(&extensions);

        if !enabled.global_priority {
            if let Some(request) = info.queues.iter().find(|q| q.non_default_priority().is_some()) {
                return Err(AnvilError::UnsupportedFeature {
                    feature: "queue global priority",
                    extension: EXT_GLOBAL_PRIORITY,
                })
                .with_context(|| format!("{:?} queue request", request.family_type));
            }
        }

        let buckets = QueueFamilyBuckets::classify(&physical_device.queue_families);
        log::debug!("Queue family buckets: {:?}", buckets);

        let plan = QueuePlan::build(&physical_device.queue_families, &buckets, &info.queues);
        let desc = DeviceCreateDesc {
            physical_device: physical_device.handle,
            extensions: extensions.clone(),
            features: Self::enabled_features(&physical_device.features),
            protected_memory: info.queues.iter().any(|q| q.protected),
            queues: plan.create_infos.clone(),
        };
        let driver = backend
            .create_device(&desc)
            .context("Failed to create logical device")?;

        let registry = info.registry.unwrap_or_else(ObjectRegistry::acquire);
        let context = Arc::new(DeviceContext {
            id: NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed),
            driver,
            registry,
            mt_safe: info.mt_safe,
            extensions: enabled,
            physical_device,
        });

        let mut queues = Vec::with_capacity(plan.queues.len());
        let mut command_pools = BTreeMap::new();
        for planned in &plan.queues {
            let family_flags =
                context.physical_device().queue_families[planned.family_index as usize].queue_flags;
            queues.push(Queue::new(&context, planned, family_flags));

            if !command_pools.contains_key(&planned.family_index) {
                command_pools.insert(
                    planned.family_index,
                    CommandPool::create(&context, planned.family_index)?,
                );
            }
        }

        let pipeline_cache = PipelineCache::create(&context, &info.pipeline_cache_data, MtSafety::Inherit)?;
        let descriptor_set_layouts = DescriptorSetLayoutManager::new(&context);
        let pipeline_layouts = Arc::new(PipelineLayoutManager::new(&context));
        let compute_pipelines = ComputePipelineManager::new(
            &context,
            Arc::clone(&pipeline_layouts),
            Arc::clone(&pipeline_cache),
        );
        let graphics_pipelines = GraphicsPipelineManager::new(
            &context,
            Arc::clone(&pipeline_layouts),
            Arc::clone(&pipeline_cache),
        );
        let shader_module_cache = info
            .enable_shader_module_cache
            .then(|| ShaderModuleCache::new(&context));

        let device = Arc::new(Self {
            compute_pipelines,
            graphics_pipelines,
            pipeline_layouts,
            descriptor_set_layouts,
            shader_module_cache,
            pipeline_cache,
            command_pools,
            queues,
            buckets,
            registration: OnceLock::new(),
            context,
        });
        Registration::attach(
            &device.registration,
            device.context.registry(),
            ObjectKind::Device,
            &device,
        );

        log::info!(
            "Device #{} ready: {} queues, {} command pools",
            device.id(),
            device.queues.len(),
            device.command_pools.len()
        );
        Ok(device)
    }

    /// Sparse features are switched on whenever the hardware has them.
    fn enabled_features(supported: &vk::PhysicalDeviceFeatures) -> vk::PhysicalDeviceFeatures {
        vk::PhysicalDeviceFeatures {
            sparse_binding: supported.sparse_binding,
            sparse_residency_buffer: supported.sparse_residency_buffer,
            sparse_residency_image2_d: supported.sparse_residency_image2_d,
            sparse_residency_image3_d: supported.sparse_residency_image3_d,
            sparse_residency_aliased: supported.sparse_residency_aliased,
            tessellation_shader: supported.tessellation_shader,
            geometry_shader: supported.geometry_shader,
            sample_rate_shading: supported.sample_rate_shading,
            depth_clamp: supported.depth_clamp,
            depth_bounds: supported.depth_bounds,
            fill_mode_non_solid: supported.fill_mode_non_solid,
            wide_lines: supported.wide_lines,
            ..Default::default()
        }
    }

    pub fn id(&self) -> u64 {
        self.context.id()
    }

    pub fn context(&self) -> &Arc<DeviceContext> {
        &self.context
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        self.context.driver()
    }

    pub fn registry(&self) -> &Arc<ObjectRegistry> {
        self.context.registry()
    }

    pub fn is_mt_safe(&self) -> bool {
        self.context.is_mt_safe()
    }

    pub fn extensions(&self) -> &DeviceExtensions {
        self.context.extensions()
    }

    pub fn physical_device(&self) -> &PhysicalDeviceDesc {
        self.context.physical_device()
    }

    pub fn queue_family_buckets(&self) -> &QueueFamilyBuckets {
        &self.buckets
    }

    pub fn queues(&self) -> &[Arc<Queue>] {
        &self.queues
    }

    fn queues_of(&self, family_type: QueueFamilyType) -> impl Iterator<Item = &Arc<Queue>> {
        self.queues
            .iter()
            .filter(move |q| q.family_type() == family_type)
    }

    pub fn universal_queue(&self, index: usize) -> Option<&Arc<Queue>> {
        self.queues_of(QueueFamilyType::Universal).nth(index)
    }

    pub fn compute_queue(&self, index: usize) -> Option<&Arc<Queue>> {
        self.queues_of(QueueFamilyType::Compute).nth(index)
    }

    pub fn transfer_queue(&self, index: usize) -> Option<&Arc<Queue>> {
        self.queues_of(QueueFamilyType::Transfer).nth(index)
    }

    pub fn n_queues(&self, family_type: QueueFamilyType) -> usize {
        self.queues_of(family_type).count()
    }

    /// Every created queue whose family supports sparse binding.
    pub fn sparse_binding_queues(&self) -> Vec<&Arc<Queue>> {
        self.queues
            .iter()
            .filter(|q| q.supports_sparse_binding())
            .collect()
    }

    pub fn command_pool(&self, family_index: u32) -> Option<&Arc<CommandPool>> {
        self.command_pools.get(&family_index)
    }

    pub fn pipeline_cache(&self) -> &Arc<PipelineCache> {
        &self.pipeline_cache
    }

    pub fn descriptor_set_layout_manager(&self) -> &DescriptorSetLayoutManager {
        &self.descriptor_set_layouts
    }

    pub fn pipeline_layout_manager(&self) -> &Arc<PipelineLayoutManager> {
        &self.pipeline_layouts
    }

    pub fn compute_pipeline_manager(&self) -> &ComputePipelineManager {
        &self.compute_pipelines
    }

    pub fn graphics_pipeline_manager(&self) -> &GraphicsPipelineManager {
        &self.graphics_pipelines
    }

    pub fn shader_module_cache(&self) -> Option<&Arc<ShaderModuleCache>> {
        self.shader_module_cache.as_ref()
    }

    /// Lock every queue, wait for the device, unlock in reverse order.
    pub fn wait_idle(&self) -> Result<()> {
        let mut guards: Vec<MutexGuard<'_, ()>> = Vec::with_capacity(self.queues.len());
        for queue in &self.queues {
            guards.push(queue.lock_submissions());
        }

        let result = self.context.driver().device_wait_idle();

        while let Some(guard) = guards.pop() {
            drop(guard);
        }

        result.map_err(AnvilError::Driver)?;
        Ok(())
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Err(e) = self.context.driver().device_wait_idle() {
            log::error!("Device wait idle failed during teardown: {:?}", e);
        }
        if let Some(cache) = &self.shader_module_cache {
            cache.teardown();
        }
        log::info!("Destroying device #{}", self.context.id());
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.context.id())
            .field("physical_device", &self.context.physical_device().name)
            .field("queues", &self.queues.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::null_driver::NullBackend;

    fn family(flags: vk::QueueFlags, count: u32) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: count,
            ..Default::default()
        }
    }

    #[test]
    fn classification_puts_each_family_in_one_bucket() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER, 1),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::SPARSE_BINDING, 2),
            family(vk::QueueFlags::TRANSFER, 1),
            family(vk::QueueFlags::SPARSE_BINDING, 1),
        ];
        let buckets = QueueFamilyBuckets::classify(&families);
        assert_eq!(buckets.universal, vec![0]);
        assert_eq!(buckets.compute, vec![1]);
        assert_eq!(buckets.transfer, vec![2]);
        assert_eq!(buckets.sparse_binding, vec![1, 3]);
        assert_eq!(buckets.family_type(3), None);
    }

    #[test]
    fn plan_merges_default_queues_and_splits_special_ones() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, 4),
            family(vk::QueueFlags::COMPUTE, 4),
        ];
        let buckets = QueueFamilyBuckets::classify(&families);
        let requests = [
            QueueRequest::new(QueueFamilyType::Universal),
            QueueRequest::new(QueueFamilyType::Universal),
            QueueRequest {
                global_priority: Some(vk::QueueGlobalPriorityEXT::HIGH),
                ..QueueRequest::new(QueueFamilyType::Compute)
            },
            QueueRequest {
                protected: true,
                ..QueueRequest::new(QueueFamilyType::Compute)
            },
            QueueRequest {
                global_priority: Some(vk::QueueGlobalPriorityEXT::MEDIUM),
                ..QueueRequest::new(QueueFamilyType::Compute)
            },
        ];

        let plan = QueuePlan::build(&families, &buckets, &requests);
        assert_eq!(plan.create_infos.len(), 4);
        assert_eq!(plan.create_infos[0].priorities.len(), 2);
        assert_eq!(
            plan.create_infos[1].global_priority,
            Some(vk::QueueGlobalPriorityEXT::HIGH)
        );
        assert_eq!(plan.create_infos[2].flags, vk::DeviceQueueCreateFlags::PROTECTED);
        assert_eq!(plan.create_infos[3].global_priority, None);

        let indices: Vec<_> = plan.queues.iter().map(|q| (q.family_index, q.queue_index)).collect();
        assert_eq!(indices, vec![(0, 0), (0, 1), (1, 0), (1, 0), (1, 1)]);
    }

    #[test]
    fn plan_drops_requests_beyond_family_capacity() {
        let families = [family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, 1)];
        let buckets = QueueFamilyBuckets::classify(&families);
        let requests = [
            QueueRequest::new(QueueFamilyType::Universal),
            QueueRequest::new(QueueFamilyType::Compute),
        ];
        let plan = QueuePlan::build(&families, &buckets, &requests);
        assert_eq!(plan.queues.len(), 1);
    }

    #[test]
    fn device_owns_one_pool_per_used_family() {
        let backend = NullBackend::new();
        let device = Device::create(
            &backend,
            DeviceCreateInfo::default().with_registry(ObjectRegistry::new()),
        )
        .unwrap();

        assert_eq!(device.queues().len(), 3);
        assert!(device.command_pool(0).is_some());
        assert!(device.command_pool(1).is_some());
        assert!(device.command_pool(2).is_some());
        assert_eq!(device.sparse_binding_queues().len(), 2);
        assert!(device.extensions().global_priority);

        device.wait_idle().unwrap();
        let driver = backend.last_driver().unwrap();
        assert_eq!(driver.journal().device_wait_idle_calls, 1);
    }

    #[test]
    fn non_default_priority_needs_the_extension() {
        let backend = NullBackend::new();
        let info = DeviceCreateInfo {
            extensions: Vec::new(),
            queues: vec![QueueRequest {
                global_priority: Some(vk::QueueGlobalPriorityEXT::REALTIME),
                ..QueueRequest::new(QueueFamilyType::Universal)
            }],
            ..DeviceCreateInfo::default()
        }
        .with_registry(ObjectRegistry::new());

        let err = Device::create(&backend, info).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AnvilError>(),
            Some(AnvilError::UnsupportedFeature { .. })
        ));
    }

    #[test]
    fn registry_is_clean_after_device_drop() {
        let registry = ObjectRegistry::new();
        let backend = NullBackend::new();
        let device = Device::create(
            &backend,
            DeviceCreateInfo::default().with_registry(Arc::clone(&registry)),
        )
        .unwrap();
        assert_eq!(registry.live_count(ObjectKind::Device), 1);
        drop(device);
        assert!(registry.check_for_leaks().is_empty());
    }
}
