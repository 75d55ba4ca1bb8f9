// Null backend - an in-process stand-in for a Vulkan implementation
//
// Hands out synthetic, monotonically increasing handles, reports plausible
// memory and sparse requirements, and keeps a journal of every call that
// matters to the wrapper core. Lets the whole crate run (and be tested)
// without a loader or a GPU.

use anyhow::Result;
use ash::prelude::VkResult;
use ash::vk;
use ash::vk::Handle;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use super::driver::*;

pub const NULL_SPARSE_PAGE_SIZE: vk::DeviceSize = 64 * 1024;
const NULL_LINEAR_ALIGNMENT: vk::DeviceSize = 256;

/// Knobs for the synthetic device.
#[derive(Clone, Debug)]
pub struct NullDriverOptions {
    pub sparse_page_size: vk::DeviceSize,
    /// Tile size reported for every sparse aspect. Defaults to 128x128x1.
    pub sparse_granularity: vk::Extent3D,
    /// Report a separate metadata aspect for sparse images.
    pub metadata_aspect: bool,
    /// Report one mip tail shared by all layers.
    pub single_miptail: bool,
}

impl Default for NullDriverOptions {
    fn default() -> Self {
        Self {
            sparse_page_size: NULL_SPARSE_PAGE_SIZE,
            sparse_granularity: vk::Extent3D {
                width: 128,
                height: 128,
                depth: 1,
            },
            metadata_aspect: false,
            single_miptail: false,
        }
    }
}

pub struct NullBackend {
    physical_devices: Vec<PhysicalDeviceDesc>,
    options: NullDriverOptions,
    drivers: Mutex<Vec<Weak<NullDriver>>>,
}

impl NullBackend {
    /// One physical device with a universal, a compute-only and a
    /// transfer-only queue family.
    pub fn new() -> Self {
        Self::with_physical_devices(vec![Self::default_physical_device()])
    }

    pub fn with_physical_devices(physical_devices: Vec<PhysicalDeviceDesc>) -> Self {
        Self {
            physical_devices,
            options: NullDriverOptions::default(),
            drivers: Mutex::new(Vec::new()),
        }
    }

    pub fn with_options(mut self, options: NullDriverOptions) -> Self {
        self.options = options;
        self
    }

    pub fn default_physical_device() -> PhysicalDeviceDesc {
        let family = |flags: vk::QueueFlags, count: u32| vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: count,
            timestamp_valid_bits: 64,
            min_image_transfer_granularity: vk::Extent3D {
                width: 1,
                height: 1,
                depth: 1,
            },
        };

        let mut memory_properties = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: 2,
            memory_heap_count: 2,
            ..Default::default()
        };
        memory_properties.memory_types[0] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            heap_index: 0,
        };
        memory_properties.memory_types[1] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
            heap_index: 1,
        };
        memory_properties.memory_heaps[0] = vk::MemoryHeap {
            size: 8 << 30,
            flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
        };
        memory_properties.memory_heaps[1] = vk::MemoryHeap {
            size: 16 << 30,
            flags: vk::MemoryHeapFlags::empty(),
        };

        let features = vk::PhysicalDeviceFeatures {
            sparse_binding: vk::TRUE,
            sparse_residency_buffer: vk::TRUE,
            sparse_residency_image2_d: vk::TRUE,
            sparse_residency_image3_d: vk::TRUE,
            sparse_residency_aliased: vk::TRUE,
            tessellation_shader: vk::TRUE,
            geometry_shader: vk::TRUE,
            sample_rate_shading: vk::TRUE,
            ..Default::default()
        };

        PhysicalDeviceDesc {
            handle: vk::PhysicalDevice::from_raw(0x1000),
            index: 0,
            name: "Anvil Null Device".to_string(),
            device_type: vk::PhysicalDeviceType::CPU,
            api_version: vk::API_VERSION_1_1,
            queue_families: vec![
                family(
                    vk::QueueFlags::GRAPHICS
                        | vk::QueueFlags::COMPUTE
                        | vk::QueueFlags::TRANSFER
                        | vk::QueueFlags::SPARSE_BINDING,
                    4,
                ),
                family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER, 2),
                family(vk::QueueFlags::TRANSFER | vk::QueueFlags::SPARSE_BINDING, 1),
            ],
            extensions: vec![
                "VK_KHR_swapchain".to_string(),
                "VK_KHR_maintenance2".to_string(),
                "VK_EXT_vertex_attribute_divisor".to_string(),
                "VK_EXT_depth_clip_enable".to_string(),
                "VK_EXT_sample_locations".to_string(),
                "VK_EXT_conservative_rasterization".to_string(),
                "VK_EXT_transform_feedback".to_string(),
                "VK_AMD_rasterization_order".to_string(),
                "VK_EXT_global_priority".to_string(),
            ],
            features,
            memory_properties,
        }
    }

    /// Most recently created driver that is still alive.
    pub fn last_driver(&self) -> Option<Arc<NullDriver>> {
        self.drivers.lock().iter().rev().find_map(Weak::upgrade)
    }
}

impl Default for NullBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for NullBackend {
    fn name(&self) -> &str {
        "null"
    }

    fn physical_devices(&self) -> Result<Vec<PhysicalDeviceDesc>> {
        Ok(self.physical_devices.clone())
    }

    fn create_device(&self, desc: &DeviceCreateDesc) -> Result<Arc<dyn Driver>> {
        let driver = Arc::new(NullDriver::new(desc.clone(), self.options.clone()));
        self.drivers.lock().push(Arc::downgrade(&driver));
        log::info!(
            "Null device created with {} queue create infos",
            desc.queues.len()
        );
        Ok(driver)
    }
}

/// Everything the null driver was asked to do, in call order.
#[derive(Clone, Debug, Default)]
pub struct NullJournal {
    pub compute_batches: Vec<Vec<ComputePipelineBakeInfo>>,
    pub graphics_batches: Vec<Vec<GraphicsPipelineBakeInfo>>,
    pub destroyed_pipelines: Vec<vk::Pipeline>,
    pub pipeline_layouts_created: usize,
    pub pipeline_layouts_destroyed: usize,
    pub shader_modules_created: usize,
    pub shader_modules_destroyed: usize,
    pub descriptor_set_layouts_created: usize,
    pub render_passes: Vec<RenderPassBakeInfo>,
    pub buffer_binds: Vec<(vk::Buffer, vk::DeviceMemory, vk::DeviceSize)>,
    pub image_binds: Vec<(vk::Image, vk::DeviceMemory, vk::DeviceSize)>,
    pub sparse_submits: Vec<SparseBindSubmitDesc>,
    pub layout_transitions: Vec<LayoutTransitionDesc>,
    pub command_pools_created: Vec<u32>,
    pub queue_wait_idle_calls: usize,
    pub device_wait_idle_calls: usize,
}

#[derive(Default)]
struct NullState {
    journal: NullJournal,
    // (driver calls still allowed to succeed, result of the failing one)
    pipeline_failure: Option<(usize, vk::Result)>,
    fail_next_sparse_bind: Option<vk::Result>,
    fail_next_layout_transition: Option<vk::Result>,
    buffers: HashMap<vk::Buffer, BufferDesc>,
    images: HashMap<vk::Image, ImageDesc>,
    pipeline_caches: HashMap<vk::PipelineCache, Vec<u8>>,
    live_allocations: HashMap<u64, DriverAllocation>,
    live_pipelines: usize,
}

pub struct NullDriver {
    desc: DeviceCreateDesc,
    options: NullDriverOptions,
    next_handle: AtomicU64,
    state: Mutex<NullState>,
}

impl NullDriver {
    fn new(desc: DeviceCreateDesc, options: NullDriverOptions) -> Self {
        Self {
            desc,
            options,
            next_handle: AtomicU64::new(1),
            state: Mutex::new(NullState::default()),
        }
    }

    fn next_raw(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn next<H: Handle>(&self) -> H {
        H::from_raw(self.next_raw())
    }

    pub fn device_desc(&self) -> &DeviceCreateDesc {
        &self.desc
    }

    pub fn journal(&self) -> NullJournal {
        self.state.lock().journal.clone()
    }

    /// Make the next compute or graphics batch fail with `result`.
    pub fn fail_next_pipeline_creation(&self, result: vk::Result) {
        self.fail_pipeline_creation_after(0, result);
    }

    /// Let `calls` pipeline batches through, then fail one with `result`.
    pub fn fail_pipeline_creation_after(&self, calls: usize, result: vk::Result) {
        self.state.lock().pipeline_failure = Some((calls, result));
    }

    pub fn fail_next_sparse_bind(&self, result: vk::Result) {
        self.state.lock().fail_next_sparse_bind = Some(result);
    }

    pub fn fail_next_layout_transition(&self, result: vk::Result) {
        self.state.lock().fail_next_layout_transition = Some(result);
    }

    pub fn live_allocation_count(&self) -> usize {
        self.state.lock().live_allocations.len()
    }

    pub fn live_pipeline_count(&self) -> usize {
        self.state.lock().live_pipelines
    }

    fn memory_type_for(&self, properties: vk::MemoryPropertyFlags) -> u32 {
        if properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            1
        } else {
            0
        }
    }

    fn sparse_aspects(format: vk::Format) -> vk::ImageAspectFlags {
        match format {
            vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
                vk::ImageAspectFlags::DEPTH
            }
            vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
            vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT => {
                vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
            }
            _ => vk::ImageAspectFlags::COLOR,
        }
    }

    /// Per-layer layout: every tiled mip, then the mip tail.
    fn sparse_layout(&self, desc: &ImageDesc) -> SparseLayout {
        let g = self.options.sparse_granularity;
        let page = self.options.sparse_page_size;
        let mut tiled_pages = 0;
        let mut first_tail_lod = desc.mip_levels;

        for mip in 0..desc.mip_levels {
            let w = (desc.extent.width >> mip).max(1);
            let h = (desc.extent.height >> mip).max(1);
            let d = (desc.extent.depth >> mip).max(1);
            if w < g.width || h < g.height || d < g.depth {
                first_tail_lod = mip;
                break;
            }
            let tiles = u64::from(w.div_ceil(g.width))
                * u64::from(h.div_ceil(g.height))
                * u64::from(d.div_ceil(g.depth));
            tiled_pages += tiles;
        }

        let tail_size = if first_tail_lod < desc.mip_levels { page } else { 0 };
        let per_layer = tiled_pages * page + tail_size;

        SparseLayout {
            tail_first_lod: first_tail_lod,
            tail_offset: tiled_pages * page,
            tail_size,
            stride: per_layer,
            total: per_layer * u64::from(desc.array_layers),
        }
    }
}

impl NullState {
    fn take_pipeline_failure(&mut self) -> Option<vk::Result> {
        match self.pipeline_failure.as_mut() {
            Some((0, result)) => {
                let result = *result;
                self.pipeline_failure = None;
                Some(result)
            }
            Some((calls, _)) => {
                *calls -= 1;
                None
            }
            None => None,
        }
    }
}

struct SparseLayout {
    tail_first_lod: u32,
    tail_offset: vk::DeviceSize,
    tail_size: vk::DeviceSize,
    stride: vk::DeviceSize,
    total: vk::DeviceSize,
}

impl std::fmt::Debug for NullDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NullDriver")
            .field("queues", &self.desc.queues.len())
            .finish()
    }
}

impl Driver for NullDriver {
    fn get_device_queue(
        &self,
        family_index: u32,
        queue_index: u32,
        flags: vk::DeviceQueueCreateFlags,
    ) -> vk::Queue {
        // Stable per (family, index, flags) so repeated lookups agree.
        let raw = 0x7000_0000
            | (u64::from(family_index) << 16)
            | (u64::from(queue_index) << 4)
            | u64::from(flags.as_raw() & 0xF);
        vk::Queue::from_raw(raw)
    }

    fn create_command_pool(&self, family_index: u32) -> VkResult<vk::CommandPool> {
        self.state
            .lock()
            .journal
            .command_pools_created
            .push(family_index);
        Ok(self.next())
    }

    fn destroy_command_pool(&self, _pool: vk::CommandPool) {}

    fn create_shader_module(&self, code: &[u32]) -> VkResult<vk::ShaderModule> {
        if code.is_empty() {
            return Err(vk::Result::ERROR_INVALID_SHADER_NV);
        }
        self.state.lock().journal.shader_modules_created += 1;
        Ok(self.next())
    }

    fn destroy_shader_module(&self, _module: vk::ShaderModule) {
        self.state.lock().journal.shader_modules_destroyed += 1;
    }

    fn create_descriptor_set_layout(
        &self,
        _bindings: &[DescriptorBindingDesc],
    ) -> VkResult<vk::DescriptorSetLayout> {
        self.state.lock().journal.descriptor_set_layouts_created += 1;
        Ok(self.next())
    }

    fn destroy_descriptor_set_layout(&self, _layout: vk::DescriptorSetLayout) {}

    fn create_pipeline_layout(
        &self,
        _set_layouts: &[vk::DescriptorSetLayout],
        _push_constant_ranges: &[vk::PushConstantRange],
    ) -> VkResult<vk::PipelineLayout> {
        self.state.lock().journal.pipeline_layouts_created += 1;
        Ok(self.next())
    }

    fn destroy_pipeline_layout(&self, _layout: vk::PipelineLayout) {
        self.state.lock().journal.pipeline_layouts_destroyed += 1;
    }

    fn create_pipeline_cache(&self, initial_data: &[u8]) -> VkResult<vk::PipelineCache> {
        let cache = self.next();
        self.state
            .lock()
            .pipeline_caches
            .insert(cache, initial_data.to_vec());
        Ok(cache)
    }

    fn get_pipeline_cache_data(&self, cache: vk::PipelineCache) -> VkResult<Vec<u8>> {
        self.state
            .lock()
            .pipeline_caches
            .get(&cache)
            .cloned()
            .ok_or(vk::Result::ERROR_UNKNOWN)
    }

    fn merge_pipeline_caches(
        &self,
        dst: vk::PipelineCache,
        src: &[vk::PipelineCache],
    ) -> VkResult<()> {
        let mut state = self.state.lock();
        let mut merged: Vec<u8> = Vec::new();
        for cache in src {
            merged.extend(
                state
                    .pipeline_caches
                    .get(cache)
                    .ok_or(vk::Result::ERROR_UNKNOWN)?,
            );
        }
        state
            .pipeline_caches
            .get_mut(&dst)
            .ok_or(vk::Result::ERROR_UNKNOWN)?
            .extend(merged);
        Ok(())
    }

    fn destroy_pipeline_cache(&self, cache: vk::PipelineCache) {
        self.state.lock().pipeline_caches.remove(&cache);
    }

    fn create_compute_pipelines(
        &self,
        _cache: vk::PipelineCache,
        infos: &[ComputePipelineBakeInfo],
    ) -> VkResult<Vec<vk::Pipeline>> {
        let mut state = self.state.lock();
        if let Some(result) = state.take_pipeline_failure() {
            return Err(result);
        }
        state.journal.compute_batches.push(infos.to_vec());
        state.live_pipelines += infos.len();
        drop(state);
        Ok(infos.iter().map(|_| self.next()).collect())
    }

    fn create_graphics_pipelines(
        &self,
        _cache: vk::PipelineCache,
        infos: &[GraphicsPipelineBakeInfo],
    ) -> VkResult<Vec<vk::Pipeline>> {
        let mut state = self.state.lock();
        if let Some(result) = state.take_pipeline_failure() {
            return Err(result);
        }
        state.journal.graphics_batches.push(infos.to_vec());
        state.live_pipelines += infos.len();
        drop(state);
        Ok(infos.iter().map(|_| self.next()).collect())
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        let mut state = self.state.lock();
        state.live_pipelines = state.live_pipelines.saturating_sub(1);
        state.journal.destroyed_pipelines.push(pipeline);
    }

    fn create_render_pass(&self, info: &RenderPassBakeInfo) -> VkResult<vk::RenderPass> {
        self.state.lock().journal.render_passes.push(info.clone());
        Ok(self.next())
    }

    fn destroy_render_pass(&self, _render_pass: vk::RenderPass) {}

    fn create_buffer(&self, desc: &BufferDesc) -> VkResult<vk::Buffer> {
        if desc.size == 0 {
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        }
        let buffer = self.next();
        self.state.lock().buffers.insert(buffer, desc.clone());
        Ok(buffer)
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        let state = self.state.lock();
        let Some(desc) = state.buffers.get(&buffer) else {
            return vk::MemoryRequirements::default();
        };
        let alignment = if desc.flags.contains(vk::BufferCreateFlags::SPARSE_BINDING) {
            self.options.sparse_page_size
        } else {
            NULL_LINEAR_ALIGNMENT
        };
        vk::MemoryRequirements {
            size: desc.size.next_multiple_of(alignment),
            alignment,
            memory_type_bits: 0b11,
        }
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        self.state.lock().buffers.remove(&buffer);
    }

    fn create_image(&self, desc: &ImageDesc) -> VkResult<vk::Image> {
        let image = self.next();
        self.state.lock().images.insert(image, desc.clone());
        Ok(image)
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        let state = self.state.lock();
        let Some(desc) = state.images.get(&image) else {
            return vk::MemoryRequirements::default();
        };

        if desc.flags.contains(vk::ImageCreateFlags::SPARSE_BINDING) {
            let layout = self.sparse_layout(desc);
            let metadata = if self.options.metadata_aspect {
                self.options.sparse_page_size
            } else {
                0
            };
            return vk::MemoryRequirements {
                size: layout.total + metadata,
                alignment: self.options.sparse_page_size,
                memory_type_bits: 0b01,
            };
        }

        let mut texels = 0u64;
        for mip in 0..desc.mip_levels {
            texels += u64::from((desc.extent.width >> mip).max(1))
                * u64::from((desc.extent.height >> mip).max(1))
                * u64::from((desc.extent.depth >> mip).max(1));
        }
        vk::MemoryRequirements {
            size: (texels * 4 * u64::from(desc.array_layers)).next_multiple_of(NULL_LINEAR_ALIGNMENT),
            alignment: NULL_LINEAR_ALIGNMENT,
            memory_type_bits: 0b11,
        }
    }

    fn image_sparse_memory_requirements(
        &self,
        image: vk::Image,
    ) -> Vec<vk::SparseImageMemoryRequirements> {
        let state = self.state.lock();
        let Some(desc) = state.images.get(&image) else {
            return Vec::new();
        };
        if !desc.flags.contains(vk::ImageCreateFlags::SPARSE_RESIDENCY) {
            return Vec::new();
        }

        let layout = self.sparse_layout(desc);
        let mut flags = vk::SparseImageFormatFlags::empty();
        if self.options.single_miptail {
            flags |= vk::SparseImageFormatFlags::SINGLE_MIPTAIL;
        }

        let mut requirements = vec![vk::SparseImageMemoryRequirements {
            format_properties: vk::SparseImageFormatProperties {
                aspect_mask: Self::sparse_aspects(desc.format),
                image_granularity: self.options.sparse_granularity,
                flags,
            },
            image_mip_tail_first_lod: layout.tail_first_lod,
            image_mip_tail_size: layout.tail_size,
            image_mip_tail_offset: layout.tail_offset,
            image_mip_tail_stride: if self.options.single_miptail {
                0
            } else {
                layout.stride
            },
        }];

        if self.options.metadata_aspect {
            requirements.push(vk::SparseImageMemoryRequirements {
                format_properties: vk::SparseImageFormatProperties {
                    aspect_mask: vk::ImageAspectFlags::METADATA,
                    image_granularity: vk::Extent3D::default(),
                    flags: vk::SparseImageFormatFlags::SINGLE_MIPTAIL,
                },
                image_mip_tail_first_lod: 0,
                image_mip_tail_size: self.options.sparse_page_size,
                image_mip_tail_offset: layout.total,
                image_mip_tail_stride: 0,
            });
        }

        requirements
    }

    fn destroy_image(&self, image: vk::Image) {
        self.state.lock().images.remove(&image);
    }

    fn allocate_memory(&self, desc: &MemoryAllocationDesc) -> VkResult<DriverAllocation> {
        if desc.requirements.size == 0 {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        let allocation = DriverAllocation {
            id: self.next_raw(),
            memory: self.next(),
            offset: 0,
            size: desc.requirements.size,
            memory_type_index: self.memory_type_for(desc.properties),
        };
        self.state
            .lock()
            .live_allocations
            .insert(allocation.id, allocation);
        Ok(allocation)
    }

    fn free_memory(&self, allocation: &DriverAllocation) {
        self.state.lock().live_allocations.remove(&allocation.id);
    }

    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()> {
        self.state
            .lock()
            .journal
            .buffer_binds
            .push((buffer, memory, offset));
        Ok(())
    }

    fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()> {
        self.state
            .lock()
            .journal
            .image_binds
            .push((image, memory, offset));
        Ok(())
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        Ok(self.next())
    }

    fn destroy_semaphore(&self, _semaphore: vk::Semaphore) {}

    fn create_fence(&self, _signaled: bool) -> VkResult<vk::Fence> {
        Ok(self.next())
    }

    fn wait_for_fence(&self, _fence: vk::Fence, _timeout_ns: u64) -> VkResult<()> {
        Ok(())
    }

    fn reset_fence(&self, _fence: vk::Fence) -> VkResult<()> {
        Ok(())
    }

    fn destroy_fence(&self, _fence: vk::Fence) {}

    fn queue_bind_sparse(
        &self,
        _queue: vk::Queue,
        submits: &[SparseBindSubmitDesc],
        _fence: vk::Fence,
    ) -> VkResult<()> {
        let mut state = self.state.lock();
        if let Some(result) = state.fail_next_sparse_bind.take() {
            return Err(result);
        }
        state.journal.sparse_submits.extend_from_slice(submits);
        Ok(())
    }

    fn submit_layout_transition(
        &self,
        _queue: vk::Queue,
        _pool: vk::CommandPool,
        transition: &LayoutTransitionDesc,
    ) -> VkResult<()> {
        let mut state = self.state.lock();
        if let Some(result) = state.fail_next_layout_transition.take() {
            return Err(result);
        }
        state.journal.layout_transitions.push(*transition);
        Ok(())
    }

    fn queue_wait_idle(&self, _queue: vk::Queue) -> VkResult<()> {
        self.state.lock().journal.queue_wait_idle_calls += 1;
        Ok(())
    }

    fn device_wait_idle(&self) -> VkResult<()> {
        self.state.lock().journal.device_wait_idle_calls += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sparse_image_desc(extent: vk::Extent3D, mips: u32, layers: u32) -> ImageDesc {
        ImageDesc {
            flags: vk::ImageCreateFlags::SPARSE_BINDING | vk::ImageCreateFlags::SPARSE_RESIDENCY,
            image_type: vk::ImageType::TYPE_2D,
            format: vk::Format::R8G8B8A8_UNORM,
            extent,
            mip_levels: mips,
            array_layers: layers,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: vk::ImageUsageFlags::SAMPLED,
            initial_layout: vk::ImageLayout::UNDEFINED,
            queue_families: Vec::new(),
        }
    }

    fn driver() -> Arc<NullDriver> {
        let backend = NullBackend::new();
        let desc = DeviceCreateDesc {
            physical_device: vk::PhysicalDevice::null(),
            extensions: Vec::new(),
            features: vk::PhysicalDeviceFeatures::default(),
            protected_memory: false,
            queues: Vec::new(),
        };
        backend.create_device(&desc).unwrap();
        backend.last_driver().unwrap()
    }

    #[test]
    fn sparse_requirements_put_tail_after_tiled_mips() {
        let driver = driver();
        let extent = vk::Extent3D {
            width: 256,
            height: 256,
            depth: 1,
        };
        let image = driver.create_image(&sparse_image_desc(extent, 9, 2)).unwrap();
        let sparse = driver.image_sparse_memory_requirements(image);

        assert_eq!(sparse.len(), 1);
        let req = sparse[0];
        // 256 -> 4 tiles, 128 -> 1 tile, 64 starts the tail.
        assert_eq!(req.image_mip_tail_first_lod, 2);
        assert_eq!(req.image_mip_tail_offset, 5 * NULL_SPARSE_PAGE_SIZE);
        assert_eq!(req.image_mip_tail_size, NULL_SPARSE_PAGE_SIZE);
        assert_eq!(req.image_mip_tail_stride, 6 * NULL_SPARSE_PAGE_SIZE);

        let memory = driver.image_memory_requirements(image);
        assert_eq!(memory.size, 12 * NULL_SPARSE_PAGE_SIZE);
        assert_eq!(memory.alignment, NULL_SPARSE_PAGE_SIZE);
    }

    #[test]
    fn injected_pipeline_failure_is_one_shot() {
        let driver = driver();
        driver.fail_next_pipeline_creation(vk::Result::ERROR_OUT_OF_HOST_MEMORY);
        assert_eq!(
            driver.create_compute_pipelines(vk::PipelineCache::null(), &[]),
            Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY)
        );
        assert!(driver
            .create_compute_pipelines(vk::PipelineCache::null(), &[])
            .is_ok());
    }

    #[test]
    fn allocations_are_tracked_until_freed() {
        let driver = driver();
        let allocation = driver
            .allocate_memory(&MemoryAllocationDesc {
                name: "test".into(),
                requirements: vk::MemoryRequirements {
                    size: 1024,
                    alignment: 256,
                    memory_type_bits: 0b11,
                },
                properties: vk::MemoryPropertyFlags::HOST_VISIBLE,
                linear: true,
            })
            .unwrap();
        assert_eq!(allocation.memory_type_index, 1);
        assert_eq!(driver.live_allocation_count(), 1);
        driver.free_memory(&allocation);
        assert_eq!(driver.live_allocation_count(), 0);
    }
}
