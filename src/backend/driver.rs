// Driver seam - the native graphics API the wrappers delegate to
//
// Backend covers instance-level work (physical devices, logical device
// creation); Driver covers one logical device. Both are object safe so a
// device can run on top of ash (AshBackend) or fully in-process
// (NullBackend) without the wrappers noticing.
//
// Pipelines cross the seam as owned "bake info" values. The managers decide
// which state blocks exist and what they contain; the driver only turns them
// into native create-info chains.

use anyhow::Result;
use ash::prelude::VkResult;
use ash::vk;
use std::ffi::CString;
use std::fmt;
use std::sync::Arc;

// =============================================================================
// INSTANCE LEVEL
// =============================================================================

/// Everything the device facade needs to know about a physical device.
#[derive(Clone, Debug)]
pub struct PhysicalDeviceDesc {
    pub handle: vk::PhysicalDevice,
    pub index: u32,
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub api_version: u32,
    pub queue_families: Vec<vk::QueueFamilyProperties>,
    pub extensions: Vec<String>,
    pub features: vk::PhysicalDeviceFeatures,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl PhysicalDeviceDesc {
    pub fn supports_extension(&self, name: &str) -> bool {
        self.extensions.iter().any(|e| e == name)
    }
}

/// One native queue create-info worth of queues.
#[derive(Clone, Debug, PartialEq)]
pub struct QueueCreatePlan {
    pub family_index: u32,
    pub flags: vk::DeviceQueueCreateFlags,
    pub global_priority: Option<vk::QueueGlobalPriorityEXT>,
    pub priorities: Vec<f32>,
}

#[derive(Clone, Debug)]
pub struct DeviceCreateDesc {
    pub physical_device: vk::PhysicalDevice,
    pub extensions: Vec<String>,
    pub features: vk::PhysicalDeviceFeatures,
    pub protected_memory: bool,
    pub queues: Vec<QueueCreatePlan>,
}

pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    fn physical_devices(&self) -> Result<Vec<PhysicalDeviceDesc>>;

    fn create_device(&self, desc: &DeviceCreateDesc) -> Result<Arc<dyn Driver>>;
}

// =============================================================================
// RESOURCE DESCRIPTIONS
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DescriptorBindingDesc {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub descriptor_count: u32,
    pub stage_flags: vk::ShaderStageFlags,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferDesc {
    pub flags: vk::BufferCreateFlags,
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    /// More than one family switches the buffer to concurrent sharing.
    pub queue_families: Vec<u32>,
}

#[derive(Clone, Debug)]
pub struct ImageDesc {
    pub flags: vk::ImageCreateFlags,
    pub image_type: vk::ImageType,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub samples: vk::SampleCountFlags,
    pub tiling: vk::ImageTiling,
    pub usage: vk::ImageUsageFlags,
    pub initial_layout: vk::ImageLayout,
    pub queue_families: Vec<u32>,
}

#[derive(Clone, Debug)]
pub struct MemoryAllocationDesc {
    pub name: String,
    pub requirements: vk::MemoryRequirements,
    pub properties: vk::MemoryPropertyFlags,
    /// Buffers and linear images; lets the allocator honour granularity rules.
    pub linear: bool,
}

/// A range of driver memory handed out by `Driver::allocate_memory`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DriverAllocation {
    pub id: u64,
    pub memory: vk::DeviceMemory,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
    pub memory_type_index: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct LayoutTransitionDesc {
    pub image: vk::Image,
    pub subresource_range: vk::ImageSubresourceRange,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
}

// =============================================================================
// PIPELINE BAKE INFOS
// =============================================================================

/// How a derivative pipeline names its parent in a batched create call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum BaseReference {
    #[default]
    None,
    /// Parent is created by the same driver call, at this position.
    Index(u32),
    /// Parent was baked earlier.
    Handle(vk::Pipeline),
}

/// Specialization constants flattened into the layout the driver expects.
#[derive(Clone, Debug, Default)]
pub struct SpecializationBakeInfo {
    pub map_entries: Vec<vk::SpecializationMapEntry>,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct ShaderStageBakeInfo {
    pub stage: vk::ShaderStageFlags,
    pub module: vk::ShaderModule,
    pub entry_point: CString,
    pub specialization: Option<SpecializationBakeInfo>,
}

#[derive(Clone, Debug)]
pub struct ComputePipelineBakeInfo {
    pub flags: vk::PipelineCreateFlags,
    pub stage: ShaderStageBakeInfo,
    pub layout: vk::PipelineLayout,
    pub base: BaseReference,
}

#[derive(Clone, Debug, Default)]
pub struct VertexInputBakeInfo {
    pub bindings: Vec<vk::VertexInputBindingDescription>,
    pub attributes: Vec<vk::VertexInputAttributeDescription>,
    /// Non-empty only when some binding uses a divisor other than 1.
    pub divisors: Vec<vk::VertexInputBindingDivisorDescriptionEXT>,
}

#[derive(Clone, Copy, Debug)]
pub struct InputAssemblyBakeInfo {
    pub topology: vk::PrimitiveTopology,
    pub primitive_restart_enable: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct TessellationBakeInfo {
    pub patch_control_points: u32,
    pub domain_origin: Option<vk::TessellationDomainOrigin>,
}

/// Viewport state. When the matching dynamic state is enabled only the
/// count is meaningful and the array is empty.
#[derive(Clone, Debug, Default)]
pub struct ViewportBakeInfo {
    pub viewport_count: u32,
    pub scissor_count: u32,
    pub viewports: Vec<vk::Viewport>,
    pub scissors: Vec<vk::Rect2D>,
}

#[derive(Clone, Copy, Debug)]
pub struct ConservativeRasterizationBakeInfo {
    pub mode: vk::ConservativeRasterizationModeEXT,
    pub extra_primitive_overestimation_size: f32,
}

#[derive(Clone, Copy, Debug)]
pub struct RasterizationBakeInfo {
    pub depth_clamp_enable: bool,
    pub rasterizer_discard_enable: bool,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_bias_enable: bool,
    pub depth_bias_constant_factor: f32,
    pub depth_bias_clamp: f32,
    pub depth_bias_slope_factor: f32,
    pub line_width: f32,
    pub rasterization_order: Option<vk::RasterizationOrderAMD>,
    pub conservative: Option<ConservativeRasterizationBakeInfo>,
    pub depth_clip_enable: Option<bool>,
    pub rasterization_stream: Option<u32>,
}

#[derive(Clone, Debug)]
pub struct SampleLocationsBakeInfo {
    pub per_pixel: vk::SampleCountFlags,
    pub grid_size: vk::Extent2D,
    pub locations: Vec<vk::SampleLocationEXT>,
}

#[derive(Clone, Debug)]
pub struct MultisampleBakeInfo {
    pub rasterization_samples: vk::SampleCountFlags,
    pub sample_shading_enable: bool,
    pub min_sample_shading: f32,
    /// None stands for the implicit all-ones mask.
    pub sample_mask: Option<u32>,
    pub alpha_to_coverage_enable: bool,
    pub alpha_to_one_enable: bool,
    pub sample_locations: Option<SampleLocationsBakeInfo>,
}

#[derive(Clone, Copy, Debug)]
pub struct DepthStencilBakeInfo {
    pub depth_test_enable: bool,
    pub depth_write_enable: bool,
    pub depth_compare_op: vk::CompareOp,
    pub depth_bounds_test_enable: bool,
    pub min_depth_bounds: f32,
    pub max_depth_bounds: f32,
    pub stencil_test_enable: bool,
    pub front: vk::StencilOpState,
    pub back: vk::StencilOpState,
}

#[derive(Clone, Debug)]
pub struct ColorBlendBakeInfo {
    pub logic_op_enable: bool,
    pub logic_op: vk::LogicOp,
    pub attachments: Vec<vk::PipelineColorBlendAttachmentState>,
    pub blend_constants: [f32; 4],
}

#[derive(Clone, Debug)]
pub struct GraphicsPipelineBakeInfo {
    pub flags: vk::PipelineCreateFlags,
    pub stages: Vec<ShaderStageBakeInfo>,
    pub vertex_input: VertexInputBakeInfo,
    pub input_assembly: InputAssemblyBakeInfo,
    pub tessellation: Option<TessellationBakeInfo>,
    pub viewport: Option<ViewportBakeInfo>,
    pub rasterization: RasterizationBakeInfo,
    pub multisample: Option<MultisampleBakeInfo>,
    pub depth_stencil: Option<DepthStencilBakeInfo>,
    pub color_blend: Option<ColorBlendBakeInfo>,
    pub dynamic_states: Option<Vec<vk::DynamicState>>,
    pub layout: vk::PipelineLayout,
    pub render_pass: vk::RenderPass,
    pub subpass: u32,
    pub base: BaseReference,
}

// =============================================================================
// RENDER PASSES AND SPARSE BINDING
// =============================================================================

#[derive(Clone, Debug, Default)]
pub struct SubpassBakeInfo {
    /// Indexed by fragment output location; gaps hold VK_ATTACHMENT_UNUSED.
    pub color_attachments: Vec<vk::AttachmentReference>,
    pub resolve_attachments: Vec<vk::AttachmentReference>,
    pub input_attachments: Vec<vk::AttachmentReference>,
    pub depth_stencil_attachment: Option<vk::AttachmentReference>,
    pub preserve_attachments: Vec<u32>,
}

#[derive(Clone, Debug, Default)]
pub struct RenderPassBakeInfo {
    pub attachments: Vec<vk::AttachmentDescription>,
    pub subpasses: Vec<SubpassBakeInfo>,
    pub dependencies: Vec<vk::SubpassDependency>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceGroupIndices {
    pub resource_device_index: u32,
    pub memory_device_index: u32,
}

/// One flattened sparse bind submission.
#[derive(Clone, Debug, Default)]
pub struct SparseBindSubmitDesc {
    pub wait_semaphores: Vec<vk::Semaphore>,
    pub signal_semaphores: Vec<vk::Semaphore>,
    pub buffer_binds: Vec<(vk::Buffer, Vec<vk::SparseMemoryBind>)>,
    pub image_opaque_binds: Vec<(vk::Image, Vec<vk::SparseMemoryBind>)>,
    pub image_binds: Vec<(vk::Image, Vec<vk::SparseImageMemoryBind>)>,
    pub device_group: Option<DeviceGroupIndices>,
}

// =============================================================================
// DEVICE LEVEL
// =============================================================================

pub trait Driver: Send + Sync + fmt::Debug {
    fn get_device_queue(
        &self,
        family_index: u32,
        queue_index: u32,
        flags: vk::DeviceQueueCreateFlags,
    ) -> vk::Queue;

    fn create_command_pool(&self, family_index: u32) -> VkResult<vk::CommandPool>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);

    fn create_shader_module(&self, code: &[u32]) -> VkResult<vk::ShaderModule>;
    fn destroy_shader_module(&self, module: vk::ShaderModule);

    fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorBindingDesc],
    ) -> VkResult<vk::DescriptorSetLayout>;
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> VkResult<vk::PipelineLayout>;
    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);

    fn create_pipeline_cache(&self, initial_data: &[u8]) -> VkResult<vk::PipelineCache>;
    fn get_pipeline_cache_data(&self, cache: vk::PipelineCache) -> VkResult<Vec<u8>>;
    fn merge_pipeline_caches(
        &self,
        dst: vk::PipelineCache,
        src: &[vk::PipelineCache],
    ) -> VkResult<()>;
    fn destroy_pipeline_cache(&self, cache: vk::PipelineCache);

    /// All-or-nothing: on failure no pipeline from the batch survives.
    fn create_compute_pipelines(
        &self,
        cache: vk::PipelineCache,
        infos: &[ComputePipelineBakeInfo],
    ) -> VkResult<Vec<vk::Pipeline>>;
    /// All-or-nothing: on failure no pipeline from the batch survives.
    fn create_graphics_pipelines(
        &self,
        cache: vk::PipelineCache,
        infos: &[GraphicsPipelineBakeInfo],
    ) -> VkResult<Vec<vk::Pipeline>>;
    fn destroy_pipeline(&self, pipeline: vk::Pipeline);

    fn create_render_pass(&self, info: &RenderPassBakeInfo) -> VkResult<vk::RenderPass>;
    fn destroy_render_pass(&self, render_pass: vk::RenderPass);

    fn create_buffer(&self, desc: &BufferDesc) -> VkResult<vk::Buffer>;
    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements;
    fn destroy_buffer(&self, buffer: vk::Buffer);

    fn create_image(&self, desc: &ImageDesc) -> VkResult<vk::Image>;
    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements;
    fn image_sparse_memory_requirements(
        &self,
        image: vk::Image,
    ) -> Vec<vk::SparseImageMemoryRequirements>;
    fn destroy_image(&self, image: vk::Image);

    fn allocate_memory(&self, desc: &MemoryAllocationDesc) -> VkResult<DriverAllocation>;
    fn free_memory(&self, allocation: &DriverAllocation);
    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()>;
    fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()>;

    fn create_semaphore(&self) -> VkResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence>;
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()>;
    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()>;
    fn destroy_fence(&self, fence: vk::Fence);

    fn queue_bind_sparse(
        &self,
        queue: vk::Queue,
        submits: &[SparseBindSubmitDesc],
        fence: vk::Fence,
    ) -> VkResult<()>;

    /// Records a single image barrier, submits it and blocks until it retires.
    fn submit_layout_transition(
        &self,
        queue: vk::Queue,
        pool: vk::CommandPool,
        transition: &LayoutTransitionDesc,
    ) -> VkResult<()>;

    fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()>;
    fn device_wait_idle(&self) -> VkResult<()>;
}
