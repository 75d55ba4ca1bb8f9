// Ash backend - the driver seam on top of a real Vulkan implementation
//
// Responsibilities:
// - Instance creation with optional validation layers
// - Physical device enumeration into plain descriptions
// - Logical device creation from a queue plan (global priority, protected queues)
// - Memory allocation through gpu-allocator
// - Turning bake infos into native create-info chains

use anyhow::{Context, Result};
use ash::prelude::VkResult;
use ash::{vk, Entry};
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::{c_void, CStr, CString};
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::driver::*;

/// Owns the instance; drivers keep it alive until their device is gone.
struct AshInstance {
    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,
    instance: ash::Instance,
    _entry: Entry,
}

impl Drop for AshInstance {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan instance...");
        unsafe {
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

pub struct AshBackend {
    physical_devices: Vec<PhysicalDeviceDesc>,
    instance: Arc<AshInstance>,
}

impl AshBackend {
    /// Load Vulkan, create an instance and enumerate its physical devices.
    pub fn new(app_name: &str, enable_validation: bool) -> Result<Self> {
        log::info!("Creating Vulkan instance: {}", app_name);

        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        let instance = Self::create_instance(&entry, app_name, enable_validation)?;
        let debug_utils = if enable_validation {
            match Self::setup_debug_messenger(&entry, &instance) {
                Ok(debug_utils) => Some(debug_utils),
                Err(e) => {
                    log::warn!("Validation messenger unavailable: {:#}", e);
                    None
                }
            }
        } else {
            None
        };

        let instance = Arc::new(AshInstance {
            debug_utils,
            instance,
            _entry: entry,
        });
        let physical_devices = Self::enumerate(&instance.instance)?;
        if physical_devices.is_empty() {
            anyhow::bail!("No Vulkan-capable GPU found");
        }

        Ok(Self {
            physical_devices,
            instance,
        })
    }

    fn create_instance(entry: &Entry, app_name: &str, enable_validation: bool) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;
        let engine_name = CString::new("Anvil")?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_1);

        let mut extensions = Vec::new();
        if enable_validation {
            extensions.push(ash::extensions::ext::DebugUtils::name().as_ptr());
        }

        let validation_layer = CString::new("VK_LAYER_KHRONOS_validation")?;
        let layer_names = if enable_validation {
            vec![validation_layer.as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;
        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::extensions::ext::DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }?;
        Ok((debug_utils, messenger))
    }

    fn enumerate(instance: &ash::Instance) -> Result<Vec<PhysicalDeviceDesc>> {
        let devices = unsafe { instance.enumerate_physical_devices() }
            .context("Failed to enumerate physical devices")?;

        let mut descs = Vec::with_capacity(devices.len());
        for (index, handle) in devices.into_iter().enumerate() {
            let properties = unsafe { instance.get_physical_device_properties(handle) };
            let extensions = unsafe { instance.enumerate_device_extension_properties(handle) }?
                .iter()
                .map(|e| {
                    unsafe { CStr::from_ptr(e.extension_name.as_ptr()) }
                        .to_string_lossy()
                        .into_owned()
                })
                .collect();

            descs.push(PhysicalDeviceDesc {
                handle,
                index: index as u32,
                name: unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
                    .to_string_lossy()
                    .into_owned(),
                device_type: properties.device_type,
                api_version: properties.api_version,
                queue_families: unsafe { instance.get_physical_device_queue_family_properties(handle) },
                extensions,
                features: unsafe { instance.get_physical_device_features(handle) },
                memory_properties: unsafe { instance.get_physical_device_memory_properties(handle) },
            });
        }
        Ok(descs)
    }
}

impl Backend for AshBackend {
    fn name(&self) -> &str {
        "vulkan"
    }

    fn physical_devices(&self) -> Result<Vec<PhysicalDeviceDesc>> {
        Ok(self.physical_devices.clone())
    }

    fn create_device(&self, desc: &DeviceCreateDesc) -> Result<Arc<dyn Driver>> {
        let physical = self
            .physical_devices
            .iter()
            .find(|p| p.handle == desc.physical_device)
            .context("Unknown physical device")?;
        let driver = AshDriver::new(Arc::clone(&self.instance), physical, desc)?;
        Ok(Arc::new(driver))
    }
}

pub struct AshDriver {
    // Drop order matters: allocations, then the allocator, then the device.
    allocations: Mutex<HashMap<u64, Allocation>>,
    allocator: Mutex<Option<Allocator>>,
    next_allocation: AtomicU64,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    // Command pools are externally synchronized; transitions from queues of
    // one family share a pool.
    transitions: Mutex<()>,
    device: ash::Device,
    _instance: Arc<AshInstance>,
}

impl AshDriver {
    fn new(instance: Arc<AshInstance>, physical: &PhysicalDeviceDesc, desc: &DeviceCreateDesc) -> Result<Self> {
        let priorities: Vec<vk::DeviceQueueGlobalPriorityCreateInfoEXT> = desc
            .queues
            .iter()
            .map(|q| vk::DeviceQueueGlobalPriorityCreateInfoEXT {
                global_priority: q.global_priority.unwrap_or(vk::QueueGlobalPriorityEXT::MEDIUM),
                ..Default::default()
            })
            .collect();
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = desc
            .queues
            .iter()
            .zip(&priorities)
            .map(|(q, priority)| vk::DeviceQueueCreateInfo {
                p_next: if q.global_priority.is_some() {
                    priority as *const _ as *const c_void
                } else {
                    ptr::null()
                },
                flags: q.flags,
                queue_family_index: q.family_index,
                queue_count: q.priorities.len() as u32,
                p_queue_priorities: q.priorities.as_ptr(),
                ..Default::default()
            })
            .collect();

        let extension_names: Vec<CString> = desc
            .extensions
            .iter()
            .map(|e| CString::new(e.as_str()))
            .collect::<Result<_, _>>()?;
        let extension_ptrs: Vec<*const std::os::raw::c_char> = extension_names.iter().map(|e| e.as_ptr()).collect();

        let mut protected = vk::PhysicalDeviceProtectedMemoryFeatures::builder().protected_memory(true);
        let mut create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extension_ptrs)
            .enabled_features(&desc.features);
        if desc.protected_memory {
            create_info = create_info.push_next(&mut protected);
        }

        let device = unsafe {
            instance
                .instance
                .create_device(desc.physical_device, &create_info, None)
        }
        .context("Failed to create logical device")?;

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.instance.clone(),
            device: device.clone(),
            physical_device: desc.physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .context("Failed to create memory allocator")?;

        log::info!(
            "Logical device on '{}' with {} extensions",
            physical.name,
            desc.extensions.len()
        );

        Ok(Self {
            allocations: Mutex::new(HashMap::new()),
            allocator: Mutex::new(Some(allocator)),
            next_allocation: AtomicU64::new(1),
            memory_properties: physical.memory_properties,
            transitions: Mutex::new(()),
            device,
            _instance: instance,
        })
    }

    fn memory_location(properties: vk::MemoryPropertyFlags) -> MemoryLocation {
        if properties.contains(vk::MemoryPropertyFlags::HOST_CACHED) {
            MemoryLocation::GpuToCpu
        } else if properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            MemoryLocation::CpuToGpu
        } else {
            MemoryLocation::GpuOnly
        }
    }

    fn memory_type_index(&self, type_bits: u32, properties: vk::MemoryPropertyFlags) -> u32 {
        (0..self.memory_properties.memory_type_count)
            .find(|&i| {
                type_bits & (1 << i) != 0
                    && self.memory_properties.memory_types[i as usize]
                        .property_flags
                        .contains(properties)
            })
            .unwrap_or(0)
    }

    fn shader_stage(stage: &ShaderStageBakeInfo, specialization: Option<&vk::SpecializationInfo>) -> vk::PipelineShaderStageCreateInfo {
        vk::PipelineShaderStageCreateInfo {
            stage: stage.stage,
            module: stage.module,
            p_name: stage.entry_point.as_ptr(),
            p_specialization_info: specialization.map_or(ptr::null(), |s| s as *const _),
            ..Default::default()
        }
    }

    fn specialization(info: &Option<SpecializationBakeInfo>) -> Option<vk::SpecializationInfo> {
        info.as_ref().map(|s| vk::SpecializationInfo {
            map_entry_count: s.map_entries.len() as u32,
            p_map_entries: s.map_entries.as_ptr(),
            data_size: s.data.len(),
            p_data: s.data.as_ptr() as *const c_void,
        })
    }

    fn base(base: BaseReference) -> (vk::Pipeline, i32) {
        match base {
            BaseReference::None => (vk::Pipeline::null(), -1),
            BaseReference::Index(index) => (vk::Pipeline::null(), index as i32),
            BaseReference::Handle(handle) => (handle, -1),
        }
    }

    fn destroy_partial(&self, pipelines: Vec<vk::Pipeline>) {
        for pipeline in pipelines.into_iter().filter(|p| *p != vk::Pipeline::null()) {
            unsafe { self.device.destroy_pipeline(pipeline, None) };
        }
    }
}

/// Owned storage for one graphics pipeline's create-info chain. Boxed so
/// the p_next pointers between its fields stay valid.
#[derive(Default)]
struct GraphicsChain {
    specializations: Vec<Option<vk::SpecializationInfo>>,
    stages: Vec<vk::PipelineShaderStageCreateInfo>,
    divisor: vk::PipelineVertexInputDivisorStateCreateInfoEXT,
    vertex_input: vk::PipelineVertexInputStateCreateInfo,
    input_assembly: vk::PipelineInputAssemblyStateCreateInfo,
    domain_origin: vk::PipelineTessellationDomainOriginStateCreateInfo,
    tessellation: vk::PipelineTessellationStateCreateInfo,
    viewport: vk::PipelineViewportStateCreateInfo,
    rasterization_order: vk::PipelineRasterizationStateRasterizationOrderAMD,
    conservative: vk::PipelineRasterizationConservativeStateCreateInfoEXT,
    depth_clip: vk::PipelineRasterizationDepthClipStateCreateInfoEXT,
    stream: vk::PipelineRasterizationStateStreamCreateInfoEXT,
    rasterization: vk::PipelineRasterizationStateCreateInfo,
    sample_mask: [u32; 1],
    sample_locations: vk::PipelineSampleLocationsStateCreateInfoEXT,
    multisample: vk::PipelineMultisampleStateCreateInfo,
    depth_stencil: vk::PipelineDepthStencilStateCreateInfo,
    color_blend: vk::PipelineColorBlendStateCreateInfo,
    dynamic: vk::PipelineDynamicStateCreateInfo,
}

fn as_next<T>(value: &T) -> *const c_void {
    value as *const T as *const c_void
}

impl GraphicsChain {
    fn build(info: &GraphicsPipelineBakeInfo) -> Box<Self> {
        let mut chain = Box::<GraphicsChain>::default();
        let c = &mut *chain;

        c.specializations = info
            .stages
            .iter()
            .map(|s| AshDriver::specialization(&s.specialization))
            .collect();
        c.stages = info
            .stages
            .iter()
            .zip(&c.specializations)
            .map(|(s, spec)| AshDriver::shader_stage(s, spec.as_ref()))
            .collect();

        let vi = &info.vertex_input;
        c.vertex_input = vk::PipelineVertexInputStateCreateInfo {
            vertex_binding_description_count: vi.bindings.len() as u32,
            p_vertex_binding_descriptions: vi.bindings.as_ptr(),
            vertex_attribute_description_count: vi.attributes.len() as u32,
            p_vertex_attribute_descriptions: vi.attributes.as_ptr(),
            ..Default::default()
        };
        if !vi.divisors.is_empty() {
            c.divisor = vk::PipelineVertexInputDivisorStateCreateInfoEXT {
                vertex_binding_divisor_count: vi.divisors.len() as u32,
                p_vertex_binding_divisors: vi.divisors.as_ptr(),
                ..Default::default()
            };
            c.vertex_input.p_next = as_next(&c.divisor);
        }

        c.input_assembly = vk::PipelineInputAssemblyStateCreateInfo {
            topology: info.input_assembly.topology,
            primitive_restart_enable: info.input_assembly.primitive_restart_enable.into(),
            ..Default::default()
        };

        if let Some(tess) = &info.tessellation {
            c.tessellation = vk::PipelineTessellationStateCreateInfo {
                patch_control_points: tess.patch_control_points,
                ..Default::default()
            };
            if let Some(origin) = tess.domain_origin {
                c.domain_origin = vk::PipelineTessellationDomainOriginStateCreateInfo {
                    domain_origin: origin,
                    ..Default::default()
                };
                c.tessellation.p_next = as_next(&c.domain_origin);
            }
        }

        if let Some(vp) = &info.viewport {
            c.viewport = vk::PipelineViewportStateCreateInfo {
                viewport_count: vp.viewport_count,
                p_viewports: if vp.viewports.is_empty() { ptr::null() } else { vp.viewports.as_ptr() },
                scissor_count: vp.scissor_count,
                p_scissors: if vp.scissors.is_empty() { ptr::null() } else { vp.scissors.as_ptr() },
                ..Default::default()
            };
        }

        let r = &info.rasterization;
        c.rasterization = vk::PipelineRasterizationStateCreateInfo {
            depth_clamp_enable: r.depth_clamp_enable.into(),
            rasterizer_discard_enable: r.rasterizer_discard_enable.into(),
            polygon_mode: r.polygon_mode,
            cull_mode: r.cull_mode,
            front_face: r.front_face,
            depth_bias_enable: r.depth_bias_enable.into(),
            depth_bias_constant_factor: r.depth_bias_constant_factor,
            depth_bias_clamp: r.depth_bias_clamp,
            depth_bias_slope_factor: r.depth_bias_slope_factor,
            line_width: r.line_width,
            ..Default::default()
        };
        // Built back to front.
        let mut next: *const c_void = ptr::null();
        if let Some(stream) = r.rasterization_stream {
            c.stream.rasterization_stream = stream;
            c.stream.p_next = next;
            next = as_next(&c.stream);
        }
        if let Some(enable) = r.depth_clip_enable {
            c.depth_clip.depth_clip_enable = enable.into();
            c.depth_clip.p_next = next;
            next = as_next(&c.depth_clip);
        }
        if let Some(conservative) = &r.conservative {
            c.conservative.conservative_rasterization_mode = conservative.mode;
            c.conservative.extra_primitive_overestimation_size = conservative.extra_primitive_overestimation_size;
            c.conservative.p_next = next;
            next = as_next(&c.conservative);
        }
        if let Some(order) = r.rasterization_order {
            c.rasterization_order.rasterization_order = order;
            c.rasterization_order.p_next = next;
            next = as_next(&c.rasterization_order);
        }
        c.rasterization.p_next = next;

        if let Some(ms) = &info.multisample {
            c.multisample = vk::PipelineMultisampleStateCreateInfo {
                rasterization_samples: ms.rasterization_samples,
                sample_shading_enable: ms.sample_shading_enable.into(),
                min_sample_shading: ms.min_sample_shading,
                alpha_to_coverage_enable: ms.alpha_to_coverage_enable.into(),
                alpha_to_one_enable: ms.alpha_to_one_enable.into(),
                ..Default::default()
            };
            if let Some(mask) = ms.sample_mask {
                c.sample_mask = [mask];
                c.multisample.p_sample_mask = c.sample_mask.as_ptr();
            }
            if let Some(locations) = &ms.sample_locations {
                c.sample_locations = vk::PipelineSampleLocationsStateCreateInfoEXT {
                    sample_locations_enable: vk::TRUE,
                    sample_locations_info: vk::SampleLocationsInfoEXT {
                        sample_locations_per_pixel: locations.per_pixel,
                        sample_location_grid_size: locations.grid_size,
                        sample_locations_count: locations.locations.len() as u32,
                        p_sample_locations: locations.locations.as_ptr(),
                        ..Default::default()
                    },
                    ..Default::default()
                };
                c.multisample.p_next = as_next(&c.sample_locations);
            }
        }

        if let Some(ds) = &info.depth_stencil {
            c.depth_stencil = vk::PipelineDepthStencilStateCreateInfo {
                depth_test_enable: ds.depth_test_enable.into(),
                depth_write_enable: ds.depth_write_enable.into(),
                depth_compare_op: ds.depth_compare_op,
                depth_bounds_test_enable: ds.depth_bounds_test_enable.into(),
                stencil_test_enable: ds.stencil_test_enable.into(),
                front: ds.front,
                back: ds.back,
                min_depth_bounds: ds.min_depth_bounds,
                max_depth_bounds: ds.max_depth_bounds,
                ..Default::default()
            };
        }

        if let Some(cb) = &info.color_blend {
            c.color_blend = vk::PipelineColorBlendStateCreateInfo {
                logic_op_enable: cb.logic_op_enable.into(),
                logic_op: cb.logic_op,
                attachment_count: cb.attachments.len() as u32,
                p_attachments: cb.attachments.as_ptr(),
                blend_constants: cb.blend_constants,
                ..Default::default()
            };
        }

        if let Some(states) = &info.dynamic_states {
            c.dynamic = vk::PipelineDynamicStateCreateInfo {
                dynamic_state_count: states.len() as u32,
                p_dynamic_states: states.as_ptr(),
                ..Default::default()
            };
        }

        chain
    }

    fn create_info(&self, info: &GraphicsPipelineBakeInfo) -> vk::GraphicsPipelineCreateInfo {
        let (base_pipeline_handle, base_pipeline_index) = AshDriver::base(info.base);
        vk::GraphicsPipelineCreateInfo {
            flags: info.flags,
            stage_count: self.stages.len() as u32,
            p_stages: self.stages.as_ptr(),
            p_vertex_input_state: &self.vertex_input,
            p_input_assembly_state: &self.input_assembly,
            p_tessellation_state: info.tessellation.as_ref().map_or(ptr::null(), |_| &self.tessellation as *const _),
            p_viewport_state: info.viewport.as_ref().map_or(ptr::null(), |_| &self.viewport as *const _),
            p_rasterization_state: &self.rasterization,
            p_multisample_state: info.multisample.as_ref().map_or(ptr::null(), |_| &self.multisample as *const _),
            p_depth_stencil_state: info.depth_stencil.as_ref().map_or(ptr::null(), |_| &self.depth_stencil as *const _),
            p_color_blend_state: info.color_blend.as_ref().map_or(ptr::null(), |_| &self.color_blend as *const _),
            p_dynamic_state: info.dynamic_states.as_ref().map_or(ptr::null(), |_| &self.dynamic as *const _),
            layout: info.layout,
            render_pass: info.render_pass,
            subpass: info.subpass,
            base_pipeline_handle,
            base_pipeline_index,
            ..Default::default()
        }
    }
}

fn allocation_error(e: gpu_allocator::AllocationError) -> vk::Result {
    log::error!("gpu-allocator: {}", e);
    match e {
        gpu_allocator::AllocationError::OutOfMemory => vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
        _ => vk::Result::ERROR_INITIALIZATION_FAILED,
    }
}

impl Driver for AshDriver {
    fn get_device_queue(&self, family_index: u32, queue_index: u32, flags: vk::DeviceQueueCreateFlags) -> vk::Queue {
        if flags.is_empty() {
            unsafe { self.device.get_device_queue(family_index, queue_index) }
        } else {
            let info = vk::DeviceQueueInfo2::builder()
                .flags(flags)
                .queue_family_index(family_index)
                .queue_index(queue_index);
            unsafe { self.device.get_device_queue2(&info) }
        }
    }

    fn create_command_pool(&self, family_index: u32) -> VkResult<vk::CommandPool> {
        let info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(family_index);
        unsafe { self.device.create_command_pool(&info, None) }
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) };
    }

    fn create_shader_module(&self, code: &[u32]) -> VkResult<vk::ShaderModule> {
        let info = vk::ShaderModuleCreateInfo::builder().code(code);
        unsafe { self.device.create_shader_module(&info, None) }
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        unsafe { self.device.destroy_shader_module(module, None) };
    }

    fn create_descriptor_set_layout(&self, bindings: &[DescriptorBindingDesc]) -> VkResult<vk::DescriptorSetLayout> {
        let bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(b.binding)
                    .descriptor_type(b.descriptor_type)
                    .descriptor_count(b.descriptor_count)
                    .stage_flags(b.stage_flags)
                    .build()
            })
            .collect();
        let info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        unsafe { self.device.create_descriptor_set_layout(&info, None) }
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> VkResult<vk::PipelineLayout> {
        let info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(set_layouts)
            .push_constant_ranges(push_constant_ranges);
        unsafe { self.device.create_pipeline_layout(&info, None) }
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        unsafe { self.device.destroy_pipeline_layout(layout, None) };
    }

    fn create_pipeline_cache(&self, initial_data: &[u8]) -> VkResult<vk::PipelineCache> {
        let info = vk::PipelineCacheCreateInfo::builder().initial_data(initial_data);
        unsafe { self.device.create_pipeline_cache(&info, None) }
    }

    fn get_pipeline_cache_data(&self, cache: vk::PipelineCache) -> VkResult<Vec<u8>> {
        unsafe { self.device.get_pipeline_cache_data(cache) }
    }

    fn merge_pipeline_caches(&self, dst: vk::PipelineCache, src: &[vk::PipelineCache]) -> VkResult<()> {
        unsafe { self.device.merge_pipeline_caches(dst, src) }
    }

    fn destroy_pipeline_cache(&self, cache: vk::PipelineCache) {
        unsafe { self.device.destroy_pipeline_cache(cache, None) };
    }

    fn create_compute_pipelines(
        &self,
        cache: vk::PipelineCache,
        infos: &[ComputePipelineBakeInfo],
    ) -> VkResult<Vec<vk::Pipeline>> {
        let specializations: Vec<Option<vk::SpecializationInfo>> = infos
            .iter()
            .map(|i| Self::specialization(&i.stage.specialization))
            .collect();
        let create_infos: Vec<vk::ComputePipelineCreateInfo> = infos
            .iter()
            .zip(&specializations)
            .map(|(info, spec)| {
                let (base_pipeline_handle, base_pipeline_index) = Self::base(info.base);
                vk::ComputePipelineCreateInfo {
                    flags: info.flags,
                    stage: Self::shader_stage(&info.stage, spec.as_ref()),
                    layout: info.layout,
                    base_pipeline_handle,
                    base_pipeline_index,
                    ..Default::default()
                }
            })
            .collect();

        match unsafe { self.device.create_compute_pipelines(cache, &create_infos, None) } {
            Ok(pipelines) => Ok(pipelines),
            Err((partial, result)) => {
                self.destroy_partial(partial);
                Err(result)
            }
        }
    }

    fn create_graphics_pipelines(
        &self,
        cache: vk::PipelineCache,
        infos: &[GraphicsPipelineBakeInfo],
    ) -> VkResult<Vec<vk::Pipeline>> {
        let chains: Vec<Box<GraphicsChain>> = infos.iter().map(GraphicsChain::build).collect();
        let create_infos: Vec<vk::GraphicsPipelineCreateInfo> = chains
            .iter()
            .zip(infos)
            .map(|(chain, info)| chain.create_info(info))
            .collect();

        match unsafe { self.device.create_graphics_pipelines(cache, &create_infos, None) } {
            Ok(pipelines) => Ok(pipelines),
            Err((partial, result)) => {
                self.destroy_partial(partial);
                Err(result)
            }
        }
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe { self.device.destroy_pipeline(pipeline, None) };
    }

    fn create_render_pass(&self, info: &RenderPassBakeInfo) -> VkResult<vk::RenderPass> {
        let subpasses: Vec<vk::SubpassDescription> = info
            .subpasses
            .iter()
            .map(|s| vk::SubpassDescription {
                pipeline_bind_point: vk::PipelineBindPoint::GRAPHICS,
                input_attachment_count: s.input_attachments.len() as u32,
                p_input_attachments: s.input_attachments.as_ptr(),
                color_attachment_count: s.color_attachments.len() as u32,
                p_color_attachments: s.color_attachments.as_ptr(),
                p_resolve_attachments: if s.resolve_attachments.is_empty() {
                    ptr::null()
                } else {
                    s.resolve_attachments.as_ptr()
                },
                p_depth_stencil_attachment: s
                    .depth_stencil_attachment
                    .as_ref()
                    .map_or(ptr::null(), |a| a as *const _),
                preserve_attachment_count: s.preserve_attachments.len() as u32,
                p_preserve_attachments: s.preserve_attachments.as_ptr(),
                ..Default::default()
            })
            .collect();

        let create_info = vk::RenderPassCreateInfo::builder()
            .attachments(&info.attachments)
            .subpasses(&subpasses)
            .dependencies(&info.dependencies);
        unsafe { self.device.create_render_pass(&create_info, None) }
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        unsafe { self.device.destroy_render_pass(render_pass, None) };
    }

    fn create_buffer(&self, desc: &BufferDesc) -> VkResult<vk::Buffer> {
        let sharing = if desc.queue_families.len() > 1 {
            vk::SharingMode::CONCURRENT
        } else {
            vk::SharingMode::EXCLUSIVE
        };
        let info = vk::BufferCreateInfo::builder()
            .flags(desc.flags)
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(sharing)
            .queue_family_indices(&desc.queue_families);
        unsafe { self.device.create_buffer(&info, None) }
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        unsafe { self.device.get_buffer_memory_requirements(buffer) }
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe { self.device.destroy_buffer(buffer, None) };
    }

    fn create_image(&self, desc: &ImageDesc) -> VkResult<vk::Image> {
        let sharing = if desc.queue_families.len() > 1 {
            vk::SharingMode::CONCURRENT
        } else {
            vk::SharingMode::EXCLUSIVE
        };
        let info = vk::ImageCreateInfo::builder()
            .flags(desc.flags)
            .image_type(desc.image_type)
            .format(desc.format)
            .extent(desc.extent)
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .samples(desc.samples)
            .tiling(desc.tiling)
            .usage(desc.usage)
            .sharing_mode(sharing)
            .queue_family_indices(&desc.queue_families)
            .initial_layout(desc.initial_layout);
        unsafe { self.device.create_image(&info, None) }
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        unsafe { self.device.get_image_memory_requirements(image) }
    }

    fn image_sparse_memory_requirements(&self, image: vk::Image) -> Vec<vk::SparseImageMemoryRequirements> {
        unsafe { self.device.get_image_sparse_memory_requirements(image) }
    }

    fn destroy_image(&self, image: vk::Image) {
        unsafe { self.device.destroy_image(image, None) };
    }

    fn allocate_memory(&self, desc: &MemoryAllocationDesc) -> VkResult<DriverAllocation> {
        let mut allocator = self.allocator.lock();
        let allocator = allocator.as_mut().ok_or(vk::Result::ERROR_DEVICE_LOST)?;
        let allocation = allocator
            .allocate(&AllocationCreateDesc {
                name: &desc.name,
                requirements: desc.requirements,
                location: Self::memory_location(desc.properties),
                linear: desc.linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(allocation_error)?;

        let driver_allocation = DriverAllocation {
            id: self.next_allocation.fetch_add(1, Ordering::Relaxed),
            memory: unsafe { allocation.memory() },
            offset: allocation.offset(),
            size: allocation.size(),
            memory_type_index: self.memory_type_index(desc.requirements.memory_type_bits, desc.properties),
        };
        self.allocations.lock().insert(driver_allocation.id, allocation);
        Ok(driver_allocation)
    }

    fn free_memory(&self, allocation: &DriverAllocation) {
        let Some(allocation) = self.allocations.lock().remove(&allocation.id) else {
            log::warn!("Freeing unknown allocation #{}", allocation.id);
            return;
        };
        if let Some(allocator) = self.allocator.lock().as_mut() {
            if let Err(e) = allocator.free(allocation) {
                log::error!("gpu-allocator free failed: {}", e);
            }
        }
    }

    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory, offset: vk::DeviceSize) -> VkResult<()> {
        unsafe { self.device.bind_buffer_memory(buffer, memory, offset) }
    }

    fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory, offset: vk::DeviceSize) -> VkResult<()> {
        unsafe { self.device.bind_image_memory(image, memory, offset) }
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let info = vk::SemaphoreCreateInfo::builder();
        unsafe { self.device.create_semaphore(&info, None) }
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::builder().flags(flags);
        unsafe { self.device.create_fence(&info, None) }
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()> {
        unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        unsafe { self.device.reset_fences(&[fence]) }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) };
    }

    fn queue_bind_sparse(&self, queue: vk::Queue, submits: &[SparseBindSubmitDesc], fence: vk::Fence) -> VkResult<()> {
        let buffer_infos: Vec<Vec<vk::SparseBufferMemoryBindInfo>> = submits
            .iter()
            .map(|s| {
                s.buffer_binds
                    .iter()
                    .map(|(buffer, binds)| vk::SparseBufferMemoryBindInfo {
                        buffer: *buffer,
                        bind_count: binds.len() as u32,
                        p_binds: binds.as_ptr(),
                    })
                    .collect()
            })
            .collect();
        let opaque_infos: Vec<Vec<vk::SparseImageOpaqueMemoryBindInfo>> = submits
            .iter()
            .map(|s| {
                s.image_opaque_binds
                    .iter()
                    .map(|(image, binds)| vk::SparseImageOpaqueMemoryBindInfo {
                        image: *image,
                        bind_count: binds.len() as u32,
                        p_binds: binds.as_ptr(),
                    })
                    .collect()
            })
            .collect();
        let image_infos: Vec<Vec<vk::SparseImageMemoryBindInfo>> = submits
            .iter()
            .map(|s| {
                s.image_binds
                    .iter()
                    .map(|(image, binds)| vk::SparseImageMemoryBindInfo {
                        image: *image,
                        bind_count: binds.len() as u32,
                        p_binds: binds.as_ptr(),
                    })
                    .collect()
            })
            .collect();
        let groups: Vec<vk::DeviceGroupBindSparseInfo> = submits
            .iter()
            .map(|s| {
                let indices = s.device_group.unwrap_or(DeviceGroupIndices {
                    resource_device_index: 0,
                    memory_device_index: 0,
                });
                vk::DeviceGroupBindSparseInfo {
                    resource_device_index: indices.resource_device_index,
                    memory_device_index: indices.memory_device_index,
                    ..Default::default()
                }
            })
            .collect();

        let infos: Vec<vk::BindSparseInfo> = submits
            .iter()
            .enumerate()
            .map(|(i, s)| vk::BindSparseInfo {
                p_next: if s.device_group.is_some() {
                    as_next(&groups[i])
                } else {
                    ptr::null()
                },
                wait_semaphore_count: s.wait_semaphores.len() as u32,
                p_wait_semaphores: s.wait_semaphores.as_ptr(),
                buffer_bind_count: buffer_infos[i].len() as u32,
                p_buffer_binds: buffer_infos[i].as_ptr(),
                image_opaque_bind_count: opaque_infos[i].len() as u32,
                p_image_opaque_binds: opaque_infos[i].as_ptr(),
                image_bind_count: image_infos[i].len() as u32,
                p_image_binds: image_infos[i].as_ptr(),
                signal_semaphore_count: s.signal_semaphores.len() as u32,
                p_signal_semaphores: s.signal_semaphores.as_ptr(),
                ..Default::default()
            })
            .collect();

        unsafe { self.device.queue_bind_sparse(queue, &infos, fence) }
    }

    fn submit_layout_transition(
        &self,
        queue: vk::Queue,
        pool: vk::CommandPool,
        transition: &LayoutTransitionDesc,
    ) -> VkResult<()> {
        let _pool = self.transitions.lock();

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = unsafe { self.device.allocate_command_buffers(&alloc_info) }?[0];

        let result = (|| unsafe {
            let begin = vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.device.begin_command_buffer(command_buffer, &begin)?;

            let barrier = vk::ImageMemoryBarrier::builder()
                .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
                .dst_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE)
                .old_layout(transition.old_layout)
                .new_layout(transition.new_layout)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(transition.image)
                .subresource_range(transition.subresource_range)
                .build();
            self.device.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
            self.device.end_command_buffer(command_buffer)?;

            let fence = self.device.create_fence(&vk::FenceCreateInfo::default(), None)?;
            let command_buffers = [command_buffer];
            let submit = vk::SubmitInfo::builder().command_buffers(&command_buffers).build();
            let submitted = self
                .device
                .queue_submit(queue, &[submit], fence)
                .and_then(|_| self.device.wait_for_fences(&[fence], true, u64::MAX));
            self.device.destroy_fence(fence, None);
            submitted
        })();

        unsafe { self.device.free_command_buffers(pool, &[command_buffer]) };
        result
    }

    fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()> {
        unsafe { self.device.queue_wait_idle(queue) }
    }

    fn device_wait_idle(&self) -> VkResult<()> {
        unsafe { self.device.device_wait_idle() }
    }
}

impl fmt::Debug for AshDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AshDriver")
            .field("device", &self.device.handle())
            .field("live_allocations", &self.allocations.lock().len())
            .finish()
    }
}

impl Drop for AshDriver {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");
        let _ = unsafe { self.device.device_wait_idle() };

        let leaked: Vec<Allocation> = self.allocations.lock().drain().map(|(_, a)| a).collect();
        if !leaked.is_empty() {
            log::warn!("{} memory allocations still live at device teardown", leaked.len());
        }
        if let Some(mut allocator) = self.allocator.lock().take() {
            for allocation in leaked {
                let _ = allocator.free(allocation);
            }
        }

        unsafe { self.device.destroy_device(None) };
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}
