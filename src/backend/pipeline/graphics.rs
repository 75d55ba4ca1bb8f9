// Graphics pipelines
//
// The whole outstanding batch goes to the driver in one call. Each state
// block is produced only when it applies: blend state needs color
// attachments, depth/stencil state needs a depth/stencil attachment, and
// rasterizer discard drops everything past rasterization. Extension-backed
// structs are chained only when the device enabled the extension; asking for
// a non-default value without it is an error.

use anyhow::{bail, Context, Result};
use ash::vk;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use super::cache::PipelineCache;
use super::{
    BatchBase, BatchEntry, CreatedPipeline, PipelineCommonInfo, PipelineId, PipelineKind, ShaderStageInfo,
};
use crate::backend::device::{
    DeviceContext, DeviceExtensions, EXT_CONSERVATIVE_RASTERIZATION, EXT_DEPTH_CLIP_ENABLE,
    EXT_RASTERIZATION_ORDER_AMD, EXT_SAMPLE_LOCATIONS, EXT_TRANSFORM_FEEDBACK,
    EXT_VERTEX_ATTRIBUTE_DIVISOR,
};
use crate::backend::driver::{
    BaseReference, ColorBlendBakeInfo, ConservativeRasterizationBakeInfo, DepthStencilBakeInfo,
    GraphicsPipelineBakeInfo, InputAssemblyBakeInfo, MultisampleBakeInfo, RasterizationBakeInfo,
    SampleLocationsBakeInfo, TessellationBakeInfo, VertexInputBakeInfo, ViewportBakeInfo,
};
use crate::backend::layout::{DescriptorSetLayout, PushConstantRange};
use crate::backend::object::ObjectKind;
use crate::backend::render_pass::{RenderPass, SubpassInfo};
use crate::backend::shader::ShaderStage;
use crate::AnvilError;

/// One vertex attribute. Attributes that agree on stride, input rate and
/// divisor share a vertex binding unless they pin one explicitly.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: vk::Format,
    pub offset: u32,
    pub stride: u32,
    pub input_rate: vk::VertexInputRate,
    pub divisor: u32,
    pub explicit_binding: Option<u32>,
}

impl VertexAttribute {
    pub fn new(location: u32, format: vk::Format, offset: u32, stride: u32) -> Self {
        Self {
            location,
            format,
            offset,
            stride,
            input_rate: vk::VertexInputRate::VERTEX,
            divisor: 1,
            explicit_binding: None,
        }
    }

    pub fn per_instance(mut self, divisor: u32) -> Self {
        self.input_rate = vk::VertexInputRate::INSTANCE;
        self.divisor = divisor;
        self
    }

    pub fn with_binding(mut self, binding: u32) -> Self {
        self.explicit_binding = Some(binding);
        self
    }

    fn binding_key(&self) -> (u32, i32, u32) {
        (self.divisor, self.input_rate.as_raw(), self.stride)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ColorBlendAttachment {
    pub blend_enable: bool,
    pub src_color_blend_factor: vk::BlendFactor,
    pub dst_color_blend_factor: vk::BlendFactor,
    pub color_blend_op: vk::BlendOp,
    pub src_alpha_blend_factor: vk::BlendFactor,
    pub dst_alpha_blend_factor: vk::BlendFactor,
    pub alpha_blend_op: vk::BlendOp,
    pub color_write_mask: vk::ColorComponentFlags,
}

impl Default for ColorBlendAttachment {
    fn default() -> Self {
        Self {
            blend_enable: false,
            src_color_blend_factor: vk::BlendFactor::ONE,
            dst_color_blend_factor: vk::BlendFactor::ONE,
            color_blend_op: vk::BlendOp::ADD,
            src_alpha_blend_factor: vk::BlendFactor::ONE,
            dst_alpha_blend_factor: vk::BlendFactor::ONE,
            alpha_blend_op: vk::BlendOp::ADD,
            color_write_mask: vk::ColorComponentFlags::RGBA,
        }
    }
}

impl ColorBlendAttachment {
    /// Classic `src * a + dst * (1 - a)` blending.
    pub fn alpha_blended() -> Self {
        Self {
            blend_enable: true,
            src_color_blend_factor: vk::BlendFactor::SRC_ALPHA,
            dst_color_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            src_alpha_blend_factor: vk::BlendFactor::ONE,
            dst_alpha_blend_factor: vk::BlendFactor::ZERO,
            ..Self::default()
        }
    }

    fn to_vk(self) -> vk::PipelineColorBlendAttachmentState {
        vk::PipelineColorBlendAttachmentState {
            blend_enable: self.blend_enable.into(),
            src_color_blend_factor: self.src_color_blend_factor,
            dst_color_blend_factor: self.dst_color_blend_factor,
            color_blend_op: self.color_blend_op,
            src_alpha_blend_factor: self.src_alpha_blend_factor,
            dst_alpha_blend_factor: self.dst_alpha_blend_factor,
            alpha_blend_op: self.alpha_blend_op,
            color_write_mask: self.color_write_mask,
        }
    }
}

#[derive(Clone, Debug)]
pub struct GraphicsPipelineCreateInfo {
    pub common: PipelineCommonInfo,
    pub render_pass: Arc<RenderPass>,
    pub subpass: u32,

    pub vertex_attributes: Vec<VertexAttribute>,
    pub topology: vk::PrimitiveTopology,
    pub primitive_restart: bool,

    pub patch_control_points: u32,
    pub tessellation_domain_origin: vk::TessellationDomainOrigin,

    /// Empty together with `scissors` means "cover the swapchain image".
    pub viewports: Vec<vk::Viewport>,
    pub scissors: Vec<vk::Rect2D>,
    pub dynamic_states: Vec<vk::DynamicState>,

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
    pub rasterization_order: vk::RasterizationOrderAMD,
    pub conservative_rasterization_mode: vk::ConservativeRasterizationModeEXT,
    pub extra_primitive_overestimation_size: f32,
    /// None keeps the implicit behavior, which is `!depth_clamp_enable`.
    pub depth_clip_enable: Option<bool>,
    pub rasterization_stream: u32,

    pub rasterization_samples: vk::SampleCountFlags,
    pub sample_shading_enable: bool,
    pub min_sample_shading: f32,
    pub sample_mask_enable: bool,
    pub sample_mask: u32,
    pub alpha_to_coverage_enable: bool,
    pub alpha_to_one_enable: bool,
    pub sample_locations: Option<SampleLocationsBakeInfo>,

    pub depth_test_enable: bool,
    pub depth_write_enable: bool,
    pub depth_compare_op: vk::CompareOp,
    pub depth_bounds_test_enable: bool,
    pub min_depth_bounds: f32,
    pub max_depth_bounds: f32,
    pub stencil_test_enable: bool,
    pub stencil_front: vk::StencilOpState,
    pub stencil_back: vk::StencilOpState,

    pub logic_op_enable: bool,
    pub logic_op: vk::LogicOp,
    /// Keyed by color output location.
    pub blend_attachments: BTreeMap<u32, ColorBlendAttachment>,
    pub blend_constants: [f32; 4],
}

impl GraphicsPipelineCreateInfo {
    pub fn new(render_pass: Arc<RenderPass>, subpass: u32, stages: Vec<ShaderStageInfo>) -> Self {
        Self {
            common: PipelineCommonInfo {
                stages,
                ..PipelineCommonInfo::default()
            },
            render_pass,
            subpass,
            vertex_attributes: Vec::new(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            primitive_restart: false,
            patch_control_points: 1,
            tessellation_domain_origin: vk::TessellationDomainOrigin::UPPER_LEFT,
            viewports: Vec::new(),
            scissors: Vec::new(),
            dynamic_states: Vec::new(),
            depth_clamp_enable: false,
            rasterizer_discard_enable: false,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            depth_bias_enable: false,
            depth_bias_constant_factor: 0.0,
            depth_bias_clamp: 0.0,
            depth_bias_slope_factor: 0.0,
            line_width: 1.0,
            rasterization_order: vk::RasterizationOrderAMD::STRICT,
            conservative_rasterization_mode: vk::ConservativeRasterizationModeEXT::DISABLED,
            extra_primitive_overestimation_size: 0.0,
            depth_clip_enable: None,
            rasterization_stream: 0,
            rasterization_samples: vk::SampleCountFlags::TYPE_1,
            sample_shading_enable: false,
            min_sample_shading: 1.0,
            sample_mask_enable: false,
            sample_mask: !0,
            alpha_to_coverage_enable: false,
            alpha_to_one_enable: false,
            sample_locations: None,
            depth_test_enable: false,
            depth_write_enable: false,
            depth_compare_op: vk::CompareOp::LESS,
            depth_bounds_test_enable: false,
            min_depth_bounds: 0.0,
            max_depth_bounds: 1.0,
            stencil_test_enable: false,
            stencil_front: vk::StencilOpState::default(),
            stencil_back: vk::StencilOpState::default(),
            logic_op_enable: false,
            logic_op: vk::LogicOp::COPY,
            blend_attachments: BTreeMap::new(),
            blend_constants: [0.0; 4],
        }
    }

    pub fn with_set_layouts(mut self, set_layouts: Vec<Arc<DescriptorSetLayout>>) -> Self {
        self.common.set_layouts = set_layouts;
        self
    }

    pub fn with_push_constant_range(mut self, range: PushConstantRange) -> Self {
        self.common.push_constant_ranges.push(range);
        self
    }

    pub fn with_allow_derivatives(mut self, allow: bool) -> Self {
        self.common.allow_derivatives = allow;
        self
    }

    pub fn with_base_pipeline(mut self, base: PipelineId) -> Self {
        self.common.base_pipeline = Some(base);
        self
    }

    pub fn as_proxy(mut self) -> Self {
        self.common.proxy = true;
        self
    }

    pub fn add_vertex_attribute(mut self, attribute: VertexAttribute) -> Self {
        self.vertex_attributes.push(attribute);
        self
    }

    pub fn with_topology(mut self, topology: vk::PrimitiveTopology) -> Self {
        self.topology = topology;
        self
    }

    pub fn add_viewport(mut self, viewport: vk::Viewport, scissor: vk::Rect2D) -> Self {
        self.viewports.push(viewport);
        self.scissors.push(scissor);
        self
    }

    pub fn enable_dynamic_state(mut self, state: vk::DynamicState) -> Self {
        if !self.dynamic_states.contains(&state) {
            self.dynamic_states.push(state);
        }
        self
    }

    pub fn with_depth_test(mut self, compare_op: vk::CompareOp, write: bool) -> Self {
        self.depth_test_enable = true;
        self.depth_write_enable = write;
        self.depth_compare_op = compare_op;
        self
    }

    pub fn with_rasterizer_discard(mut self, discard: bool) -> Self {
        self.rasterizer_discard_enable = discard;
        self
    }

    pub fn with_sample_mask(mut self, mask: u32) -> Self {
        self.sample_mask_enable = true;
        self.sample_mask = mask;
        self
    }

    pub fn with_blend_attachment(mut self, location: u32, attachment: ColorBlendAttachment) -> Self {
        self.blend_attachments.insert(location, attachment);
        self
    }
}

/// Fails unless the extension is there or the requested value is the one
/// the driver assumes anyway.
fn guard(
    enabled: bool,
    is_default: bool,
    feature: &'static str,
    extension: &'static str,
) -> Result<bool> {
    match (enabled, is_default) {
        (true, _) => Ok(true),
        (false, true) => Ok(false),
        (false, false) => Err(AnvilError::UnsupportedFeature { feature, extension }.into()),
    }
}

fn bake_vertex_input(
    attributes: &[VertexAttribute],
    extensions: &DeviceExtensions,
) -> Result<VertexInputBakeInfo> {
    let mut baked = VertexInputBakeInfo::default();

    // Explicit binding indices are reserved before shared ones are handed out.
    let mut explicit: BTreeMap<u32, (u32, i32, u32)> = BTreeMap::new();
    for attribute in attributes {
        if let Some(binding) = attribute.explicit_binding {
            match explicit.get(&binding) {
                Some(key) if *key != attribute.binding_key() => bail!(
                    "attributes pinned to binding {} disagree on stride, rate or divisor",
                    binding
                ),
                Some(_) => {}
                None => {
                    explicit.insert(binding, attribute.binding_key());
                }
            }
        }
    }
    let reserved: BTreeSet<u32> = explicit.keys().copied().collect();

    let mut shared: BTreeMap<(u32, i32, u32), u32> = BTreeMap::new();
    let mut next_free = 0u32;
    let mut bindings: BTreeMap<u32, VertexAttribute> = BTreeMap::new();

    for attribute in attributes {
        let binding = match attribute.explicit_binding {
            Some(binding) => binding,
            None => match shared.get(&attribute.binding_key()) {
                Some(binding) => *binding,
                None => {
                    while reserved.contains(&next_free) {
                        next_free += 1;
                    }
                    let binding = next_free;
                    next_free += 1;
                    shared.insert(attribute.binding_key(), binding);
                    binding
                }
            },
        };
        bindings.entry(binding).or_insert(*attribute);
        baked.attributes.push(vk::VertexInputAttributeDescription {
            location: attribute.location,
            binding,
            format: attribute.format,
            offset: attribute.offset,
        });
    }

    for (binding, attribute) in &bindings {
        baked.bindings.push(vk::VertexInputBindingDescription {
            binding: *binding,
            stride: attribute.stride,
            input_rate: attribute.input_rate,
        });
        if attribute.divisor != 1 {
            guard(
                extensions.vertex_attribute_divisor,
                false,
                "vertex attribute divisor",
                EXT_VERTEX_ATTRIBUTE_DIVISOR,
            )?;
            baked.divisors.push(vk::VertexInputBindingDivisorDescriptionEXT {
                binding: *binding,
                divisor: attribute.divisor,
            });
        }
    }

    Ok(baked)
}

fn bake_rasterization(
    info: &GraphicsPipelineCreateInfo,
    extensions: &DeviceExtensions,
) -> Result<RasterizationBakeInfo> {
    let rasterization_order = guard(
        extensions.rasterization_order_amd,
        info.rasterization_order == vk::RasterizationOrderAMD::STRICT,
        "relaxed rasterization order",
        EXT_RASTERIZATION_ORDER_AMD,
    )?
    .then_some(info.rasterization_order);

    let conservative = guard(
        extensions.conservative_rasterization,
        info.conservative_rasterization_mode == vk::ConservativeRasterizationModeEXT::DISABLED,
        "conservative rasterization",
        EXT_CONSERVATIVE_RASTERIZATION,
    )?
    .then_some(ConservativeRasterizationBakeInfo {
        mode: info.conservative_rasterization_mode,
        extra_primitive_overestimation_size: info.extra_primitive_overestimation_size,
    });

    let depth_clip_enable = match info.depth_clip_enable {
        Some(enable) => guard(
            extensions.depth_clip_enable,
            enable != info.depth_clamp_enable,
            "explicit depth clip",
            EXT_DEPTH_CLIP_ENABLE,
        )?
        .then_some(enable),
        None => None,
    };

    let rasterization_stream = guard(
        extensions.transform_feedback,
        info.rasterization_stream == 0,
        "non-zero rasterization stream",
        EXT_TRANSFORM_FEEDBACK,
    )?
    .then_some(info.rasterization_stream);

    Ok(RasterizationBakeInfo {
        depth_clamp_enable: info.depth_clamp_enable,
        rasterizer_discard_enable: info.rasterizer_discard_enable,
        polygon_mode: info.polygon_mode,
        cull_mode: info.cull_mode,
        front_face: info.front_face,
        depth_bias_enable: info.depth_bias_enable,
        depth_bias_constant_factor: info.depth_bias_constant_factor,
        depth_bias_clamp: info.depth_bias_clamp,
        depth_bias_slope_factor: info.depth_bias_slope_factor,
        line_width: info.line_width,
        rasterization_order,
        conservative,
        depth_clip_enable,
        rasterization_stream,
    })
}

fn bake_multisample(
    info: &GraphicsPipelineCreateInfo,
    extensions: &DeviceExtensions,
) -> Result<Option<MultisampleBakeInfo>> {
    if info.rasterizer_discard_enable {
        return Ok(None);
    }
    if info.sample_locations.is_some() && !extensions.sample_locations {
        return Err(AnvilError::UnsupportedFeature {
            feature: "custom sample locations",
            extension: EXT_SAMPLE_LOCATIONS,
        }
        .into());
    }

    Ok(Some(MultisampleBakeInfo {
        rasterization_samples: info.rasterization_samples,
        sample_shading_enable: info.sample_shading_enable,
        min_sample_shading: info.min_sample_shading,
        sample_mask: info.sample_mask_enable.then_some(info.sample_mask),
        alpha_to_coverage_enable: info.alpha_to_coverage_enable,
        alpha_to_one_enable: info.alpha_to_one_enable,
        sample_locations: info.sample_locations.clone(),
    }))
}

fn bake_depth_stencil(
    info: &GraphicsPipelineCreateInfo,
    subpass: &SubpassInfo,
) -> Result<Option<DepthStencilBakeInfo>> {
    if subpass.depth_stencil_attachment.is_none() {
        if info.depth_test_enable
            || info.depth_write_enable
            || info.depth_bounds_test_enable
            || info.stencil_test_enable
        {
            bail!(
                "subpass {} has no depth/stencil attachment but depth or stencil testing is enabled",
                info.subpass
            );
        }
        return Ok(None);
    }

    Ok(Some(DepthStencilBakeInfo {
        depth_test_enable: info.depth_test_enable,
        depth_write_enable: info.depth_write_enable,
        depth_compare_op: info.depth_compare_op,
        depth_bounds_test_enable: info.depth_bounds_test_enable,
        min_depth_bounds: info.min_depth_bounds,
        max_depth_bounds: info.max_depth_bounds,
        stencil_test_enable: info.stencil_test_enable,
        front: info.stencil_front,
        back: info.stencil_back,
    }))
}

fn bake_color_blend(
    info: &GraphicsPipelineCreateInfo,
    subpass: &SubpassInfo,
) -> Result<Option<ColorBlendBakeInfo>> {
    let highest = match subpass.highest_color_location() {
        Some(highest) if !info.rasterizer_discard_enable => highest,
        _ => {
            if info.logic_op_enable {
                bail!("logic op enabled on a pipeline that writes no color attachments");
            }
            return Ok(None);
        }
    };

    let attachments = (0..=highest)
        .map(|location| {
            info.blend_attachments
                .get(&location)
                .copied()
                .unwrap_or_default()
                .to_vk()
        })
        .collect();

    Ok(Some(ColorBlendBakeInfo {
        logic_op_enable: info.logic_op_enable,
        logic_op: info.logic_op,
        attachments,
        blend_constants: info.blend_constants,
    }))
}

fn bake_viewport(info: &GraphicsPipelineCreateInfo) -> Result<Option<ViewportBakeInfo>> {
    if info.rasterizer_discard_enable {
        return Ok(None);
    }

    let dynamic_viewport = info.dynamic_states.contains(&vk::DynamicState::VIEWPORT);
    let dynamic_scissor = info.dynamic_states.contains(&vk::DynamicState::SCISSOR);

    let (mut viewports, mut scissors) = (info.viewports.clone(), info.scissors.clone());
    if viewports.is_empty() && scissors.is_empty() {
        if let Some(swapchain) = info.render_pass.swapchain() {
            let extent = swapchain.extent();
            viewports.push(vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: extent.width as f32,
                height: extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            });
            scissors.push(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            });
        }
    }

    if viewports.len() != scissors.len() {
        bail!(
            "{} viewports but {} scissors; the counts must match",
            viewports.len(),
            scissors.len()
        );
    }

    let count = match viewports.len() {
        0 if dynamic_viewport && dynamic_scissor => 1,
        0 => bail!("no viewport given and none can be derived from a swapchain"),
        n => n as u32,
    };

    Ok(Some(ViewportBakeInfo {
        viewport_count: count,
        scissor_count: count,
        viewports: if dynamic_viewport { Vec::new() } else { viewports },
        scissors: if dynamic_scissor { Vec::new() } else { scissors },
    }))
}

fn bake_tessellation(
    info: &GraphicsPipelineCreateInfo,
    extensions: &DeviceExtensions,
) -> Option<TessellationBakeInfo> {
    let common = &info.common;
    if common.stage(ShaderStage::TessellationControl).is_none()
        || common.stage(ShaderStage::TessellationEvaluation).is_none()
    {
        return None;
    }

    Some(TessellationBakeInfo {
        patch_control_points: info.patch_control_points,
        domain_origin: extensions
            .maintenance2
            .then_some(info.tessellation_domain_origin),
    })
}

pub struct GraphicsPipelines;

impl GraphicsPipelines {
    fn bake_info(
        context: &DeviceContext,
        entry: &BatchEntry<'_, GraphicsPipelineCreateInfo>,
    ) -> Result<GraphicsPipelineBakeInfo> {
        let info = entry.info;
        let extensions = context.extensions();

        if info.common.stage(ShaderStage::Compute).is_some() {
            bail!("graphics pipeline {:?} has a compute stage", entry.id);
        }
        let subpass = info
            .render_pass
            .subpass(info.subpass)
            .with_context(|| format!("render pass has no subpass {}", info.subpass))?;

        let base = match entry.base {
            BatchBase::None => BaseReference::None,
            BatchBase::InBatch(pos) => BaseReference::Index(pos as u32),
            BatchBase::Baked(handle) => BaseReference::Handle(handle),
        };

        Ok(GraphicsPipelineBakeInfo {
            flags: info.common.create_flags(&entry.base),
            stages: info.common.bake_stages()?,
            vertex_input: bake_vertex_input(&info.vertex_attributes, extensions)?,
            input_assembly: InputAssemblyBakeInfo {
                topology: info.topology,
                primitive_restart_enable: info.primitive_restart,
            },
            tessellation: bake_tessellation(info, extensions),
            viewport: bake_viewport(info)?,
            rasterization: bake_rasterization(info, extensions)?,
            multisample: bake_multisample(info, extensions)?,
            depth_stencil: bake_depth_stencil(info, subpass)?,
            color_blend: bake_color_blend(info, subpass)?,
            dynamic_states: (!info.dynamic_states.is_empty()).then(|| info.dynamic_states.clone()),
            layout: entry.layout.handle(),
            render_pass: info.render_pass.handle(),
            subpass: info.subpass,
            base,
        })
    }
}

impl PipelineKind for GraphicsPipelines {
    type CreateInfo = GraphicsPipelineCreateInfo;

    const OBJECT_KIND: ObjectKind = ObjectKind::GraphicsPipeline;

    fn common(info: &GraphicsPipelineCreateInfo) -> &PipelineCommonInfo {
        &info.common
    }

    fn common_mut(info: &mut GraphicsPipelineCreateInfo) -> &mut PipelineCommonInfo {
        &mut info.common
    }

    fn create_pipelines(
        context: &DeviceContext,
        cache: &PipelineCache,
        batch: &[BatchEntry<'_, GraphicsPipelineCreateInfo>],
    ) -> Result<Vec<CreatedPipeline>> {
        let infos = batch
            .iter()
            .map(|entry| Self::bake_info(context, entry))
            .collect::<Result<Vec<_>>>()?;

        let handles = cache
            .with_handle(|cache| context.driver().create_graphics_pipelines(cache, &infos))
            .map_err(AnvilError::Driver)?;

        log::debug!("Graphics bake: {} pipelines in 1 driver call", batch.len());
        Ok(infos
            .iter()
            .zip(handles)
            .map(|(info, handle)| CreatedPipeline {
                handle,
                base: info.base,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::device::{Device, DeviceCreateInfo};
    use crate::backend::null_driver::{NullBackend, NullDriver};
    use crate::backend::registry::ObjectRegistry;
    use crate::backend::render_pass::RenderPassCreateInfo;
    use crate::backend::shader::{ShaderModule, ShaderModuleCreateInfo};
    use crate::backend::swapchain::{Swapchain, SwapchainCreateInfo};
    use ash::vk::Handle;

    struct Fixture {
        device: Arc<Device>,
        driver: Arc<NullDriver>,
        stages: Vec<ShaderStageInfo>,
    }

    fn fixture_with(extensions: Vec<String>) -> Fixture {
        let backend = NullBackend::new();
        let device = Device::create(
            &backend,
            DeviceCreateInfo {
                extensions,
                ..DeviceCreateInfo::default()
            }
            .with_registry(ObjectRegistry::new()),
        )
        .unwrap();
        let driver = backend.last_driver().unwrap();
        let module = ShaderModule::create(
            &device,
            ShaderModuleCreateInfo::new(vec![0x0723_0203, 0x0001_0000, 0, 8, 0])
                .with_entry_point(ShaderStage::Vertex, "vs_main")
                .with_entry_point(ShaderStage::Fragment, "fs_main"),
        )
        .unwrap();
        let stages = vec![
            ShaderStageInfo::new(ShaderStage::Vertex, Arc::clone(&module), "vs_main"),
            ShaderStageInfo::new(ShaderStage::Fragment, module, "fs_main"),
        ];
        Fixture {
            device,
            driver,
            stages,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(DeviceCreateInfo::default().extensions)
    }

    /// One subpass writing color location 1 only; optional depth attachment.
    fn render_pass(device: &Device, depth: bool, swapchain: Option<Arc<Swapchain>>) -> Arc<RenderPass> {
        let mut info = RenderPassCreateInfo::new();
        if let Some(swapchain) = swapchain {
            info = info.with_swapchain(swapchain);
        }
        let color = info.add_color_attachment(
            vk::Format::B8G8R8A8_UNORM,
            vk::SampleCountFlags::TYPE_1,
            vk::AttachmentLoadOp::CLEAR,
            vk::AttachmentStoreOp::STORE,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        );
        let subpass = info.add_subpass();
        info.add_subpass_color_attachment(subpass, 1, color, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL, None)
            .unwrap();
        if depth {
            let ds = info.add_depth_stencil_attachment(
                vk::Format::D32_SFLOAT,
                vk::SampleCountFlags::TYPE_1,
                vk::AttachmentLoadOp::CLEAR,
                vk::AttachmentStoreOp::DONT_CARE,
                vk::AttachmentLoadOp::DONT_CARE,
                vk::AttachmentStoreOp::DONT_CARE,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            );
            info.set_subpass_depth_stencil_attachment(
                subpass,
                ds,
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            )
            .unwrap();
        }
        RenderPass::create(device, info).unwrap()
    }

    fn full_viewport() -> (vk::Viewport, vk::Rect2D) {
        let extent = vk::Extent2D {
            width: 64,
            height: 64,
        };
        (
            vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: 64.0,
                height: 64.0,
                min_depth: 0.0,
                max_depth: 1.0,
            },
            vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent,
            },
        )
    }

    fn bake_one(f: &Fixture, info: GraphicsPipelineCreateInfo) -> Result<GraphicsPipelineBakeInfo> {
        let manager = f.device.graphics_pipeline_manager();
        manager.add(info);
        manager.bake()?;
        Ok(f.driver.journal().graphics_batches.pop().unwrap().pop().unwrap())
    }

    #[test]
    fn blend_state_covers_every_location_up_to_the_highest() {
        let f = fixture();
        let (viewport, scissor) = full_viewport();
        let info = GraphicsPipelineCreateInfo::new(render_pass(&f.device, false, None), 0, f.stages.clone())
            .add_viewport(viewport, scissor)
            .with_blend_attachment(1, ColorBlendAttachment::alpha_blended());

        let baked = bake_one(&f, info).unwrap();
        let blend = baked.color_blend.unwrap();
        assert_eq!(blend.attachments.len(), 2);
        assert_eq!(blend.attachments[0].blend_enable, vk::FALSE);
        assert_eq!(blend.attachments[0].color_write_mask, vk::ColorComponentFlags::RGBA);
        assert_eq!(blend.attachments[1].blend_enable, vk::TRUE);
        assert!(baked.depth_stencil.is_none());
        assert!(baked.tessellation.is_none());
        assert!(baked.dynamic_states.is_none());
    }

    #[test]
    fn depth_testing_without_a_depth_attachment_is_rejected() {
        let f = fixture();
        let (viewport, scissor) = full_viewport();
        let info = GraphicsPipelineCreateInfo::new(render_pass(&f.device, false, None), 0, f.stages.clone())
            .add_viewport(viewport, scissor)
            .with_depth_test(vk::CompareOp::LESS, true);

        assert!(bake_one(&f, info).is_err());
        assert_eq!(f.device.graphics_pipeline_manager().outstanding_count(), 1);
    }

    #[test]
    fn rasterizer_discard_drops_later_state() {
        let f = fixture();
        let info = GraphicsPipelineCreateInfo::new(render_pass(&f.device, true, None), 0, f.stages.clone())
            .with_rasterizer_discard(true);

        let baked = bake_one(&f, info).unwrap();
        assert!(baked.viewport.is_none());
        assert!(baked.multisample.is_none());
        assert!(baked.color_blend.is_none());
        assert!(baked.depth_stencil.is_some());
    }

    #[test]
    fn viewport_is_synthesized_from_the_swapchain() {
        let f = fixture();
        let extent = vk::Extent2D {
            width: 800,
            height: 600,
        };
        let swapchain = Swapchain::create(
            &f.device,
            SwapchainCreateInfo::new(
                vk::SwapchainKHR::from_raw(3),
                vk::Format::B8G8R8A8_UNORM,
                extent,
                vec![vk::Image::from_raw(11)],
            ),
        )
        .unwrap();
        let info = GraphicsPipelineCreateInfo::new(
            render_pass(&f.device, false, Some(swapchain)),
            0,
            f.stages.clone(),
        );

        let viewport = bake_one(&f, info).unwrap().viewport.unwrap();
        assert_eq!(viewport.viewport_count, 1);
        assert_eq!(viewport.viewports[0].width, 800.0);
        assert_eq!(viewport.viewports[0].max_depth, 1.0);
        assert_eq!(viewport.scissors[0].extent, extent);
    }

    #[test]
    fn dynamic_viewports_keep_only_the_count() {
        let f = fixture();
        let info = GraphicsPipelineCreateInfo::new(render_pass(&f.device, false, None), 0, f.stages.clone())
            .enable_dynamic_state(vk::DynamicState::VIEWPORT)
            .enable_dynamic_state(vk::DynamicState::SCISSOR);

        let baked = bake_one(&f, info).unwrap();
        let viewport = baked.viewport.unwrap();
        assert_eq!(viewport.viewport_count, 1);
        assert!(viewport.viewports.is_empty());
        assert_eq!(baked.dynamic_states.unwrap().len(), 2);
    }

    #[test]
    fn attributes_collapse_onto_shared_bindings() {
        let f = fixture();
        let (viewport, scissor) = full_viewport();
        let info = GraphicsPipelineCreateInfo::new(render_pass(&f.device, false, None), 0, f.stages.clone())
            .add_viewport(viewport, scissor)
            .add_vertex_attribute(VertexAttribute::new(0, vk::Format::R32G32B32_SFLOAT, 0, 24))
            .add_vertex_attribute(VertexAttribute::new(1, vk::Format::R32G32B32_SFLOAT, 12, 24))
            .add_vertex_attribute(VertexAttribute::new(2, vk::Format::R32G32_SFLOAT, 0, 8).with_binding(0))
            .add_vertex_attribute(VertexAttribute::new(3, vk::Format::R32_UINT, 0, 4).per_instance(2));

        let input = bake_one(&f, info).unwrap().vertex_input;
        let binding_of = |location: u32| {
            input
                .attributes
                .iter()
                .find(|a| a.location == location)
                .unwrap()
                .binding
        };
        assert_eq!(binding_of(0), binding_of(1));
        assert_eq!(binding_of(2), 0);
        assert_ne!(binding_of(0), 0);
        assert_ne!(binding_of(3), binding_of(0));
        assert_eq!(input.bindings.len(), 3);
        assert_eq!(input.divisors.len(), 1);
        assert_eq!(input.divisors[0].divisor, 2);
    }

    #[test]
    fn extension_features_need_the_extension_unless_default() {
        let f = fixture_with(Vec::new());
        let (viewport, scissor) = full_viewport();
        let base = GraphicsPipelineCreateInfo::new(render_pass(&f.device, false, None), 0, f.stages.clone())
            .add_viewport(viewport, scissor);

        let mut implicit_clip = base.clone();
        implicit_clip.depth_clip_enable = Some(true);
        let baked = bake_one(&f, implicit_clip).unwrap();
        assert!(baked.rasterization.depth_clip_enable.is_none());
        assert!(baked.rasterization.rasterization_order.is_none());

        let mut relaxed = base.clone();
        relaxed.rasterization_order = vk::RasterizationOrderAMD::RELAXED;
        let err = bake_one(&f, relaxed).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AnvilError>(),
            Some(AnvilError::UnsupportedFeature { .. })
        ));
    }

    #[test]
    fn sample_mask_is_only_set_when_toggled() {
        let f = fixture();
        let (viewport, scissor) = full_viewport();
        let rp = render_pass(&f.device, false, None);

        let plain = GraphicsPipelineCreateInfo::new(Arc::clone(&rp), 0, f.stages.clone())
            .add_viewport(viewport, scissor);
        let masked = plain.clone().with_sample_mask(0b1);

        assert_eq!(bake_one(&f, plain).unwrap().multisample.unwrap().sample_mask, None);
        assert_eq!(bake_one(&f, masked).unwrap().multisample.unwrap().sample_mask, Some(1));
    }

    #[test]
    fn whole_batch_goes_out_in_one_call() {
        let f = fixture();
        let (viewport, scissor) = full_viewport();
        let rp = render_pass(&f.device, false, None);
        let manager = f.device.graphics_pipeline_manager();

        let info = GraphicsPipelineCreateInfo::new(rp, 0, f.stages.clone()).add_viewport(viewport, scissor);
        let ids: Vec<_> = (0..3).map(|_| manager.add(info.clone())).collect();
        manager.bake().unwrap();

        assert_eq!(f.driver.journal().graphics_batches.len(), 1);
        assert!(ids.iter().all(|id| manager.is_baked(*id)));
    }
}
