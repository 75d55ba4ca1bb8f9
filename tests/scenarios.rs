// End-to-end scenarios on the in-process null driver.

use anvil::backend::driver::BaseReference;
use anvil::backend::layout::PushConstantRange;
use anvil::backend::memory::{MemoryCallbackId, MemoryEvent, MemoryResource};
use anvil::backend::object::ObjectIdentity;
use anvil::backend::registry::RegistryCallbackId;
use anvil::backend::pipeline::compute::ComputePipelineCreateInfo;
use anvil::backend::pipeline::graphics::GraphicsPipelineCreateInfo;
use anvil::backend::pipeline::ShaderStageInfo;
use anvil::backend::render_pass::{RenderPass, RenderPassCreateInfo};
use anvil::backend::shader::{ShaderModule, ShaderModuleCreateInfo, ShaderStage};
use anvil::backend::{
    Device, DeviceCreateInfo, Image, ImageCreateInfo, MemoryBlock, NullBackend, ObjectKind, ObjectRegistry,
    SparseMemoryBindingUpdateInfo, SparseResidencyScope,
};
use ash::vk;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const BLOB: [u32; 5] = [0x0723_0203, 0x0001_0000, 0, 8, 0];

fn device() -> Arc<Device> {
    Device::create(
        &NullBackend::new(),
        DeviceCreateInfo::default().with_registry(ObjectRegistry::new()),
    )
    .unwrap()
}

fn extent(width: u32, height: u32) -> vk::Extent3D {
    vk::Extent3D { width, height, depth: 1 }
}

#[test]
fn leaks_are_reported_in_index_order() {
    let registry = ObjectRegistry::new();
    let kind = ObjectKind::GraphicsPipeline;

    let indices: Vec<u32> = [0xA, 0xB, 0xC]
        .iter()
        .map(|p| registry.register(kind, ObjectIdentity(*p), None))
        .collect();
    assert_eq!(indices, vec![0, 1, 2]);

    registry.unregister(kind, ObjectIdentity(0xB));
    let leaks = registry.check_for_leaks();
    let leaked: Vec<(ObjectKind, usize, u32)> = leaks
        .iter()
        .map(|(k, a)| (*k, a.identity.0, a.index))
        .collect();
    assert_eq!(leaked, vec![(kind, 0xA, 0), (kind, 0xC, 2)]);

    assert_eq!(registry.register(kind, ObjectIdentity(0xD), None), 3);
}

#[test]
fn identical_compute_pipelines_share_one_layout() {
    let device = device();
    let module = ShaderModule::create(
        &device,
        ShaderModuleCreateInfo::new(BLOB.to_vec()).with_entry_point(ShaderStage::Compute, "main"),
    )
    .unwrap();
    let stage = ShaderStageInfo::new(ShaderStage::Compute, module, "main");
    let push = PushConstantRange::new(0, 16, vk::ShaderStageFlags::COMPUTE);

    let manager = device.compute_pipeline_manager();
    let a = manager.add(ComputePipelineCreateInfo::new(stage.clone()).with_push_constant_range(push));
    let b = manager.add(ComputePipelineCreateInfo::new(stage).with_push_constant_range(push));

    let handle_a = manager.get_pipeline_handle(a).unwrap();
    let handle_b = manager.get_pipeline_handle(b).unwrap();
    assert_ne!(handle_a, handle_b);

    let layout_a = manager.get_layout(a).unwrap();
    let layout_b = manager.get_layout(b).unwrap();
    assert!(Arc::ptr_eq(&layout_a, &layout_b));
    assert_eq!(device.pipeline_layout_manager().live_count(), 1);
}

#[test]
fn derivative_chain_bakes_in_one_pass() {
    let device = device();
    let module = ShaderModule::create(
        &device,
        ShaderModuleCreateInfo::new(BLOB.to_vec())
            .with_entry_point(ShaderStage::Vertex, "vs_main")
            .with_entry_point(ShaderStage::Fragment, "fs_main"),
    )
    .unwrap();
    let stages = vec![
        ShaderStageInfo::new(ShaderStage::Vertex, Arc::clone(&module), "vs_main"),
        ShaderStageInfo::new(ShaderStage::Fragment, module, "fs_main"),
    ];

    let mut pass = RenderPassCreateInfo::new();
    let color = pass.add_color_attachment(
        vk::Format::B8G8R8A8_UNORM,
        vk::SampleCountFlags::TYPE_1,
        vk::AttachmentLoadOp::CLEAR,
        vk::AttachmentStoreOp::STORE,
        vk::ImageLayout::UNDEFINED,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    );
    let subpass = pass.add_subpass();
    pass.add_subpass_color_attachment(subpass, 0, color, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL, None)
        .unwrap();
    let render_pass = RenderPass::create(&device, pass).unwrap();

    let base = GraphicsPipelineCreateInfo::new(render_pass, 0, stages)
        .enable_dynamic_state(vk::DynamicState::VIEWPORT)
        .enable_dynamic_state(vk::DynamicState::SCISSOR)
        .with_allow_derivatives(true);

    let manager = device.graphics_pipeline_manager();
    let p0 = manager.add(base.clone());
    let p1 = manager.add(base.clone().with_base_pipeline(p0));
    let p2 = manager.add(base.with_base_pipeline(p1));

    manager.bake().unwrap();

    for id in [p0, p1, p2] {
        assert!(manager.is_baked(id));
    }
    assert_eq!(manager.outstanding_count(), 0);
    assert_eq!(manager.base_reference(p0), Some(BaseReference::None));
    assert_eq!(manager.base_reference(p1), Some(BaseReference::Index(0)));
    assert_eq!(manager.base_reference(p2), Some(BaseReference::Index(1)));
}

#[test]
fn identical_shader_modules_hit_the_cache() {
    let device = device();
    let info = || ShaderModuleCreateInfo::new(BLOB.to_vec()).with_entry_point(ShaderStage::Compute, "main");

    let first = ShaderModule::create(&device, info()).unwrap();
    let second = ShaderModule::create(&device, info()).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.handle(), second.handle());
    assert_eq!(device.shader_module_cache().unwrap().len(), 1);
}

#[test]
fn sparse_tiles_report_texel_residency() {
    let device = device();
    let image = Image::create(ImageCreateInfo::create_sparse_no_alloc(
        &device,
        "virtual texture",
        vk::Format::R8G8B8A8_UNORM,
        extent(256, 256),
        vk::ImageUsageFlags::SAMPLED,
        SparseResidencyScope::NonAliased,
    ))
    .unwrap();
    let granularity = image
        .sparse_occupancy()
        .unwrap()
        .aspect(vk::ImageAspectFlags::COLOR)
        .unwrap()
        .granularity();
    assert_eq!(granularity, extent(128, 128));

    let page = image.memory_requirements().alignment;
    let block = MemoryBlock::create(
        &device,
        "M",
        vk::MemoryRequirements {
            size: page,
            alignment: page,
            memory_type_bits: 1,
        },
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
        false,
    )
    .unwrap();

    let mut update = SparseMemoryBindingUpdateInfo::new();
    let batch = update.add_bind_batch(&[], &[]);
    update
        .append_image_memory_update(
            batch,
            &image,
            vk::ImageSubresource {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                array_layer: 0,
            },
            vk::Offset3D::default(),
            extent(128, 128),
            Some(&block),
            0,
            false,
        )
        .unwrap();
    let queue = Arc::clone(device.sparse_binding_queues()[0]);
    queue.bind_sparse_memory(&mut update).unwrap();

    let bound = |x, y| image.is_memory_bound_for_texel(vk::ImageAspectFlags::COLOR, 0, 0, x, y, 0);
    assert!(bound(0, 0));
    assert!(bound(127, 127));
    assert!(!bound(128, 0));
    assert!(!bound(128, 128));

    // The tile only borrows the block.
    drop(block);
    assert!(!bound(0, 0));
}

#[test]
fn first_use_asks_for_memory_exactly_once() {
    let device = device();
    let image = Image::create(ImageCreateInfo::create_nonsparse_no_alloc(
        &device,
        "lazy",
        vk::Format::R8G8B8A8_UNORM,
        extent(64, 64),
        vk::ImageUsageFlags::SAMPLED,
    ))
    .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let installed: Arc<Mutex<Option<Arc<MemoryBlock>>>> = Arc::new(Mutex::new(None));
    {
        let calls = Arc::clone(&calls);
        let installed = Arc::clone(&installed);
        let device = Arc::clone(&device);
        image.subscribe(MemoryCallbackId::MemoryBlockNeeded, move |event| {
            let MemoryEvent::MemoryBlockNeeded {
                resource: MemoryResource::Image(image),
            } = event
            else {
                return;
            };
            calls.fetch_add(1, Ordering::SeqCst);
            let block = MemoryBlock::create(
                &device,
                "lazy",
                image.memory_requirements(),
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                false,
            )
            .unwrap();
            image.set_memory(Arc::clone(&block)).unwrap();
            *installed.lock() = Some(block);
        });
    }

    let handle = image.get_image();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let installed_block = installed.lock().clone().unwrap();
    assert!(Arc::ptr_eq(&image.get_memory_block().unwrap(), &installed_block));

    assert_eq!(image.get_image(), handle);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn registry_observers_may_reenter_a_baking_manager() {
    let device = device();
    let seen = Arc::new(Mutex::new(Vec::new()));

    for kind in ObjectKind::ALL {
        let weak = Arc::downgrade(&device);
        let seen = Arc::clone(&seen);
        device.registry().subscribe(RegistryCallbackId::Registered(kind), move |_| {
            if let Some(device) = weak.upgrade() {
                let manager = device.compute_pipeline_manager();
                seen.lock().push((kind, manager.outstanding_count()));
            }
        });
    }

    let module = ShaderModule::create(
        &device,
        ShaderModuleCreateInfo::new(BLOB.to_vec()).with_entry_point(ShaderStage::Compute, "main"),
    )
    .unwrap();
    let manager = device.compute_pipeline_manager();
    let id = manager.add(ComputePipelineCreateInfo::new(ShaderStageInfo::new(
        ShaderStage::Compute,
        module,
        "main",
    )));
    manager.get_pipeline_handle(id).unwrap();

    // The layout is registered mid-bake, while the pipeline is still outstanding.
    let seen = seen.lock().clone();
    assert!(seen.contains(&(ObjectKind::PipelineLayout, 1)));
    assert!(manager.is_baked(id));
    assert_eq!(manager.outstanding_count(), 0);
}
