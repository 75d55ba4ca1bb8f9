// =============================================================================
// ANVIL PROBE - device bring-up smoke test
// =============================================================================
//
// Creates a device from anvil.toml, prints what the queue planner made of
// the physical device, persists the pipeline cache and reports leaked
// objects on the way out.
//
// Usage: anvil-probe [--null]
//   --null   run against the in-process null driver instead of Vulkan
//
// =============================================================================

use anvil::backend::device::{QueueFamilyBuckets, QueueFamilyType};
use anvil::backend::driver::Backend;
use anvil::backend::{AshBackend, Device, DeviceCreateInfo, NullBackend, ObjectRegistry};
use anvil::config::AnvilConfig;
use anyhow::{Context, Result};
use std::sync::Arc;

const FAMILY_TYPES: [QueueFamilyType; 3] = [
    QueueFamilyType::Universal,
    QueueFamilyType::Compute,
    QueueFamilyType::Transfer,
];

fn main() -> Result<()> {
    let config = AnvilConfig::load();
    init_logging(&config);
    log::info!("Starting anvil probe");

    let use_null = std::env::args().skip(1).any(|arg| arg == "--null");
    let backend: Box<dyn Backend> = if use_null {
        Box::new(NullBackend::new())
    } else {
        Box::new(AshBackend::new(
            &config.device.app_name,
            config.device.validation_layers,
        )?)
    };

    let physical_devices = backend.physical_devices()?;
    for device in &physical_devices {
        log::info!(
            "[{}] {} ({:?}), {} queue families",
            device.index,
            device.name,
            device.device_type,
            device.queue_families.len()
        );
        let buckets = QueueFamilyBuckets::classify(&device.queue_families);
        for family_type in FAMILY_TYPES {
            log::info!("    {:?}: families {:?}", family_type, buckets.families(family_type));
        }
    }

    let registry = ObjectRegistry::acquire();
    let info = DeviceCreateInfo::from_config(&config)?.with_registry(Arc::clone(&registry));
    let device = Device::create(backend.as_ref(), info).context("Device creation failed")?;

    print_queues(&device);

    if let Some(path) = &config.device.pipeline_cache_path {
        if let Err(e) = device.pipeline_cache().save_to(path) {
            log::warn!("Pipeline cache not saved: {:#}", e);
        }
    }

    device.wait_idle()?;
    drop(device);

    if config.debug.check_leaks_on_exit {
        let leaks = registry.check_for_leaks();
        if leaks.is_empty() {
            log::info!("No leaked objects");
        }
    }
    ObjectRegistry::release(registry);

    Ok(())
}

fn init_logging(config: &AnvilConfig) {
    use env_logger::Builder;

    let mut builder = Builder::from_default_env();
    builder.filter_level(config.log_level());
    builder.init();
}

fn print_queues(device: &Device) {
    for family_type in FAMILY_TYPES {
        log::info!("{:?}: {} queue(s) created", family_type, device.n_queues(family_type));
    }

    for queue in device.queues() {
        log::info!(
            "  family {} queue {}: {:?}{}{}",
            queue.family_index(),
            queue.queue_index(),
            queue.family_flags(),
            if queue.supports_sparse_binding() { ", sparse" } else { "" },
            if queue.is_protected() { ", protected" } else { "" }
        );
    }
}
