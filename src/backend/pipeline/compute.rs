// Compute pipelines
//
// Batches are split by pipeline layout and each group goes to the driver in
// one call. Derivative parents always share the child's layout, so a parent
// baked in the same batch is always in the same group.

use anyhow::{bail, Result};
use ash::vk;
use std::collections::HashMap;

use super::cache::PipelineCache;
use super::{
    BatchBase, BatchEntry, CreatedPipeline, PipelineCommonInfo, PipelineId, PipelineKind, ShaderStageInfo,
};
use crate::backend::device::DeviceContext;
use crate::backend::driver::{BaseReference, ComputePipelineBakeInfo};
use crate::backend::layout::{DescriptorSetLayout, PushConstantRange};
use crate::backend::object::ObjectKind;
use crate::backend::shader::ShaderStage;
use crate::AnvilError;
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct ComputePipelineCreateInfo {
    pub common: PipelineCommonInfo,
}

impl ComputePipelineCreateInfo {
    pub fn new(stage: ShaderStageInfo) -> Self {
        Self {
            common: PipelineCommonInfo {
                stages: vec![stage],
                ..PipelineCommonInfo::default()
            },
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

    pub fn with_flags(mut self, flags: vk::PipelineCreateFlags) -> Self {
        self.common.flags = flags;
        self
    }

    /// Mark as a proxy: kept for its state, never created on the driver.
    pub fn as_proxy(mut self) -> Self {
        self.common.proxy = true;
        self
    }
}

pub struct ComputePipelines;

impl ComputePipelines {
    fn bake_info(
        entry: &BatchEntry<'_, ComputePipelineCreateInfo>,
        base: BaseReference,
    ) -> Result<ComputePipelineBakeInfo> {
        let common = &entry.info.common;
        let [stage] = common.stages.as_slice() else {
            bail!(
                "compute pipeline {:?} needs exactly one shader stage, has {}",
                entry.id,
                common.stages.len()
            );
        };
        if stage.stage != ShaderStage::Compute {
            bail!("compute pipeline {:?} uses a {:?} shader", entry.id, stage.stage);
        }

        Ok(ComputePipelineBakeInfo {
            flags: common.create_flags(&entry.base),
            stage: stage.bake()?,
            layout: entry.layout.handle(),
            base,
        })
    }
}

impl PipelineKind for ComputePipelines {
    type CreateInfo = ComputePipelineCreateInfo;

    const OBJECT_KIND: ObjectKind = ObjectKind::ComputePipeline;

    fn common(info: &ComputePipelineCreateInfo) -> &PipelineCommonInfo {
        &info.common
    }

    fn common_mut(info: &mut ComputePipelineCreateInfo) -> &mut PipelineCommonInfo {
        &mut info.common
    }

    fn create_pipelines(
        context: &DeviceContext,
        cache: &PipelineCache,
        batch: &[BatchEntry<'_, ComputePipelineCreateInfo>],
    ) -> Result<Vec<CreatedPipeline>> {
        // Group positions by layout, keeping first-appearance order.
        let mut groups: Vec<(vk::PipelineLayout, Vec<usize>)> = Vec::new();
        let mut group_of: HashMap<vk::PipelineLayout, usize> = HashMap::new();
        for (pos, entry) in batch.iter().enumerate() {
            let layout = entry.layout.handle();
            let group = *group_of.entry(layout).or_insert_with(|| {
                groups.push((layout, Vec::new()));
                groups.len() - 1
            });
            groups[group].1.push(pos);
        }

        let mut results = vec![
            CreatedPipeline {
                handle: vk::Pipeline::null(),
                base: BaseReference::None,
            };
            batch.len()
        ];
        let mut created: Vec<vk::Pipeline> = Vec::with_capacity(batch.len());

        for (_, positions) in &groups {
            let mut infos = Vec::with_capacity(positions.len());
            for pos in positions {
                let entry = &batch[*pos];
                let base = match entry.base {
                    BatchBase::None => BaseReference::None,
                    BatchBase::Baked(handle) => BaseReference::Handle(handle),
                    BatchBase::InBatch(parent) => {
                        let local = positions.iter().position(|p| *p == parent).ok_or(
                            AnvilError::DerivativeResolution {
                                child: entry.id,
                                parent: batch[parent].id,
                                reason: "parent uses a different pipeline layout",
                            },
                        )?;
                        BaseReference::Index(local as u32)
                    }
                };
                match Self::bake_info(entry, base) {
                    Ok(info) => infos.push(info),
                    Err(e) => {
                        destroy_all(context, &created);
                        return Err(e);
                    }
                }
            }

            let result = cache.with_handle(|cache| {
                context.driver().create_compute_pipelines(cache, &infos)
            });
            match result {
                Ok(group_handles) => {
                    for ((pos, info), handle) in positions.iter().zip(&infos).zip(group_handles) {
                        results[*pos] = CreatedPipeline {
                            handle,
                            base: info.base,
                        };
                        created.push(handle);
                    }
                }
                Err(result) => {
                    destroy_all(context, &created);
                    return Err(AnvilError::Driver(result).into());
                }
            }
        }

        log::debug!(
            "Compute bake: {} pipelines in {} driver calls",
            batch.len(),
            groups.len()
        );
        Ok(results)
    }
}

fn destroy_all(context: &DeviceContext, pipelines: &[vk::Pipeline]) {
    for pipeline in pipelines {
        context.driver().destroy_pipeline(*pipeline);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::device::{Device, DeviceCreateInfo};
    use crate::backend::null_driver::{NullBackend, NullDriver};
    use crate::backend::registry::ObjectRegistry;
    use crate::backend::shader::{ShaderModule, ShaderModuleCreateInfo};
    use crate::driver_result;

    struct Fixture {
        device: Arc<Device>,
        driver: Arc<NullDriver>,
        stage: ShaderStageInfo,
    }

    fn fixture() -> Fixture {
        let backend = NullBackend::new();
        let device = Device::create(
            &backend,
            DeviceCreateInfo::default().with_registry(ObjectRegistry::new()),
        )
        .unwrap();
        let driver = backend.last_driver().unwrap();
        let module = ShaderModule::create(
            &device,
            ShaderModuleCreateInfo::new(vec![0x0723_0203, 0x0001_0000, 0, 4, 0])
                .with_entry_point(ShaderStage::Compute, "main"),
        )
        .unwrap();
        Fixture {
            device,
            driver,
            stage: ShaderStageInfo::new(ShaderStage::Compute, module, "main"),
        }
    }

    #[test]
    fn one_driver_call_per_layout() {
        let f = fixture();
        let manager = f.device.compute_pipeline_manager();
        let push = PushConstantRange::new(0, 16, vk::ShaderStageFlags::COMPUTE);

        let a = manager.add(ComputePipelineCreateInfo::new(f.stage.clone()));
        let b = manager.add(ComputePipelineCreateInfo::new(f.stage.clone()).with_push_constant_range(push));
        let c = manager.add(ComputePipelineCreateInfo::new(f.stage.clone()));

        manager.bake().unwrap();
        let journal = f.driver.journal();
        assert_eq!(journal.compute_batches.len(), 2);
        assert_eq!(journal.compute_batches[0].len(), 2);
        assert_eq!(journal.compute_batches[1].len(), 1);

        let handles: Vec<_> = [a, b, c]
            .iter()
            .map(|id| manager.get_pipeline_handle(*id).unwrap())
            .collect();
        assert_ne!(handles[0], handles[1]);
        assert_ne!(handles[0], handles[2]);
    }

    #[test]
    fn failed_group_rolls_back_earlier_groups() {
        let f = fixture();
        let manager = f.device.compute_pipeline_manager();
        let push = PushConstantRange::new(0, 4, vk::ShaderStageFlags::COMPUTE);

        let a = manager.add(ComputePipelineCreateInfo::new(f.stage.clone()));
        manager.add(ComputePipelineCreateInfo::new(f.stage.clone()).with_push_constant_range(push));

        // First group succeeds, then the second one fails.
        let driver = Arc::clone(&f.driver);
        driver.fail_pipeline_creation_after(1, vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);

        let err = manager.bake().unwrap_err();
        assert_eq!(driver_result(&err), Some(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        assert_eq!(manager.outstanding_count(), 2);
        assert_eq!(driver.live_pipeline_count(), 0);

        // Retrying succeeds once the driver recovers.
        manager.get_pipeline_handle(a).unwrap();
        assert_eq!(manager.outstanding_count(), 0);
        assert_eq!(driver.live_pipeline_count(), 2);
    }

    #[test]
    fn derivative_parent_must_allow_derivatives() {
        let f = fixture();
        let manager = f.device.compute_pipeline_manager();

        let parent = manager.add(ComputePipelineCreateInfo::new(f.stage.clone()));
        let child = manager.add(ComputePipelineCreateInfo::new(f.stage.clone()).with_base_pipeline(parent));

        let err = manager.bake().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AnvilError>(),
            Some(AnvilError::DerivativeResolution { child: c, .. }) if *c == child
        ));
    }

    #[test]
    fn baked_parent_is_referenced_by_handle() {
        let f = fixture();
        let manager = f.device.compute_pipeline_manager();

        let parent = manager.add(ComputePipelineCreateInfo::new(f.stage.clone()).with_allow_derivatives(true));
        let parent_handle = manager.get_pipeline_handle(parent).unwrap();

        let child = manager.add(manager.derive_create_info(parent).unwrap());
        manager.bake().unwrap();

        assert_eq!(
            manager.base_reference(child),
            Some(BaseReference::Handle(parent_handle))
        );
        let batch = f.driver.journal().compute_batches.pop().unwrap();
        assert!(batch[0].flags.contains(vk::PipelineCreateFlags::DERIVATIVE));
    }

    #[test]
    fn derivative_index_is_local_to_its_driver_call() {
        let f = fixture();
        let manager = f.device.compute_pipeline_manager();
        let push = PushConstantRange::new(0, 8, vk::ShaderStageFlags::COMPUTE);

        manager.add(ComputePipelineCreateInfo::new(f.stage.clone()));
        let parent = manager.add(
            ComputePipelineCreateInfo::new(f.stage.clone())
                .with_push_constant_range(push)
                .with_allow_derivatives(true),
        );
        let child = manager.add(manager.derive_create_info(parent).unwrap());
        manager.bake().unwrap();

        // The parent sits second in the bake but first in its layout group.
        let journal = f.driver.journal();
        assert_eq!(journal.compute_batches.len(), 2);
        assert_eq!(journal.compute_batches[1][1].base, BaseReference::Index(0));
        assert_eq!(manager.base_reference(child), Some(BaseReference::Index(0)));
        assert_eq!(manager.base_reference(parent), Some(BaseReference::None));
    }
}
