// Property tests for registry bookkeeping, caching, pipeline baking and
// sparse residency tracking.

use anvil::backend::driver::{BaseReference, DescriptorBindingDesc};
use anvil::backend::layout::{DescriptorSetLayout, PushConstantRange};
use anvil::backend::object::ObjectIdentity;
use anvil::backend::pipeline::compute::ComputePipelineCreateInfo;
use anvil::backend::pipeline::{PipelineId, ShaderStageInfo};
use anvil::backend::shader::{ShaderModule, ShaderModuleCreateInfo, ShaderStage};
use anvil::backend::sparse::{BlockRef, PageTracker, SparseBinding, SparseImageOccupancy};
use anvil::backend::{Device, DeviceCreateInfo, MemoryBlock, NullBackend, ObjectKind, ObjectRegistry};
use ash::vk;
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;

const PAGE: vk::DeviceSize = 0x10000;
const SPIRV_MAGIC: u32 = 0x0723_0203;

fn device() -> Arc<Device> {
    Device::create(
        &NullBackend::new(),
        DeviceCreateInfo::default().with_registry(ObjectRegistry::new()),
    )
    .unwrap()
}

fn block(device: &Arc<Device>, pages: u64) -> Arc<MemoryBlock> {
    MemoryBlock::create(
        device,
        "pages",
        vk::MemoryRequirements {
            size: pages * PAGE,
            alignment: PAGE,
            memory_type_bits: 1,
        },
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
        false,
    )
    .unwrap()
}

fn compute_stage(device: &Arc<Device>) -> ShaderStageInfo {
    let module = ShaderModule::create(
        device,
        ShaderModuleCreateInfo::new(vec![SPIRV_MAGIC, 0x0001_0000, 0, 4, 0])
            .with_entry_point(ShaderStage::Compute, "main"),
    )
    .unwrap();
    ShaderStageInfo::new(ShaderStage::Compute, module, "main")
}

fn dedup_in_order(indices: Vec<usize>) -> Vec<usize> {
    let mut seen = BTreeSet::new();
    indices.into_iter().filter(|i| seen.insert(*i)).collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Live entries form a set, unregister removes exactly the named pair and
    /// indices per kind are strictly increasing and never reused.
    #[test]
    fn registry_entries_and_indices(ops in prop::collection::vec((any::<bool>(), 1usize..8), 1..64)) {
        let registry = ObjectRegistry::new();
        let kinds = [ObjectKind::Buffer, ObjectKind::Image];
        let mut live: [BTreeSet<usize>; 2] = [BTreeSet::new(), BTreeSet::new()];
        let mut handed_out: [Vec<u32>; 2] = [Vec::new(), Vec::new()];

        for (second_kind, ptr) in ops {
            let k = usize::from(second_kind);
            let kind = kinds[k];
            if live[k].contains(&ptr) {
                registry.unregister(kind, ObjectIdentity(ptr));
                live[k].remove(&ptr);
                prop_assert!(!registry.is_registered(kind, ObjectIdentity(ptr)));
            } else {
                let index = registry.register(kind, ObjectIdentity(ptr), None);
                live[k].insert(ptr);
                handed_out[k].push(index);
            }

            for (k, kind) in kinds.iter().enumerate() {
                let allocations = registry.live_allocations(*kind);
                let identities: BTreeSet<usize> = allocations.iter().map(|a| a.identity.0).collect();
                prop_assert_eq!(identities.len(), allocations.len());
                prop_assert_eq!(&identities, &live[k]);
                prop_assert!(allocations.windows(2).all(|w| w[0].index < w[1].index));
            }
        }

        for indices in &handed_out {
            let expected: Vec<u32> = (0..indices.len() as u32).collect();
            prop_assert_eq!(indices, &expected);
        }
    }

    /// The cache hands back the same module iff blob and entry points match.
    #[test]
    fn shader_cache_dedups_equal_inputs(
        first in (prop::collection::vec(any::<u32>(), 0..4), 0usize..2),
        second in (prop::collection::vec(any::<u32>(), 0..4), 0usize..2),
        reuse_first in any::<bool>(),
    ) {
        let entry_points = ["main", "cs_main"];
        let info = |(words, entry): &(Vec<u32>, usize)| {
            let mut spirv = vec![SPIRV_MAGIC];
            spirv.extend_from_slice(words);
            ShaderModuleCreateInfo::new(spirv).with_entry_point(ShaderStage::Compute, entry_points[*entry])
        };
        let second = if reuse_first { first.clone() } else { second };

        let device = device();
        let a = ShaderModule::create(&device, info(&first)).unwrap();
        let b = ShaderModule::create(&device, info(&second)).unwrap();
        prop_assert_eq!(Arc::ptr_eq(&a, &b), first == second);
    }

    /// Pipelines with equal (set layouts, push constant ranges) keys share a
    /// layout; different keys never do.
    #[test]
    fn equal_layout_keys_share_a_layout(
        sets_a in prop::collection::vec(0usize..2, 0..3),
        sets_b in prop::collection::vec(0usize..2, 0..3),
        ranges_a in prop::collection::vec(0usize..3, 0..3),
        ranges_b in prop::collection::vec(0usize..3, 0..3),
    ) {
        let device = device();
        let dsls: Vec<Arc<DescriptorSetLayout>> = [vk::DescriptorType::STORAGE_BUFFER, vk::DescriptorType::UNIFORM_BUFFER]
            .iter()
            .map(|ty| {
                device
                    .descriptor_set_layout_manager()
                    .get_or_create(vec![DescriptorBindingDesc {
                        binding: 0,
                        descriptor_type: *ty,
                        descriptor_count: 1,
                        stage_flags: vk::ShaderStageFlags::COMPUTE,
                    }])
                    .unwrap()
            })
            .collect();
        let pool = [
            PushConstantRange::new(0, 16, vk::ShaderStageFlags::COMPUTE),
            PushConstantRange::new(16, 16, vk::ShaderStageFlags::COMPUTE),
            PushConstantRange::new(32, 8, vk::ShaderStageFlags::COMPUTE),
        ];
        let ranges_a = dedup_in_order(ranges_a);
        let ranges_b = dedup_in_order(ranges_b);

        let stage = compute_stage(&device);
        let manager = device.compute_pipeline_manager();
        let add = |sets: &[usize], ranges: &[usize]| {
            let mut info = ComputePipelineCreateInfo::new(stage.clone())
                .with_set_layouts(sets.iter().map(|s| Arc::clone(&dsls[*s])).collect());
            for r in ranges {
                info = info.with_push_constant_range(pool[*r]);
            }
            manager.add(info)
        };
        let p1 = add(&sets_a, &ranges_a);
        let p2 = add(&sets_b, &ranges_b);

        let sorted = |ranges: &[usize]| ranges.iter().copied().collect::<BTreeSet<_>>();
        let same_key = sets_a == sets_b && sorted(&ranges_a) == sorted(&ranges_b);

        let l1 = manager.get_layout(p1).unwrap();
        let l2 = manager.get_layout(p2).unwrap();
        prop_assert_eq!(Arc::ptr_eq(&l1, &l2), same_key);
    }

    /// After bake every derivative names its parent exactly once, the parent
    /// is baked, and a second bake changes nothing.
    #[test]
    fn bake_resolves_derivatives_and_is_idempotent(
        parents in prop::collection::vec(any::<Option<prop::sample::Index>>(), 1..7),
        split in any::<prop::sample::Index>(),
    ) {
        let backend = NullBackend::new();
        let device = Device::create(&backend, DeviceCreateInfo::default().with_registry(ObjectRegistry::new())).unwrap();
        let driver = backend.last_driver().unwrap();
        let stage = compute_stage(&device);
        let manager = device.compute_pipeline_manager();

        let split = split.index(parents.len() + 1);
        let mut ids: Vec<PipelineId> = Vec::new();
        let mut declared: Vec<Option<PipelineId>> = Vec::new();
        let mut rounds: Vec<Vec<PipelineId>> = vec![Vec::new(), Vec::new()];

        for (i, parent) in parents.iter().enumerate() {
            if i == split {
                manager.bake().unwrap();
            }
            let parent = match parent {
                Some(index) if i > 0 => Some(ids[index.index(i)]),
                _ => None,
            };
            let mut info = ComputePipelineCreateInfo::new(stage.clone()).with_allow_derivatives(true);
            if let Some(parent) = parent {
                info = info.with_base_pipeline(parent);
            }
            let id = manager.add(info);
            ids.push(id);
            declared.push(parent);
            rounds[usize::from(i >= split)].push(id);
        }
        manager.bake().unwrap();

        for (id, parent) in ids.iter().zip(&declared) {
            prop_assert!(manager.is_baked(*id));
            let base = manager.base_reference(*id).unwrap();
            match (parent, base) {
                (None, BaseReference::None) => {}
                (Some(parent), BaseReference::Handle(handle)) => {
                    prop_assert!(manager.is_baked(*parent));
                    prop_assert_eq!(manager.get_pipeline_handle(*parent).unwrap(), handle);
                }
                (Some(parent), BaseReference::Index(pos)) => {
                    prop_assert!(manager.is_baked(*parent));
                    let round = rounds.iter().find(|r| r.contains(id)).unwrap();
                    prop_assert_eq!(round[pos as usize], *parent);
                }
                (parent, base) => prop_assert!(false, "parent {:?} resolved as {:?}", parent, base),
            }
        }

        let batches = driver.journal().compute_batches.len();
        let live = driver.live_pipeline_count();
        manager.bake().unwrap();
        prop_assert_eq!(driver.journal().compute_batches.len(), batches);
        prop_assert_eq!(driver.live_pipeline_count(), live);
        prop_assert_eq!(manager.baked_count(), ids.len());
    }

    /// Texels of an updated tile region read bound iff the update carried
    /// memory; unbinding the whole mip tail clears every tail page.
    #[test]
    fn tile_updates_round_trip(
        mip in 0u32..3,
        region in (any::<prop::sample::Index>(), any::<prop::sample::Index>(), any::<prop::sample::Index>(), any::<prop::sample::Index>()),
        prebound in any::<bool>(),
        bind in any::<bool>(),
        texel in (any::<prop::sample::Index>(), any::<prop::sample::Index>()),
    ) {
        const TILE: u32 = 128;
        let extent = vk::Extent3D { width: 512, height: 512, depth: 1 };
        // Mips 0..3 are tiled (16 + 4 + 1 tiles), the tail starts at mip 3.
        let tail_offset = 21 * PAGE;
        let tail_size = 2 * PAGE;
        let requirements = [vk::SparseImageMemoryRequirements {
            format_properties: vk::SparseImageFormatProperties {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                image_granularity: vk::Extent3D { width: TILE, height: TILE, depth: 1 },
                flags: vk::SparseImageFormatFlags::empty(),
            },
            image_mip_tail_first_lod: 3,
            image_mip_tail_size: tail_size,
            image_mip_tail_offset: tail_offset,
            image_mip_tail_stride: 0,
        }];
        let mut occupancy = SparseImageOccupancy::new(extent, 4, 1, PAGE, &requirements);

        let device = device();
        let a = block(&device, 16);
        let b = block(&device, 16);
        let binding = |block: &Arc<MemoryBlock>| SparseBinding { block: BlockRef::new(block, true), memory_offset: 0 };

        let dim = 512 >> mip;
        let tiles = dim / TILE;
        let subresource = vk::ImageSubresource { aspect_mask: vk::ImageAspectFlags::COLOR, mip_level: mip, array_layer: 0 };
        if prebound {
            occupancy
                .update_tiles(subresource, vk::Offset3D::default(), vk::Extent3D { width: dim, height: dim, depth: 1 }, Some(binding(&a)))
                .unwrap();
        }

        let tx = region.0.index(tiles as usize) as u32;
        let ty = region.1.index(tiles as usize) as u32;
        let tw = 1 + region.2.index((tiles - tx) as usize) as u32;
        let th = 1 + region.3.index((tiles - ty) as usize) as u32;
        let offset = vk::Offset3D { x: (tx * TILE) as i32, y: (ty * TILE) as i32, z: 0 };
        let size = vk::Extent3D { width: tw * TILE, height: th * TILE, depth: 1 };
        occupancy
            .update_tiles(subresource, offset, size, if bind { Some(binding(&b)) } else { None })
            .unwrap();

        let x = texel.0.index(dim as usize) as u32;
        let y = texel.1.index(dim as usize) as u32;
        let inside = x >= tx * TILE && x < (tx + tw) * TILE && y >= ty * TILE && y < (ty + th) * TILE;
        let expected = if inside { bind } else { prebound };
        prop_assert_eq!(
            occupancy.is_memory_bound_for_texel(vk::ImageAspectFlags::COLOR, 0, mip, x, y, 0),
            expected
        );
        let corner = (offset.x as u32 + size.width - 1, offset.y as u32 + size.height - 1);
        prop_assert_eq!(
            occupancy.is_memory_bound_for_texel(vk::ImageAspectFlags::COLOR, 0, mip, corner.0, corner.1, 0),
            bind
        );

        occupancy
            .update_opaque(tail_offset, tail_size, vk::SparseMemoryBindFlags::empty(), Some(binding(&a)))
            .unwrap();
        prop_assert!(occupancy.is_mip_tail_bound(vk::ImageAspectFlags::COLOR, 0));
        occupancy
            .update_opaque(tail_offset, tail_size, vk::SparseMemoryBindFlags::empty(), None)
            .unwrap();
        prop_assert!(!occupancy.is_mip_tail_bound(vk::ImageAspectFlags::COLOR, 0));
        prop_assert_eq!(occupancy.bound_tail_pages(vk::ImageAspectFlags::COLOR, 0), 0);
        prop_assert!(!occupancy.is_memory_bound_for_texel(vk::ImageAspectFlags::COLOR, 0, 3, 0, 0, 0));
    }

    /// The tracker's ranges stay sorted and disjoint, and cover exactly the
    /// pages the last bind of each page left backed, at the right memory.
    #[test]
    fn page_tracker_matches_a_page_model(
        ops in prop::collection::vec(
            (any::<prop::sample::Index>(), any::<prop::sample::Index>(), prop::option::of(0usize..2), 0u64..4),
            1..24,
        ),
    ) {
        const PAGES: u64 = 16;
        let device = device();
        let blocks = [block(&device, 2 * PAGES), block(&device, 2 * PAGES)];
        let mut tracker = PageTracker::new(PAGES * PAGE, PAGE);
        let mut model: Vec<Option<(usize, vk::DeviceSize)>> = vec![None; PAGES as usize];

        for (start, len, memory, memory_page) in ops {
            let start = start.index(PAGES as usize) as u64;
            let len = 1 + len.index((PAGES - start) as usize) as u64;
            let binding = memory.map(|m| SparseBinding {
                block: BlockRef::new(&blocks[m], false),
                memory_offset: memory_page * PAGE,
            });
            tracker.update(start * PAGE, len * PAGE, binding).unwrap();
            for page in start..start + len {
                model[page as usize] = memory.map(|m| (m, (memory_page + page - start) * PAGE));
            }

            let ranges = tracker.bound_ranges();
            prop_assert!(ranges
                .windows(2)
                .all(|w| w[0].resource_offset + w[0].size <= w[1].resource_offset));

            let mut covered = vec![None; PAGES as usize];
            for range in &ranges {
                let owner = range.binding.block.upgrade().unwrap();
                let m = blocks.iter().position(|b| Arc::ptr_eq(b, &owner)).unwrap();
                for page in range.resource_offset / PAGE..(range.resource_offset + range.size) / PAGE {
                    let delta = page * PAGE - range.resource_offset;
                    covered[page as usize] = Some((m, range.binding.memory_offset + delta));
                }
            }
            prop_assert_eq!(&covered, &model);
            prop_assert_eq!(
                tracker.bound_bytes(),
                model.iter().filter(|p| p.is_some()).count() as u64 * PAGE
            );
        }
    }
}
