// Page tracker for opaque sparse bindings
//
// Keeps a sorted, non-overlapping set of bound byte ranges inside
// [0, resource_size). Binding over an existing range splits it; neighbors
// that continue the same block at contiguous memory offsets are merged.

use anyhow::{bail, Result};
use ash::vk;
use std::collections::BTreeMap;

use super::SparseBinding;

#[derive(Clone, Debug)]
struct Extent {
    size: vk::DeviceSize,
    binding: SparseBinding,
}

#[derive(Clone, Debug)]
pub struct PageTracker {
    resource_size: vk::DeviceSize,
    page_size: vk::DeviceSize,
    /// Keyed by resource offset.
    extents: BTreeMap<vk::DeviceSize, Extent>,
}

/// A bound range as seen from outside.
#[derive(Clone, Debug)]
pub struct BoundRange {
    pub resource_offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
    pub binding: SparseBinding,
}

impl PageTracker {
    pub fn new(resource_size: vk::DeviceSize, page_size: vk::DeviceSize) -> Self {
        Self {
            resource_size,
            page_size: page_size.max(1),
            extents: BTreeMap::new(),
        }
    }

    pub fn resource_size(&self) -> vk::DeviceSize {
        self.resource_size
    }

    pub fn page_size(&self) -> vk::DeviceSize {
        self.page_size
    }

    /// Offsets must be page aligned; the size too, unless the range ends at
    /// the end of the resource.
    pub fn validate(&self, offset: vk::DeviceSize, size: vk::DeviceSize) -> Result<()> {
        let end = match offset.checked_add(size) {
            Some(end) if size > 0 && end <= self.resource_size => end,
            _ => bail!(
                "range [{}, {}+{}) outside a resource of {} bytes",
                offset,
                offset,
                size,
                self.resource_size
            ),
        };
        if offset % self.page_size != 0 || (end != self.resource_size && size % self.page_size != 0) {
            bail!(
                "range [{}, {}) is not aligned to the {} byte sparse page size",
                offset,
                end,
                self.page_size
            );
        }
        Ok(())
    }

    /// Bind `[offset, offset + size)` to `binding`, or unbind it for `None`.
    pub fn update(
        &mut self,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
        binding: Option<SparseBinding>,
    ) -> Result<()> {
        self.validate(offset, size)?;
        let end = offset + size;

        self.carve(offset, end);

        if let Some(binding) = binding {
            self.extents.insert(offset, Extent { size, binding });
            self.merge_around(offset);
        }
        Ok(())
    }

    /// Remove every byte of `[start, end)` from the set, splitting extents
    /// that straddle either edge.
    fn carve(&mut self, start: vk::DeviceSize, end: vk::DeviceSize) {
        // An extent starting before `start` may reach into the range.
        if let Some((&head_start, head)) = self.extents.range(..start).next_back() {
            let head_end = head_start + head.size;
            if head_end > start {
                let head = head.clone();
                self.extents.insert(
                    head_start,
                    Extent {
                        size: start - head_start,
                        binding: head.binding.clone(),
                    },
                );
                if head_end > end {
                    self.extents.insert(
                        end,
                        Extent {
                            size: head_end - end,
                            binding: shifted(&head.binding, end - head_start),
                        },
                    );
                }
            }
        }

        let inside: Vec<vk::DeviceSize> = self.extents.range(start..end).map(|(k, _)| *k).collect();
        for key in inside {
            if let Some(extent) = self.extents.remove(&key) {
                let extent_end = key + extent.size;
                if extent_end > end {
                    self.extents.insert(
                        end,
                        Extent {
                            size: extent_end - end,
                            binding: shifted(&extent.binding, end - key),
                        },
                    );
                }
            }
        }
    }

    fn merge_around(&mut self, offset: vk::DeviceSize) {
        let mut start = offset;

        if let Some((&prev_start, prev)) = self.extents.range(..offset).next_back() {
            if let Some(current) = self.extents.get(&offset) {
                if prev_start + prev.size == offset && continues(prev, current) {
                    let size = prev.size + current.size;
                    self.extents.remove(&offset);
                    if let Some(prev) = self.extents.get_mut(&prev_start) {
                        prev.size = size;
                    }
                    start = prev_start;
                }
            }
        }

        let Some(current) = self.extents.get(&start) else {
            return;
        };
        let next_start = start + current.size;
        if let Some(next) = self.extents.get(&next_start) {
            if continues(current, next) {
                let size = current.size + next.size;
                self.extents.remove(&next_start);
                if let Some(current) = self.extents.get_mut(&start) {
                    current.size = size;
                }
            }
        }
    }

    /// True when every byte of the range is backed by live memory.
    pub fn is_bound(&self, offset: vk::DeviceSize, size: vk::DeviceSize) -> bool {
        let end = offset.saturating_add(size);
        let mut cursor = offset;

        if let Some((&start, extent)) = self.extents.range(..=offset).next_back() {
            if start + extent.size > offset && extent.binding.is_bound() {
                cursor = start + extent.size;
            }
        }
        while cursor < end {
            match self.extents.get(&cursor) {
                Some(extent) if extent.binding.is_bound() => cursor += extent.size,
                _ => return false,
            }
        }
        true
    }

    /// Binding covering the byte at `offset`.
    pub fn binding_at(&self, offset: vk::DeviceSize) -> Option<&SparseBinding> {
        self.extents
            .range(..=offset)
            .next_back()
            .filter(|(start, extent)| **start + extent.size > offset)
            .map(|(_, extent)| &extent.binding)
    }

    pub fn bound_ranges(&self) -> Vec<BoundRange> {
        self.extents
            .iter()
            .map(|(offset, extent)| BoundRange {
                resource_offset: *offset,
                size: extent.size,
                binding: extent.binding.clone(),
            })
            .collect()
    }

    pub fn bound_bytes(&self) -> vk::DeviceSize {
        self.extents.values().map(|e| e.size).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }
}

fn shifted(binding: &SparseBinding, by: vk::DeviceSize) -> SparseBinding {
    SparseBinding {
        block: binding.block.clone(),
        memory_offset: binding.memory_offset + by,
    }
}

fn continues(left: &Extent, right: &Extent) -> bool {
    left.binding.block.same_as(&right.binding.block)
        && left.binding.memory_offset + left.size == right.binding.memory_offset
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::device::{Device, DeviceCreateInfo};
    use crate::backend::memory::MemoryBlock;
    use crate::backend::null_driver::NullBackend;
    use crate::backend::registry::ObjectRegistry;
    use crate::backend::sparse::BlockRef;
    use std::sync::Arc;

    const PAGE: vk::DeviceSize = 0x1000;

    fn block(device: &Device, size: vk::DeviceSize) -> Arc<MemoryBlock> {
        MemoryBlock::create(
            device,
            "test",
            vk::MemoryRequirements {
                size,
                alignment: PAGE,
                memory_type_bits: 1,
            },
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            true,
        )
        .unwrap()
    }

    fn device() -> Arc<Device> {
        Device::create(
            &NullBackend::new(),
            DeviceCreateInfo::default().with_registry(ObjectRegistry::new()),
        )
        .unwrap()
    }

    fn bind(block: &Arc<MemoryBlock>, memory_offset: vk::DeviceSize) -> Option<SparseBinding> {
        Some(SparseBinding {
            block: BlockRef::new(block, true),
            memory_offset,
        })
    }

    #[test]
    fn unbinding_the_middle_splits_the_range() {
        let device = device();
        let memory = block(&device, 8 * PAGE);
        let mut tracker = PageTracker::new(8 * PAGE, PAGE);

        tracker.update(0, 8 * PAGE, bind(&memory, 0)).unwrap();
        tracker.update(2 * PAGE, 2 * PAGE, None).unwrap();

        let ranges = tracker.bound_ranges();
        assert_eq!(ranges.len(), 2);
        assert_eq!((ranges[0].resource_offset, ranges[0].size), (0, 2 * PAGE));
        assert_eq!((ranges[1].resource_offset, ranges[1].size), (4 * PAGE, 4 * PAGE));
        assert_eq!(ranges[1].binding.memory_offset, 4 * PAGE);
        assert!(!tracker.is_bound(PAGE, 2 * PAGE));
        assert!(tracker.is_bound(4 * PAGE, 4 * PAGE));
    }

    #[test]
    fn contiguous_binds_of_one_block_merge() {
        let device = device();
        let memory = block(&device, 4 * PAGE);
        let mut tracker = PageTracker::new(4 * PAGE, PAGE);

        tracker.update(0, PAGE, bind(&memory, 0)).unwrap();
        tracker.update(2 * PAGE, PAGE, bind(&memory, 2 * PAGE)).unwrap();
        tracker.update(PAGE, PAGE, bind(&memory, PAGE)).unwrap();

        assert_eq!(tracker.bound_ranges().len(), 1);
        assert_eq!(tracker.bound_bytes(), 3 * PAGE);
    }

    #[test]
    fn borrowed_blocks_stop_counting_once_dropped() {
        let device = device();
        let memory = block(&device, PAGE);
        let mut tracker = PageTracker::new(PAGE, PAGE);

        tracker
            .update(
                0,
                PAGE,
                Some(SparseBinding {
                    block: BlockRef::new(&memory, false),
                    memory_offset: 0,
                }),
            )
            .unwrap();
        assert!(tracker.is_bound(0, PAGE));
        drop(memory);
        assert!(!tracker.is_bound(0, PAGE));
    }

    #[test]
    fn misaligned_and_out_of_range_updates_are_rejected() {
        let tracker = PageTracker::new(4 * PAGE + 10, PAGE);
        assert!(tracker.validate(1, PAGE).is_err());
        assert!(tracker.validate(0, 5 * PAGE).is_err());
        assert!(tracker.validate(0, 0).is_err());
        // The tail page may be partial.
        assert!(tracker.validate(4 * PAGE, 10).is_ok());
    }
}
