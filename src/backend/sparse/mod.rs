// Sparse residency bookkeeping
//
// page_tracker: byte-range bindings of opaque sparse resources
// occupancy: per-aspect tile grids and mip tails of resident sparse images
// binding: batched bind submissions and their application to the trackers

pub mod binding;
pub mod occupancy;
pub mod page_tracker;

use ash::vk;
use std::sync::{Arc, Weak};

use super::memory::MemoryBlock;

pub use self::binding::SparseMemoryBindingUpdateInfo;
pub use self::occupancy::SparseImageOccupancy;
pub use self::page_tracker::PageTracker;

/// A memory block referenced by a sparse binding.
///
/// Owned blocks live as long as some page or tile still points at them.
/// Borrowed blocks belong to someone else; once they are gone the range
/// reads as unbound.
#[derive(Clone, Debug)]
pub enum BlockRef {
    Owned(Arc<MemoryBlock>),
    Borrowed(Weak<MemoryBlock>),
}

impl BlockRef {
    pub fn new(block: &Arc<MemoryBlock>, owned: bool) -> Self {
        if owned {
            BlockRef::Owned(Arc::clone(block))
        } else {
            BlockRef::Borrowed(Arc::downgrade(block))
        }
    }

    pub fn upgrade(&self) -> Option<Arc<MemoryBlock>> {
        match self {
            BlockRef::Owned(block) => Some(Arc::clone(block)),
            BlockRef::Borrowed(block) => block.upgrade(),
        }
    }

    pub fn is_alive(&self) -> bool {
        match self {
            BlockRef::Owned(_) => true,
            BlockRef::Borrowed(block) => block.strong_count() > 0,
        }
    }

    fn as_ptr(&self) -> *const MemoryBlock {
        match self {
            BlockRef::Owned(block) => Arc::as_ptr(block),
            BlockRef::Borrowed(block) => block.as_ptr(),
        }
    }

    /// Same block with the same ownership.
    pub fn same_as(&self, other: &BlockRef) -> bool {
        matches!(
            (self, other),
            (BlockRef::Owned(_), BlockRef::Owned(_)) | (BlockRef::Borrowed(_), BlockRef::Borrowed(_))
        ) && std::ptr::eq(self.as_ptr(), other.as_ptr())
    }
}

/// Memory behind one page range or tile.
#[derive(Clone, Debug)]
pub struct SparseBinding {
    pub block: BlockRef,
    /// Relative to the start of `block`.
    pub memory_offset: vk::DeviceSize,
}

impl SparseBinding {
    pub fn is_bound(&self) -> bool {
        self.block.is_alive()
    }
}
