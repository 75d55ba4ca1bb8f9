// Object identity and threading knobs shared by every wrapper
//
// Each wrapper family has an ObjectKind tag for the registry, and every
// create info carries an MtSafety switch that is resolved against the
// owning device when the wrapper is built.

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use std::fmt;
use std::sync::Arc;

/// Closed set of wrapped resource families.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectKind {
    Device,
    Queue,
    CommandPool,
    Buffer,
    Image,
    Swapchain,
    RenderPass,
    ShaderModule,
    DescriptorSetLayout,
    PipelineLayout,
    PipelineCache,
    ComputePipeline,
    GraphicsPipeline,
    MemoryBlock,
    Semaphore,
    Fence,
}

impl ObjectKind {
    pub const ALL: [ObjectKind; 16] = [
        ObjectKind::Device,
        ObjectKind::Queue,
        ObjectKind::CommandPool,
        ObjectKind::Buffer,
        ObjectKind::Image,
        ObjectKind::Swapchain,
        ObjectKind::RenderPass,
        ObjectKind::ShaderModule,
        ObjectKind::DescriptorSetLayout,
        ObjectKind::PipelineLayout,
        ObjectKind::PipelineCache,
        ObjectKind::ComputePipeline,
        ObjectKind::GraphicsPipeline,
        ObjectKind::MemoryBlock,
        ObjectKind::Semaphore,
        ObjectKind::Fence,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ObjectKind::Device => "device",
            ObjectKind::Queue => "queue",
            ObjectKind::CommandPool => "command pool",
            ObjectKind::Buffer => "buffer",
            ObjectKind::Image => "image",
            ObjectKind::Swapchain => "swapchain",
            ObjectKind::RenderPass => "render pass",
            ObjectKind::ShaderModule => "shader module",
            ObjectKind::DescriptorSetLayout => "descriptor set layout",
            ObjectKind::PipelineLayout => "pipeline layout",
            ObjectKind::PipelineCache => "pipeline cache",
            ObjectKind::ComputePipeline => "compute pipeline",
            ObjectKind::GraphicsPipeline => "graphics pipeline",
            ObjectKind::MemoryBlock => "memory block",
            ObjectKind::Semaphore => "semaphore",
            ObjectKind::Fence => "fence",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Opaque identity of a live wrapper.
///
/// Only ever compared, never dereferenced: by the time an about-to-be-unregistered
/// notification is delivered the object may already be half torn down.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectIdentity(pub usize);

impl ObjectIdentity {
    /// Identity of the value an `Arc` points to. Matches `of_ref` on `&*arc`.
    pub fn of_arc<T>(arc: &Arc<T>) -> Self {
        Self(Arc::as_ptr(arc) as *const () as usize)
    }

    pub fn of_ref<T>(value: &T) -> Self {
        Self(value as *const T as *const () as usize)
    }
}

impl fmt::Debug for ObjectIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Per-wrapper multithreading switch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum MtSafety {
    /// Use whatever the parent device was created with.
    #[default]
    Inherit,
    Safe,
    Unsafe,
}

impl MtSafety {
    pub fn resolve(self, device_mt_safe: bool) -> bool {
        match self {
            MtSafety::Inherit => device_mt_safe,
            MtSafety::Safe => true,
            MtSafety::Unsafe => false,
        }
    }

    pub fn from_bool(mt_safe: bool) -> Self {
        if mt_safe {
            MtSafety::Safe
        } else {
            MtSafety::Unsafe
        }
    }
}

/// Coarse lock serializing the public entry points of an MT-safe wrapper.
///
/// MT-unsafe wrappers skip it. Their internal state still sits behind
/// fine-grained locks, so sharing one across threads is a logic error, not UB.
pub struct MtLock {
    mutex: Option<ReentrantMutex<()>>,
}

impl MtLock {
    pub fn new(mt_safe: bool) -> Self {
        Self {
            mutex: mt_safe.then(|| ReentrantMutex::new(())),
        }
    }

    pub fn lock(&self) -> Option<ReentrantMutexGuard<'_, ()>> {
        self.mutex.as_ref().map(|m| m.lock())
    }

    pub fn is_mt_safe(&self) -> bool {
        self.mutex.is_some()
    }
}

impl fmt::Debug for MtLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MtLock")
            .field("mt_safe", &self.is_mt_safe())
            .finish()
    }
}
