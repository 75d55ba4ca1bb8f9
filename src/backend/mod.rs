// Backend module - lifetime-tracked wrappers over the Vulkan object model
//
// Design: every wrapper registers itself with an ObjectRegistry and talks to
// the native API only through the Driver seam (ash or the in-process null
// driver).

pub mod allocator;
pub mod ash_driver;
pub mod buffer;
pub mod callback;
pub mod device;
pub mod driver;
pub mod image;
pub mod layout;
pub mod memory;
pub mod null_driver;
pub mod object;
pub mod pipeline;
pub mod queue;
pub mod registry;
pub mod render_pass;
pub mod shader;
pub mod sparse;
pub mod swapchain;
pub mod sync;

pub use allocator::MemoryAllocator;
pub use ash_driver::AshBackend;
pub use buffer::{Buffer, BufferCreateInfo, SparseBufferResidency};
pub use device::{Device, DeviceCreateInfo};
pub use image::{Image, ImageCreateInfo, SparseResidencyScope};
pub use memory::MemoryBlock;
pub use null_driver::NullBackend;
pub use object::{MtSafety, ObjectKind};
pub use queue::Queue;
pub use registry::ObjectRegistry;
pub use sparse::SparseMemoryBindingUpdateInfo;
pub use swapchain::Swapchain;
pub use sync::{Fence, Semaphore};
