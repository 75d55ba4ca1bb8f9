// Images
//
// Same creation modes as buffers, minus children, plus non-owning wrappers
// around swapchain images. An image may name a layout to move to once its
// memory is in place; that transition runs on the first universal queue, at
// most once per image.
//
// Sparse images without a residency scope are tracked as one opaque byte
// range. Images with a residency scope carry per-aspect tile grids and mip
// tails (SparseImageOccupancy).

use anyhow::{anyhow, bail, Context, Result};
use ash::vk;
use parking_lot::Mutex;
use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use super::callback::{CallbackHub, SubscriptionToken};
use super::device::Device;
use super::driver::{ImageDesc, LayoutTransitionDesc};
use super::memory::{MemoryBlock, MemoryCallbackId, MemoryEvent, MemoryResource};
use super::object::{MtLock, MtSafety, ObjectKind};
use super::registry::Registration;
use super::sparse::occupancy::mip_extent;
use super::sparse::page_tracker::PageTracker;
use super::sparse::{SparseBinding, SparseImageOccupancy};
use super::swapchain::Swapchain;
use crate::AnvilError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SparseResidencyScope {
    /// Fully bound before use; bindings are opaque byte ranges.
    None,
    /// Tiles may be bound individually.
    NonAliased,
    /// Tiles may be bound individually and alias each other.
    Aliased,
}

impl SparseResidencyScope {
    fn create_flags(self) -> vk::ImageCreateFlags {
        match self {
            SparseResidencyScope::None => vk::ImageCreateFlags::SPARSE_BINDING,
            SparseResidencyScope::NonAliased => {
                vk::ImageCreateFlags::SPARSE_BINDING | vk::ImageCreateFlags::SPARSE_RESIDENCY
            }
            SparseResidencyScope::Aliased => {
                vk::ImageCreateFlags::SPARSE_BINDING
                    | vk::ImageCreateFlags::SPARSE_RESIDENCY
                    | vk::ImageCreateFlags::SPARSE_ALIASED
            }
        }
    }
}

#[derive(Clone)]
enum ImageCreateMode {
    Alloc { properties: vk::MemoryPropertyFlags },
    NoAlloc,
    SparseNoAlloc { scope: SparseResidencyScope },
    SwapchainWrapper { swapchain: Arc<Swapchain>, index: u32 },
}

impl fmt::Debug for ImageCreateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageCreateMode::Alloc { properties } => write!(f, "Alloc({:?})", properties),
            ImageCreateMode::NoAlloc => f.write_str("NoAlloc"),
            ImageCreateMode::SparseNoAlloc { scope } => write!(f, "SparseNoAlloc({:?})", scope),
            ImageCreateMode::SwapchainWrapper { index, .. } => write!(f, "SwapchainWrapper({})", index),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ImageCreateInfo {
    device: Arc<Device>,
    name: String,
    flags: vk::ImageCreateFlags,
    image_type: vk::ImageType,
    format: vk::Format,
    extent: vk::Extent3D,
    mip_levels: u32,
    array_layers: u32,
    samples: vk::SampleCountFlags,
    tiling: vk::ImageTiling,
    usage: vk::ImageUsageFlags,
    post_create_layout: vk::ImageLayout,
    post_alloc_layout: Option<vk::ImageLayout>,
    queue_families: Vec<u32>,
    mt_safety: MtSafety,
    mode: ImageCreateMode,
}

impl ImageCreateInfo {
    fn with_mode(
        device: &Arc<Device>,
        name: &str,
        format: vk::Format,
        extent: vk::Extent3D,
        usage: vk::ImageUsageFlags,
        mode: ImageCreateMode,
    ) -> Self {
        let image_type = if extent.depth > 1 {
            vk::ImageType::TYPE_3D
        } else if extent.height > 1 {
            vk::ImageType::TYPE_2D
        } else {
            vk::ImageType::TYPE_1D
        };
        Self {
            device: Arc::clone(device),
            name: name.to_string(),
            flags: vk::ImageCreateFlags::empty(),
            image_type,
            format,
            extent,
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage,
            post_create_layout: vk::ImageLayout::UNDEFINED,
            post_alloc_layout: None,
            queue_families: Vec::new(),
            mt_safety: MtSafety::Inherit,
            mode,
        }
    }

    pub fn create_alloc(
        device: &Arc<Device>,
        name: &str,
        format: vk::Format,
        extent: vk::Extent3D,
        usage: vk::ImageUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> Self {
        Self::with_mode(device, name, format, extent, usage, ImageCreateMode::Alloc { properties })
    }

    pub fn create_nonsparse_no_alloc(
        device: &Arc<Device>,
        name: &str,
        format: vk::Format,
        extent: vk::Extent3D,
        usage: vk::ImageUsageFlags,
    ) -> Self {
        Self::with_mode(device, name, format, extent, usage, ImageCreateMode::NoAlloc)
    }

    pub fn create_sparse_no_alloc(
        device: &Arc<Device>,
        name: &str,
        format: vk::Format,
        extent: vk::Extent3D,
        usage: vk::ImageUsageFlags,
        scope: SparseResidencyScope,
    ) -> Self {
        Self::with_mode(
            device,
            name,
            format,
            extent,
            usage,
            ImageCreateMode::SparseNoAlloc { scope },
        )
    }

    /// Non-owning wrapper around image `index` of `swapchain`.
    pub fn create_swapchain_wrapper(
        device: &Arc<Device>,
        swapchain: &Arc<Swapchain>,
        index: u32,
    ) -> Result<Self> {
        if swapchain.image(index).is_none() {
            bail!(
                "swapchain has {} images, {} requested",
                swapchain.image_count(),
                index
            );
        }
        let extent = swapchain.extent();
        let mut info = Self::with_mode(
            device,
            &format!("swapchain image {}", index),
            swapchain.format(),
            vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
            vk::ImageUsageFlags::COLOR_ATTACHMENT,
            ImageCreateMode::SwapchainWrapper {
                swapchain: Arc::clone(swapchain),
                index,
            },
        );
        info.image_type = vk::ImageType::TYPE_2D;
        Ok(info)
    }

    pub fn with_image_type(mut self, image_type: vk::ImageType) -> Self {
        self.image_type = image_type;
        self
    }

    pub fn with_mip_levels(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels;
        self
    }

    pub fn with_array_layers(mut self, array_layers: u32) -> Self {
        self.array_layers = array_layers;
        self
    }

    pub fn with_samples(mut self, samples: vk::SampleCountFlags) -> Self {
        self.samples = samples;
        self
    }

    pub fn with_tiling(mut self, tiling: vk::ImageTiling) -> Self {
        self.tiling = tiling;
        self
    }

    /// Extra create flags, e.g. CUBE_COMPATIBLE. Sparse flags come from the mode.
    pub fn with_flags(mut self, flags: vk::ImageCreateFlags) -> Self {
        self.flags = flags;
        self
    }

    /// UNDEFINED or PREINITIALIZED.
    pub fn with_post_create_layout(mut self, layout: vk::ImageLayout) -> Self {
        self.post_create_layout = layout;
        self
    }

    /// Layout to move to once memory is bound.
    pub fn with_post_alloc_layout(mut self, layout: vk::ImageLayout) -> Self {
        self.post_alloc_layout = Some(layout);
        self
    }

    pub fn with_queue_families(mut self, families: Vec<u32>) -> Self {
        self.queue_families = families;
        self
    }

    pub fn with_mt_safety(mut self, mt_safety: MtSafety) -> Self {
        self.mt_safety = mt_safety;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent3D {
        self.extent
    }

    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }

    pub fn array_layers(&self) -> u32 {
        self.array_layers
    }

    pub fn usage(&self) -> vk::ImageUsageFlags {
        self.usage
    }

    pub fn tiling(&self) -> vk::ImageTiling {
        self.tiling
    }

    pub fn post_create_layout(&self) -> vk::ImageLayout {
        self.post_create_layout
    }

    pub fn post_alloc_layout(&self) -> Option<vk::ImageLayout> {
        self.post_alloc_layout
    }

    pub fn residency_scope(&self) -> Option<SparseResidencyScope> {
        match self.mode {
            ImageCreateMode::SparseNoAlloc { scope } => Some(scope),
            _ => None,
        }
    }
}

/// Aspects carried by `format`.
pub fn format_aspects(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::X8_D24_UNORM_PACK32 | vk::Format::D32_SFLOAT => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::COLOR,
    }
}

enum ImageMemory {
    Unbound,
    Bound(Arc<MemoryBlock>),
    /// Owned by the swapchain.
    External,
    SparseOpaque(PageTracker),
    SparseResident(SparseImageOccupancy),
}

pub struct Image {
    handle: vk::Image,
    create_info: ImageCreateInfo,
    requirements: vk::MemoryRequirements,
    memory: Mutex<ImageMemory>,
    transitioned: AtomicBool,
    callbacks: CallbackHub<MemoryEvent>,
    self_ref: Weak<Image>,
    mt_lock: MtLock,
    registration: OnceLock<Registration>,
}

impl Image {
    pub fn create(mut create_info: ImageCreateInfo) -> Result<Arc<Self>> {
        let device = Arc::clone(&create_info.device);
        let mt_safe = device.context().resolve_mt_safety(create_info.mt_safety);

        let (handle, requirements, memory) = match &create_info.mode {
            ImageCreateMode::SwapchainWrapper { swapchain, index } => {
                let handle = swapchain
                    .image(*index)
                    .ok_or_else(|| anyhow!("swapchain image {} vanished", index))?;
                (handle, vk::MemoryRequirements::default(), ImageMemory::External)
            }
            mode => {
                if let ImageCreateMode::SparseNoAlloc { scope } = mode {
                    Self::check_sparse_support(&device, create_info.image_type, *scope)?;
                    create_info.flags |= scope.create_flags();
                }
                let handle = device
                    .driver()
                    .create_image(&ImageDesc {
                        flags: create_info.flags,
                        image_type: create_info.image_type,
                        format: create_info.format,
                        extent: create_info.extent,
                        mip_levels: create_info.mip_levels,
                        array_layers: create_info.array_layers,
                        samples: create_info.samples,
                        tiling: create_info.tiling,
                        usage: create_info.usage,
                        initial_layout: create_info.post_create_layout,
                        queue_families: create_info.queue_families.clone(),
                    })
                    .map_err(AnvilError::Driver)
                    .with_context(|| format!("Failed to create image '{}'", create_info.name))?;
                let requirements = device.driver().image_memory_requirements(handle);

                let memory = match mode {
                    ImageCreateMode::SparseNoAlloc { scope: SparseResidencyScope::None } => {
                        ImageMemory::SparseOpaque(PageTracker::new(requirements.size, requirements.alignment))
                    }
                    ImageCreateMode::SparseNoAlloc { .. } => {
                        let sparse = device.driver().image_sparse_memory_requirements(handle);
                        ImageMemory::SparseResident(SparseImageOccupancy::new(
                            create_info.extent,
                            create_info.mip_levels,
                            create_info.array_layers,
                            requirements.alignment,
                            &sparse,
                        ))
                    }
                    _ => ImageMemory::Unbound,
                };
                (handle, requirements, memory)
            }
        };

        let image = Arc::new_cyclic(|self_ref| Self {
            handle,
            create_info,
            requirements,
            memory: Mutex::new(memory),
            transitioned: AtomicBool::new(false),
            callbacks: CallbackHub::new(),
            self_ref: self_ref.clone(),
            mt_lock: MtLock::new(mt_safe),
            registration: OnceLock::new(),
        });
        Registration::attach(&image.registration, device.registry(), ObjectKind::Image, &image);

        if let ImageCreateMode::Alloc { properties } = image.create_info.mode {
            let linear = image.create_info.tiling == vk::ImageTiling::LINEAR;
            let block = MemoryBlock::create(&device, &image.create_info.name, requirements, properties, linear)?;
            image.set_memory(block)?;
        }

        log::debug!(
            "Image '{}' created: {:?} {}x{}x{}, {} mips, {} layers, {:?}",
            image.create_info.name,
            image.create_info.format,
            image.create_info.extent.width,
            image.create_info.extent.height,
            image.create_info.extent.depth,
            image.create_info.mip_levels,
            image.create_info.array_layers,
            image.create_info.mode
        );
        Ok(image)
    }

    fn check_sparse_support(device: &Device, image_type: vk::ImageType, scope: SparseResidencyScope) -> Result<()> {
        let features = &device.physical_device().features;
        let residency = match image_type {
            vk::ImageType::TYPE_3D => features.sparse_residency_image3_d,
            _ => features.sparse_residency_image2_d,
        };
        let supported = match scope {
            SparseResidencyScope::None => features.sparse_binding,
            SparseResidencyScope::NonAliased => residency,
            SparseResidencyScope::Aliased => residency & features.sparse_residency_aliased,
        };
        if supported == vk::FALSE {
            bail!("device does not support {:?} sparse {:?} images", scope, image_type);
        }
        Ok(())
    }

    /// Driver image. Unbound non-sparse images ask their subscribers for
    /// memory first.
    pub fn get_image(&self) -> vk::Image {
        let _guard = self.mt_lock.lock();
        self.request_memory();
        self.handle
    }

    pub fn get_memory_block(&self) -> Result<Arc<MemoryBlock>> {
        let _guard = self.mt_lock.lock();
        self.request_memory();
        match &*self.memory.lock() {
            ImageMemory::Bound(block) => Ok(Arc::clone(block)),
            ImageMemory::Unbound => Err(AnvilError::MemoryNotBound("image").into()),
            ImageMemory::External => bail!("swapchain image '{}' has no memory block", self.create_info.name),
            ImageMemory::SparseOpaque(_) | ImageMemory::SparseResident(_) => {
                bail!("sparse image '{}' has no single memory block", self.create_info.name)
            }
        }
    }

    fn request_memory(&self) {
        let unbound = matches!(*self.memory.lock(), ImageMemory::Unbound);
        if !unbound {
            return;
        }
        if let Some(me) = self.self_ref.upgrade() {
            log::trace!("Image '{}' needs memory", self.create_info.name);
            self.callbacks.fire(&MemoryEvent::MemoryBlockNeeded {
                resource: MemoryResource::Image(me),
            });
        }
    }

    /// Bind `block` to a non-sparse image, then move it to its post-alloc
    /// layout if it has one.
    pub fn set_memory(&self, block: Arc<MemoryBlock>) -> Result<()> {
        let _guard = self.mt_lock.lock();
        {
            let mut memory = self.memory.lock();
            match &*memory {
                ImageMemory::Unbound => {}
                ImageMemory::Bound(_) | ImageMemory::External => {
                    return Err(AnvilError::MemoryAlreadyBound("image").into())
                }
                ImageMemory::SparseOpaque(_) | ImageMemory::SparseResident(_) => bail!(
                    "sparse image '{}' is bound through sparse bind batches",
                    self.create_info.name
                ),
            }
            if block.device_id() != self.create_info.device.id() {
                bail!("memory block belongs to another device");
            }
            if block.size() < self.requirements.size
                || block.start_offset() % self.requirements.alignment.max(1) != 0
            {
                bail!(
                    "memory block ({} bytes at {}) does not satisfy image '{}' ({} bytes, alignment {})",
                    block.size(),
                    block.start_offset(),
                    self.create_info.name,
                    self.requirements.size,
                    self.requirements.alignment
                );
            }

            self.create_info
                .device
                .driver()
                .bind_image_memory(self.handle, block.memory(), block.start_offset())
                .map_err(AnvilError::Driver)
                .with_context(|| format!("Failed to bind memory to image '{}'", self.create_info.name))?;
            *memory = ImageMemory::Bound(block);
        }

        self.transition_to_post_alloc_layout()
    }

    /// One-shot move from the post-create to the post-alloc layout.
    pub(crate) fn transition_to_post_alloc_layout(&self) -> Result<()> {
        let Some(new_layout) = self.create_info.post_alloc_layout else {
            return Ok(());
        };
        if new_layout == self.create_info.post_create_layout {
            return Ok(());
        }
        if self.transitioned.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let device = &self.create_info.device;
        let queue = device
            .universal_queue(0)
            .ok_or_else(|| anyhow!("image '{}' needs a universal queue for its layout transition", self.create_info.name))?;
        let pool = device
            .command_pool(queue.family_index())
            .ok_or_else(|| anyhow!("no command pool for queue family {}", queue.family_index()))?;

        let transition = LayoutTransitionDesc {
            image: self.handle,
            subresource_range: self.subresource_range(),
            old_layout: self.create_info.post_create_layout,
            new_layout,
        };
        if let Err(e) = queue.submit_layout_transition(pool, &transition) {
            self.transitioned.store(false, Ordering::Release);
            return Err(e).with_context(|| format!("Failed to transition image '{}'", self.create_info.name));
        }

        log::debug!(
            "Image '{}' moved {:?} -> {:?}",
            self.create_info.name,
            transition.old_layout,
            new_layout
        );
        Ok(())
    }

    /// Every mip and layer of every aspect.
    pub fn subresource_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: format_aspects(self.create_info.format),
            base_mip_level: 0,
            level_count: self.create_info.mip_levels,
            base_array_layer: 0,
            layer_count: self.create_info.array_layers,
        }
    }

    pub fn has_transitioned(&self) -> bool {
        self.transitioned.load(Ordering::Acquire)
    }

    pub fn is_alloc_pending(&self) -> bool {
        let Some(me) = self.self_ref.upgrade() else {
            return false;
        };
        let event = MemoryEvent::IsAllocPending {
            resource: MemoryResource::Image(me),
            pending: Cell::new(false),
        };
        self.callbacks.fire(&event);
        match event {
            MemoryEvent::IsAllocPending { pending, .. } => pending.get(),
            MemoryEvent::MemoryBlockNeeded { .. } => false,
        }
    }

    pub fn subscribe<F>(&self, id: MemoryCallbackId, handler: F) -> SubscriptionToken
    where
        F: Fn(&MemoryEvent) + Send + Sync + 'static,
    {
        self.callbacks.register(id, handler)
    }

    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        self.callbacks.unregister(token)
    }

    pub(crate) fn validate_opaque_update(
        &self,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
        flags: vk::SparseMemoryBindFlags,
    ) -> Result<()> {
        match &*self.memory.lock() {
            ImageMemory::SparseOpaque(tracker) => tracker
                .validate(offset, size)
                .map_err(|e| AnvilError::InvalidSparseRegion(format!("{:#}", e)).into()),
            ImageMemory::SparseResident(occupancy) => occupancy.validate_opaque(offset, size, flags),
            _ => bail!("image '{}' is not sparse", self.create_info.name),
        }
    }

    pub(crate) fn validate_tile_update(
        &self,
        subresource: vk::ImageSubresource,
        offset: vk::Offset3D,
        extent: vk::Extent3D,
    ) -> Result<()> {
        match &*self.memory.lock() {
            ImageMemory::SparseResident(occupancy) => occupancy.validate_tiles(subresource, offset, extent),
            _ => bail!("image '{}' has no sparse residency", self.create_info.name),
        }
    }

    /// Tracker half of a sparse bind. The layout transition is left to the
    /// caller, once every tracker of the submission is written.
    pub(crate) fn apply_opaque_update(
        &self,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
        flags: vk::SparseMemoryBindFlags,
        binding: Option<SparseBinding>,
    ) -> Result<()> {
        let _guard = self.mt_lock.lock();
        match &mut *self.memory.lock() {
            ImageMemory::SparseOpaque(tracker) => tracker.update(offset, size, binding),
            ImageMemory::SparseResident(occupancy) => occupancy.update_opaque(offset, size, flags, binding),
            _ => bail!("image '{}' is not sparse", self.create_info.name),
        }
    }

    pub(crate) fn apply_tile_update(
        &self,
        subresource: vk::ImageSubresource,
        offset: vk::Offset3D,
        extent: vk::Extent3D,
        binding: Option<SparseBinding>,
    ) -> Result<()> {
        let _guard = self.mt_lock.lock();
        match &mut *self.memory.lock() {
            ImageMemory::SparseResident(occupancy) => {
                occupancy.update_tiles(subresource, offset, extent, binding)
            }
            _ => bail!("image '{}' has no sparse residency", self.create_info.name),
        }
    }

    /// Is the texel backed by memory? Non-sparse images answer for the whole
    /// image; opaque sparse images are bound only when every page is.
    pub fn is_memory_bound_for_texel(
        &self,
        aspect: vk::ImageAspectFlags,
        layer: u32,
        mip: u32,
        x: u32,
        y: u32,
        z: u32,
    ) -> bool {
        let info = &self.create_info;
        let in_range = || {
            let dims = mip_extent(info.extent, mip);
            layer < info.array_layers
                && mip < info.mip_levels
                && x < dims.width
                && y < dims.height
                && z < dims.depth
        };
        match &*self.memory.lock() {
            ImageMemory::Unbound => false,
            ImageMemory::Bound(_) | ImageMemory::External => in_range(),
            ImageMemory::SparseOpaque(tracker) => in_range() && tracker.is_bound(0, tracker.resource_size()),
            ImageMemory::SparseResident(occupancy) => {
                occupancy.is_memory_bound_for_texel(aspect, layer, mip, x, y, z)
            }
        }
    }

    pub fn is_mip_tail_bound(&self, aspect: vk::ImageAspectFlags, layer: u32) -> bool {
        match &*self.memory.lock() {
            ImageMemory::SparseResident(occupancy) => occupancy.is_mip_tail_bound(aspect, layer),
            _ => false,
        }
    }

    pub fn is_metadata_bound(&self) -> bool {
        match &*self.memory.lock() {
            ImageMemory::SparseResident(occupancy) => occupancy.is_metadata_bound(),
            _ => false,
        }
    }

    /// Copy of the residency data of an image with a residency scope.
    pub fn sparse_occupancy(&self) -> Option<SparseImageOccupancy> {
        match &*self.memory.lock() {
            ImageMemory::SparseResident(occupancy) => Some(occupancy.clone()),
            _ => None,
        }
    }

    pub fn handle(&self) -> vk::Image {
        self.handle
    }

    pub fn create_info(&self) -> &ImageCreateInfo {
        &self.create_info
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.create_info.device
    }

    pub fn name(&self) -> &str {
        &self.create_info.name
    }

    pub fn format(&self) -> vk::Format {
        self.create_info.format
    }

    pub fn extent(&self) -> vk::Extent3D {
        self.create_info.extent
    }

    pub fn memory_requirements(&self) -> vk::MemoryRequirements {
        self.requirements
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self.create_info.mode, ImageCreateMode::SparseNoAlloc { .. })
    }

    pub fn is_swapchain_image(&self) -> bool {
        matches!(self.create_info.mode, ImageCreateMode::SwapchainWrapper { .. })
    }

    pub fn is_memory_bound(&self) -> bool {
        !matches!(*self.memory.lock(), ImageMemory::Unbound)
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        if !self.is_swapchain_image() {
            self.create_info.device.driver().destroy_image(self.handle);
        }
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("name", &self.create_info.name)
            .field("handle", &self.handle)
            .field("format", &self.create_info.format)
            .field("mode", &self.create_info.mode)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use crate::backend::device::DeviceCreateInfo;
    use crate::backend::null_driver::{NullBackend, NullDriver};
    use crate::backend::registry::ObjectRegistry;
    use crate::backend::sparse::BlockRef;
    use crate::backend::swapchain::SwapchainCreateInfo;

    fn device() -> (Arc<Device>, Arc<NullDriver>) {
        let backend = NullBackend::new();
        let device = Device::create(
            &backend,
            DeviceCreateInfo::default().with_registry(ObjectRegistry::new()),
        )
        .unwrap();
        let driver = backend.last_driver().unwrap();
        (device, driver)
    }

    fn extent(width: u32, height: u32) -> vk::Extent3D {
        vk::Extent3D { width, height, depth: 1 }
    }

    #[test]
    fn post_alloc_transition_runs_once() {
        let (device, driver) = device();
        let image = Image::create(
            ImageCreateInfo::create_nonsparse_no_alloc(
                &device,
                "target",
                vk::Format::R8G8B8A8_UNORM,
                extent(64, 64),
                vk::ImageUsageFlags::SAMPLED,
            )
            .with_post_alloc_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
        )
        .unwrap();
        assert!(driver.journal().layout_transitions.is_empty());

        let block = MemoryBlock::create(
            &device,
            "target",
            image.memory_requirements(),
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            false,
        )
        .unwrap();
        image.set_memory(block).unwrap();

        let transitions = driver.journal().layout_transitions;
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(transitions[0].new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert!(image.has_transitioned());
    }

    #[test]
    fn depth_formats_transition_the_depth_aspect() {
        let (device, driver) = device();
        let _image = Image::create(
            ImageCreateInfo::create_alloc(
                &device,
                "depth",
                vk::Format::D24_UNORM_S8_UINT,
                extent(32, 32),
                vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )
            .with_post_alloc_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
        )
        .unwrap();

        let transitions = driver.journal().layout_transitions;
        assert_eq!(
            transitions[0].subresource_range.aspect_mask,
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
    }

    #[test]
    fn swapchain_wrappers_do_not_own_their_image() {
        let (device, driver) = device();
        let images = vec![vk::Image::from_raw(0xdead), vk::Image::from_raw(0xbeef)];
        let swapchain = Swapchain::create(
            &device,
            SwapchainCreateInfo::new(
                vk::SwapchainKHR::from_raw(0x5c),
                vk::Format::B8G8R8A8_SRGB,
                vk::Extent2D { width: 800, height: 600 },
                images,
            ),
        )
        .unwrap();

        let image = Image::create(ImageCreateInfo::create_swapchain_wrapper(&device, &swapchain, 1).unwrap()).unwrap();
        assert_eq!(image.get_image(), vk::Image::from_raw(0xbeef));
        assert!(image.is_memory_bound_for_texel(vk::ImageAspectFlags::COLOR, 0, 0, 799, 599, 0));
        assert!(image.get_memory_block().is_err());
        drop(image);
        assert!(driver.journal().image_binds.is_empty());

        assert!(ImageCreateInfo::create_swapchain_wrapper(&device, &swapchain, 2).is_err());
    }

    #[test]
    fn opaque_sparse_images_need_every_page() {
        let (device, _) = device();
        let image = Image::create(ImageCreateInfo::create_sparse_no_alloc(
            &device,
            "opaque",
            vk::Format::R8G8B8A8_UNORM,
            extent(256, 256),
            vk::ImageUsageFlags::SAMPLED,
            SparseResidencyScope::None,
        ))
        .unwrap();
        assert!(image.sparse_occupancy().is_none());

        let requirements = image.memory_requirements();
        let block = MemoryBlock::create(
            &device,
            "opaque",
            requirements,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            false,
        )
        .unwrap();
        let page = requirements.alignment;

        image
            .apply_opaque_update(
                0,
                page,
                vk::SparseMemoryBindFlags::empty(),
                Some(SparseBinding {
                    block: BlockRef::new(&block, true),
                    memory_offset: 0,
                }),
            )
            .unwrap();
        assert!(!image.is_memory_bound_for_texel(vk::ImageAspectFlags::COLOR, 0, 0, 0, 0, 0));

        image
            .apply_opaque_update(
                0,
                requirements.size,
                vk::SparseMemoryBindFlags::empty(),
                Some(SparseBinding {
                    block: BlockRef::new(&block, true),
                    memory_offset: 0,
                }),
            )
            .unwrap();
        assert!(image.is_memory_bound_for_texel(vk::ImageAspectFlags::COLOR, 0, 0, 0, 0, 0));
        assert!(image.set_memory(block).is_err());
    }
}
