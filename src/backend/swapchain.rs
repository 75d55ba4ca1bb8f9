// Swapchain - presentation images handed to us by a window
//
// The wrapper does not own the native swapchain: the Window collaborator
// creates it and tells us its format, extent and images. Render passes can
// reference a swapchain so that graphics pipelines without explicit
// viewports get one covering the whole image.

use anyhow::{bail, Result};
use ash::vk;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use super::device::{Device, DeviceContext};
use super::object::ObjectKind;
use super::registry::Registration;

/// Presentation target. Platform windows drive `present_callback` from
/// their event loop; off-screen windows may snapshot the image instead.
pub trait Window: Send + Sync {
    fn extent(&self) -> vk::Extent2D;

    /// Called once per `Swapchain::present`, after the image is queued.
    fn present_callback(&self, swapchain: &Swapchain, image_index: u32);
}

#[derive(Clone)]
pub struct SwapchainCreateInfo {
    pub handle: vk::SwapchainKHR,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub images: Vec<vk::Image>,
    pub window: Option<Arc<dyn Window>>,
}

impl SwapchainCreateInfo {
    pub fn new(handle: vk::SwapchainKHR, format: vk::Format, extent: vk::Extent2D, images: Vec<vk::Image>) -> Self {
        Self {
            handle,
            format,
            extent,
            images,
            window: None,
        }
    }

    pub fn with_window(mut self, window: Arc<dyn Window>) -> Self {
        self.window = Some(window);
        self
    }
}

pub struct Swapchain {
    create_info: SwapchainCreateInfo,
    presents: AtomicU64,
    // Kept for the registry's sake; the swapchain itself is not destroyed here.
    _context: Arc<DeviceContext>,
    registration: OnceLock<Registration>,
}

impl Swapchain {
    pub fn create(device: &Device, create_info: SwapchainCreateInfo) -> Result<Arc<Self>> {
        if create_info.images.is_empty() {
            bail!("swapchain has no images");
        }
        if !device.extensions().swapchain {
            log::warn!("Swapchain wrapped on a device without VK_KHR_swapchain");
        }

        log::info!(
            "Swapchain: {}x{} {:?}, {} images",
            create_info.extent.width,
            create_info.extent.height,
            create_info.format,
            create_info.images.len()
        );

        let swapchain = Arc::new(Self {
            create_info,
            presents: AtomicU64::new(0),
            _context: Arc::clone(device.context()),
            registration: OnceLock::new(),
        });
        Registration::attach(
            &swapchain.registration,
            device.registry(),
            ObjectKind::Swapchain,
            &swapchain,
        );
        Ok(swapchain)
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.create_info.handle
    }

    pub fn format(&self) -> vk::Format {
        self.create_info.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.create_info.extent
    }

    pub fn image_count(&self) -> u32 {
        self.create_info.images.len() as u32
    }

    pub fn image(&self, index: u32) -> Option<vk::Image> {
        self.create_info.images.get(index as usize).copied()
    }

    pub fn window(&self) -> Option<&Arc<dyn Window>> {
        self.create_info.window.as_ref()
    }

    pub fn present_count(&self) -> u64 {
        self.presents.load(Ordering::Relaxed)
    }

    /// Hand `image_index` to the window.
    pub fn present(&self, image_index: u32) -> Result<()> {
        if image_index >= self.image_count() {
            bail!(
                "image index {} out of range for a swapchain of {} images",
                image_index,
                self.image_count()
            );
        }
        self.presents.fetch_add(1, Ordering::Relaxed);
        if let Some(window) = &self.create_info.window {
            window.present_callback(self, image_index);
        }
        Ok(())
    }
}

impl fmt::Debug for Swapchain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Swapchain")
            .field("handle", &self.create_info.handle)
            .field("format", &self.create_info.format)
            .field("extent", &self.create_info.extent)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::device::DeviceCreateInfo;
    use crate::backend::null_driver::NullBackend;
    use crate::backend::registry::ObjectRegistry;
    use ash::vk::Handle;
    use parking_lot::Mutex;

    struct RecordingWindow {
        presented: Mutex<Vec<u32>>,
    }

    impl Window for RecordingWindow {
        fn extent(&self) -> vk::Extent2D {
            vk::Extent2D {
                width: 640,
                height: 480,
            }
        }

        fn present_callback(&self, _swapchain: &Swapchain, image_index: u32) {
            self.presented.lock().push(image_index);
        }
    }

    #[test]
    fn present_drives_the_window_callback() {
        let device = Device::create(
            &NullBackend::new(),
            DeviceCreateInfo::default().with_registry(ObjectRegistry::new()),
        )
        .unwrap();
        let window = Arc::new(RecordingWindow {
            presented: Mutex::new(Vec::new()),
        });
        let swapchain = Swapchain::create(
            &device,
            SwapchainCreateInfo::new(
                vk::SwapchainKHR::from_raw(9),
                vk::Format::B8G8R8A8_SRGB,
                window.extent(),
                vec![vk::Image::from_raw(1), vk::Image::from_raw(2)],
            )
            .with_window(window.clone()),
        )
        .unwrap();

        swapchain.present(1).unwrap();
        swapchain.present(0).unwrap();
        assert!(swapchain.present(2).is_err());

        assert_eq!(*window.presented.lock(), vec![1, 0]);
        assert_eq!(swapchain.present_count(), 2);
    }
}
