// Render passes
//
// Color attachments are referenced by fragment output location. The baked
// subpass description lists them by location, with VK_ATTACHMENT_UNUSED in
// the gaps, which is also the layout graphics pipelines use for their
// blend attachment array.

use anyhow::{bail, Context, Result};
use ash::vk;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use super::device::{Device, DeviceContext};
use super::driver::{RenderPassBakeInfo, SubpassBakeInfo};
use super::object::ObjectKind;
use super::registry::Registration;
use super::swapchain::Swapchain;
use crate::AnvilError;

#[derive(Clone, Copy, Debug)]
pub struct AttachmentInfo {
    pub format: vk::Format,
    pub samples: vk::SampleCountFlags,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub stencil_load_op: vk::AttachmentLoadOp,
    pub stencil_store_op: vk::AttachmentStoreOp,
    pub initial_layout: vk::ImageLayout,
    pub final_layout: vk::ImageLayout,
    pub depth_stencil: bool,
}

impl AttachmentInfo {
    fn to_vk(self) -> vk::AttachmentDescription {
        vk::AttachmentDescription {
            flags: vk::AttachmentDescriptionFlags::empty(),
            format: self.format,
            samples: self.samples,
            load_op: self.load_op,
            store_op: self.store_op,
            stencil_load_op: self.stencil_load_op,
            stencil_store_op: self.stencil_store_op,
            initial_layout: self.initial_layout,
            final_layout: self.final_layout,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttachmentRef {
    pub attachment: u32,
    pub layout: vk::ImageLayout,
}

impl AttachmentRef {
    fn to_vk(self) -> vk::AttachmentReference {
        vk::AttachmentReference {
            attachment: self.attachment,
            layout: self.layout,
        }
    }
}

fn unused_reference() -> vk::AttachmentReference {
    vk::AttachmentReference {
        attachment: vk::ATTACHMENT_UNUSED,
        layout: vk::ImageLayout::UNDEFINED,
    }
}

#[derive(Clone, Debug, Default)]
pub struct SubpassInfo {
    /// Keyed by fragment output location.
    pub color_attachments: BTreeMap<u32, AttachmentRef>,
    /// Keyed by the location of the color attachment they resolve.
    pub resolve_attachments: BTreeMap<u32, AttachmentRef>,
    pub input_attachments: Vec<AttachmentRef>,
    pub depth_stencil_attachment: Option<AttachmentRef>,
    pub preserve_attachments: Vec<u32>,
}

impl SubpassInfo {
    /// Highest color location in use, if any.
    pub fn highest_color_location(&self) -> Option<u32> {
        self.color_attachments.keys().next_back().copied()
    }

    fn bake(&self) -> SubpassBakeInfo {
        let by_location = |refs: &BTreeMap<u32, AttachmentRef>| -> Vec<vk::AttachmentReference> {
            match self.highest_color_location() {
                Some(highest) => (0..=highest)
                    .map(|loc| refs.get(&loc).map_or_else(unused_reference, |r| r.to_vk()))
                    .collect(),
                None => Vec::new(),
            }
        };

        SubpassBakeInfo {
            color_attachments: by_location(&self.color_attachments),
            resolve_attachments: if self.resolve_attachments.is_empty() {
                Vec::new()
            } else {
                by_location(&self.resolve_attachments)
            },
            input_attachments: self.input_attachments.iter().map(|r| r.to_vk()).collect(),
            depth_stencil_attachment: self.depth_stencil_attachment.map(|r| r.to_vk()),
            preserve_attachments: self.preserve_attachments.clone(),
        }
    }
}

#[derive(Clone, Default)]
pub struct RenderPassCreateInfo {
    attachments: Vec<AttachmentInfo>,
    subpasses: Vec<SubpassInfo>,
    dependencies: Vec<vk::SubpassDependency>,
    swapchain: Option<Arc<Swapchain>>,
}

impl RenderPassCreateInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Swapchain the render pass draws into, used for viewport synthesis.
    pub fn with_swapchain(mut self, swapchain: Arc<Swapchain>) -> Self {
        self.swapchain = Some(swapchain);
        self
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_color_attachment(
        &mut self,
        format: vk::Format,
        samples: vk::SampleCountFlags,
        load_op: vk::AttachmentLoadOp,
        store_op: vk::AttachmentStoreOp,
        initial_layout: vk::ImageLayout,
        final_layout: vk::ImageLayout,
    ) -> u32 {
        self.attachments.push(AttachmentInfo {
            format,
            samples,
            load_op,
            store_op,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout,
            final_layout,
            depth_stencil: false,
        });
        self.attachments.len() as u32 - 1
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_depth_stencil_attachment(
        &mut self,
        format: vk::Format,
        samples: vk::SampleCountFlags,
        depth_load_op: vk::AttachmentLoadOp,
        depth_store_op: vk::AttachmentStoreOp,
        stencil_load_op: vk::AttachmentLoadOp,
        stencil_store_op: vk::AttachmentStoreOp,
        initial_layout: vk::ImageLayout,
        final_layout: vk::ImageLayout,
    ) -> u32 {
        self.attachments.push(AttachmentInfo {
            format,
            samples,
            load_op: depth_load_op,
            store_op: depth_store_op,
            stencil_load_op,
            stencil_store_op,
            initial_layout,
            final_layout,
            depth_stencil: true,
        });
        self.attachments.len() as u32 - 1
    }

    pub fn add_subpass(&mut self) -> u32 {
        self.subpasses.push(SubpassInfo::default());
        self.subpasses.len() as u32 - 1
    }

    fn attachment_checked(&self, attachment: u32, depth_stencil: bool) -> Result<()> {
        match self.attachments.get(attachment as usize) {
            Some(info) if info.depth_stencil == depth_stencil => Ok(()),
            Some(_) => bail!(
                "attachment {} is not a {} attachment",
                attachment,
                if depth_stencil { "depth/stencil" } else { "color" }
            ),
            None => bail!("attachment {} does not exist", attachment),
        }
    }

    fn subpass_mut(&mut self, subpass: u32) -> Result<&mut SubpassInfo> {
        self.subpasses
            .get_mut(subpass as usize)
            .with_context(|| format!("subpass {} does not exist", subpass))
    }

    pub fn add_subpass_color_attachment(
        &mut self,
        subpass: u32,
        location: u32,
        attachment: u32,
        layout: vk::ImageLayout,
        resolve_attachment: Option<u32>,
    ) -> Result<()> {
        self.attachment_checked(attachment, false)?;
        if let Some(resolve) = resolve_attachment {
            self.attachment_checked(resolve, false)?;
        }

        let info = self.subpass_mut(subpass)?;
        if info.color_attachments.contains_key(&location) {
            bail!("location {} of subpass {} is already taken", location, subpass);
        }
        info.color_attachments
            .insert(location, AttachmentRef { attachment, layout });
        if let Some(resolve) = resolve_attachment {
            info.resolve_attachments.insert(
                location,
                AttachmentRef {
                    attachment: resolve,
                    layout,
                },
            );
        }
        Ok(())
    }

    pub fn set_subpass_depth_stencil_attachment(
        &mut self,
        subpass: u32,
        attachment: u32,
        layout: vk::ImageLayout,
    ) -> Result<()> {
        self.attachment_checked(attachment, true)?;
        self.subpass_mut(subpass)?.depth_stencil_attachment = Some(AttachmentRef { attachment, layout });
        Ok(())
    }

    pub fn add_subpass_input_attachment(
        &mut self,
        subpass: u32,
        attachment: u32,
        layout: vk::ImageLayout,
    ) -> Result<()> {
        if attachment as usize >= self.attachments.len() {
            bail!("attachment {} does not exist", attachment);
        }
        self.subpass_mut(subpass)?
            .input_attachments
            .push(AttachmentRef { attachment, layout });
        Ok(())
    }

    pub fn add_dependency(&mut self, dependency: vk::SubpassDependency) {
        self.dependencies.push(dependency);
    }

    pub fn attachments(&self) -> &[AttachmentInfo] {
        &self.attachments
    }

    pub fn subpass(&self, subpass: u32) -> Option<&SubpassInfo> {
        self.subpasses.get(subpass as usize)
    }

    pub fn subpass_count(&self) -> u32 {
        self.subpasses.len() as u32
    }

    pub fn swapchain(&self) -> Option<&Arc<Swapchain>> {
        self.swapchain.as_ref()
    }

    fn bake(&self) -> RenderPassBakeInfo {
        RenderPassBakeInfo {
            attachments: self.attachments.iter().map(|a| a.to_vk()).collect(),
            subpasses: self.subpasses.iter().map(SubpassInfo::bake).collect(),
            dependencies: self.dependencies.clone(),
        }
    }
}

pub struct RenderPass {
    handle: vk::RenderPass,
    create_info: RenderPassCreateInfo,
    context: Arc<DeviceContext>,
    registration: OnceLock<Registration>,
}

impl RenderPass {
    pub fn create(device: &Device, create_info: RenderPassCreateInfo) -> Result<Arc<Self>> {
        if create_info.subpasses.is_empty() {
            bail!("render pass needs at least one subpass");
        }

        let context = Arc::clone(device.context());
        let handle = context
            .driver()
            .create_render_pass(&create_info.bake())
            .map_err(AnvilError::Driver)
            .context("Failed to create render pass")?;

        let render_pass = Arc::new(Self {
            handle,
            create_info,
            context,
            registration: OnceLock::new(),
        });
        Registration::attach(
            &render_pass.registration,
            render_pass.context.registry(),
            ObjectKind::RenderPass,
            &render_pass,
        );
        Ok(render_pass)
    }

    pub fn handle(&self) -> vk::RenderPass {
        self.handle
    }

    pub fn create_info(&self) -> &RenderPassCreateInfo {
        &self.create_info
    }

    pub fn subpass(&self, subpass: u32) -> Option<&SubpassInfo> {
        self.create_info.subpass(subpass)
    }

    pub fn swapchain(&self) -> Option<&Arc<Swapchain>> {
        self.create_info.swapchain()
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        self.context.driver().destroy_render_pass(self.handle);
    }
}

impl fmt::Debug for RenderPass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderPass")
            .field("handle", &self.handle)
            .field("attachments", &self.create_info.attachments.len())
            .field("subpasses", &self.create_info.subpasses.len())
            .finish()
    }
}
