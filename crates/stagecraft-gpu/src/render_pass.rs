//! Render pass description, attachment images and swapchain framebuffers.

use crate::device::{GpuDevice, Presenter};
use crate::error::{GpuError, Result};
use crate::image::{ImageAllocator, ImageHandle, ImageViewHandle};
use ash::vk;

/// Depth formats tried, in order, when a depth attachment does not name one.
pub const DEPTH_FORMAT_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

/// Role of a render pass attachment, which decides its format fallback, usage and aspect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttachmentKind {
    /// The presented swapchain image. Must be the final attachment.
    Swapchain,
    /// Colour target read back as an input attachment.
    ColourInputAttachment,
    /// Colour target sampled by later passes.
    ColourSampled,
    /// Depth buffer used only for depth testing.
    DepthNoSampling,
    /// Depth buffer read back as an input attachment.
    DepthInputAttachment,
    /// Depth buffer sampled by later passes.
    DepthSampled,
}

impl AttachmentKind {
    /// Whether the attachment holds colour (falls back to the swapchain format).
    pub fn is_colour(self) -> bool {
        matches!(
            self,
            Self::Swapchain | Self::ColourInputAttachment | Self::ColourSampled
        )
    }

    /// Usage flags for an owned attachment image. Empty for the swapchain.
    pub fn image_usage(self) -> vk::ImageUsageFlags {
        match self {
            Self::Swapchain => vk::ImageUsageFlags::empty(),
            Self::ColourInputAttachment => {
                vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::INPUT_ATTACHMENT
            }
            Self::ColourSampled => {
                vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED
            }
            Self::DepthNoSampling => vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            Self::DepthInputAttachment => {
                vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
                    | vk::ImageUsageFlags::INPUT_ATTACHMENT
            }
            Self::DepthSampled => {
                vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED
            }
        }
    }

    /// Aspect of the attachment's view.
    pub fn aspect(self) -> vk::ImageAspectFlags {
        if self.is_colour() {
            vk::ImageAspectFlags::COLOR
        } else {
            vk::ImageAspectFlags::DEPTH
        }
    }
}

/// Colour attachment cleared on load and transitioned for presentation.
pub fn default_colour_attachment() -> vk::AttachmentDescription {
    vk::AttachmentDescription::default()
        .format(vk::Format::UNDEFINED)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
}

/// Depth attachment cleared on load and discarded after the pass.
pub fn default_depth_attachment() -> vk::AttachmentDescription {
    vk::AttachmentDescription::default()
        .format(vk::Format::UNDEFINED)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::DONT_CARE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
}

/// One attachment of the render pass.
#[derive(Debug, Clone, Copy)]
pub struct AttachmentDesc {
    pub description: vk::AttachmentDescription,
    /// Explicit format; `None` falls back to the swapchain or default depth format.
    pub format: Option<vk::Format>,
    pub kind: AttachmentKind,
}

impl AttachmentDesc {
    /// The presented swapchain attachment.
    pub fn swapchain() -> Self {
        Self {
            description: default_colour_attachment(),
            format: None,
            kind: AttachmentKind::Swapchain,
        }
    }

    /// A depth buffer with the default depth format.
    pub fn depth() -> Self {
        Self {
            description: default_depth_attachment(),
            format: None,
            kind: AttachmentKind::DepthNoSampling,
        }
    }
}

/// Attachment references of one subpass.
#[derive(Debug, Clone, Default)]
pub struct SubpassDesc {
    pub colour: Vec<vk::AttachmentReference>,
    pub input: Vec<vk::AttachmentReference>,
    pub depth: Option<vk::AttachmentReference>,
}

impl SubpassDesc {
    /// A graphics subpass writing one colour attachment and an optional depth attachment.
    pub fn single(colour: u32, depth: Option<u32>) -> Self {
        Self {
            colour: vec![vk::AttachmentReference {
                attachment: colour,
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            }],
            input: Vec::new(),
            depth: depth.map(|attachment| vk::AttachmentReference {
                attachment,
                layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            }),
        }
    }
}

/// Full render pass description. The final attachment must be the swapchain.
#[derive(Debug, Clone)]
pub struct RenderPassDesc {
    pub attachments: Vec<AttachmentDesc>,
    pub subpasses: Vec<SubpassDesc>,
    pub dependencies: Vec<vk::SubpassDependency>,
}

impl RenderPassDesc {
    /// One subpass rendering straight to the swapchain, optionally depth tested.
    pub fn single_subpass(with_depth: bool) -> Self {
        let (attachments, subpass) = if with_depth {
            (
                vec![AttachmentDesc::depth(), AttachmentDesc::swapchain()],
                SubpassDesc::single(1, Some(0)),
            )
        } else {
            (vec![AttachmentDesc::swapchain()], SubpassDesc::single(0, None))
        };

        let stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
        let dependency = vk::SubpassDependency::default()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(stages)
            .dst_stage_mask(stages)
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            );

        Self {
            attachments,
            subpasses: vec![subpass],
            dependencies: vec![dependency],
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        match self.attachments.last() {
            Some(last) if last.kind == AttachmentKind::Swapchain => {}
            _ => {
                return Err(GpuError::Precondition(
                    "final render pass attachment must be the swapchain".into(),
                ))
            }
        }
        let swapchain_count = self
            .attachments
            .iter()
            .filter(|a| a.kind == AttachmentKind::Swapchain)
            .count();
        if swapchain_count != 1 {
            return Err(GpuError::Precondition(format!(
                "render pass has {swapchain_count} swapchain attachments, expected 1"
            )));
        }
        if self.attachments.last().and_then(|a| a.format).is_some() {
            tracing::warn!("Swapchain attachment format is ignored; the swapchain format is used");
        }
        if self.subpasses.is_empty() {
            return Err(GpuError::Precondition("render pass needs a subpass".into()));
        }
        Ok(())
    }

    /// Concrete format of every attachment.
    pub(crate) fn resolve_formats<D: GpuDevice>(
        &self,
        device: &D,
        swapchain_format: vk::Format,
    ) -> Result<Vec<vk::Format>> {
        let mut depth_format = None;
        let mut formats = Vec::with_capacity(self.attachments.len());
        for attachment in &self.attachments {
            let format = match (attachment.kind, attachment.format) {
                (AttachmentKind::Swapchain, _) => swapchain_format,
                (_, Some(format)) => format,
                (kind, None) if kind.is_colour() => swapchain_format,
                (_, None) => match depth_format {
                    Some(format) => format,
                    None => {
                        let format = default_depth_format(device)?;
                        depth_format = Some(format);
                        format
                    }
                },
            };
            formats.push(format);
        }
        Ok(formats)
    }
}

impl Default for RenderPassDesc {
    fn default() -> Self {
        Self::single_subpass(true)
    }
}

/// First supported format of [`DEPTH_FORMAT_CANDIDATES`].
pub fn default_depth_format<D: GpuDevice>(device: &D) -> Result<vk::Format> {
    device
        .find_supported_format(
            &DEPTH_FORMAT_CANDIDATES,
            vk::ImageTiling::OPTIMAL,
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
        )
        .ok_or_else(|| GpuError::Other("no supported depth format".into()))
}

/// Create the render pass with resolved attachment formats.
pub(crate) fn create_render_pass<D: GpuDevice>(
    device: &D,
    desc: &RenderPassDesc,
    formats: &[vk::Format],
) -> Result<vk::RenderPass> {
    let attachments: Vec<vk::AttachmentDescription> = desc
        .attachments
        .iter()
        .zip(formats)
        .map(|(a, &format)| a.description.format(format))
        .collect();

    let subpasses: Vec<vk::SubpassDescription<'_>> = desc
        .subpasses
        .iter()
        .map(|s| {
            let subpass = vk::SubpassDescription::default()
                .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
                .color_attachments(&s.colour)
                .input_attachments(&s.input);
            match &s.depth {
                Some(depth) => subpass.depth_stencil_attachment(depth),
                None => subpass,
            }
        })
        .collect();

    let create_info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&desc.dependencies);

    let render_pass = device.create_render_pass(&create_info).map_err(|e| {
        tracing::error!("Failed to create render pass: {e}");
        GpuError::creation("render pass")(e)
    })?;
    tracing::debug!(attachments = attachments.len(), subpasses = subpasses.len(), "Created render pass");
    Ok(render_pass)
}

/// Attachment images and one framebuffer per swapchain image.
#[derive(Debug, Default)]
pub(crate) struct RenderTargets {
    pub images: Vec<ImageHandle>,
    pub views: Vec<ImageViewHandle>,
    pub framebuffers: Vec<vk::Framebuffer>,
}

impl RenderTargets {
    pub fn create<D: GpuDevice, P: Presenter>(
        device: &D,
        images: &mut ImageAllocator<D>,
        presenter: &P,
        render_pass: vk::RenderPass,
        desc: &RenderPassDesc,
        formats: &[vk::Format],
    ) -> Result<Self> {
        let mut targets = Self::default();
        match targets.populate(device, images, presenter, render_pass, desc, formats) {
            Ok(()) => Ok(targets),
            Err(e) => {
                targets.destroy(device, Some(images));
                Err(e)
            }
        }
    }

    fn populate<D: GpuDevice, P: Presenter>(
        &mut self,
        device: &D,
        images: &mut ImageAllocator<D>,
        presenter: &P,
        render_pass: vk::RenderPass,
        desc: &RenderPassDesc,
        formats: &[vk::Format],
    ) -> Result<()> {
        let extent = presenter.extent();

        // The swapchain attachment is last and supplied by the presenter.
        let owned = desc.attachments.len().saturating_sub(1);
        for (attachment, &format) in desc.attachments.iter().zip(formats).take(owned) {
            let image = images.allocate_empty(extent, format, attachment.kind.image_usage())?;
            self.images.push(image);
            let view = images.create_image_view(image, format, attachment.kind.aspect())?;
            self.views.push(view);
        }

        let mut views = self
            .views
            .iter()
            .map(|&v| images.raw_view(v))
            .collect::<Result<Vec<_>>>()?;

        for i in 0..presenter.image_count() {
            views.push(presenter.image_view(i));
            let create_info = vk::FramebufferCreateInfo::default()
                .render_pass(render_pass)
                .attachments(&views)
                .width(extent.width)
                .height(extent.height)
                .layers(1);
            let framebuffer = device
                .create_framebuffer(&create_info)
                .map_err(GpuError::creation("framebuffer"))?;
            self.framebuffers.push(framebuffer);
            views.pop();
        }

        tracing::debug!(
            attachments = self.images.len(),
            framebuffers = self.framebuffers.len(),
            "Created swapchain framebuffers"
        );
        Ok(())
    }

    /// Destroy framebuffers, then attachment views and images when the allocator is given.
    pub fn destroy<D: GpuDevice>(&mut self, device: &D, images: Option<&mut ImageAllocator<D>>) {
        for framebuffer in self.framebuffers.drain(..) {
            device.destroy_framebuffer(framebuffer);
        }
        if let Some(images) = images {
            for view in self.views.drain(..) {
                if let Err(e) = images.free_image_view(view) {
                    tracing::warn!("Attachment view already released: {e}");
                }
            }
            for image in self.images.drain(..) {
                if let Err(e) = images.free_image(image) {
                    tracing::warn!("Attachment image already released: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_subpass_puts_swapchain_last() {
        let desc = RenderPassDesc::single_subpass(true);
        assert_eq!(desc.attachments.len(), 2);
        assert_eq!(desc.attachments[1].kind, AttachmentKind::Swapchain);
        assert_eq!(desc.subpasses[0].colour[0].attachment, 1);
        assert_eq!(desc.subpasses[0].depth.map(|d| d.attachment), Some(0));
        assert!(desc.validate().is_ok());

        let flat = RenderPassDesc::single_subpass(false);
        assert_eq!(flat.attachments.len(), 1);
        assert!(flat.subpasses[0].depth.is_none());
    }

    #[test]
    fn swapchain_must_be_final_attachment() {
        let mut desc = RenderPassDesc::single_subpass(true);
        desc.attachments.swap(0, 1);
        assert!(matches!(desc.validate(), Err(GpuError::Precondition(_))));

        let mut doubled = RenderPassDesc::single_subpass(false);
        doubled.attachments.insert(0, AttachmentDesc::swapchain());
        assert!(doubled.validate().is_err());
    }

    #[test]
    fn attachment_usage_follows_kind() {
        assert!(AttachmentKind::ColourSampled
            .image_usage()
            .contains(vk::ImageUsageFlags::SAMPLED));
        assert!(AttachmentKind::DepthInputAttachment
            .image_usage()
            .contains(vk::ImageUsageFlags::INPUT_ATTACHMENT));
        assert_eq!(
            AttachmentKind::DepthNoSampling.image_usage(),
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
        );
        assert_eq!(
            AttachmentKind::DepthSampled.aspect(),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(
            AttachmentKind::ColourInputAttachment.aspect(),
            vk::ImageAspectFlags::COLOR
        );
    }

    #[test]
    fn default_attachments_match_their_roles() {
        let colour = default_colour_attachment();
        assert_eq!(colour.final_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(colour.store_op, vk::AttachmentStoreOp::STORE);
        let depth = default_depth_attachment();
        assert_eq!(
            depth.final_layout,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        );
        assert_eq!(depth.store_op, vk::AttachmentStoreOp::DONT_CARE);
    }
}
