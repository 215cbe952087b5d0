// Offscreen render targets
//
// Colour (+ optional entity-id) + depth images with their own render pass and
// framebuffer. The colour image ends the pass in SHADER_READ_ONLY so it can be
// bound as a texture afterwards.

use anyhow::Result;
use ash::vk;

use super::buffer::GpuImage;
use super::device::GraphicsDevice;
use super::frame_packet::{OffscreenView, PassTarget};
use super::pipeline::{create_framebuffer, create_render_pass, RenderTargetKind, ENTITY_ID_FORMAT};

pub struct OffscreenTarget {
    pub color: GpuImage,
    pub entity_id: Option<GpuImage>,
    pub depth: GpuImage,
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    kind: RenderTargetKind,
}

impl OffscreenTarget {
    /// `kind` must be `Offscreen` or `EditorOffscreen`
    pub fn new(
        device: &GraphicsDevice,
        extent: vk::Extent2D,
        color_format: vk::Format,
        kind: RenderTargetKind,
    ) -> Result<Self> {
        assert!(kind != RenderTargetKind::Swapchain, "offscreen target cannot be a swapchain target");
        log::info!("Creating offscreen target {}x{} ({:?})", extent.width, extent.height, kind);

        let logical = &device.logical;
        let color = GpuImage::new(
            device,
            "offscreen color",
            extent,
            color_format,
            vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
            vk::ImageAspectFlags::COLOR,
        )?;
        let entity_id = if kind.has_entity_id() {
            Some(GpuImage::new(
                device,
                "offscreen entity id",
                extent,
                ENTITY_ID_FORMAT,
                vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC,
                vk::ImageAspectFlags::COLOR,
            )?)
        } else {
            None
        };
        let depth = GpuImage::new_depth(device, extent)?;

        let render_pass = create_render_pass(
            logical,
            color_format,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            entity_id.is_some(),
        )?;

        let mut attachments = vec![color.view];
        attachments.extend(entity_id.as_ref().map(|id| id.view));
        attachments.push(depth.view);
        let framebuffer = create_framebuffer(logical, &attachments, render_pass, extent)?;

        Ok(Self {
            color,
            entity_id,
            depth,
            render_pass,
            framebuffer,
            kind,
        })
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.color.extent
    }

    pub fn kind(&self) -> RenderTargetKind {
        self.kind
    }

    /// Use as the target of a `BeginPass`
    pub fn target(&self) -> PassTarget {
        PassTarget::Offscreen(OffscreenView {
            render_pass: self.render_pass,
            framebuffer: self.framebuffer,
            extent: self.extent(),
            kind: self.kind,
        })
    }

    pub fn destroy(self, device: &GraphicsDevice) {
        unsafe {
            device.logical.destroy_framebuffer(self.framebuffer, None);
            device.logical.destroy_render_pass(self.render_pass, None);
        }
        self.depth.destroy(device);
        if let Some(id) = self.entity_id {
            id.destroy(device);
        }
        self.color.destroy(device);
    }
}
