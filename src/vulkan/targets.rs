use std::{ffi::CStr, sync::Arc};

use ash::vk;

use super::passes::{
    BACKGROUND_FORMAT, COLOR_FORMAT, COMPOSITE_FORMAT, DEFERRED_FORMAT, DEPTH_FORMAT, LDR_FORMAT,
    NORMAL_FORMAT,
};
use crate::{error::Check, memory::Image, Context, Result};

/// Offscreen attachments of one resource set, and the framebuffers binding them
pub struct Targets {
    ctx: Arc<Context>,
    pub background_fb: vk::Framebuffer,
    pub geometry_fb: vk::Framebuffer,
    pub composition_fb: vk::Framebuffer,
    pub background: Image,
    pub color: Image,
    pub normal: Image,
    pub deferred: Image,
    pub depth: Image,
    pub composite: Image,
    pub ldr: Image,
    /// Contents undefined: not yet written by any frame since creation
    pub fresh: bool,
}

impl Drop for Targets {
    fn drop(&mut self) {
        let device = &self.ctx.device;
        unsafe {
            device.destroy_framebuffer(self.background_fb, None);
            device.destroy_framebuffer(self.geometry_fb, None);
            device.destroy_framebuffer(self.composition_fb, None);
        }
    }
}

impl Targets {
    pub unsafe fn new(
        ctx: &Arc<Context>,
        extent: vk::Extent2D,
        background_extent: vk::Extent2D,
    ) -> Result<Self> {
        let sampled = vk::ImageUsageFlags::SAMPLED;
        let mut this = Self {
            ctx: ctx.clone(),
            background_fb: vk::Framebuffer::null(),
            geometry_fb: vk::Framebuffer::null(),
            composition_fb: vk::Framebuffer::null(),
            background: target(ctx, background_extent, BACKGROUND_FORMAT, sampled, c"background")?,
            color: target(ctx, extent, COLOR_FORMAT, sampled, c"color")?,
            normal: target(ctx, extent, NORMAL_FORMAT, sampled, c"normal")?,
            deferred: target(ctx, extent, DEFERRED_FORMAT, sampled, c"deferred")?,
            depth: target(ctx, extent, DEPTH_FORMAT, sampled, c"depth")?,
            composite: target(
                ctx,
                extent,
                COMPOSITE_FORMAT,
                vk::ImageUsageFlags::INPUT_ATTACHMENT | vk::ImageUsageFlags::TRANSIENT_ATTACHMENT,
                c"composite",
            )?,
            ldr: target(ctx, extent, LDR_FORMAT, sampled, c"ldr")?,
            fresh: true,
        };
        let passes = &ctx.render_passes;
        this.background_fb = framebuffer(
            ctx,
            passes.background,
            &[this.background.view],
            background_extent,
        )?;
        this.geometry_fb = framebuffer(
            ctx,
            passes.geometry,
            &[
                this.color.view,
                this.normal.view,
                this.deferred.view,
                this.depth.view,
            ],
            extent,
        )?;
        this.composition_fb = framebuffer(
            ctx,
            passes.composition,
            &[this.composite.view, this.ldr.view],
            extent,
        )?;
        Ok(this)
    }

    /// Barriers returning the background and geometry targets to attachment layouts
    pub fn reset_barriers(&self) -> [vk::ImageMemoryBarrier<'static>; 5] {
        let color = |image: &Image| vk::ImageMemoryBarrier {
            dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            old_layout: if self.fresh {
                vk::ImageLayout::UNDEFINED
            } else {
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
            },
            new_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            image: image.handle,
            subresource_range: image.subresource_range(),
            ..Default::default()
        };
        [
            color(&self.background),
            color(&self.color),
            color(&self.normal),
            color(&self.deferred),
            vk::ImageMemoryBarrier {
                dst_access_mask: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                old_layout: if self.fresh {
                    vk::ImageLayout::UNDEFINED
                } else {
                    vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
                },
                new_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                ..color(&self.depth)
            },
        ]
    }
}

unsafe fn target(
    ctx: &Arc<Context>,
    extent: vk::Extent2D,
    format: vk::Format,
    usage: vk::ImageUsageFlags,
    name: &'static CStr,
) -> Result<Image> {
    let (aspect, attachment) = if format == DEPTH_FORMAT {
        (
            vk::ImageAspectFlags::DEPTH,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        )
    } else {
        (
            vk::ImageAspectFlags::COLOR,
            vk::ImageUsageFlags::COLOR_ATTACHMENT,
        )
    };
    Image::new(
        ctx,
        &vk::ImageCreateInfo {
            image_type: vk::ImageType::TYPE_2D,
            format,
            extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: usage | attachment,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            ..Default::default()
        },
        aspect,
        name,
    )
}

unsafe fn framebuffer(
    ctx: &Context,
    render_pass: vk::RenderPass,
    attachments: &[vk::ImageView],
    extent: vk::Extent2D,
) -> Result<vk::Framebuffer> {
    ctx.device
        .create_framebuffer(
            &vk::FramebufferCreateInfo::default()
                .render_pass(render_pass)
                .attachments(attachments)
                .width(extent.width)
                .height(extent.height)
                .layers(1),
            None,
        )
        .check("framebuffer")
}
