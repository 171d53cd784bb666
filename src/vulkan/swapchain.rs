use std::sync::Arc;

use ash::vk;
use tracing::info;

use crate::{error::Check, Config, Context, Result};

/// Swapchain images, their views, and the post pass framebuffer of each
pub struct Swapchain {
    ctx: Arc<Context>,
    pub handle: vk::SwapchainKHR,
    pub extent: vk::Extent2D,
    pub images: Vec<vk::Image>,
    pub views: Vec<vk::ImageView>,
    pub framebuffers: Vec<vk::Framebuffer>,
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        let device = &self.ctx.device;
        unsafe {
            for &framebuffer in &self.framebuffers {
                device.destroy_framebuffer(framebuffer, None);
            }
            for &view in &self.views {
                device.destroy_image_view(view, None);
            }
            self.ctx.swapchain_fn.destroy_swapchain(self.handle, None);
        }
    }
}

impl Swapchain {
    /// Create a swapchain for the context's surface, retiring `old` if supplied
    ///
    /// `extent` is used only when the surface leaves the choice to the swapchain.
    pub unsafe fn new(
        ctx: &Arc<Context>,
        config: &Config,
        extent: vk::Extent2D,
        old: Option<&Swapchain>,
    ) -> Result<Self> {
        let device = &ctx.device;
        let surface = surface(ctx)?;
        let caps = surface
            .loader
            .get_physical_device_surface_capabilities(ctx.physical, surface.handle)
            .check("surface capabilities")?;
        let modes = surface
            .loader
            .get_physical_device_surface_present_modes(ctx.physical, surface.handle)
            .check("surface present modes")?;
        let extent = choose_extent(&caps, extent);
        let image_count = choose_image_count(&caps, config.desired_image_count);
        let present_mode = choose_present_mode(&modes, config.present_mode.into());

        let mut this = Self {
            ctx: ctx.clone(),
            handle: vk::SwapchainKHR::null(),
            extent,
            images: Vec::new(),
            views: Vec::new(),
            framebuffers: Vec::new(),
        };
        this.handle = ctx
            .swapchain_fn
            .create_swapchain(
                &vk::SwapchainCreateInfoKHR::default()
                    .surface(surface.handle)
                    .min_image_count(image_count)
                    .image_format(ctx.surface_format.format)
                    .image_color_space(ctx.surface_format.color_space)
                    .image_extent(extent)
                    .image_array_layers(1)
                    .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
                    .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
                    .pre_transform(caps.current_transform)
                    .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
                    .present_mode(present_mode)
                    .clipped(true)
                    .old_swapchain(old.map_or_else(vk::SwapchainKHR::null, |x| x.handle)),
                None,
            )
            .check("swapchain")?;
        this.images = ctx
            .swapchain_fn
            .get_swapchain_images(this.handle)
            .check("swapchain images")?;
        for &image in &this.images {
            let view = device
                .create_image_view(
                    &vk::ImageViewCreateInfo::default()
                        .image(image)
                        .view_type(vk::ImageViewType::TYPE_2D)
                        .format(ctx.surface_format.format)
                        .subresource_range(vk::ImageSubresourceRange {
                            aspect_mask: vk::ImageAspectFlags::COLOR,
                            base_mip_level: 0,
                            level_count: 1,
                            base_array_layer: 0,
                            layer_count: 1,
                        }),
                    None,
                )
                .check("swapchain image view")?;
            this.views.push(view);
            let framebuffer = device
                .create_framebuffer(
                    &vk::FramebufferCreateInfo::default()
                        .render_pass(ctx.render_passes.post)
                        .attachments(&[view])
                        .width(extent.width)
                        .height(extent.height)
                        .layers(1),
                    None,
                )
                .check("post framebuffer")?;
            this.framebuffers.push(framebuffer);
        }
        info!(
            width = extent.width,
            height = extent.height,
            images = this.images.len(),
            ?present_mode,
            "created swapchain"
        );
        Ok(this)
    }
}

fn surface(ctx: &Context) -> Result<&crate::context::Surface> {
    ctx.surface.as_ref().ok_or(crate::Error::ResourceCreation {
        what: "swapchain without a surface",
        result: vk::Result::ERROR_SURFACE_LOST_KHR,
    })
}

/// Extent the surface currently reports, or `window` clamped to its limits if it lets the
/// swapchain decide
pub fn surface_extent(ctx: &Context, window: vk::Extent2D) -> Result<vk::Extent2D> {
    let surface = surface(ctx)?;
    let caps = unsafe {
        surface
            .loader
            .get_physical_device_surface_capabilities(ctx.physical, surface.handle)
            .check("surface capabilities")?
    };
    Ok(choose_extent(&caps, window))
}

fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, requested: vk::Extent2D) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    vk::Extent2D {
        width: requested
            .width
            .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: requested
            .height
            .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR, desired: u32) -> u32 {
    let count = desired.max(caps.min_image_count);
    if caps.max_image_count == 0 {
        count
    } else {
        count.min(caps.max_image_count)
    }
}

fn choose_present_mode(
    available: &[vk::PresentModeKHR],
    desired: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if available.contains(&desired) {
        desired
    } else {
        vk::PresentModeKHR::FIFO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(current: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 4,
            current_extent: vk::Extent2D {
                width: current,
                height: current,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            ..Default::default()
        }
    }

    #[test]
    fn surface_extent_wins() {
        let requested = vk::Extent2D {
            width: 1024,
            height: 720,
        };
        assert_eq!(choose_extent(&caps(512), requested).width, 512);
        assert_eq!(choose_extent(&caps(u32::MAX), requested), requested);
        assert_eq!(
            choose_extent(
                &caps(u32::MAX),
                vk::Extent2D {
                    width: 10_000,
                    height: 0
                }
            ),
            vk::Extent2D {
                width: 4096,
                height: 1
            }
        );
    }

    #[test]
    fn image_count_clamped() {
        assert_eq!(choose_image_count(&caps(0), 3), 3);
        assert_eq!(choose_image_count(&caps(0), 1), 2);
        assert_eq!(choose_image_count(&caps(0), 8), 4);
        let unbounded = vk::SurfaceCapabilitiesKHR {
            max_image_count: 0,
            ..caps(0)
        };
        assert_eq!(choose_image_count(&unbounded, 8), 8);
    }

    #[test]
    fn present_mode_falls_back_to_fifo() {
        let available = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(
            choose_present_mode(&available, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::FIFO
        );
        assert_eq!(
            choose_present_mode(&available, vk::PresentModeKHR::IMMEDIATE),
            vk::PresentModeKHR::IMMEDIATE
        );
    }
}
