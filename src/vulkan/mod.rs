//! Vulkan implementation of the frame [`Backend`]

pub mod passes;
mod pipelines;
mod swapchain;
mod targets;

use std::{mem, sync::Arc};

use ash::vk;
use tracing::{debug, info};

pub use passes::RenderPasses;
pub use pipelines::binding;

use crate::{
    error::Check,
    frame::{Backend, CloudLayerRaw, CloudLayerSettings, FrameUniforms, Step},
    memory::Buffer,
    precompute::Atmosphere,
    Config, Context, Result, ShaderLibrary,
};
use pipelines::Pipelines;
use swapchain::Swapchain;
use targets::Targets;

/// Drives a swapchain on the context's surface
pub struct VulkanBackend {
    ctx: Arc<Context>,
    config: Config,
    /// Swapchain extent most recently requested
    extent: vk::Extent2D,
    // Destroyed before the pipelines and atmosphere they reference
    slots: Vec<Slot>,
    descriptor_pool: vk::DescriptorPool,
    swapchain: Option<Swapchain>,
    cmd_pool: vk::CommandPool,
    clouds: Buffer,
    pipelines: Pipelines,
    atmosphere: Atmosphere,
}

/// One frame's worth of resources
struct Slot {
    ctx: Arc<Context>,
    cmd: vk::CommandBuffer,
    ds: vk::DescriptorSet,
    image_acquired: vk::Semaphore,
    render_complete: vk::Semaphore,
    fence: vk::Fence,
    uniforms: Buffer,
    targets: Targets,
}

impl Drop for Slot {
    fn drop(&mut self) {
        let device = &self.ctx.device;
        unsafe {
            device.destroy_semaphore(self.image_acquired, None);
            device.destroy_semaphore(self.render_complete, None);
            device.destroy_fence(self.fence, None);
        }
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        unsafe {
            let _ = self.wait_all();
            self.release();
            self.ctx.device.destroy_command_pool(self.cmd_pool, None);
        }
    }
}

impl VulkanBackend {
    /// Set up rendering of `atmosphere` to a swapchain of approximately `extent`
    pub fn new(
        ctx: &Arc<Context>,
        config: &Config,
        atmosphere: Atmosphere,
        extent: vk::Extent2D,
    ) -> Result<Self> {
        let shaders = ShaderLibrary::new(&config.shader_dir);
        let pipelines = Pipelines::new(ctx, &shaders, atmosphere.descriptor_set_layout())?;
        unsafe {
            let clouds = Buffer::host_visible(
                ctx,
                mem::size_of::<CloudLayerRaw>() as vk::DeviceSize,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                c"cloud layer",
            )?;
            clouds.write(
                0,
                bytemuck::bytes_of(&CloudLayerRaw::from(&CloudLayerSettings::default())),
            );
            let mut this = Self {
                ctx: ctx.clone(),
                config: config.clone(),
                extent,
                slots: Vec::new(),
                descriptor_pool: vk::DescriptorPool::null(),
                swapchain: None,
                cmd_pool: vk::CommandPool::null(),
                clouds,
                pipelines,
                atmosphere,
            };
            this.cmd_pool = ctx
                .device
                .create_command_pool(
                    &vk::CommandPoolCreateInfo::default()
                        .queue_family_index(ctx.graphics.family)
                        .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER),
                    None,
                )
                .check("frame command pool")?;
            if extent.width != 0 && extent.height != 0 {
                let extent = swapchain::surface_extent(ctx, extent)?;
                if extent.width != 0 && extent.height != 0 {
                    this.recreate(extent)?;
                }
            }
            Ok(this)
        }
    }

    pub fn atmosphere(&self) -> &Atmosphere {
        &self.atmosphere
    }

    /// Extent of the current swapchain, or zero if there is none
    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain
            .as_ref()
            .map_or_else(vk::Extent2D::default, |x| x.extent)
    }

    /// Destroy every extent-dependent resource; the GPU must be idle
    unsafe fn release(&mut self) {
        let device = &self.ctx.device;
        let cmds = self.slots.iter().map(|x| x.cmd).collect::<Vec<_>>();
        self.slots.clear();
        if !cmds.is_empty() {
            device.free_command_buffers(self.cmd_pool, &cmds);
        }
        device.destroy_descriptor_pool(self.descriptor_pool, None);
        self.descriptor_pool = vk::DescriptorPool::null();
        self.swapchain = None;
    }

    unsafe fn create_slots(&mut self, extent: vk::Extent2D, count: u32) -> Result<()> {
        let ctx = &self.ctx;
        let device = &ctx.device;
        self.descriptor_pool = device
            .create_descriptor_pool(
                &vk::DescriptorPoolCreateInfo::default()
                    .max_sets(count)
                    .pool_sizes(&Pipelines::pool_sizes(count)),
                None,
            )
            .check("frame descriptor pool")?;
        let sets = device
            .allocate_descriptor_sets(
                &vk::DescriptorSetAllocateInfo::default()
                    .descriptor_pool(self.descriptor_pool)
                    .set_layouts(&vec![self.pipelines.frame_ds_layout; count as usize]),
            )
            .check("frame descriptor sets")?;
        let cmds = device
            .allocate_command_buffers(
                &vk::CommandBufferAllocateInfo::default()
                    .command_pool(self.cmd_pool)
                    .command_buffer_count(count),
            )
            .check("frame command buffers")?;
        let background_extent = self.config.background_extent(extent);
        for (cmd, ds) in cmds.into_iter().zip(sets) {
            let mut slot = Slot {
                ctx: ctx.clone(),
                cmd,
                ds,
                image_acquired: vk::Semaphore::null(),
                render_complete: vk::Semaphore::null(),
                fence: vk::Fence::null(),
                uniforms: Buffer::host_visible(
                    ctx,
                    mem::size_of::<FrameUniforms>() as vk::DeviceSize,
                    vk::BufferUsageFlags::UNIFORM_BUFFER,
                    c"frame uniforms",
                )?,
                targets: Targets::new(ctx, extent, background_extent)?,
            };
            slot.image_acquired = device
                .create_semaphore(&Default::default(), None)
                .check("semaphore")?;
            slot.render_complete = device
                .create_semaphore(&Default::default(), None)
                .check("semaphore")?;
            // Signaled, so the first wait on each slot returns immediately
            slot.fence = device
                .create_fence(
                    &vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED),
                    None,
                )
                .check("frame fence")?;
            ctx.set_name(slot.cmd, c"frame");
            ctx.set_name(slot.image_acquired, c"image acquired");
            ctx.set_name(slot.render_complete, c"render complete");
            ctx.set_name(slot.fence, c"frame complete");
            self.write_frame_set(&slot);
            self.slots.push(slot);
        }
        Ok(())
    }

    unsafe fn write_frame_set(&self, slot: &Slot) {
        let t = &slot.targets;
        let frame = [slot.uniforms.descriptor_info()];
        let clouds = [self.clouds.descriptor_info()];
        let image = |view, image_layout| {
            [vk::DescriptorImageInfo {
                sampler: vk::Sampler::null(),
                image_view: view,
                image_layout,
            }]
        };
        let read_only = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
        let background = image(t.background.view, read_only);
        let color = image(t.color.view, read_only);
        let normal = image(t.normal.view, read_only);
        let deferred = image(t.deferred.view, read_only);
        let depth = image(t.depth.view, vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL);
        let composite = image(t.composite.view, read_only);
        let ldr = image(t.ldr.view, read_only);
        let sampled = vk::DescriptorType::COMBINED_IMAGE_SAMPLER;
        self.ctx.device.update_descriptor_sets(
            &[
                vk::WriteDescriptorSet::default()
                    .dst_set(slot.ds)
                    .dst_binding(binding::FRAME)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .buffer_info(&frame),
                vk::WriteDescriptorSet::default()
                    .dst_set(slot.ds)
                    .dst_binding(binding::CLOUDS)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .buffer_info(&clouds),
                image_write(slot.ds, binding::BACKGROUND, sampled, &background),
                image_write(slot.ds, binding::COLOR, sampled, &color),
                image_write(slot.ds, binding::NORMAL, sampled, &normal),
                image_write(slot.ds, binding::DEFERRED, sampled, &deferred),
                image_write(slot.ds, binding::DEPTH, sampled, &depth),
                image_write(
                    slot.ds,
                    binding::COMPOSITE,
                    vk::DescriptorType::INPUT_ATTACHMENT,
                    &composite,
                ),
                image_write(slot.ds, binding::LDR, sampled, &ldr),
            ],
            &[],
        );
    }

    unsafe fn begin_pass(
        &self,
        cmd: vk::CommandBuffer,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear_values: &[vk::ClearValue],
    ) {
        let device = &self.ctx.device;
        let area = vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent,
        };
        device.cmd_begin_render_pass(
            cmd,
            &vk::RenderPassBeginInfo::default()
                .render_pass(render_pass)
                .framebuffer(framebuffer)
                .render_area(area)
                .clear_values(clear_values),
            vk::SubpassContents::INLINE,
        );
        device.cmd_set_viewport(
            cmd,
            0,
            &[vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: extent.width as f32,
                height: extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            }],
        );
        device.cmd_set_scissor(cmd, 0, &[area]);
    }

    /// Draw a full-screen triangle
    unsafe fn fullscreen(&self, slot: &Slot, pipeline: vk::Pipeline) {
        let device = &self.ctx.device;
        device.cmd_bind_pipeline(slot.cmd, vk::PipelineBindPoint::GRAPHICS, pipeline);
        device.cmd_bind_descriptor_sets(
            slot.cmd,
            vk::PipelineBindPoint::GRAPHICS,
            self.pipelines.layout,
            0,
            &[self.atmosphere.descriptor_set(), slot.ds],
            &[],
        );
        device.cmd_draw(slot.cmd, 3, 1, 0, 0);
    }

    /// Panics while parked. The orchestrator never records a frame then, since `slots()` is zero.
    fn swapchain(&self) -> &Swapchain {
        self.swapchain
            .as_ref()
            .expect("frame recorded without a swapchain")
    }
}

fn image_write<'a>(
    set: vk::DescriptorSet,
    binding: u32,
    ty: vk::DescriptorType,
    info: &'a [vk::DescriptorImageInfo; 1],
) -> vk::WriteDescriptorSet<'a> {
    vk::WriteDescriptorSet::default()
        .dst_set(set)
        .dst_binding(binding)
        .descriptor_type(ty)
        .image_info(info)
}

const CLEAR_COLOR: vk::ClearValue = vk::ClearValue {
    color: vk::ClearColorValue {
        float32: [0.0, 0.0, 0.0, 0.0],
    },
};

const CLEAR_DEPTH: vk::ClearValue = vk::ClearValue {
    depth_stencil: vk::ClearDepthStencilValue {
        depth: 0.0,
        stencil: 0,
    },
};

impl Backend for VulkanBackend {
    fn slots(&self) -> usize {
        self.slots.len()
    }

    fn surface_extent(&self, window: vk::Extent2D) -> Result<vk::Extent2D> {
        swapchain::surface_extent(&self.ctx, window)
    }

    fn wait_fence(&mut self, slot: usize) -> Result<()> {
        unsafe {
            self.ctx
                .device
                .wait_for_fences(&[self.slots[slot].fence], true, self.config.timeout_ns())
                .check("frame fence")
        }
    }

    fn reset_fence(&mut self, slot: usize) -> Result<()> {
        unsafe {
            self.ctx
                .device
                .reset_fences(&[self.slots[slot].fence])
                .check("frame fence")
        }
    }

    fn acquire(&mut self, slot: usize) -> Result<Option<u32>> {
        let result = unsafe {
            self.ctx.swapchain_fn.acquire_next_image(
                self.swapchain().handle,
                self.config.timeout_ns(),
                self.slots[slot].image_acquired,
                vk::Fence::null(),
            )
        };
        match result {
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(None),
            result => {
                let (index, suboptimal) = result.check("swapchain image")?;
                if suboptimal {
                    debug!("acquired image from suboptimal swapchain");
                }
                Ok(Some(index))
            }
        }
    }

    fn begin(&mut self, slot: usize, _image: u32, uniforms: &FrameUniforms) -> Result<()> {
        let device = &self.ctx.device;
        let s = &self.slots[slot];
        unsafe {
            s.uniforms.write(0, bytemuck::bytes_of(uniforms));
            device
                .begin_command_buffer(
                    s.cmd,
                    &vk::CommandBufferBeginInfo::default()
                        .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
                )
                .check("frame command buffer")?;
            device.cmd_pipeline_barrier(
                s.cmd,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &s.targets.reset_barriers(),
            );
            self.begin_pass(
                s.cmd,
                self.ctx.render_passes.background,
                s.targets.background_fb,
                s.targets.background.extent_2d(),
                &[CLEAR_COLOR],
            );
            self.fullscreen(s, self.pipelines.sky);
        }
        Ok(())
    }

    fn enter(&mut self, slot: usize, image: u32, step: Step) -> Result<()> {
        let device = &self.ctx.device;
        let s = &self.slots[slot];
        let extent = self.swapchain().extent;
        unsafe {
            match step {
                Step::Background => {}
                Step::Geometry => {
                    device.cmd_end_render_pass(s.cmd);
                    self.begin_pass(
                        s.cmd,
                        self.ctx.render_passes.geometry,
                        s.targets.geometry_fb,
                        extent,
                        &[CLEAR_COLOR, CLEAR_COLOR, CLEAR_COLOR, CLEAR_DEPTH],
                    );
                }
                Step::Composite => {
                    device.cmd_end_render_pass(s.cmd);
                    self.begin_pass(
                        s.cmd,
                        self.ctx.render_passes.composition,
                        s.targets.composition_fb,
                        extent,
                        &[],
                    );
                    self.fullscreen(s, self.pipelines.composite);
                }
                Step::ToneMap => {
                    device.cmd_next_subpass(s.cmd, vk::SubpassContents::INLINE);
                    self.fullscreen(s, self.pipelines.tonemap);
                }
                Step::PostEffects => {
                    device.cmd_end_render_pass(s.cmd);
                    self.begin_pass(
                        s.cmd,
                        self.ctx.render_passes.post,
                        self.swapchain().framebuffers[image as usize],
                        extent,
                        &[],
                    );
                    self.fullscreen(s, self.pipelines.post);
                }
                Step::Overlay => {
                    device.cmd_next_subpass(s.cmd, vk::SubpassContents::INLINE);
                }
            }
        }
        Ok(())
    }

    fn submit(&mut self, slot: usize, image: u32) -> Result<()> {
        let device = &self.ctx.device;
        let s = &self.slots[slot];
        unsafe {
            device.cmd_end_render_pass(s.cmd);
            device
                .end_command_buffer(s.cmd)
                .check("frame command buffer")?;
            device
                .queue_submit(
                    self.ctx.graphics.handle,
                    &[vk::SubmitInfo::default()
                        .wait_semaphores(&[s.image_acquired])
                        .wait_dst_stage_mask(&[vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT])
                        .command_buffers(&[s.cmd])
                        .signal_semaphores(&[s.render_complete])],
                    s.fence,
                )
                .check("frame submission")?;
            let present = self.ctx.swapchain_fn.queue_present(
                self.ctx.graphics.handle,
                &vk::PresentInfoKHR::default()
                    .wait_semaphores(&[s.render_complete])
                    .swapchains(&[self.swapchain().handle])
                    .image_indices(&[image]),
            );
            match present {
                Ok(false) => {}
                Ok(true) => debug!("presented to suboptimal swapchain"),
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => debug!("presented to stale swapchain"),
                Err(e) => return Err::<(), _>(e).check("present"),
            }
        }
        self.slots[slot].targets.fresh = false;
        Ok(())
    }

    fn command_buffer(&self, slot: usize) -> vk::CommandBuffer {
        self.slots[slot].cmd
    }

    fn wait_all(&mut self) -> Result<()> {
        if self.slots.is_empty() {
            return Ok(());
        }
        let fences = self.slots.iter().map(|x| x.fence).collect::<Vec<_>>();
        unsafe {
            self.ctx
                .device
                .wait_for_fences(&fences, true, self.config.timeout_ns())
                .check("frame fences")
        }
    }

    fn recreate(&mut self, extent: vk::Extent2D) -> Result<()> {
        unsafe {
            let old = self.swapchain.take();
            self.release();
            if extent.width == 0 || extent.height == 0 {
                return Ok(());
            }
            self.extent = extent;
            let swapchain = Swapchain::new(&self.ctx, &self.config, extent, old.as_ref())?;
            drop(old);
            let (extent, count) = (swapchain.extent, swapchain.images.len() as u32);
            self.swapchain = Some(swapchain);
            self.create_slots(extent, count)?;
            info!(
                width = extent.width,
                height = extent.height,
                slots = count,
                "frame resources ready"
            );
        }
        Ok(())
    }

    fn write_clouds(&mut self, clouds: &CloudLayerRaw) -> Result<()> {
        unsafe {
            self.clouds.write(0, bytemuck::bytes_of(clouds));
        }
        Ok(())
    }
}
