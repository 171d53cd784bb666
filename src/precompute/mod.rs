//! Precomputed atmospheric scattering
//!
//! Primarily derived from E. Bruneton and F. Neyret's "Precomputed atmospheric scattering". The
//! solve runs once, on the compute queue, and produces the transmittance, irradiance and
//! scattering LUTs sampled by every frame thereafter.

pub mod schedule;

use std::{mem, slice, sync::Arc, time::Instant};

use ash::vk;
use tracing::{debug, info, info_span, warn};

pub use schedule::{Access, Command, Kernel, Lut, PushConstants, Recorder, Schedule, Transition};

use crate::{
    context::SamplerKey,
    error::Check,
    memory::{Buffer, Image, ImageView},
    params::ParamsRaw,
    AtmosphereParams, Config, Context, Result, ShaderLibrary,
};

/// Compute pipelines for every kernel of the solve, specialized for one planet's radii
pub struct Precomputer {
    ctx: Arc<Context>,
    params: AtmosphereParams,
    /// Set 0 of every kernel: the parameter uniform block
    params_layout: vk::DescriptorSetLayout,
    /// Indexed by `Kernel as usize`
    passes: Vec<Pass>,
}

struct Pass {
    /// Set 1: sampled inputs, then storage outputs
    ds_layout: vk::DescriptorSetLayout,
    layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
}

impl Drop for Precomputer {
    fn drop(&mut self) {
        let device = &self.ctx.device;
        unsafe {
            for pass in &self.passes {
                device.destroy_pipeline(pass.pipeline, None);
                device.destroy_pipeline_layout(pass.layout, None);
                device.destroy_descriptor_set_layout(pass.ds_layout, None);
            }
            device.destroy_descriptor_set_layout(self.params_layout, None);
        }
    }
}

impl Precomputer {
    pub fn new(
        ctx: &Arc<Context>,
        shaders: &ShaderLibrary,
        params: &AtmosphereParams,
    ) -> Result<Self> {
        let device = &ctx.device;
        let sampler = ctx.sampler(lut_sampler(ctx))?;
        unsafe {
            let mut this = Self {
                ctx: ctx.clone(),
                params: *params,
                params_layout: vk::DescriptorSetLayout::null(),
                passes: Vec::with_capacity(Kernel::ALL.len()),
            };
            this.params_layout = device
                .create_descriptor_set_layout(
                    &vk::DescriptorSetLayoutCreateInfo::default().bindings(&[
                        vk::DescriptorSetLayoutBinding::default()
                            .binding(0)
                            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                            .descriptor_count(1)
                            .stage_flags(vk::ShaderStageFlags::COMPUTE),
                    ]),
                    None,
                )
                .check("precompute parameter layout")?;

            let mut modules = Vec::with_capacity(Kernel::ALL.len());
            for kernel in Kernel::ALL {
                let mut bindings = Vec::new();
                for i in 0..kernel.reads().len() {
                    bindings.push(
                        vk::DescriptorSetLayoutBinding::default()
                            .binding(i as u32)
                            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                            .stage_flags(vk::ShaderStageFlags::COMPUTE)
                            .immutable_samplers(slice::from_ref(&sampler)),
                    );
                }
                for i in 0..kernel.writes().len() {
                    bindings.push(
                        vk::DescriptorSetLayoutBinding::default()
                            .binding((kernel.reads().len() + i) as u32)
                            .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                            .descriptor_count(1)
                            .stage_flags(vk::ShaderStageFlags::COMPUTE),
                    );
                }
                let ds_layout = device
                    .create_descriptor_set_layout(
                        &vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings),
                        None,
                    )
                    .check("precompute descriptor set layout")?;
                let layout = device
                    .create_pipeline_layout(
                        &vk::PipelineLayoutCreateInfo::default()
                            .set_layouts(&[this.params_layout, ds_layout])
                            .push_constant_ranges(&[vk::PushConstantRange {
                                stage_flags: vk::ShaderStageFlags::COMPUTE,
                                offset: 0,
                                size: mem::size_of::<PushConstants>() as u32,
                            }]),
                        None,
                    );
                let layout = match layout.check("precompute pipeline layout") {
                    Ok(x) => x,
                    Err(e) => {
                        device.destroy_descriptor_set_layout(ds_layout, None);
                        return Err(e);
                    }
                };
                this.passes.push(Pass {
                    ds_layout,
                    layout,
                    pipeline: vk::Pipeline::null(),
                });
                modules.push(shaders.load(ctx, &format!("{}.comp", kernel.name()))?);
            }

            let radii = params.radii_km();
            let spec_map = [
                vk::SpecializationMapEntry {
                    constant_id: 0,
                    offset: 0,
                    size: 4,
                },
                vk::SpecializationMapEntry {
                    constant_id: 1,
                    offset: 4,
                    size: 4,
                },
            ];
            let spec = vk::SpecializationInfo::default()
                .map_entries(&spec_map)
                .data(bytemuck::bytes_of(&radii));
            let infos = this
                .passes
                .iter()
                .zip(&modules)
                .map(|(pass, module)| {
                    vk::ComputePipelineCreateInfo::default()
                        .stage(
                            vk::PipelineShaderStageCreateInfo::default()
                                .stage(vk::ShaderStageFlags::COMPUTE)
                                .module(module.handle)
                                .name(c"main")
                                .specialization_info(&spec),
                        )
                        .layout(pass.layout)
                })
                .collect::<Vec<_>>();
            let pipelines = device
                .create_compute_pipelines(ctx.pipeline_cache, &infos, None)
                .check("precompute pipelines")?;
            for ((pass, pipeline), kernel) in this.passes.iter_mut().zip(pipelines).zip(Kernel::ALL) {
                pass.pipeline = pipeline;
                ctx.set_name(pipeline, &c_name(kernel.name()));
            }
            Ok(this)
        }
    }

    /// Run the solve to `order` orders of scattering, blocking until the LUTs are ready
    ///
    /// Waits on the compute queue once per order. Fails fast: any Vulkan error aborts the solve and
    /// is returned after the device has gone idle.
    pub fn run(&self, order: u32, timeout_ns: u64) -> Result<Atmosphere> {
        let span = info_span!("precompute", order);
        let _guard = span.enter();
        let started = Instant::now();
        let ctx = &self.ctx;
        let device = &ctx.device;
        unsafe {
            let atmosphere = Atmosphere::new(ctx, &self.params)?;
            let mut scratch = Scratch::new(ctx)?;

            let pool = device
                .create_descriptor_pool(
                    &vk::DescriptorPoolCreateInfo::default()
                        .max_sets(1 + Kernel::ALL.len() as u32)
                        .pool_sizes(&kernel_pool_sizes()),
                    None,
                )
                .check("precompute descriptor pool")?;
            scratch.descriptor_pool = pool;
            let mut layouts = vec![self.params_layout];
            layouts.extend(self.passes.iter().map(|x| x.ds_layout));
            let sets = device
                .allocate_descriptor_sets(
                    &vk::DescriptorSetAllocateInfo::default()
                        .descriptor_pool(pool)
                        .set_layouts(&layouts),
                )
                .check("precompute descriptor sets")?;

            let mut views = [vk::ImageView::null(); Lut::ALL.len()];
            let mut images = [vk::Image::null(); Lut::ALL.len()];
            for lut in Lut::ALL {
                let (image, view) = match lut {
                    Lut::Transmittance => (
                        atmosphere.transmittance.handle,
                        atmosphere.transmittance_base.handle,
                    ),
                    Lut::Irradiance => (atmosphere.irradiance.handle, atmosphere.irradiance.view),
                    Lut::Scattering => (atmosphere.scattering.handle, atmosphere.scattering.view),
                    _ => scratch.image(lut)?,
                };
                images[lut.index()] = image;
                views[lut.index()] = view;
            }
            write_kernel_sets(ctx, &sets, &views, &atmosphere.params);

            let mut recorder = VulkanRecorder {
                ctx,
                passes: &self.passes,
                params_set: sets[0],
                kernel_sets: &sets[1..],
                images,
                params_buffer: atmosphere.params.handle,
                compute_cmd: scratch.compute_cmd,
                graphics_cmd: scratch.graphics_cmd,
                fence: scratch.fence,
                recording: false,
                released: Vec::new(),
                timeout_ns,
            };
            let schedule = Schedule::plan(order);
            schedule.execute(&mut recorder)?;
            drop(scratch);

            info!(
                orders = schedule.order(),
                elapsed = ?started.elapsed(),
                "atmosphere ready"
            );
            Ok(atmosphere)
        }
    }
}

/// Build an atmosphere for `params`, per `config`
pub fn build(
    ctx: &Arc<Context>,
    config: &Config,
    params: &AtmosphereParams,
) -> Result<Atmosphere> {
    let shaders = ShaderLibrary::new(&config.shader_dir);
    Precomputer::new(ctx, &shaders, params)?.run(config.order(), config.timeout_ns())
}

fn lut_sampler(ctx: &Context) -> SamplerKey {
    if ctx.supports_linear_filter(Lut::Scattering.format()) {
        SamplerKey::LINEAR_CLAMP
    } else {
        warn!("LUT format does not support linear filtering");
        SamplerKey::NEAREST_CLAMP
    }
}

fn c_name(name: &str) -> std::ffi::CString {
    std::ffi::CString::new(name).unwrap_or_default()
}

fn kernel_pool_sizes() -> [vk::DescriptorPoolSize; 3] {
    let reads = Kernel::ALL.iter().map(|k| k.reads().len() as u32).sum();
    let writes = Kernel::ALL.iter().map(|k| k.writes().len() as u32).sum();
    [
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: 1,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: reads,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::STORAGE_IMAGE,
            descriptor_count: writes,
        },
    ]
}

unsafe fn write_kernel_sets(
    ctx: &Context,
    sets: &[vk::DescriptorSet],
    views: &[vk::ImageView; Lut::ALL.len()],
    params: &Buffer,
) {
    let buffer_info = [params.descriptor_info()];
    let sampled = Lut::ALL.map(|lut| {
        [vk::DescriptorImageInfo {
            sampler: vk::Sampler::null(),
            image_view: views[lut.index()],
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }]
    });
    let storage = Lut::ALL.map(|lut| {
        [vk::DescriptorImageInfo {
            sampler: vk::Sampler::null(),
            image_view: views[lut.index()],
            image_layout: vk::ImageLayout::GENERAL,
        }]
    });
    let mut writes = vec![vk::WriteDescriptorSet::default()
        .dst_set(sets[0])
        .dst_binding(0)
        .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
        .buffer_info(&buffer_info)];
    for (kernel, &set) in Kernel::ALL.iter().zip(&sets[1..]) {
        let reads = kernel.reads();
        for (i, lut) in reads.iter().enumerate() {
            writes.push(
                vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(i as u32)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .image_info(&sampled[lut.index()]),
            );
        }
        for (i, lut) in kernel.writes().iter().enumerate() {
            writes.push(
                vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding((reads.len() + i) as u32)
                    .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                    .image_info(&storage[lut.index()]),
            );
        }
    }
    ctx.device.update_descriptor_sets(&writes, &[]);
}

/// Resources that only live for the duration of the solve
struct Scratch {
    ctx: Arc<Context>,
    images: Vec<Image>,
    descriptor_pool: vk::DescriptorPool,
    compute_pool: vk::CommandPool,
    graphics_pool: vk::CommandPool,
    compute_cmd: vk::CommandBuffer,
    graphics_cmd: vk::CommandBuffer,
    fence: vk::Fence,
}

impl Drop for Scratch {
    fn drop(&mut self) {
        let device = &self.ctx.device;
        unsafe {
            // After a failure, work may still be pending.
            let _ = device.device_wait_idle();
            device.destroy_fence(self.fence, None);
            device.destroy_command_pool(self.compute_pool, None);
            device.destroy_command_pool(self.graphics_pool, None);
            device.destroy_descriptor_pool(self.descriptor_pool, None);
        }
    }
}

impl Scratch {
    unsafe fn new(ctx: &Arc<Context>) -> Result<Self> {
        let device = &ctx.device;
        let mut this = Self {
            ctx: ctx.clone(),
            images: Vec::new(),
            descriptor_pool: vk::DescriptorPool::null(),
            compute_pool: vk::CommandPool::null(),
            graphics_pool: vk::CommandPool::null(),
            compute_cmd: vk::CommandBuffer::null(),
            graphics_cmd: vk::CommandBuffer::null(),
            fence: vk::Fence::null(),
        };
        this.fence = device
            .create_fence(&vk::FenceCreateInfo::default(), None)
            .check("precompute fence")?;
        for (family, pool, cmd) in [
            (ctx.compute.family, &mut this.compute_pool, &mut this.compute_cmd),
            (ctx.graphics.family, &mut this.graphics_pool, &mut this.graphics_cmd),
        ] {
            *pool = device
                .create_command_pool(
                    &vk::CommandPoolCreateInfo::default()
                        .queue_family_index(family)
                        .flags(
                            vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER
                                | vk::CommandPoolCreateFlags::TRANSIENT,
                        ),
                    None,
                )
                .check("precompute command pool")?;
            *cmd = device
                .allocate_command_buffers(
                    &vk::CommandBufferAllocateInfo::default()
                        .command_pool(*pool)
                        .command_buffer_count(1),
                )
                .check("precompute command buffer")?[0];
        }
        Ok(this)
    }

    /// Allocate a scratch LUT, returning its image and view
    unsafe fn image(&mut self, lut: Lut) -> Result<(vk::Image, vk::ImageView)> {
        let name = match lut {
            Lut::DeltaE => c"delta E",
            Lut::DeltaSR => c"delta S_R",
            Lut::DeltaSM => c"delta S_M",
            _ => c"delta J",
        };
        let image = Image::new(
            &self.ctx,
            &lut_image_info(lut, vk::ImageUsageFlags::empty()),
            vk::ImageAspectFlags::COLOR,
            name,
        )?;
        let handles = (image.handle, image.view);
        self.images.push(image);
        Ok(handles)
    }
}

fn lut_image_info(lut: Lut, extra_usage: vk::ImageUsageFlags) -> vk::ImageCreateInfo<'static> {
    vk::ImageCreateInfo {
        image_type: lut.image_type(),
        format: lut.format(),
        extent: lut.extent(),
        mip_levels: lut.mip_levels(),
        array_layers: 1,
        samples: vk::SampleCountFlags::TYPE_1,
        tiling: vk::ImageTiling::OPTIMAL,
        usage: vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::SAMPLED | extra_usage,
        sharing_mode: vk::SharingMode::EXCLUSIVE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        ..Default::default()
    }
}

fn lut_range(lut: Lut) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: lut.mip_levels(),
        base_array_layer: 0,
        layer_count: 1,
    }
}

/// Records a `Schedule` into command buffers and submits them
struct VulkanRecorder<'a> {
    ctx: &'a Context,
    passes: &'a [Pass],
    params_set: vk::DescriptorSet,
    kernel_sets: &'a [vk::DescriptorSet],
    images: [vk::Image; Lut::ALL.len()],
    params_buffer: vk::Buffer,
    compute_cmd: vk::CommandBuffer,
    graphics_cmd: vk::CommandBuffer,
    fence: vk::Fence,
    recording: bool,
    /// Final transitions of the permanent LUTs, mirrored by the graphics queue's acquire
    released: Vec<Transition>,
    timeout_ns: u64,
}

impl VulkanRecorder<'_> {
    fn cmd(&mut self) -> Result<vk::CommandBuffer> {
        if !self.recording {
            unsafe {
                self.ctx
                    .device
                    .begin_command_buffer(
                        self.compute_cmd,
                        &vk::CommandBufferBeginInfo::default()
                            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
                    )
                    .check("precompute command buffer")?;
            }
            self.recording = true;
        }
        Ok(self.compute_cmd)
    }

    fn image_barrier(&self, t: &Transition) -> vk::ImageMemoryBarrier<'static> {
        vk::ImageMemoryBarrier {
            src_access_mask: t.from.access_mask(),
            dst_access_mask: t.to.access_mask(),
            old_layout: t.from.layout(),
            new_layout: t.to.layout(),
            src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            image: self.images[t.lut.index()],
            subresource_range: lut_range(t.lut),
            ..Default::default()
        }
    }

    /// Barriers transferring the permanent LUTs and parameters from the compute to the graphics
    /// family, with the same layouts on both sides
    fn ownership_transfer(
        &self,
    ) -> (
        vk::BufferMemoryBarrier<'static>,
        Vec<vk::ImageMemoryBarrier<'static>>,
    ) {
        let buffer = vk::BufferMemoryBarrier {
            src_queue_family_index: self.ctx.compute.family,
            dst_queue_family_index: self.ctx.graphics.family,
            buffer: self.params_buffer,
            offset: 0,
            size: vk::WHOLE_SIZE,
            ..Default::default()
        };
        let images = self
            .released
            .iter()
            .map(|t| vk::ImageMemoryBarrier {
                src_access_mask: vk::AccessFlags::empty(),
                dst_access_mask: vk::AccessFlags::empty(),
                src_queue_family_index: self.ctx.compute.family,
                dst_queue_family_index: self.ctx.graphics.family,
                ..self.image_barrier(t)
            })
            .collect();
        (buffer, images)
    }

    unsafe fn submit(&self, queue: vk::Queue, cmd: vk::CommandBuffer) -> Result<()> {
        let device = &self.ctx.device;
        device
            .end_command_buffer(cmd)
            .check("precompute command buffer")?;
        device
            .queue_submit(
                queue,
                &[vk::SubmitInfo::default().command_buffers(&[cmd])],
                self.fence,
            )
            .check("precompute submission")?;
        device
            .wait_for_fences(&[self.fence], true, self.timeout_ns)
            .check("precompute fence")?;
        device.reset_fences(&[self.fence]).check("precompute fence")?;
        device
            .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
            .check("precompute command buffer")
    }
}

impl Recorder for VulkanRecorder<'_> {
    fn barrier(&mut self, transitions: &[Transition]) -> Result<()> {
        let cmd = self.cmd()?;
        let src = transitions
            .iter()
            .fold(vk::PipelineStageFlags::empty(), |acc, t| acc | t.from.stage());
        let dst = transitions
            .iter()
            .fold(vk::PipelineStageFlags::empty(), |acc, t| acc | t.to.stage());
        let barriers = transitions
            .iter()
            .map(|t| self.image_barrier(t))
            .collect::<Vec<_>>();
        unsafe {
            self.ctx.device.cmd_pipeline_barrier(
                cmd,
                src,
                dst,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &barriers,
            );
        }
        Ok(())
    }

    fn clear(&mut self, lut: Lut) -> Result<()> {
        let cmd = self.cmd()?;
        unsafe {
            self.ctx.device.cmd_clear_color_image(
                cmd,
                self.images[lut.index()],
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &vk::ClearColorValue {
                    float32: [0.0; 4],
                },
                &[lut_range(lut)],
            );
        }
        Ok(())
    }

    fn dispatch(&mut self, kernel: Kernel, push: PushConstants) -> Result<()> {
        let cmd = self.cmd()?;
        let device = &self.ctx.device;
        let pass = &self.passes[kernel as usize];
        let [x, y, z] = kernel.groups();
        unsafe {
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, pass.pipeline);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                pass.layout,
                0,
                &[self.params_set, self.kernel_sets[kernel as usize]],
                &[],
            );
            device.cmd_push_constants(
                cmd,
                pass.layout,
                vk::ShaderStageFlags::COMPUTE,
                0,
                bytemuck::bytes_of(&push),
            );
            device.cmd_dispatch(cmd, x, y, z);
        }
        Ok(())
    }

    fn finalize(&mut self, transitions: &[Transition]) -> Result<()> {
        let cmd = self.cmd()?;
        self.released = transitions.to_vec();
        unsafe {
            if self.ctx.split_queues() {
                // Release; the matching acquire is recorded on the graphics queue
                let (buffer, mut images) = self.ownership_transfer();
                for (barrier, t) in images.iter_mut().zip(transitions) {
                    barrier.src_access_mask = t.from.access_mask();
                }
                self.ctx.device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::COMPUTE_SHADER,
                    vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[buffer],
                    &images,
                );
            } else {
                let images = transitions
                    .iter()
                    .map(|t| vk::ImageMemoryBarrier {
                        dst_access_mask: vk::AccessFlags::SHADER_READ
                            | vk::AccessFlags::TRANSFER_READ,
                        ..self.image_barrier(t)
                    })
                    .collect::<Vec<_>>();
                self.ctx.device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::COMPUTE_SHADER,
                    vk::PipelineStageFlags::FRAGMENT_SHADER | vk::PipelineStageFlags::TRANSFER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &images,
                );
            }
        }
        Ok(())
    }

    fn flush(&mut self, order: u32) -> Result<()> {
        if !self.recording {
            return Ok(());
        }
        unsafe {
            self.submit(self.ctx.compute.handle, self.compute_cmd)?;
        }
        self.recording = false;
        debug!(order, "scattering order complete");
        Ok(())
    }

    fn generate_mips(&mut self, lut: Lut) -> Result<()> {
        let device = &self.ctx.device;
        let cmd = self.graphics_cmd;
        let image = self.images[lut.index()];
        let levels = lut.mip_levels();
        let extent = lut.extent();
        let filter = if self.ctx.supports_linear_filter(lut.format()) {
            vk::Filter::LINEAR
        } else {
            warn!(?lut, "linear blits unsupported; generating mips with nearest filtering");
            vk::Filter::NEAREST
        };
        let level = |base_mip_level, level_count| vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level,
            level_count,
            base_array_layer: 0,
            layer_count: 1,
        };
        let barrier = vk::ImageMemoryBarrier {
            src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            image,
            ..Default::default()
        };
        unsafe {
            device
                .begin_command_buffer(
                    cmd,
                    &vk::CommandBufferBeginInfo::default()
                        .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
                )
                .check("mip generation command buffer")?;

            if self.ctx.split_queues() {
                // Acquire, mirroring the release recorded by `finalize`
                let (buffer, images) = self.ownership_transfer();
                let images = images
                    .into_iter()
                    .zip(&self.released)
                    .map(|(b, t)| vk::ImageMemoryBarrier {
                        dst_access_mask: t.to.access_mask(),
                        ..b
                    })
                    .collect::<Vec<_>>();
                device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TOP_OF_PIPE,
                    vk::PipelineStageFlags::FRAGMENT_SHADER | vk::PipelineStageFlags::TRANSFER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[vk::BufferMemoryBarrier {
                        dst_access_mask: vk::AccessFlags::UNIFORM_READ,
                        ..buffer
                    }],
                    &images,
                );
            }

            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[
                    vk::ImageMemoryBarrier {
                        src_access_mask: vk::AccessFlags::SHADER_READ,
                        dst_access_mask: vk::AccessFlags::TRANSFER_READ,
                        old_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                        new_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        subresource_range: level(0, 1),
                        ..barrier
                    },
                    vk::ImageMemoryBarrier {
                        dst_access_mask: vk::AccessFlags::TRANSFER_WRITE,
                        old_layout: vk::ImageLayout::UNDEFINED,
                        new_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        subresource_range: level(1, levels - 1),
                        ..barrier
                    },
                ],
            );
            for mip in 1..levels {
                let size = |m: u32| vk::Offset3D {
                    x: (extent.width >> m).max(1) as i32,
                    y: (extent.height >> m).max(1) as i32,
                    z: 1,
                };
                let layers = |mip_level| vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level,
                    base_array_layer: 0,
                    layer_count: 1,
                };
                device.cmd_blit_image(
                    cmd,
                    image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[vk::ImageBlit {
                        src_subresource: layers(mip - 1),
                        src_offsets: [vk::Offset3D::default(), size(mip - 1)],
                        dst_subresource: layers(mip),
                        dst_offsets: [vk::Offset3D::default(), size(mip)],
                    }],
                    filter,
                );
                device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[vk::ImageMemoryBarrier {
                        src_access_mask: vk::AccessFlags::TRANSFER_WRITE,
                        dst_access_mask: vk::AccessFlags::TRANSFER_READ,
                        old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        new_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        subresource_range: level(mip, 1),
                        ..barrier
                    }],
                );
            }
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[vk::ImageMemoryBarrier {
                    src_access_mask: vk::AccessFlags::TRANSFER_WRITE,
                    dst_access_mask: vk::AccessFlags::SHADER_READ,
                    old_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    new_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    subresource_range: level(0, levels),
                    ..barrier
                }],
            );
            self.submit(self.ctx.graphics.handle, cmd)?;
        }
        debug!(?lut, levels, "mip chain generated");
        Ok(())
    }
}

/// The precomputed LUTs of one atmosphere, ready for rendering
///
/// Immutable once built; shared read-only by every frame through `descriptor_set`.
pub struct Atmosphere {
    ctx: Arc<Context>,
    params_value: AtmosphereParams,
    ds_layout: vk::DescriptorSetLayout,
    descriptor_pool: vk::DescriptorPool,
    ds: vk::DescriptorSet,
    /// Level 0 only, for storage and sampling while precomputing
    transmittance_base: ImageView,
    transmittance: Image,
    irradiance: Image,
    scattering: Image,
    params: Buffer,
}

impl Drop for Atmosphere {
    fn drop(&mut self) {
        let device = &self.ctx.device;
        unsafe {
            device.destroy_descriptor_pool(self.descriptor_pool, None);
            device.destroy_descriptor_set_layout(self.ds_layout, None);
        }
    }
}

impl Atmosphere {
    unsafe fn new(ctx: &Arc<Context>, params: &AtmosphereParams) -> Result<Self> {
        let device = &ctx.device;
        let transmittance = Image::new(
            ctx,
            &lut_image_info(
                Lut::Transmittance,
                vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST,
            ),
            vk::ImageAspectFlags::COLOR,
            c"transmittance",
        )?;
        let transmittance_base = ImageView::base_level(ctx, &transmittance)?;
        let irradiance = Image::new(
            ctx,
            &lut_image_info(Lut::Irradiance, vk::ImageUsageFlags::TRANSFER_DST),
            vk::ImageAspectFlags::COLOR,
            c"irradiance",
        )?;
        let scattering = Image::new(
            ctx,
            &lut_image_info(Lut::Scattering, vk::ImageUsageFlags::TRANSFER_DST),
            vk::ImageAspectFlags::COLOR,
            c"scattering",
        )?;
        let raw = ParamsRaw::new(params);
        let params_buffer = Buffer::host_visible(
            ctx,
            mem::size_of::<ParamsRaw>() as vk::DeviceSize,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            c"atmosphere parameters",
        )?;
        params_buffer.write(0, bytemuck::bytes_of(&raw));

        let mut this = Self {
            ctx: ctx.clone(),
            params_value: *params,
            ds_layout: vk::DescriptorSetLayout::null(),
            descriptor_pool: vk::DescriptorPool::null(),
            ds: vk::DescriptorSet::null(),
            transmittance_base,
            transmittance,
            irradiance,
            scattering,
            params: params_buffer,
        };

        let sampler = ctx.sampler(lut_sampler(ctx))?;
        let stages = vk::ShaderStageFlags::FRAGMENT | vk::ShaderStageFlags::COMPUTE;
        let lut_binding = |binding| {
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .stage_flags(stages)
                .immutable_samplers(slice::from_ref(&sampler))
        };
        this.ds_layout = device
            .create_descriptor_set_layout(
                &vk::DescriptorSetLayoutCreateInfo::default().bindings(&[
                    vk::DescriptorSetLayoutBinding::default()
                        .binding(0)
                        .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                        .descriptor_count(1)
                        .stage_flags(stages),
                    lut_binding(1),
                    lut_binding(2),
                    lut_binding(3),
                ]),
                None,
            )
            .check("atmosphere descriptor set layout")?;
        this.descriptor_pool = device
            .create_descriptor_pool(
                &vk::DescriptorPoolCreateInfo::default()
                    .max_sets(1)
                    .pool_sizes(&[
                        vk::DescriptorPoolSize {
                            ty: vk::DescriptorType::UNIFORM_BUFFER,
                            descriptor_count: 1,
                        },
                        vk::DescriptorPoolSize {
                            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                            descriptor_count: 3,
                        },
                    ]),
                None,
            )
            .check("atmosphere descriptor pool")?;
        this.ds = device
            .allocate_descriptor_sets(
                &vk::DescriptorSetAllocateInfo::default()
                    .descriptor_pool(this.descriptor_pool)
                    .set_layouts(&[this.ds_layout]),
            )
            .check("atmosphere descriptor set")?[0];

        let lut_info = |view| {
            [vk::DescriptorImageInfo {
                sampler: vk::Sampler::null(),
                image_view: view,
                image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            }]
        };
        let buffer_info = [this.params.descriptor_info()];
        let transmittance_info = lut_info(this.transmittance.view);
        let irradiance_info = lut_info(this.irradiance.view);
        let scattering_info = lut_info(this.scattering.view);
        let write = |binding, info| {
            vk::WriteDescriptorSet::default()
                .dst_set(this.ds)
                .dst_binding(binding)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .image_info(info)
        };
        device.update_descriptor_sets(
            &[
                vk::WriteDescriptorSet::default()
                    .dst_set(this.ds)
                    .dst_binding(0)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .buffer_info(&buffer_info),
                write(1, &transmittance_info),
                write(2, &irradiance_info),
                write(3, &scattering_info),
            ],
            &[],
        );
        Ok(this)
    }

    pub fn params(&self) -> &AtmosphereParams {
        &self.params_value
    }

    /// Layout of `descriptor_set`: binding 0 parameters, 1 transmittance, 2 irradiance,
    /// 3 scattering
    pub fn descriptor_set_layout(&self) -> vk::DescriptorSetLayout {
        self.ds_layout
    }

    pub fn descriptor_set(&self) -> vk::DescriptorSet {
        self.ds
    }

    pub fn transmittance(&self) -> &Image {
        &self.transmittance
    }

    pub fn irradiance(&self) -> &Image {
        &self.irradiance
    }

    pub fn scattering(&self) -> &Image {
        &self.scattering
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_covers_every_binding() {
        let [ubo, sampled, storage] = kernel_pool_sizes();
        assert_eq!(ubo.descriptor_count, 1);
        assert_eq!(sampled.descriptor_count, 14);
        assert_eq!(storage.descriptor_count, 10);
    }

    #[test]
    fn scratch_luts_are_not_transfer_targets() {
        let info = lut_image_info(Lut::DeltaJ, vk::ImageUsageFlags::empty());
        assert_eq!(info.image_type, vk::ImageType::TYPE_3D);
        assert_eq!(
            info.usage,
            vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::SAMPLED
        );
        assert_eq!(lut_range(Lut::Transmittance).level_count, 9);
    }
}
