//! Full-screen pipelines drawn by the frame itself, and the per-frame descriptor set they share

use std::sync::Arc;

use ash::vk;

use crate::{
    context::SamplerKey, error::Check, shader::ShaderModule, Context, Result, ShaderLibrary,
};

/// Bindings of the per-frame descriptor set
pub mod binding {
    pub const FRAME: u32 = 0;
    pub const CLOUDS: u32 = 1;
    pub const BACKGROUND: u32 = 2;
    pub const COLOR: u32 = 3;
    pub const NORMAL: u32 = 4;
    pub const DEFERRED: u32 = 5;
    pub const DEPTH: u32 = 6;
    /// Input attachment of the tone mapping subpass
    pub const COMPOSITE: u32 = 7;
    pub const LDR: u32 = 8;
}

pub struct Pipelines {
    ctx: Arc<Context>,
    pub frame_ds_layout: vk::DescriptorSetLayout,
    /// Set 0: atmosphere; set 1: frame
    pub layout: vk::PipelineLayout,
    pub sky: vk::Pipeline,
    pub composite: vk::Pipeline,
    pub tonemap: vk::Pipeline,
    pub post: vk::Pipeline,
}

impl Drop for Pipelines {
    fn drop(&mut self) {
        let device = &self.ctx.device;
        unsafe {
            for pipeline in [self.sky, self.composite, self.tonemap, self.post] {
                device.destroy_pipeline(pipeline, None);
            }
            device.destroy_pipeline_layout(self.layout, None);
            device.destroy_descriptor_set_layout(self.frame_ds_layout, None);
        }
    }
}

impl Pipelines {
    pub fn new(
        ctx: &Arc<Context>,
        shaders: &ShaderLibrary,
        atmosphere_ds_layout: vk::DescriptorSetLayout,
    ) -> Result<Self> {
        let device = &ctx.device;
        let linear = ctx.sampler(SamplerKey::LINEAR_CLAMP)?;
        let nearest = ctx.sampler(SamplerKey::NEAREST_CLAMP)?;
        unsafe {
            let mut this = Self {
                ctx: ctx.clone(),
                frame_ds_layout: vk::DescriptorSetLayout::null(),
                layout: vk::PipelineLayout::null(),
                sky: vk::Pipeline::null(),
                composite: vk::Pipeline::null(),
                tonemap: vk::Pipeline::null(),
                post: vk::Pipeline::null(),
            };
            let stages = vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT;
            let uniform = |binding| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .descriptor_count(1)
                    .stage_flags(stages)
            };
            this.frame_ds_layout = device
                .create_descriptor_set_layout(
                    &vk::DescriptorSetLayoutCreateInfo::default().bindings(&[
                        uniform(binding::FRAME),
                        uniform(binding::CLOUDS),
                        sampled_binding(binding::BACKGROUND, &linear),
                        sampled_binding(binding::COLOR, &nearest),
                        sampled_binding(binding::NORMAL, &nearest),
                        sampled_binding(binding::DEFERRED, &nearest),
                        sampled_binding(binding::DEPTH, &nearest),
                        vk::DescriptorSetLayoutBinding::default()
                            .binding(binding::COMPOSITE)
                            .descriptor_type(vk::DescriptorType::INPUT_ATTACHMENT)
                            .descriptor_count(1)
                            .stage_flags(vk::ShaderStageFlags::FRAGMENT),
                        sampled_binding(binding::LDR, &linear),
                    ]),
                    None,
                )
                .check("frame descriptor set layout")?;
            this.layout = device
                .create_pipeline_layout(
                    &vk::PipelineLayoutCreateInfo::default()
                        .set_layouts(&[atmosphere_ds_layout, this.frame_ds_layout]),
                    None,
                )
                .check("frame pipeline layout")?;

            let vert = shaders.load(ctx, "fullscreen.vert")?;
            let passes = &ctx.render_passes;
            let targets = [
                ("sky.frag", passes.background, 0),
                ("composite.frag", passes.composition, 0),
                ("tonemap.frag", passes.composition, 1),
                ("post.frag", passes.post, 0),
            ];
            let frags = targets
                .iter()
                .map(|&(name, _, _)| shaders.load(ctx, name))
                .collect::<Result<Vec<ShaderModule>>>()?;

            let noop_stencil_state = vk::StencilOpState {
                fail_op: vk::StencilOp::KEEP,
                pass_op: vk::StencilOp::KEEP,
                depth_fail_op: vk::StencilOp::KEEP,
                compare_op: vk::CompareOp::ALWAYS,
                ..Default::default()
            };
            let stages = frags
                .iter()
                .map(|frag| {
                    [
                        vk::PipelineShaderStageCreateInfo::default()
                            .stage(vk::ShaderStageFlags::VERTEX)
                            .module(vert.handle)
                            .name(c"main"),
                        vk::PipelineShaderStageCreateInfo::default()
                            .stage(vk::ShaderStageFlags::FRAGMENT)
                            .module(frag.handle)
                            .name(c"main"),
                    ]
                })
                .collect::<Vec<_>>();
            let vertex_input = vk::PipelineVertexInputStateCreateInfo::default();
            let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
                .topology(vk::PrimitiveTopology::TRIANGLE_LIST);
            let viewport = vk::PipelineViewportStateCreateInfo::default()
                .scissor_count(1)
                .viewport_count(1);
            let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
                .cull_mode(vk::CullModeFlags::NONE)
                .polygon_mode(vk::PolygonMode::FILL)
                .line_width(1.0);
            let multisample = vk::PipelineMultisampleStateCreateInfo::default()
                .rasterization_samples(vk::SampleCountFlags::TYPE_1);
            let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
                .depth_test_enable(false)
                .front(noop_stencil_state)
                .back(noop_stencil_state);
            let blend_attachments = [vk::PipelineColorBlendAttachmentState {
                blend_enable: vk::FALSE,
                color_write_mask: vk::ColorComponentFlags::RGBA,
                ..Default::default()
            }];
            let blend =
                vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);
            let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
            let dynamic =
                vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);
            let infos = targets
                .iter()
                .zip(&stages)
                .map(|(&(_, render_pass, subpass), stages)| {
                    vk::GraphicsPipelineCreateInfo::default()
                        .stages(stages)
                        .vertex_input_state(&vertex_input)
                        .input_assembly_state(&input_assembly)
                        .viewport_state(&viewport)
                        .rasterization_state(&rasterization)
                        .multisample_state(&multisample)
                        .depth_stencil_state(&depth_stencil)
                        .color_blend_state(&blend)
                        .dynamic_state(&dynamic)
                        .layout(this.layout)
                        .render_pass(render_pass)
                        .subpass(subpass)
                })
                .collect::<Vec<_>>();
            let pipelines = device
                .create_graphics_pipelines(ctx.pipeline_cache, &infos, None)
                .check("frame pipelines")?;
            let [sky, composite, tonemap, post] = pipelines[..] else {
                unreachable!("one pipeline per create info");
            };
            this.sky = sky;
            this.composite = composite;
            this.tonemap = tonemap;
            this.post = post;
            ctx.set_name(sky, c"sky");
            ctx.set_name(composite, c"composite");
            ctx.set_name(tonemap, c"tonemap");
            ctx.set_name(post, c"post");
            Ok(this)
        }
    }

    pub fn pool_sizes(slots: u32) -> [vk::DescriptorPoolSize; 3] {
        [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: 2 * slots,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: 6 * slots,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::INPUT_ATTACHMENT,
                descriptor_count: slots,
            },
        ]
    }
}

fn sampled_binding<'a>(
    binding: u32,
    sampler: &'a vk::Sampler,
) -> vk::DescriptorSetLayoutBinding<'a> {
    vk::DescriptorSetLayoutBinding::default()
        .binding(binding)
        .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
        .stage_flags(vk::ShaderStageFlags::FRAGMENT)
        .immutable_samplers(std::slice::from_ref(sampler))
}
