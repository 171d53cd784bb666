//! Render passes, which depend only on formats and so survive swapchain recreation

use ash::{vk, Device};

use crate::{error::Check, Result};

pub const BACKGROUND_FORMAT: vk::Format = vk::Format::R16G16B16A16_SFLOAT;
pub const COLOR_FORMAT: vk::Format = vk::Format::R16G16B16A16_SFLOAT;
pub const NORMAL_FORMAT: vk::Format = vk::Format::R16G16B16A16_SFLOAT;
pub const DEFERRED_FORMAT: vk::Format = vk::Format::R16G16B16A16_SFLOAT;
pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;
pub const COMPOSITE_FORMAT: vk::Format = vk::Format::R16G16B16A16_SFLOAT;
pub const LDR_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

#[derive(Default)]
pub struct RenderPasses {
    /// Reduced-resolution sky and volumetrics
    pub background: vk::RenderPass,
    /// Color, normal, deferred and depth
    pub geometry: vk::RenderPass,
    /// Subpass 0 composites geometry with the atmosphere, subpass 1 tone maps
    pub composition: vk::RenderPass,
    /// Subpass 0 applies post effects to the swapchain image, subpass 1 overlays UI
    pub post: vk::RenderPass,
}

impl RenderPasses {
    pub unsafe fn destroy(&mut self, device: &Device) {
        for pass in [
            &mut self.background,
            &mut self.geometry,
            &mut self.composition,
            &mut self.post,
        ] {
            device.destroy_render_pass(*pass, None);
            *pass = vk::RenderPass::null();
        }
    }
}

/// Attachment written by one pass and sampled by later ones
///
/// Begins in the attachment layout: the frame loop transitions it there explicitly before the pass.
fn sampled_target(format: vk::Format, depth: bool) -> vk::AttachmentDescription {
    vk::AttachmentDescription {
        format,
        samples: vk::SampleCountFlags::TYPE_1,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::STORE,
        stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout: if depth {
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        } else {
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        },
        final_layout: if depth {
            vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
        } else {
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        },
        ..Default::default()
    }
}

/// Make attachment writes visible to fragment shaders of later passes
const READ_BY_LATER_PASSES: vk::SubpassDependency = vk::SubpassDependency {
    src_subpass: 0,
    dst_subpass: vk::SUBPASS_EXTERNAL,
    src_stage_mask: vk::PipelineStageFlags::from_raw(
        vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT.as_raw()
            | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS.as_raw(),
    ),
    dst_stage_mask: vk::PipelineStageFlags::FRAGMENT_SHADER,
    src_access_mask: vk::AccessFlags::from_raw(
        vk::AccessFlags::COLOR_ATTACHMENT_WRITE.as_raw()
            | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE.as_raw(),
    ),
    dst_access_mask: vk::AccessFlags::SHADER_READ,
    dependency_flags: vk::DependencyFlags::empty(),
};

fn color_ref(attachment: u32) -> vk::AttachmentReference {
    vk::AttachmentReference {
        attachment,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    }
}

pub unsafe fn background(device: &Device) -> Result<vk::RenderPass> {
    let color = [color_ref(0)];
    device
        .create_render_pass(
            &vk::RenderPassCreateInfo::default()
                .attachments(&[sampled_target(BACKGROUND_FORMAT, false)])
                .subpasses(&[vk::SubpassDescription::default()
                    .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
                    .color_attachments(&color)])
                .dependencies(&[READ_BY_LATER_PASSES]),
            None,
        )
        .check("background render pass")
}

pub unsafe fn geometry(device: &Device) -> Result<vk::RenderPass> {
    let color = [color_ref(0), color_ref(1), color_ref(2)];
    let depth = vk::AttachmentReference {
        attachment: 3,
        layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    };
    device
        .create_render_pass(
            &vk::RenderPassCreateInfo::default()
                .attachments(&[
                    sampled_target(COLOR_FORMAT, false),
                    sampled_target(NORMAL_FORMAT, false),
                    sampled_target(DEFERRED_FORMAT, false),
                    sampled_target(DEPTH_FORMAT, true),
                ])
                .subpasses(&[vk::SubpassDescription::default()
                    .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
                    .color_attachments(&color)
                    .depth_stencil_attachment(&depth)])
                .dependencies(&[READ_BY_LATER_PASSES]),
            None,
        )
        .check("geometry render pass")
}

pub unsafe fn composition(device: &Device) -> Result<vk::RenderPass> {
    let hdr = [color_ref(0)];
    let hdr_input = [vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    }];
    let ldr = [color_ref(1)];
    device
        .create_render_pass(
            &vk::RenderPassCreateInfo::default()
                .attachments(&[
                    // Only lives between the subpasses
                    vk::AttachmentDescription {
                        format: COMPOSITE_FORMAT,
                        samples: vk::SampleCountFlags::TYPE_1,
                        load_op: vk::AttachmentLoadOp::DONT_CARE,
                        store_op: vk::AttachmentStoreOp::DONT_CARE,
                        initial_layout: vk::ImageLayout::UNDEFINED,
                        final_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                        ..Default::default()
                    },
                    vk::AttachmentDescription {
                        format: LDR_FORMAT,
                        samples: vk::SampleCountFlags::TYPE_1,
                        load_op: vk::AttachmentLoadOp::DONT_CARE,
                        store_op: vk::AttachmentStoreOp::STORE,
                        initial_layout: vk::ImageLayout::UNDEFINED,
                        final_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                        ..Default::default()
                    },
                ])
                .subpasses(&[
                    vk::SubpassDescription::default()
                        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
                        .color_attachments(&hdr),
                    vk::SubpassDescription::default()
                        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
                        .input_attachments(&hdr_input)
                        .color_attachments(&ldr),
                ])
                .dependencies(&[
                    vk::SubpassDependency {
                        src_subpass: vk::SUBPASS_EXTERNAL,
                        dst_subpass: 0,
                        src_stage_mask: vk::PipelineStageFlags::FRAGMENT_SHADER,
                        dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                        src_access_mask: vk::AccessFlags::SHADER_READ,
                        dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                        ..Default::default()
                    },
                    vk::SubpassDependency {
                        src_subpass: 0,
                        dst_subpass: 1,
                        src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                        dst_stage_mask: vk::PipelineStageFlags::FRAGMENT_SHADER,
                        src_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                        dst_access_mask: vk::AccessFlags::INPUT_ATTACHMENT_READ,
                        dependency_flags: vk::DependencyFlags::BY_REGION,
                    },
                    vk::SubpassDependency {
                        src_subpass: 1,
                        ..READ_BY_LATER_PASSES
                    },
                ]),
            None,
        )
        .check("composition render pass")
}

pub unsafe fn post(device: &Device, format: vk::Format) -> Result<vk::RenderPass> {
    let color = [color_ref(0)];
    device
        .create_render_pass(
            &vk::RenderPassCreateInfo::default()
                .attachments(&[vk::AttachmentDescription {
                    format,
                    samples: vk::SampleCountFlags::TYPE_1,
                    load_op: vk::AttachmentLoadOp::DONT_CARE,
                    store_op: vk::AttachmentStoreOp::STORE,
                    initial_layout: vk::ImageLayout::UNDEFINED,
                    final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
                    ..Default::default()
                }])
                .subpasses(&[
                    vk::SubpassDescription::default()
                        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
                        .color_attachments(&color),
                    vk::SubpassDescription::default()
                        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
                        .color_attachments(&color),
                ])
                .dependencies(&[
                    // Wait for the acquire semaphore, signaled at this stage
                    vk::SubpassDependency {
                        src_subpass: vk::SUBPASS_EXTERNAL,
                        dst_subpass: 0,
                        src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                        dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                        dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                        ..Default::default()
                    },
                    vk::SubpassDependency {
                        src_subpass: 0,
                        dst_subpass: 1,
                        src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                        dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                        src_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                        dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_READ
                            | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                        dependency_flags: vk::DependencyFlags::BY_REGION,
                    },
                ]),
            None,
        )
        .check("post render pass")
}
