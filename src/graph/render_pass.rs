//! Logical render passes.
//!
//! A logical render pass is the caller's declaration of attachments,
//! load/store ops, clear values, viewports and a list of draw tasks. The
//! builder may fuse adjacent submitted passes into one Vulkan render pass
//! with several subpasses; compatibility is conservative and any doubt falls
//! back to separate passes.

use crate::error::{Error, Result};
use crate::ids::RenderTargetId;
use crate::resource::{
    AttachmentDesc, AttachmentRef, ImageDesc, ImageId, RenderPassDesc, ResourceManager,
    SubpassDependencyDesc, SubpassDesc,
};
use super::task::DrawTask;
use ash::vk;

#[derive(Clone, Debug)]
pub struct ColorAttachment {
    pub name: RenderTargetId,
    pub image: ImageId,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub clear_value: [f32; 4],
    /// Layout the image is left in after the pass; defaults to
    /// `COLOR_ATTACHMENT_OPTIMAL`.
    pub final_layout: Option<vk::ImageLayout>,
}

impl ColorAttachment {
    pub fn new(image: ImageId) -> ColorAttachment {
        ColorAttachment {
            name: RenderTargetId::default(),
            image,
            load_op: vk::AttachmentLoadOp::DONT_CARE,
            store_op: vk::AttachmentStoreOp::STORE,
            clear_value: [0.0; 4],
            final_layout: None,
        }
    }

    pub fn clear(image: ImageId, clear_value: [f32; 4]) -> ColorAttachment {
        ColorAttachment {
            load_op: vk::AttachmentLoadOp::CLEAR,
            clear_value,
            ..ColorAttachment::new(image)
        }
    }
}

#[derive(Clone, Debug)]
pub struct DepthStencilAttachment {
    pub image: ImageId,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub stencil_load_op: vk::AttachmentLoadOp,
    pub stencil_store_op: vk::AttachmentStoreOp,
    pub clear_depth: f32,
    pub clear_stencil: u32,
    /// Read-only depth allows the image to double as a sampled input.
    pub read_only: bool,
    pub final_layout: Option<vk::ImageLayout>,
}

#[derive(Clone, Debug, Default)]
pub struct LogicalRenderPassDesc {
    pub color_attachments: Vec<ColorAttachment>,
    pub depth_stencil: Option<DepthStencilAttachment>,
    /// Defaults to one full-render-area viewport when empty.
    pub viewports: Vec<vk::Viewport>,
    /// Defaults to the render area when empty.
    pub scissors: Vec<vk::Rect2D>,
    /// Defaults to the full extent of the first attachment.
    pub render_area: Option<vk::Rect2D>,
    /// Must be an `R8_UINT` 2D color image when present.
    pub shading_rate_image: Option<ImageId>,
}

/// A declared logical pass plus its accumulated draws, validated on
/// creation.
pub(crate) struct LogicalRenderPass {
    pub(crate) desc: LogicalRenderPassDesc,
    pub(crate) draws: Vec<DrawTask>,
    pub(crate) submitted: bool,
    pub(crate) samples: u32,
    pub(crate) extent: vk::Extent2D,
}

fn rect_eq(a: &vk::Rect2D, b: &vk::Rect2D) -> bool {
    a.offset.x == b.offset.x
        && a.offset.y == b.offset.y
        && a.extent.width == b.extent.width
        && a.extent.height == b.extent.height
}

fn viewport_eq(a: &vk::Viewport, b: &vk::Viewport) -> bool {
    a.x == b.x
        && a.y == b.y
        && a.width == b.width
        && a.height == b.height
        && a.min_depth == b.min_depth
        && a.max_depth == b.max_depth
}

impl LogicalRenderPass {
    /// Validates the attachment set against image usage and consistency
    /// rules and derives extent and sample count.
    pub(crate) fn validate(
        resources: &ResourceManager,
        desc: LogicalRenderPassDesc,
    ) -> Result<LogicalRenderPass> {
        if desc.color_attachments.is_empty() && desc.depth_stencil.is_none() {
            return Err(Error::Configuration {
                name: "render pass".to_string(),
                reason: "a render pass needs at least one attachment".to_string(),
            });
        }

        let mut extent: Option<vk::Extent2D> = None;
        let mut samples: Option<u32> = None;

        let mut check = |image: ImageId,
                         required_usage: vk::ImageUsageFlags,
                         what: &'static str|
         -> Result<ImageDesc> {
            let image_desc = resources.describe_image(image)?;
            if !image_desc.usage.contains(required_usage) {
                return Err(Error::MissingUsage {
                    name: resources.image_name(image),
                    required: what,
                });
            }
            let e = vk::Extent2D {
                width: image_desc.width,
                height: image_desc.height,
            };
            match extent {
                None => extent = Some(e),
                Some(prev) if prev.width == e.width && prev.height == e.height => {}
                Some(_) => {
                    return Err(Error::Configuration {
                        name: resources.image_name(image),
                        reason: "attachment extents differ".to_string(),
                    })
                }
            }
            match samples {
                None => samples = Some(image_desc.samples),
                Some(prev) if prev == image_desc.samples => {}
                Some(_) => {
                    return Err(Error::Configuration {
                        name: resources.image_name(image),
                        reason: "attachment sample counts differ".to_string(),
                    })
                }
            }
            Ok(image_desc)
        };

        for attachment in &desc.color_attachments {
            check(
                attachment.image,
                vk::ImageUsageFlags::COLOR_ATTACHMENT,
                "COLOR_ATTACHMENT",
            )?;
        }
        if let Some(ds) = &desc.depth_stencil {
            check(
                ds.image,
                vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                "DEPTH_STENCIL_ATTACHMENT",
            )?;
        }
        if let Some(sri) = desc.shading_rate_image {
            let sri_desc = resources.describe_image(sri)?;
            if sri_desc.format != vk::Format::R8_UINT
                || sri_desc.image_type != vk::ImageType::TYPE_2D
                || crate::format_aspect_mask(sri_desc.format) != vk::ImageAspectFlags::COLOR
            {
                return Err(Error::Configuration {
                    name: resources.image_name(sri),
                    reason: "shading-rate image must be a 2D R8_UINT color image".to_string(),
                });
            }
        }

        Ok(LogicalRenderPass {
            samples: samples.unwrap_or(1),
            extent: extent.unwrap_or(vk::Extent2D {
                width: 1,
                height: 1,
            }),
            desc,
            draws: Vec::new(),
            submitted: false,
        })
    }

    pub(crate) fn render_area(&self) -> vk::Rect2D {
        self.desc.render_area.unwrap_or(vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: self.extent,
        })
    }

    fn attachment_images(&self) -> impl Iterator<Item = ImageId> + '_ {
        self.desc
            .color_attachments
            .iter()
            .map(|a| a.image)
            .chain(self.desc.depth_stencil.iter().map(|d| d.image))
    }
}

/// Conservative fusion check: identical attachment sets (same images, same
/// order), identical sample counts, render areas and viewport/scissor
/// arrays, matching shading-rate image, and the follower must not clear or
/// re-initialize anything the leader produced.
pub(crate) fn can_merge(leader: &LogicalRenderPass, follower: &LogicalRenderPass) -> bool {
    if leader.samples != follower.samples {
        return false;
    }
    if !rect_eq(&leader.render_area(), &follower.render_area()) {
        return false;
    }
    if leader.desc.shading_rate_image != follower.desc.shading_rate_image {
        return false;
    }
    if leader.desc.color_attachments.len() != follower.desc.color_attachments.len() {
        return false;
    }
    let images_match = leader
        .attachment_images()
        .eq(follower.attachment_images());
    if !images_match {
        return false;
    }
    if leader.desc.depth_stencil.is_some() != follower.desc.depth_stencil.is_some() {
        return false;
    }
    if let (Some(a), Some(b)) = (&leader.desc.depth_stencil, &follower.desc.depth_stencil) {
        if a.read_only != b.read_only {
            return false;
        }
        if b.load_op == vk::AttachmentLoadOp::CLEAR
            || b.stencil_load_op == vk::AttachmentLoadOp::CLEAR
        {
            return false;
        }
        if a.final_layout != b.final_layout {
            return false;
        }
    }
    // a follower that clears would lose the leader's output
    for (a, b) in leader
        .desc
        .color_attachments
        .iter()
        .zip(&follower.desc.color_attachments)
    {
        if b.load_op == vk::AttachmentLoadOp::CLEAR {
            return false;
        }
        if a.final_layout != b.final_layout {
            return false;
        }
    }
    if leader.desc.viewports.len() != follower.desc.viewports.len()
        || !leader
            .desc
            .viewports
            .iter()
            .zip(&follower.desc.viewports)
            .all(|(a, b)| viewport_eq(a, b))
    {
        return false;
    }
    if leader.desc.scissors.len() != follower.desc.scissors.len()
        || !leader
            .desc
            .scissors
            .iter()
            .zip(&follower.desc.scissors)
            .all(|(a, b)| rect_eq(a, b))
    {
        return false;
    }
    true
}

/// The physical render pass for a merged group: attachments take the
/// leader's load ops and the last member's store ops, one subpass per
/// logical pass, with a color/depth dependency between consecutive
/// subpasses.
pub(crate) fn build_physical_desc(
    resources: &ResourceManager,
    group: &[&LogicalRenderPass],
) -> Result<(RenderPassDesc, Vec<vk::ClearValue>)> {
    let leader = group[0];
    let last = group[group.len() - 1];
    let mut attachments = Vec::new();
    let mut clear_values = Vec::new();

    for (i, a) in leader.desc.color_attachments.iter().enumerate() {
        let image_desc = resources.describe_image(a.image)?;
        let store = &last.desc.color_attachments[i];
        attachments.push(AttachmentDesc {
            format: image_desc.format,
            samples: image_desc.samples,
            load_op: a.load_op,
            store_op: store.store_op,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            // the tracker transitions the image before the pass begins
            initial_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            final_layout: store
                .final_layout
                .unwrap_or(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
        });
        clear_values.push(vk::ClearValue {
            color: vk::ClearColorValue {
                float32: a.clear_value,
            },
        });
    }

    let depth_index = attachments.len() as u32;
    if let Some(ds) = &leader.desc.depth_stencil {
        let image_desc = resources.describe_image(ds.image)?;
        let store = last.desc.depth_stencil.as_ref().unwrap();
        let layout = if ds.read_only {
            vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
        } else {
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        };
        attachments.push(AttachmentDesc {
            format: image_desc.format,
            samples: image_desc.samples,
            load_op: ds.load_op,
            store_op: store.store_op,
            stencil_load_op: ds.stencil_load_op,
            stencil_store_op: store.stencil_store_op,
            initial_layout: layout,
            final_layout: store.final_layout.unwrap_or(layout),
        });
        clear_values.push(vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth: ds.clear_depth,
                stencil: ds.clear_stencil,
            },
        });
    }

    let mut subpasses = Vec::with_capacity(group.len());
    for pass in group {
        subpasses.push(SubpassDesc {
            color_attachments: pass
                .desc
                .color_attachments
                .iter()
                .enumerate()
                .map(|(i, _)| AttachmentRef {
                    attachment: i as u32,
                    layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                })
                .collect(),
            input_attachments: vec![],
            resolve_attachments: vec![],
            depth_stencil_attachment: pass.desc.depth_stencil.as_ref().map(|ds| AttachmentRef {
                attachment: depth_index,
                layout: if ds.read_only {
                    vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
                } else {
                    vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
                },
            }),
        });
    }

    let dependencies = (1..group.len())
        .map(|i| SubpassDependencyDesc {
            src_subpass: (i - 1) as u32,
            dst_subpass: i as u32,
            src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
            dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            src_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_READ
                | vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            by_region: true,
        })
        .collect();

    Ok((
        RenderPassDesc {
            attachments,
            subpasses,
            dependencies,
        },
        clear_values,
    ))
}
