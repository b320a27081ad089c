//! Render-pass descriptions.
//!
//! A render pass is a cacheable resource: the description hashes its whole
//! attachment and subpass content, so logically identical passes share one
//! `VkRenderPass`. Pipelines are instantiated against a *compatibility* hash
//! (formats, samples, subpass shape) which is looser than full equality.

use crate::error::{Error, Result};
use ash::vk;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct AttachmentDesc {
    pub format: vk::Format,
    pub samples: u32,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub stencil_load_op: vk::AttachmentLoadOp,
    pub stencil_store_op: vk::AttachmentStoreOp,
    pub initial_layout: vk::ImageLayout,
    pub final_layout: vk::ImageLayout,
}

impl Default for AttachmentDesc {
    fn default() -> Self {
        AttachmentDesc {
            format: vk::Format::UNDEFINED,
            samples: 1,
            load_op: vk::AttachmentLoadOp::DONT_CARE,
            store_op: vk::AttachmentStoreOp::STORE,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::GENERAL,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct AttachmentRef {
    pub attachment: u32,
    pub layout: vk::ImageLayout,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct SubpassDesc {
    pub color_attachments: Vec<AttachmentRef>,
    pub input_attachments: Vec<AttachmentRef>,
    pub resolve_attachments: Vec<AttachmentRef>,
    pub depth_stencil_attachment: Option<AttachmentRef>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubpassDependencyDesc {
    /// `vk::SUBPASS_EXTERNAL` for edges to/from outside the pass.
    pub src_subpass: u32,
    pub dst_subpass: u32,
    pub src_stage_mask: vk::PipelineStageFlags,
    pub dst_stage_mask: vk::PipelineStageFlags,
    pub src_access_mask: vk::AccessFlags,
    pub dst_access_mask: vk::AccessFlags,
    pub by_region: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct RenderPassDesc {
    pub attachments: Vec<AttachmentDesc>,
    pub subpasses: Vec<SubpassDesc>,
    pub dependencies: Vec<SubpassDependencyDesc>,
}

impl RenderPassDesc {
    /// Hash of the fields that matter for pipeline compatibility
    /// (VkRenderPass compatibility rules: attachment formats and sample
    /// counts, subpass shape; load/store ops and layouts do not matter).
    pub(crate) fn compatibility_hash(&self) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut hasher = fxhash::FxHasher::default();
        for a in &self.attachments {
            a.format.hash(&mut hasher);
            a.samples.hash(&mut hasher);
        }
        for s in &self.subpasses {
            s.color_attachments.len().hash(&mut hasher);
            for r in &s.color_attachments {
                r.attachment.hash(&mut hasher);
            }
            s.depth_stencil_attachment
                .map(|r| r.attachment)
                .hash(&mut hasher);
            for r in &s.input_attachments {
                r.attachment.hash(&mut hasher);
            }
        }
        hasher.finish()
    }
}

fn to_vk_refs(refs: &[AttachmentRef]) -> Vec<vk::AttachmentReference> {
    refs.iter()
        .map(|r| vk::AttachmentReference {
            attachment: r.attachment,
            layout: r.layout,
        })
        .collect()
}

/// Builds the `VkRenderPass` for a description. Attachment indices are
/// validated against the attachment array before the Vulkan call.
pub(crate) fn create_vk_render_pass(
    device: &ash::Device,
    desc: &RenderPassDesc,
) -> Result<vk::RenderPass> {
    let attachment_count = desc.attachments.len() as u32;
    for subpass in &desc.subpasses {
        let all = subpass
            .color_attachments
            .iter()
            .chain(subpass.input_attachments.iter())
            .chain(subpass.resolve_attachments.iter())
            .chain(subpass.depth_stencil_attachment.iter());
        for r in all {
            if r.attachment >= attachment_count {
                return Err(Error::Configuration {
                    name: "RenderPassDesc".to_string(),
                    reason: format!(
                        "subpass references attachment {} but only {} attachments are declared",
                        r.attachment, attachment_count
                    ),
                });
            }
        }
    }

    let attachments: Vec<vk::AttachmentDescription> = desc
        .attachments
        .iter()
        .map(|a| vk::AttachmentDescription {
            format: a.format,
            samples: crate::get_vk_sample_count(a.samples),
            load_op: a.load_op,
            store_op: a.store_op,
            stencil_load_op: a.stencil_load_op,
            stencil_store_op: a.stencil_store_op,
            initial_layout: a.initial_layout,
            final_layout: a.final_layout,
            ..Default::default()
        })
        .collect();

    // reference arrays must outlive the create call
    struct SubpassRefs {
        color: Vec<vk::AttachmentReference>,
        input: Vec<vk::AttachmentReference>,
        resolve: Vec<vk::AttachmentReference>,
        depth_stencil: Option<vk::AttachmentReference>,
    }

    let subpass_refs: Vec<SubpassRefs> = desc
        .subpasses
        .iter()
        .map(|s| SubpassRefs {
            color: to_vk_refs(&s.color_attachments),
            input: to_vk_refs(&s.input_attachments),
            resolve: to_vk_refs(&s.resolve_attachments),
            depth_stencil: s.depth_stencil_attachment.map(|r| vk::AttachmentReference {
                attachment: r.attachment,
                layout: r.layout,
            }),
        })
        .collect();

    let subpasses: Vec<vk::SubpassDescription> = subpass_refs
        .iter()
        .map(|refs| vk::SubpassDescription {
            pipeline_bind_point: vk::PipelineBindPoint::GRAPHICS,
            color_attachment_count: refs.color.len() as u32,
            p_color_attachments: refs.color.as_ptr(),
            input_attachment_count: refs.input.len() as u32,
            p_input_attachments: refs.input.as_ptr(),
            p_resolve_attachments: if refs.resolve.is_empty() {
                std::ptr::null()
            } else {
                refs.resolve.as_ptr()
            },
            p_depth_stencil_attachment: refs
                .depth_stencil
                .as_ref()
                .map_or(std::ptr::null(), |r| r as *const _),
            ..Default::default()
        })
        .collect();

    let dependencies: Vec<vk::SubpassDependency> = desc
        .dependencies
        .iter()
        .map(|d| vk::SubpassDependency {
            src_subpass: d.src_subpass,
            dst_subpass: d.dst_subpass,
            src_stage_mask: d.src_stage_mask,
            dst_stage_mask: d.dst_stage_mask,
            src_access_mask: d.src_access_mask,
            dst_access_mask: d.dst_access_mask,
            dependency_flags: if d.by_region {
                vk::DependencyFlags::BY_REGION
            } else {
                vk::DependencyFlags::empty()
            },
        })
        .collect();

    let create_info = vk::RenderPassCreateInfo {
        attachment_count: attachments.len() as u32,
        p_attachments: attachments.as_ptr(),
        subpass_count: subpasses.len() as u32,
        p_subpasses: subpasses.as_ptr(),
        dependency_count: dependencies.len() as u32,
        p_dependencies: dependencies.as_ptr(),
        ..Default::default()
    };

    unsafe {
        device
            .create_render_pass(&create_info, None)
            .map_err(|e| Error::device("vkCreateRenderPass", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn color_pass(format: vk::Format, load_op: vk::AttachmentLoadOp) -> RenderPassDesc {
        RenderPassDesc {
            attachments: vec![AttachmentDesc {
                format,
                load_op,
                final_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                ..Default::default()
            }],
            subpasses: vec![SubpassDesc {
                color_attachments: vec![AttachmentRef {
                    attachment: 0,
                    layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                }],
                ..Default::default()
            }],
            dependencies: vec![],
        }
    }

    #[test]
    fn compatibility_ignores_ops_but_not_format() {
        let clear = color_pass(vk::Format::R8G8B8A8_UNORM, vk::AttachmentLoadOp::CLEAR);
        let load = color_pass(vk::Format::R8G8B8A8_UNORM, vk::AttachmentLoadOp::LOAD);
        let other = color_pass(vk::Format::B8G8R8A8_UNORM, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(clear.compatibility_hash(), load.compatibility_hash());
        assert_ne!(clear.compatibility_hash(), other.compatibility_hash());
        // structural equality still distinguishes the ops
        assert_ne!(clear, load);
    }
}
