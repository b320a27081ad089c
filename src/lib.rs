//! Vulkan render framegraph core.
//!
//! Callers declare GPU work as *tasks* on per-queue command recorders; the
//! crate analyses inter-task dependencies and resource accesses, inserts the
//! image layout transitions, memory barriers and cross-queue semaphores a
//! correct submission needs, and schedules batches over up to three device
//! queues (graphics, async compute, async transfer) while honouring the
//! caller-declared batch dependency graph.
//!
//! Per frame: open a frame (optional), obtain one or more
//! [`CommandRecorder`]s, declare tasks and render passes, [`execute`] each
//! recorder, [`flush`] to submit pending batches whose dependencies are
//! satisfied, then [`wait`] on specific batches or [`wait_idle`].
//!
//! [`execute`]: graph::CommandRecorder::execute
//! [`flush`]: FrameGraph::flush
//! [`wait`]: FrameGraph::wait
//! [`wait_idle`]: FrameGraph::wait_idle

pub use ash::{self, vk};
pub use gpu_allocator::MemoryLocation;

pub use crate::{
    device::{Device, DeviceInfo, QueueInfo, QueueKind, QueueKindMask},
    error::{Error, Result},
    framegraph::{FrameGraph, FrameGraphDesc},
    graph::{
        ColorAttachment, CommandRecorder, DepthStencilAttachment, DrawTask,
        LogicalRenderPassDesc, RecorderDesc, Task,
    },
    resource::{
        BufferDesc, BufferHandle, BufferId, ImageDesc, ImageHandle, ImageId, Owned,
        PipelineCompiler, PipelineId, PipelineResources, ResourceManager, ResourceStats,
        SamplerDesc, SamplerId,
    },
    staging::{ReadbackCallback, ReadbackView},
    submit::{BatchState, CmdBatch, ShaderDebugCallback, SubmissionEngine},
    swapchain::{SurfaceProvider, SwapchainDesc},
    track::SubRange,
};

pub mod device;
pub mod error;
pub mod framegraph;
pub mod graph;
pub mod ids;
pub mod resource;
pub mod staging;
pub mod submit;
pub mod swapchain;
pub(crate) mod track;

/// Whether an access mask contains any write bit; writes (and layout
/// transitions) always require a barrier against the previous access.
pub fn is_write_access(mask: vk::AccessFlags) -> bool {
    mask.intersects(
        vk::AccessFlags::SHADER_WRITE
            | vk::AccessFlags::COLOR_ATTACHMENT_WRITE
            | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
            | vk::AccessFlags::TRANSFER_WRITE
            | vk::AccessFlags::HOST_WRITE
            | vk::AccessFlags::MEMORY_WRITE
            | vk::AccessFlags::TRANSFORM_FEEDBACK_WRITE_EXT
            | vk::AccessFlags::TRANSFORM_FEEDBACK_COUNTER_WRITE_EXT
            | vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR
            | vk::AccessFlags::COMMAND_PREPROCESS_WRITE_NV,
    )
}

pub fn is_depth_and_stencil_format(fmt: vk::Format) -> bool {
    matches!(
        fmt,
        vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

pub fn is_depth_only_format(fmt: vk::Format) -> bool {
    matches!(
        fmt,
        vk::Format::D16_UNORM | vk::Format::X8_D24_UNORM_PACK32 | vk::Format::D32_SFLOAT
    )
}

pub fn is_stencil_only_format(fmt: vk::Format) -> bool {
    fmt == vk::Format::S8_UINT
}

pub fn format_aspect_mask(fmt: vk::Format) -> vk::ImageAspectFlags {
    if is_depth_only_format(fmt) {
        vk::ImageAspectFlags::DEPTH
    } else if is_stencil_only_format(fmt) {
        vk::ImageAspectFlags::STENCIL
    } else if is_depth_and_stencil_format(fmt) {
        vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

pub(crate) fn get_vk_sample_count(count: u32) -> vk::SampleCountFlags {
    match count {
        0 | 1 => vk::SampleCountFlags::TYPE_1,
        2 => vk::SampleCountFlags::TYPE_2,
        4 => vk::SampleCountFlags::TYPE_4,
        8 => vk::SampleCountFlags::TYPE_8,
        16 => vk::SampleCountFlags::TYPE_16,
        32 => vk::SampleCountFlags::TYPE_32,
        64 => vk::SampleCountFlags::TYPE_64,
        _ => panic!("unsupported number of samples"),
    }
}

/// Bytes per texel of uncompressed formats the readback path understands.
pub fn format_texel_size(fmt: vk::Format) -> Option<u64> {
    use vk::Format as F;
    Some(match fmt {
        F::R8_UNORM | F::R8_SNORM | F::R8_UINT | F::R8_SINT | F::S8_UINT => 1,
        F::R8G8_UNORM | F::R8G8_SNORM | F::R8G8_UINT | F::R8G8_SINT => 2,
        F::R16_UNORM | F::R16_SFLOAT | F::R16_UINT | F::R16_SINT | F::D16_UNORM => 2,
        F::R8G8B8A8_UNORM
        | F::R8G8B8A8_SRGB
        | F::R8G8B8A8_SNORM
        | F::R8G8B8A8_UINT
        | F::R8G8B8A8_SINT
        | F::B8G8R8A8_UNORM
        | F::B8G8R8A8_SRGB
        | F::A2B10G10R10_UNORM_PACK32
        | F::B10G11R11_UFLOAT_PACK32
        | F::R16G16_SFLOAT
        | F::R16G16_UNORM
        | F::R32_SFLOAT
        | F::R32_UINT
        | F::R32_SINT
        | F::D32_SFLOAT
        | F::X8_D24_UNORM_PACK32 => 4,
        F::R16G16B16A16_SFLOAT | F::R16G16B16A16_UNORM | F::R32G32_SFLOAT => 8,
        F::R32G32B32A32_SFLOAT | F::R32G32B32A32_UINT => 16,
        _ => return None,
    })
}

/// Mip chain length for a 2D image of the given size.
pub fn get_mip_level_count(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aspect_masks_by_format_class() {
        assert_eq!(
            format_aspect_mask(vk::Format::R8G8B8A8_UNORM),
            vk::ImageAspectFlags::COLOR
        );
        assert_eq!(
            format_aspect_mask(vk::Format::D32_SFLOAT),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(
            format_aspect_mask(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(
            format_aspect_mask(vk::Format::S8_UINT),
            vk::ImageAspectFlags::STENCIL
        );
    }

    #[test]
    fn write_access_detection() {
        assert!(is_write_access(vk::AccessFlags::TRANSFER_WRITE));
        assert!(is_write_access(
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE
        ));
        assert!(!is_write_access(
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::COLOR_ATTACHMENT_READ
        ));
    }

    #[test]
    fn mip_chain_length() {
        assert_eq!(get_mip_level_count(1, 1), 1);
        assert_eq!(get_mip_level_count(800, 600), 10);
        assert_eq!(get_mip_level_count(1024, 1024), 11);
    }
}
