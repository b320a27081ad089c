//! Task declarations.
//!
//! Every operation a recorder can perform is a task. Tasks carry their
//! resource handles and parameters; the recorder derives each task's
//! resource accesses from the payload, feeds them to the tracker, and records
//! the matching Vulkan commands. Draw tasks do not appear in the graph
//! directly: they belong to a logical render pass submitted with
//! `SubmitRenderPass`.

use crate::resource::{
    BufferId, ImageId, PipelineId, PipelineResources, RtGeometryId, RtSceneId, SwapchainId,
};
use crate::staging::ReadbackCallback;
use crate::track::SubRange;
use ash::vk;

/// Identifies a task inside one recorder; usable in `depends_on` lists of
/// later tasks of the same recorder.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TaskId(pub(crate) usize);

/// Identifies a logical render pass being built on a recorder.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct LogicalPassId(pub(crate) usize);

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SubresourceLayers {
    pub mip_level: u32,
    pub base_array_layer: u32,
    pub layer_count: u32,
}

impl SubresourceLayers {
    pub fn base() -> SubresourceLayers {
        SubresourceLayers {
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        }
    }

    pub(crate) fn to_vk(&self, aspect: vk::ImageAspectFlags) -> vk::ImageSubresourceLayers {
        vk::ImageSubresourceLayers {
            aspect_mask: aspect,
            mip_level: self.mip_level,
            base_array_layer: self.base_array_layer,
            layer_count: self.layer_count,
        }
    }

    pub(crate) fn sub_range(&self) -> SubRange {
        SubRange {
            base_mip: self.mip_level,
            mip_count: 1,
            base_layer: self.base_array_layer,
            layer_count: self.layer_count,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BufferCopyRegion {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ImageCopyRegion {
    pub src_subresource: SubresourceLayers,
    pub src_offset: [i32; 3],
    pub dst_subresource: SubresourceLayers,
    pub dst_offset: [i32; 3],
    pub extent: [u32; 3],
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BufferImageCopyRegion {
    pub buffer_offset: u64,
    /// Texels per row in the buffer; 0 means tightly packed.
    pub buffer_row_length: u32,
    pub buffer_image_height: u32,
    pub image_subresource: SubresourceLayers,
    pub image_offset: [i32; 3],
    pub image_extent: [u32; 3],
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ImageBlitRegion {
    pub src_subresource: SubresourceLayers,
    pub src_offsets: [[i32; 3]; 2],
    pub dst_subresource: SubresourceLayers,
    pub dst_offsets: [[i32; 3]; 2],
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ImageResolveRegion {
    pub src_subresource: SubresourceLayers,
    pub src_offset: [i32; 3],
    pub dst_subresource: SubresourceLayers,
    pub dst_offset: [i32; 3],
    pub extent: [u32; 3],
}

/// Push constants attached to a draw or dispatch.
#[derive(Clone, Debug, Default)]
pub struct PushConstantData {
    pub stages: vk::ShaderStageFlags,
    pub offset: u32,
    pub data: Vec<u8>,
}

/// A vertex buffer bound by name; the name is remapped to the pipeline's
/// numeric binding slot declared in its vertex-input state.
#[derive(Clone, Debug)]
pub struct VertexBufferBinding {
    pub name: crate::ids::VertexBufferName,
    pub buffer: BufferId,
    pub offset: u64,
}

/// Common state of every draw variant.
#[derive(Clone, Debug, Default)]
pub struct DrawCommon {
    pub resources: Vec<PipelineResources>,
    pub vertex_buffers: Vec<VertexBufferBinding>,
    pub push_constants: PushConstantData,
}

#[derive(Clone, Debug)]
pub struct DrawVertices {
    pub pipeline: PipelineId,
    pub common: DrawCommon,
    pub vertex_count: u32,
    pub instance_count: u32,
    pub first_vertex: u32,
    pub first_instance: u32,
}

#[derive(Clone, Debug)]
pub struct DrawIndexed {
    pub pipeline: PipelineId,
    pub common: DrawCommon,
    pub index_buffer: BufferId,
    pub index_offset: u64,
    pub index_type: vk::IndexType,
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub vertex_offset: i32,
    pub first_instance: u32,
}

#[derive(Clone, Debug)]
pub struct DrawIndirectCommon {
    pub pipeline: PipelineId,
    pub common: DrawCommon,
    pub indirect_buffer: BufferId,
    pub indirect_offset: u64,
    pub draw_count: u32,
    pub stride: u32,
    /// For the `*IndirectCount` variants.
    pub count_buffer: Option<(BufferId, u64)>,
    pub max_draw_count: u32,
}

#[derive(Clone, Debug)]
pub struct DrawIndexedIndirect {
    pub indirect: DrawIndirectCommon,
    pub index_buffer: BufferId,
    pub index_offset: u64,
    pub index_type: vk::IndexType,
}

#[derive(Clone, Debug)]
pub struct DrawMeshes {
    pub pipeline: PipelineId,
    pub common: DrawCommon,
    pub task_count: u32,
    pub first_task: u32,
    /// Indirect variant when set; `count_buffer` additionally selects the
    /// `IndirectCount` form.
    pub indirect: Option<(BufferId, u64, u32, u32)>,
    pub count_buffer: Option<(BufferId, u64)>,
}

/// Record callback for a custom draw; runs inside the render pass.
pub type CustomDrawCallback = Box<dyn FnOnce(&ash::Device, vk::CommandBuffer) + Send>;

/// A declared access of a custom task or draw, so the tracker can cover
/// caller-recorded commands.
#[derive(Clone, Debug)]
pub enum DeclaredAccess {
    Buffer {
        buffer: BufferId,
        stages: vk::PipelineStageFlags,
        access: vk::AccessFlags,
    },
    Image {
        image: ImageId,
        range: Option<SubRange>,
        stages: vk::PipelineStageFlags,
        access: vk::AccessFlags,
        layout: vk::ImageLayout,
    },
}

pub struct CustomDraw {
    pub accesses: Vec<DeclaredAccess>,
    pub callback: CustomDrawCallback,
}

/// One draw inside a logical render pass.
pub enum DrawTask {
    Draw(DrawVertices),
    DrawIndexed(DrawIndexed),
    DrawIndirect(DrawIndirectCommon),
    DrawIndexedIndirect(DrawIndexedIndirect),
    DrawMeshes(DrawMeshes),
    Custom(CustomDraw),
}

impl DrawTask {
    pub(crate) fn pipeline(&self) -> Option<PipelineId> {
        match self {
            DrawTask::Draw(d) => Some(d.pipeline),
            DrawTask::DrawIndexed(d) => Some(d.pipeline),
            DrawTask::DrawIndirect(d) => Some(d.pipeline),
            DrawTask::DrawIndexedIndirect(d) => Some(d.indirect.pipeline),
            DrawTask::DrawMeshes(d) => Some(d.pipeline),
            DrawTask::Custom(_) => None,
        }
    }

    pub(crate) fn common(&self) -> Option<&DrawCommon> {
        match self {
            DrawTask::Draw(d) => Some(&d.common),
            DrawTask::DrawIndexed(d) => Some(&d.common),
            DrawTask::DrawIndirect(d) => Some(&d.common),
            DrawTask::DrawIndexedIndirect(d) => Some(&d.indirect.common),
            DrawTask::DrawMeshes(d) => Some(&d.common),
            DrawTask::Custom(_) => None,
        }
    }
}

pub struct DispatchCompute {
    pub pipeline: PipelineId,
    pub resources: Vec<PipelineResources>,
    pub push_constants: PushConstantData,
    pub group_count: [u32; 3],
    /// When set, dispatch parameters come from this buffer (`Indirect`
    /// variant); `group_count` is ignored.
    pub indirect: Option<(BufferId, u64)>,
}

pub struct ReadBuffer {
    pub src: BufferId,
    pub offset: u64,
    pub size: u64,
    pub callback: ReadbackCallback,
}

pub struct ReadImage {
    pub src: ImageId,
    pub mip_level: u32,
    pub array_layer: u32,
    pub callback: ReadbackCallback,
}

pub struct BuildRtGeometry {
    pub geometry: RtGeometryId,
    pub vertex_buffer: BufferId,
    pub vertex_count: u32,
    pub vertex_stride: u64,
    pub vertex_format: vk::Format,
    pub index_buffer: Option<(BufferId, u64, vk::IndexType)>,
    pub primitive_count: u32,
    pub scratch_buffer: BufferId,
}

pub struct BuildRtScene {
    pub scene: RtSceneId,
    /// Buffer of `VkAccelerationStructureInstanceKHR` records.
    pub instance_buffer: BufferId,
    pub instance_count: u32,
    pub scratch_buffer: BufferId,
    /// Geometries referenced by the instances; tracked as build inputs.
    pub geometries: Vec<RtGeometryId>,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct RtTableRegion {
    pub buffer: BufferId,
    pub offset: u64,
    pub size: u64,
    pub stride: u64,
}

pub struct TraceRays {
    pub pipeline: PipelineId,
    pub resources: Vec<PipelineResources>,
    pub push_constants: PushConstantData,
    pub raygen: RtTableRegion,
    pub miss: RtTableRegion,
    pub hit: RtTableRegion,
    pub callable: Option<RtTableRegion>,
    pub dimensions: [u32; 3],
    pub scene: RtSceneId,
}

pub type CustomTaskCallback = Box<dyn FnOnce(&ash::Device, vk::CommandBuffer) + Send>;

pub struct CustomTask {
    pub accesses: Vec<DeclaredAccess>,
    pub callback: CustomTaskCallback,
}

/// The operations a recorder accepts. Draw variants live inside
/// [`DrawTask`] and reach the graph through `SubmitRenderPass`.
pub enum Task {
    SubmitRenderPass(LogicalPassId),
    Dispatch(DispatchCompute),
    CopyBuffer {
        src: BufferId,
        dst: BufferId,
        regions: Vec<BufferCopyRegion>,
    },
    CopyImage {
        src: ImageId,
        dst: ImageId,
        regions: Vec<ImageCopyRegion>,
    },
    CopyBufferToImage {
        src: BufferId,
        dst: ImageId,
        regions: Vec<BufferImageCopyRegion>,
    },
    CopyImageToBuffer {
        src: ImageId,
        dst: BufferId,
        regions: Vec<BufferImageCopyRegion>,
    },
    BlitImage {
        src: ImageId,
        dst: ImageId,
        filter: vk::Filter,
        regions: Vec<ImageBlitRegion>,
    },
    GenerateMipmaps {
        image: ImageId,
    },
    ResolveImage {
        src: ImageId,
        dst: ImageId,
        regions: Vec<ImageResolveRegion>,
    },
    FillBuffer {
        dst: BufferId,
        offset: u64,
        size: u64,
        data: u32,
    },
    ClearColorImage {
        image: ImageId,
        color: [f32; 4],
        ranges: Vec<SubRange>,
    },
    ClearDepthStencilImage {
        image: ImageId,
        depth: f32,
        stencil: u32,
        ranges: Vec<SubRange>,
    },
    /// Staged upload through the frame's staging ring.
    UpdateBuffer {
        dst: BufferId,
        dst_offset: u64,
        data: Vec<u8>,
    },
    /// Staged upload of image texels through the staging ring.
    UpdateImage {
        dst: ImageId,
        subresource: SubresourceLayers,
        data: Vec<u8>,
        row_pitch: u64,
    },
    ReadBuffer(ReadBuffer),
    ReadImage(ReadImage),
    Present {
        swapchain: SwapchainId,
        src: ImageId,
    },
    UpdateRtShaderTable {
        dst: BufferId,
        dst_offset: u64,
        data: Vec<u8>,
    },
    BuildRtGeometry(BuildRtGeometry),
    BuildRtScene(BuildRtScene),
    TraceRays(TraceRays),
    Custom(CustomTask),
}

impl Task {
    /// Short tag for logs, debug markers and the graph dump.
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Task::SubmitRenderPass(_) => "SubmitRenderPass",
            Task::Dispatch(d) if d.indirect.is_some() => "DispatchComputeIndirect",
            Task::Dispatch(_) => "DispatchCompute",
            Task::CopyBuffer { .. } => "CopyBuffer",
            Task::CopyImage { .. } => "CopyImage",
            Task::CopyBufferToImage { .. } => "CopyBufferToImage",
            Task::CopyImageToBuffer { .. } => "CopyImageToBuffer",
            Task::BlitImage { .. } => "BlitImage",
            Task::GenerateMipmaps { .. } => "GenerateMipmaps",
            Task::ResolveImage { .. } => "ResolveImage",
            Task::FillBuffer { .. } => "FillBuffer",
            Task::ClearColorImage { .. } => "ClearColorImage",
            Task::ClearDepthStencilImage { .. } => "ClearDepthStencilImage",
            Task::UpdateBuffer { .. } => "UpdateBuffer",
            Task::UpdateImage { .. } => "UpdateImage",
            Task::ReadBuffer(_) => "ReadBuffer",
            Task::ReadImage(_) => "ReadImage",
            Task::Present { .. } => "Present",
            Task::UpdateRtShaderTable { .. } => "UpdateRayTracingShaderTable",
            Task::BuildRtGeometry(_) => "BuildRayTracingGeometry",
            Task::BuildRtScene(_) => "BuildRayTracingScene",
            Task::TraceRays(_) => "TraceRays",
            Task::Custom(_) => "CustomTask",
        }
    }
}
