//! Command recorders and the per-recorder task graph.
//!
//! A recorder accumulates task declarations into a DAG (explicit
//! `depends_on` edges plus the implicit edges shared resources introduce),
//! validates every declaration against resource usage flags, and on
//! `execute` walks the tasks in topological order: the tracker realises the
//! barriers each task needs, then the matching Vulkan commands are recorded.
//! Because `depends_on` may only reference earlier tasks, declaration order
//! is itself a valid topological order; ties resolve to it naturally.
//!
//! Adjacent `SubmitRenderPass` tasks whose logical passes are compatible are
//! fused into one Vulkan render pass with multiple subpasses.
//!
//! The recorder's output is a [`CmdBatch`] appended to the submission
//! engine's pending list for its queue.

pub mod render_pass;
pub mod task;

pub use render_pass::{ColorAttachment, DepthStencilAttachment, LogicalRenderPassDesc};
pub use task::*;

use crate::device::QueueKind;
use crate::error::{Error, Result};
use crate::framegraph::FrameGraph;
use crate::ids::CommandBatchName;
use crate::resource::{
    AnyResource, BoundResource, BufferId, ImageId, PipelineResources, ResourceManager,
};
use crate::submit::{BatchState, CmdBatch};
use crate::track::{BarrierSet, LocalTracker};
use ash::vk;
use fxhash::FxHashSet;
use render_pass::LogicalRenderPass;
use std::sync::Arc;
use tracing::{error, trace, trace_span};

/// Parameters of a new command recorder.
#[derive(Clone, Debug)]
pub struct RecorderDesc {
    pub name: CommandBatchName,
    pub queue: QueueKind,
    /// Position of this batch among the batches submitted together on its
    /// queue; lower orders are submitted first.
    pub order: u32,
    /// Flush the engine as soon as this recorder's batch is enqueued.
    pub submit_immediately: bool,
    /// Capture shader executions for the shader-debug callback.
    pub debug_trace: bool,
}

impl Default for RecorderDesc {
    fn default() -> Self {
        RecorderDesc {
            name: CommandBatchName::new("batch"),
            queue: QueueKind::Graphics,
            order: 0,
            submit_immediately: false,
            debug_trace: false,
        }
    }
}

impl RecorderDesc {
    pub fn new(name: &str, queue: QueueKind) -> RecorderDesc {
        RecorderDesc {
            name: CommandBatchName::new(name),
            queue,
            ..Default::default()
        }
    }
}

struct TaskNode {
    name: String,
    task: Task,
    explicit_deps: Vec<usize>,
}

/// Records tasks for one command batch. Strictly thread-local: all methods
/// take `&mut self` and the recorder is consumed by [`execute`].
///
/// [`execute`]: CommandRecorder::execute
pub struct CommandRecorder<'a> {
    fg: &'a FrameGraph,
    batch: Arc<CmdBatch>,
    tracker: LocalTracker,
    tasks: Vec<TaskNode>,
    passes: Vec<LogicalRenderPass>,
    refs: FxHashSet<AnyResource>,
    queue_kind: QueueKind,
    debug_trace: bool,
    executed: bool,
}

impl<'a> CommandRecorder<'a> {
    pub(crate) fn new(
        fg: &'a FrameGraph,
        batch: Arc<CmdBatch>,
        desc: &RecorderDesc,
    ) -> CommandRecorder<'a> {
        let queue_family = batch.queue_family();
        CommandRecorder {
            fg,
            batch,
            tracker: LocalTracker::new(queue_family),
            tasks: Vec::new(),
            passes: Vec::new(),
            refs: FxHashSet::default(),
            queue_kind: desc.queue,
            debug_trace: desc.debug_trace,
            executed: false,
        }
    }

    pub fn queue_kind(&self) -> QueueKind {
        self.queue_kind
    }

    pub fn batch(&self) -> &Arc<CmdBatch> {
        &self.batch
    }

    fn resources(&self) -> &ResourceManager {
        self.fg.resources()
    }

    fn reference(&mut self, r: AnyResource) {
        if self.refs.insert(r) {
            self.resources().acquire_any(r);
        }
    }

    // ------------------------------------------------------------------
    // declaration

    /// Declares a task. `depends_on` may only name earlier tasks of this
    /// recorder. A failed validation drops the task and leaves the recorder
    /// usable for further, independent declarations.
    pub fn add_task(&mut self, name: &str, task: Task, depends_on: &[TaskId]) -> Result<TaskId> {
        let index = self.tasks.len();
        for dep in depends_on {
            if dep.0 >= index {
                return Err(Error::Configuration {
                    name: name.to_string(),
                    reason: "depends_on references a task that was not declared yet".to_string(),
                });
            }
        }
        if let Err(e) = self.validate_task(&task) {
            error!(task = task.kind(), name, %e, "task validation failed");
            return Err(e);
        }
        self.reference_task_resources(&task);
        self.tasks.push(TaskNode {
            name: name.to_string(),
            task,
            explicit_deps: depends_on.iter().map(|d| d.0).collect(),
        });
        Ok(TaskId(index))
    }

    /// Starts a logical render pass. Draws are attached with [`add_draw`]
    /// and the pass enters the graph through [`submit_render_pass`].
    ///
    /// [`add_draw`]: CommandRecorder::add_draw
    /// [`submit_render_pass`]: CommandRecorder::submit_render_pass
    pub fn begin_render_pass(&mut self, desc: LogicalRenderPassDesc) -> Result<LogicalPassId> {
        let pass = LogicalRenderPass::validate(self.resources(), desc)?;
        for attachment in &pass.desc.color_attachments {
            self.reference(AnyResource::Image(attachment.image));
        }
        if let Some(ds) = &pass.desc.depth_stencil {
            self.reference(AnyResource::Image(ds.image));
        }
        if let Some(sri) = pass.desc.shading_rate_image {
            self.reference(AnyResource::Image(sri));
        }
        self.passes.push(pass);
        Ok(LogicalPassId(self.passes.len() - 1))
    }

    pub fn add_draw(&mut self, pass: LogicalPassId, draw: DrawTask) -> Result<()> {
        self.validate_draw(&draw)?;
        self.reference_draw_resources(&draw);
        let pass = self
            .passes
            .get_mut(pass.0)
            .ok_or(Error::Configuration {
                name: "render pass".to_string(),
                reason: "unknown logical render pass".to_string(),
            })?;
        if pass.submitted {
            return Err(Error::Configuration {
                name: "render pass".to_string(),
                reason: "draws cannot be added to an already submitted render pass".to_string(),
            });
        }
        pass.draws.push(draw);
        Ok(())
    }

    /// Closes a logical render pass and inserts it into the task graph.
    pub fn submit_render_pass(
        &mut self,
        name: &str,
        pass: LogicalPassId,
        depends_on: &[TaskId],
    ) -> Result<TaskId> {
        let lp = self.passes.get_mut(pass.0).ok_or(Error::Configuration {
            name: name.to_string(),
            reason: "unknown logical render pass".to_string(),
        })?;
        if lp.submitted {
            return Err(Error::Configuration {
                name: name.to_string(),
                reason: "render pass already submitted".to_string(),
            });
        }
        lp.submitted = true;
        self.add_task(name, Task::SubmitRenderPass(pass), depends_on)
    }

    // ------------------------------------------------------------------
    // validation

    fn check_buffer_usage(
        &self,
        id: BufferId,
        usage: vk::BufferUsageFlags,
        required: &'static str,
    ) -> Result<()> {
        let desc = self.resources().describe_buffer(id)?;
        if !desc.usage.contains(usage) {
            return Err(Error::MissingUsage {
                name: self.resources().buffer_name(id),
                required,
            });
        }
        Ok(())
    }

    fn check_image_usage(
        &self,
        id: ImageId,
        usage: vk::ImageUsageFlags,
        required: &'static str,
    ) -> Result<()> {
        let desc = self.resources().describe_image(id)?;
        if !desc.usage.contains(usage) {
            return Err(Error::MissingUsage {
                name: self.resources().image_name(id),
                required,
            });
        }
        Ok(())
    }

    fn validate_task(&self, t: &Task) -> Result<()> {
        use vk::BufferUsageFlags as BU;
        use vk::ImageUsageFlags as IU;
        match t {
            Task::SubmitRenderPass(_) => Ok(()),
            Task::Dispatch(d) => {
                if let Some((buffer, _)) = d.indirect {
                    self.check_buffer_usage(buffer, BU::INDIRECT_BUFFER, "INDIRECT_BUFFER")?;
                }
                Ok(())
            }
            Task::CopyBuffer { src, dst, regions } => {
                self.check_buffer_usage(*src, BU::TRANSFER_SRC, "TRANSFER_SRC")?;
                self.check_buffer_usage(*dst, BU::TRANSFER_DST, "TRANSFER_DST")?;
                let src_size = self.resources().describe_buffer(*src)?.byte_size;
                let dst_size = self.resources().describe_buffer(*dst)?.byte_size;
                for r in regions {
                    if r.src_offset + r.size > src_size || r.dst_offset + r.size > dst_size {
                        return Err(Error::Configuration {
                            name: self.resources().buffer_name(*dst),
                            reason: "copy region out of bounds".to_string(),
                        });
                    }
                }
                Ok(())
            }
            Task::CopyImage { src, dst, .. } => {
                self.check_image_usage(*src, IU::TRANSFER_SRC, "TRANSFER_SRC")?;
                self.check_image_usage(*dst, IU::TRANSFER_DST, "TRANSFER_DST")
            }
            Task::CopyBufferToImage { src, dst, .. } => {
                self.check_buffer_usage(*src, BU::TRANSFER_SRC, "TRANSFER_SRC")?;
                self.check_image_usage(*dst, IU::TRANSFER_DST, "TRANSFER_DST")
            }
            Task::CopyImageToBuffer { src, dst, .. } => {
                self.check_image_usage(*src, IU::TRANSFER_SRC, "TRANSFER_SRC")?;
                self.check_buffer_usage(*dst, BU::TRANSFER_DST, "TRANSFER_DST")
            }
            Task::BlitImage {
                src, dst, filter, ..
            } => {
                self.check_image_usage(*src, IU::TRANSFER_SRC, "TRANSFER_SRC")?;
                self.check_image_usage(*dst, IU::TRANSFER_DST, "TRANSFER_DST")?;
                let src_format = self.resources().describe_image(*src)?.format;
                let dst_format = self.resources().describe_image(*dst)?.format;
                let depth_stencil = crate::format_aspect_mask(src_format)
                    != vk::ImageAspectFlags::COLOR
                    || crate::format_aspect_mask(dst_format) != vk::ImageAspectFlags::COLOR;
                if depth_stencil && *filter != vk::Filter::NEAREST {
                    return Err(Error::Configuration {
                        name: self.resources().image_name(*src),
                        reason: "depth/stencil blits must use nearest filtering".to_string(),
                    });
                }
                Ok(())
            }
            Task::GenerateMipmaps { image } => {
                self.check_image_usage(*image, IU::TRANSFER_SRC, "TRANSFER_SRC")?;
                self.check_image_usage(*image, IU::TRANSFER_DST, "TRANSFER_DST")
            }
            Task::ResolveImage { src, dst, .. } => {
                self.check_image_usage(*src, IU::TRANSFER_SRC, "TRANSFER_SRC")?;
                self.check_image_usage(*dst, IU::TRANSFER_DST, "TRANSFER_DST")?;
                let src_desc = self.resources().describe_image(*src)?;
                let dst_desc = self.resources().describe_image(*dst)?;
                if src_desc.samples <= 1 || dst_desc.samples != 1 {
                    return Err(Error::Configuration {
                        name: self.resources().image_name(*src),
                        reason: "resolve requires a multisampled source and a single-sample destination"
                            .to_string(),
                    });
                }
                Ok(())
            }
            Task::FillBuffer { dst, offset, size, .. } => {
                self.check_buffer_usage(*dst, BU::TRANSFER_DST, "TRANSFER_DST")?;
                if offset % 4 != 0 || (*size != vk::WHOLE_SIZE && size % 4 != 0) {
                    return Err(Error::Configuration {
                        name: self.resources().buffer_name(*dst),
                        reason: "fill offset and size must be 4-byte aligned".to_string(),
                    });
                }
                Ok(())
            }
            Task::ClearColorImage { image, .. } => {
                self.check_image_usage(*image, IU::TRANSFER_DST, "TRANSFER_DST")?;
                let format = self.resources().describe_image(*image)?.format;
                if crate::format_aspect_mask(format) != vk::ImageAspectFlags::COLOR {
                    return Err(Error::Configuration {
                        name: self.resources().image_name(*image),
                        reason: "color clear on a depth/stencil image".to_string(),
                    });
                }
                Ok(())
            }
            Task::ClearDepthStencilImage { image, .. } => {
                self.check_image_usage(*image, IU::TRANSFER_DST, "TRANSFER_DST")?;
                let format = self.resources().describe_image(*image)?.format;
                if crate::format_aspect_mask(format) == vk::ImageAspectFlags::COLOR {
                    return Err(Error::Configuration {
                        name: self.resources().image_name(*image),
                        reason: "depth/stencil clear on a color image".to_string(),
                    });
                }
                Ok(())
            }
            Task::UpdateBuffer { dst, dst_offset, data } => {
                self.check_buffer_usage(*dst, BU::TRANSFER_DST, "TRANSFER_DST")?;
                let size = self.resources().describe_buffer(*dst)?.byte_size;
                if dst_offset + data.len() as u64 > size {
                    return Err(Error::Configuration {
                        name: self.resources().buffer_name(*dst),
                        reason: "update range exceeds the buffer".to_string(),
                    });
                }
                Ok(())
            }
            Task::UpdateImage { dst, row_pitch, .. } => {
                self.check_image_usage(*dst, IU::TRANSFER_DST, "TRANSFER_DST")?;
                if *row_pitch == 0 {
                    return Err(Error::Configuration {
                        name: self.resources().image_name(*dst),
                        reason: "image update needs a non-zero row pitch".to_string(),
                    });
                }
                Ok(())
            }
            Task::ReadBuffer(r) => {
                self.check_buffer_usage(r.src, BU::TRANSFER_SRC, "TRANSFER_SRC")?;
                let size = self.resources().describe_buffer(r.src)?.byte_size;
                if r.offset + r.size > size {
                    return Err(Error::Configuration {
                        name: self.resources().buffer_name(r.src),
                        reason: "read range exceeds the buffer".to_string(),
                    });
                }
                Ok(())
            }
            Task::ReadImage(r) => {
                self.check_image_usage(r.src, IU::TRANSFER_SRC, "TRANSFER_SRC")?;
                let desc = self.resources().describe_image(r.src)?;
                if r.mip_level >= desc.mip_levels || r.array_layer >= desc.array_layers {
                    return Err(Error::Configuration {
                        name: self.resources().image_name(r.src),
                        reason: "read targets a subresource outside the image".to_string(),
                    });
                }
                if crate::format_texel_size(desc.format).is_none() {
                    return Err(Error::Configuration {
                        name: self.resources().image_name(r.src),
                        reason: format!("readback of format {:?} is not supported", desc.format),
                    });
                }
                Ok(())
            }
            Task::Present { swapchain, src } => {
                self.check_image_usage(*src, IU::TRANSFER_SRC, "TRANSFER_SRC")?;
                let info = self.resources().swapchain_record_info(*swapchain)?;
                let src_format = self.resources().describe_image(*src)?.format;
                if !compatible_present_formats(src_format, info.format) {
                    return Err(Error::Configuration {
                        name: self.resources().image_name(*src),
                        reason: format!(
                            "source format {:?} is not compatible with swapchain format {:?}",
                            src_format, info.format
                        ),
                    });
                }
                Ok(())
            }
            Task::UpdateRtShaderTable { dst, .. } => self.check_buffer_usage(
                *dst,
                BU::SHADER_BINDING_TABLE_KHR | BU::TRANSFER_DST,
                "SHADER_BINDING_TABLE | TRANSFER_DST",
            ),
            Task::BuildRtGeometry(b) => {
                self.check_buffer_usage(
                    b.vertex_buffer,
                    BU::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
                    "ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY",
                )?;
                if let Some((index_buffer, _, _)) = b.index_buffer {
                    self.check_buffer_usage(
                        index_buffer,
                        BU::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
                        "ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY",
                    )?;
                }
                self.check_buffer_usage(
                    b.scratch_buffer,
                    BU::STORAGE_BUFFER | BU::SHADER_DEVICE_ADDRESS,
                    "STORAGE_BUFFER | SHADER_DEVICE_ADDRESS",
                )
            }
            Task::BuildRtScene(b) => {
                self.check_buffer_usage(
                    b.instance_buffer,
                    BU::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
                    "ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY",
                )?;
                self.check_buffer_usage(
                    b.scratch_buffer,
                    BU::STORAGE_BUFFER | BU::SHADER_DEVICE_ADDRESS,
                    "STORAGE_BUFFER | SHADER_DEVICE_ADDRESS",
                )
            }
            Task::TraceRays(t) => {
                for region in [Some(&t.raygen), Some(&t.miss), Some(&t.hit), t.callable.as_ref()]
                    .into_iter()
                    .flatten()
                {
                    self.check_buffer_usage(
                        region.buffer,
                        BU::SHADER_BINDING_TABLE_KHR | BU::SHADER_DEVICE_ADDRESS,
                        "SHADER_BINDING_TABLE | SHADER_DEVICE_ADDRESS",
                    )?;
                }
                Ok(())
            }
            Task::Custom(_) => Ok(()),
        }
    }

    fn validate_draw(&self, draw: &DrawTask) -> Result<()> {
        use vk::BufferUsageFlags as BU;
        if let Some(common) = draw.common() {
            for vb in &common.vertex_buffers {
                self.check_buffer_usage(vb.buffer, BU::VERTEX_BUFFER, "VERTEX_BUFFER")?;
            }
        }
        match draw {
            DrawTask::DrawIndexed(d) => {
                self.check_buffer_usage(d.index_buffer, BU::INDEX_BUFFER, "INDEX_BUFFER")
            }
            DrawTask::DrawIndirect(d) => {
                self.check_buffer_usage(d.indirect_buffer, BU::INDIRECT_BUFFER, "INDIRECT_BUFFER")?;
                if let Some((count, _)) = d.count_buffer {
                    self.check_buffer_usage(count, BU::INDIRECT_BUFFER, "INDIRECT_BUFFER")?;
                }
                Ok(())
            }
            DrawTask::DrawIndexedIndirect(d) => {
                self.check_buffer_usage(d.index_buffer, BU::INDEX_BUFFER, "INDEX_BUFFER")?;
                self.check_buffer_usage(
                    d.indirect.indirect_buffer,
                    BU::INDIRECT_BUFFER,
                    "INDIRECT_BUFFER",
                )?;
                if let Some((count, _)) = d.indirect.count_buffer {
                    self.check_buffer_usage(count, BU::INDIRECT_BUFFER, "INDIRECT_BUFFER")?;
                }
                Ok(())
            }
            DrawTask::DrawMeshes(d) => {
                if self.fg.device().vk_nv_mesh_shader.is_none() {
                    return Err(Error::Configuration {
                        name: "DrawMeshes".to_string(),
                        reason: "device was initialized without mesh shading support".to_string(),
                    });
                }
                if let Some((buffer, ..)) = d.indirect {
                    self.check_buffer_usage(buffer, BU::INDIRECT_BUFFER, "INDIRECT_BUFFER")?;
                }
                if let Some((count, _)) = d.count_buffer {
                    self.check_buffer_usage(count, BU::INDIRECT_BUFFER, "INDIRECT_BUFFER")?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // reference counting at declaration time

    fn reference_bound_resources(&mut self, sets: &[PipelineResources]) {
        for set in sets {
            for binding in &set.bindings {
                match binding.resource {
                    BoundResource::Empty => {}
                    BoundResource::Buffer { id, .. } => self.reference(AnyResource::Buffer(id)),
                    BoundResource::Image { id, .. } => self.reference(AnyResource::Image(id)),
                    BoundResource::CombinedImageSampler { id, sampler, .. } => {
                        self.reference(AnyResource::Image(id));
                        self.reference(AnyResource::Sampler(sampler));
                    }
                    BoundResource::Sampler(sampler) => {
                        self.reference(AnyResource::Sampler(sampler))
                    }
                    BoundResource::RtScene(scene) => self.reference(AnyResource::RtScene(scene)),
                }
            }
            self.reference(AnyResource::SetLayout(set.set_layout));
        }
    }

    fn reference_draw_resources(&mut self, draw: &DrawTask) {
        if let Some(pipeline) = draw.pipeline() {
            self.reference(AnyResource::Pipeline(pipeline));
        }
        if let Some(common) = draw.common() {
            let buffers: Vec<BufferId> = common.vertex_buffers.iter().map(|v| v.buffer).collect();
            for buffer in buffers {
                self.reference(AnyResource::Buffer(buffer));
            }
            let sets = common.resources.clone();
            self.reference_bound_resources(&sets);
        }
        match draw {
            DrawTask::DrawIndexed(d) => self.reference(AnyResource::Buffer(d.index_buffer)),
            DrawTask::DrawIndirect(d) => {
                self.reference(AnyResource::Buffer(d.indirect_buffer));
                if let Some((count, _)) = d.count_buffer {
                    self.reference(AnyResource::Buffer(count));
                }
            }
            DrawTask::DrawIndexedIndirect(d) => {
                self.reference(AnyResource::Buffer(d.index_buffer));
                self.reference(AnyResource::Buffer(d.indirect.indirect_buffer));
                if let Some((count, _)) = d.indirect.count_buffer {
                    self.reference(AnyResource::Buffer(count));
                }
            }
            DrawTask::DrawMeshes(d) => {
                if let Some((buffer, ..)) = d.indirect {
                    self.reference(AnyResource::Buffer(buffer));
                }
                if let Some((count, _)) = d.count_buffer {
                    self.reference(AnyResource::Buffer(count));
                }
            }
            _ => {}
        }
    }

    fn reference_task_resources(&mut self, t: &Task) {
        match t {
            Task::SubmitRenderPass(_) => {}
            Task::Dispatch(d) => {
                self.reference(AnyResource::Pipeline(d.pipeline));
                let sets = d.resources.clone();
                self.reference_bound_resources(&sets);
                if let Some((buffer, _)) = d.indirect {
                    self.reference(AnyResource::Buffer(buffer));
                }
            }
            Task::CopyBuffer { src, dst, .. } => {
                self.reference(AnyResource::Buffer(*src));
                self.reference(AnyResource::Buffer(*dst));
            }
            Task::CopyImage { src, dst, .. } => {
                self.reference(AnyResource::Image(*src));
                self.reference(AnyResource::Image(*dst));
            }
            Task::CopyBufferToImage { src, dst, .. } => {
                self.reference(AnyResource::Buffer(*src));
                self.reference(AnyResource::Image(*dst));
            }
            Task::CopyImageToBuffer { src, dst, .. } => {
                self.reference(AnyResource::Image(*src));
                self.reference(AnyResource::Buffer(*dst));
            }
            Task::BlitImage { src, dst, .. } | Task::ResolveImage { src, dst, .. } => {
                self.reference(AnyResource::Image(*src));
                self.reference(AnyResource::Image(*dst));
            }
            Task::GenerateMipmaps { image }
            | Task::ClearColorImage { image, .. }
            | Task::ClearDepthStencilImage { image, .. } => {
                self.reference(AnyResource::Image(*image));
            }
            Task::FillBuffer { dst, .. }
            | Task::UpdateBuffer { dst, .. }
            | Task::UpdateRtShaderTable { dst, .. } => {
                self.reference(AnyResource::Buffer(*dst));
            }
            Task::UpdateImage { dst, .. } => self.reference(AnyResource::Image(*dst)),
            Task::ReadBuffer(r) => self.reference(AnyResource::Buffer(r.src)),
            Task::ReadImage(r) => self.reference(AnyResource::Image(r.src)),
            Task::Present { swapchain, src } => {
                self.reference(AnyResource::Swapchain(*swapchain));
                self.reference(AnyResource::Image(*src));
            }
            Task::BuildRtGeometry(b) => {
                self.reference(AnyResource::RtGeometry(b.geometry));
                self.reference(AnyResource::Buffer(b.vertex_buffer));
                if let Some((index_buffer, _, _)) = b.index_buffer {
                    self.reference(AnyResource::Buffer(index_buffer));
                }
                self.reference(AnyResource::Buffer(b.scratch_buffer));
            }
            Task::BuildRtScene(b) => {
                self.reference(AnyResource::RtScene(b.scene));
                self.reference(AnyResource::Buffer(b.instance_buffer));
                self.reference(AnyResource::Buffer(b.scratch_buffer));
                for &g in &b.geometries {
                    self.reference(AnyResource::RtGeometry(g));
                }
            }
            Task::TraceRays(t) => {
                self.reference(AnyResource::Pipeline(t.pipeline));
                self.reference(AnyResource::RtScene(t.scene));
                let sets = t.resources.clone();
                self.reference_bound_resources(&sets);
                for region in [Some(&t.raygen), Some(&t.miss), Some(&t.hit), t.callable.as_ref()]
                    .into_iter()
                    .flatten()
                {
                    self.reference(AnyResource::Buffer(region.buffer));
                }
            }
            Task::Custom(c) => {
                let accesses: Vec<AnyResource> = c
                    .accesses
                    .iter()
                    .map(|a| match a {
                        DeclaredAccess::Buffer { buffer, .. } => AnyResource::Buffer(*buffer),
                        DeclaredAccess::Image { image, .. } => AnyResource::Image(*image),
                    })
                    .collect();
                for r in accesses {
                    self.reference(r);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // dump

    /// Serializes the declared task graph for debugging.
    pub fn dump_json(&self) -> serde_json::Value {
        use serde_json::json;
        let tasks: Vec<_> = self
            .tasks
            .iter()
            .enumerate()
            .map(|(i, node)| {
                json!({
                    "index": i,
                    "kind": node.task.kind(),
                    "name": node.name,
                    "dependsOn": node.explicit_deps,
                })
            })
            .collect();
        json!({
            "batch": self.batch.name().as_str(),
            "queue": format!("{:?}", self.queue_kind),
            "tasks": tasks,
        })
    }

    // ------------------------------------------------------------------
    // execution

    /// Walks the task graph, emits barriers and Vulkan commands, bakes the
    /// batch and hands it to the submission engine.
    pub fn execute(mut self) -> Result<Arc<CmdBatch>> {
        let _span = trace_span!("recorder_execute", name = ?self.batch.name()).entered();
        let device = self.fg.device().clone();
        let batch = self.batch.clone();

        let cb = {
            let mut inner = batch.inner.lock();
            let allocator = inner
                .allocator
                .as_mut()
                .expect("batch has no command allocator");
            let cb = allocator.allocate(&device.device)?;
            inner.command_buffers.push(cb);
            cb
        };
        let begin_info = vk::CommandBufferBeginInfo {
            flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            ..Default::default()
        };
        unsafe {
            device
                .device
                .begin_command_buffer(cb, &begin_info)
                .map_err(|e| Error::device("vkBeginCommandBuffer", e))?;
        }

        let task_count = self.tasks.len();
        let mut nodes: Vec<Option<TaskNode>> =
            std::mem::take(&mut self.tasks).into_iter().map(Some).collect();
        let mut i = 0;
        while i < nodes.len() {
            let is_render_pass = matches!(
                nodes[i].as_ref().map(|n| &n.task),
                Some(&Task::SubmitRenderPass(_))
            );
            if is_render_pass {
                // group consecutive compatible render passes into one
                // physical pass with multiple subpasses
                let mut group_nodes = vec![nodes[i].take().unwrap()];
                let mut j = i + 1;
                while j < nodes.len() {
                    let Some(node) = nodes[j].as_ref() else { break };
                    let Task::SubmitRenderPass(next) = node.task else {
                        break;
                    };
                    let Task::SubmitRenderPass(last) = group_nodes.last().unwrap().task else {
                        unreachable!()
                    };
                    if !render_pass::can_merge(&self.passes[last.0], &self.passes[next.0]) {
                        break;
                    }
                    group_nodes.push(nodes[j].take().unwrap());
                    j += 1;
                }
                self.record_render_pass_group(&device.device, cb, i, group_nodes)?;
                i = j;
            } else {
                let node = nodes[i].take().unwrap();
                self.record_task(&device.device, cb, i, node)?;
                i += 1;
            }
        }

        // normalize image subresource layouts and publish final states
        let tracker = std::mem::replace(&mut self.tracker, LocalTracker::new(0));
        let epilogue = tracker.finish(self.resources(), &batch);
        emit_barriers(&device.device, cb, &epilogue);

        unsafe {
            device
                .device
                .end_command_buffer(cb)
                .map_err(|e| Error::device("vkEndCommandBuffer", e))?;
        }

        // the batch takes over the references held by the recorder
        {
            let mut inner = batch.inner.lock();
            inner.release_resources.extend(self.refs.drain());
        }

        batch.advance(BatchState::Baked);
        self.fg.flush_staging_uploads();
        self.fg.engine().enqueue(batch.clone())?;
        self.executed = true;
        trace!(name = ?batch.name(), tasks = task_count, "recorder executed");
        Ok(batch)
    }
}

impl Drop for CommandRecorder<'_> {
    fn drop(&mut self) {
        if !self.executed {
            // recorder abandoned: give back the acquired references
            let drained: Vec<_> = self.refs.drain().collect();
            for r in drained {
                self.resources().release_any(r);
            }
        }
    }
}

fn compatible_present_formats(src: vk::Format, swapchain: vk::Format) -> bool {
    if src == swapchain {
        return true;
    }
    let rgba8 = |f: vk::Format| {
        matches!(
            f,
            vk::Format::R8G8B8A8_UNORM
                | vk::Format::R8G8B8A8_SRGB
                | vk::Format::B8G8R8A8_UNORM
                | vk::Format::B8G8R8A8_SRGB
        )
    };
    rgba8(src) && rgba8(swapchain)
}

pub(crate) fn emit_barriers(device: &ash::Device, cb: vk::CommandBuffer, set: &BarrierSet) {
    if set.is_empty() {
        return;
    }
    let src = if set.src_stages.is_empty() {
        vk::PipelineStageFlags::TOP_OF_PIPE
    } else {
        set.src_stages
    };
    let dst = if set.dst_stages.is_empty() {
        vk::PipelineStageFlags::BOTTOM_OF_PIPE
    } else {
        set.dst_stages
    };
    let image_barriers: Vec<vk::ImageMemoryBarrier> =
        set.image_barriers.iter().map(|b| b.to_vk()).collect();
    let buffer_barriers: Vec<vk::BufferMemoryBarrier> =
        set.buffer_barriers.iter().map(|b| b.to_vk()).collect();
    unsafe {
        device.cmd_pipeline_barrier(
            cb,
            src,
            dst,
            vk::DependencyFlags::empty(),
            &[],
            &buffer_barriers,
            &image_barriers,
        );
    }
}

/// Maps shader stages of a descriptor binding to the pipeline stages used
/// for synchronization.
pub(crate) fn shader_to_pipeline_stages(stages: vk::ShaderStageFlags) -> vk::PipelineStageFlags {
    let mut out = vk::PipelineStageFlags::empty();
    if stages.contains(vk::ShaderStageFlags::VERTEX) {
        out |= vk::PipelineStageFlags::VERTEX_SHADER;
    }
    if stages.contains(vk::ShaderStageFlags::TESSELLATION_CONTROL) {
        out |= vk::PipelineStageFlags::TESSELLATION_CONTROL_SHADER;
    }
    if stages.contains(vk::ShaderStageFlags::TESSELLATION_EVALUATION) {
        out |= vk::PipelineStageFlags::TESSELLATION_EVALUATION_SHADER;
    }
    if stages.contains(vk::ShaderStageFlags::GEOMETRY) {
        out |= vk::PipelineStageFlags::GEOMETRY_SHADER;
    }
    if stages.contains(vk::ShaderStageFlags::FRAGMENT) {
        out |= vk::PipelineStageFlags::FRAGMENT_SHADER;
    }
    if stages.contains(vk::ShaderStageFlags::COMPUTE) {
        out |= vk::PipelineStageFlags::COMPUTE_SHADER;
    }
    if stages.intersects(
        vk::ShaderStageFlags::RAYGEN_KHR
            | vk::ShaderStageFlags::MISS_KHR
            | vk::ShaderStageFlags::CLOSEST_HIT_KHR
            | vk::ShaderStageFlags::ANY_HIT_KHR
            | vk::ShaderStageFlags::INTERSECTION_KHR
            | vk::ShaderStageFlags::CALLABLE_KHR,
    ) {
        out |= vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR;
    }
    if stages.intersects(vk::ShaderStageFlags::TASK_NV | vk::ShaderStageFlags::MESH_NV) {
        out |= vk::PipelineStageFlags::MESH_SHADER_NV | vk::PipelineStageFlags::TASK_SHADER_NV;
    }
    if out.is_empty() {
        out = vk::PipelineStageFlags::ALL_COMMANDS;
    }
    out
}

mod record;
