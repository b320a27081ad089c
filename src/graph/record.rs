//! Vulkan command recording for the task graph.
//!
//! Every task first declares its resource accesses to the tracker, the
//! resulting barriers are recorded, then the task's commands follow. Render
//! pass groups declare all accesses (attachments plus every draw's inputs)
//! before `vkCmdBeginRenderPass` since barriers are illegal inside a render
//! pass.

use super::render_pass::{self, LogicalRenderPass};
use super::task::*;
use super::{emit_barriers, shader_to_pipeline_stages, CommandRecorder, TaskNode};
use crate::error::{Error, Result};
use crate::resource::{
    AnyResource, BoundResource, BufferId, ImageId, PipelineResources, TrackedResource,
};
use crate::staging::{self, ImageReadbackMeta, StagingPart};
use crate::submit::ShaderDebugRecord;
use crate::track::{AccessDesc, SubRange, TaskSync};
use ash::vk;
use tracing::trace;

fn mip_extent(v: u32, level: u32) -> u32 {
    (v >> level).max(1)
}

const TRANSFER_READ: AccessDesc = AccessDesc {
    stages: vk::PipelineStageFlags::TRANSFER,
    access: vk::AccessFlags::TRANSFER_READ,
    layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
    final_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
};

const TRANSFER_WRITE: AccessDesc = AccessDesc {
    stages: vk::PipelineStageFlags::TRANSFER,
    access: vk::AccessFlags::TRANSFER_WRITE,
    layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
    final_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
};

impl CommandRecorder<'_> {
    fn adopt_ref(&mut self, r: AnyResource) {
        if !self.refs.insert(r) {
            // the recorder already held a reference; drop the duplicate
            self.resources().release_any(r);
        }
    }

    fn declare_buffer(
        &mut self,
        sync: &mut TaskSync,
        task_index: usize,
        id: BufferId,
        stages: vk::PipelineStageFlags,
        access: vk::AccessFlags,
    ) -> Result<()> {
        self.tracker
            .declare_buffer_access(self.fg.resources(), task_index, id, stages, access, sync)
    }

    fn declare_image(
        &mut self,
        sync: &mut TaskSync,
        task_index: usize,
        id: ImageId,
        range: Option<SubRange>,
        desc: AccessDesc,
    ) -> Result<()> {
        self.tracker
            .declare_image_access(self.fg.resources(), task_index, id, range, desc, sync)
    }

    /// Declares the accesses implied by a descriptor-set binding array.
    fn declare_bound_resources(
        &mut self,
        sync: &mut TaskSync,
        task_index: usize,
        sets: &[PipelineResources],
    ) -> Result<()> {
        for set in sets {
            for binding in &set.bindings {
                let stages = shader_to_pipeline_stages(binding.stages);
                match binding.resource {
                    BoundResource::Empty | BoundResource::Sampler(_) => {}
                    BoundResource::Buffer { id, .. } => {
                        let access = match binding.descriptor_type {
                            vk::DescriptorType::STORAGE_BUFFER
                            | vk::DescriptorType::STORAGE_BUFFER_DYNAMIC => {
                                vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE
                            }
                            _ => vk::AccessFlags::UNIFORM_READ,
                        };
                        self.declare_buffer(sync, task_index, id, stages, access)?;
                    }
                    BoundResource::Image { id, layout }
                    | BoundResource::CombinedImageSampler { id, layout, .. } => {
                        let (access, layout) = match binding.descriptor_type {
                            vk::DescriptorType::STORAGE_IMAGE => (
                                vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
                                vk::ImageLayout::GENERAL,
                            ),
                            vk::DescriptorType::INPUT_ATTACHMENT => (
                                vk::AccessFlags::INPUT_ATTACHMENT_READ,
                                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                            ),
                            _ => (
                                vk::AccessFlags::SHADER_READ,
                                if layout == vk::ImageLayout::UNDEFINED {
                                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
                                } else {
                                    layout
                                },
                            ),
                        };
                        self.declare_image(
                            sync,
                            task_index,
                            id,
                            None,
                            AccessDesc::image(stages, access, layout),
                        )?;
                    }
                    BoundResource::RtScene(scene) => {
                        self.tracker.declare_rt_access(
                            self.fg.resources(),
                            task_index,
                            TrackedResource::RtScene(scene),
                            stages,
                            vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR,
                            sync,
                        )?;
                    }
                }
            }
        }
        Ok(())
    }

    fn declare_draw_inputs(
        &mut self,
        sync: &mut TaskSync,
        task_index: usize,
        draw: &DrawTask,
    ) -> Result<()> {
        if let Some(common) = draw.common() {
            let buffers: Vec<BufferId> = common.vertex_buffers.iter().map(|v| v.buffer).collect();
            for buffer in buffers {
                self.declare_buffer(
                    sync,
                    task_index,
                    buffer,
                    vk::PipelineStageFlags::VERTEX_INPUT,
                    vk::AccessFlags::VERTEX_ATTRIBUTE_READ,
                )?;
            }
            let sets = common.resources.clone();
            self.declare_bound_resources(sync, task_index, &sets)?;
        }
        let mut index_buffer = None;
        let mut indirect = Vec::new();
        match draw {
            DrawTask::DrawIndexed(d) => index_buffer = Some(d.index_buffer),
            DrawTask::DrawIndirect(d) => {
                indirect.push(d.indirect_buffer);
                if let Some((count, _)) = d.count_buffer {
                    indirect.push(count);
                }
            }
            DrawTask::DrawIndexedIndirect(d) => {
                index_buffer = Some(d.index_buffer);
                indirect.push(d.indirect.indirect_buffer);
                if let Some((count, _)) = d.indirect.count_buffer {
                    indirect.push(count);
                }
            }
            DrawTask::DrawMeshes(d) => {
                if let Some((buffer, ..)) = d.indirect {
                    indirect.push(buffer);
                }
                if let Some((count, _)) = d.count_buffer {
                    indirect.push(count);
                }
            }
            DrawTask::Custom(c) => {
                let accesses = c.accesses.clone();
                self.declare_custom_accesses(sync, task_index, &accesses)?;
            }
            DrawTask::Draw(_) => {}
        }
        if let Some(buffer) = index_buffer {
            self.declare_buffer(
                sync,
                task_index,
                buffer,
                vk::PipelineStageFlags::VERTEX_INPUT,
                vk::AccessFlags::INDEX_READ,
            )?;
        }
        for buffer in indirect {
            self.declare_buffer(
                sync,
                task_index,
                buffer,
                vk::PipelineStageFlags::DRAW_INDIRECT,
                vk::AccessFlags::INDIRECT_COMMAND_READ,
            )?;
        }
        Ok(())
    }

    fn declare_custom_accesses(
        &mut self,
        sync: &mut TaskSync,
        task_index: usize,
        accesses: &[DeclaredAccess],
    ) -> Result<()> {
        for access in accesses {
            match access {
                DeclaredAccess::Buffer {
                    buffer,
                    stages,
                    access,
                } => self.declare_buffer(sync, task_index, *buffer, *stages, *access)?,
                DeclaredAccess::Image {
                    image,
                    range,
                    stages,
                    access,
                    layout,
                } => self.declare_image(
                    sync,
                    task_index,
                    *image,
                    *range,
                    AccessDesc::image(*stages, *access, *layout),
                )?,
            }
        }
        Ok(())
    }

    fn buffer_device_address(&self, id: BufferId) -> Result<u64> {
        let handle = self.resources().buffer_handle(id)?;
        let info = vk::BufferDeviceAddressInfo {
            buffer: handle,
            ..Default::default()
        };
        Ok(unsafe { self.fg.device().device.get_buffer_device_address(&info) })
    }

    // ------------------------------------------------------------------
    // descriptor sets

    fn ensure_descriptor_pool(&mut self, device: &ash::Device) -> Result<vk::DescriptorPool> {
        {
            let inner = self.batch.inner.lock();
            if inner.descriptor_pool != vk::DescriptorPool::null() {
                return Ok(inner.descriptor_pool);
            }
        }
        let mut sizes = vec![
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: 256,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: 256,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: 256,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLED_IMAGE,
                descriptor_count: 128,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_IMAGE,
                descriptor_count: 128,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLER,
                descriptor_count: 64,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::INPUT_ATTACHMENT,
                descriptor_count: 32,
            },
        ];
        if self.fg.device().vk_khr_accel.is_some() {
            sizes.push(vk::DescriptorPoolSize {
                ty: vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
                descriptor_count: 32,
            });
        }
        let create_info = vk::DescriptorPoolCreateInfo {
            max_sets: 256,
            pool_size_count: sizes.len() as u32,
            p_pool_sizes: sizes.as_ptr(),
            ..Default::default()
        };
        let pool = unsafe {
            device
                .create_descriptor_pool(&create_info, None)
                .map_err(|e| Error::device("vkCreateDescriptorPool", e))?
        };
        self.batch.inner.lock().descriptor_pool = pool;
        Ok(pool)
    }

    fn image_view_2d(
        &mut self,
        device: &ash::Device,
        image: ImageId,
    ) -> Result<vk::ImageView> {
        let resources = self.fg.resources();
        let desc = resources.describe_image(image)?;
        let view_info = vk::ImageViewCreateInfo {
            image: resources.image_handle(image)?,
            view_type: vk::ImageViewType::TYPE_2D,
            format: desc.format,
            subresource_range: vk::ImageSubresourceRange {
                aspect_mask: resources.image_aspect(image)?,
                base_mip_level: 0,
                level_count: vk::REMAINING_MIP_LEVELS,
                base_array_layer: 0,
                layer_count: vk::REMAINING_ARRAY_LAYERS,
            },
            ..Default::default()
        };
        let view = unsafe {
            device
                .create_image_view(&view_info, None)
                .map_err(|e| Error::device("vkCreateImageView", e))?
        };
        self.batch.inner.lock().transient_image_views.push(view);
        Ok(view)
    }

    fn bind_descriptor_sets(
        &mut self,
        device: &ash::Device,
        cb: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        sets: &[PipelineResources],
    ) -> Result<()> {
        if sets.is_empty() {
            return Ok(());
        }
        let pool = self.ensure_descriptor_pool(device)?;

        for set in sets {
            let set_layout = self.resources().set_layout_handle(set.set_layout)?;
            let allocate_info = vk::DescriptorSetAllocateInfo {
                descriptor_pool: pool,
                descriptor_set_count: 1,
                p_set_layouts: &set_layout,
                ..Default::default()
            };
            let vk_set = unsafe {
                device.allocate_descriptor_sets(&allocate_info).map_err(|e| {
                    if e == vk::Result::ERROR_OUT_OF_POOL_MEMORY {
                        Error::DescriptorPoolExhausted
                    } else {
                        Error::device("vkAllocateDescriptorSets", e)
                    }
                })?[0]
            };

            // info arrays must not reallocate while writes point into them
            let binding_count = set.bindings.len();
            let mut buffer_infos: Vec<vk::DescriptorBufferInfo> = Vec::with_capacity(binding_count);
            let mut image_infos: Vec<vk::DescriptorImageInfo> = Vec::with_capacity(binding_count);
            let mut accel_handles: Vec<vk::AccelerationStructureKHR> =
                Vec::with_capacity(binding_count);
            let mut accel_writes: Vec<vk::WriteDescriptorSetAccelerationStructureKHR> =
                Vec::with_capacity(binding_count);
            let mut writes: Vec<vk::WriteDescriptorSet> = Vec::with_capacity(binding_count);

            // first pass: create views now so the borrow of the info arrays
            // below stays undisturbed
            let mut views: Vec<Option<vk::ImageView>> = Vec::with_capacity(binding_count);
            for binding in &set.bindings {
                match binding.resource {
                    BoundResource::Image { id, .. }
                    | BoundResource::CombinedImageSampler { id, .. } => {
                        views.push(Some(self.image_view_2d(device, id)?));
                    }
                    _ => views.push(None),
                }
            }

            let resources = self.fg.resources();
            for (binding, view) in set.bindings.iter().zip(&views) {
                let mut write = vk::WriteDescriptorSet {
                    dst_set: vk_set,
                    dst_binding: binding.binding,
                    descriptor_count: 1,
                    descriptor_type: binding.descriptor_type,
                    ..Default::default()
                };
                match binding.resource {
                    BoundResource::Empty => continue,
                    BoundResource::Buffer { id, offset, range } => {
                        buffer_infos.push(vk::DescriptorBufferInfo {
                            buffer: resources.buffer_handle(id)?,
                            offset,
                            range: if range == 0 { vk::WHOLE_SIZE } else { range },
                        });
                        write.p_buffer_info = buffer_infos.last().unwrap();
                    }
                    BoundResource::Image { layout, .. } => {
                        image_infos.push(vk::DescriptorImageInfo {
                            sampler: vk::Sampler::null(),
                            image_view: view.unwrap(),
                            image_layout: if layout == vk::ImageLayout::UNDEFINED {
                                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
                            } else {
                                layout
                            },
                        });
                        write.p_image_info = image_infos.last().unwrap();
                    }
                    BoundResource::CombinedImageSampler {
                        layout, sampler, ..
                    } => {
                        image_infos.push(vk::DescriptorImageInfo {
                            sampler: resources.sampler_handle(sampler)?,
                            image_view: view.unwrap(),
                            image_layout: if layout == vk::ImageLayout::UNDEFINED {
                                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
                            } else {
                                layout
                            },
                        });
                        write.p_image_info = image_infos.last().unwrap();
                    }
                    BoundResource::Sampler(sampler) => {
                        image_infos.push(vk::DescriptorImageInfo {
                            sampler: resources.sampler_handle(sampler)?,
                            image_view: vk::ImageView::null(),
                            image_layout: vk::ImageLayout::UNDEFINED,
                        });
                        write.p_image_info = image_infos.last().unwrap();
                    }
                    BoundResource::RtScene(scene) => {
                        accel_handles.push(resources.rt_scene_accel_handle(scene)?);
                        accel_writes.push(vk::WriteDescriptorSetAccelerationStructureKHR {
                            acceleration_structure_count: 1,
                            p_acceleration_structures: accel_handles.last().unwrap(),
                            ..Default::default()
                        });
                        write.p_next = accel_writes.last().unwrap() as *const _ as *const _;
                    }
                }
                writes.push(write);
            }

            unsafe {
                device.update_descriptor_sets(&writes, &[]);
                device.cmd_bind_descriptor_sets(cb, bind_point, layout, set.set_index, &[vk_set], &[]);
            }
        }
        Ok(())
    }

    fn push_constants(
        &self,
        device: &ash::Device,
        cb: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        data: &PushConstantData,
    ) {
        if !data.data.is_empty() {
            unsafe {
                device.cmd_push_constants(cb, layout, data.stages, data.offset, &data.data);
            }
        }
    }

    // ------------------------------------------------------------------
    // render pass groups

    fn take_pass(&mut self, id: LogicalPassId) -> LogicalRenderPass {
        std::mem::replace(
            &mut self.passes[id.0],
            LogicalRenderPass {
                desc: Default::default(),
                draws: Vec::new(),
                submitted: true,
                samples: 1,
                extent: vk::Extent2D {
                    width: 1,
                    height: 1,
                },
            },
        )
    }

    pub(super) fn record_render_pass_group(
        &mut self,
        device: &ash::Device,
        cb: vk::CommandBuffer,
        first_task_index: usize,
        group_nodes: Vec<TaskNode>,
    ) -> Result<()> {
        let passes: Vec<LogicalRenderPass> = group_nodes
            .iter()
            .map(|node| match node.task {
                Task::SubmitRenderPass(id) => self.take_pass(id),
                _ => unreachable!("render pass group holds only SubmitRenderPass tasks"),
            })
            .collect();
        let leader = &passes[0];
        let last = &passes[passes.len() - 1];
        let samples = leader.samples;
        let color_count = leader.desc.color_attachments.len() as u32;
        let render_area = leader.render_area();

        // declare all accesses before the pass opens
        let mut sync = TaskSync::default();

        for (i, attachment) in leader.desc.color_attachments.iter().enumerate() {
            let final_layout = last.desc.color_attachments[i]
                .final_layout
                .unwrap_or(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
            let image = attachment.image;
            self.declare_image(
                &mut sync,
                first_task_index,
                image,
                None,
                AccessDesc {
                    stages: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                    access: vk::AccessFlags::COLOR_ATTACHMENT_READ
                        | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                    layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    final_layout,
                },
            )?;
        }
        if let Some(ds) = &leader.desc.depth_stencil {
            let layout = if ds.read_only {
                vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
            } else {
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
            };
            let final_layout = last
                .desc
                .depth_stencil
                .as_ref()
                .and_then(|d| d.final_layout)
                .unwrap_or(layout);
            let access = if ds.read_only {
                vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
            } else {
                vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
            };
            let image = ds.image;
            self.declare_image(
                &mut sync,
                first_task_index,
                image,
                None,
                AccessDesc {
                    stages: vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                        | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
                    access,
                    layout,
                    final_layout,
                },
            )?;
        }
        if let Some(sri) = leader.desc.shading_rate_image {
            self.declare_image(
                &mut sync,
                first_task_index,
                sri,
                None,
                AccessDesc::image(
                    vk::PipelineStageFlags::SHADING_RATE_IMAGE_NV,
                    vk::AccessFlags::SHADING_RATE_IMAGE_READ_NV,
                    vk::ImageLayout::SHADING_RATE_OPTIMAL_NV,
                ),
            )?;
        }
        for (k, pass) in passes.iter().enumerate() {
            for draw in &pass.draws {
                self.declare_draw_inputs(&mut sync, first_task_index + k, draw)?;
            }
        }
        emit_barriers(device, cb, &sync.barriers);
        if !sync.implicit_deps.is_empty() {
            trace!(deps = ?sync.implicit_deps, "render pass implicit dependencies");
        }

        // physical pass + framebuffer
        let resources = self.fg.resources();
        let pass_refs: Vec<&LogicalRenderPass> = passes.iter().collect();
        let (rp_desc, clear_values) = render_pass::build_physical_desc(resources, &pass_refs)?;
        let rp_id = resources.cache_render_pass(&rp_desc)?.take();
        self.adopt_ref(AnyResource::RenderPass(rp_id));
        let (rp_handle, compat_hash) = self.resources().render_pass_record_info(rp_id)?;

        let mut views = Vec::new();
        for attachment in &leader.desc.color_attachments {
            views.push(self.image_view_2d(device, attachment.image)?);
        }
        if let Some(ds) = &leader.desc.depth_stencil {
            views.push(self.image_view_2d(device, ds.image)?);
        }
        let framebuffer_info = vk::FramebufferCreateInfo {
            render_pass: rp_handle,
            attachment_count: views.len() as u32,
            p_attachments: views.as_ptr(),
            width: leader.extent.width,
            height: leader.extent.height,
            layers: 1,
            ..Default::default()
        };
        let framebuffer = unsafe {
            device
                .create_framebuffer(&framebuffer_info, None)
                .map_err(|e| Error::device("vkCreateFramebuffer", e))?
        };
        self.batch
            .inner
            .lock()
            .transient_framebuffers
            .push(framebuffer);

        let begin_info = vk::RenderPassBeginInfo {
            render_pass: rp_handle,
            framebuffer,
            render_area,
            clear_value_count: clear_values.len() as u32,
            p_clear_values: clear_values.as_ptr(),
            ..Default::default()
        };
        unsafe {
            device.cmd_begin_render_pass(cb, &begin_info, vk::SubpassContents::INLINE);
        }

        // dynamic viewport/scissor state, shared by the whole group
        let default_viewport = vk::Viewport {
            x: render_area.offset.x as f32,
            y: render_area.offset.y as f32,
            width: render_area.extent.width as f32,
            height: render_area.extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let viewports = if leader.desc.viewports.is_empty() {
            std::slice::from_ref(&default_viewport)
        } else {
            &leader.desc.viewports
        };
        let scissors = if leader.desc.scissors.is_empty() {
            std::slice::from_ref(&render_area)
        } else {
            &leader.desc.scissors
        };
        unsafe {
            device.cmd_set_viewport(cb, 0, viewports);
            device.cmd_set_scissor(cb, 0, scissors);
        }

        for (subpass, (pass, node)) in passes.into_iter().zip(&group_nodes).enumerate() {
            if subpass > 0 {
                unsafe { device.cmd_next_subpass(cb, vk::SubpassContents::INLINE) };
            }
            for draw in pass.draws {
                self.record_draw(
                    device,
                    cb,
                    &node.name,
                    draw,
                    rp_handle,
                    compat_hash,
                    subpass as u32,
                    samples,
                    color_count,
                )?;
            }
        }

        unsafe { device.cmd_end_render_pass(cb) };
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn record_draw(
        &mut self,
        device: &ash::Device,
        cb: vk::CommandBuffer,
        task_name: &str,
        draw: DrawTask,
        render_pass: vk::RenderPass,
        compat_hash: u64,
        subpass: u32,
        samples: u32,
        color_count: u32,
    ) -> Result<()> {
        if let DrawTask::Custom(custom) = draw {
            (custom.callback)(device, cb);
            return Ok(());
        }

        let pipeline_id = draw.pipeline().expect("non-custom draw carries a pipeline");
        let info = self.resources().pipeline_record_info(pipeline_id)?;
        let vk_pipeline = self.resources().resolve_graphics_pipeline(
            pipeline_id,
            render_pass,
            compat_hash,
            subpass,
            samples,
            color_count,
        )?;
        unsafe {
            device.cmd_bind_pipeline(cb, vk::PipelineBindPoint::GRAPHICS, vk_pipeline);
        }

        let common = draw.common().expect("non-custom draw has common state");
        self.bind_descriptor_sets(
            device,
            cb,
            vk::PipelineBindPoint::GRAPHICS,
            info.layout_handle,
            &common.resources,
        )?;
        for vb in &common.vertex_buffers {
            let slot = info
                .vertex_buffer_names
                .iter()
                .position(|n| *n == vb.name)
                .ok_or_else(|| Error::Configuration {
                    name: vb.name.as_str().to_string(),
                    reason: format!(
                        "pipeline `{}` declares no vertex buffer with this name",
                        info.name
                    ),
                })? as u32;
            let handle = self.resources().buffer_handle(vb.buffer)?;
            unsafe {
                device.cmd_bind_vertex_buffers(cb, slot, &[handle], &[vb.offset]);
            }
        }
        self.push_constants(device, cb, info.layout_handle, &common.push_constants);

        if self.debug_trace {
            let stages = match &draw {
                DrawTask::DrawMeshes(_) => {
                    vk::ShaderStageFlags::MESH_NV | vk::ShaderStageFlags::FRAGMENT
                }
                _ => vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
            };
            self.batch.inner.lock().debug_records.push(ShaderDebugRecord {
                task_name: task_name.to_string(),
                shader_name: info.name.clone(),
                stages,
                outputs: Vec::new(),
            });
        }

        unsafe {
            match draw {
                DrawTask::Draw(d) => {
                    device.cmd_draw(
                        cb,
                        d.vertex_count,
                        d.instance_count.max(1),
                        d.first_vertex,
                        d.first_instance,
                    );
                }
                DrawTask::DrawIndexed(d) => {
                    let index_buffer = self.resources().buffer_handle(d.index_buffer)?;
                    device.cmd_bind_index_buffer(cb, index_buffer, d.index_offset, d.index_type);
                    device.cmd_draw_indexed(
                        cb,
                        d.index_count,
                        d.instance_count.max(1),
                        d.first_index,
                        d.vertex_offset,
                        d.first_instance,
                    );
                }
                DrawTask::DrawIndirect(d) => {
                    let buffer = self.resources().buffer_handle(d.indirect_buffer)?;
                    match d.count_buffer {
                        Some((count, count_offset)) => {
                            let count_handle = self.resources().buffer_handle(count)?;
                            device.cmd_draw_indirect_count(
                                cb,
                                buffer,
                                d.indirect_offset,
                                count_handle,
                                count_offset,
                                d.max_draw_count,
                                d.stride,
                            );
                        }
                        None => {
                            device.cmd_draw_indirect(
                                cb,
                                buffer,
                                d.indirect_offset,
                                d.draw_count,
                                d.stride,
                            );
                        }
                    }
                }
                DrawTask::DrawIndexedIndirect(d) => {
                    let index_buffer = self.resources().buffer_handle(d.index_buffer)?;
                    device.cmd_bind_index_buffer(cb, index_buffer, d.index_offset, d.index_type);
                    let buffer = self.resources().buffer_handle(d.indirect.indirect_buffer)?;
                    match d.indirect.count_buffer {
                        Some((count, count_offset)) => {
                            let count_handle = self.resources().buffer_handle(count)?;
                            device.cmd_draw_indexed_indirect_count(
                                cb,
                                buffer,
                                d.indirect.indirect_offset,
                                count_handle,
                                count_offset,
                                d.indirect.max_draw_count,
                                d.indirect.stride,
                            );
                        }
                        None => {
                            device.cmd_draw_indexed_indirect(
                                cb,
                                buffer,
                                d.indirect.indirect_offset,
                                d.indirect.draw_count,
                                d.indirect.stride,
                            );
                        }
                    }
                }
                DrawTask::DrawMeshes(d) => {
                    let mesh = self
                        .fg
                        .device()
                        .vk_nv_mesh_shader
                        .as_ref()
                        .expect("mesh draws were validated against mesh shading support");
                    match (d.indirect, d.count_buffer) {
                        (None, _) => mesh.cmd_draw_mesh_tasks(cb, d.task_count, d.first_task),
                        (Some((buffer, offset, draw_count, stride)), None) => {
                            let handle = self.resources().buffer_handle(buffer)?;
                            mesh.cmd_draw_mesh_tasks_indirect(cb, handle, offset, draw_count, stride);
                        }
                        (Some((buffer, offset, draw_count, stride)), Some((count, count_offset))) => {
                            let handle = self.resources().buffer_handle(buffer)?;
                            let count_handle = self.resources().buffer_handle(count)?;
                            mesh.cmd_draw_mesh_tasks_indirect_count(
                                cb,
                                handle,
                                offset,
                                count_handle,
                                count_offset,
                                draw_count.max(1),
                                stride,
                            );
                        }
                    }
                }
                DrawTask::Custom(_) => unreachable!(),
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // standalone tasks

    pub(super) fn record_task(
        &mut self,
        device: &ash::Device,
        cb: vk::CommandBuffer,
        task_index: usize,
        node: TaskNode,
    ) -> Result<()> {
        let mut sync = TaskSync::default();
        let resources = self.fg.resources();
        let name = node.name;

        match node.task {
            Task::SubmitRenderPass(_) => unreachable!("handled by record_render_pass_group"),

            Task::Dispatch(d) => {
                self.declare_bound_resources(&mut sync, task_index, &d.resources)?;
                if let Some((buffer, _)) = d.indirect {
                    self.declare_buffer(
                        &mut sync,
                        task_index,
                        buffer,
                        vk::PipelineStageFlags::DRAW_INDIRECT,
                        vk::AccessFlags::INDIRECT_COMMAND_READ,
                    )?;
                }
                emit_barriers(device, cb, &sync.barriers);

                let info = self.resources().pipeline_record_info(d.pipeline)?;
                let pipeline = self.resources().resolve_prebuilt_pipeline(d.pipeline)?;
                unsafe {
                    device.cmd_bind_pipeline(cb, vk::PipelineBindPoint::COMPUTE, pipeline);
                }
                self.bind_descriptor_sets(
                    device,
                    cb,
                    vk::PipelineBindPoint::COMPUTE,
                    info.layout_handle,
                    &d.resources,
                )?;
                self.push_constants(device, cb, info.layout_handle, &d.push_constants);
                if self.debug_trace {
                    self.batch.inner.lock().debug_records.push(ShaderDebugRecord {
                        task_name: name.clone(),
                        shader_name: info.name.clone(),
                        stages: vk::ShaderStageFlags::COMPUTE,
                        outputs: Vec::new(),
                    });
                }
                unsafe {
                    match d.indirect {
                        Some((buffer, offset)) => {
                            let handle = self.resources().buffer_handle(buffer)?;
                            device.cmd_dispatch_indirect(cb, handle, offset);
                        }
                        None => device.cmd_dispatch(
                            cb,
                            d.group_count[0],
                            d.group_count[1],
                            d.group_count[2],
                        ),
                    }
                }
            }

            Task::CopyBuffer { src, dst, regions } => {
                self.declare_buffer(
                    &mut sync,
                    task_index,
                    src,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::AccessFlags::TRANSFER_READ,
                )?;
                self.declare_buffer(
                    &mut sync,
                    task_index,
                    dst,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::AccessFlags::TRANSFER_WRITE,
                )?;
                emit_barriers(device, cb, &sync.barriers);
                let vk_regions: Vec<vk::BufferCopy> = regions
                    .iter()
                    .map(|r| vk::BufferCopy {
                        src_offset: r.src_offset,
                        dst_offset: r.dst_offset,
                        size: r.size,
                    })
                    .collect();
                let src_handle = resources.buffer_handle(src)?;
                let dst_handle = resources.buffer_handle(dst)?;
                unsafe { device.cmd_copy_buffer(cb, src_handle, dst_handle, &vk_regions) };
            }

            Task::CopyImage { src, dst, regions } => {
                let src_aspect = resources.image_aspect(src)?;
                let dst_aspect = resources.image_aspect(dst)?;
                for r in &regions {
                    self.declare_image(
                        &mut sync,
                        task_index,
                        src,
                        Some(r.src_subresource.sub_range()),
                        TRANSFER_READ,
                    )?;
                    self.declare_image(
                        &mut sync,
                        task_index,
                        dst,
                        Some(r.dst_subresource.sub_range()),
                        TRANSFER_WRITE,
                    )?;
                }
                emit_barriers(device, cb, &sync.barriers);
                let vk_regions: Vec<vk::ImageCopy> = regions
                    .iter()
                    .map(|r| vk::ImageCopy {
                        src_subresource: r.src_subresource.to_vk(src_aspect),
                        src_offset: offset3(r.src_offset),
                        dst_subresource: r.dst_subresource.to_vk(dst_aspect),
                        dst_offset: offset3(r.dst_offset),
                        extent: extent3(r.extent),
                    })
                    .collect();
                let src_handle = resources.image_handle(src)?;
                let dst_handle = resources.image_handle(dst)?;
                unsafe {
                    device.cmd_copy_image(
                        cb,
                        src_handle,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        dst_handle,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &vk_regions,
                    );
                }
            }

            Task::CopyBufferToImage { src, dst, regions } => {
                let dst_aspect = resources.image_aspect(dst)?;
                self.declare_buffer(
                    &mut sync,
                    task_index,
                    src,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::AccessFlags::TRANSFER_READ,
                )?;
                for r in &regions {
                    self.declare_image(
                        &mut sync,
                        task_index,
                        dst,
                        Some(r.image_subresource.sub_range()),
                        TRANSFER_WRITE,
                    )?;
                }
                emit_barriers(device, cb, &sync.barriers);
                let vk_regions: Vec<vk::BufferImageCopy> = regions
                    .iter()
                    .map(|r| buffer_image_copy(r, dst_aspect))
                    .collect();
                let src_handle = resources.buffer_handle(src)?;
                let dst_handle = resources.image_handle(dst)?;
                unsafe {
                    device.cmd_copy_buffer_to_image(
                        cb,
                        src_handle,
                        dst_handle,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &vk_regions,
                    );
                }
            }

            Task::CopyImageToBuffer { src, dst, regions } => {
                let src_aspect = resources.image_aspect(src)?;
                for r in &regions {
                    self.declare_image(
                        &mut sync,
                        task_index,
                        src,
                        Some(r.image_subresource.sub_range()),
                        TRANSFER_READ,
                    )?;
                }
                self.declare_buffer(
                    &mut sync,
                    task_index,
                    dst,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::AccessFlags::TRANSFER_WRITE,
                )?;
                emit_barriers(device, cb, &sync.barriers);
                let vk_regions: Vec<vk::BufferImageCopy> = regions
                    .iter()
                    .map(|r| buffer_image_copy(r, src_aspect))
                    .collect();
                let src_handle = resources.image_handle(src)?;
                let dst_handle = resources.buffer_handle(dst)?;
                unsafe {
                    device.cmd_copy_image_to_buffer(
                        cb,
                        src_handle,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        dst_handle,
                        &vk_regions,
                    );
                }
            }

            Task::BlitImage {
                src,
                dst,
                filter,
                regions,
            } => {
                let src_aspect = resources.image_aspect(src)?;
                let dst_aspect = resources.image_aspect(dst)?;
                for r in &regions {
                    self.declare_image(
                        &mut sync,
                        task_index,
                        src,
                        Some(r.src_subresource.sub_range()),
                        TRANSFER_READ,
                    )?;
                    self.declare_image(
                        &mut sync,
                        task_index,
                        dst,
                        Some(r.dst_subresource.sub_range()),
                        TRANSFER_WRITE,
                    )?;
                }
                emit_barriers(device, cb, &sync.barriers);
                let vk_regions: Vec<vk::ImageBlit> = regions
                    .iter()
                    .map(|r| vk::ImageBlit {
                        src_subresource: r.src_subresource.to_vk(src_aspect),
                        src_offsets: [offset3(r.src_offsets[0]), offset3(r.src_offsets[1])],
                        dst_subresource: r.dst_subresource.to_vk(dst_aspect),
                        dst_offsets: [offset3(r.dst_offsets[0]), offset3(r.dst_offsets[1])],
                    })
                    .collect();
                let src_handle = resources.image_handle(src)?;
                let dst_handle = resources.image_handle(dst)?;
                unsafe {
                    device.cmd_blit_image(
                        cb,
                        src_handle,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        dst_handle,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &vk_regions,
                        filter,
                    );
                }
            }

            Task::GenerateMipmaps { image } => {
                let desc = resources.describe_image(image)?;
                let aspect = resources.image_aspect(image)?;
                let handle = resources.image_handle(image)?;
                for level in 1..desc.mip_levels {
                    let mut level_sync = TaskSync::default();
                    self.declare_image(
                        &mut level_sync,
                        task_index,
                        image,
                        Some(SubRange {
                            base_mip: level - 1,
                            mip_count: 1,
                            base_layer: 0,
                            layer_count: desc.array_layers,
                        }),
                        TRANSFER_READ,
                    )?;
                    self.declare_image(
                        &mut level_sync,
                        task_index,
                        image,
                        Some(SubRange {
                            base_mip: level,
                            mip_count: 1,
                            base_layer: 0,
                            layer_count: desc.array_layers,
                        }),
                        TRANSFER_WRITE,
                    )?;
                    emit_barriers(device, cb, &level_sync.barriers);

                    let blit = vk::ImageBlit {
                        src_subresource: vk::ImageSubresourceLayers {
                            aspect_mask: aspect,
                            mip_level: level - 1,
                            base_array_layer: 0,
                            layer_count: desc.array_layers,
                        },
                        src_offsets: [
                            vk::Offset3D { x: 0, y: 0, z: 0 },
                            vk::Offset3D {
                                x: mip_extent(desc.width, level - 1) as i32,
                                y: mip_extent(desc.height, level - 1) as i32,
                                z: mip_extent(desc.depth, level - 1) as i32,
                            },
                        ],
                        dst_subresource: vk::ImageSubresourceLayers {
                            aspect_mask: aspect,
                            mip_level: level,
                            base_array_layer: 0,
                            layer_count: desc.array_layers,
                        },
                        dst_offsets: [
                            vk::Offset3D { x: 0, y: 0, z: 0 },
                            vk::Offset3D {
                                x: mip_extent(desc.width, level) as i32,
                                y: mip_extent(desc.height, level) as i32,
                                z: mip_extent(desc.depth, level) as i32,
                            },
                        ],
                    };
                    unsafe {
                        device.cmd_blit_image(
                            cb,
                            handle,
                            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                            handle,
                            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                            &[blit],
                            vk::Filter::LINEAR,
                        );
                    }
                }
            }

            Task::ResolveImage { src, dst, regions } => {
                let src_aspect = resources.image_aspect(src)?;
                let dst_aspect = resources.image_aspect(dst)?;
                for r in &regions {
                    self.declare_image(
                        &mut sync,
                        task_index,
                        src,
                        Some(r.src_subresource.sub_range()),
                        TRANSFER_READ,
                    )?;
                    self.declare_image(
                        &mut sync,
                        task_index,
                        dst,
                        Some(r.dst_subresource.sub_range()),
                        TRANSFER_WRITE,
                    )?;
                }
                emit_barriers(device, cb, &sync.barriers);
                let vk_regions: Vec<vk::ImageResolve> = regions
                    .iter()
                    .map(|r| vk::ImageResolve {
                        src_subresource: r.src_subresource.to_vk(src_aspect),
                        src_offset: offset3(r.src_offset),
                        dst_subresource: r.dst_subresource.to_vk(dst_aspect),
                        dst_offset: offset3(r.dst_offset),
                        extent: extent3(r.extent),
                    })
                    .collect();
                let src_handle = resources.image_handle(src)?;
                let dst_handle = resources.image_handle(dst)?;
                unsafe {
                    device.cmd_resolve_image(
                        cb,
                        src_handle,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        dst_handle,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &vk_regions,
                    );
                }
            }

            Task::FillBuffer {
                dst,
                offset,
                size,
                data,
            } => {
                self.declare_buffer(
                    &mut sync,
                    task_index,
                    dst,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::AccessFlags::TRANSFER_WRITE,
                )?;
                emit_barriers(device, cb, &sync.barriers);
                let handle = resources.buffer_handle(dst)?;
                unsafe { device.cmd_fill_buffer(cb, handle, offset, size, data) };
            }

            Task::ClearColorImage {
                image,
                color,
                ranges,
            } => {
                let aspect = resources.image_aspect(image)?;
                let desc = resources.describe_image(image)?;
                let ranges = if ranges.is_empty() {
                    vec![SubRange::whole(desc.mip_levels, desc.array_layers)]
                } else {
                    ranges
                };
                for range in &ranges {
                    self.declare_image(&mut sync, task_index, image, Some(*range), TRANSFER_WRITE)?;
                }
                emit_barriers(device, cb, &sync.barriers);
                let vk_ranges: Vec<vk::ImageSubresourceRange> = ranges
                    .iter()
                    .map(|r| vk::ImageSubresourceRange {
                        aspect_mask: aspect,
                        base_mip_level: r.base_mip,
                        level_count: r.mip_count,
                        base_array_layer: r.base_layer,
                        layer_count: r.layer_count,
                    })
                    .collect();
                let handle = resources.image_handle(image)?;
                unsafe {
                    device.cmd_clear_color_image(
                        cb,
                        handle,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &vk::ClearColorValue { float32: color },
                        &vk_ranges,
                    );
                }
            }

            Task::ClearDepthStencilImage {
                image,
                depth,
                stencil,
                ranges,
            } => {
                let aspect = resources.image_aspect(image)?;
                let desc = resources.describe_image(image)?;
                let ranges = if ranges.is_empty() {
                    vec![SubRange::whole(desc.mip_levels, desc.array_layers)]
                } else {
                    ranges
                };
                for range in &ranges {
                    self.declare_image(&mut sync, task_index, image, Some(*range), TRANSFER_WRITE)?;
                }
                emit_barriers(device, cb, &sync.barriers);
                let vk_ranges: Vec<vk::ImageSubresourceRange> = ranges
                    .iter()
                    .map(|r| vk::ImageSubresourceRange {
                        aspect_mask: aspect,
                        base_mip_level: r.base_mip,
                        level_count: r.mip_count,
                        base_array_layer: r.base_layer,
                        layer_count: r.layer_count,
                    })
                    .collect();
                let handle = resources.image_handle(image)?;
                unsafe {
                    device.cmd_clear_depth_stencil_image(
                        cb,
                        handle,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &vk::ClearDepthStencilValue { depth, stencil },
                        &vk_ranges,
                    );
                }
            }

            Task::UpdateBuffer {
                dst,
                dst_offset,
                data,
            } => {
                self.declare_buffer(
                    &mut sync,
                    task_index,
                    dst,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::AccessFlags::TRANSFER_WRITE,
                )?;
                emit_barriers(device, cb, &sync.barriers);
                self.record_staged_buffer_upload(device, cb, dst, dst_offset, &data)?;
            }

            Task::UpdateRtShaderTable {
                dst,
                dst_offset,
                data,
            } => {
                self.declare_buffer(
                    &mut sync,
                    task_index,
                    dst,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::AccessFlags::TRANSFER_WRITE,
                )?;
                emit_barriers(device, cb, &sync.barriers);
                self.record_staged_buffer_upload(device, cb, dst, dst_offset, &data)?;
            }

            Task::UpdateImage {
                dst,
                subresource,
                data,
                row_pitch,
            } => {
                self.declare_image(
                    &mut sync,
                    task_index,
                    dst,
                    Some(subresource.sub_range()),
                    TRANSFER_WRITE,
                )?;
                emit_barriers(device, cb, &sync.barriers);

                let aspect = resources.image_aspect(dst)?;
                let desc = resources.describe_image(dst)?;
                let width = mip_extent(desc.width, subresource.mip_level);
                let dst_handle = resources.image_handle(dst)?;
                let total = data.len() as u64;
                let min_block = staging::image_min_block_size(total, row_pitch);
                let mut consumed = 0u64;
                while consumed < total {
                    let part = self
                        .fg
                        .staging_store(&data, consumed, min_block, row_pitch)?;
                    let row_start = (consumed / row_pitch) as u32;
                    let rows = (part.size / row_pitch) as u32;
                    let region = vk::BufferImageCopy {
                        buffer_offset: part.offset,
                        buffer_row_length: 0,
                        buffer_image_height: 0,
                        image_subresource: subresource.to_vk(aspect),
                        image_offset: vk::Offset3D {
                            x: 0,
                            y: row_start as i32,
                            z: 0,
                        },
                        image_extent: vk::Extent3D {
                            width,
                            height: rows,
                            depth: 1,
                        },
                    };
                    unsafe {
                        device.cmd_copy_buffer_to_image(
                            cb,
                            part.handle,
                            dst_handle,
                            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                            &[region],
                        );
                    }
                    consumed += part.size;
                }
            }

            Task::ReadBuffer(r) => {
                self.declare_buffer(
                    &mut sync,
                    task_index,
                    r.src,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::AccessFlags::TRANSFER_READ,
                )?;
                emit_barriers(device, cb, &sync.barriers);

                let src_handle = resources.buffer_handle(r.src)?;
                let min_block = staging::buffer_min_block_size(r.size);
                let mut parts: Vec<(StagingPart, *mut u8)> = Vec::new();
                let mut consumed = 0u64;
                while consumed < r.size {
                    let (part, mapped) =
                        self.fg.staging_add_pending(r.size - consumed, min_block, 1)?;
                    unsafe {
                        device.cmd_copy_buffer(
                            cb,
                            src_handle,
                            part.handle,
                            &[vk::BufferCopy {
                                src_offset: r.offset + consumed,
                                dst_offset: part.offset,
                                size: part.size,
                            }],
                        );
                    }
                    consumed += part.size;
                    parts.push((part, mapped));
                }
                self.fg.staging_add_event(&parts, None, r.callback);
            }

            Task::ReadImage(r) => {
                let desc = resources.describe_image(r.src)?;
                let aspect = resources.image_aspect(r.src)?;
                let texel = crate::format_texel_size(desc.format).expect("validated at declaration");
                let width = mip_extent(desc.width, r.mip_level);
                let height = mip_extent(desc.height, r.mip_level);
                let row_pitch = width as u64 * texel;
                let total = row_pitch * height as u64;

                self.declare_image(
                    &mut sync,
                    task_index,
                    r.src,
                    Some(SubRange {
                        base_mip: r.mip_level,
                        mip_count: 1,
                        base_layer: r.array_layer,
                        layer_count: 1,
                    }),
                    TRANSFER_READ,
                )?;
                emit_barriers(device, cb, &sync.barriers);

                let src_handle = resources.image_handle(r.src)?;
                let min_block = staging::image_min_block_size(total, row_pitch);
                let subresource = SubresourceLayers {
                    mip_level: r.mip_level,
                    base_array_layer: r.array_layer,
                    layer_count: 1,
                };
                let mut parts: Vec<(StagingPart, *mut u8)> = Vec::new();
                let mut consumed = 0u64;
                while consumed < total {
                    let (part, mapped) =
                        self.fg
                            .staging_add_pending(total - consumed, min_block, row_pitch)?;
                    let row_start = (consumed / row_pitch) as u32;
                    let rows = (part.size / row_pitch) as u32;
                    let region = vk::BufferImageCopy {
                        buffer_offset: part.offset,
                        buffer_row_length: 0,
                        buffer_image_height: 0,
                        image_subresource: subresource.to_vk(aspect),
                        image_offset: vk::Offset3D {
                            x: 0,
                            y: row_start as i32,
                            z: 0,
                        },
                        image_extent: vk::Extent3D {
                            width,
                            height: rows,
                            depth: 1,
                        },
                    };
                    unsafe {
                        device.cmd_copy_image_to_buffer(
                            cb,
                            src_handle,
                            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                            part.handle,
                            &[region],
                        );
                    }
                    consumed += part.size;
                    parts.push((part, mapped));
                }
                self.fg.staging_add_event(
                    &parts,
                    Some(ImageReadbackMeta {
                        width,
                        height,
                        depth: 1,
                        row_pitch,
                        slice_pitch: total,
                        format: desc.format,
                        aspect,
                    }),
                    r.callback,
                );
            }

            Task::Present { swapchain, src } => {
                let info = resources.swapchain_record_info(swapchain)?;
                let src_desc = resources.describe_image(src)?;

                self.declare_image(&mut sync, task_index, src, None, TRANSFER_READ)?;
                self.declare_image(&mut sync, task_index, info.image, None, TRANSFER_WRITE)?;
                emit_barriers(device, cb, &sync.barriers);

                let blit = vk::ImageBlit {
                    src_subresource: SubresourceLayers::base()
                        .to_vk(vk::ImageAspectFlags::COLOR),
                    src_offsets: [
                        vk::Offset3D { x: 0, y: 0, z: 0 },
                        vk::Offset3D {
                            x: src_desc.width as i32,
                            y: src_desc.height as i32,
                            z: 1,
                        },
                    ],
                    dst_subresource: SubresourceLayers::base()
                        .to_vk(vk::ImageAspectFlags::COLOR),
                    dst_offsets: [
                        vk::Offset3D { x: 0, y: 0, z: 0 },
                        vk::Offset3D {
                            x: info.extent.width as i32,
                            y: info.extent.height as i32,
                            z: 1,
                        },
                    ],
                };
                let src_handle = resources.image_handle(src)?;
                let dst_handle = resources.image_handle(info.image)?;
                unsafe {
                    device.cmd_blit_image(
                        cb,
                        src_handle,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        dst_handle,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[blit],
                        vk::Filter::LINEAR,
                    );
                }

                // leave the image presentable
                let mut present_sync = TaskSync::default();
                self.declare_image(
                    &mut present_sync,
                    task_index,
                    info.image,
                    None,
                    AccessDesc::image(
                        vk::PipelineStageFlags::ALL_COMMANDS,
                        vk::AccessFlags::MEMORY_READ,
                        vk::ImageLayout::PRESENT_SRC_KHR,
                    ),
                )?;
                emit_barriers(device, cb, &present_sync.barriers);

                if info.acquire_semaphore.is_some() {
                    resources.take_swapchain_acquire(swapchain);
                }
                let mut inner = self.batch.inner.lock();
                if let Some(acquire) = info.acquire_semaphore {
                    inner
                        .wait_semaphores
                        .push((acquire, vk::PipelineStageFlags::TRANSFER));
                }
                inner.signal_semaphores.push(info.present_semaphore);
            }

            Task::BuildRtGeometry(b) => {
                let accel_ext = self
                    .fg
                    .device()
                    .vk_khr_accel
                    .as_ref()
                    .ok_or_else(|| Error::Configuration {
                        name: name.clone(),
                        reason: "device was initialized without ray tracing support".to_string(),
                    })?;

                let build_stage = vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR;
                self.declare_buffer(
                    &mut sync,
                    task_index,
                    b.vertex_buffer,
                    build_stage,
                    vk::AccessFlags::SHADER_READ,
                )?;
                if let Some((index_buffer, _, _)) = b.index_buffer {
                    self.declare_buffer(
                        &mut sync,
                        task_index,
                        index_buffer,
                        build_stage,
                        vk::AccessFlags::SHADER_READ,
                    )?;
                }
                self.declare_buffer(
                    &mut sync,
                    task_index,
                    b.scratch_buffer,
                    build_stage,
                    vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR,
                )?;
                self.tracker.declare_rt_access(
                    self.fg.resources(),
                    task_index,
                    TrackedResource::RtGeometry(b.geometry),
                    build_stage,
                    vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR,
                    &mut sync,
                )?;
                emit_barriers(device, cb, &sync.barriers);

                let vertex_address = self.buffer_device_address(b.vertex_buffer)?;
                let (index_type, index_data) = match b.index_buffer {
                    Some((buffer, offset, ty)) => (
                        ty,
                        vk::DeviceOrHostAddressConstKHR {
                            device_address: self.buffer_device_address(buffer)? + offset,
                        },
                    ),
                    None => (
                        vk::IndexType::NONE_KHR,
                        vk::DeviceOrHostAddressConstKHR { device_address: 0 },
                    ),
                };
                let geometry = vk::AccelerationStructureGeometryKHR {
                    geometry_type: vk::GeometryTypeKHR::TRIANGLES,
                    geometry: vk::AccelerationStructureGeometryDataKHR {
                        triangles: vk::AccelerationStructureGeometryTrianglesDataKHR {
                            vertex_format: b.vertex_format,
                            vertex_data: vk::DeviceOrHostAddressConstKHR {
                                device_address: vertex_address,
                            },
                            vertex_stride: b.vertex_stride,
                            max_vertex: b.vertex_count.saturating_sub(1),
                            index_type,
                            index_data,
                            ..Default::default()
                        },
                    },
                    flags: vk::GeometryFlagsKHR::OPAQUE,
                    ..Default::default()
                };
                let build_info = vk::AccelerationStructureBuildGeometryInfoKHR {
                    ty: vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
                    mode: vk::BuildAccelerationStructureModeKHR::BUILD,
                    dst_acceleration_structure: resources.rt_geometry_accel_handle(b.geometry)?,
                    geometry_count: 1,
                    p_geometries: &geometry,
                    scratch_data: vk::DeviceOrHostAddressKHR {
                        device_address: self.buffer_device_address(b.scratch_buffer)?,
                    },
                    ..Default::default()
                };
                let range = vk::AccelerationStructureBuildRangeInfoKHR {
                    primitive_count: b.primitive_count,
                    ..Default::default()
                };
                unsafe {
                    accel_ext.cmd_build_acceleration_structures(cb, &[build_info], &[&[range]]);
                }
            }

            Task::BuildRtScene(b) => {
                let accel_ext = self
                    .fg
                    .device()
                    .vk_khr_accel
                    .as_ref()
                    .ok_or_else(|| Error::Configuration {
                        name: name.clone(),
                        reason: "device was initialized without ray tracing support".to_string(),
                    })?;

                let build_stage = vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR;
                self.declare_buffer(
                    &mut sync,
                    task_index,
                    b.instance_buffer,
                    build_stage,
                    vk::AccessFlags::SHADER_READ,
                )?;
                self.declare_buffer(
                    &mut sync,
                    task_index,
                    b.scratch_buffer,
                    build_stage,
                    vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR,
                )?;
                for &geometry in &b.geometries {
                    self.tracker.declare_rt_access(
                        self.fg.resources(),
                        task_index,
                        TrackedResource::RtGeometry(geometry),
                        build_stage,
                        vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR,
                        &mut sync,
                    )?;
                }
                self.tracker.declare_rt_access(
                    self.fg.resources(),
                    task_index,
                    TrackedResource::RtScene(b.scene),
                    build_stage,
                    vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR,
                    &mut sync,
                )?;
                emit_barriers(device, cb, &sync.barriers);

                let geometry = vk::AccelerationStructureGeometryKHR {
                    geometry_type: vk::GeometryTypeKHR::INSTANCES,
                    geometry: vk::AccelerationStructureGeometryDataKHR {
                        instances: vk::AccelerationStructureGeometryInstancesDataKHR {
                            array_of_pointers: vk::FALSE,
                            data: vk::DeviceOrHostAddressConstKHR {
                                device_address: self.buffer_device_address(b.instance_buffer)?,
                            },
                            ..Default::default()
                        },
                    },
                    ..Default::default()
                };
                let build_info = vk::AccelerationStructureBuildGeometryInfoKHR {
                    ty: vk::AccelerationStructureTypeKHR::TOP_LEVEL,
                    mode: vk::BuildAccelerationStructureModeKHR::BUILD,
                    dst_acceleration_structure: resources.rt_scene_accel_handle(b.scene)?,
                    geometry_count: 1,
                    p_geometries: &geometry,
                    scratch_data: vk::DeviceOrHostAddressKHR {
                        device_address: self.buffer_device_address(b.scratch_buffer)?,
                    },
                    ..Default::default()
                };
                let range = vk::AccelerationStructureBuildRangeInfoKHR {
                    primitive_count: b.instance_count,
                    ..Default::default()
                };
                unsafe {
                    accel_ext.cmd_build_acceleration_structures(cb, &[build_info], &[&[range]]);
                }
            }

            Task::TraceRays(t) => {
                let rt_ext = self
                    .fg
                    .device()
                    .vk_khr_rt_pipeline
                    .as_ref()
                    .ok_or_else(|| Error::Configuration {
                        name: name.clone(),
                        reason: "device was initialized without ray tracing support".to_string(),
                    })?;

                let rt_stage = vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR;
                self.tracker.declare_rt_access(
                    self.fg.resources(),
                    task_index,
                    TrackedResource::RtScene(t.scene),
                    rt_stage,
                    vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR,
                    &mut sync,
                )?;
                for region in [Some(&t.raygen), Some(&t.miss), Some(&t.hit), t.callable.as_ref()]
                    .into_iter()
                    .flatten()
                {
                    self.declare_buffer(
                        &mut sync,
                        task_index,
                        region.buffer,
                        rt_stage,
                        vk::AccessFlags::SHADER_READ,
                    )?;
                }
                self.declare_bound_resources(&mut sync, task_index, &t.resources)?;
                emit_barriers(device, cb, &sync.barriers);

                let info = self.resources().pipeline_record_info(t.pipeline)?;
                let pipeline = self.resources().resolve_prebuilt_pipeline(t.pipeline)?;
                unsafe {
                    device.cmd_bind_pipeline(cb, vk::PipelineBindPoint::RAY_TRACING_KHR, pipeline);
                }
                self.bind_descriptor_sets(
                    device,
                    cb,
                    vk::PipelineBindPoint::RAY_TRACING_KHR,
                    info.layout_handle,
                    &t.resources,
                )?;
                self.push_constants(device, cb, info.layout_handle, &t.push_constants);
                if self.debug_trace {
                    self.batch.inner.lock().debug_records.push(ShaderDebugRecord {
                        task_name: name.clone(),
                        shader_name: info.name.clone(),
                        stages: vk::ShaderStageFlags::RAYGEN_KHR,
                        outputs: Vec::new(),
                    });
                }

                let region = |r: &RtTableRegion| -> Result<vk::StridedDeviceAddressRegionKHR> {
                    Ok(vk::StridedDeviceAddressRegionKHR {
                        device_address: self.buffer_device_address(r.buffer)? + r.offset,
                        stride: r.stride,
                        size: r.size,
                    })
                };
                let raygen = region(&t.raygen)?;
                let miss = region(&t.miss)?;
                let hit = region(&t.hit)?;
                let callable = match &t.callable {
                    Some(c) => region(c)?,
                    None => vk::StridedDeviceAddressRegionKHR::default(),
                };
                unsafe {
                    rt_ext.cmd_trace_rays(
                        cb,
                        &raygen,
                        &miss,
                        &hit,
                        &callable,
                        t.dimensions[0],
                        t.dimensions[1],
                        t.dimensions[2].max(1),
                    );
                }
            }

            Task::Custom(custom) => {
                self.declare_custom_accesses(&mut sync, task_index, &custom.accesses)?;
                emit_barriers(device, cb, &sync.barriers);
                (custom.callback)(device, cb);
            }
        }

        if !sync.implicit_deps.is_empty() {
            trace!(task = task_index, deps = ?sync.implicit_deps, "implicit dependencies");
        }
        Ok(())
    }

    fn record_staged_buffer_upload(
        &mut self,
        device: &ash::Device,
        cb: vk::CommandBuffer,
        dst: BufferId,
        dst_offset: u64,
        data: &[u8],
    ) -> Result<()> {
        let dst_handle = self.resources().buffer_handle(dst)?;
        let total = data.len() as u64;
        let min_block = staging::buffer_min_block_size(total);
        let mut consumed = 0u64;
        while consumed < total {
            let part = self.fg.staging_store(data, consumed, min_block, 1)?;
            unsafe {
                device.cmd_copy_buffer(
                    cb,
                    part.handle,
                    dst_handle,
                    &[vk::BufferCopy {
                        src_offset: part.offset,
                        dst_offset: dst_offset + consumed,
                        size: part.size,
                    }],
                );
            }
            consumed += part.size;
        }
        Ok(())
    }
}

fn offset3(v: [i32; 3]) -> vk::Offset3D {
    vk::Offset3D {
        x: v[0],
        y: v[1],
        z: v[2],
    }
}

fn extent3(v: [u32; 3]) -> vk::Extent3D {
    vk::Extent3D {
        width: v[0],
        height: v[1],
        depth: v[2],
    }
}

fn buffer_image_copy(r: &BufferImageCopyRegion, aspect: vk::ImageAspectFlags) -> vk::BufferImageCopy {
    vk::BufferImageCopy {
        buffer_offset: r.buffer_offset,
        buffer_row_length: r.buffer_row_length,
        buffer_image_height: r.buffer_image_height,
        image_subresource: r.image_subresource.to_vk(aspect),
        image_offset: offset3(r.image_offset),
        image_extent: extent3(r.image_extent),
    }
}
