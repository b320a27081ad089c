//! Local resource tracker.
//!
//! Each command recorder owns one tracker. For every resource a task touches
//! the tracker keeps a *shadow* of the last access (stages, access mask,
//! image layout, queue family) and decides, per declared access, whether a
//! pipeline barrier is needed:
//!
//! - two reads in the same layout and queue family merge without a barrier,
//!   OR-ing into the running read scope;
//! - a layout change, a queue-family change, or a write on either side emits
//!   a barrier whose source scope is the previous write (or the accumulated
//!   read scope when reads are followed by a write) and whose destination
//!   scope is the new access;
//! - a layout transition discards the accumulated read scope.
//!
//! Images carry a subresource-range map so mip levels and array layers can be
//! in different states; declared ranges are split against existing ones so
//! every fragment is handled independently.
//!
//! When the previous access happened on another queue family the tracker
//! emits a queue-family-ownership-transfer pair: the release half is pushed
//! onto the batch that last used the resource (via the submission engine),
//! the acquire half is recorded locally. If the previous batch can no longer
//! accept commands, a conservative barrier without ownership transfer is used.

use crate::error::{Error, Result};
use crate::resource::{ResourceManager, TrackedResource};
use crate::submit::CmdBatch;
use ash::vk;
use fxhash::FxHashMap;
use std::sync::Arc;
use tracing::trace;

/// An image barrier in plain data form; converted to
/// `vk::ImageMemoryBarrier` at record time.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct ImageBarrier {
    pub image: vk::Image,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_queue_family: u32,
    pub dst_queue_family: u32,
    pub aspect: vk::ImageAspectFlags,
    pub range: SubRange,
}

impl ImageBarrier {
    pub(crate) fn to_vk(&self) -> vk::ImageMemoryBarrier {
        vk::ImageMemoryBarrier {
            src_access_mask: self.src_access,
            dst_access_mask: self.dst_access,
            old_layout: self.old_layout,
            new_layout: self.new_layout,
            src_queue_family_index: self.src_queue_family,
            dst_queue_family_index: self.dst_queue_family,
            image: self.image,
            subresource_range: vk::ImageSubresourceRange {
                aspect_mask: self.aspect,
                base_mip_level: self.range.base_mip,
                level_count: self.range.mip_count,
                base_array_layer: self.range.base_layer,
                layer_count: self.range.layer_count,
            },
            ..Default::default()
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct BufferBarrier {
    pub buffer: vk::Buffer,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_queue_family: u32,
    pub dst_queue_family: u32,
}

impl BufferBarrier {
    pub(crate) fn to_vk(&self) -> vk::BufferMemoryBarrier {
        vk::BufferMemoryBarrier {
            src_access_mask: self.src_access,
            dst_access_mask: self.dst_access,
            src_queue_family_index: self.src_queue_family,
            dst_queue_family_index: self.dst_queue_family,
            buffer: self.buffer,
            offset: 0,
            size: vk::WHOLE_SIZE,
            ..Default::default()
        }
    }
}

/// The barriers accumulated for one task (or for the recorder epilogue).
#[derive(Clone, Debug, Default)]
pub(crate) struct BarrierSet {
    pub src_stages: vk::PipelineStageFlags,
    pub dst_stages: vk::PipelineStageFlags,
    pub image_barriers: Vec<ImageBarrier>,
    pub buffer_barriers: Vec<BufferBarrier>,
}

impl BarrierSet {
    pub(crate) fn is_empty(&self) -> bool {
        self.image_barriers.is_empty() && self.buffer_barriers.is_empty()
    }

    fn push_image(&mut self, barrier: ImageBarrier, src_stages: vk::PipelineStageFlags, dst_stages: vk::PipelineStageFlags) {
        self.src_stages |= src_stages;
        self.dst_stages |= dst_stages;
        // merge with an identical-transition barrier on the same subresource
        if let Some(existing) = self.image_barriers.iter_mut().find(|b| {
            b.image == barrier.image
                && b.range == barrier.range
                && b.old_layout == barrier.old_layout
                && b.new_layout == barrier.new_layout
                && b.src_queue_family == barrier.src_queue_family
                && b.dst_queue_family == barrier.dst_queue_family
        }) {
            existing.src_access |= barrier.src_access;
            existing.dst_access |= barrier.dst_access;
        } else {
            self.image_barriers.push(barrier);
        }
    }

    fn push_buffer(&mut self, barrier: BufferBarrier, src_stages: vk::PipelineStageFlags, dst_stages: vk::PipelineStageFlags) {
        self.src_stages |= src_stages;
        self.dst_stages |= dst_stages;
        if let Some(existing) = self.buffer_barriers.iter_mut().find(|b| {
            b.buffer == barrier.buffer
                && b.src_queue_family == barrier.src_queue_family
                && b.dst_queue_family == barrier.dst_queue_family
        }) {
            existing.src_access |= barrier.src_access;
            existing.dst_access |= barrier.dst_access;
        } else {
            self.buffer_barriers.push(barrier);
        }
    }
}

/// A release barrier destined for the batch that previously owned the
/// resource (queue-family ownership transfer, release half).
#[derive(Copy, Clone, Debug)]
pub(crate) enum ReleaseBarrier {
    Image(ImageBarrier),
    Buffer(BufferBarrier),
}

/// Synchronization produced while declaring one task's accesses.
#[derive(Default)]
pub(crate) struct TaskSync {
    pub barriers: BarrierSet,
    /// Task indices this task implicitly depends on through shared
    /// resources.
    pub implicit_deps: Vec<usize>,
}

/// A rectangular subresource range over (mip levels × array layers).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SubRange {
    pub base_mip: u32,
    pub mip_count: u32,
    pub base_layer: u32,
    pub layer_count: u32,
}

impl SubRange {
    pub fn whole(mip_levels: u32, array_layers: u32) -> SubRange {
        SubRange {
            base_mip: 0,
            mip_count: mip_levels,
            base_layer: 0,
            layer_count: array_layers,
        }
    }

    pub fn mip(level: u32) -> SubRange {
        SubRange {
            base_mip: level,
            mip_count: 1,
            base_layer: 0,
            layer_count: 1,
        }
    }

    fn mip_end(&self) -> u32 {
        self.base_mip + self.mip_count
    }

    fn layer_end(&self) -> u32 {
        self.base_layer + self.layer_count
    }

    pub(crate) fn intersect(&self, other: &SubRange) -> Option<SubRange> {
        let base_mip = self.base_mip.max(other.base_mip);
        let mip_end = self.mip_end().min(other.mip_end());
        let base_layer = self.base_layer.max(other.base_layer);
        let layer_end = self.layer_end().min(other.layer_end());
        (base_mip < mip_end && base_layer < layer_end).then(|| SubRange {
            base_mip,
            mip_count: mip_end - base_mip,
            base_layer,
            layer_count: layer_end - base_layer,
        })
    }

    /// `self` minus `other` as up to four disjoint rectangles. `other` must
    /// be fully contained in `self`.
    pub(crate) fn subtract(&self, other: &SubRange) -> arrayvec::ArrayVec<SubRange, 4> {
        let mut out = arrayvec::ArrayVec::new();
        debug_assert!(self.intersect(other) == Some(*other));
        if other.base_mip > self.base_mip {
            out.push(SubRange {
                base_mip: self.base_mip,
                mip_count: other.base_mip - self.base_mip,
                base_layer: self.base_layer,
                layer_count: self.layer_count,
            });
        }
        if other.mip_end() < self.mip_end() {
            out.push(SubRange {
                base_mip: other.mip_end(),
                mip_count: self.mip_end() - other.mip_end(),
                base_layer: self.base_layer,
                layer_count: self.layer_count,
            });
        }
        if other.base_layer > self.base_layer {
            out.push(SubRange {
                base_mip: other.base_mip,
                mip_count: other.mip_count,
                base_layer: self.base_layer,
                layer_count: other.base_layer - self.base_layer,
            });
        }
        if other.layer_end() < self.layer_end() {
            out.push(SubRange {
                base_mip: other.base_mip,
                mip_count: other.mip_count,
                base_layer: other.layer_end(),
                layer_count: self.layer_end() - other.layer_end(),
            });
        }
        out
    }
}

/// One access as declared by a task.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct AccessDesc {
    pub stages: vk::PipelineStageFlags,
    pub access: vk::AccessFlags,
    /// Layout the access requires; `UNDEFINED` for buffers.
    pub layout: vk::ImageLayout,
    /// Layout the access leaves the resource in (differs from `layout` for
    /// render-pass attachments with a final-layout transition).
    pub final_layout: vk::ImageLayout,
}

impl AccessDesc {
    pub(crate) fn buffer(stages: vk::PipelineStageFlags, access: vk::AccessFlags) -> AccessDesc {
        AccessDesc {
            stages,
            access,
            layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::UNDEFINED,
        }
    }

    pub(crate) fn image(
        stages: vk::PipelineStageFlags,
        access: vk::AccessFlags,
        layout: vk::ImageLayout,
    ) -> AccessDesc {
        AccessDesc {
            stages,
            access,
            layout,
            final_layout: layout,
        }
    }
}

/// Shadow state of one resource (or one image subresource range).
#[derive(Copy, Clone, Debug)]
pub(crate) struct AccessState {
    read_stages: vk::PipelineStageFlags,
    read_access: vk::AccessFlags,
    write_stages: vk::PipelineStageFlags,
    write_access: vk::AccessFlags,
    /// Whether the most recent synchronization-relevant access was a write.
    write_last: bool,
    layout: vk::ImageLayout,
    queue_family: u32,
    last_writer: Option<usize>,
    reader_count: u8,
    readers: [usize; MAX_TRACKED_READERS],
}

const MAX_TRACKED_READERS: usize = 8;

impl AccessState {
    fn initial(layout: vk::ImageLayout, queue_family: u32) -> AccessState {
        AccessState {
            read_stages: vk::PipelineStageFlags::empty(),
            read_access: vk::AccessFlags::empty(),
            write_stages: vk::PipelineStageFlags::empty(),
            write_access: vk::AccessFlags::empty(),
            write_last: false,
            layout,
            queue_family,
            last_writer: None,
            reader_count: 0,
            readers: [0; MAX_TRACKED_READERS],
        }
    }

    /// Conservative state for a resource last used by an earlier batch:
    /// source scope must cover anything that batch may have done.
    fn carried_over(layout: vk::ImageLayout, queue_family: u32) -> AccessState {
        AccessState {
            write_stages: vk::PipelineStageFlags::ALL_COMMANDS,
            write_access: vk::AccessFlags::MEMORY_WRITE,
            write_last: true,
            ..AccessState::initial(layout, queue_family)
        }
    }

    fn push_reader(&mut self, task: usize) {
        if (self.reader_count as usize) < MAX_TRACKED_READERS {
            self.readers[self.reader_count as usize] = task;
            self.reader_count += 1;
        }
    }

    pub(crate) fn layout(&self) -> vk::ImageLayout {
        self.layout
    }
}

/// The barrier scopes produced by one state advance.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct BarrierParts {
    pub src_stages: vk::PipelineStageFlags,
    pub src_access: vk::AccessFlags,
    pub dst_stages: vk::PipelineStageFlags,
    pub dst_access: vk::AccessFlags,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
}

/// Advances the shadow state by one access and returns the barrier needed to
/// make the access legal, if any. Implicit dependency edges (reads after the
/// last writer, writes after readers) are appended to `deps`.
pub(crate) fn advance(
    state: &mut AccessState,
    next: &AccessDesc,
    is_write: bool,
    task_index: usize,
    deps: &mut Vec<usize>,
) -> Option<BarrierParts> {
    let layout_change = state.layout != next.layout;

    // implicit ordering edges through the shared resource
    if let Some(writer) = state.last_writer {
        if writer != task_index && !deps.contains(&writer) {
            deps.push(writer);
        }
    }
    if is_write {
        for &reader in &state.readers[..state.reader_count as usize] {
            if reader != task_index && !deps.contains(&reader) {
                deps.push(reader);
            }
        }
    }

    let had_reads = !state.read_stages.is_empty();
    let need_barrier = layout_change || state.write_last || is_write;

    if !need_barrier {
        // read-after-read in the same layout: no barrier, widen the scope
        state.read_stages |= next.stages;
        state.read_access |= next.access;
        state.push_reader(task_index);
        return None;
    }

    let (src_stages, src_access) = if state.write_last {
        (state.write_stages, state.write_access)
    } else if had_reads {
        // reads followed by a write (or a transition): the accumulated read
        // scope is the source
        (state.read_stages, state.read_access)
    } else {
        (vk::PipelineStageFlags::TOP_OF_PIPE, vk::AccessFlags::empty())
    };

    let parts = BarrierParts {
        src_stages,
        src_access,
        dst_stages: next.stages,
        dst_access: next.access,
        old_layout: state.layout,
        new_layout: next.layout,
    };

    if is_write {
        state.write_last = true;
        state.write_stages = next.stages;
        state.write_access = next.access;
        state.read_stages = vk::PipelineStageFlags::empty();
        state.read_access = vk::AccessFlags::empty();
        state.last_writer = Some(task_index);
        state.reader_count = 0;
    } else {
        state.write_last = false;
        // a layout transition discards the read scope accumulated on the old
        // layout
        state.read_stages = next.stages;
        state.read_access = next.access;
        state.push_reader(task_index);
    }
    state.layout = next.final_layout;
    Some(parts)
}

enum ShadowData {
    Buffer {
        handle: vk::Buffer,
        state: AccessState,
    },
    Image {
        handle: vk::Image,
        aspect: vk::ImageAspectFlags,
        whole: SubRange,
        ranges: Vec<(SubRange, AccessState)>,
    },
}

struct Shadow {
    data: ShadowData,
    /// Sharing mode of the underlying resource; concurrent resources never
    /// get ownership-transfer barriers.
    concurrent: bool,
}

pub(crate) struct LocalTracker {
    queue_family: u32,
    shadows: FxHashMap<TrackedResource, Shadow>,
}

impl LocalTracker {
    pub(crate) fn new(queue_family: u32) -> LocalTracker {
        LocalTracker {
            queue_family,
            shadows: FxHashMap::default(),
        }
    }

    /// Seeds the shadow of `res` from its cross-recorder state, emitting the
    /// ownership-transfer pair when the resource arrives from another queue
    /// family.
    fn shadow_entry(
        &mut self,
        resources: &ResourceManager,
        res: TrackedResource,
        first_access: &AccessDesc,
        sync: &mut TaskSync,
    ) -> Result<&mut Shadow> {
        if !self.shadows.contains_key(&res) {
            let snapshot = resources.global_track(res)?;
            let family_change = snapshot.owner_queue_family != vk::QUEUE_FAMILY_IGNORED
                && snapshot.owner_queue_family != self.queue_family;

            // resources with history carry a conservative source scope; fresh
            // resources start clean
            let base_state = if snapshot.last_batch.is_some() {
                AccessState::carried_over(snapshot.layout, self.queue_family)
            } else {
                AccessState::initial(snapshot.layout, self.queue_family)
            };

            let mut shadow = match res {
                TrackedResource::Buffer(id) => {
                    let handle = resources.buffer_handle(id)?;
                    let concurrent = resources.buffer_concurrent(id)?;
                    Shadow {
                        data: ShadowData::Buffer {
                            handle,
                            state: base_state,
                        },
                        concurrent,
                    }
                }
                TrackedResource::Image(id) => {
                    let desc = resources.describe_image(id)?;
                    Shadow {
                        data: ShadowData::Image {
                            handle: resources.image_handle(id)?,
                            aspect: resources.image_aspect(id)?,
                            whole: SubRange::whole(desc.mip_levels, desc.array_layers),
                            ranges: vec![(
                                SubRange::whole(desc.mip_levels, desc.array_layers),
                                base_state,
                            )],
                        },
                        concurrent: resources.image_concurrent(id)?,
                    }
                }
                TrackedResource::RtGeometry(id) => Shadow {
                    data: ShadowData::Buffer {
                        handle: resources.rt_geometry_buffer_handle(id)?,
                        state: base_state,
                    },
                    concurrent: false,
                },
                TrackedResource::RtScene(id) => Shadow {
                    data: ShadowData::Buffer {
                        handle: resources.rt_scene_buffer_handle(id)?,
                        state: base_state,
                    },
                    concurrent: false,
                },
            };

            // ownership transfer, release half onto the previous batch
            if family_change && !shadow.concurrent {
                let prev_family = snapshot.owner_queue_family;
                let appended = if let Some(prev_batch) = &snapshot.last_batch {
                    let release = match &shadow.data {
                        ShadowData::Buffer { handle, .. } => ReleaseBarrier::Buffer(BufferBarrier {
                            buffer: *handle,
                            src_access: vk::AccessFlags::MEMORY_WRITE,
                            dst_access: vk::AccessFlags::empty(),
                            src_queue_family: prev_family,
                            dst_queue_family: self.queue_family,
                        }),
                        ShadowData::Image {
                            handle,
                            aspect,
                            whole,
                            ..
                        } => ReleaseBarrier::Image(ImageBarrier {
                            image: *handle,
                            src_access: vk::AccessFlags::MEMORY_WRITE,
                            dst_access: vk::AccessFlags::empty(),
                            old_layout: snapshot.layout,
                            new_layout: first_access.layout,
                            src_queue_family: prev_family,
                            dst_queue_family: self.queue_family,
                            aspect: *aspect,
                            range: *whole,
                        }),
                    };
                    prev_batch.push_release_barrier(release)
                } else {
                    false
                };

                if appended {
                    // acquire half on this side
                    match &shadow.data {
                        ShadowData::Buffer { handle, .. } => sync.barriers.push_buffer(
                            BufferBarrier {
                                buffer: *handle,
                                src_access: vk::AccessFlags::empty(),
                                dst_access: first_access.access,
                                src_queue_family: prev_family,
                                dst_queue_family: self.queue_family,
                            },
                            vk::PipelineStageFlags::TOP_OF_PIPE,
                            first_access.stages,
                        ),
                        ShadowData::Image {
                            handle,
                            aspect,
                            whole,
                            ..
                        } => sync.barriers.push_image(
                            ImageBarrier {
                                image: *handle,
                                src_access: vk::AccessFlags::empty(),
                                dst_access: first_access.access,
                                old_layout: snapshot.layout,
                                new_layout: first_access.layout,
                                src_queue_family: prev_family,
                                dst_queue_family: self.queue_family,
                                aspect: *aspect,
                                range: *whole,
                            },
                            vk::PipelineStageFlags::TOP_OF_PIPE,
                            first_access.stages,
                        ),
                    }
                }
                // the acquire already performed the layout transition and
                // synchronization; reset the shadow so the first advance does
                // not emit a second transition. The conservative fallback
                // keeps the carried-over state and synchronizes through the
                // normal barrier path.
                if appended {
                    match &mut shadow.data {
                        ShadowData::Buffer { state, .. } => {
                            *state = AccessState::initial(
                                vk::ImageLayout::UNDEFINED,
                                self.queue_family,
                            );
                        }
                        ShadowData::Image { ranges, .. } => {
                            for (_, state) in ranges.iter_mut() {
                                *state = AccessState::initial(
                                    first_access.layout,
                                    self.queue_family,
                                );
                            }
                        }
                    }
                }
                trace!(?res, prev_family, appended, "queue family ownership transfer");
            }

            self.shadows.insert(res, shadow);
        }
        Ok(self.shadows.get_mut(&res).unwrap())
    }

    pub(crate) fn declare_buffer_access(
        &mut self,
        resources: &ResourceManager,
        task_index: usize,
        id: crate::resource::BufferId,
        stages: vk::PipelineStageFlags,
        access: vk::AccessFlags,
        sync: &mut TaskSync,
    ) -> Result<()> {
        self.declare_linear_access(
            resources,
            task_index,
            TrackedResource::Buffer(id),
            stages,
            access,
            sync,
        )
    }

    pub(crate) fn declare_rt_access(
        &mut self,
        resources: &ResourceManager,
        task_index: usize,
        res: TrackedResource,
        stages: vk::PipelineStageFlags,
        access: vk::AccessFlags,
        sync: &mut TaskSync,
    ) -> Result<()> {
        self.declare_linear_access(resources, task_index, res, stages, access, sync)
    }

    fn declare_linear_access(
        &mut self,
        resources: &ResourceManager,
        task_index: usize,
        res: TrackedResource,
        stages: vk::PipelineStageFlags,
        access: vk::AccessFlags,
        sync: &mut TaskSync,
    ) -> Result<()> {
        let desc = AccessDesc::buffer(stages, access);
        let is_write = crate::is_write_access(access);
        let queue_family = self.queue_family;
        let shadow = self.shadow_entry(resources, res, &desc, sync)?;
        let ShadowData::Buffer { handle, state } = &mut shadow.data else {
            return Err(Error::Configuration {
                name: format!("{res:?}"),
                reason: "buffer access declared on an image resource".to_string(),
            });
        };
        let qf = if shadow.concurrent {
            (vk::QUEUE_FAMILY_IGNORED, vk::QUEUE_FAMILY_IGNORED)
        } else {
            (queue_family, queue_family)
        };
        if let Some(parts) = advance(state, &desc, is_write, task_index, &mut sync.implicit_deps) {
            sync.barriers.push_buffer(
                BufferBarrier {
                    buffer: *handle,
                    src_access: parts.src_access,
                    dst_access: parts.dst_access,
                    src_queue_family: qf.0,
                    dst_queue_family: qf.1,
                },
                parts.src_stages,
                parts.dst_stages,
            );
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn declare_image_access(
        &mut self,
        resources: &ResourceManager,
        task_index: usize,
        id: crate::resource::ImageId,
        range: Option<SubRange>,
        desc: AccessDesc,
        sync: &mut TaskSync,
    ) -> Result<()> {
        let is_write =
            crate::is_write_access(desc.access) || desc.layout != desc.final_layout;
        let queue_family = self.queue_family;
        let res = TrackedResource::Image(id);
        let shadow = self.shadow_entry(resources, res, &desc, sync)?;
        let concurrent = shadow.concurrent;
        let ShadowData::Image {
            handle,
            aspect,
            whole,
            ranges,
        } = &mut shadow.data
        else {
            unreachable!("image shadow holds image data");
        };
        let declared = range.unwrap_or(*whole);
        let declared = declared.intersect(whole).ok_or_else(|| Error::Configuration {
            name: resources.image_name(id),
            reason: "declared subresource range is outside the image".to_string(),
        })?;

        let qf = if concurrent {
            vk::QUEUE_FAMILY_IGNORED
        } else {
            queue_family
        };

        // split the declared range against the existing ones; every fragment
        // advances independently
        let mut next_ranges: Vec<(SubRange, AccessState)> = Vec::with_capacity(ranges.len() + 4);
        for (existing, state) in ranges.drain(..) {
            match existing.intersect(&declared) {
                None => next_ranges.push((existing, state)),
                Some(overlap) => {
                    for rest in existing.subtract(&overlap) {
                        next_ranges.push((rest, state));
                    }
                    let mut state = state;
                    if let Some(parts) =
                        advance(&mut state, &desc, is_write, task_index, &mut sync.implicit_deps)
                    {
                        sync.barriers.push_image(
                            ImageBarrier {
                                image: *handle,
                                src_access: parts.src_access,
                                dst_access: parts.dst_access,
                                old_layout: parts.old_layout,
                                new_layout: parts.new_layout,
                                src_queue_family: qf,
                                dst_queue_family: qf,
                                aspect: *aspect,
                                range: overlap,
                            },
                            parts.src_stages,
                            parts.dst_stages,
                        );
                    }
                    next_ranges.push((overlap, state));
                }
            }
        }
        *ranges = next_ranges;
        Ok(())
    }

    /// Whether the tracker has seen `res`.
    pub(crate) fn touched(&self) -> impl Iterator<Item = TrackedResource> + '_ {
        self.shadows.keys().copied()
    }

    /// The layout the shadow currently holds for an image range (uniform
    /// ranges only); used by validation and tests.
    #[cfg(test)]
    pub(crate) fn image_layout(&self, id: crate::resource::ImageId) -> Option<vk::ImageLayout> {
        match &self.shadows.get(&TrackedResource::Image(id))?.data {
            ShadowData::Image { ranges, .. } => {
                let first = ranges.first()?.1.layout();
                ranges
                    .iter()
                    .all(|(_, s)| s.layout() == first)
                    .then_some(first)
            }
            _ => None,
        }
    }

    /// Ends the recorder's tracking: normalizes heterogeneous image ranges to
    /// a single layout (the one of the last declared fragment) and commits
    /// the final state of every touched resource back to its slot.
    pub(crate) fn finish(
        mut self,
        resources: &ResourceManager,
        batch: &Arc<CmdBatch>,
    ) -> BarrierSet {
        let mut epilogue = BarrierSet::default();
        for (res, shadow) in self.shadows.drain() {
            match shadow.data {
                ShadowData::Buffer { .. } => {
                    resources.commit_track(
                        res,
                        if shadow.concurrent {
                            vk::QUEUE_FAMILY_IGNORED
                        } else {
                            self.queue_family
                        },
                        vk::ImageLayout::UNDEFINED,
                        batch,
                    );
                }
                ShadowData::Image {
                    handle,
                    aspect,
                    ranges,
                    ..
                } => {
                    let target = ranges
                        .last()
                        .map(|(_, s)| s.layout())
                        .unwrap_or(vk::ImageLayout::UNDEFINED);
                    for (range, state) in &ranges {
                        if state.layout() != target {
                            epilogue.push_image(
                                ImageBarrier {
                                    image: handle,
                                    src_access: vk::AccessFlags::MEMORY_WRITE
                                        | vk::AccessFlags::MEMORY_READ,
                                    dst_access: vk::AccessFlags::MEMORY_READ,
                                    old_layout: state.layout(),
                                    new_layout: target,
                                    src_queue_family: vk::QUEUE_FAMILY_IGNORED,
                                    dst_queue_family: vk::QUEUE_FAMILY_IGNORED,
                                    aspect,
                                    range: *range,
                                },
                                vk::PipelineStageFlags::ALL_COMMANDS,
                                vk::PipelineStageFlags::ALL_COMMANDS,
                            );
                        }
                    }
                    resources.commit_track(
                        res,
                        if shadow.concurrent {
                            vk::QUEUE_FAMILY_IGNORED
                        } else {
                            self.queue_family
                        },
                        target,
                        batch,
                    );
                }
            }
        }
        epilogue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAO: vk::PipelineStageFlags = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
    const FS: vk::PipelineStageFlags = vk::PipelineStageFlags::FRAGMENT_SHADER;
    const TR: vk::PipelineStageFlags = vk::PipelineStageFlags::TRANSFER;

    fn fresh() -> AccessState {
        AccessState::initial(vk::ImageLayout::UNDEFINED, 0)
    }

    #[test]
    fn first_write_transitions_from_undefined() {
        let mut state = fresh();
        let mut deps = vec![];
        let access = AccessDesc::image(
            CAO,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        );
        let parts = advance(&mut state, &access, true, 0, &mut deps).unwrap();
        assert_eq!(parts.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(parts.new_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(parts.src_stages, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(parts.src_access, vk::AccessFlags::empty());
        assert!(deps.is_empty());
    }

    #[test]
    fn read_after_write_uses_write_scope_as_source() {
        let mut state = fresh();
        let mut deps = vec![];
        let write = AccessDesc::image(
            CAO,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        );
        advance(&mut state, &write, true, 0, &mut deps).unwrap();

        let read = AccessDesc::image(
            TR,
            vk::AccessFlags::TRANSFER_READ,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        );
        let parts = advance(&mut state, &read, false, 1, &mut deps).unwrap();
        assert_eq!(parts.src_stages, CAO);
        assert_eq!(parts.src_access, vk::AccessFlags::COLOR_ATTACHMENT_WRITE);
        assert_eq!(parts.dst_stages, TR);
        assert_eq!(parts.old_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(parts.new_layout, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        assert_eq!(deps, vec![0]);
    }

    #[test]
    fn reads_in_same_layout_merge_without_barrier() {
        let mut state = fresh();
        let mut deps = vec![];
        let read1 = AccessDesc::image(
            FS,
            vk::AccessFlags::SHADER_READ,
            vk::ImageLayout::UNDEFINED,
        );
        // reading an image that was never written; layout already matches
        assert!(advance(&mut state, &read1, false, 0, &mut deps).is_none());
        let read2 = AccessDesc::image(
            TR,
            vk::AccessFlags::TRANSFER_READ,
            vk::ImageLayout::UNDEFINED,
        );
        assert!(advance(&mut state, &read2, false, 1, &mut deps).is_none());
        assert_eq!(state.read_stages, FS | TR);
    }

    #[test]
    fn write_after_reads_uses_accumulated_read_scope() {
        let mut state = fresh();
        let mut deps = vec![];
        let read1 = AccessDesc::buffer(FS, vk::AccessFlags::SHADER_READ);
        let read2 = AccessDesc::buffer(
            vk::PipelineStageFlags::VERTEX_SHADER,
            vk::AccessFlags::SHADER_READ,
        );
        advance(&mut state, &read1, false, 0, &mut deps);
        advance(&mut state, &read2, false, 1, &mut deps);

        let write = AccessDesc::buffer(TR, vk::AccessFlags::TRANSFER_WRITE);
        let parts = advance(&mut state, &write, true, 2, &mut deps).unwrap();
        assert_eq!(parts.src_stages, FS | vk::PipelineStageFlags::VERTEX_SHADER);
        assert_eq!(parts.src_access, vk::AccessFlags::SHADER_READ);
        // write-after-read depends on both readers
        assert_eq!(deps, vec![0, 1]);
    }

    #[test]
    fn write_after_write_emits_barrier() {
        let mut state = fresh();
        let mut deps = vec![];
        let w = AccessDesc::buffer(TR, vk::AccessFlags::TRANSFER_WRITE);
        advance(&mut state, &w, true, 0, &mut deps);
        let parts = advance(&mut state, &w, true, 1, &mut deps).unwrap();
        assert_eq!(parts.src_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(parts.dst_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(deps, vec![0]);
    }

    #[test]
    fn layout_transition_discards_read_scope() {
        let mut state = fresh();
        let mut deps = vec![];
        // image left in SHADER_READ_ONLY by a previous write+transition
        let write = AccessDesc::image(
            CAO,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        );
        advance(&mut state, &write, true, 0, &mut deps);
        let read_a = AccessDesc::image(
            FS,
            vk::AccessFlags::SHADER_READ,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        advance(&mut state, &read_a, false, 1, &mut deps).unwrap();
        // transition to TRANSFER_SRC: src scope is the read scope, and the
        // old read scope is gone afterwards
        let read_b = AccessDesc::image(
            TR,
            vk::AccessFlags::TRANSFER_READ,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        );
        let parts = advance(&mut state, &read_b, false, 2, &mut deps).unwrap();
        assert_eq!(parts.src_stages, FS);
        assert_eq!(state.read_stages, TR);
        assert_eq!(state.read_access, vk::AccessFlags::TRANSFER_READ);
    }

    #[test]
    fn subrange_split_covers_and_is_disjoint() {
        let whole = SubRange::whole(4, 2);
        let inner = SubRange {
            base_mip: 1,
            mip_count: 2,
            base_layer: 0,
            layer_count: 1,
        };
        let overlap = whole.intersect(&inner).unwrap();
        assert_eq!(overlap, inner);
        let rest = whole.subtract(&overlap);
        // fragments plus the overlap tile the whole range exactly
        let mut area = overlap.mip_count * overlap.layer_count;
        for r in &rest {
            assert!(r.intersect(&overlap).is_none());
            for r2 in &rest {
                if r as *const _ != r2 as *const _ {
                    assert!(r.intersect(r2).is_none());
                }
            }
            area += r.mip_count * r.layer_count;
        }
        assert_eq!(area, 4 * 2);
    }

    #[test]
    fn mip_range_helper() {
        let r = SubRange::mip(3);
        assert_eq!(r.base_mip, 3);
        assert_eq!(r.mip_count, 1);
    }
}
