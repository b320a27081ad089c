//! Batch submission engine.
//!
//! Owns the per-queue pending and submitted lists, the fence and semaphore
//! caches and the flush routine. `flush` runs to a fixed point: on every
//! pass, each queue promotes to `Ready` the pending batches whose
//! dependencies are all at least `Ready`, threads a semaphore for every
//! cross-queue dependency edge (signalled by the producer queue's last ready
//! batch, waited on by the consumer queue's first, at `ALL_COMMANDS`), and
//! issues a single `vkQueueSubmit` per queue with one fence per submitted
//! group.
//!
//! A failed `vkQueueSubmit` poisons the engine: every later operation fails
//! until the caller re-initializes the framegraph.

pub(crate) mod batch;

pub use batch::{BatchState, CmdBatch};
pub(crate) use batch::{CommandAllocator, ShaderDebugRecord};

use crate::device::{Device, QueueKind, MAX_QUEUES};
use crate::error::{Error, Result};
use crate::ids::CommandBatchName;
use crate::resource::ResourceManager;
use crate::track::ReleaseBarrier;
use ash::vk;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, trace, trace_span, warn};

/// Reports one captured shader execution after a batch recorded with debug
/// tracing completes: `(task_name, shader_name, stages, outputs)`.
pub type ShaderDebugCallback =
    Box<dyn Fn(&str, &str, vk::ShaderStageFlags, &[String]) + Send + Sync>;

struct SubmittedGroup {
    fence: vk::Fence,
    batches: Vec<Arc<CmdBatch>>,
    /// Semaphores this group waited on; unsignalled again once the fence
    /// fires, so they go back to the cache.
    consumed_semaphores: Vec<vk::Semaphore>,
    /// Signalled semaphores nobody will ever wait on (replaced cross-queue
    /// slots); destroyed at completion.
    orphan_semaphores: Vec<vk::Semaphore>,
}

#[derive(Default)]
struct EngineState {
    pending: [Vec<Arc<CmdBatch>>; MAX_QUEUES],
    submitted: Vec<SubmittedGroup>,
    fence_cache: Vec<vk::Fence>,
    semaphore_cache: Vec<vk::Semaphore>,
    /// `xq_semaphores[src][dst]`: semaphore signalled by the latest submit
    /// on queue `src` that a submit on queue `dst` may consume.
    xq_semaphores: [[Option<vk::Semaphore>; MAX_QUEUES]; MAX_QUEUES],
    command_pool_cache: Vec<CommandAllocator>,
    shader_debug_callback: Option<ShaderDebugCallback>,
}

pub struct SubmissionEngine {
    device: Arc<Device>,
    state: Mutex<EngineState>,
    enqueue_counter: AtomicU64,
    poisoned: AtomicBool,
}

impl SubmissionEngine {
    pub(crate) fn new(device: Arc<Device>) -> SubmissionEngine {
        SubmissionEngine {
            device,
            state: Mutex::new(EngineState::default()),
            enqueue_counter: AtomicU64::new(0),
            poisoned: AtomicBool::new(false),
        }
    }

    fn check_poisoned(&self) -> Result<()> {
        if self.poisoned.load(Ordering::Acquire) {
            Err(Error::Poisoned)
        } else {
            Ok(())
        }
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Creates a batch in the `Recording` state with a command pool for its
    /// queue family.
    pub(crate) fn create_batch(
        &self,
        name: CommandBatchName,
        queue_kind: QueueKind,
        order: u32,
        submit_immediately: bool,
        dependencies: Vec<Arc<CmdBatch>>,
    ) -> Result<Arc<CmdBatch>> {
        self.check_poisoned()?;
        let queue_family = self.device.queue_family(queue_kind);
        let allocator = {
            let mut state = self.state.lock();
            match state
                .command_pool_cache
                .iter()
                .position(|p| p.queue_family == queue_family)
            {
                Some(pos) => state.command_pool_cache.swap_remove(pos),
                None => CommandAllocator::new(&self.device.device, queue_family)?,
            }
        };
        Ok(CmdBatch::new(
            name,
            queue_kind,
            queue_family,
            order,
            submit_immediately,
            allocator,
            dependencies,
        ))
    }

    /// Appends a baked batch to its queue's pending list. Called by the
    /// recorder's `execute`.
    pub(crate) fn enqueue(&self, batch: Arc<CmdBatch>) -> Result<()> {
        self.check_poisoned()?;
        debug_assert_eq!(batch.state(), BatchState::Baked);
        batch.set_enqueue_seq(self.enqueue_counter.fetch_add(1, Ordering::Relaxed));
        let submit_now = batch.submit_immediately();
        {
            let mut state = self.state.lock();
            state.pending[batch.queue_kind().index()].push(batch);
        }
        if submit_now {
            self.flush(1)?;
        }
        Ok(())
    }

    /// Processes pending batches until no progress is made or
    /// `max_iterations` passes ran.
    pub fn flush(&self, max_iterations: u32) -> Result<()> {
        self.check_poisoned()?;
        let _span = trace_span!("flush").entered();
        let mut state = self.state.lock();

        for _ in 0..max_iterations.max(1) {
            let mut changed = false;
            for qi in 0..MAX_QUEUES {
                let (ready, dep_mask) = Self::collect_ready(&mut state, qi);
                if ready.is_empty() {
                    continue;
                }
                changed = true;
                self.submit_group(&mut state, qi, ready, dep_mask)?;
            }
            if !changed {
                break;
            }
        }
        Ok(())
    }

    /// Promotes to `Ready` every pending batch on queue `qi` whose
    /// dependencies are all at least `Ready`. Dependencies that already
    /// completed are pruned from the cross-queue wait mask.
    fn collect_ready(
        state: &mut EngineState,
        qi: usize,
    ) -> (Vec<Arc<CmdBatch>>, [bool; MAX_QUEUES]) {
        let mut ready = Vec::new();
        let mut dep_mask = [false; MAX_QUEUES];
        let mut remaining = Vec::new();

        for batch in state.pending[qi].drain(..) {
            let deps = batch.inner.lock().dependencies.clone();
            let is_ready = deps.iter().all(|d| d.state() >= BatchState::Ready);
            if is_ready {
                for dep in &deps {
                    let dq = dep.queue_kind().index();
                    if dq != qi && dep.state() < BatchState::Complete {
                        dep_mask[dq] = true;
                    }
                }
                batch.advance(BatchState::Ready);
                ready.push(batch);
            } else {
                remaining.push(batch);
            }
        }
        state.pending[qi] = remaining;

        ready.sort_by_cached_key(|b| (b.order(), b.enqueue_seq()));
        (ready, dep_mask)
    }

    fn create_semaphore(&self, state: &mut EngineState) -> Result<vk::Semaphore> {
        if let Some(sem) = state.semaphore_cache.pop() {
            return Ok(sem);
        }
        unsafe {
            self.device
                .device
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
                .map_err(|e| Error::device("vkCreateSemaphore", e))
        }
    }

    fn create_fence(&self, state: &mut EngineState) -> Result<vk::Fence> {
        if let Some(fence) = state.fence_cache.pop() {
            return Ok(fence);
        }
        unsafe {
            self.device
                .device
                .create_fence(&vk::FenceCreateInfo::default(), None)
                .map_err(|e| Error::device("vkCreateFence", e))
        }
    }

    /// Records the queued ownership-transfer release halves into an epilogue
    /// command buffer appended to the batch.
    fn record_release_epilogue(&self, batch: &CmdBatch) -> Result<()> {
        let mut inner = batch.inner.lock();
        if inner.release_barriers.is_empty() {
            return Ok(());
        }
        let device = &self.device.device;
        let allocator = inner
            .allocator
            .as_mut()
            .expect("batch lost its command allocator before submit");
        let cb = allocator.allocate(device)?;
        let begin_info = vk::CommandBufferBeginInfo {
            flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            ..Default::default()
        };
        let mut image_barriers = Vec::new();
        let mut buffer_barriers = Vec::new();
        for barrier in inner.release_barriers.drain(..) {
            match barrier {
                ReleaseBarrier::Image(b) => image_barriers.push(b.to_vk()),
                ReleaseBarrier::Buffer(b) => buffer_barriers.push(b.to_vk()),
            }
        }
        unsafe {
            device
                .begin_command_buffer(cb, &begin_info)
                .map_err(|e| Error::device("vkBeginCommandBuffer", e))?;
            device.cmd_pipeline_barrier(
                cb,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                vk::DependencyFlags::empty(),
                &[],
                &buffer_barriers,
                &image_barriers,
            );
            device
                .end_command_buffer(cb)
                .map_err(|e| Error::device("vkEndCommandBuffer", e))?;
        }
        inner.command_buffers.push(cb);
        trace!(name = ?batch.name(), "recorded ownership-transfer epilogue");
        Ok(())
    }

    fn submit_group(
        &self,
        state: &mut EngineState,
        qi: usize,
        ready: Vec<Arc<CmdBatch>>,
        dep_mask: [bool; MAX_QUEUES],
    ) -> Result<()> {
        let queue_kind = QueueKind::ALL[qi];
        let _span = trace_span!("submit_group", queue = ?queue_kind, batches = ready.len()).entered();

        for batch in &ready {
            self.record_release_epilogue(batch)?;
        }

        let mut consumed = Vec::new();
        let mut orphans = Vec::new();

        // cross-queue waits go on the first batch of the group
        {
            let mut first = ready[0].inner.lock();
            for src in 0..MAX_QUEUES {
                if dep_mask[src] {
                    if let Some(sem) = state.xq_semaphores[src][qi].take() {
                        first
                            .wait_semaphores
                            .push((sem, vk::PipelineStageFlags::ALL_COMMANDS));
                    }
                }
            }
        }

        // a fresh signal semaphore for every other queue goes on the last
        {
            let last = ready.last().unwrap();
            let mut last_inner = last.inner.lock();
            for dst in 0..MAX_QUEUES {
                if dst == qi {
                    continue;
                }
                let sem = self.create_semaphore(state)?;
                last_inner.signal_semaphores.push(sem);
                if let Some(old) = state.xq_semaphores[qi][dst].replace(sem) {
                    // signalled but never waited on; cannot be recycled
                    orphans.push(old);
                }
            }
        }

        let fence = self.create_fence(state)?;

        // per-batch arrays must stay alive until the submit call
        struct PerBatch {
            command_buffers: Vec<vk::CommandBuffer>,
            wait_semaphores: Vec<vk::Semaphore>,
            wait_stages: Vec<vk::PipelineStageFlags>,
            signal_semaphores: Vec<vk::Semaphore>,
        }
        let mut per_batch = Vec::with_capacity(ready.len());
        for batch in &ready {
            let mut inner = batch.inner.lock();
            let (wait_semaphores, wait_stages): (Vec<_>, Vec<_>) =
                inner.wait_semaphores.drain(..).unzip();
            consumed.extend(wait_semaphores.iter().copied());
            per_batch.push(PerBatch {
                command_buffers: inner.command_buffers.clone(),
                wait_semaphores,
                wait_stages,
                signal_semaphores: inner.signal_semaphores.drain(..).collect(),
            });
            inner.fence = fence;
        }

        let submit_infos: Vec<vk::SubmitInfo> = per_batch
            .iter()
            .map(|b| vk::SubmitInfo {
                wait_semaphore_count: b.wait_semaphores.len() as u32,
                p_wait_semaphores: b.wait_semaphores.as_ptr(),
                p_wait_dst_stage_mask: b.wait_stages.as_ptr(),
                command_buffer_count: b.command_buffers.len() as u32,
                p_command_buffers: b.command_buffers.as_ptr(),
                signal_semaphore_count: b.signal_semaphores.len() as u32,
                p_signal_semaphores: b.signal_semaphores.as_ptr(),
                ..Default::default()
            })
            .collect();

        let queue = self.device.queue(queue_kind);
        let submit_result = {
            let _guard = queue.submit_lock.lock();
            unsafe { self.device.device.queue_submit(queue.handle, &submit_infos, fence) }
        };

        if let Err(e) = submit_result {
            self.poisoned.store(true, Ordering::Release);
            error!(?e, "vkQueueSubmit failed; submission engine poisoned");
            return Err(Error::device("vkQueueSubmit", e));
        }

        for batch in &ready {
            batch.advance(BatchState::Submitted);
        }
        state.submitted.push(SubmittedGroup {
            fence,
            batches: ready,
            consumed_semaphores: consumed,
            orphan_semaphores: orphans,
        });
        Ok(())
    }

    /// Waits for the given batches. Only fences of batches currently in
    /// `Submitted` are waited on; returns `true` iff all of them signalled
    /// within `timeout_ns`. Batches whose fence signalled transition to
    /// `Complete` (releasing their resources) even when the overall wait
    /// timed out.
    pub fn wait(
        &self,
        batches: &[Arc<CmdBatch>],
        timeout_ns: u64,
        resources: &ResourceManager,
    ) -> Result<bool> {
        let fences: Vec<vk::Fence> = {
            let mut fences = Vec::new();
            for batch in batches {
                if batch.state() == BatchState::Submitted {
                    let fence = batch.inner.lock().fence;
                    if fence != vk::Fence::null() && !fences.contains(&fence) {
                        fences.push(fence);
                    }
                }
            }
            fences
        };
        if fences.is_empty() {
            return Ok(true);
        }

        let result = unsafe { self.device.device.wait_for_fences(&fences, true, timeout_ns) };
        let all_signalled = match result {
            Ok(()) => true,
            Err(vk::Result::TIMEOUT) => false,
            Err(e) => return Err(Error::device("vkWaitForFences", e)),
        };

        // harvest whatever did signal
        let mut state = self.state.lock();
        let signalled: HashSet<vk::Fence> = if all_signalled {
            fences.iter().copied().collect()
        } else {
            fences
                .iter()
                .copied()
                .filter(|&f| unsafe {
                    self.device.device.get_fence_status(f).unwrap_or(false)
                })
                .collect()
        };
        self.complete_signalled(&mut state, &signalled, resources);
        Ok(all_signalled)
    }

    /// Flushes, waits for every outstanding fence, then completes all
    /// submitted batches and returns pooled objects to their caches.
    pub fn wait_idle(&self, resources: &ResourceManager) -> Result<()> {
        self.flush(10)?;
        let mut state = self.state.lock();

        for (qi, pending) in state.pending.iter().enumerate() {
            if !pending.is_empty() {
                warn!(
                    queue = ?QueueKind::ALL[qi],
                    count = pending.len(),
                    "pending batches with unsatisfied dependencies at wait_idle"
                );
            }
        }

        let fences: Vec<vk::Fence> = state.submitted.iter().map(|g| g.fence).collect();
        if !fences.is_empty() {
            unsafe {
                self.device
                    .device
                    .wait_for_fences(&fences, true, u64::MAX)
                    .map_err(|e| Error::device("vkWaitForFences", e))?;
            }
        }
        let all: HashSet<vk::Fence> = fences.into_iter().collect();
        self.complete_signalled(&mut state, &all, resources);
        Ok(())
    }

    fn complete_signalled(
        &self,
        state: &mut EngineState,
        fences: &HashSet<vk::Fence>,
        resources: &ResourceManager,
    ) {
        if fences.is_empty() {
            return;
        }
        let device = &self.device.device;
        let submitted = std::mem::take(&mut state.submitted);
        let mut remaining = Vec::with_capacity(submitted.len());
        for group in submitted {
            if !fences.contains(&group.fence) {
                remaining.push(group);
                continue;
            }
            unsafe {
                let _ = device.reset_fences(&[group.fence]);
            }
            state.fence_cache.push(group.fence);
            state.semaphore_cache.extend(group.consumed_semaphores);
            for sem in group.orphan_semaphores {
                unsafe { device.destroy_semaphore(sem, None) };
            }
            for batch in group.batches {
                self.complete_batch(state, &batch, resources);
            }
        }
        state.submitted = remaining;
    }

    fn complete_batch(
        &self,
        state: &mut EngineState,
        batch: &Arc<CmdBatch>,
        resources: &ResourceManager,
    ) {
        if !batch.advance(BatchState::Complete) {
            return;
        }
        trace!(name = ?batch.name(), "batch complete");
        let mut inner = batch.inner.lock();
        for r in inner.release_resources.drain(..) {
            resources.release_any(r);
        }
        inner.dependencies.clear();
        inner.command_buffers.clear();
        if let Some(mut allocator) = inner.allocator.take() {
            allocator.reset(&self.device.device);
            state.command_pool_cache.push(allocator);
        }
        unsafe {
            let device = &self.device.device;
            for fb in inner.transient_framebuffers.drain(..) {
                device.destroy_framebuffer(fb, None);
            }
            for view in inner.transient_image_views.drain(..) {
                device.destroy_image_view(view, None);
            }
            if inner.descriptor_pool != vk::DescriptorPool::null() {
                device.destroy_descriptor_pool(inner.descriptor_pool, None);
                inner.descriptor_pool = vk::DescriptorPool::null();
            }
        }
        // any unsignalled leftover semaphores were recycled with the group
        inner.signal_semaphores.clear();
        inner.wait_semaphores.clear();
        if let Some(callback) = &state.shader_debug_callback {
            for record in inner.debug_records.drain(..) {
                callback(
                    &record.task_name,
                    &record.shader_name,
                    record.stages,
                    &record.outputs,
                );
            }
        } else {
            inner.debug_records.clear();
        }
    }

    pub fn set_shader_debug_callback(&self, callback: ShaderDebugCallback) {
        self.state.lock().shader_debug_callback = Some(callback);
    }

    /// Live pending-batch count over all queues; a no-op frame leaves this
    /// at zero.
    pub fn pending_count(&self) -> usize {
        let state = self.state.lock();
        state.pending.iter().map(Vec::len).sum::<usize>() + state.submitted.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_promotion_requires_ready_dependencies() {
        let mut state = EngineState::default();
        let producer = CmdBatch::for_tests("producer", QueueKind::AsyncTransfer, 0);
        producer.advance(BatchState::Baked);
        let consumer = CmdBatch::for_tests("consumer", QueueKind::Graphics, 0);
        consumer.advance(BatchState::Baked);
        consumer.inner.lock().dependencies.push(producer.clone());
        state.pending[QueueKind::Graphics.index()].push(consumer.clone());

        // dependency still Baked: nothing promoted
        let (ready, _) = SubmissionEngine::collect_ready(&mut state, QueueKind::Graphics.index());
        assert!(ready.is_empty());
        assert_eq!(state.pending[QueueKind::Graphics.index()].len(), 1);
        assert_eq!(consumer.state(), BatchState::Baked);

        // once the producer is Ready, the consumer follows and records the
        // cross-queue edge for semaphore threading
        producer.advance(BatchState::Ready);
        let (ready, dep_mask) =
            SubmissionEngine::collect_ready(&mut state, QueueKind::Graphics.index());
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].state(), BatchState::Ready);
        assert!(dep_mask[QueueKind::AsyncTransfer.index()]);
        assert!(state.pending[QueueKind::Graphics.index()].is_empty());
    }

    #[test]
    fn completed_dependencies_are_pruned_from_the_wait_mask() {
        let mut state = EngineState::default();
        let producer = CmdBatch::for_tests("producer", QueueKind::AsyncCompute, 0);
        producer.advance(BatchState::Complete);
        let consumer = CmdBatch::for_tests("consumer", QueueKind::Graphics, 0);
        consumer.advance(BatchState::Baked);
        consumer.inner.lock().dependencies.push(producer);
        state.pending[QueueKind::Graphics.index()].push(consumer);

        let (ready, dep_mask) =
            SubmissionEngine::collect_ready(&mut state, QueueKind::Graphics.index());
        assert_eq!(ready.len(), 1);
        // no semaphore is threaded for a dependency that already completed
        assert!(!dep_mask[QueueKind::AsyncCompute.index()]);
    }

    #[test]
    fn ready_groups_sort_by_declared_order() {
        let mut state = EngineState::default();
        let second = CmdBatch::for_tests("second", QueueKind::Graphics, 1);
        second.advance(BatchState::Baked);
        second.set_enqueue_seq(0);
        let first = CmdBatch::for_tests("first", QueueKind::Graphics, 0);
        first.advance(BatchState::Baked);
        first.set_enqueue_seq(1);
        state.pending[QueueKind::Graphics.index()].push(second);
        state.pending[QueueKind::Graphics.index()].push(first);

        let (ready, _) = SubmissionEngine::collect_ready(&mut state, QueueKind::Graphics.index());
        assert_eq!(ready.len(), 2);
        assert_eq!(ready[0].order(), 0);
        assert_eq!(ready[1].order(), 1);
    }
}

impl Drop for SubmissionEngine {
    fn drop(&mut self) {
        let device = &self.device.device;
        let mut state = self.state.lock();
        if !state.submitted.is_empty() {
            warn!("submission engine dropped with in-flight batches");
        }
        unsafe {
            for fence in state.fence_cache.drain(..) {
                device.destroy_fence(fence, None);
            }
            for sem in state.semaphore_cache.drain(..) {
                device.destroy_semaphore(sem, None);
            }
            for row in &mut state.xq_semaphores {
                for slot in row {
                    if let Some(sem) = slot.take() {
                        device.destroy_semaphore(sem, None);
                    }
                }
            }
        }
        for pool in state.command_pool_cache.drain(..) {
            pool.destroy(device);
        }
    }
}
