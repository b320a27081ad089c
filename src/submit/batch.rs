//! Command batches.
//!
//! A batch is one queue submission's worth of command buffers, together with
//! its wait/signal semaphores, its fence, the resources it keeps alive and
//! its position in the caller-declared batch dependency graph. Batches are
//! shared (`Arc`) between the recorder, the submission engine and the
//! resource-release path; the state machine is one-way and `Complete` is the
//! unique point where held resources are let go.

use crate::device::QueueKind;
use crate::error::{Error, Result};
use crate::ids::CommandBatchName;
use crate::resource::AnyResource;
use crate::track::ReleaseBarrier;
use ash::vk;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::Arc;

/// Batch lifecycle. Transitions are one-way:
/// `Initial → Recording → Baked → Ready → Submitted → Complete`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum BatchState {
    Initial = 0,
    Recording = 1,
    /// Recording ended; command buffers and referenced resources are locked.
    Baked = 2,
    /// All dependencies are at least `Ready`.
    Ready = 3,
    /// `vkQueueSubmit` issued.
    Submitted = 4,
    /// Fence signalled; resources released, callbacks fired.
    Complete = 5,
}

impl BatchState {
    fn from_u8(v: u8) -> BatchState {
        match v {
            0 => BatchState::Initial,
            1 => BatchState::Recording,
            2 => BatchState::Baked,
            3 => BatchState::Ready,
            4 => BatchState::Submitted,
            _ => BatchState::Complete,
        }
    }
}

/// Allocates command buffers from a `VkCommandPool` and recycles freed ones.
pub(crate) struct CommandAllocator {
    pub(crate) queue_family: u32,
    pub(crate) command_pool: vk::CommandPool,
    free: Vec<vk::CommandBuffer>,
    used: Vec<vk::CommandBuffer>,
}

impl CommandAllocator {
    pub(crate) fn new(device: &ash::Device, queue_family: u32) -> Result<CommandAllocator> {
        let create_info = vk::CommandPoolCreateInfo {
            flags: vk::CommandPoolCreateFlags::TRANSIENT,
            queue_family_index: queue_family,
            ..Default::default()
        };
        let command_pool = unsafe {
            device
                .create_command_pool(&create_info, None)
                .map_err(|e| Error::device("vkCreateCommandPool", e))?
        };
        Ok(CommandAllocator {
            queue_family,
            command_pool,
            free: vec![],
            used: vec![],
        })
    }

    pub(crate) fn allocate(&mut self, device: &ash::Device) -> Result<vk::CommandBuffer> {
        let cb = match self.free.pop() {
            Some(cb) => cb,
            None => {
                let allocate_info = vk::CommandBufferAllocateInfo {
                    command_pool: self.command_pool,
                    level: vk::CommandBufferLevel::PRIMARY,
                    command_buffer_count: 1,
                    ..Default::default()
                };
                unsafe {
                    device
                        .allocate_command_buffers(&allocate_info)
                        .map_err(|e| Error::device("vkAllocateCommandBuffers", e))?[0]
                }
            }
        };
        self.used.push(cb);
        Ok(cb)
    }

    pub(crate) fn reset(&mut self, device: &ash::Device) {
        unsafe {
            let _ = device.reset_command_pool(self.command_pool, vk::CommandPoolResetFlags::empty());
        }
        self.free.append(&mut self.used);
    }

    pub(crate) fn destroy(self, device: &ash::Device) {
        unsafe { device.destroy_command_pool(self.command_pool, None) };
    }
}

/// One captured shader execution, delivered to the shader-debug callback
/// when the owning batch completes.
pub(crate) struct ShaderDebugRecord {
    pub(crate) task_name: String,
    pub(crate) shader_name: String,
    pub(crate) stages: vk::ShaderStageFlags,
    pub(crate) outputs: Vec<String>,
}

#[derive(Default)]
pub(crate) struct BatchInner {
    /// Ordered command buffers; submitted as one `VkSubmitInfo`.
    pub(crate) command_buffers: Vec<vk::CommandBuffer>,
    pub(crate) allocator: Option<CommandAllocator>,
    pub(crate) wait_semaphores: Vec<(vk::Semaphore, vk::PipelineStageFlags)>,
    pub(crate) signal_semaphores: Vec<vk::Semaphore>,
    /// Set at submit time; null until then.
    pub(crate) fence: vk::Fence,
    pub(crate) dependencies: Vec<Arc<CmdBatch>>,
    /// References released when the batch completes.
    pub(crate) release_resources: Vec<AnyResource>,
    /// Queue-family ownership-transfer release halves, recorded into an
    /// epilogue command buffer right before submission.
    pub(crate) release_barriers: Vec<ReleaseBarrier>,
    pub(crate) debug_records: Vec<ShaderDebugRecord>,
    /// Descriptor sets recorded into this batch come from here; destroyed at
    /// completion.
    pub(crate) descriptor_pool: vk::DescriptorPool,
    /// Attachment views and framebuffers live until the batch completes.
    pub(crate) transient_image_views: Vec<vk::ImageView>,
    pub(crate) transient_framebuffers: Vec<vk::Framebuffer>,
}

pub struct CmdBatch {
    name: CommandBatchName,
    queue_kind: QueueKind,
    queue_family: u32,
    /// Caller-declared position among the batches submitted together.
    order: u32,
    submit_immediately: bool,
    enqueue_seq: AtomicU64,
    state: AtomicU8,
    pub(crate) inner: Mutex<BatchInner>,
}

impl CmdBatch {
    pub(crate) fn new(
        name: CommandBatchName,
        queue_kind: QueueKind,
        queue_family: u32,
        order: u32,
        submit_immediately: bool,
        allocator: CommandAllocator,
        dependencies: Vec<Arc<CmdBatch>>,
    ) -> Arc<CmdBatch> {
        Arc::new(CmdBatch {
            name,
            queue_kind,
            queue_family,
            order,
            submit_immediately,
            enqueue_seq: AtomicU64::new(0),
            state: AtomicU8::new(BatchState::Recording as u8),
            inner: Mutex::new(BatchInner {
                allocator: Some(allocator),
                dependencies,
                ..Default::default()
            }),
        })
    }

    pub fn name(&self) -> &CommandBatchName {
        &self.name
    }

    pub fn queue_kind(&self) -> QueueKind {
        self.queue_kind
    }

    pub(crate) fn queue_family(&self) -> u32 {
        self.queue_family
    }

    pub(crate) fn order(&self) -> u32 {
        self.order
    }

    pub(crate) fn submit_immediately(&self) -> bool {
        self.submit_immediately
    }

    pub(crate) fn set_enqueue_seq(&self, seq: u64) {
        self.enqueue_seq.store(seq, Ordering::Relaxed);
    }

    pub(crate) fn enqueue_seq(&self) -> u64 {
        self.enqueue_seq.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> BatchState {
        BatchState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// One-way transition; fails when the batch already moved past `to`.
    pub(crate) fn advance(&self, to: BatchState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current >= to as u8 {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state() == BatchState::Complete
    }

    /// Whether a release barrier can still be injected before submission.
    pub(crate) fn can_accept_release_barriers(&self) -> bool {
        self.state() <= BatchState::Baked
    }

    /// Appends an ownership-transfer release half; returns `false` when the
    /// batch already moved to submission and the caller must fall back to a
    /// conservative barrier.
    pub(crate) fn push_release_barrier(&self, barrier: ReleaseBarrier) -> bool {
        let mut inner = self.inner.lock();
        if self.state() > BatchState::Baked {
            return false;
        }
        inner.release_barriers.push(barrier);
        true
    }
}

#[cfg(test)]
impl CmdBatch {
    /// Bare batch without a command pool, for engine-logic tests.
    pub(crate) fn for_tests(name: &str, queue_kind: QueueKind, order: u32) -> Arc<CmdBatch> {
        Arc::new(CmdBatch {
            name: CommandBatchName::new(name),
            queue_kind,
            queue_family: queue_kind.index() as u32,
            order,
            submit_immediately: false,
            enqueue_seq: AtomicU64::new(0),
            state: AtomicU8::new(BatchState::Recording as u8),
            inner: Mutex::new(BatchInner::default()),
        })
    }
}

impl std::fmt::Debug for CmdBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("CmdBatch")
            .field("name", &self.name)
            .field("queue", &self.queue_kind)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_batch() -> Arc<CmdBatch> {
        CmdBatch::for_tests("test", QueueKind::Graphics, 0)
    }

    #[test]
    fn transitions_are_one_way() {
        let batch = test_batch();
        assert_eq!(batch.state(), BatchState::Recording);
        assert!(batch.advance(BatchState::Baked));
        assert!(batch.advance(BatchState::Ready));
        // cannot go back
        assert!(!batch.advance(BatchState::Baked));
        assert!(!batch.advance(BatchState::Recording));
        assert!(batch.advance(BatchState::Submitted));
        assert!(batch.advance(BatchState::Complete));
        assert!(batch.is_complete());
        // terminal
        assert!(!batch.advance(BatchState::Complete));
    }

    #[test]
    fn release_barriers_rejected_after_ready() {
        let batch = test_batch();
        batch.advance(BatchState::Baked);
        assert!(batch.can_accept_release_barriers());
        batch.advance(BatchState::Ready);
        assert!(!batch.can_accept_release_barriers());
        let rejected = batch.push_release_barrier(ReleaseBarrier::Buffer(
            crate::track::BufferBarrier {
                buffer: vk::Buffer::null(),
                src_access: vk::AccessFlags::MEMORY_WRITE,
                dst_access: vk::AccessFlags::empty(),
                src_queue_family: 0,
                dst_queue_family: 1,
            },
        ));
        assert!(!rejected);
    }
}
