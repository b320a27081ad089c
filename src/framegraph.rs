//! The framegraph front object.
//!
//! Owns the device wrapper, the resource manager, the submission engine and
//! the per-frame staging ring. A caller optionally opens a frame, obtains
//! command recorders bound to a queue kind, executes them, flushes, and
//! waits — see the crate-level documentation for the full data flow.

use crate::device::{Device, DeviceInfo};
use crate::error::{contract_violation, Result};
use crate::graph::{CommandRecorder, RecorderDesc};
use crate::resource::{PipelineCompiler, ResourceManager};
use crate::staging::{
    DataLoadedEvent, ImageReadbackMeta, ReadbackCallback, StagingPart, StagingRing,
    STAGING_BUFFER_SIZE,
};
use crate::submit::{CmdBatch, ShaderDebugCallback, SubmissionEngine};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::trace_span;

#[derive(Copy, Clone, Debug)]
pub struct FrameGraphDesc {
    /// Ring depth of the staging allocator; also how many frames may be
    /// recorded before `begin_frame` blocks on the oldest one.
    pub frames_in_flight: usize,
    pub staging_buffer_size: u64,
}

impl Default for FrameGraphDesc {
    fn default() -> Self {
        FrameGraphDesc {
            frames_in_flight: 2,
            staging_buffer_size: STAGING_BUFFER_SIZE,
        }
    }
}

struct FrameRing {
    open: bool,
    frame_number: u64,
    current: usize,
    /// Batches recorded during each ring slot's last frame.
    slots: Vec<Vec<Arc<CmdBatch>>>,
}

pub struct FrameGraph {
    device: Arc<Device>,
    resources: ResourceManager,
    engine: SubmissionEngine,
    staging: Mutex<StagingRing>,
    frames: Mutex<FrameRing>,
}

impl FrameGraph {
    /// Wraps the caller-created Vulkan device. The framegraph never creates
    /// the instance or device itself.
    pub fn new(info: DeviceInfo, desc: &FrameGraphDesc) -> Result<FrameGraph> {
        let device = Arc::new(Device::new(info)?);
        let atom = device.properties.limits.non_coherent_atom_size;
        let frames = desc.frames_in_flight.max(1);
        Ok(FrameGraph {
            resources: ResourceManager::new(device.clone()),
            engine: SubmissionEngine::new(device.clone()),
            staging: Mutex::new(StagingRing::new(frames, desc.staging_buffer_size, atom)),
            frames: Mutex::new(FrameRing {
                open: false,
                frame_number: 0,
                current: 0,
                slots: (0..frames).map(|_| Vec::new()).collect(),
            }),
            device,
        })
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn resources(&self) -> &ResourceManager {
        &self.resources
    }

    pub fn engine(&self) -> &SubmissionEngine {
        &self.engine
    }

    pub fn add_pipeline_compiler(&self, compiler: PipelineCompiler) {
        self.resources.add_pipeline_compiler(compiler);
    }

    pub fn set_shader_debug_callback(&self, callback: ShaderDebugCallback) {
        self.engine.set_shader_debug_callback(callback);
    }

    /// Opens a frame: advances the staging ring, waits for the frame that
    /// last used the new ring slot, and fires its readback callbacks on this
    /// thread. At most one frame is open at a time.
    pub fn begin_frame(&self) -> Result<()> {
        let (frame_number, to_wait) = {
            let mut frames = self.frames.lock();
            if frames.open {
                contract_violation!("begin_frame while a frame is already open");
            }
            frames.open = true;
            frames.frame_number += 1;
            let next = (frames.current + 1) % frames.slots.len();
            frames.current = next;
            (frames.frame_number, std::mem::take(&mut frames.slots[next]))
        };
        let _span = trace_span!("begin_frame", frame = frame_number).entered();

        if !to_wait.is_empty() {
            // batches of the reclaimed slot may still sit in pending lists
            self.engine.flush(10)?;
            self.engine.wait(&to_wait, u64::MAX, &self.resources)?;
        }
        let events = self.staging.lock().begin_frame(&self.device.device);
        for event in events {
            event.fire();
        }
        Ok(())
    }

    /// Closes the frame and flushes pending batches.
    pub fn end_frame(&self) -> Result<()> {
        {
            let mut frames = self.frames.lock();
            if !frames.open {
                contract_violation!("end_frame without an open frame");
            }
            frames.open = false;
        }
        self.engine.flush(10)
    }

    /// Creates a command recorder whose batch depends on `depends_on`.
    pub fn begin_recorder<'a>(
        &'a self,
        desc: &RecorderDesc,
        depends_on: &[&Arc<CmdBatch>],
    ) -> Result<CommandRecorder<'a>> {
        let dependencies = depends_on.iter().map(|b| Arc::clone(b)).collect();
        let batch = self.engine.create_batch(
            desc.name,
            desc.queue,
            desc.order,
            desc.submit_immediately,
            dependencies,
        )?;
        {
            let mut frames = self.frames.lock();
            let current = frames.current;
            frames.slots[current].push(batch.clone());
        }
        Ok(CommandRecorder::new(self, batch, desc))
    }

    /// Processes pending batches whose dependencies are satisfied.
    pub fn flush(&self) -> Result<()> {
        self.engine.flush(10)
    }

    /// Waits for the given batches; `true` iff all their fences signalled
    /// within `timeout_ns`.
    pub fn wait(&self, batches: &[Arc<CmdBatch>], timeout_ns: u64) -> Result<bool> {
        self.engine.wait(batches, timeout_ns, &self.resources)
    }

    /// Flushes, waits for the whole device, completes every batch.
    pub fn wait_idle(&self) -> Result<()> {
        self.engine.wait_idle(&self.resources)
    }

    // ------------------------------------------------------------------
    // staging plumbing used by recorders

    pub(crate) fn staging_store(
        &self,
        data: &[u8],
        src_offset: u64,
        min_block_size: u64,
        align: u64,
    ) -> Result<StagingPart> {
        self.staging
            .lock()
            .store(&self.resources, data, src_offset, min_block_size, align)
    }

    pub(crate) fn staging_add_pending(
        &self,
        required: u64,
        min_block_size: u64,
        align: u64,
    ) -> Result<(StagingPart, *mut u8)> {
        self.staging
            .lock()
            .add_pending(&self.resources, required, min_block_size, align)
    }

    pub(crate) fn staging_add_event(
        &self,
        parts: &[(StagingPart, *mut u8)],
        image: Option<ImageReadbackMeta>,
        callback: ReadbackCallback,
    ) {
        self.staging.lock().add_event(parts, image, callback);
    }

    pub(crate) fn flush_staging_uploads(&self) {
        self.staging.lock().flush_uploads(&self.device.device);
    }

    /// Fires leftover readback events without reopening a frame; used by
    /// tests and teardown after `wait_idle`.
    pub fn drain_readback_events(&self) {
        let slot_count = self.frames.lock().slots.len();
        let events: Vec<DataLoadedEvent> = {
            let mut staging = self.staging.lock();
            let mut all = Vec::new();
            for _ in 0..slot_count {
                all.extend(staging.begin_frame(&self.device.device));
            }
            all
        };
        for event in events {
            event.fire();
        }
    }
}

impl Drop for FrameGraph {
    fn drop(&mut self) {
        let _ = self.engine.wait_idle(&self.resources);
        self.staging.lock().destroy(&self.resources);
    }
}
