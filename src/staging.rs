//! Staging allocator.
//!
//! One ring slot per frame in flight; each slot keeps two lists of
//! fixed-size, persistently mapped buffers: `upload` (host to device) and
//! `readback` (device to host). Allocation is first-fit with a minimum-block
//! filter: a buffer with some space left is only used when it can hold at
//! least `min_block_size`, so uploads split into a bounded number of parts
//! (`MAX_BUFFER_PARTS` for buffers, `MAX_IMAGE_PARTS` for images).
//!
//! Readback ranges are registered as pending events on the current frame;
//! when the ring wraps back to a slot, the owning batches have completed, the
//! readback memory is invalidated, and every event's parts are concatenated
//! and handed to its callback on the frame-begin thread.

use crate::device::QueueKindMask;
use crate::error::{Error, Result};
use crate::resource::{BufferDesc, BufferId, OwnedBufferId, ResourceManager};
use ash::vk;
use gpu_allocator::MemoryLocation;
use tracing::trace;

/// Size of one staging buffer.
pub const STAGING_BUFFER_SIZE: u64 = 64 * 1024 * 1024;

/// Upper bound on the number of parts a buffer upload/readback may split
/// into.
pub const MAX_BUFFER_PARTS: u64 = 3;

/// Upper bound on the number of parts an image upload/readback may split
/// into.
pub const MAX_IMAGE_PARTS: u64 = 4;

/// Staging buffers per direction per frame slot.
const MAX_STAGING_BUFFERS: usize = 8;

/// One suballocated range of a staging buffer.
#[derive(Copy, Clone, Debug)]
pub struct StagingPart {
    pub buffer: BufferId,
    pub handle: vk::Buffer,
    pub offset: u64,
    pub size: u64,
}

pub(crate) struct StagingBuffer {
    owned: OwnedBufferId,
    handle: vk::Buffer,
    mapped_ptr: *mut u8,
    memory: vk::DeviceMemory,
    memory_offset: u64,
    capacity: u64,
    size: u64,
}

// Mapped pointers into persistently mapped staging memory.
unsafe impl Send for StagingBuffer {}

impl StagingBuffer {
    fn available(&self) -> u64 {
        self.capacity - self.size
    }
}

/// Metadata delivered with an image readback.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ImageReadbackMeta {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub row_pitch: u64,
    pub slice_pitch: u64,
    pub format: vk::Format,
    pub aspect: vk::ImageAspectFlags,
}

/// The data handed to a readback callback: the concatenated parts, plus
/// image metadata when the source was an image.
pub struct ReadbackView<'a> {
    pub data: &'a [u8],
    pub image: Option<ImageReadbackMeta>,
}

pub type ReadbackCallback = Box<dyn FnOnce(ReadbackView) + Send>;

struct PendingPart {
    mapped_ptr: *mut u8,
    offset: u64,
    size: u64,
}

/// A registered transfer-completion callback and the staging ranges it will
/// read.
pub struct DataLoadedEvent {
    parts: Vec<PendingPart>,
    total_size: u64,
    image: Option<ImageReadbackMeta>,
    callback: ReadbackCallback,
}

unsafe impl Send for DataLoadedEvent {}

impl DataLoadedEvent {
    /// Concatenates the parts and invokes the callback. The owning batch
    /// must have completed and the ranges been invalidated.
    pub(crate) fn fire(self) {
        let mut data = Vec::with_capacity(self.total_size as usize);
        for part in &self.parts {
            unsafe {
                let src = part.mapped_ptr.add(part.offset as usize);
                data.extend_from_slice(std::slice::from_raw_parts(src, part.size as usize));
            }
        }
        debug_assert_eq!(data.len() as u64, self.total_size);
        (self.callback)(ReadbackView {
            data: &data,
            image: self.image,
        });
    }
}

#[derive(Default)]
struct FrameSlot {
    upload: Vec<StagingBuffer>,
    readback: Vec<StagingBuffer>,
    events: Vec<DataLoadedEvent>,
}

/// The per-frame staging ring. Confined to the frame-owning thread except
/// through the framegraph's staging lock.
pub(crate) struct StagingRing {
    slots: Vec<FrameSlot>,
    current: usize,
    buffer_size: u64,
    non_coherent_atom_size: u64,
}

enum Direction {
    Upload,
    Readback,
}

impl StagingRing {
    pub(crate) fn new(frames_in_flight: usize, buffer_size: u64, non_coherent_atom_size: u64) -> StagingRing {
        let mut slots = Vec::with_capacity(frames_in_flight.max(1));
        slots.resize_with(frames_in_flight.max(1), FrameSlot::default);
        StagingRing {
            slots,
            current: 0,
            buffer_size,
            non_coherent_atom_size: non_coherent_atom_size.max(1),
        }
    }

    /// Advances to the next ring slot and returns the readback events
    /// registered the last time this slot was in use. The caller must have
    /// waited for that frame's batches and will fire the events after
    /// invalidation.
    pub(crate) fn begin_frame(&mut self, device: &ash::Device) -> Vec<DataLoadedEvent> {
        self.current = (self.current + 1) % self.slots.len();
        let atom = self.non_coherent_atom_size;
        let slot = &mut self.slots[self.current];

        // make the device writes visible before any callback reads them
        let ranges: Vec<vk::MappedMemoryRange> = slot
            .readback
            .iter()
            .filter(|b| b.size > 0)
            .map(|b| mapped_range(b, atom))
            .collect();
        if !ranges.is_empty() {
            unsafe {
                let _ = device.invalidate_mapped_memory_ranges(&ranges);
            }
        }

        for buf in slot.upload.iter_mut().chain(slot.readback.iter_mut()) {
            buf.size = 0;
        }
        std::mem::take(&mut slot.events)
    }

    /// Flush ranges for every upload buffer written this frame; issued before
    /// the frame's batches are submitted. Coherency of the mapped memory is
    /// not tracked, so ranges are always flushed.
    pub(crate) fn flush_uploads(&self, device: &ash::Device) {
        let atom = self.non_coherent_atom_size;
        let slot = &self.slots[self.current];
        let ranges: Vec<vk::MappedMemoryRange> = slot
            .upload
            .iter()
            .filter(|b| b.size > 0)
            .map(|b| mapped_range(b, atom))
            .collect();
        if !ranges.is_empty() {
            unsafe {
                let _ = device.flush_mapped_memory_ranges(&ranges);
            }
        }
    }

    fn allocate_buffer(
        resources: &ResourceManager,
        direction: &Direction,
        index: usize,
        frame: usize,
        size: u64,
    ) -> Result<StagingBuffer> {
        let (name, usage, location) = match direction {
            Direction::Upload => (
                format!("staging.upload.{index}/{frame}"),
                vk::BufferUsageFlags::TRANSFER_SRC,
                MemoryLocation::CpuToGpu,
            ),
            Direction::Readback => (
                format!("staging.readback.{index}/{frame}"),
                vk::BufferUsageFlags::TRANSFER_DST,
                MemoryLocation::GpuToCpu,
            ),
        };
        let buffer = resources.create_buffer(
            &name,
            QueueKindMask::all(),
            location,
            &BufferDesc {
                byte_size: size,
                usage,
                map_on_create: true,
            },
        )?;
        let (memory, memory_offset) = resources.buffer_memory_range(buffer.id.get())?;
        if buffer.mapped_ptr.is_null() {
            let id = buffer.id;
            resources.release_buffer(id);
            return Err(Error::Configuration {
                name,
                reason: "staging memory could not be mapped".to_string(),
            });
        }
        trace!(name, size, "allocated staging buffer");
        Ok(StagingBuffer {
            handle: buffer.handle,
            mapped_ptr: buffer.mapped_ptr,
            memory,
            memory_offset,
            capacity: size,
            size: 0,
            owned: buffer.id,
        })
    }

    /// First-fit with a minimum-block filter: prefer a buffer that holds the
    /// whole remainder, else the emptiest buffer with at least
    /// `min_block_size` free, else a new buffer.
    fn suitable_index(
        buffers: &[StagingBuffer],
        required: u64,
        min_block_size: u64,
    ) -> Option<usize> {
        let mut max_available: Option<usize> = None;
        for (i, buf) in buffers.iter().enumerate() {
            let available = buf.available();
            if available >= required {
                return Some(i);
            }
            if max_available.map_or(true, |m| available > buffers[m].available()) {
                max_available = Some(i);
            }
        }
        max_available.filter(|&m| buffers[m].available() >= min_block_size.max(1))
    }

    fn reserve(
        &mut self,
        resources: &ResourceManager,
        direction: Direction,
        required: u64,
        min_block_size: u64,
        align: u64,
    ) -> Result<(StagingPart, *mut u8)> {
        let frame = self.current;
        let slot = &mut self.slots[self.current];
        let buffers = match direction {
            Direction::Upload => &mut slot.upload,
            Direction::Readback => &mut slot.readback,
        };

        let index = match Self::suitable_index(buffers, required, min_block_size) {
            Some(i) => i,
            None => {
                if buffers.len() >= MAX_STAGING_BUFFERS {
                    return Err(Error::StagingExhausted { requested: required });
                }
                let buf = Self::allocate_buffer(
                    resources,
                    &direction,
                    buffers.len(),
                    frame,
                    self.buffer_size,
                )?;
                buffers.push(buf);
                buffers.len() - 1
            }
        };

        let buf = &mut buffers[index];
        let offset = buf.size;
        let mut size = buf.available().min(required);
        if align > 1 {
            // never hand out a partial row
            size = (size / align) * align;
        }
        if size == 0 {
            return Err(Error::StagingExhausted { requested: required });
        }
        buf.size += size;
        Ok((
            StagingPart {
                buffer: buf.owned.get(),
                handle: buf.handle,
                offset,
                size,
            },
            buf.mapped_ptr,
        ))
    }

    /// Copies a slice of `data` starting at `src_offset` into upload staging
    /// memory. Returns the written part; callers iterate until the whole
    /// input is stored.
    pub(crate) fn store(
        &mut self,
        resources: &ResourceManager,
        data: &[u8],
        src_offset: u64,
        min_block_size: u64,
        align: u64,
    ) -> Result<StagingPart> {
        let required = data.len() as u64 - src_offset;
        let (part, mapped_ptr) = self.reserve(
            resources,
            Direction::Upload,
            required,
            min_block_size,
            align,
        )?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr().add(src_offset as usize),
                mapped_ptr.add(part.offset as usize),
                part.size as usize,
            );
        }
        Ok(part)
    }

    /// Reserves readback space. The returned part is recorded as a
    /// copy-destination by the caller and registered with
    /// [`StagingRing::add_event`].
    pub(crate) fn add_pending(
        &mut self,
        resources: &ResourceManager,
        required: u64,
        min_block_size: u64,
        align: u64,
    ) -> Result<(StagingPart, *mut u8)> {
        self.reserve(resources, Direction::Readback, required, min_block_size, align)
    }

    pub(crate) fn add_event(
        &mut self,
        parts: &[(StagingPart, *mut u8)],
        image: Option<ImageReadbackMeta>,
        callback: ReadbackCallback,
    ) {
        let total_size = parts.iter().map(|(p, _)| p.size).sum();
        self.slots[self.current].events.push(DataLoadedEvent {
            parts: parts
                .iter()
                .map(|(p, mapped)| PendingPart {
                    mapped_ptr: *mapped,
                    offset: p.offset,
                    size: p.size,
                })
                .collect(),
            total_size,
            image,
            callback,
        });
    }

    /// Releases every staging buffer back to the manager. Must run after the
    /// device is idle.
    pub(crate) fn destroy(&mut self, resources: &ResourceManager) {
        for slot in &mut self.slots {
            for buf in slot.upload.drain(..).chain(slot.readback.drain(..)) {
                resources.release_buffer(buf.owned);
            }
            slot.events.clear();
        }
    }
}

fn mapped_range(buf: &StagingBuffer, atom: u64) -> vk::MappedMemoryRange {
    let offset = (buf.memory_offset / atom) * atom;
    vk::MappedMemoryRange {
        memory: buf.memory,
        offset,
        size: vk::WHOLE_SIZE,
        ..Default::default()
    }
}

/// Minimum block size for a buffer upload of `total` bytes.
pub(crate) fn buffer_min_block_size(total: u64) -> u64 {
    (total + MAX_BUFFER_PARTS - 1) / MAX_BUFFER_PARTS
}

/// Minimum block size for an image upload: never below a full row.
pub(crate) fn image_min_block_size(total: u64, row_pitch: u64) -> u64 {
    ((total + MAX_IMAGE_PARTS - 1) / MAX_IMAGE_PARTS).max(row_pitch)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_buffer(capacity: u64, size: u64) -> StagingBuffer {
        StagingBuffer {
            owned: crate::resource::Owned::new(BufferId::default()),
            handle: vk::Buffer::null(),
            mapped_ptr: std::ptr::null_mut(),
            memory: vk::DeviceMemory::null(),
            memory_offset: 0,
            capacity,
            size,
        }
    }

    fn release(buf: StagingBuffer) {
        // detach the owned id so the drop guard stays quiet
        let _ = buf.owned.take();
    }

    #[test]
    fn first_fit_prefers_whole_fit() {
        let buffers = vec![fake_buffer(64, 60), fake_buffer(64, 0)];
        assert_eq!(StagingRing::suitable_index(&buffers, 16, 8), Some(1));
        for b in buffers {
            release(b);
        }
    }

    #[test]
    fn min_block_filter_rejects_tiny_remainders() {
        // 4 bytes left, but a part must be at least 8
        let buffers = vec![fake_buffer(64, 60)];
        assert_eq!(StagingRing::suitable_index(&buffers, 100, 8), None);
        // with a smaller min block the remainder is used
        let buffers2 = vec![fake_buffer(64, 60)];
        assert_eq!(StagingRing::suitable_index(&buffers2, 100, 4), Some(0));
        for b in buffers2.into_iter().chain(buffers) {
            release(b);
        }
    }

    #[test]
    fn part_policies_match_part_counts() {
        // a 200 MiB upload through 64 MiB buffers needs at least 4 parts;
        // the min block size must not forbid the final remainder
        let total = 200 * 1024 * 1024;
        let min = buffer_min_block_size(total);
        assert!(min <= STAGING_BUFFER_SIZE + 1);
        // image rows are never split
        assert_eq!(image_min_block_size(1024, 256) % 256, 0);
        assert!(image_min_block_size(1 << 20, 4096) >= 4096);
    }
}
