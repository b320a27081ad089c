//! Device wrapper and queue selection.
//!
//! The framegraph never creates a `VkInstance` or `VkDevice`; the caller
//! supplies them through [`DeviceInfo`] together with the queues it created.
//! At initialization up to three logical queues are chosen — graphics,
//! async-compute and async-transfer — preferring queues that are unique and
//! capability-disjoint from the ones already chosen, and falling back to a
//! shared queue when no dedicated one exists.

use crate::error::{Error, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;
use std::ffi::CString;
use std::fmt;
use tracing::info;

pub(crate) const MAX_QUEUES: usize = 3;

/// The queue a recorder (and therefore its batch) is bound to.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum QueueKind {
    Graphics = 0,
    AsyncCompute = 1,
    AsyncTransfer = 2,
}

impl QueueKind {
    pub(crate) const ALL: [QueueKind; MAX_QUEUES] =
        [QueueKind::Graphics, QueueKind::AsyncCompute, QueueKind::AsyncTransfer];

    pub(crate) const fn index(self) -> usize {
        self as usize
    }
}

bitflags::bitflags! {
    /// Set of queue kinds that may access a resource. Resources shared by
    /// more than one queue family are created with `CONCURRENT` sharing.
    pub struct QueueKindMask: u32 {
        const GRAPHICS = 1 << 0;
        const ASYNC_COMPUTE = 1 << 1;
        const ASYNC_TRANSFER = 1 << 2;
    }
}

impl Default for QueueKindMask {
    fn default() -> Self {
        QueueKindMask::GRAPHICS
    }
}

impl From<QueueKind> for QueueKindMask {
    fn from(kind: QueueKind) -> Self {
        QueueKindMask::from_bits_truncate(1 << kind.index())
    }
}

/// One queue record from the caller: the queue handle, its family, the
/// family's capability flags, and a name for debug markers.
#[derive(Clone, Debug)]
pub struct QueueInfo {
    pub handle: vk::Queue,
    pub family_index: u32,
    pub flags: vk::QueueFlags,
    pub debug_name: String,
}

/// Everything the framegraph needs from the caller-created Vulkan objects.
pub struct DeviceInfo {
    pub entry: ash::Entry,
    pub instance: ash::Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: ash::Device,
    pub queues: Vec<QueueInfo>,
    /// Whether `VK_EXT_debug_utils` was enabled on the instance.
    pub debug_utils: bool,
    /// Whether `VK_KHR_acceleration_structure` and friends were enabled on
    /// the device. Ray-tracing resources and tasks require this.
    pub ray_tracing: bool,
    /// Whether `VK_NV_mesh_shader` was enabled; `DrawMeshes*` tasks require
    /// this.
    pub mesh_shading: bool,
}

/// A device queue actually used for submission. Two `QueueKind`s may map to
/// the same `DeviceQueue` when no dedicated family exists; the submit lock is
/// then shared, keeping `vkQueueSubmit` serialized per queue.
pub(crate) struct DeviceQueue {
    pub(crate) handle: vk::Queue,
    pub(crate) family: u32,
    pub(crate) submit_lock: Mutex<()>,
}

/// Wrapper around the caller's vulkan device, the selected queues and the
/// device memory allocator.
pub struct Device {
    pub device: ash::Device,
    pub(crate) entry: ash::Entry,
    pub(crate) instance: ash::Instance,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub properties: vk::PhysicalDeviceProperties,
    /// Shader-group handle size/alignment, queried when ray tracing is on.
    pub(crate) rt_pipeline_properties: Option<vk::PhysicalDeviceRayTracingPipelinePropertiesKHR>,
    /// Distinct queues, deduplicated by handle.
    pub(crate) queues: Vec<DeviceQueue>,
    /// `QueueKind` index -> index into `queues`.
    pub(crate) kind_to_queue: [usize; MAX_QUEUES],
    pub(crate) allocator: Mutex<Allocator>,
    pub(crate) vk_khr_swapchain: ash::extensions::khr::Swapchain,
    pub(crate) vk_khr_surface: ash::extensions::khr::Surface,
    pub(crate) vk_ext_debug_utils: Option<ash::extensions::ext::DebugUtils>,
    pub(crate) vk_khr_accel: Option<ash::extensions::khr::AccelerationStructure>,
    pub(crate) vk_khr_rt_pipeline: Option<ash::extensions::khr::RayTracingPipeline>,
    pub(crate) vk_nv_mesh_shader: Option<ash::extensions::nv::MeshShader>,
}

// `PhysicalDeviceRayTracingPipelinePropertiesKHR` carries a dangling
// `p_next` only during the query; it is stored with `p_next` nulled.
unsafe impl Send for Device {}
unsafe impl Sync for Device {}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Device").finish()
    }
}

/// Picks the record best matching `wanted`, in decreasing order of
/// preference: unique and capability-disjoint, unique but broader, shared.
fn pick_queue(
    records: &[QueueInfo],
    taken: &[usize],
    wanted: vk::QueueFlags,
    broader: vk::QueueFlags,
) -> Option<usize> {
    let is_unique = |i: usize| !taken.contains(&i);

    let mut best: Option<usize> = None;
    let mut unique: Option<usize> = None;
    let mut compatible: Option<usize> = None;

    for (i, q) in records.iter().enumerate() {
        let has_wanted = q.flags.contains(wanted);
        let has_broader = q.flags.intersects(broader);
        let disjoint = has_wanted && !q.flags.intersects(broader & !wanted);

        if disjoint {
            compatible = Some(i);
            if is_unique(i) {
                best = Some(i);
                break;
            }
        } else if (has_wanted || has_broader) && is_unique(i) && unique.is_none() {
            unique = Some(i);
        }
    }

    best.or(unique).or(compatible)
}

impl Device {
    /// Wraps the caller-provided device and selects the submission queues.
    pub fn new(info: DeviceInfo) -> Result<Device> {
        if info.queues.is_empty() {
            return Err(Error::Configuration {
                name: "DeviceInfo".to_string(),
                reason: "at least one queue record is required".to_string(),
            });
        }

        let mut taken: Vec<usize> = Vec::new();

        let graphics = pick_queue(
            &info.queues,
            &taken,
            vk::QueueFlags::GRAPHICS,
            vk::QueueFlags::GRAPHICS,
        )
        .ok_or_else(|| Error::Configuration {
            name: "DeviceInfo".to_string(),
            reason: "no queue with GRAPHICS capability".to_string(),
        })?;
        taken.push(graphics);

        // compute without graphics is preferred; any unique compute-capable
        // queue beats sharing the graphics queue
        let compute = pick_queue(
            &info.queues,
            &taken,
            vk::QueueFlags::COMPUTE,
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
        )
        .unwrap_or(graphics);
        taken.push(compute);

        let transfer = pick_queue(
            &info.queues,
            &taken,
            vk::QueueFlags::TRANSFER,
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
        )
        .unwrap_or(graphics);

        let selected = [graphics, compute, transfer];

        let mut queues: Vec<DeviceQueue> = Vec::new();
        let mut kind_to_queue = [0usize; MAX_QUEUES];
        for (kind, &record_index) in QueueKind::ALL.iter().zip(selected.iter()) {
            let record = &info.queues[record_index];
            let slot = queues.iter().position(|q| q.handle == record.handle);
            let slot = match slot {
                Some(s) => s,
                None => {
                    queues.push(DeviceQueue {
                        handle: record.handle,
                        family: record.family_index,
                        submit_lock: Mutex::new(()),
                    });
                    queues.len() - 1
                }
            };
            kind_to_queue[kind.index()] = slot;
            info!(
                kind = ?kind,
                family = record.family_index,
                name = record.debug_name.as_str(),
                "selected queue"
            );
        }

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: info.instance.clone(),
            device: info.device.clone(),
            physical_device: info.physical_device,
            debug_settings: Default::default(),
            buffer_device_address: info.ray_tracing,
        })?;

        let memory_properties = unsafe {
            info.instance
                .get_physical_device_memory_properties(info.physical_device)
        };
        let properties = unsafe {
            info.instance
                .get_physical_device_properties(info.physical_device)
        };
        let rt_pipeline_properties = info.ray_tracing.then(|| unsafe {
            let mut rt_props = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
            let mut props2 = vk::PhysicalDeviceProperties2 {
                p_next: &mut rt_props as *mut _ as *mut std::os::raw::c_void,
                ..Default::default()
            };
            info.instance
                .get_physical_device_properties2(info.physical_device, &mut props2);
            rt_props.p_next = std::ptr::null_mut();
            rt_props
        });

        let vk_khr_swapchain = ash::extensions::khr::Swapchain::new(&info.instance, &info.device);
        let vk_khr_surface = ash::extensions::khr::Surface::new(&info.entry, &info.instance);
        let vk_ext_debug_utils = info
            .debug_utils
            .then(|| ash::extensions::ext::DebugUtils::new(&info.entry, &info.instance));
        let vk_khr_accel = info.ray_tracing.then(|| {
            ash::extensions::khr::AccelerationStructure::new(&info.instance, &info.device)
        });
        let vk_khr_rt_pipeline = info.ray_tracing.then(|| {
            ash::extensions::khr::RayTracingPipeline::new(&info.instance, &info.device)
        });
        let vk_nv_mesh_shader = info
            .mesh_shading
            .then(|| ash::extensions::nv::MeshShader::new(&info.instance, &info.device));

        Ok(Device {
            device: info.device,
            entry: info.entry,
            instance: info.instance,
            physical_device: info.physical_device,
            memory_properties,
            properties,
            rt_pipeline_properties,
            queues,
            kind_to_queue,
            allocator: Mutex::new(allocator),
            vk_khr_swapchain,
            vk_khr_surface,
            vk_ext_debug_utils,
            vk_khr_accel,
            vk_khr_rt_pipeline,
            vk_nv_mesh_shader,
        })
    }

    pub(crate) fn queue(&self, kind: QueueKind) -> &DeviceQueue {
        &self.queues[self.kind_to_queue[kind.index()]]
    }

    /// Queue family index a recorder on `kind` records for.
    pub fn queue_family(&self, kind: QueueKind) -> u32 {
        self.queue(kind).family
    }

    /// Distinct queue family indices covered by `mask`, for `CONCURRENT`
    /// sharing of resources accessed from several queues.
    pub(crate) fn families_for_mask(&self, mask: QueueKindMask) -> Vec<u32> {
        let mut families = Vec::with_capacity(MAX_QUEUES);
        for kind in QueueKind::ALL {
            if mask.contains(kind.into()) {
                let family = self.queue(kind).family;
                if !families.contains(&family) {
                    families.push(family);
                }
            }
        }
        families
    }

    pub(crate) fn set_debug_object_name(
        &self,
        object_type: vk::ObjectType,
        object_handle: u64,
        name: &str,
    ) {
        let Some(debug_utils) = &self.vk_ext_debug_utils else {
            return;
        };
        let object_name = match CString::new(name) {
            Ok(s) => s,
            Err(_) => return,
        };
        unsafe {
            let _ = debug_utils.set_debug_utils_object_name(
                self.device.handle(),
                &vk::DebugUtilsObjectNameInfoEXT {
                    object_type,
                    object_handle,
                    p_object_name: object_name.as_ptr(),
                    ..Default::default()
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(flags: vk::QueueFlags, family: u32) -> QueueInfo {
        QueueInfo {
            handle: vk::Queue::null(),
            family_index: family,
            flags,
            debug_name: format!("q{family}"),
        }
    }

    #[test]
    fn dedicated_queues_are_preferred() {
        let records = vec![
            record(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER, 0),
            record(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER, 1),
            record(vk::QueueFlags::TRANSFER, 2),
        ];
        let taken = vec![0];
        let compute = pick_queue(
            &records,
            &taken,
            vk::QueueFlags::COMPUTE,
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
        );
        assert_eq!(compute, Some(1));

        let taken = vec![0, 1];
        let transfer = pick_queue(
            &records,
            &taken,
            vk::QueueFlags::TRANSFER,
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
        );
        assert_eq!(transfer, Some(2));
    }

    #[test]
    fn single_family_falls_back_to_sharing() {
        let records = vec![record(
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
            0,
        )];
        let graphics = pick_queue(
            &records,
            &[],
            vk::QueueFlags::GRAPHICS,
            vk::QueueFlags::GRAPHICS,
        );
        assert_eq!(graphics, Some(0));
        // compute: no unique candidate left, shares the graphics queue
        let compute = pick_queue(
            &records,
            &[0],
            vk::QueueFlags::COMPUTE,
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
        );
        assert_eq!(compute, None); // caller falls back to graphics
    }
}
