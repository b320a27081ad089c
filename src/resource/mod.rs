//! Resource manager.
//!
//! Owns every GPU resource slot behind generational ids. Creation and release
//! take the table write lock briefly; lookups during recording only take the
//! read lock — slots never move and a released slot's generation never comes
//! back, so a stale id can always be detected.
//!
//! Cacheable kinds (samplers, render passes, descriptor-set layouts, pipeline
//! layouts) are deduplicated by a structural hash of their whole description.
//! Resources are reference counted; batches hold a reference on everything
//! they touch, so destruction is deferred until the last referencing batch
//! completes.

pub(crate) mod cache;
pub mod desc;
pub mod pipeline;
pub mod render_pass;

pub use desc::{BufferDesc, ImageDesc, RtGeometryDesc, RtSceneDesc, SamplerDesc};
pub use pipeline::{
    BoundResource, ColorBlendAttachment, ComputePipelineDesc, DescriptorBinding,
    DescriptorSetDecl, DescriptorSetLayoutDesc, GraphicsPipelineDesc, PipelineCompiler,
    PipelineLayoutDesc, PipelineResources, PushConstantRange, RayTracingPipelineDesc,
    ResourceBinding, RtShaderGroup, ShaderDesc, ShaderTargetFormat, VertexAttribute,
    VertexBufferLayout,
};
pub use render_pass::{
    AttachmentDesc, AttachmentRef, RenderPassDesc, SubpassDependencyDesc, SubpassDesc,
};

use crate::device::{Device, QueueKindMask};
use crate::error::{contract_violation, Error, Result};
use crate::ids::DescriptorSetName;
use crate::submit::CmdBatch;
use ash::vk;
use cache::{structural_hash, DedupIndex};
use fxhash::FxHashMap;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use parking_lot::{Mutex, RwLock};
use std::ffi::CString;
use std::sync::{Arc, Weak};
use tracing::{error, trace};

slotmap::new_key_type! {
    pub struct BufferId;
    pub struct ImageId;
    pub struct SamplerId;
    pub struct DescriptorSetLayoutId;
    pub struct PipelineLayoutId;
    pub struct RenderPassId;
    pub struct PipelineId;
    pub struct SwapchainId;
    pub struct RtGeometryId;
    pub struct RtSceneId;
}

/// An owning wrapper over a raw id: whoever holds it is responsible for
/// handing it back to [`ResourceManager`]. Dropping a live owned id is a
/// contract violation (the slot's reference would leak).
pub struct Owned<K: slotmap::Key> {
    raw: Option<K>,
}

impl<K: slotmap::Key> Owned<K> {
    pub(crate) fn new(raw: K) -> Owned<K> {
        Owned { raw: Some(raw) }
    }

    /// The raw id, usable for lookups and task declarations.
    pub fn get(&self) -> K {
        self.raw.expect("owned id was already released")
    }

    pub(crate) fn take(mut self) -> K {
        self.raw.take().expect("owned id was already released")
    }
}

impl<K: slotmap::Key> std::fmt::Debug for Owned<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Owned({:?})", self.raw)
    }
}

impl<K: slotmap::Key> Drop for Owned<K> {
    fn drop(&mut self) {
        if let Some(raw) = self.raw {
            if !std::thread::panicking() {
                contract_violation!("owned id {raw:?} dropped without being released");
            }
        }
    }
}

pub type OwnedBufferId = Owned<BufferId>;
pub type OwnedImageId = Owned<ImageId>;
pub type OwnedSamplerId = Owned<SamplerId>;
pub type OwnedDescriptorSetLayoutId = Owned<DescriptorSetLayoutId>;
pub type OwnedPipelineLayoutId = Owned<PipelineLayoutId>;
pub type OwnedRenderPassId = Owned<RenderPassId>;
pub type OwnedPipelineId = Owned<PipelineId>;
pub type OwnedSwapchainId = Owned<SwapchainId>;
pub type OwnedRtGeometryId = Owned<RtGeometryId>;
pub type OwnedRtSceneId = Owned<RtSceneId>;

/// Any resource id, for batch release lists.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum AnyResource {
    Buffer(BufferId),
    Image(ImageId),
    Sampler(SamplerId),
    SetLayout(DescriptorSetLayoutId),
    PipelineLayout(PipelineLayoutId),
    RenderPass(RenderPassId),
    Pipeline(PipelineId),
    Swapchain(SwapchainId),
    RtGeometry(RtGeometryId),
    RtScene(RtSceneId),
}

/// The resource kinds the local tracker keeps shadows for.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TrackedResource {
    Buffer(BufferId),
    Image(ImageId),
    RtGeometry(RtGeometryId),
    RtScene(RtSceneId),
}

impl From<TrackedResource> for AnyResource {
    fn from(r: TrackedResource) -> AnyResource {
        match r {
            TrackedResource::Buffer(id) => AnyResource::Buffer(id),
            TrackedResource::Image(id) => AnyResource::Image(id),
            TrackedResource::RtGeometry(id) => AnyResource::RtGeometry(id),
            TrackedResource::RtScene(id) => AnyResource::RtScene(id),
        }
    }
}

/// Cross-recorder access state committed back to the slot when a recorder
/// executes. The per-recorder shadows start from this.
pub(crate) struct GlobalTrack {
    pub(crate) owner_queue_family: u32,
    pub(crate) layout: vk::ImageLayout,
    pub(crate) last_batch: Option<Weak<CmdBatch>>,
}

impl Default for GlobalTrack {
    fn default() -> Self {
        GlobalTrack {
            owner_queue_family: vk::QUEUE_FAMILY_IGNORED,
            layout: vk::ImageLayout::UNDEFINED,
            last_batch: None,
        }
    }
}

/// Snapshot of [`GlobalTrack`] with the batch weak ref upgraded.
#[derive(Clone, Default)]
pub(crate) struct GlobalTrackSnapshot {
    pub(crate) owner_queue_family: u32,
    pub(crate) layout: vk::ImageLayout,
    pub(crate) last_batch: Option<Arc<CmdBatch>>,
}

type ReleaseCallback = Box<dyn FnOnce() + Send>;

/// How the memory behind a resource is owned.
pub(crate) enum ResourceAllocation {
    /// Allocated by the manager.
    Owned(Option<Allocation>),
    /// Wraps a caller-provided handle; the callback fires exactly once when
    /// the slot is finally released.
    External { on_release: Option<ReleaseCallback> },
    /// Image owned by a swapchain; destroyed with the swapchain.
    Swapchain,
}

pub(crate) struct BufferSlot {
    pub(crate) handle: vk::Buffer,
    pub(crate) desc: BufferDesc,
    pub(crate) mapped_ptr: *mut u8,
    /// `CONCURRENT` sharing mode; such resources never need queue-family
    /// ownership transfers.
    pub(crate) concurrent: bool,
    pub(crate) allocation: ResourceAllocation,
    pub(crate) ref_count: u32,
    pub(crate) name: String,
    pub(crate) track: GlobalTrack,
}

pub(crate) struct ImageSlot {
    pub(crate) handle: vk::Image,
    pub(crate) desc: ImageDesc,
    pub(crate) aspect: vk::ImageAspectFlags,
    pub(crate) concurrent: bool,
    pub(crate) allocation: ResourceAllocation,
    pub(crate) ref_count: u32,
    pub(crate) name: String,
    pub(crate) track: GlobalTrack,
}

pub(crate) struct SamplerSlot {
    pub(crate) handle: vk::Sampler,
    pub(crate) desc: SamplerDesc,
    pub(crate) ref_count: u32,
    pub(crate) cache_hash: u64,
}

pub(crate) struct SetLayoutSlot {
    pub(crate) handle: vk::DescriptorSetLayout,
    pub(crate) desc: DescriptorSetLayoutDesc,
    pub(crate) ref_count: u32,
    pub(crate) cache_hash: u64,
}

pub(crate) struct PipelineLayoutSlot {
    pub(crate) handle: vk::PipelineLayout,
    pub(crate) desc: PipelineLayoutDesc,
    pub(crate) ref_count: u32,
    pub(crate) cache_hash: u64,
}

pub(crate) struct RenderPassSlot {
    pub(crate) handle: vk::RenderPass,
    pub(crate) desc: RenderPassDesc,
    pub(crate) compat_hash: u64,
    pub(crate) ref_count: u32,
    pub(crate) cache_hash: u64,
}

pub(crate) struct ShaderModuleInfo {
    pub(crate) stage: vk::ShaderStageFlags,
    pub(crate) module: vk::ShaderModule,
    pub(crate) entry: CString,
}

pub(crate) enum PipelineKindSlot {
    Graphics(Box<GraphicsPipelineDesc>),
    Compute(Box<ComputePipelineDesc>),
    RayTracing(Box<RayTracingPipelineDesc>),
}

pub(crate) struct PipelineSlot {
    pub(crate) kind: PipelineKindSlot,
    pub(crate) bind_point: vk::PipelineBindPoint,
    pub(crate) layout: PipelineLayoutId,
    pub(crate) layout_handle: vk::PipelineLayout,
    /// Set index -> (name, layout id); index order matches the layout.
    pub(crate) sets: Vec<(DescriptorSetName, DescriptorSetLayoutId)>,
    pub(crate) modules: Arc<Vec<ShaderModuleInfo>>,
    /// `VkPipeline` per (render-pass compatibility, subpass, samples) key;
    /// compute pipelines use a single entry under key 0.
    pub(crate) instances: FxHashMap<u64, vk::Pipeline>,
    pub(crate) ref_count: u32,
    pub(crate) name: String,
}

pub(crate) struct SwapchainSlot {
    pub(crate) handle: vk::SwapchainKHR,
    pub(crate) surface: vk::SurfaceKHR,
    pub(crate) images: Vec<ImageId>,
    pub(crate) format: vk::SurfaceFormatKHR,
    pub(crate) extent: vk::Extent2D,
    pub(crate) present_mode: vk::PresentModeKHR,
    /// Signalled by `vkAcquireNextImageKHR`, waited on by the batch that
    /// writes the acquired image.
    pub(crate) acquire_semaphore: vk::Semaphore,
    /// Signalled by the presenting batch, waited on by `vkQueuePresentKHR`.
    pub(crate) present_semaphore: vk::Semaphore,
    pub(crate) current_image: u32,
    /// Whether a `Present` task consumed the pending acquire semaphore.
    pub(crate) acquire_pending: bool,
    pub(crate) ref_count: u32,
    pub(crate) name: String,
}

pub(crate) struct RtGeometrySlot {
    pub(crate) handle: vk::AccelerationStructureKHR,
    pub(crate) buffer: BufferId,
    pub(crate) desc: RtGeometryDesc,
    pub(crate) ref_count: u32,
    pub(crate) name: String,
    pub(crate) track: GlobalTrack,
}

pub(crate) struct RtSceneSlot {
    pub(crate) handle: vk::AccelerationStructureKHR,
    pub(crate) buffer: BufferId,
    pub(crate) desc: RtSceneDesc,
    pub(crate) ref_count: u32,
    pub(crate) name: String,
    pub(crate) track: GlobalTrack,
}

#[derive(Default)]
pub(crate) struct Tables {
    pub(crate) buffers: slotmap::SlotMap<BufferId, BufferSlot>,
    pub(crate) images: slotmap::SlotMap<ImageId, ImageSlot>,
    pub(crate) samplers: slotmap::SlotMap<SamplerId, SamplerSlot>,
    pub(crate) set_layouts: slotmap::SlotMap<DescriptorSetLayoutId, SetLayoutSlot>,
    pub(crate) pipeline_layouts: slotmap::SlotMap<PipelineLayoutId, PipelineLayoutSlot>,
    pub(crate) render_passes: slotmap::SlotMap<RenderPassId, RenderPassSlot>,
    pub(crate) pipelines: slotmap::SlotMap<PipelineId, PipelineSlot>,
    pub(crate) swapchains: slotmap::SlotMap<SwapchainId, SwapchainSlot>,
    pub(crate) rt_geometries: slotmap::SlotMap<RtGeometryId, RtGeometrySlot>,
    pub(crate) rt_scenes: slotmap::SlotMap<RtSceneId, RtSceneSlot>,
}

// Mapped pointers are plain addresses into persistently mapped device memory;
// the slots themselves are only reached through the manager's locks.
unsafe impl Send for Tables {}
unsafe impl Sync for Tables {}

#[derive(Default)]
struct Caches {
    samplers: DedupIndex<SamplerId>,
    set_layouts: DedupIndex<DescriptorSetLayoutId>,
    pipeline_layouts: DedupIndex<PipelineLayoutId>,
    render_passes: DedupIndex<RenderPassId>,
}

/// Live slot counts, mainly useful in tests and leak diagnostics.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceStats {
    pub buffers: usize,
    pub images: usize,
    pub samplers: usize,
    pub set_layouts: usize,
    pub pipeline_layouts: usize,
    pub render_passes: usize,
    pub pipelines: usize,
    pub swapchains: usize,
    pub rt_geometries: usize,
    pub rt_scenes: usize,
}

/// What the recorder needs to bind a pipeline.
pub(crate) struct PipelineRecordInfo {
    pub(crate) name: String,
    pub(crate) bind_point: vk::PipelineBindPoint,
    pub(crate) layout_handle: vk::PipelineLayout,
    /// Binding-slot order of the pipeline's vertex-input state.
    pub(crate) vertex_buffer_names: Vec<crate::ids::VertexBufferName>,
}

/// What the recorder needs to record a `Present` task.
pub(crate) struct SwapchainRecordInfo {
    pub(crate) handle: vk::SwapchainKHR,
    pub(crate) image: ImageId,
    pub(crate) image_index: u32,
    pub(crate) format: vk::Format,
    pub(crate) extent: vk::Extent2D,
    pub(crate) acquire_semaphore: Option<vk::Semaphore>,
    pub(crate) present_semaphore: vk::Semaphore,
}

/// A created buffer: the owned id plus the data needed to use it without
/// further lookups.
pub struct BufferHandle {
    pub id: OwnedBufferId,
    pub handle: vk::Buffer,
    /// Null unless the buffer was created with `map_on_create` in mappable
    /// memory.
    pub mapped_ptr: *mut u8,
}

/// A created image.
pub struct ImageHandle {
    pub id: OwnedImageId,
    pub handle: vk::Image,
}

pub struct ResourceManager {
    device: Arc<Device>,
    tables: RwLock<Tables>,
    caches: Mutex<Caches>,
    compilers: Mutex<Vec<PipelineCompiler>>,
    /// Compiled shader modules by pipeline-description content hash.
    module_cache: Mutex<FxHashMap<u64, Arc<Vec<ShaderModuleInfo>>>>,
}

impl ResourceManager {
    pub(crate) fn new(device: Arc<Device>) -> ResourceManager {
        ResourceManager {
            device,
            tables: RwLock::new(Tables::default()),
            caches: Mutex::new(Caches::default()),
            compilers: Mutex::new(Vec::new()),
            module_cache: Mutex::new(FxHashMap::default()),
        }
    }

    /// Appends a compiler to the ordered list tried for every shader. The
    /// built-in SPIR-V passthrough always runs last.
    pub fn add_pipeline_compiler(&self, compiler: PipelineCompiler) {
        self.compilers.lock().push(compiler);
    }

    pub fn stats(&self) -> ResourceStats {
        let tables = self.tables.read();
        ResourceStats {
            buffers: tables.buffers.len(),
            images: tables.images.len(),
            samplers: tables.samplers.len(),
            set_layouts: tables.set_layouts.len(),
            pipeline_layouts: tables.pipeline_layouts.len(),
            render_passes: tables.render_passes.len(),
            pipelines: tables.pipelines.len(),
            swapchains: tables.swapchains.len(),
            rt_geometries: tables.rt_geometries.len(),
            rt_scenes: tables.rt_scenes.len(),
        }
    }

    pub(crate) fn device(&self) -> &Arc<Device> {
        &self.device
    }

    fn sharing(&self, queues: QueueKindMask) -> (vk::SharingMode, Vec<u32>) {
        let families = self.device.families_for_mask(queues);
        if families.len() > 1 {
            (vk::SharingMode::CONCURRENT, families)
        } else {
            (vk::SharingMode::EXCLUSIVE, families)
        }
    }

    // ------------------------------------------------------------------
    // buffers & images

    pub fn create_buffer(
        &self,
        name: &str,
        queues: QueueKindMask,
        location: MemoryLocation,
        desc: &BufferDesc,
    ) -> Result<BufferHandle> {
        if desc.byte_size == 0 {
            return Err(Error::Configuration {
                name: name.to_string(),
                reason: "buffer size must be non-zero".to_string(),
            });
        }

        let (sharing_mode, families) = self.sharing(queues);
        let concurrent = sharing_mode == vk::SharingMode::CONCURRENT;
        let create_info = vk::BufferCreateInfo {
            size: desc.byte_size,
            usage: desc.usage,
            sharing_mode,
            queue_family_index_count: families.len() as u32,
            p_queue_family_indices: families.as_ptr(),
            ..Default::default()
        };
        let handle = unsafe {
            self.device
                .device
                .create_buffer(&create_info, None)
                .map_err(|e| {
                    error!(name, ?e, "buffer creation failed");
                    Error::device("vkCreateBuffer", e)
                })?
        };
        let requirements = unsafe { self.device.device.get_buffer_memory_requirements(handle) };

        let allocation = {
            let mut allocator = self.device.allocator.lock();
            allocator.allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
        };
        let allocation = match allocation {
            Ok(a) => a,
            Err(e) => {
                unsafe { self.device.device.destroy_buffer(handle, None) };
                error!(name, %e, "buffer memory allocation failed");
                return Err(e.into());
            }
        };

        unsafe {
            self.device
                .device
                .bind_buffer_memory(handle, allocation.memory(), allocation.offset())
                .map_err(|e| Error::device("vkBindBufferMemory", e))?;
        }

        let mapped_ptr = if desc.map_on_create {
            allocation
                .mapped_ptr()
                .map(|p| p.as_ptr() as *mut u8)
                .unwrap_or(std::ptr::null_mut())
        } else {
            std::ptr::null_mut()
        };

        self.device
            .set_debug_object_name(vk::ObjectType::BUFFER, vk::Handle::as_raw(handle), name);

        let id = self.tables.write().buffers.insert(BufferSlot {
            handle,
            desc: *desc,
            mapped_ptr,
            concurrent,
            allocation: ResourceAllocation::Owned(Some(allocation)),
            ref_count: 1,
            name: name.to_string(),
            track: GlobalTrack::default(),
        });
        trace!(name, ?id, "created buffer");

        Ok(BufferHandle {
            id: Owned::new(id),
            handle,
            mapped_ptr,
        })
    }

    pub fn create_image(
        &self,
        name: &str,
        queues: QueueKindMask,
        location: MemoryLocation,
        desc: &ImageDesc,
    ) -> Result<ImageHandle> {
        if desc.format == vk::Format::UNDEFINED || desc.width == 0 || desc.height == 0 {
            return Err(Error::Configuration {
                name: name.to_string(),
                reason: "image format and extent must be defined".to_string(),
            });
        }

        let (sharing_mode, families) = self.sharing(queues);
        let concurrent = sharing_mode == vk::SharingMode::CONCURRENT;
        let create_info = vk::ImageCreateInfo {
            image_type: desc.image_type,
            format: desc.format,
            extent: desc.extent(),
            mip_levels: desc.mip_levels,
            array_layers: desc.array_layers,
            samples: crate::get_vk_sample_count(desc.samples),
            tiling: desc.tiling,
            usage: desc.usage,
            sharing_mode,
            queue_family_index_count: families.len() as u32,
            p_queue_family_indices: families.as_ptr(),
            initial_layout: vk::ImageLayout::UNDEFINED,
            ..Default::default()
        };
        let handle = unsafe {
            self.device
                .device
                .create_image(&create_info, None)
                .map_err(|e| {
                    error!(name, ?e, "image creation failed");
                    Error::device("vkCreateImage", e)
                })?
        };
        let requirements = unsafe { self.device.device.get_image_memory_requirements(handle) };

        let allocation = {
            let mut allocator = self.device.allocator.lock();
            allocator.allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear: desc.tiling == vk::ImageTiling::LINEAR,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
        };
        let allocation = match allocation {
            Ok(a) => a,
            Err(e) => {
                unsafe { self.device.device.destroy_image(handle, None) };
                error!(name, %e, "image memory allocation failed");
                return Err(e.into());
            }
        };

        unsafe {
            self.device
                .device
                .bind_image_memory(handle, allocation.memory(), allocation.offset())
                .map_err(|e| Error::device("vkBindImageMemory", e))?;
        }

        self.device
            .set_debug_object_name(vk::ObjectType::IMAGE, vk::Handle::as_raw(handle), name);

        let id = self.tables.write().images.insert(ImageSlot {
            handle,
            desc: *desc,
            aspect: crate::format_aspect_mask(desc.format),
            concurrent,
            allocation: ResourceAllocation::Owned(Some(allocation)),
            ref_count: 1,
            name: name.to_string(),
            track: GlobalTrack::default(),
        });
        trace!(name, ?id, "created image");

        Ok(ImageHandle {
            id: Owned::new(id),
            handle,
        })
    }

    /// Wraps a caller-owned buffer. `on_release` fires exactly once, after
    /// the last referencing batch completed and the owned id was released.
    ///
    /// # Safety
    /// `handle` must be a valid buffer matching `desc`, and must stay valid
    /// until `on_release` is invoked.
    pub unsafe fn create_external_buffer(
        &self,
        name: &str,
        handle: vk::Buffer,
        desc: &BufferDesc,
        on_release: impl FnOnce() + Send + 'static,
    ) -> OwnedBufferId {
        let id = self.tables.write().buffers.insert(BufferSlot {
            handle,
            desc: *desc,
            mapped_ptr: std::ptr::null_mut(),
            concurrent: false,
            allocation: ResourceAllocation::External {
                on_release: Some(Box::new(on_release)),
            },
            ref_count: 1,
            name: name.to_string(),
            track: GlobalTrack::default(),
        });
        trace!(name, ?id, "imported external buffer");
        Owned::new(id)
    }

    /// Wraps a caller-owned image; `current_layout` seeds the tracker.
    ///
    /// # Safety
    /// `handle` must be a valid image matching `desc`, in `current_layout`,
    /// and must stay valid until `on_release` is invoked.
    pub unsafe fn create_external_image(
        &self,
        name: &str,
        handle: vk::Image,
        desc: &ImageDesc,
        current_layout: vk::ImageLayout,
        on_release: impl FnOnce() + Send + 'static,
    ) -> OwnedImageId {
        let id = self.tables.write().images.insert(ImageSlot {
            handle,
            desc: *desc,
            aspect: crate::format_aspect_mask(desc.format),
            concurrent: false,
            allocation: ResourceAllocation::External {
                on_release: Some(Box::new(on_release)),
            },
            ref_count: 1,
            name: name.to_string(),
            track: GlobalTrack {
                layout: current_layout,
                ..Default::default()
            },
        });
        trace!(name, ?id, "imported external image");
        Owned::new(id)
    }

    /// Registers an image owned by a swapchain slot.
    pub(crate) fn register_swapchain_image(
        &self,
        name: &str,
        handle: vk::Image,
        desc: &ImageDesc,
    ) -> ImageId {
        self.tables.write().images.insert(ImageSlot {
            handle,
            desc: *desc,
            aspect: crate::format_aspect_mask(desc.format),
            concurrent: false,
            allocation: ResourceAllocation::Swapchain,
            ref_count: 1,
            name: name.to_string(),
            track: GlobalTrack::default(),
        })
    }

    pub(crate) fn insert_swapchain_slot(&self, slot: SwapchainSlot) -> OwnedSwapchainId {
        Owned::new(self.tables.write().swapchains.insert(slot))
    }

    // ------------------------------------------------------------------
    // cacheable kinds

    pub fn cache_sampler(&self, desc: &SamplerDesc) -> Result<OwnedSamplerId> {
        let hash = structural_hash(desc);
        let mut tables = self.tables.write();
        let mut caches = self.caches.lock();

        if let Some(id) = caches
            .samplers
            .find(hash, |k| tables.samplers[k].desc == *desc)
        {
            tables.samplers[id].ref_count += 1;
            return Ok(Owned::new(id));
        }

        let handle = unsafe {
            self.device
                .device
                .create_sampler(&desc.to_vk(), None)
                .map_err(|e| {
                    error!(?e, "sampler creation failed");
                    Error::device("vkCreateSampler", e)
                })?
        };
        let id = tables.samplers.insert(SamplerSlot {
            handle,
            desc: *desc,
            ref_count: 1,
            cache_hash: hash,
        });
        caches.samplers.insert(hash, id);
        Ok(Owned::new(id))
    }

    pub fn cache_set_layout(&self, desc: &DescriptorSetLayoutDesc) -> Result<OwnedDescriptorSetLayoutId> {
        let mut tables = self.tables.write();
        let mut caches = self.caches.lock();
        Self::cache_set_layout_locked(&self.device, &mut tables, &mut caches, desc)
            .map(Owned::new)
    }

    fn cache_set_layout_locked(
        device: &Device,
        tables: &mut Tables,
        caches: &mut Caches,
        desc: &DescriptorSetLayoutDesc,
    ) -> Result<DescriptorSetLayoutId> {
        let hash = structural_hash(desc);
        if let Some(id) = caches
            .set_layouts
            .find(hash, |k| tables.set_layouts[k].desc == *desc)
        {
            tables.set_layouts[id].ref_count += 1;
            return Ok(id);
        }

        let bindings: Vec<vk::DescriptorSetLayoutBinding> = desc
            .bindings
            .iter()
            .map(|b| vk::DescriptorSetLayoutBinding {
                binding: b.binding,
                descriptor_type: b.descriptor_type,
                descriptor_count: b.count,
                stage_flags: b.stages,
                ..Default::default()
            })
            .collect();
        let create_info = vk::DescriptorSetLayoutCreateInfo {
            binding_count: bindings.len() as u32,
            p_bindings: bindings.as_ptr(),
            ..Default::default()
        };
        let handle = unsafe {
            device
                .device
                .create_descriptor_set_layout(&create_info, None)
                .map_err(|e| Error::device("vkCreateDescriptorSetLayout", e))?
        };
        let id = tables.set_layouts.insert(SetLayoutSlot {
            handle,
            desc: desc.clone(),
            ref_count: 1,
            cache_hash: hash,
        });
        caches.set_layouts.insert(hash, id);
        Ok(id)
    }

    pub fn cache_pipeline_layout(&self, desc: &PipelineLayoutDesc) -> Result<OwnedPipelineLayoutId> {
        let mut tables = self.tables.write();
        let mut caches = self.caches.lock();
        Self::cache_pipeline_layout_locked(&self.device, &mut tables, &mut caches, desc)
            .map(Owned::new)
    }

    fn cache_pipeline_layout_locked(
        device: &Device,
        tables: &mut Tables,
        caches: &mut Caches,
        desc: &PipelineLayoutDesc,
    ) -> Result<PipelineLayoutId> {
        let hash = structural_hash(desc);
        if let Some(id) = caches
            .pipeline_layouts
            .find(hash, |k| tables.pipeline_layouts[k].desc == *desc)
        {
            tables.pipeline_layouts[id].ref_count += 1;
            return Ok(id);
        }

        let mut set_layout_handles = Vec::with_capacity(desc.set_layouts.len());
        for &sl in &desc.set_layouts {
            let slot = tables.set_layouts.get(sl).ok_or(Error::StaleHandle {
                kind: "descriptor set layout",
            })?;
            set_layout_handles.push(slot.handle);
        }
        let push_constants: Vec<vk::PushConstantRange> = desc
            .push_constants
            .iter()
            .map(|r| vk::PushConstantRange {
                stage_flags: r.stages,
                offset: r.offset,
                size: r.size,
            })
            .collect();
        let create_info = vk::PipelineLayoutCreateInfo {
            set_layout_count: set_layout_handles.len() as u32,
            p_set_layouts: set_layout_handles.as_ptr(),
            push_constant_range_count: push_constants.len() as u32,
            p_push_constant_ranges: push_constants.as_ptr(),
            ..Default::default()
        };
        let handle = unsafe {
            device
                .device
                .create_pipeline_layout(&create_info, None)
                .map_err(|e| Error::device("vkCreatePipelineLayout", e))?
        };

        // the layout keeps its set layouts alive
        for &sl in &desc.set_layouts {
            tables.set_layouts[sl].ref_count += 1;
        }

        let id = tables.pipeline_layouts.insert(PipelineLayoutSlot {
            handle,
            desc: desc.clone(),
            ref_count: 1,
            cache_hash: hash,
        });
        caches.pipeline_layouts.insert(hash, id);
        Ok(id)
    }

    pub fn cache_render_pass(&self, desc: &RenderPassDesc) -> Result<OwnedRenderPassId> {
        let hash = structural_hash(desc);
        let mut tables = self.tables.write();
        let mut caches = self.caches.lock();

        if let Some(id) = caches
            .render_passes
            .find(hash, |k| tables.render_passes[k].desc == *desc)
        {
            tables.render_passes[id].ref_count += 1;
            return Ok(Owned::new(id));
        }

        let handle = render_pass::create_vk_render_pass(&self.device.device, desc)?;
        let id = tables.render_passes.insert(RenderPassSlot {
            handle,
            desc: desc.clone(),
            compat_hash: desc.compatibility_hash(),
            ref_count: 1,
            cache_hash: hash,
        });
        caches.render_passes.insert(hash, id);
        Ok(Owned::new(id))
    }

    // ------------------------------------------------------------------
    // pipelines

    fn compile_shader(&self, shader: &ShaderDesc) -> Result<Vec<u32>> {
        let compilers = self.compilers.lock().clone();
        for compiler in compilers
            .iter()
            .chain(std::iter::once(&PipelineCompiler::SpirvPassthrough))
        {
            if let Some(result) = compiler.try_compile(shader, ShaderTargetFormat::default()) {
                return result;
            }
        }
        Err(Error::NoCompiler {
            name: format!("{:?} stage", shader.stage),
        })
    }

    fn compile_modules(
        &self,
        content_hash: u64,
        shaders: &[ShaderDesc],
    ) -> Result<Arc<Vec<ShaderModuleInfo>>> {
        if let Some(modules) = self.module_cache.lock().get(&content_hash) {
            return Ok(modules.clone());
        }

        let mut modules = Vec::with_capacity(shaders.len());
        for shader in shaders {
            let spirv = self.compile_shader(shader)?;
            let create_info = vk::ShaderModuleCreateInfo {
                code_size: spirv.len() * 4,
                p_code: spirv.as_ptr(),
                ..Default::default()
            };
            let module = unsafe {
                self.device
                    .device
                    .create_shader_module(&create_info, None)
                    .map_err(|e| Error::device("vkCreateShaderModule", e))?
            };
            modules.push(ShaderModuleInfo {
                stage: shader.stage,
                module,
                entry: CString::new(shader.entry_point.as_str()).map_err(|_| {
                    Error::Configuration {
                        name: shader.entry_point.clone(),
                        reason: "entry point contains a NUL byte".to_string(),
                    }
                })?,
            });
        }

        let modules = Arc::new(modules);
        self.module_cache.lock().insert(content_hash, modules.clone());
        Ok(modules)
    }

    fn build_pipeline_layout(
        &self,
        sets: &[DescriptorSetDecl],
        push_constants: &[PushConstantRange],
    ) -> Result<(PipelineLayoutId, vk::PipelineLayout, Vec<(DescriptorSetName, DescriptorSetLayoutId)>)>
    {
        let mut tables = self.tables.write();
        let mut caches = self.caches.lock();

        let mut set_ids = Vec::with_capacity(sets.len());
        let mut named = Vec::with_capacity(sets.len());
        for decl in sets {
            let id = Self::cache_set_layout_locked(&self.device, &mut tables, &mut caches, &decl.layout)?;
            set_ids.push(id);
            named.push((decl.name, id));
        }

        let layout_desc = PipelineLayoutDesc {
            set_layouts: set_ids.clone(),
            push_constants: push_constants.to_vec(),
        };
        let layout =
            Self::cache_pipeline_layout_locked(&self.device, &mut tables, &mut caches, &layout_desc)?;
        let layout_handle = tables.pipeline_layouts[layout].handle;

        // the pipeline layout took its own references on the set layouts;
        // the ones we acquired while caching move into the pipeline slot
        Ok((layout, layout_handle, named))
    }

    pub fn create_graphics_pipeline(
        &self,
        name: &str,
        desc: &GraphicsPipelineDesc,
    ) -> Result<OwnedPipelineId> {
        if desc.shaders.is_empty() {
            return Err(Error::Configuration {
                name: name.to_string(),
                reason: "a graphics pipeline needs at least one shader stage".to_string(),
            });
        }
        let content_hash = structural_hash(desc);
        let modules = self.compile_modules(content_hash, &desc.shaders)?;
        let (layout, layout_handle, sets) =
            self.build_pipeline_layout(&desc.sets, &desc.push_constants)?;

        let id = self.tables.write().pipelines.insert(PipelineSlot {
            kind: PipelineKindSlot::Graphics(Box::new(desc.clone())),
            bind_point: vk::PipelineBindPoint::GRAPHICS,
            layout,
            layout_handle,
            sets,
            modules,
            instances: FxHashMap::default(),
            ref_count: 1,
            name: name.to_string(),
        });
        trace!(name, ?id, "created graphics pipeline");
        Ok(Owned::new(id))
    }

    pub fn create_compute_pipeline(
        &self,
        name: &str,
        desc: &ComputePipelineDesc,
    ) -> Result<OwnedPipelineId> {
        let content_hash = structural_hash(desc);
        let modules = self.compile_modules(content_hash, std::slice::from_ref(&desc.shader))?;
        let (layout, layout_handle, sets) =
            self.build_pipeline_layout(&desc.sets, &desc.push_constants)?;

        let module = &modules[0];
        let create_info = vk::ComputePipelineCreateInfo {
            stage: vk::PipelineShaderStageCreateInfo {
                stage: vk::ShaderStageFlags::COMPUTE,
                module: module.module,
                p_name: module.entry.as_ptr(),
                ..Default::default()
            },
            layout: layout_handle,
            ..Default::default()
        };
        let pipeline = unsafe {
            self.device
                .device
                .create_compute_pipelines(vk::PipelineCache::null(), &[create_info], None)
                .map_err(|(_, e)| Error::device("vkCreateComputePipelines", e))?[0]
        };

        let mut instances = FxHashMap::default();
        instances.insert(0u64, pipeline);

        let id = self.tables.write().pipelines.insert(PipelineSlot {
            kind: PipelineKindSlot::Compute(Box::new(desc.clone())),
            bind_point: vk::PipelineBindPoint::COMPUTE,
            layout,
            layout_handle,
            sets,
            modules,
            instances,
            ref_count: 1,
            name: name.to_string(),
        });
        trace!(name, ?id, "created compute pipeline");
        Ok(Owned::new(id))
    }

    /// Returns (and creates on first use) the `VkPipeline` instance of a
    /// graphics pipeline for a given render pass and subpass.
    pub(crate) fn resolve_graphics_pipeline(
        &self,
        id: PipelineId,
        render_pass: vk::RenderPass,
        compat_hash: u64,
        subpass: u32,
        samples: u32,
        color_attachment_count: u32,
    ) -> Result<vk::Pipeline> {
        let mut tables = self.tables.write();
        let slot = tables
            .pipelines
            .get_mut(id)
            .ok_or(Error::StaleHandle { kind: "pipeline" })?;

        let key = {
            use std::hash::{Hash, Hasher};
            let mut h = fxhash::FxHasher::default();
            compat_hash.hash(&mut h);
            subpass.hash(&mut h);
            samples.hash(&mut h);
            h.finish()
        };
        if let Some(&pipeline) = slot.instances.get(&key) {
            return Ok(pipeline);
        }

        let desc = match &slot.kind {
            PipelineKindSlot::Graphics(desc) => desc,
            _ => {
                return Err(Error::Configuration {
                    name: slot.name.clone(),
                    reason: "non-graphics pipeline used where a graphics pipeline is required"
                        .to_string(),
                })
            }
        };
        let pipeline = pipeline_instance::create_vk_graphics_pipeline(
            &self.device.device,
            desc,
            &slot.modules,
            slot.layout_handle,
            render_pass,
            subpass,
            samples,
            color_attachment_count,
        )?;
        slot.instances.insert(key, pipeline);
        Ok(pipeline)
    }

    /// Compute and ray-tracing pipelines have exactly one `VkPipeline`
    /// instance, created eagerly.
    pub(crate) fn resolve_prebuilt_pipeline(&self, id: PipelineId) -> Result<vk::Pipeline> {
        let tables = self.tables.read();
        let slot = tables
            .pipelines
            .get(id)
            .ok_or(Error::StaleHandle { kind: "pipeline" })?;
        slot.instances
            .get(&0)
            .copied()
            .ok_or_else(|| Error::Configuration {
                name: slot.name.clone(),
                reason: "graphics pipeline used where a compute or ray-tracing pipeline is required"
                    .to_string(),
            })
    }

    /// Populates `out` with one empty binding per descriptor of the named
    /// set, as declared by the pipeline's layout.
    pub fn initialize_pipeline_resources(
        &self,
        pipeline: PipelineId,
        set: DescriptorSetName,
        out: &mut PipelineResources,
    ) -> Result<()> {
        let tables = self.tables.read();
        let slot = tables
            .pipelines
            .get(pipeline)
            .ok_or(Error::StaleHandle { kind: "pipeline" })?;
        let (set_index, &(_, layout_id)) = slot
            .sets
            .iter()
            .enumerate()
            .find(|(_, (name, _))| *name == set)
            .ok_or_else(|| Error::Configuration {
                name: set.as_str().to_string(),
                reason: format!("pipeline `{}` declares no such descriptor set", slot.name),
            })?;
        let layout = &tables.set_layouts[layout_id];
        out.initialize(layout_id, set_index as u32, &layout.desc);
        Ok(())
    }

    // ------------------------------------------------------------------
    // host access (persistently mapped buffers)

    /// Returns a pointer into the mapped range of a host-visible buffer.
    pub fn map_buffer_range(&self, id: BufferId, offset: u64, size: u64) -> Result<*mut u8> {
        let tables = self.tables.read();
        let slot = tables
            .buffers
            .get(id)
            .ok_or(Error::StaleHandle { kind: "buffer" })?;
        if slot.mapped_ptr.is_null() {
            return Err(Error::Configuration {
                name: slot.name.clone(),
                reason: "buffer is not persistently mapped".to_string(),
            });
        }
        if offset.checked_add(size).map_or(true, |end| end > slot.desc.byte_size) {
            return Err(Error::Configuration {
                name: slot.name.clone(),
                reason: format!(
                    "range {}..{} exceeds buffer size {}",
                    offset,
                    offset + size,
                    slot.desc.byte_size
                ),
            });
        }
        Ok(unsafe { slot.mapped_ptr.add(offset as usize) })
    }

    /// Copies `data` into a persistently mapped buffer at `offset`.
    pub fn update_host_buffer(&self, id: BufferId, offset: u64, data: &[u8]) -> Result<()> {
        let dst = self.map_buffer_range(id, offset, data.len() as u64)?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // lookups used during recording

    pub(crate) fn buffer_handle(&self, id: BufferId) -> Result<vk::Buffer> {
        self.tables
            .read()
            .buffers
            .get(id)
            .map(|s| s.handle)
            .ok_or(Error::StaleHandle { kind: "buffer" })
    }

    pub(crate) fn image_handle(&self, id: ImageId) -> Result<vk::Image> {
        self.tables
            .read()
            .images
            .get(id)
            .map(|s| s.handle)
            .ok_or(Error::StaleHandle { kind: "image" })
    }

    pub fn describe_buffer(&self, id: BufferId) -> Result<BufferDesc> {
        self.tables
            .read()
            .buffers
            .get(id)
            .map(|s| s.desc)
            .ok_or(Error::StaleHandle { kind: "buffer" })
    }

    pub fn describe_image(&self, id: ImageId) -> Result<ImageDesc> {
        self.tables
            .read()
            .images
            .get(id)
            .map(|s| s.desc)
            .ok_or(Error::StaleHandle { kind: "image" })
    }

    pub fn describe_sampler(&self, id: SamplerId) -> Result<SamplerDesc> {
        self.tables
            .read()
            .samplers
            .get(id)
            .map(|s| s.desc)
            .ok_or(Error::StaleHandle { kind: "sampler" })
    }

    pub(crate) fn buffer_name(&self, id: BufferId) -> String {
        self.tables
            .read()
            .buffers
            .get(id)
            .map(|s| s.name.clone())
            .unwrap_or_else(|| format!("{id:?}"))
    }

    pub(crate) fn image_name(&self, id: ImageId) -> String {
        self.tables
            .read()
            .images
            .get(id)
            .map(|s| s.name.clone())
            .unwrap_or_else(|| format!("{id:?}"))
    }

    /// Device memory backing a manager-allocated buffer, for explicit
    /// flush/invalidate of mapped ranges.
    pub(crate) fn buffer_memory_range(&self, id: BufferId) -> Result<(vk::DeviceMemory, u64)> {
        let tables = self.tables.read();
        let slot = tables
            .buffers
            .get(id)
            .ok_or(Error::StaleHandle { kind: "buffer" })?;
        match &slot.allocation {
            ResourceAllocation::Owned(Some(allocation)) => {
                Ok((unsafe { allocation.memory() }, allocation.offset()))
            }
            _ => Err(Error::Configuration {
                name: slot.name.clone(),
                reason: "buffer memory is not owned by the manager".to_string(),
            }),
        }
    }

    pub(crate) fn buffer_concurrent(&self, id: BufferId) -> Result<bool> {
        self.tables
            .read()
            .buffers
            .get(id)
            .map(|s| s.concurrent)
            .ok_or(Error::StaleHandle { kind: "buffer" })
    }

    pub(crate) fn image_concurrent(&self, id: ImageId) -> Result<bool> {
        self.tables
            .read()
            .images
            .get(id)
            .map(|s| s.concurrent)
            .ok_or(Error::StaleHandle { kind: "image" })
    }

    pub(crate) fn rt_geometry_buffer_handle(&self, id: RtGeometryId) -> Result<vk::Buffer> {
        let tables = self.tables.read();
        let slot = tables
            .rt_geometries
            .get(id)
            .ok_or(Error::StaleHandle { kind: "rt geometry" })?;
        tables
            .buffers
            .get(slot.buffer)
            .map(|s| s.handle)
            .ok_or(Error::StaleHandle { kind: "buffer" })
    }

    pub(crate) fn rt_scene_buffer_handle(&self, id: RtSceneId) -> Result<vk::Buffer> {
        let tables = self.tables.read();
        let slot = tables
            .rt_scenes
            .get(id)
            .ok_or(Error::StaleHandle { kind: "rt scene" })?;
        tables
            .buffers
            .get(slot.buffer)
            .map(|s| s.handle)
            .ok_or(Error::StaleHandle { kind: "buffer" })
    }

    pub(crate) fn rt_geometry_accel_handle(&self, id: RtGeometryId) -> Result<vk::AccelerationStructureKHR> {
        self.tables
            .read()
            .rt_geometries
            .get(id)
            .map(|s| s.handle)
            .ok_or(Error::StaleHandle { kind: "rt geometry" })
    }

    pub(crate) fn rt_scene_accel_handle(&self, id: RtSceneId) -> Result<vk::AccelerationStructureKHR> {
        self.tables
            .read()
            .rt_scenes
            .get(id)
            .map(|s| s.handle)
            .ok_or(Error::StaleHandle { kind: "rt scene" })
    }

    pub(crate) fn image_aspect(&self, id: ImageId) -> Result<vk::ImageAspectFlags> {
        self.tables
            .read()
            .images
            .get(id)
            .map(|s| s.aspect)
            .ok_or(Error::StaleHandle { kind: "image" })
    }

    // ------------------------------------------------------------------
    // reference counting

    /// Adds a reference; used by batches for every resource they touch.
    pub(crate) fn acquire_any(&self, r: AnyResource) -> bool {
        let mut tables = self.tables.write();
        macro_rules! bump {
            ($table:ident, $id:expr, $kind:literal) => {
                match tables.$table.get_mut($id) {
                    Some(slot) => {
                        slot.ref_count += 1;
                        true
                    }
                    None => {
                        contract_violation!(concat!("stale ", $kind, " handle acquired"));
                        false
                    }
                }
            };
        }
        match r {
            AnyResource::Buffer(id) => bump!(buffers, id, "buffer"),
            AnyResource::Image(id) => bump!(images, id, "image"),
            AnyResource::Sampler(id) => bump!(samplers, id, "sampler"),
            AnyResource::SetLayout(id) => bump!(set_layouts, id, "descriptor set layout"),
            AnyResource::PipelineLayout(id) => bump!(pipeline_layouts, id, "pipeline layout"),
            AnyResource::RenderPass(id) => bump!(render_passes, id, "render pass"),
            AnyResource::Pipeline(id) => bump!(pipelines, id, "pipeline"),
            AnyResource::Swapchain(id) => bump!(swapchains, id, "swapchain"),
            AnyResource::RtGeometry(id) => bump!(rt_geometries, id, "rt geometry"),
            AnyResource::RtScene(id) => bump!(rt_scenes, id, "rt scene"),
        }
    }

    pub(crate) fn release_any(&self, r: AnyResource) {
        let mut deferred = Vec::new();
        {
            let mut tables = self.tables.write();
            let mut caches = self.caches.lock();
            Self::release_locked(&self.device, &mut tables, &mut caches, r, &mut deferred);
        }
        // external release callbacks run outside the manager's locks
        for callback in deferred {
            callback();
        }
    }

    pub fn release_buffer(&self, id: OwnedBufferId) {
        self.release_any(AnyResource::Buffer(id.take()));
    }

    pub fn release_image(&self, id: OwnedImageId) {
        self.release_any(AnyResource::Image(id.take()));
    }

    pub fn release_sampler(&self, id: OwnedSamplerId) {
        self.release_any(AnyResource::Sampler(id.take()));
    }

    pub fn release_set_layout(&self, id: OwnedDescriptorSetLayoutId) {
        self.release_any(AnyResource::SetLayout(id.take()));
    }

    pub fn release_pipeline_layout(&self, id: OwnedPipelineLayoutId) {
        self.release_any(AnyResource::PipelineLayout(id.take()));
    }

    pub fn release_render_pass(&self, id: OwnedRenderPassId) {
        self.release_any(AnyResource::RenderPass(id.take()));
    }

    pub fn release_pipeline(&self, id: OwnedPipelineId) {
        self.release_any(AnyResource::Pipeline(id.take()));
    }

    pub fn release_swapchain(&self, id: OwnedSwapchainId) {
        self.release_any(AnyResource::Swapchain(id.take()));
    }

    pub fn release_rt_geometry(&self, id: OwnedRtGeometryId) {
        self.release_any(AnyResource::RtGeometry(id.take()));
    }

    pub fn release_rt_scene(&self, id: OwnedRtSceneId) {
        self.release_any(AnyResource::RtScene(id.take()));
    }

    fn release_locked(
        device: &Device,
        tables: &mut Tables,
        caches: &mut Caches,
        r: AnyResource,
        deferred: &mut Vec<ReleaseCallback>,
    ) {
        match r {
            AnyResource::Buffer(id) => {
                let Some(slot) = tables.buffers.get_mut(id) else {
                    contract_violation!("stale buffer handle released");
                    return;
                };
                slot.ref_count -= 1;
                if slot.ref_count == 0 {
                    let mut slot = tables.buffers.remove(id).unwrap();
                    trace!(name = slot.name.as_str(), ?id, "destroying buffer");
                    match &mut slot.allocation {
                        ResourceAllocation::Owned(allocation) => unsafe {
                            device.device.destroy_buffer(slot.handle, None);
                            if let Some(allocation) = allocation.take() {
                                let _ = device.allocator.lock().free(allocation);
                            }
                        },
                        ResourceAllocation::External { on_release } => {
                            if let Some(cb) = on_release.take() {
                                deferred.push(cb);
                            }
                        }
                        ResourceAllocation::Swapchain => {}
                    }
                }
            }
            AnyResource::Image(id) => {
                let Some(slot) = tables.images.get_mut(id) else {
                    contract_violation!("stale image handle released");
                    return;
                };
                slot.ref_count -= 1;
                if slot.ref_count == 0 {
                    let mut slot = tables.images.remove(id).unwrap();
                    trace!(name = slot.name.as_str(), ?id, "destroying image");
                    match &mut slot.allocation {
                        ResourceAllocation::Owned(allocation) => unsafe {
                            device.device.destroy_image(slot.handle, None);
                            if let Some(allocation) = allocation.take() {
                                let _ = device.allocator.lock().free(allocation);
                            }
                        },
                        ResourceAllocation::External { on_release } => {
                            if let Some(cb) = on_release.take() {
                                deferred.push(cb);
                            }
                        }
                        // destroyed together with the owning swapchain
                        ResourceAllocation::Swapchain => {}
                    }
                }
            }
            AnyResource::Sampler(id) => {
                let Some(slot) = tables.samplers.get_mut(id) else {
                    contract_violation!("stale sampler handle released");
                    return;
                };
                slot.ref_count -= 1;
                if slot.ref_count == 0 {
                    let slot = tables.samplers.remove(id).unwrap();
                    caches.samplers.remove(slot.cache_hash, id);
                    unsafe { device.device.destroy_sampler(slot.handle, None) };
                }
            }
            AnyResource::SetLayout(id) => {
                let Some(slot) = tables.set_layouts.get_mut(id) else {
                    contract_violation!("stale descriptor set layout handle released");
                    return;
                };
                slot.ref_count -= 1;
                if slot.ref_count == 0 {
                    let slot = tables.set_layouts.remove(id).unwrap();
                    caches.set_layouts.remove(slot.cache_hash, id);
                    unsafe { device.device.destroy_descriptor_set_layout(slot.handle, None) };
                }
            }
            AnyResource::PipelineLayout(id) => {
                let Some(slot) = tables.pipeline_layouts.get_mut(id) else {
                    contract_violation!("stale pipeline layout handle released");
                    return;
                };
                slot.ref_count -= 1;
                if slot.ref_count == 0 {
                    let slot = tables.pipeline_layouts.remove(id).unwrap();
                    caches.pipeline_layouts.remove(slot.cache_hash, id);
                    unsafe { device.device.destroy_pipeline_layout(slot.handle, None) };
                    for sl in slot.desc.set_layouts {
                        Self::release_locked(device, tables, caches, AnyResource::SetLayout(sl), deferred);
                    }
                }
            }
            AnyResource::RenderPass(id) => {
                let Some(slot) = tables.render_passes.get_mut(id) else {
                    contract_violation!("stale render pass handle released");
                    return;
                };
                slot.ref_count -= 1;
                if slot.ref_count == 0 {
                    let slot = tables.render_passes.remove(id).unwrap();
                    caches.render_passes.remove(slot.cache_hash, id);
                    unsafe { device.device.destroy_render_pass(slot.handle, None) };
                }
            }
            AnyResource::Pipeline(id) => {
                let Some(slot) = tables.pipelines.get_mut(id) else {
                    contract_violation!("stale pipeline handle released");
                    return;
                };
                slot.ref_count -= 1;
                if slot.ref_count == 0 {
                    let slot = tables.pipelines.remove(id).unwrap();
                    for (_, pipeline) in slot.instances {
                        unsafe { device.device.destroy_pipeline(pipeline, None) };
                    }
                    // shader modules stay in the content cache
                    let layout = slot.layout;
                    for (_, sl) in slot.sets {
                        Self::release_locked(device, tables, caches, AnyResource::SetLayout(sl), deferred);
                    }
                    Self::release_locked(device, tables, caches, AnyResource::PipelineLayout(layout), deferred);
                }
            }
            AnyResource::Swapchain(id) => {
                let Some(slot) = tables.swapchains.get_mut(id) else {
                    contract_violation!("stale swapchain handle released");
                    return;
                };
                slot.ref_count -= 1;
                if slot.ref_count == 0 {
                    let slot = tables.swapchains.remove(id).unwrap();
                    for image in slot.images {
                        Self::release_locked(device, tables, caches, AnyResource::Image(image), deferred);
                    }
                    unsafe {
                        device.device.destroy_semaphore(slot.acquire_semaphore, None);
                        device.device.destroy_semaphore(slot.present_semaphore, None);
                        device.vk_khr_swapchain.destroy_swapchain(slot.handle, None);
                    }
                }
            }
            AnyResource::RtGeometry(id) => {
                let Some(slot) = tables.rt_geometries.get_mut(id) else {
                    contract_violation!("stale rt geometry handle released");
                    return;
                };
                slot.ref_count -= 1;
                if slot.ref_count == 0 {
                    let slot = tables.rt_geometries.remove(id).unwrap();
                    if let Some(accel) = &device.vk_khr_accel {
                        unsafe { accel.destroy_acceleration_structure(slot.handle, None) };
                    }
                    Self::release_locked(device, tables, caches, AnyResource::Buffer(slot.buffer), deferred);
                }
            }
            AnyResource::RtScene(id) => {
                let Some(slot) = tables.rt_scenes.get_mut(id) else {
                    contract_violation!("stale rt scene handle released");
                    return;
                };
                slot.ref_count -= 1;
                if slot.ref_count == 0 {
                    let slot = tables.rt_scenes.remove(id).unwrap();
                    if let Some(accel) = &device.vk_khr_accel {
                        unsafe { accel.destroy_acceleration_structure(slot.handle, None) };
                    }
                    Self::release_locked(device, tables, caches, AnyResource::Buffer(slot.buffer), deferred);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // ray tracing

    fn create_acceleration_structure(
        &self,
        name: &str,
        queues: QueueKindMask,
        size: u64,
        ty: vk::AccelerationStructureTypeKHR,
    ) -> Result<(vk::AccelerationStructureKHR, BufferId)> {
        let accel_ext = self.device.vk_khr_accel.as_ref().ok_or_else(|| Error::Configuration {
            name: name.to_string(),
            reason: "device was initialized without ray tracing support".to_string(),
        })?;

        let buffer = self.create_buffer(
            &format!("{name}.storage"),
            queues,
            MemoryLocation::GpuOnly,
            &BufferDesc {
                byte_size: size,
                usage: vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                map_on_create: false,
            },
        )?;

        let create_info = vk::AccelerationStructureCreateInfoKHR {
            buffer: buffer.handle,
            size,
            ty,
            ..Default::default()
        };
        let handle = unsafe {
            accel_ext
                .create_acceleration_structure(&create_info, None)
                .map_err(|e| Error::device("vkCreateAccelerationStructureKHR", e))?
        };
        Ok((handle, buffer.id.take()))
    }

    pub fn create_rt_geometry(
        &self,
        name: &str,
        queues: QueueKindMask,
        desc: &RtGeometryDesc,
    ) -> Result<OwnedRtGeometryId> {
        let (handle, buffer) = self.create_acceleration_structure(
            name,
            queues,
            desc.size,
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
        )?;
        let id = self.tables.write().rt_geometries.insert(RtGeometrySlot {
            handle,
            buffer,
            desc: *desc,
            ref_count: 1,
            name: name.to_string(),
            track: GlobalTrack::default(),
        });
        Ok(Owned::new(id))
    }

    pub fn create_rt_scene(
        &self,
        name: &str,
        queues: QueueKindMask,
        desc: &RtSceneDesc,
    ) -> Result<OwnedRtSceneId> {
        let (handle, buffer) = self.create_acceleration_structure(
            name,
            queues,
            desc.size,
            vk::AccelerationStructureTypeKHR::TOP_LEVEL,
        )?;
        let id = self.tables.write().rt_scenes.insert(RtSceneSlot {
            handle,
            buffer,
            desc: *desc,
            ref_count: 1,
            name: name.to_string(),
            track: GlobalTrack::default(),
        });
        Ok(Owned::new(id))
    }

    pub fn create_rt_pipeline(
        &self,
        name: &str,
        desc: &RayTracingPipelineDesc,
    ) -> Result<OwnedPipelineId> {
        let rt_ext = self
            .device
            .vk_khr_rt_pipeline
            .as_ref()
            .ok_or_else(|| Error::Configuration {
                name: name.to_string(),
                reason: "device was initialized without ray tracing support".to_string(),
            })?;
        let content_hash = structural_hash(desc);
        let modules = self.compile_modules(content_hash, &desc.shaders)?;
        let (layout, layout_handle, sets) =
            self.build_pipeline_layout(&desc.sets, &desc.push_constants)?;

        let stages: Vec<vk::PipelineShaderStageCreateInfo> = modules
            .iter()
            .map(|m| vk::PipelineShaderStageCreateInfo {
                stage: m.stage,
                module: m.module,
                p_name: m.entry.as_ptr(),
                ..Default::default()
            })
            .collect();
        let groups: Vec<vk::RayTracingShaderGroupCreateInfoKHR> = desc
            .groups
            .iter()
            .map(|g| {
                let unused = vk::SHADER_UNUSED_KHR;
                let opt = |s: Option<u32>| s.unwrap_or(unused);
                match *g {
                    RtShaderGroup::General { shader } => vk::RayTracingShaderGroupCreateInfoKHR {
                        ty: vk::RayTracingShaderGroupTypeKHR::GENERAL,
                        general_shader: shader,
                        closest_hit_shader: unused,
                        any_hit_shader: unused,
                        intersection_shader: unused,
                        ..Default::default()
                    },
                    RtShaderGroup::TrianglesHit {
                        closest_hit,
                        any_hit,
                    } => vk::RayTracingShaderGroupCreateInfoKHR {
                        ty: vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP,
                        general_shader: unused,
                        closest_hit_shader: opt(closest_hit),
                        any_hit_shader: opt(any_hit),
                        intersection_shader: unused,
                        ..Default::default()
                    },
                    RtShaderGroup::ProceduralHit {
                        intersection,
                        closest_hit,
                        any_hit,
                    } => vk::RayTracingShaderGroupCreateInfoKHR {
                        ty: vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP,
                        general_shader: unused,
                        closest_hit_shader: opt(closest_hit),
                        any_hit_shader: opt(any_hit),
                        intersection_shader: intersection,
                        ..Default::default()
                    },
                }
            })
            .collect();

        let create_info = vk::RayTracingPipelineCreateInfoKHR {
            stage_count: stages.len() as u32,
            p_stages: stages.as_ptr(),
            group_count: groups.len() as u32,
            p_groups: groups.as_ptr(),
            max_pipeline_ray_recursion_depth: desc.max_recursion_depth.max(1),
            layout: layout_handle,
            ..Default::default()
        };
        let pipeline = unsafe {
            rt_ext
                .create_ray_tracing_pipelines(
                    vk::DeferredOperationKHR::null(),
                    vk::PipelineCache::null(),
                    &[create_info],
                    None,
                )
                .map_err(|e| Error::device("vkCreateRayTracingPipelinesKHR", e))?[0]
        };

        let mut instances = FxHashMap::default();
        instances.insert(0u64, pipeline);
        let id = self.tables.write().pipelines.insert(PipelineSlot {
            kind: PipelineKindSlot::RayTracing(Box::new(desc.clone())),
            bind_point: vk::PipelineBindPoint::RAY_TRACING_KHR,
            layout,
            layout_handle,
            sets,
            modules,
            instances,
            ref_count: 1,
            name: name.to_string(),
        });
        trace!(name, ?id, "created ray tracing pipeline");
        Ok(Owned::new(id))
    }

    /// Shader-group handles of a ray-tracing pipeline, for writing shader
    /// binding tables.
    pub fn rt_shader_group_handles(
        &self,
        pipeline: PipelineId,
        first_group: u32,
        group_count: u32,
    ) -> Result<Vec<u8>> {
        let rt_ext = self
            .device
            .vk_khr_rt_pipeline
            .as_ref()
            .ok_or_else(|| Error::Configuration {
                name: "rt_shader_group_handles".to_string(),
                reason: "device was initialized without ray tracing support".to_string(),
            })?;
        let handle_size = self
            .device
            .rt_pipeline_properties
            .as_ref()
            .map(|p| p.shader_group_handle_size)
            .unwrap_or(32);
        let vk_pipeline = {
            let tables = self.tables.read();
            let slot = tables
                .pipelines
                .get(pipeline)
                .ok_or(Error::StaleHandle { kind: "pipeline" })?;
            *slot.instances.get(&0).ok_or_else(|| Error::Configuration {
                name: slot.name.clone(),
                reason: "pipeline has no ray tracing instance".to_string(),
            })?
        };
        unsafe {
            rt_ext
                .get_ray_tracing_shader_group_handles(
                    vk_pipeline,
                    first_group,
                    group_count,
                    (handle_size * group_count) as usize,
                )
                .map_err(|e| Error::device("vkGetRayTracingShaderGroupHandlesKHR", e))
        }
    }

    // ------------------------------------------------------------------
    // record-time accessors

    pub(crate) fn set_layout_handle(&self, id: DescriptorSetLayoutId) -> Result<vk::DescriptorSetLayout> {
        self.tables
            .read()
            .set_layouts
            .get(id)
            .map(|s| s.handle)
            .ok_or(Error::StaleHandle {
                kind: "descriptor set layout",
            })
    }

    pub(crate) fn sampler_handle(&self, id: SamplerId) -> Result<vk::Sampler> {
        self.tables
            .read()
            .samplers
            .get(id)
            .map(|s| s.handle)
            .ok_or(Error::StaleHandle { kind: "sampler" })
    }

    pub(crate) fn render_pass_record_info(&self, id: RenderPassId) -> Result<(vk::RenderPass, u64)> {
        self.tables
            .read()
            .render_passes
            .get(id)
            .map(|s| (s.handle, s.compat_hash))
            .ok_or(Error::StaleHandle { kind: "render pass" })
    }

    pub(crate) fn pipeline_record_info(&self, id: PipelineId) -> Result<PipelineRecordInfo> {
        let tables = self.tables.read();
        let slot = tables
            .pipelines
            .get(id)
            .ok_or(Error::StaleHandle { kind: "pipeline" })?;
        let vertex_buffer_names = match &slot.kind {
            PipelineKindSlot::Graphics(desc) => {
                desc.vertex_buffers.iter().map(|v| v.name).collect()
            }
            _ => Vec::new(),
        };
        Ok(PipelineRecordInfo {
            name: slot.name.clone(),
            bind_point: slot.bind_point,
            layout_handle: slot.layout_handle,
            vertex_buffer_names,
        })
    }

    pub(crate) fn swapchain_record_info(&self, id: SwapchainId) -> Result<SwapchainRecordInfo> {
        let tables = self.tables.read();
        let slot = tables
            .swapchains
            .get(id)
            .ok_or(Error::StaleHandle { kind: "swapchain" })?;
        let image = *slot
            .images
            .get(slot.current_image as usize)
            .ok_or_else(|| Error::Configuration {
                name: slot.name.clone(),
                reason: "no swapchain image acquired".to_string(),
            })?;
        Ok(SwapchainRecordInfo {
            handle: slot.handle,
            image,
            image_index: slot.current_image,
            format: slot.format.format,
            extent: slot.extent,
            acquire_semaphore: slot.acquire_pending.then_some(slot.acquire_semaphore),
            present_semaphore: slot.present_semaphore,
        })
    }

    /// Marks the pending acquire semaphore as consumed by a batch.
    pub(crate) fn take_swapchain_acquire(&self, id: SwapchainId) {
        if let Some(slot) = self.tables.write().swapchains.get_mut(id) {
            slot.acquire_pending = false;
        }
    }

    pub(crate) fn swapchain_acquire_info(&self, id: SwapchainId) -> Result<(vk::SwapchainKHR, vk::Semaphore)> {
        self.tables
            .read()
            .swapchains
            .get(id)
            .map(|s| (s.handle, s.acquire_semaphore))
            .ok_or(Error::StaleHandle { kind: "swapchain" })
    }

    pub(crate) fn set_swapchain_current(&self, id: SwapchainId, index: u32) -> Result<ImageId> {
        let mut tables = self.tables.write();
        let slot = tables
            .swapchains
            .get_mut(id)
            .ok_or(Error::StaleHandle { kind: "swapchain" })?;
        slot.current_image = index;
        slot.acquire_pending = true;
        slot.images
            .get(index as usize)
            .copied()
            .ok_or(Error::Configuration {
                name: slot.name.clone(),
                reason: format!("acquired image index {index} is out of range"),
            })
    }

    pub(crate) fn swapchain_present_info(&self, id: SwapchainId) -> Result<(vk::SwapchainKHR, u32, vk::Semaphore)> {
        self.tables
            .read()
            .swapchains
            .get(id)
            .map(|s| (s.handle, s.current_image, s.present_semaphore))
            .ok_or(Error::StaleHandle { kind: "swapchain" })
    }

    pub fn describe_swapchain(&self, id: SwapchainId) -> Result<(vk::SurfaceFormatKHR, vk::Extent2D)> {
        self.tables
            .read()
            .swapchains
            .get(id)
            .map(|s| (s.format, s.extent))
            .ok_or(Error::StaleHandle { kind: "swapchain" })
    }

    /// The images of a swapchain, indexable by acquired image index.
    pub fn swapchain_images(&self, id: SwapchainId) -> Result<Vec<ImageId>> {
        self.tables
            .read()
            .swapchains
            .get(id)
            .map(|s| s.images.clone())
            .ok_or(Error::StaleHandle { kind: "swapchain" })
    }

    // ------------------------------------------------------------------
    // cross-recorder tracking state

    pub(crate) fn global_track(&self, res: TrackedResource) -> Result<GlobalTrackSnapshot> {
        let tables = self.tables.read();
        let track = match res {
            TrackedResource::Buffer(id) => tables
                .buffers
                .get(id)
                .map(|s| &s.track)
                .ok_or(Error::StaleHandle { kind: "buffer" })?,
            TrackedResource::Image(id) => tables
                .images
                .get(id)
                .map(|s| &s.track)
                .ok_or(Error::StaleHandle { kind: "image" })?,
            TrackedResource::RtGeometry(id) => tables
                .rt_geometries
                .get(id)
                .map(|s| &s.track)
                .ok_or(Error::StaleHandle { kind: "rt geometry" })?,
            TrackedResource::RtScene(id) => tables
                .rt_scenes
                .get(id)
                .map(|s| &s.track)
                .ok_or(Error::StaleHandle { kind: "rt scene" })?,
        };
        Ok(GlobalTrackSnapshot {
            owner_queue_family: track.owner_queue_family,
            layout: track.layout,
            last_batch: track.last_batch.as_ref().and_then(Weak::upgrade),
        })
    }

    pub(crate) fn commit_track(
        &self,
        res: TrackedResource,
        owner_queue_family: u32,
        layout: vk::ImageLayout,
        batch: &Arc<CmdBatch>,
    ) {
        let mut tables = self.tables.write();
        let track = match res {
            TrackedResource::Buffer(id) => tables.buffers.get_mut(id).map(|s| &mut s.track),
            TrackedResource::Image(id) => tables.images.get_mut(id).map(|s| &mut s.track),
            TrackedResource::RtGeometry(id) => {
                tables.rt_geometries.get_mut(id).map(|s| &mut s.track)
            }
            TrackedResource::RtScene(id) => tables.rt_scenes.get_mut(id).map(|s| &mut s.track),
        };
        if let Some(track) = track {
            track.owner_queue_family = owner_queue_family;
            track.layout = layout;
            track.last_batch = Some(Arc::downgrade(batch));
        }
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        let stats = self.stats();
        if stats != ResourceStats::default() {
            error!(?stats, "resource manager dropped with live resources");
        }
        // free cached shader modules; everything else is the caller's leak
        for (_, modules) in self.module_cache.lock().drain() {
            if let Ok(modules) = Arc::try_unwrap(modules) {
                for m in modules {
                    unsafe { self.device.device.destroy_shader_module(m.module, None) };
                }
            }
        }
    }
}

mod pipeline_instance {
    //! Lazily instantiated `VkPipeline` objects for graphics pipelines.

    use super::ShaderModuleInfo;
    use crate::error::{Error, Result};
    use crate::resource::pipeline::GraphicsPipelineDesc;
    use ash::vk;

    pub(super) fn create_vk_graphics_pipeline(
        device: &ash::Device,
        desc: &GraphicsPipelineDesc,
        modules: &[ShaderModuleInfo],
        layout: vk::PipelineLayout,
        render_pass: vk::RenderPass,
        subpass: u32,
        samples: u32,
        color_attachment_count: u32,
    ) -> Result<vk::Pipeline> {
        let stages: Vec<vk::PipelineShaderStageCreateInfo> = modules
            .iter()
            .map(|m| vk::PipelineShaderStageCreateInfo {
                stage: m.stage,
                module: m.module,
                p_name: m.entry.as_ptr(),
                ..Default::default()
            })
            .collect();

        let mut bindings = Vec::new();
        let mut attributes = Vec::new();
        for (binding, layout) in desc.vertex_buffers.iter().enumerate() {
            bindings.push(vk::VertexInputBindingDescription {
                binding: binding as u32,
                stride: layout.stride,
                input_rate: layout.input_rate,
            });
            for attr in &layout.attributes {
                attributes.push(vk::VertexInputAttributeDescription {
                    location: attr.location,
                    binding: binding as u32,
                    format: attr.format,
                    offset: attr.offset,
                });
            }
        }
        let vertex_input = vk::PipelineVertexInputStateCreateInfo {
            vertex_binding_description_count: bindings.len() as u32,
            p_vertex_binding_descriptions: bindings.as_ptr(),
            vertex_attribute_description_count: attributes.len() as u32,
            p_vertex_attribute_descriptions: attributes.as_ptr(),
            ..Default::default()
        };

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo {
            topology: desc.topology,
            ..Default::default()
        };

        // viewport and scissor are always dynamic; counts still matter
        let viewport = vk::PipelineViewportStateCreateInfo {
            viewport_count: 1,
            scissor_count: 1,
            ..Default::default()
        };

        let rasterization = vk::PipelineRasterizationStateCreateInfo {
            polygon_mode: desc.polygon_mode,
            cull_mode: desc.cull_mode,
            front_face: desc.front_face,
            line_width: 1.0,
            ..Default::default()
        };

        let multisample = vk::PipelineMultisampleStateCreateInfo {
            rasterization_samples: crate::get_vk_sample_count(samples),
            ..Default::default()
        };

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo {
            depth_test_enable: desc.depth_test as u32,
            depth_write_enable: desc.depth_write as u32,
            depth_compare_op: desc.depth_compare_op,
            ..Default::default()
        };

        let blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> = (0
            ..color_attachment_count as usize)
            .map(|i| {
                let b = desc.blend.get(i).copied().unwrap_or_default();
                vk::PipelineColorBlendAttachmentState {
                    blend_enable: b.blend_enable as u32,
                    src_color_blend_factor: b.src_color_blend_factor,
                    dst_color_blend_factor: b.dst_color_blend_factor,
                    color_blend_op: b.color_blend_op,
                    src_alpha_blend_factor: b.src_alpha_blend_factor,
                    dst_alpha_blend_factor: b.dst_alpha_blend_factor,
                    alpha_blend_op: b.alpha_blend_op,
                    color_write_mask: b.color_write_mask,
                }
            })
            .collect();
        let color_blend = vk::PipelineColorBlendStateCreateInfo {
            attachment_count: blend_attachments.len() as u32,
            p_attachments: blend_attachments.as_ptr(),
            ..Default::default()
        };

        let mut dynamic_states = vec![vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        for &s in &desc.dynamic_states {
            if !dynamic_states.contains(&s) {
                dynamic_states.push(s);
            }
        }
        let dynamic_state = vk::PipelineDynamicStateCreateInfo {
            dynamic_state_count: dynamic_states.len() as u32,
            p_dynamic_states: dynamic_states.as_ptr(),
            ..Default::default()
        };

        let create_info = vk::GraphicsPipelineCreateInfo {
            stage_count: stages.len() as u32,
            p_stages: stages.as_ptr(),
            p_vertex_input_state: &vertex_input,
            p_input_assembly_state: &input_assembly,
            p_viewport_state: &viewport,
            p_rasterization_state: &rasterization,
            p_multisample_state: &multisample,
            p_depth_stencil_state: &depth_stencil,
            p_color_blend_state: &color_blend,
            p_dynamic_state: &dynamic_state,
            layout,
            render_pass,
            subpass,
            ..Default::default()
        };

        unsafe {
            device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[create_info], None)
                .map(|pipelines| pipelines[0])
                .map_err(|(_, e)| Error::device("vkCreateGraphicsPipelines", e))
        }
    }
}
