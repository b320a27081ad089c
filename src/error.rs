//! Error taxonomy for the framegraph.
//!
//! Every fallible public operation returns [`Result`]. Device loss and failed
//! queue submissions poison the submission engine; all later submissions fail
//! with [`Error::Poisoned`] until the caller re-initializes.

use ash::vk;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A descriptor or task declaration is malformed (unknown format, bad
    /// dimensions, incompatible attachment, ...). Reported at declaration
    /// time; the operation is dropped.
    #[error("invalid configuration for `{name}`: {reason}")]
    Configuration { name: String, reason: String },

    /// A resource is used in a way its usage flags do not allow.
    #[error("`{name}` is missing usage flag {required}")]
    MissingUsage { name: String, required: &'static str },

    /// The slot table for a resource kind is full.
    #[error("resource slot table for {kind} is full")]
    SlotTableFull { kind: &'static str },

    /// The per-frame staging ring cannot satisfy the request even after
    /// growing to its maximum number of buffers.
    #[error("staging ring out of space ({requested} bytes requested)")]
    StagingExhausted { requested: u64 },

    /// The recorder's descriptor pool has no free sets left.
    #[error("descriptor pool exhausted")]
    DescriptorPoolExhausted,

    /// A Vulkan entry point returned a non-success code.
    #[error("vulkan call `{call}` failed: {result:?}")]
    Device { call: &'static str, result: vk::Result },

    /// Device memory allocation failed.
    #[error("device memory allocation failed: {0}")]
    Allocation(#[from] gpu_allocator::AllocationError),

    /// A stale (released) handle was passed to an operation.
    #[error("stale {kind} handle: generation mismatch")]
    StaleHandle { kind: &'static str },

    /// No registered pipeline compiler accepted the pipeline description.
    #[error("no pipeline compiler accepted `{name}`")]
    NoCompiler { name: String },

    /// An earlier `vkQueueSubmit` failed; the engine refuses further work.
    #[error("submission engine poisoned by an earlier queue-submit failure")]
    Poisoned,
}

impl Error {
    pub(crate) fn device(call: &'static str, result: vk::Result) -> Error {
        Error::Device { call, result }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Contract violations (use-after-release, write to read-only binding) abort
/// in debug builds and are logged and skipped in release builds.
macro_rules! contract_violation {
    ($($arg:tt)*) => {{
        if cfg!(debug_assertions) {
            panic!($($arg)*);
        } else {
            tracing::error!($($arg)*);
        }
    }};
}

pub(crate) use contract_violation;
