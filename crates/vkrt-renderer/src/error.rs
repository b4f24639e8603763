//! Error types for the ray tracing renderer.

use ash::vk;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for renderer setup and frame submission.
#[derive(Error, Debug)]
pub enum RtError {
    /// A Vulkan call failed
    #[error("{context} failed: {result:?}")]
    Vulkan {
        context: &'static str,
        result: vk::Result,
    },

    /// GPU memory allocation failed
    #[error("GPU allocation failed: {0}")]
    Allocation(#[from] gpu_allocator::AllocationError),

    /// A precompiled shader binary could not be read
    #[error("Failed to load shader {path}: {source}")]
    ShaderLoad {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No physical device meets the ray tracing requirements
    #[error("Unsupported device: {0}")]
    UnsupportedDevice(String),

    /// An instance references a mesh without a bottom-level structure
    #[error("Instance {instance} references mesh {mesh}, but only {mesh_count} bottom-level structures exist")]
    MissingBottomLevel {
        instance: usize,
        mesh: u32,
        mesh_count: usize,
    },

    /// A buffer was used as a device address source without address usage
    #[error("Buffer '{0}' has no device address")]
    MissingDeviceAddress(&'static str),

    /// The driver returned fewer shader group handle bytes than requested
    #[error("Shader group handle data too short: expected {expected} bytes, got {actual}")]
    HandleData { expected: usize, actual: usize },

    /// Host write to a buffer that is unmapped or too small
    #[error("Cannot write {len} bytes at offset {offset}: {reason}")]
    HostWrite {
        offset: u64,
        len: usize,
        reason: &'static str,
    },

    /// Surface or window handle error
    #[error("Surface error: {0}")]
    Surface(String),

    /// Invalid run-time configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for renderer operations.
pub type Result<T, E = RtError> = std::result::Result<T, E>;

/// Attach call-site context to a raw Vulkan result.
pub trait VkResultExt<T> {
    fn context(self, context: &'static str) -> Result<T>;
}

impl<T> VkResultExt<T> for std::result::Result<T, vk::Result> {
    fn context(self, context: &'static str) -> Result<T> {
        self.map_err(|result| RtError::Vulkan { context, result })
    }
}
