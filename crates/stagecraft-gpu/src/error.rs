//! GPU error types.

use ash::vk;
use std::path::PathBuf;
use thiserror::Error;

/// GPU-related errors.
///
/// Every failure is fatal for the operation that produced it. Nothing half-built is left
/// reachable through a handle when one of these is returned.
#[derive(Error, Debug)]
pub enum GpuError {
    /// The device rejected a create call.
    #[error("Failed to create {resource}: {result}")]
    ResourceCreation {
        resource: &'static str,
        result: vk::Result,
    },

    /// No memory type satisfies both the allowed-type bitmask and the required property flags.
    #[error("No compatible memory type (allowed bits {type_bits:#b}, required {required:?})")]
    NoCompatibleMemoryType {
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
    },

    /// Device memory allocation or mapping failed.
    #[error("Memory allocation failed: {0}")]
    MemoryAllocation(vk::Result),

    /// Binding memory to a buffer or image failed.
    #[error("Failed to bind memory: {0}")]
    Bind(vk::Result),

    /// The caller violated a documented precondition.
    #[error("Precondition violated: {0}")]
    Precondition(String),

    /// Beginning, ending or submitting a command buffer failed.
    #[error("Command recording failed: {0}")]
    CommandRecord(vk::Result),

    /// Free or lookup on an unknown or stale handle.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// A bounded wait expired.
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    /// The swapchain no longer matches the surface and must be rebuilt.
    #[error("Swapchain out of date")]
    SwapchainOutOfDate,

    /// Image file could not be read or decoded.
    #[error("Failed to load image {path}: {message}")]
    ImageLoad { path: PathBuf, message: String },

    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// Swapchain creation failed.
    #[error("Swapchain creation failed: {0}")]
    SwapchainCreation(String),

    /// Pipeline creation failed.
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl GpuError {
    /// Shorthand for a [`GpuError::ResourceCreation`] mapper.
    pub(crate) fn creation(resource: &'static str) -> impl FnOnce(vk::Result) -> Self {
        move |result| Self::ResourceCreation { resource, result }
    }

    /// Map a wait result, separating an expired timeout from other failures.
    pub(crate) fn from_wait(what: &'static str, result: vk::Result) -> Self {
        if result == vk::Result::TIMEOUT {
            Self::Timeout(what)
        } else {
            Self::Vulkan(result)
        }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;
