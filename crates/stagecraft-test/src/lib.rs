//! Test support for stagecraft.
//!
//! Provides a recording mock device, a scriptable presenter and fixtures for driving the
//! allocators and the frame pipeline without a GPU.

pub mod fixtures;
pub mod mock;
pub mod presenter;
pub mod rig;

pub use fixtures::FixtureDir;
pub use mock::{
    BarrierRecord, DescriptorWriteRecord, DeviceCall, FailPoint, ImageCopyRecord, MockDevice,
    Violation, DEFAULT_ALIGNMENT, DEFAULT_MEMORY_TYPES,
};
pub use presenter::{Acquire, MockPresenter};
pub use rig::TestRig;

use stagecraft_gpu::GpuError;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

#[derive(Error, Debug)]
pub enum TestError {
    #[error("GPU error: {0}")]
    Gpu(#[from] GpuError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

pub type Result<T> = std::result::Result<T, TestError>;

/// Route `tracing` output to the test writer. Safe to call from every test.
///
/// Filtered by `RUST_LOG`, defaulting to `warn`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}
