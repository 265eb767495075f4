//! Synchronization primitives.

use crate::device::GpuDevice;
use crate::error::{GpuError, Result};
use ash::vk;

/// Create a semaphore.
pub fn create_semaphore<D: GpuDevice>(device: &D) -> Result<vk::Semaphore> {
    device
        .create_semaphore()
        .map_err(GpuError::creation("semaphore"))
}

/// Create a fence.
pub fn create_fence<D: GpuDevice>(device: &D, signaled: bool) -> Result<vk::Fence> {
    device
        .create_fence(signaled)
        .map_err(GpuError::creation("fence"))
}

/// Wait for a fence to be signaled.
///
/// An expired `timeout_ns` is reported as [`GpuError::Timeout`].
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub fn wait_for_fence<D: GpuDevice>(device: &D, fence: vk::Fence, timeout_ns: u64) -> Result<()> {
    device
        .wait_for_fences(&[fence], timeout_ns)
        .map_err(|e| GpuError::from_wait("fence", e))
}

/// Reset a fence to unsignaled state.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub fn reset_fence<D: GpuDevice>(device: &D, fence: vk::Fence) -> Result<()> {
    device.reset_fences(&[fence])?;
    Ok(())
}

/// Per-slot state of a frame in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSlot {
    pub command_buffer: vk::CommandBuffer,
    /// Signaled by acquisition once the swapchain image may be written.
    pub image_available: vk::Semaphore,
    /// Signaled when the slot's last submission completes. Created signaled.
    pub in_flight: vk::Fence,
}

impl FrameSlot {
    /// Create the slot's semaphore and fence around an allocated command buffer.
    pub fn new<D: GpuDevice>(device: &D, command_buffer: vk::CommandBuffer) -> Result<Self> {
        let image_available = create_semaphore(device)?;
        let in_flight = match create_fence(device, true) {
            Ok(fence) => fence,
            Err(e) => {
                device.destroy_semaphore(image_available);
                return Err(e);
            }
        };
        Ok(Self {
            command_buffer,
            image_available,
            in_flight,
        })
    }

    /// Destroy the fence and semaphore. The command buffer belongs to the pool.
    pub fn destroy<D: GpuDevice>(&self, device: &D) {
        device.destroy_fence(self.in_flight);
        device.destroy_semaphore(self.image_available);
    }
}

/// Per-swapchain-image state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSync {
    /// Signaled by the submission that rendered this image; presentation waits on it.
    pub render_finished: vk::Semaphore,
    /// Fence of the slot that last rendered to this image.
    pub last_fence: Option<vk::Fence>,
}

impl ImageSync {
    /// Create the image's render-finished semaphore.
    pub fn new<D: GpuDevice>(device: &D) -> Result<Self> {
        Ok(Self {
            render_finished: create_semaphore(device)?,
            last_fence: None,
        })
    }

    /// Destroy the semaphore.
    pub fn destroy<D: GpuDevice>(&self, device: &D) {
        device.destroy_semaphore(self.render_finished);
    }
}

/// Create `count` [`ImageSync`]s, destroying the partial set on failure.
pub(crate) fn create_image_syncs<D: GpuDevice>(device: &D, count: usize) -> Result<Vec<ImageSync>> {
    let mut syncs = Vec::with_capacity(count);
    for _ in 0..count {
        match ImageSync::new(device) {
            Ok(sync) => syncs.push(sync),
            Err(e) => {
                for sync in &syncs {
                    sync.destroy(device);
                }
                return Err(e);
            }
        }
    }
    Ok(syncs)
}
