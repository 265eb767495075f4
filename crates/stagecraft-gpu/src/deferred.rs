//! Deferred resource deletion for multi-frame-in-flight rendering.
//!
//! With several frames in flight a buffer or image may still be read by an earlier frame when
//! the caller is done with it. The queue holds such resources until enough frames have passed.

use crate::buffer::{BufferAllocator, BufferHandle};
use crate::device::GpuDevice;
use crate::error::Result;
use crate::image::{ImageAllocator, ImageHandle};
use std::collections::VecDeque;

/// A resource awaiting deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retired {
    Buffer(BufferHandle),
    /// Freeing the image also destroys its views.
    Image(ImageHandle),
}

impl From<BufferHandle> for Retired {
    fn from(handle: BufferHandle) -> Self {
        Self::Buffer(handle)
    }
}

impl From<ImageHandle> for Retired {
    fn from(handle: ImageHandle) -> Self {
        Self::Image(handle)
    }
}

/// A resource pending deletion.
#[derive(Debug, Clone, Copy)]
pub struct PendingDeletion {
    pub resource: Retired,
    /// Frame number when this resource was queued.
    pub frame_queued: u64,
}

/// Queue for deferred deletions.
///
/// Resources are queued with a frame number and only freed once enough frames have passed to
/// guarantee no in-flight frame still uses them.
#[derive(Debug)]
pub struct DeferredDeletionQueue {
    pending: VecDeque<PendingDeletion>,
    frames_in_flight: usize,
}

impl DeferredDeletionQueue {
    /// Create a queue that holds resources for `frames_in_flight` frames.
    pub fn new(frames_in_flight: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            frames_in_flight,
        }
    }

    /// Queue a buffer or image for deletion.
    pub fn queue(&mut self, resource: impl Into<Retired>, frame_number: u64) {
        self.pending.push_back(PendingDeletion {
            resource: resource.into(),
            frame_queued: frame_number,
        });
    }

    /// Free resources that are safe to delete. Returns how many were freed.
    ///
    /// Call at the start of each frame, after the frame's fence wait.
    pub fn process<D: GpuDevice>(
        &mut self,
        buffers: &mut BufferAllocator<D>,
        images: &mut ImageAllocator<D>,
        current_frame_number: u64,
    ) -> Result<usize> {
        let cutoff = current_frame_number.saturating_sub(self.frames_in_flight as u64);

        // Queue order is FIFO and frame numbers are non-decreasing, so only the front can mature.
        let mut freed = 0;
        while let Some(pending) = self.pending.front().copied() {
            if pending.frame_queued >= cutoff {
                break;
            }
            self.pending.pop_front();
            free(buffers, images, pending.resource)?;
            freed += 1;
        }

        if freed > 0 {
            tracing::trace!(freed, remaining = self.pending.len(), "Processed deferred deletions");
        }
        Ok(freed)
    }

    /// Free every pending resource immediately.
    ///
    /// Call during shutdown after `device_wait_idle`.
    pub fn flush<D: GpuDevice>(
        &mut self,
        buffers: &mut BufferAllocator<D>,
        images: &mut ImageAllocator<D>,
    ) -> Result<()> {
        while let Some(pending) = self.pending.pop_front() {
            free(buffers, images, pending.resource)?;
        }
        Ok(())
    }

    /// Get the number of pending deletions.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Update the frames in flight count.
    pub fn set_frames_in_flight(&mut self, frames_in_flight: usize) {
        self.frames_in_flight = frames_in_flight;
    }
}

fn free<D: GpuDevice>(
    buffers: &mut BufferAllocator<D>,
    images: &mut ImageAllocator<D>,
    resource: Retired,
) -> Result<()> {
    match resource {
        Retired::Buffer(handle) => buffers.free(handle),
        Retired::Image(handle) => images.free_image(handle),
    }
}
