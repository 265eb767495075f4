//! Allocators wired to a [`MockDevice`].

use crate::mock::MockDevice;
use crate::presenter::MockPresenter;
use crate::Result;
use stagecraft_gpu::{
    AllocationTracker, BufferAllocator, BufferHandle, CommandPool, CommandSubmitter,
    FramePipeline, FramePipelineConfig, GpuDevice, ImageAllocator,
};
use std::sync::Arc;

/// A mock device with a command pool and both allocators sharing one tracker.
pub struct TestRig {
    pub device: Arc<MockDevice>,
    pub tracker: Arc<AllocationTracker>,
    pub pool: CommandPool,
    pub buffers: BufferAllocator<MockDevice>,
    pub images: ImageAllocator<MockDevice>,
}

impl TestRig {
    /// Rig over a [`MockDevice::new`] device.
    pub fn new() -> Result<Self> {
        Self::with_device(MockDevice::new())
    }

    /// Rig over a configured device.
    pub fn with_device(device: MockDevice) -> Result<Self> {
        crate::init_tracing();

        let device = Arc::new(device);
        let tracker = Arc::new(AllocationTracker::new());
        let pool = CommandPool::new(&*device, device.graphics_queue_family())?;
        let submitter = CommandSubmitter::for_graphics(&*device, pool);

        Ok(Self {
            buffers: BufferAllocator::new(Arc::clone(&device), submitter, Arc::clone(&tracker)),
            images: ImageAllocator::new(Arc::clone(&device), submitter, Arc::clone(&tracker)),
            device,
            tracker,
            pool,
        })
    }

    /// Build a frame pipeline presenting through `presenter`.
    pub fn frame_pipeline(
        &mut self,
        presenter: MockPresenter,
        config: FramePipelineConfig,
    ) -> Result<FramePipeline<MockDevice, MockPresenter>> {
        Ok(FramePipeline::new(
            Arc::clone(&self.device),
            presenter,
            self.pool,
            &mut self.images,
            config,
        )?)
    }

    /// Bytes of a buffer's backing memory, truncated to the buffer's requested size.
    pub fn buffer_contents(&self, handle: BufferHandle) -> Result<Vec<u8>> {
        let allocation = self.buffers.allocation(handle)?;
        let size = self.buffers.metadata(handle)?.size as usize;
        let mut bytes = self
            .device
            .memory_contents(allocation.memory)
            .unwrap_or_default();
        bytes.truncate(size);
        Ok(bytes)
    }
}

impl Drop for TestRig {
    fn drop(&mut self) {
        self.buffers.free_all();
        self.images.shutdown();
        self.pool.destroy(&*self.device);
    }
}
