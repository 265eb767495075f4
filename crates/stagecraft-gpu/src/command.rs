//! Command buffer management.

use crate::device::{GpuDevice, SubmitBatch};
use crate::error::{GpuError, Result};
use ash::vk;

/// Command pool for allocating command buffers.
///
/// A plain handle pair; whoever called [`CommandPool::new`] calls [`CommandPool::destroy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandPool {
    pool: vk::CommandPool,
    queue_family: u32,
}

impl CommandPool {
    /// Create a pool whose buffers can be reset individually.
    pub fn new<D: GpuDevice>(device: &D, queue_family: u32) -> Result<Self> {
        let pool = device
            .create_command_pool(
                queue_family,
                vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            )
            .map_err(GpuError::creation("command pool"))?;

        Ok(Self { pool, queue_family })
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    /// Get the queue family index.
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Allocate a single primary command buffer.
    pub fn allocate_command_buffer<D: GpuDevice>(&self, device: &D) -> Result<vk::CommandBuffer> {
        let buffers = self.allocate_command_buffers(device, 1)?;
        buffers
            .first()
            .copied()
            .ok_or_else(|| GpuError::Other("Device returned no command buffers".into()))
    }

    /// Allocate `count` primary command buffers.
    pub fn allocate_command_buffers<D: GpuDevice>(
        &self,
        device: &D,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        device
            .allocate_command_buffers(self.pool, vk::CommandBufferLevel::PRIMARY, count)
            .map_err(GpuError::creation("command buffer"))
    }

    /// Return command buffers to the pool.
    pub fn free_command_buffers<D: GpuDevice>(&self, device: &D, buffers: &[vk::CommandBuffer]) {
        if !buffers.is_empty() {
            device.free_command_buffers(self.pool, buffers);
        }
    }

    /// Reset the command pool.
    ///
    /// No command buffer from this pool may be pending execution.
    pub fn reset<D: GpuDevice>(&self, device: &D) -> Result<()> {
        device.reset_command_pool(self.pool)?;
        Ok(())
    }

    /// Destroy the command pool.
    pub fn destroy<D: GpuDevice>(&self, device: &D) {
        device.destroy_command_pool(self.pool);
    }
}

/// Begin recording a command buffer.
pub fn begin_command_buffer<D: GpuDevice>(
    device: &D,
    cmd: vk::CommandBuffer,
    flags: vk::CommandBufferUsageFlags,
) -> Result<()> {
    device
        .begin_command_buffer(cmd, flags)
        .map_err(GpuError::CommandRecord)
}

/// End recording a command buffer.
pub fn end_command_buffer<D: GpuDevice>(device: &D, cmd: vk::CommandBuffer) -> Result<()> {
    device
        .end_command_buffer(cmd)
        .map_err(GpuError::CommandRecord)
}

/// Submit command buffers to a queue.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub fn submit_command_buffers<D: GpuDevice>(
    device: &D,
    queue: vk::Queue,
    batch: &SubmitBatch<'_>,
    fence: vk::Fence,
) -> Result<()> {
    device
        .queue_submit(queue, batch, fence)
        .map_err(GpuError::CommandRecord)
}

/// Execute a single-time command buffer and block until the queue is idle.
///
/// The buffer is freed whether or not recording succeeds.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub fn execute_single_time_commands<D, F, T>(
    device: &D,
    pool: &CommandPool,
    queue: vk::Queue,
    f: F,
) -> Result<T>
where
    D: GpuDevice,
    F: FnOnce(vk::CommandBuffer) -> Result<T>,
{
    let cmd = pool.allocate_command_buffer(device)?;

    let result = (|| -> Result<T> {
        begin_command_buffer(device, cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        let value = f(cmd)?;
        end_command_buffer(device, cmd)?;

        let command_buffers = [cmd];
        let batch = SubmitBatch {
            command_buffers: &command_buffers,
            ..SubmitBatch::default()
        };
        submit_command_buffers(device, queue, &batch, vk::Fence::null())?;
        device.queue_wait_idle(queue)?;
        Ok(value)
    })();

    pool.free_command_buffers(device, &[cmd]);

    result
}

/// Where recorded commands go.
///
/// Both allocators and the frame pipeline take one of these: either an already-open command
/// buffer owned by the caller, or a one-shot buffer submitted synchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Recording {
    /// Record into a buffer the caller has begun and will submit.
    Into(vk::CommandBuffer),
    /// Allocate, record, submit, wait for queue idle, free.
    ///
    /// Blocks the calling thread. Invoking it per resource in a loop serializes the queue.
    #[default]
    Immediate,
}

impl From<vk::CommandBuffer> for Recording {
    fn from(cmd: vk::CommandBuffer) -> Self {
        Self::Into(cmd)
    }
}

impl From<Option<vk::CommandBuffer>> for Recording {
    fn from(cmd: Option<vk::CommandBuffer>) -> Self {
        cmd.map_or(Self::Immediate, Self::Into)
    }
}

/// Pool and queue used for [`Recording::Immediate`] work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSubmitter {
    pool: CommandPool,
    queue: vk::Queue,
}

impl CommandSubmitter {
    /// Create a submitter over `pool` and `queue`.
    pub fn new(pool: CommandPool, queue: vk::Queue) -> Self {
        Self { pool, queue }
    }

    /// Create a submitter on the device's graphics queue.
    pub fn for_graphics<D: GpuDevice>(device: &D, pool: CommandPool) -> Self {
        Self::new(pool, device.graphics_queue())
    }

    /// Pool used for one-shot buffers.
    pub fn pool(&self) -> CommandPool {
        self.pool
    }

    /// Queue one-shot buffers are submitted to.
    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    /// Run `f` against the command buffer selected by `recording`.
    pub fn record<D, F, T>(&self, device: &D, recording: Recording, f: F) -> Result<T>
    where
        D: GpuDevice,
        F: FnOnce(vk::CommandBuffer) -> Result<T>,
    {
        match recording {
            Recording::Into(cmd) => f(cmd),
            Recording::Immediate => {
                tracing::trace!("Submitting one-shot command buffer");
                execute_single_time_commands(device, &self.pool, self.queue, f)
            }
        }
    }
}
