//! Buffer allocation and host-to-device staging.

use crate::command::{CommandSubmitter, Recording};
use crate::device::GpuDevice;
use crate::error::{GpuError, Result};
use crate::memory::{allocate_dedicated, free_dedicated, Allocation, AllocationTracker};
use ash::vk;
use slotmap::{new_key_type, SlotMap};
use std::sync::Arc;

new_key_type! {
    /// Generation-checked handle to a buffer owned by a [`BufferAllocator`].
    pub struct BufferHandle;
}

/// Creation parameters recorded for every buffer. Immutable for the buffer's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferMetadata {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub sharing_mode: vk::SharingMode,
    pub properties: vk::MemoryPropertyFlags,
}

#[derive(Debug)]
struct BufferRecord {
    buffer: vk::Buffer,
    allocation: Allocation,
    metadata: BufferMetadata,
    mapped: bool,
}

/// Owns buffers and their dedicated memory.
///
/// Not internally synchronized: wrap it in a `parking_lot::Mutex` to share it between threads.
pub struct BufferAllocator<D: GpuDevice> {
    device: Arc<D>,
    submitter: CommandSubmitter,
    tracker: Arc<AllocationTracker>,
    buffers: SlotMap<BufferHandle, BufferRecord>,
    /// Sources of copies recorded into caller-owned command buffers, freed once the caller
    /// reports the work complete.
    retired: Vec<BufferHandle>,
}

impl<D: GpuDevice> BufferAllocator<D> {
    /// Create an allocator. One-shot transfers go through `submitter`.
    pub fn new(device: Arc<D>, submitter: CommandSubmitter, tracker: Arc<AllocationTracker>) -> Self {
        Self {
            device,
            submitter,
            tracker,
            buffers: SlotMap::with_key(),
            retired: Vec::new(),
        }
    }

    /// Get the device.
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    /// Get the submitter used for one-shot transfers.
    pub fn submitter(&self) -> CommandSubmitter {
        self.submitter
    }

    /// Get the shared allocation tracker.
    pub fn tracker(&self) -> &Arc<AllocationTracker> {
        &self.tracker
    }

    /// Create a buffer of `size` bytes backed by its own memory block.
    pub fn allocate(
        &mut self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        sharing_mode: vk::SharingMode,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<BufferHandle> {
        let create_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(sharing_mode);

        let buffer = self.device.create_buffer(&create_info).map_err(|e| {
            tracing::error!(size, ?usage, "Failed to create buffer: {e}");
            GpuError::creation("buffer")(e)
        })?;

        let requirements = self.device.buffer_memory_requirements(buffer);
        let allocation =
            match allocate_dedicated(&*self.device, &self.tracker, &requirements, properties) {
                Ok(allocation) => allocation,
                Err(e) => {
                    self.device.destroy_buffer(buffer);
                    return Err(e);
                }
            };

        if let Err(e) = self.device.bind_buffer_memory(buffer, allocation.memory, 0) {
            tracing::error!("Failed to bind buffer memory: {e}");
            free_dedicated(&*self.device, &self.tracker, &allocation);
            self.device.destroy_buffer(buffer);
            return Err(GpuError::Bind(e));
        }

        let handle = self.buffers.insert(BufferRecord {
            buffer,
            allocation,
            metadata: BufferMetadata {
                size,
                usage,
                sharing_mode,
                properties,
            },
            mapped: false,
        });

        tracing::debug!(
            ?handle,
            size,
            allocated = allocation.size,
            memory_type = allocation.memory_type,
            "Allocated buffer"
        );

        Ok(handle)
    }

    /// Destroy a buffer and release its memory.
    pub fn free(&mut self, handle: BufferHandle) -> Result<()> {
        let record = self.buffers.remove(handle).ok_or_else(|| {
            tracing::error!(?handle, "Attempted to free unknown buffer");
            GpuError::NotFound(format!("buffer {handle:?}"))
        })?;
        self.retired.retain(|&h| h != handle);
        self.destroy_record(&record);
        tracing::debug!(?handle, "Freed buffer");
        Ok(())
    }

    fn destroy_record(&self, record: &BufferRecord) {
        if record.mapped {
            self.device.unmap_memory(record.allocation.memory);
        }
        self.device.destroy_buffer(record.buffer);
        free_dedicated(&*self.device, &self.tracker, &record.allocation);
    }

    /// Copy a host-visible staging buffer into a new device-local buffer.
    ///
    /// The source must have `TRANSFER_SRC` usage and `HOST_VISIBLE` memory. The new buffer
    /// keeps the source's size and sharing mode, with `TRANSFER_SRC` swapped for
    /// `TRANSFER_DST`. With [`Recording::Into`] the copy only executes when the caller submits,
    /// so a freed source is retired rather than destroyed; see
    /// [`BufferAllocator::free_retired`].
    pub fn promote_to_device_local(
        &mut self,
        handle: BufferHandle,
        free_source: bool,
        recording: Recording,
    ) -> Result<BufferHandle> {
        let source = self.record(handle)?;
        let (src_buffer, meta) = (source.buffer, source.metadata);

        if !meta.usage.contains(vk::BufferUsageFlags::TRANSFER_SRC) {
            return Err(GpuError::Precondition(format!(
                "buffer {handle:?} lacks TRANSFER_SRC usage (usage {:?})",
                meta.usage
            )));
        }
        if !meta.properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            return Err(GpuError::Precondition(format!(
                "buffer {handle:?} is not HOST_VISIBLE (properties {:?})",
                meta.properties
            )));
        }

        let mut usage = meta.usage;
        usage &= !vk::BufferUsageFlags::TRANSFER_SRC;
        usage |= vk::BufferUsageFlags::TRANSFER_DST;

        let promoted = self.allocate(
            meta.size,
            usage,
            meta.sharing_mode,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        let dst_buffer = self.buffers[promoted].buffer;

        let region = vk::BufferCopy::default().size(meta.size);
        let device = Arc::clone(&self.device);
        let copied = self.submitter.record(&*device, recording, |cmd| {
            device.cmd_copy_buffer(cmd, src_buffer, dst_buffer, &[region]);
            Ok(())
        });
        if let Err(e) = copied {
            self.free(promoted)?;
            return Err(e);
        }

        if free_source {
            match recording {
                Recording::Immediate => self.free(handle)?,
                Recording::Into(_) => self.retire(handle)?,
            }
        }

        tracing::debug!(source = ?handle, ?promoted, size = meta.size, "Promoted buffer to device-local memory");
        Ok(promoted)
    }

    /// Create a device-local buffer holding `data` through the staging path.
    ///
    /// `usage` gets `TRANSFER_DST` added; the staging buffer is released afterwards.
    pub fn upload(
        &mut self,
        data: &[u8],
        usage: vk::BufferUsageFlags,
        recording: Recording,
    ) -> Result<BufferHandle> {
        if data.is_empty() {
            return Err(GpuError::Precondition("cannot upload an empty buffer".into()));
        }

        let staging = self.allocate(
            data.len() as vk::DeviceSize,
            usage | vk::BufferUsageFlags::TRANSFER_SRC,
            vk::SharingMode::EXCLUSIVE,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;

        if let Err(e) = self.write_bytes(staging, 0, data) {
            self.free(staging)?;
            return Err(e);
        }

        match self.promote_to_device_local(staging, true, recording) {
            Ok(handle) => Ok(handle),
            Err(e) => {
                self.free(staging)?;
                Err(e)
            }
        }
    }

    /// Map the buffer's memory for host access.
    ///
    /// The slice covers the buffer's requested size. Call [`BufferAllocator::unmap`] when done.
    pub fn map(&mut self, handle: BufferHandle) -> Result<&mut [u8]> {
        let record = self.buffers.get_mut(handle).ok_or_else(|| not_found(handle))?;

        if !record
            .metadata
            .properties
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
        {
            return Err(GpuError::Precondition(format!(
                "buffer {handle:?} is not HOST_VISIBLE"
            )));
        }
        if record.mapped {
            return Err(GpuError::Precondition(format!(
                "buffer {handle:?} is already mapped"
            )));
        }

        let size = record.metadata.size;
        let ptr = self
            .device
            .map_memory(record.allocation.memory, 0, size)
            .map_err(GpuError::MemoryAllocation)?;
        record.mapped = true;

        // SAFETY: the mapping covers `size` bytes and stays valid until unmap, which needs
        // `&mut self` and so cannot happen while this borrow is alive.
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr.cast::<u8>(), size as usize) })
    }

    /// Unmap memory mapped by [`BufferAllocator::map`].
    pub fn unmap(&mut self, handle: BufferHandle) -> Result<()> {
        let record = self.buffers.get_mut(handle).ok_or_else(|| not_found(handle))?;
        if !record.mapped {
            return Err(GpuError::Precondition(format!(
                "buffer {handle:?} is not mapped"
            )));
        }
        self.device.unmap_memory(record.allocation.memory);
        record.mapped = false;
        Ok(())
    }

    /// Map, copy `data` at `offset`, unmap.
    pub fn write_bytes(
        &mut self,
        handle: BufferHandle,
        offset: vk::DeviceSize,
        data: &[u8],
    ) -> Result<()> {
        let size = self.metadata(handle)?.size;
        let end = offset.checked_add(data.len() as vk::DeviceSize);
        if end.map_or(true, |end| end > size) {
            return Err(GpuError::Precondition(format!(
                "write of {} bytes at offset {offset} exceeds buffer size {size}",
                data.len()
            )));
        }

        let mapped = self.map(handle)?;
        let start = offset as usize;
        mapped[start..start + data.len()].copy_from_slice(data);
        self.unmap(handle)
    }

    /// Write a slice of plain-old-data values at `offset`.
    pub fn write<T: bytemuck::Pod>(
        &mut self,
        handle: BufferHandle,
        offset: vk::DeviceSize,
        data: &[T],
    ) -> Result<()> {
        self.write_bytes(handle, offset, bytemuck::cast_slice(data))
    }

    /// Mark a buffer for release once pending GPU work that reads it has completed.
    pub fn retire(&mut self, handle: BufferHandle) -> Result<()> {
        if !self.buffers.contains_key(handle) {
            return Err(not_found(handle));
        }
        if !self.retired.contains(&handle) {
            self.retired.push(handle);
        }
        Ok(())
    }

    /// Free every retired buffer. Call after the command buffers that read them completed.
    pub fn free_retired(&mut self) -> Result<usize> {
        let retired = std::mem::take(&mut self.retired);
        let count = retired.len();
        for handle in retired {
            self.free(handle)?;
        }
        Ok(count)
    }

    /// Number of buffers waiting in [`BufferAllocator::free_retired`].
    pub fn retired_count(&self) -> usize {
        self.retired.len()
    }

    fn record(&self, handle: BufferHandle) -> Result<&BufferRecord> {
        self.buffers.get(handle).ok_or_else(|| not_found(handle))
    }

    /// Raw buffer handle for recording commands.
    pub fn raw(&self, handle: BufferHandle) -> Result<vk::Buffer> {
        self.record(handle).map(|r| r.buffer)
    }

    /// Creation parameters of a buffer.
    pub fn metadata(&self, handle: BufferHandle) -> Result<BufferMetadata> {
        self.record(handle).map(|r| r.metadata)
    }

    /// Backing allocation of a buffer.
    pub fn allocation(&self, handle: BufferHandle) -> Result<Allocation> {
        self.record(handle).map(|r| r.allocation)
    }

    /// Whether `handle` refers to a live buffer.
    pub fn contains(&self, handle: BufferHandle) -> bool {
        self.buffers.contains_key(handle)
    }

    /// Number of live buffers.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Whether no buffers are live.
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Destroy every buffer. The device must be idle.
    pub fn free_all(&mut self) {
        if self.buffers.is_empty() {
            return;
        }
        let records: Vec<BufferRecord> = self.buffers.drain().map(|(_, r)| r).collect();
        for record in &records {
            self.destroy_record(record);
        }
        let count = records.len();
        self.retired.clear();
        tracing::info!(count, "Buffer allocator released all buffers");
    }
}

impl<D: GpuDevice> Drop for BufferAllocator<D> {
    fn drop(&mut self) {
        self.free_all();
    }
}

fn not_found(handle: BufferHandle) -> GpuError {
    GpuError::NotFound(format!("buffer {handle:?}"))
}
