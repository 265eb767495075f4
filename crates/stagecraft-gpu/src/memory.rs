//! Dedicated device-memory allocation.
//!
//! Every buffer and image owns exactly one `vk::DeviceMemory` block sized from the device's
//! reported requirements and bound at offset 0. There is no sub-allocation.

use crate::device::GpuDevice;
use crate::error::{GpuError, Result};
use ash::vk;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Pick the lowest-indexed memory type allowed by `type_bits` whose property flags contain
/// `required`.
pub fn select_memory_type(
    properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Option<u32> {
    let count = properties.memory_type_count.min(vk::MAX_MEMORY_TYPES as u32);
    (0..count).find(|&i| {
        type_bits & (1 << i) != 0
            && properties.memory_types[i as usize]
                .property_flags
                .contains(required)
    })
}

/// Indices of every memory type allowed by `type_bits`, for diagnostics.
pub(crate) fn allowed_type_indices(type_bits: u32) -> Vec<u32> {
    (0..32).filter(|i| type_bits & (1 << i) != 0).collect()
}

/// Backing memory of one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub memory: vk::DeviceMemory,
    /// Size the device asked for, which may exceed the requested resource size.
    pub size: vk::DeviceSize,
    pub alignment: vk::DeviceSize,
    pub memory_type: u32,
}

/// Allocate a dedicated block satisfying `requirements` and `required` flags.
///
/// The block is registered with `tracker` on success.
pub(crate) fn allocate_dedicated<D: GpuDevice>(
    device: &D,
    tracker: &AllocationTracker,
    requirements: &vk::MemoryRequirements,
    required: vk::MemoryPropertyFlags,
) -> Result<Allocation> {
    let properties = device.memory_properties();
    tracing::debug!(
        size = requirements.size,
        alignment = requirements.alignment,
        allowed = ?allowed_type_indices(requirements.memory_type_bits),
        "Memory requirements"
    );

    let memory_type = select_memory_type(&properties, requirements.memory_type_bits, required)
        .ok_or(GpuError::NoCompatibleMemoryType {
            type_bits: requirements.memory_type_bits,
            required,
        })?;

    let alloc_info = vk::MemoryAllocateInfo::default()
        .allocation_size(requirements.size)
        .memory_type_index(memory_type);

    let memory = device.allocate_memory(&alloc_info).map_err(|e| {
        tracing::error!(size = requirements.size, memory_type, "Memory allocation failed: {e}");
        GpuError::MemoryAllocation(e)
    })?;

    tracker.record(memory, requirements.size, memory_type);

    Ok(Allocation {
        memory,
        size: requirements.size,
        alignment: requirements.alignment,
        memory_type,
    })
}

/// Release a block allocated by [`allocate_dedicated`].
pub(crate) fn free_dedicated<D: GpuDevice>(
    device: &D,
    tracker: &AllocationTracker,
    allocation: &Allocation,
) {
    tracker.release(allocation.memory);
    device.free_memory(allocation.memory);
}

#[derive(Debug, Default)]
struct TrackerState {
    live: HashMap<vk::DeviceMemory, (vk::DeviceSize, u32)>,
    live_bytes: vk::DeviceSize,
    peak_bytes: vk::DeviceSize,
}

/// Size bookkeeping for every live device-memory block.
///
/// Shared between allocators through an `Arc`; the map is guarded by a mutex so both
/// allocators may be driven from different threads.
#[derive(Debug, Default)]
pub struct AllocationTracker {
    state: Mutex<TrackerState>,
}

impl AllocationTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, memory: vk::DeviceMemory, size: vk::DeviceSize, memory_type: u32) {
        let mut state = self.state.lock();
        state.live.insert(memory, (size, memory_type));
        state.live_bytes += size;
        state.peak_bytes = state.peak_bytes.max(state.live_bytes);
    }

    fn release(&self, memory: vk::DeviceMemory) {
        let mut state = self.state.lock();
        if let Some((size, _)) = state.live.remove(&memory) {
            state.live_bytes -= size;
        } else {
            tracing::warn!(?memory, "Releasing untracked device memory");
        }
    }

    /// Number of live blocks.
    pub fn live_allocations(&self) -> usize {
        self.state.lock().live.len()
    }

    /// Total bytes currently allocated.
    pub fn live_bytes(&self) -> vk::DeviceSize {
        self.state.lock().live_bytes
    }

    /// Highest value [`AllocationTracker::live_bytes`] has reached.
    pub fn peak_bytes(&self) -> vk::DeviceSize {
        self.state.lock().peak_bytes
    }

    /// Live bytes per memory type index.
    pub fn bytes_by_memory_type(&self) -> HashMap<u32, vk::DeviceSize> {
        let state = self.state.lock();
        let mut totals = HashMap::new();
        for &(size, memory_type) in state.live.values() {
            *totals.entry(memory_type).or_insert(0) += size;
        }
        totals
    }
}

impl Drop for AllocationTracker {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for (memory, (size, memory_type)) in &state.live {
            tracing::warn!(?memory, size, memory_type, "Device memory leaked");
        }
    }
}
