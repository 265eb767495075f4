//! Recording mock of [`GpuDevice`].
//!
//! Every call is logged as a [`DeviceCall`]. Memory is backed by host byte arrays so mapped
//! writes and recorded copies can be read back. Submissions stay pending until a fence wait or
//! idle wait completes them, which lets tests observe hazards that a real device would race on.

use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use parking_lot::Mutex;
use stagecraft_gpu::{GpuDevice, SubmitBatch};
use std::collections::{HashMap, HashSet};
use std::ffi::c_void;

/// Memory types exposed by [`MockDevice::new`], in index order.
pub const DEFAULT_MEMORY_TYPES: [vk::MemoryPropertyFlags; 4] = [
    vk::MemoryPropertyFlags::DEVICE_LOCAL,
    vk::MemoryPropertyFlags::from_raw(
        vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw() | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
    ),
    vk::MemoryPropertyFlags::from_raw(
        vk::MemoryPropertyFlags::DEVICE_LOCAL.as_raw()
            | vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw()
            | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
    ),
    vk::MemoryPropertyFlags::from_raw(
        vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw()
            | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw()
            | vk::MemoryPropertyFlags::HOST_CACHED.as_raw(),
    ),
];

/// Alignment reported for every resource. Sizes are rounded up to it.
pub const DEFAULT_ALIGNMENT: vk::DeviceSize = 256;

/// One barrier of a recorded [`DeviceCall::PipelineBarrier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierRecord {
    pub image: vk::Image,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub layer_count: u32,
}

/// One region of a recorded [`DeviceCall::CopyBufferToImage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageCopyRecord {
    pub buffer_offset: vk::DeviceSize,
    pub layer: u32,
    pub width: u32,
    pub height: u32,
}

/// One descriptor of a recorded [`DeviceCall::UpdateDescriptorSets`].
///
/// Handles the write does not carry are null.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorWriteRecord {
    pub set: vk::DescriptorSet,
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub buffer: vk::Buffer,
    pub offset: vk::DeviceSize,
    pub range: vk::DeviceSize,
    pub image_view: vk::ImageView,
    pub sampler: vk::Sampler,
    pub image_layout: vk::ImageLayout,
}

/// A device call as seen by the mock.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCall {
    CreateBuffer {
        buffer: vk::Buffer,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        sharing_mode: vk::SharingMode,
    },
    DestroyBuffer(vk::Buffer),
    BindBufferMemory {
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    },
    CreateImage {
        image: vk::Image,
        width: u32,
        height: u32,
        array_layers: u32,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        tiling: vk::ImageTiling,
    },
    DestroyImage(vk::Image),
    BindImageMemory {
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    },
    CreateImageView {
        view: vk::ImageView,
        image: vk::Image,
        view_type: vk::ImageViewType,
        layer_count: u32,
    },
    DestroyImageView(vk::ImageView),
    CreateSampler(vk::Sampler),
    DestroySampler(vk::Sampler),
    AllocateMemory {
        memory: vk::DeviceMemory,
        size: vk::DeviceSize,
        memory_type: u32,
    },
    FreeMemory(vk::DeviceMemory),
    MapMemory {
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    },
    UnmapMemory(vk::DeviceMemory),
    CreateCommandPool(vk::CommandPool),
    DestroyCommandPool(vk::CommandPool),
    ResetCommandPool(vk::CommandPool),
    AllocateCommandBuffers(Vec<vk::CommandBuffer>),
    FreeCommandBuffers(Vec<vk::CommandBuffer>),
    BeginCommandBuffer(vk::CommandBuffer),
    EndCommandBuffer(vk::CommandBuffer),
    ResetCommandBuffer(vk::CommandBuffer),
    CopyBuffer {
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        size: vk::DeviceSize,
    },
    CopyBufferToImage {
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        regions: Vec<ImageCopyRecord>,
    },
    PipelineBarrier {
        cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        barriers: Vec<BarrierRecord>,
    },
    BeginRenderPass {
        cmd: vk::CommandBuffer,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        clear_values: usize,
    },
    EndRenderPass(vk::CommandBuffer),
    QueueSubmit {
        command_buffers: Vec<vk::CommandBuffer>,
        wait_semaphores: Vec<vk::Semaphore>,
        wait_stages: Vec<vk::PipelineStageFlags>,
        signal_semaphores: Vec<vk::Semaphore>,
        fence: vk::Fence,
    },
    QueueWaitIdle,
    DeviceWaitIdle,
    CreateFence {
        fence: vk::Fence,
        signaled: bool,
    },
    DestroyFence(vk::Fence),
    WaitForFences {
        fences: Vec<vk::Fence>,
        timeout_ns: u64,
    },
    ResetFences(Vec<vk::Fence>),
    CreateSemaphore(vk::Semaphore),
    DestroySemaphore(vk::Semaphore),
    CreateRenderPass {
        render_pass: vk::RenderPass,
        formats: Vec<vk::Format>,
    },
    DestroyRenderPass(vk::RenderPass),
    CreateFramebuffer {
        framebuffer: vk::Framebuffer,
        attachments: Vec<vk::ImageView>,
        width: u32,
        height: u32,
    },
    DestroyFramebuffer(vk::Framebuffer),
    CreateDescriptorSetLayout {
        layout: vk::DescriptorSetLayout,
        bindings: Vec<(u32, vk::DescriptorType)>,
    },
    DestroyDescriptorSetLayout(vk::DescriptorSetLayout),
    CreateDescriptorPool {
        pool: vk::DescriptorPool,
        max_sets: u32,
        sizes: Vec<(vk::DescriptorType, u32)>,
        flags: vk::DescriptorPoolCreateFlags,
    },
    DestroyDescriptorPool(vk::DescriptorPool),
    ResetDescriptorPool(vk::DescriptorPool),
    AllocateDescriptorSets {
        pool: vk::DescriptorPool,
        layouts: Vec<vk::DescriptorSetLayout>,
        sets: Vec<vk::DescriptorSet>,
    },
    FreeDescriptorSets {
        pool: vk::DescriptorPool,
        sets: Vec<vk::DescriptorSet>,
    },
    UpdateDescriptorSets(Vec<DescriptorWriteRecord>),
}

/// Calls that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    CreateBuffer,
    CreateImage,
    AllocateMemory,
    BindBufferMemory,
    BindImageMemory,
    MapMemory,
    BeginCommandBuffer,
    QueueSubmit,
    WaitForFences,
    CreateFence,
    CreateSemaphore,
    CreateRenderPass,
    CreateFramebuffer,
    CreateDescriptorSetLayout,
    CreateDescriptorPool,
    AllocateDescriptorSets,
}

/// A synchronization misuse detected by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// A command buffer was reset or re-begun while a submission using it was pending.
    CommandBufferResetWhilePending(vk::CommandBuffer),
    /// A fence was reset while its submission was pending.
    FenceResetWhilePending(vk::Fence),
    /// Two pending submissions rendered to the same framebuffer.
    FramebufferTargetedConcurrently(vk::Framebuffer),
    /// A fence was submitted while still signaled or still pending.
    FenceNotReset(vk::Fence),
    /// Memory without `HOST_VISIBLE` was mapped.
    MappedDeviceLocalMemory(vk::DeviceMemory),
    /// A fence wait could never complete.
    WaitOnUnsubmittedFence(vk::Fence),
    /// A set was allocated with a layout that does not exist.
    UnknownDescriptorSetLayout(vk::DescriptorSetLayout),
    /// A set was freed to a pool that did not allocate it or cannot free sets.
    BadDescriptorSetFree(vk::DescriptorSet),
    /// A descriptor write targeted a set that is not live.
    WriteToDeadDescriptorSet(vk::DescriptorSet),
}

#[derive(Debug, Clone, Copy)]
struct Injection {
    result: vk::Result,
    skip: usize,
    once: bool,
}

#[derive(Debug)]
struct MemoryBlock {
    bytes: Box<[u8]>,
    memory_type: u32,
    mapped: bool,
}

#[derive(Debug, Clone, Copy)]
enum PendingOp {
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        region: vk::BufferCopy,
    },
}

#[derive(Debug, Default)]
struct Recording {
    framebuffers: Vec<vk::Framebuffer>,
    ops: Vec<PendingOp>,
}

#[derive(Debug)]
struct Submission {
    fence: vk::Fence,
    command_buffers: Vec<vk::CommandBuffer>,
    framebuffers: Vec<vk::Framebuffer>,
}

#[derive(Debug)]
struct DescriptorPoolState {
    max_sets: u32,
    can_free: bool,
    sets: HashSet<vk::DescriptorSet>,
}

#[derive(Debug)]
struct State {
    next_handle: u64,
    calls: Vec<DeviceCall>,
    memory_types: Vec<vk::MemoryPropertyFlags>,
    buffer_type_bits: u32,
    image_type_bits: u32,
    alignment: vk::DeviceSize,
    supported_formats: Vec<vk::Format>,
    memory: HashMap<vk::DeviceMemory, MemoryBlock>,
    buffers: HashMap<vk::Buffer, vk::DeviceSize>,
    buffer_memory: HashMap<vk::Buffer, vk::DeviceMemory>,
    images: HashMap<vk::Image, vk::DeviceSize>,
    fences: HashMap<vk::Fence, bool>,
    descriptor_layouts: HashSet<vk::DescriptorSetLayout>,
    descriptor_pools: HashMap<vk::DescriptorPool, DescriptorPoolState>,
    recordings: HashMap<vk::CommandBuffer, Recording>,
    pending: Vec<Submission>,
    live: HashSet<u64>,
    failures: HashMap<FailPoint, Injection>,
    violations: Vec<Violation>,
}

impl State {
    fn next<H: Handle>(&mut self) -> H {
        self.next_handle += 1;
        self.live.insert(self.next_handle);
        H::from_raw(self.next_handle)
    }

    fn release<H: Handle>(&mut self, handle: H) {
        self.live.remove(&handle.as_raw());
    }

    fn check(&mut self, point: FailPoint) -> VkResult<()> {
        let Some(injection) = self.failures.get_mut(&point) else {
            return Ok(());
        };
        if injection.skip > 0 {
            injection.skip -= 1;
            return Ok(());
        }
        let result = injection.result;
        if injection.once {
            self.failures.remove(&point);
        }
        tracing::debug!(?point, ?result, "Injected failure");
        Err(result)
    }

    fn violate(&mut self, violation: Violation) {
        tracing::warn!(?violation, "Synchronization violation");
        self.violations.push(violation);
    }

    fn is_pending(&self, cmd: vk::CommandBuffer) -> bool {
        self.pending.iter().any(|s| s.command_buffers.contains(&cmd))
    }

    fn complete_where(&mut self, done: impl Fn(&Submission) -> bool) {
        let (finished, pending): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.pending).into_iter().partition(|s| done(s));
        self.pending = pending;
        for submission in finished {
            if submission.fence != vk::Fence::null() {
                self.fences.insert(submission.fence, true);
            }
        }
    }

    fn execute(&mut self, op: PendingOp) {
        let PendingOp::CopyBuffer { src, dst, region } = op;
        let (Some(&src_mem), Some(&dst_mem)) =
            (self.buffer_memory.get(&src), self.buffer_memory.get(&dst))
        else {
            return;
        };
        let Some(src_block) = self.memory.get(&src_mem) else {
            return;
        };
        let start = region.src_offset as usize;
        let len = region.size as usize;
        let Some(data) = src_block.bytes.get(start..start + len).map(<[u8]>::to_vec) else {
            return;
        };
        if let Some(dst_block) = self.memory.get_mut(&dst_mem) {
            let start = region.dst_offset as usize;
            if let Some(target) = dst_block.bytes.get_mut(start..start + len) {
                target.copy_from_slice(&data);
            }
        }
    }

    fn round_up(&self, size: vk::DeviceSize) -> vk::DeviceSize {
        size.div_ceil(self.alignment) * self.alignment
    }
}

/// A [`GpuDevice`] that records calls and simulates fences, memory and submissions.
#[derive(Debug)]
pub struct MockDevice {
    state: Mutex<State>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    /// Device with [`DEFAULT_MEMORY_TYPES`], every depth format supported.
    pub fn new() -> Self {
        Self::with_memory_types(&DEFAULT_MEMORY_TYPES)
    }

    /// Device exposing `types` as memory types 0.., all allowed for every resource.
    pub fn with_memory_types(types: &[vk::MemoryPropertyFlags]) -> Self {
        let all_bits = if types.len() >= 32 {
            u32::MAX
        } else {
            (1u32 << types.len()) - 1
        };
        Self {
            state: Mutex::new(State {
                next_handle: 0x1000,
                calls: Vec::new(),
                memory_types: types.to_vec(),
                buffer_type_bits: all_bits,
                image_type_bits: all_bits,
                alignment: DEFAULT_ALIGNMENT,
                supported_formats: vec![
                    vk::Format::D32_SFLOAT,
                    vk::Format::D32_SFLOAT_S8_UINT,
                    vk::Format::D24_UNORM_S8_UINT,
                ],
                memory: HashMap::new(),
                buffers: HashMap::new(),
                buffer_memory: HashMap::new(),
                images: HashMap::new(),
                fences: HashMap::new(),
                descriptor_layouts: HashSet::new(),
                descriptor_pools: HashMap::new(),
                recordings: HashMap::new(),
                pending: Vec::new(),
                live: HashSet::new(),
                failures: HashMap::new(),
                violations: Vec::new(),
            }),
        }
    }

    /// Restrict the memory types reported for buffers.
    pub fn set_buffer_type_bits(&self, bits: u32) {
        self.state.lock().buffer_type_bits = bits;
    }

    /// Restrict the memory types reported for images.
    pub fn set_image_type_bits(&self, bits: u32) {
        self.state.lock().image_type_bits = bits;
    }

    /// Formats for which [`GpuDevice::find_supported_format`] succeeds.
    pub fn set_supported_formats(&self, formats: &[vk::Format]) {
        self.state.lock().supported_formats = formats.to_vec();
    }

    /// Make `point` fail with `result` until [`MockDevice::clear_failures`].
    pub fn fail(&self, point: FailPoint, result: vk::Result) {
        self.inject(point, result, 0, false);
    }

    /// Make the next call at `point` fail with `result`.
    pub fn fail_once(&self, point: FailPoint, result: vk::Result) {
        self.inject(point, result, 0, true);
    }

    /// Let `skip` calls at `point` through, then fail the next one with `result`.
    pub fn fail_after(&self, point: FailPoint, skip: usize, result: vk::Result) {
        self.inject(point, result, skip, true);
    }

    fn inject(&self, point: FailPoint, result: vk::Result, skip: usize, once: bool) {
        self.state
            .lock()
            .failures
            .insert(point, Injection { result, skip, once });
    }

    /// Remove every injected failure.
    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// Every call so far.
    pub fn calls(&self) -> Vec<DeviceCall> {
        self.state.lock().calls.clone()
    }

    /// Calls matching `filter`.
    pub fn calls_matching(&self, filter: impl Fn(&DeviceCall) -> bool) -> Vec<DeviceCall> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| filter(c))
            .cloned()
            .collect()
    }

    /// Number of calls matching `filter`.
    pub fn count(&self, filter: impl Fn(&DeviceCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| filter(c)).count()
    }

    /// Forget recorded calls, keeping device state.
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Synchronization misuse observed so far.
    pub fn violations(&self) -> Vec<Violation> {
        self.state.lock().violations.clone()
    }

    /// Whether `fence` is signaled.
    pub fn is_signaled(&self, fence: vk::Fence) -> bool {
        self.state.lock().fences.get(&fence).copied().unwrap_or(false)
    }

    /// Number of submissions the device has not completed.
    pub fn pending_submissions(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Number of live device memory blocks.
    pub fn live_memory_blocks(&self) -> usize {
        self.state.lock().memory.len()
    }

    /// Number of created objects not yet destroyed, across every handle type.
    pub fn live_objects(&self) -> usize {
        self.state.lock().live.len()
    }

    /// Number of sets currently allocated from `pool`.
    pub fn live_descriptor_sets(&self, pool: vk::DescriptorPool) -> usize {
        self.state
            .lock()
            .descriptor_pools
            .get(&pool)
            .map_or(0, |p| p.sets.len())
    }

    /// Contents of a memory block.
    pub fn memory_contents(&self, memory: vk::DeviceMemory) -> Option<Vec<u8>> {
        self.state
            .lock()
            .memory
            .get(&memory)
            .map(|block| block.bytes.to_vec())
    }

    /// Memory type a block was allocated from.
    pub fn memory_type_of(&self, memory: vk::DeviceMemory) -> Option<u32> {
        self.state.lock().memory.get(&memory).map(|b| b.memory_type)
    }

    fn log(&self, call: DeviceCall) {
        self.state.lock().calls.push(call);
    }
}

impl GpuDevice for MockDevice {
    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties {
        let state = self.state.lock();
        let mut properties = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: state.memory_types.len().min(vk::MAX_MEMORY_TYPES) as u32,
            memory_heap_count: 1,
            ..Default::default()
        };
        for (slot, &flags) in properties.memory_types.iter_mut().zip(&state.memory_types) {
            *slot = vk::MemoryType {
                property_flags: flags,
                heap_index: 0,
            };
        }
        properties.memory_heaps[0] = vk::MemoryHeap {
            size: 1 << 30,
            flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
        };
        properties
    }

    fn graphics_queue(&self) -> vk::Queue {
        vk::Queue::from_raw(0x1)
    }

    fn graphics_queue_family(&self) -> u32 {
        0
    }

    fn find_supported_format(
        &self,
        candidates: &[vk::Format],
        _tiling: vk::ImageTiling,
        _features: vk::FormatFeatureFlags,
    ) -> Option<vk::Format> {
        let state = self.state.lock();
        candidates
            .iter()
            .copied()
            .find(|f| state.supported_formats.contains(f))
    }

    fn create_buffer(&self, info: &vk::BufferCreateInfo<'_>) -> VkResult<vk::Buffer> {
        let mut state = self.state.lock();
        state.check(FailPoint::CreateBuffer)?;
        let buffer = state.next();
        state.buffers.insert(buffer, info.size);
        state.calls.push(DeviceCall::CreateBuffer {
            buffer,
            size: info.size,
            usage: info.usage,
            sharing_mode: info.sharing_mode,
        });
        Ok(buffer)
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let mut state = self.state.lock();
        state.buffers.remove(&buffer);
        state.buffer_memory.remove(&buffer);
        state.release(buffer);
        state.calls.push(DeviceCall::DestroyBuffer(buffer));
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        let state = self.state.lock();
        let size = state.buffers.get(&buffer).copied().unwrap_or(0);
        vk::MemoryRequirements {
            size: state.round_up(size),
            alignment: state.alignment,
            memory_type_bits: state.buffer_type_bits,
        }
    }

    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()> {
        let mut state = self.state.lock();
        state.check(FailPoint::BindBufferMemory)?;
        state.buffer_memory.insert(buffer, memory);
        state.calls.push(DeviceCall::BindBufferMemory {
            buffer,
            memory,
            offset,
        });
        Ok(())
    }

    fn create_image(&self, info: &vk::ImageCreateInfo<'_>) -> VkResult<vk::Image> {
        let mut state = self.state.lock();
        state.check(FailPoint::CreateImage)?;
        let image = state.next();
        let texels = u64::from(info.extent.width)
            * u64::from(info.extent.height)
            * u64::from(info.array_layers);
        state.images.insert(image, texels * 4);
        state.calls.push(DeviceCall::CreateImage {
            image,
            width: info.extent.width,
            height: info.extent.height,
            array_layers: info.array_layers,
            format: info.format,
            usage: info.usage,
            tiling: info.tiling,
        });
        Ok(image)
    }

    fn destroy_image(&self, image: vk::Image) {
        let mut state = self.state.lock();
        state.images.remove(&image);
        state.release(image);
        state.calls.push(DeviceCall::DestroyImage(image));
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        let state = self.state.lock();
        let size = state.images.get(&image).copied().unwrap_or(0);
        vk::MemoryRequirements {
            size: state.round_up(size),
            alignment: state.alignment,
            memory_type_bits: state.image_type_bits,
        }
    }

    fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()> {
        let mut state = self.state.lock();
        state.check(FailPoint::BindImageMemory)?;
        state.calls.push(DeviceCall::BindImageMemory {
            image,
            memory,
            offset,
        });
        Ok(())
    }

    fn create_image_view(&self, info: &vk::ImageViewCreateInfo<'_>) -> VkResult<vk::ImageView> {
        let mut state = self.state.lock();
        let view = state.next();
        state.calls.push(DeviceCall::CreateImageView {
            view,
            image: info.image,
            view_type: info.view_type,
            layer_count: info.subresource_range.layer_count,
        });
        Ok(view)
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        let mut state = self.state.lock();
        state.release(view);
        state.calls.push(DeviceCall::DestroyImageView(view));
    }

    fn create_sampler(&self, _info: &vk::SamplerCreateInfo<'_>) -> VkResult<vk::Sampler> {
        let mut state = self.state.lock();
        let sampler = state.next();
        state.calls.push(DeviceCall::CreateSampler(sampler));
        Ok(sampler)
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        let mut state = self.state.lock();
        state.release(sampler);
        state.calls.push(DeviceCall::DestroySampler(sampler));
    }

    fn allocate_memory(&self, info: &vk::MemoryAllocateInfo<'_>) -> VkResult<vk::DeviceMemory> {
        let mut state = self.state.lock();
        state.check(FailPoint::AllocateMemory)?;
        let memory = state.next();
        let size = usize::try_from(info.allocation_size)
            .map_err(|_| vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)?;
        state.memory.insert(
            memory,
            MemoryBlock {
                bytes: vec![0; size].into_boxed_slice(),
                memory_type: info.memory_type_index,
                mapped: false,
            },
        );
        state.calls.push(DeviceCall::AllocateMemory {
            memory,
            size: info.allocation_size,
            memory_type: info.memory_type_index,
        });
        Ok(memory)
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        let mut state = self.state.lock();
        state.memory.remove(&memory);
        state.release(memory);
        state.calls.push(DeviceCall::FreeMemory(memory));
    }

    fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<*mut c_void> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.check(FailPoint::MapMemory)?;
        state.calls.push(DeviceCall::MapMemory {
            memory,
            offset,
            size,
        });

        let host_visible = state
            .memory
            .get(&memory)
            .and_then(|b| state.memory_types.get(b.memory_type as usize))
            .is_some_and(|flags| flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE));
        if !host_visible {
            state.violate(Violation::MappedDeviceLocalMemory(memory));
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }

        let block = state
            .memory
            .get_mut(&memory)
            .ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        let start = usize::try_from(offset).map_err(|_| vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        let end = usize::try_from(offset + size).map_err(|_| vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        if block.mapped || end > block.bytes.len() {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        block.mapped = true;
        // The boxed slice never moves while the block lives, so the pointer stays valid.
        Ok(block.bytes[start..].as_mut_ptr().cast())
    }

    fn unmap_memory(&self, memory: vk::DeviceMemory) {
        let mut state = self.state.lock();
        if let Some(block) = state.memory.get_mut(&memory) {
            block.mapped = false;
        }
        state.calls.push(DeviceCall::UnmapMemory(memory));
    }

    fn create_command_pool(
        &self,
        _queue_family: u32,
        _flags: vk::CommandPoolCreateFlags,
    ) -> VkResult<vk::CommandPool> {
        let mut state = self.state.lock();
        let pool = state.next();
        state.calls.push(DeviceCall::CreateCommandPool(pool));
        Ok(pool)
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state.lock();
        state.release(pool);
        state.calls.push(DeviceCall::DestroyCommandPool(pool));
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> VkResult<()> {
        self.log(DeviceCall::ResetCommandPool(pool));
        Ok(())
    }

    fn allocate_command_buffers(
        &self,
        _pool: vk::CommandPool,
        _level: vk::CommandBufferLevel,
        count: u32,
    ) -> VkResult<Vec<vk::CommandBuffer>> {
        let mut state = self.state.lock();
        let buffers: Vec<vk::CommandBuffer> = (0..count).map(|_| state.next()).collect();
        state.calls.push(DeviceCall::AllocateCommandBuffers(buffers.clone()));
        Ok(buffers)
    }

    fn free_command_buffers(&self, _pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        let mut state = self.state.lock();
        for &cmd in buffers {
            if state.is_pending(cmd) {
                state.violate(Violation::CommandBufferResetWhilePending(cmd));
            }
            state.recordings.remove(&cmd);
            state.release(cmd);
        }
        state.calls.push(DeviceCall::FreeCommandBuffers(buffers.to_vec()));
    }

    fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        _flags: vk::CommandBufferUsageFlags,
    ) -> VkResult<()> {
        let mut state = self.state.lock();
        state.check(FailPoint::BeginCommandBuffer)?;
        if state.is_pending(cmd) {
            state.violate(Violation::CommandBufferResetWhilePending(cmd));
        }
        state.recordings.insert(cmd, Recording::default());
        state.calls.push(DeviceCall::BeginCommandBuffer(cmd));
        Ok(())
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        self.log(DeviceCall::EndCommandBuffer(cmd));
        Ok(())
    }

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        let mut state = self.state.lock();
        if state.is_pending(cmd) {
            state.violate(Violation::CommandBufferResetWhilePending(cmd));
        }
        state.recordings.remove(&cmd);
        state.calls.push(DeviceCall::ResetCommandBuffer(cmd));
        Ok(())
    }

    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        let mut state = self.state.lock();
        let recording = state.recordings.entry(cmd).or_default();
        for &region in regions {
            recording.ops.push(PendingOp::CopyBuffer { src, dst, region });
        }
        state.calls.push(DeviceCall::CopyBuffer {
            cmd,
            src,
            dst,
            size: regions.iter().map(|r| r.size).sum(),
        });
    }

    fn cmd_copy_buffer_to_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        self.log(DeviceCall::CopyBufferToImage {
            cmd,
            src,
            dst,
            layout: dst_layout,
            regions: regions
                .iter()
                .map(|r| ImageCopyRecord {
                    buffer_offset: r.buffer_offset,
                    layer: r.image_subresource.base_array_layer,
                    width: r.image_extent.width,
                    height: r.image_extent.height,
                })
                .collect(),
        });
    }

    fn cmd_pipeline_barrier(
        &self,
        cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        image_barriers: &[vk::ImageMemoryBarrier<'_>],
    ) {
        self.log(DeviceCall::PipelineBarrier {
            cmd,
            src_stage,
            dst_stage,
            barriers: image_barriers
                .iter()
                .map(|b| BarrierRecord {
                    image: b.image,
                    old_layout: b.old_layout,
                    new_layout: b.new_layout,
                    src_access: b.src_access_mask,
                    dst_access: b.dst_access_mask,
                    layer_count: b.subresource_range.layer_count,
                })
                .collect(),
        });
    }

    fn cmd_begin_render_pass(&self, cmd: vk::CommandBuffer, info: &vk::RenderPassBeginInfo<'_>) {
        let mut state = self.state.lock();
        state
            .recordings
            .entry(cmd)
            .or_default()
            .framebuffers
            .push(info.framebuffer);
        state.calls.push(DeviceCall::BeginRenderPass {
            cmd,
            render_pass: info.render_pass,
            framebuffer: info.framebuffer,
            clear_values: info.clear_value_count as usize,
        });
    }

    fn cmd_end_render_pass(&self, cmd: vk::CommandBuffer) {
        self.log(DeviceCall::EndRenderPass(cmd));
    }

    fn queue_submit(
        &self,
        _queue: vk::Queue,
        batch: &SubmitBatch<'_>,
        fence: vk::Fence,
    ) -> VkResult<()> {
        let mut state = self.state.lock();
        state.check(FailPoint::QueueSubmit)?;

        if fence != vk::Fence::null() {
            let already_used = state.fences.get(&fence).copied().unwrap_or(false)
                || state.pending.iter().any(|s| s.fence == fence);
            if already_used {
                state.violate(Violation::FenceNotReset(fence));
            }
        }

        let mut framebuffers = Vec::new();
        let mut ops = Vec::new();
        for cmd in batch.command_buffers {
            if let Some(recording) = state.recordings.get(cmd) {
                framebuffers.extend(recording.framebuffers.iter().copied());
                ops.extend(recording.ops.iter().copied());
            }
        }
        for &framebuffer in &framebuffers {
            if state
                .pending
                .iter()
                .any(|s| s.framebuffers.contains(&framebuffer))
            {
                state.violate(Violation::FramebufferTargetedConcurrently(framebuffer));
            }
        }
        // Transfers land at submission; readers only look at memory after a wait anyway.
        for op in ops {
            state.execute(op);
        }

        state.pending.push(Submission {
            fence,
            command_buffers: batch.command_buffers.to_vec(),
            framebuffers,
        });
        state.calls.push(DeviceCall::QueueSubmit {
            command_buffers: batch.command_buffers.to_vec(),
            wait_semaphores: batch.wait_semaphores.to_vec(),
            wait_stages: batch.wait_stages.to_vec(),
            signal_semaphores: batch.signal_semaphores.to_vec(),
            fence,
        });
        Ok(())
    }

    fn queue_wait_idle(&self, _queue: vk::Queue) -> VkResult<()> {
        let mut state = self.state.lock();
        state.complete_where(|_| true);
        state.calls.push(DeviceCall::QueueWaitIdle);
        Ok(())
    }

    fn device_wait_idle(&self) -> VkResult<()> {
        let mut state = self.state.lock();
        state.complete_where(|_| true);
        state.calls.push(DeviceCall::DeviceWaitIdle);
        Ok(())
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let mut state = self.state.lock();
        state.check(FailPoint::CreateFence)?;
        let fence = state.next();
        state.fences.insert(fence, signaled);
        state.calls.push(DeviceCall::CreateFence { fence, signaled });
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        state.fences.remove(&fence);
        state.release(fence);
        state.calls.push(DeviceCall::DestroyFence(fence));
    }

    fn wait_for_fences(&self, fences: &[vk::Fence], timeout_ns: u64) -> VkResult<()> {
        let mut state = self.state.lock();
        state.calls.push(DeviceCall::WaitForFences {
            fences: fences.to_vec(),
            timeout_ns,
        });
        state.check(FailPoint::WaitForFences)?;

        state.complete_where(|s| fences.contains(&s.fence));
        for &fence in fences {
            if !state.fences.get(&fence).copied().unwrap_or(false) {
                state.violate(Violation::WaitOnUnsubmittedFence(fence));
                return Err(vk::Result::TIMEOUT);
            }
        }
        Ok(())
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> VkResult<()> {
        let mut state = self.state.lock();
        for &fence in fences {
            if state.pending.iter().any(|s| s.fence == fence) {
                state.violate(Violation::FenceResetWhilePending(fence));
            }
            state.fences.insert(fence, false);
        }
        state.calls.push(DeviceCall::ResetFences(fences.to_vec()));
        Ok(())
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let mut state = self.state.lock();
        state.check(FailPoint::CreateSemaphore)?;
        let semaphore = state.next();
        state.calls.push(DeviceCall::CreateSemaphore(semaphore));
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.state.lock();
        state.release(semaphore);
        state.calls.push(DeviceCall::DestroySemaphore(semaphore));
    }

    fn create_render_pass(&self, info: &vk::RenderPassCreateInfo<'_>) -> VkResult<vk::RenderPass> {
        let mut state = self.state.lock();
        state.check(FailPoint::CreateRenderPass)?;
        let render_pass = state.next();
        // SAFETY: the create info borrows a live attachment slice for the duration of this call.
        let formats = unsafe { attachment_formats(info) };
        state.calls.push(DeviceCall::CreateRenderPass {
            render_pass,
            formats,
        });
        Ok(render_pass)
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        let mut state = self.state.lock();
        state.release(render_pass);
        state.calls.push(DeviceCall::DestroyRenderPass(render_pass));
    }

    fn create_framebuffer(
        &self,
        info: &vk::FramebufferCreateInfo<'_>,
    ) -> VkResult<vk::Framebuffer> {
        let mut state = self.state.lock();
        state.check(FailPoint::CreateFramebuffer)?;
        let framebuffer = state.next();
        // SAFETY: as above, the attachment slice outlives the create info.
        let attachments = unsafe { framebuffer_attachments(info) };
        state.calls.push(DeviceCall::CreateFramebuffer {
            framebuffer,
            attachments,
            width: info.width,
            height: info.height,
        });
        Ok(framebuffer)
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        let mut state = self.state.lock();
        state.release(framebuffer);
        state.calls.push(DeviceCall::DestroyFramebuffer(framebuffer));
    }

    fn create_descriptor_set_layout(
        &self,
        info: &vk::DescriptorSetLayoutCreateInfo<'_>,
    ) -> VkResult<vk::DescriptorSetLayout> {
        let mut state = self.state.lock();
        state.check(FailPoint::CreateDescriptorSetLayout)?;
        let layout = state.next();
        state.descriptor_layouts.insert(layout);
        // SAFETY: the create info borrows a live binding slice for the duration of this call.
        let bindings = unsafe { layout_bindings(info) };
        state
            .calls
            .push(DeviceCall::CreateDescriptorSetLayout { layout, bindings });
        Ok(layout)
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        let mut state = self.state.lock();
        state.descriptor_layouts.remove(&layout);
        state.release(layout);
        state.calls.push(DeviceCall::DestroyDescriptorSetLayout(layout));
    }

    fn create_descriptor_pool(
        &self,
        info: &vk::DescriptorPoolCreateInfo<'_>,
    ) -> VkResult<vk::DescriptorPool> {
        let mut state = self.state.lock();
        state.check(FailPoint::CreateDescriptorPool)?;
        let pool = state.next();
        state.descriptor_pools.insert(
            pool,
            DescriptorPoolState {
                max_sets: info.max_sets,
                can_free: info
                    .flags
                    .contains(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET),
                sets: HashSet::new(),
            },
        );
        // SAFETY: as above, the pool size slice outlives the create info.
        let sizes = unsafe { pool_sizes(info) };
        state.calls.push(DeviceCall::CreateDescriptorPool {
            pool,
            max_sets: info.max_sets,
            sizes,
            flags: info.flags,
        });
        Ok(pool)
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        let mut state = self.state.lock();
        if let Some(removed) = state.descriptor_pools.remove(&pool) {
            for set in removed.sets {
                state.release(set);
            }
        }
        state.release(pool);
        state.calls.push(DeviceCall::DestroyDescriptorPool(pool));
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> VkResult<()> {
        let mut state = self.state.lock();
        let sets: Vec<vk::DescriptorSet> = state
            .descriptor_pools
            .get_mut(&pool)
            .map(|p| p.sets.drain().collect())
            .unwrap_or_default();
        for set in sets {
            state.release(set);
        }
        state.calls.push(DeviceCall::ResetDescriptorPool(pool));
        Ok(())
    }

    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> VkResult<Vec<vk::DescriptorSet>> {
        let mut state = self.state.lock();
        state.check(FailPoint::AllocateDescriptorSets)?;
        for &layout in layouts {
            if !state.descriptor_layouts.contains(&layout) {
                state.violate(Violation::UnknownDescriptorSetLayout(layout));
            }
        }
        let room = state
            .descriptor_pools
            .get(&pool)
            .map_or(0, |p| (p.max_sets as usize).saturating_sub(p.sets.len()));
        if layouts.len() > room {
            return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY);
        }

        let sets: Vec<vk::DescriptorSet> = layouts.iter().map(|_| state.next()).collect();
        if let Some(p) = state.descriptor_pools.get_mut(&pool) {
            p.sets.extend(sets.iter().copied());
        }
        state.calls.push(DeviceCall::AllocateDescriptorSets {
            pool,
            layouts: layouts.to_vec(),
            sets: sets.clone(),
        });
        Ok(sets)
    }

    fn free_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        sets: &[vk::DescriptorSet],
    ) -> VkResult<()> {
        let mut state = self.state.lock();
        for &set in sets {
            let freed = state
                .descriptor_pools
                .get_mut(&pool)
                .is_some_and(|p| p.can_free && p.sets.remove(&set));
            if freed {
                state.release(set);
            } else {
                state.violate(Violation::BadDescriptorSetFree(set));
            }
        }
        state.calls.push(DeviceCall::FreeDescriptorSets {
            pool,
            sets: sets.to_vec(),
        });
        Ok(())
    }

    fn update_descriptor_sets(&self, writes: &[vk::WriteDescriptorSet<'_>]) {
        let mut state = self.state.lock();
        // SAFETY: every write borrows live info slices for the duration of this call.
        let records = unsafe { descriptor_writes(writes) };
        for record in &records {
            let live = state
                .descriptor_pools
                .values()
                .any(|p| p.sets.contains(&record.set));
            if !live {
                state.violate(Violation::WriteToDeadDescriptorSet(record.set));
            }
        }
        state.calls.push(DeviceCall::UpdateDescriptorSets(records));
    }
}

/// Formats of a render pass create info's attachments.
///
/// # Safety
/// `p_attachments` must point at `attachment_count` valid descriptions.
unsafe fn attachment_formats(info: &vk::RenderPassCreateInfo<'_>) -> Vec<vk::Format> {
    if info.attachment_count == 0 || info.p_attachments.is_null() {
        return Vec::new();
    }
    let attachments = unsafe {
        std::slice::from_raw_parts(info.p_attachments, info.attachment_count as usize)
    };
    attachments.iter().map(|a| a.format).collect()
}

/// Image views of a framebuffer create info.
///
/// # Safety
/// `p_attachments` must point at `attachment_count` valid views.
unsafe fn framebuffer_attachments(info: &vk::FramebufferCreateInfo<'_>) -> Vec<vk::ImageView> {
    if info.attachment_count == 0 || info.p_attachments.is_null() {
        return Vec::new();
    }
    unsafe { std::slice::from_raw_parts(info.p_attachments, info.attachment_count as usize) }
        .to_vec()
}

/// Binding numbers and types of a descriptor set layout create info.
///
/// # Safety
/// `p_bindings` must point at `binding_count` valid bindings.
unsafe fn layout_bindings(
    info: &vk::DescriptorSetLayoutCreateInfo<'_>,
) -> Vec<(u32, vk::DescriptorType)> {
    if info.binding_count == 0 || info.p_bindings.is_null() {
        return Vec::new();
    }
    unsafe { std::slice::from_raw_parts(info.p_bindings, info.binding_count as usize) }
        .iter()
        .map(|b| (b.binding, b.descriptor_type))
        .collect()
}

/// Pool sizes of a descriptor pool create info.
///
/// # Safety
/// `p_pool_sizes` must point at `pool_size_count` valid sizes.
unsafe fn pool_sizes(info: &vk::DescriptorPoolCreateInfo<'_>) -> Vec<(vk::DescriptorType, u32)> {
    if info.pool_size_count == 0 || info.p_pool_sizes.is_null() {
        return Vec::new();
    }
    unsafe { std::slice::from_raw_parts(info.p_pool_sizes, info.pool_size_count as usize) }
        .iter()
        .map(|s| (s.ty, s.descriptor_count))
        .collect()
}

/// One record per descriptor written.
///
/// # Safety
/// Each write's buffer or image info pointer must cover `descriptor_count` entries.
unsafe fn descriptor_writes(writes: &[vk::WriteDescriptorSet<'_>]) -> Vec<DescriptorWriteRecord> {
    let mut records = Vec::new();
    for write in writes {
        let count = write.descriptor_count as usize;
        let blank = DescriptorWriteRecord {
            set: write.dst_set,
            binding: write.dst_binding,
            descriptor_type: write.descriptor_type,
            buffer: vk::Buffer::null(),
            offset: 0,
            range: 0,
            image_view: vk::ImageView::null(),
            sampler: vk::Sampler::null(),
            image_layout: vk::ImageLayout::UNDEFINED,
        };
        if !write.p_buffer_info.is_null() {
            let infos = unsafe { std::slice::from_raw_parts(write.p_buffer_info, count) };
            records.extend(infos.iter().map(|info| DescriptorWriteRecord {
                buffer: info.buffer,
                offset: info.offset,
                range: info.range,
                ..blank
            }));
        } else if !write.p_image_info.is_null() {
            let infos = unsafe { std::slice::from_raw_parts(write.p_image_info, count) };
            records.extend(infos.iter().map(|info| DescriptorWriteRecord {
                image_view: info.image_view,
                sampler: info.sampler,
                image_layout: info.image_layout,
                ..blank
            }));
        } else {
            records.push(blank);
        }
    }
    records
}
