use ash::vk;
use stagecraft_gpu::{GpuDevice, GpuError, Recording, SubmitBatch};
use stagecraft_test::{DeviceCall, FailPoint, MockDevice, TestRig};

const STAGING: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
    vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw() | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
);

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}

#[test]
fn host_visible_write_reads_back() {
    let mut rig = TestRig::new().unwrap();
    let data = pattern(300);

    let buffer = rig
        .buffers
        .allocate(
            data.len() as u64,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            vk::SharingMode::EXCLUSIVE,
            STAGING,
        )
        .unwrap();
    rig.buffers.write_bytes(buffer, 0, &data).unwrap();

    assert_eq!(rig.buffer_contents(buffer).unwrap(), data);

    let mapped = rig.buffers.map(buffer).unwrap();
    assert_eq!(mapped.len(), 300);
    assert_eq!(&mapped[..4], &data[..4]);
    rig.buffers.unmap(buffer).unwrap();
}

#[test]
fn pod_write_lands_at_offset() {
    let mut rig = TestRig::new().unwrap();
    let buffer = rig
        .buffers
        .allocate(64, vk::BufferUsageFlags::STORAGE_BUFFER, vk::SharingMode::EXCLUSIVE, STAGING)
        .unwrap();

    rig.buffers.write(buffer, 16, &[1.0f32, 2.0, 3.0]).unwrap();

    let contents = rig.buffer_contents(buffer).unwrap();
    let expected: &[u8] = bytemuck::cast_slice(&[1.0f32, 2.0, 3.0]);
    assert_eq!(&contents[16..28], expected);
    assert!(contents[..16].iter().all(|&b| b == 0));
}

#[test]
fn write_past_end_is_rejected() {
    let mut rig = TestRig::new().unwrap();
    let buffer = rig
        .buffers
        .allocate(16, vk::BufferUsageFlags::UNIFORM_BUFFER, vk::SharingMode::EXCLUSIVE, STAGING)
        .unwrap();

    let err = rig.buffers.write_bytes(buffer, 8, &[0; 16]).unwrap_err();
    assert!(matches!(err, GpuError::Precondition(_)));
    assert_eq!(rig.device.count(|c| matches!(c, DeviceCall::MapMemory { .. })), 0);
}

#[test]
fn metadata_matches_creation_parameters() {
    let mut rig = TestRig::new().unwrap();
    let cases = [
        (100, vk::BufferUsageFlags::VERTEX_BUFFER, vk::SharingMode::EXCLUSIVE, STAGING),
        (
            4096,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            vk::SharingMode::CONCURRENT,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ),
        (1, vk::BufferUsageFlags::TRANSFER_SRC, vk::SharingMode::EXCLUSIVE, vk::MemoryPropertyFlags::HOST_CACHED),
    ];

    for (size, usage, sharing_mode, properties) in cases {
        let handle = rig.buffers.allocate(size, usage, sharing_mode, properties).unwrap();
        let meta = rig.buffers.metadata(handle).unwrap();
        assert_eq!(meta.size, size);
        assert_eq!(meta.usage, usage);
        assert_eq!(meta.sharing_mode, sharing_mode);
        assert_eq!(meta.properties, properties);

        let allocation = rig.buffers.allocation(handle).unwrap();
        assert_eq!(allocation.size, size.div_ceil(256) * 256);
        assert_eq!(allocation.alignment, 256);
    }

    let created: Vec<_> = rig
        .device
        .calls_matching(|c| matches!(c, DeviceCall::CreateBuffer { .. }))
        .into_iter()
        .map(|c| match c {
            DeviceCall::CreateBuffer { size, usage, sharing_mode, .. } => (size, usage, sharing_mode),
            _ => unreachable!(),
        })
        .collect();
    assert_eq!(
        created,
        cases.map(|(size, usage, sharing, _)| (size, usage, sharing)).to_vec()
    );
}

#[test]
fn memory_type_selection_is_lowest_matching_index() {
    let mut rig = TestRig::new().unwrap();
    let expectations = [
        (vk::MemoryPropertyFlags::DEVICE_LOCAL, 0),
        (vk::MemoryPropertyFlags::HOST_VISIBLE, 1),
        (STAGING, 1),
        (vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_VISIBLE, 2),
        (vk::MemoryPropertyFlags::HOST_CACHED, 3),
    ];

    for _ in 0..3 {
        for (properties, expected) in expectations {
            let handle = rig
                .buffers
                .allocate(64, vk::BufferUsageFlags::UNIFORM_BUFFER, vk::SharingMode::EXCLUSIVE, properties)
                .unwrap();
            assert_eq!(
                rig.buffers.allocation(handle).unwrap().memory_type,
                expected,
                "{properties:?}"
            );
            rig.buffers.free(handle).unwrap();
        }
    }
}

#[test]
fn memory_type_respects_allowed_bits() {
    let device = MockDevice::new();
    device.set_buffer_type_bits(0b1100);
    let mut rig = TestRig::with_device(device).unwrap();

    let handle = rig
        .buffers
        .allocate(
            64,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            vk::SharingMode::EXCLUSIVE,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )
        .unwrap();
    assert_eq!(rig.buffers.allocation(handle).unwrap().memory_type, 2);
}

#[test]
fn no_compatible_memory_type_leaves_nothing_behind() {
    let device = MockDevice::new();
    device.set_buffer_type_bits(0b0001);
    let mut rig = TestRig::with_device(device).unwrap();

    let err = rig
        .buffers
        .allocate(64, vk::BufferUsageFlags::UNIFORM_BUFFER, vk::SharingMode::EXCLUSIVE, STAGING)
        .unwrap_err();

    assert!(matches!(
        err,
        GpuError::NoCompatibleMemoryType { type_bits: 0b0001, .. }
    ));
    assert!(rig.buffers.is_empty());
    assert_eq!(rig.device.count(|c| matches!(c, DeviceCall::CreateBuffer { .. })), 1);
    assert_eq!(rig.device.count(|c| matches!(c, DeviceCall::DestroyBuffer(_))), 1);
    assert_eq!(rig.device.count(|c| matches!(c, DeviceCall::AllocateMemory { .. })), 0);
}

#[test]
fn failed_allocation_or_bind_is_unwound() {
    let mut rig = TestRig::new().unwrap();

    rig.device
        .fail_once(FailPoint::AllocateMemory, vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
    let err = rig
        .buffers
        .allocate(64, vk::BufferUsageFlags::UNIFORM_BUFFER, vk::SharingMode::EXCLUSIVE, STAGING)
        .unwrap_err();
    assert!(matches!(
        err,
        GpuError::MemoryAllocation(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
    ));

    rig.device
        .fail_once(FailPoint::BindBufferMemory, vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
    let err = rig
        .buffers
        .allocate(64, vk::BufferUsageFlags::UNIFORM_BUFFER, vk::SharingMode::EXCLUSIVE, STAGING)
        .unwrap_err();
    assert!(matches!(err, GpuError::Bind(_)));

    rig.device
        .fail_once(FailPoint::CreateBuffer, vk::Result::ERROR_OUT_OF_HOST_MEMORY);
    let err = rig
        .buffers
        .allocate(64, vk::BufferUsageFlags::UNIFORM_BUFFER, vk::SharingMode::EXCLUSIVE, STAGING)
        .unwrap_err();
    assert!(matches!(
        err,
        GpuError::ResourceCreation { resource: "buffer", .. }
    ));

    assert!(rig.buffers.is_empty());
    assert_eq!(rig.tracker.live_allocations(), 0);
    assert_eq!(rig.device.live_memory_blocks(), 0);
}

#[test]
fn allocate_then_free_returns_to_empty() {
    let mut rig = TestRig::new().unwrap();
    let handles: Vec<_> = (0..4)
        .map(|i| {
            rig.buffers
                .allocate(
                    100 * (i + 1),
                    vk::BufferUsageFlags::UNIFORM_BUFFER,
                    vk::SharingMode::EXCLUSIVE,
                    STAGING,
                )
                .unwrap()
        })
        .collect();
    assert_eq!(rig.buffers.len(), 4);
    assert_eq!(rig.tracker.live_bytes(), 256 + 256 + 512 + 512);

    for handle in handles {
        rig.buffers.free(handle).unwrap();
    }

    assert!(rig.buffers.is_empty());
    assert_eq!(rig.tracker.live_bytes(), 0);
    assert_eq!(rig.tracker.peak_bytes(), 1536);
    assert_eq!(rig.device.live_memory_blocks(), 0);
}

#[test]
fn stale_handle_is_not_found() {
    let mut rig = TestRig::new().unwrap();
    let handle = rig
        .buffers
        .allocate(64, vk::BufferUsageFlags::UNIFORM_BUFFER, vk::SharingMode::EXCLUSIVE, STAGING)
        .unwrap();
    rig.buffers.free(handle).unwrap();

    assert!(matches!(rig.buffers.free(handle), Err(GpuError::NotFound(_))));
    assert!(matches!(rig.buffers.metadata(handle), Err(GpuError::NotFound(_))));

    // The slot is reused but the old handle stays dead.
    let reused = rig
        .buffers
        .allocate(64, vk::BufferUsageFlags::UNIFORM_BUFFER, vk::SharingMode::EXCLUSIVE, STAGING)
        .unwrap();
    assert_ne!(reused, handle);
    assert!(!rig.buffers.contains(handle));
}

#[test]
fn promote_copies_1024_bytes_into_device_local_buffer() {
    let mut rig = TestRig::new().unwrap();
    let data = pattern(1024);

    let source = rig
        .buffers
        .allocate(
            1024,
            vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::VERTEX_BUFFER,
            vk::SharingMode::EXCLUSIVE,
            STAGING,
        )
        .unwrap();
    rig.buffers.write_bytes(source, 0, &data).unwrap();
    let source_raw = rig.buffers.raw(source).unwrap();
    rig.device.clear_calls();

    let promoted = rig
        .buffers
        .promote_to_device_local(source, true, Recording::Immediate)
        .unwrap();

    assert_ne!(promoted, source);
    assert!(!rig.buffers.contains(source));
    assert_eq!(rig.buffers.len(), 1);

    let meta = rig.buffers.metadata(promoted).unwrap();
    assert_eq!(meta.size, 1024);
    assert_eq!(
        meta.usage,
        vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::VERTEX_BUFFER
    );
    assert_eq!(meta.sharing_mode, vk::SharingMode::EXCLUSIVE);
    assert_eq!(meta.properties, vk::MemoryPropertyFlags::DEVICE_LOCAL);
    assert_eq!(rig.buffers.allocation(promoted).unwrap().memory_type, 0);

    let copies = rig
        .device
        .calls_matching(|c| matches!(c, DeviceCall::CopyBuffer { .. }));
    assert_eq!(copies.len(), 1);
    let promoted_raw = rig.buffers.raw(promoted).unwrap();
    assert!(matches!(
        copies[0],
        DeviceCall::CopyBuffer { src, dst, size: 1024, .. } if src == source_raw && dst == promoted_raw
    ));

    assert_eq!(rig.buffer_contents(promoted).unwrap(), data);
    assert_eq!(rig.device.pending_submissions(), 0);
}

#[test]
fn promote_can_keep_the_source() {
    let mut rig = TestRig::new().unwrap();
    let source = rig
        .buffers
        .allocate(32, vk::BufferUsageFlags::TRANSFER_SRC, vk::SharingMode::EXCLUSIVE, STAGING)
        .unwrap();

    let promoted = rig
        .buffers
        .promote_to_device_local(source, false, Recording::Immediate)
        .unwrap();

    assert!(rig.buffers.contains(source));
    assert!(rig.buffers.contains(promoted));
}

#[test]
fn promote_rejects_device_local_source_without_allocating() {
    let mut rig = TestRig::new().unwrap();
    let source = rig
        .buffers
        .allocate(
            1024,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::SharingMode::EXCLUSIVE,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )
        .unwrap();
    rig.device.clear_calls();

    let err = rig
        .buffers
        .promote_to_device_local(source, true, Recording::Immediate)
        .unwrap_err();

    assert!(matches!(err, GpuError::Precondition(_)));
    assert!(rig.buffers.contains(source));
    assert_eq!(rig.buffers.len(), 1);
    assert!(rig.device.calls().is_empty());
}

#[test]
fn promote_rejects_source_without_transfer_src() {
    let mut rig = TestRig::new().unwrap();
    let source = rig
        .buffers
        .allocate(64, vk::BufferUsageFlags::VERTEX_BUFFER, vk::SharingMode::EXCLUSIVE, STAGING)
        .unwrap();
    rig.device.clear_calls();

    let err = rig
        .buffers
        .promote_to_device_local(source, true, Recording::Immediate)
        .unwrap_err();

    assert!(matches!(err, GpuError::Precondition(_)));
    assert_eq!(rig.device.count(|c| matches!(c, DeviceCall::AllocateMemory { .. })), 0);
}

#[test]
fn mapping_device_local_memory_is_refused() {
    let mut rig = TestRig::new().unwrap();
    let buffer = rig
        .buffers
        .allocate(
            64,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            vk::SharingMode::EXCLUSIVE,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )
        .unwrap();

    assert!(matches!(rig.buffers.map(buffer), Err(GpuError::Precondition(_))));
    assert!(rig.device.violations().is_empty());
}

#[test]
fn double_map_is_refused() {
    let mut rig = TestRig::new().unwrap();
    let buffer = rig
        .buffers
        .allocate(64, vk::BufferUsageFlags::UNIFORM_BUFFER, vk::SharingMode::EXCLUSIVE, STAGING)
        .unwrap();

    rig.buffers.map(buffer).unwrap();
    assert!(matches!(rig.buffers.map(buffer), Err(GpuError::Precondition(_))));
    rig.buffers.unmap(buffer).unwrap();
    assert!(matches!(rig.buffers.unmap(buffer), Err(GpuError::Precondition(_))));
}

#[test]
fn upload_into_caller_buffer_retires_staging_until_completion() {
    let mut rig = TestRig::new().unwrap();
    let data = pattern(512);

    let cmd = rig.pool.allocate_command_buffer(&*rig.device).unwrap();
    rig.device
        .begin_command_buffer(cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
        .unwrap();

    let uploaded = rig
        .buffers
        .upload(&data, vk::BufferUsageFlags::INDEX_BUFFER, Recording::Into(cmd))
        .unwrap();

    // Nothing submitted yet; the staging buffer must survive.
    assert_eq!(rig.buffers.retired_count(), 1);
    assert_eq!(rig.buffers.len(), 2);
    assert_eq!(rig.device.count(|c| matches!(c, DeviceCall::QueueSubmit { .. })), 0);

    rig.device.end_command_buffer(cmd).unwrap();
    let fence = rig.device.create_fence(false).unwrap();
    let command_buffers = [cmd];
    let batch = SubmitBatch {
        command_buffers: &command_buffers,
        ..SubmitBatch::default()
    };
    rig.device
        .queue_submit(rig.device.graphics_queue(), &batch, fence)
        .unwrap();
    rig.device.wait_for_fences(&[fence], u64::MAX).unwrap();

    assert_eq!(rig.buffers.free_retired().unwrap(), 1);
    assert_eq!(rig.buffers.len(), 1);
    assert_eq!(rig.buffer_contents(uploaded).unwrap(), data);
    assert!(rig.device.violations().is_empty());

    rig.device.destroy_fence(fence);
    rig.pool.free_command_buffers(&*rig.device, &[cmd]);
}

#[test]
fn empty_upload_is_rejected() {
    let mut rig = TestRig::new().unwrap();
    let err = rig
        .buffers
        .upload(&[], vk::BufferUsageFlags::VERTEX_BUFFER, Recording::Immediate)
        .unwrap_err();
    assert!(matches!(err, GpuError::Precondition(_)));
    assert!(rig.buffers.is_empty());
}

#[test]
fn failed_copy_submission_frees_both_buffers() {
    let mut rig = TestRig::new().unwrap();
    rig.device
        .fail_once(FailPoint::QueueSubmit, vk::Result::ERROR_DEVICE_LOST);

    let err = rig
        .buffers
        .upload(&pattern(64), vk::BufferUsageFlags::VERTEX_BUFFER, Recording::Immediate)
        .unwrap_err();

    assert!(matches!(err, GpuError::CommandRecord(vk::Result::ERROR_DEVICE_LOST)));
    assert!(rig.buffers.is_empty());
    assert_eq!(rig.tracker.live_allocations(), 0);
    // The one-shot command buffer is returned even though submission failed.
    assert_eq!(
        rig.device.count(|c| matches!(c, DeviceCall::AllocateCommandBuffers(_))),
        rig.device.count(|c| matches!(c, DeviceCall::FreeCommandBuffers(_)))
    );
}

#[test]
fn free_all_releases_mapped_buffers() {
    let mut rig = TestRig::new().unwrap();
    let mapped = rig
        .buffers
        .allocate(64, vk::BufferUsageFlags::UNIFORM_BUFFER, vk::SharingMode::EXCLUSIVE, STAGING)
        .unwrap();
    rig.buffers.map(mapped).unwrap();
    rig.buffers
        .allocate(
            64,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            vk::SharingMode::EXCLUSIVE,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )
        .unwrap();

    rig.buffers.free_all();

    assert!(rig.buffers.is_empty());
    assert_eq!(rig.device.count(|c| matches!(c, DeviceCall::UnmapMemory(_))), 1);
    assert_eq!(rig.device.live_memory_blocks(), 0);
}
