use ash::vk;
use glam::{Vec2, Vec3};
use stagecraft_gpu::{
    free_model, upload_mesh, upload_model, DeferredDeletionQueue, GpuDevice, GpuError, MeshData,
    ModelVertex, Recording, Retired, SubmitBatch,
};
use stagecraft_test::{DeviceCall, FailPoint, TestRig};

fn triangle() -> (Vec<ModelVertex>, Vec<u32>) {
    let vertex = |x: f32, y: f32| ModelVertex {
        position: Vec3::new(x, y, 0.0),
        normal: Vec3::Z,
        tex_coord: Vec2::new(x, y),
        tangent: Vec3::X,
        bitangent: Vec3::Y,
    };
    (
        vec![vertex(0.0, 0.0), vertex(1.0, 0.0), vertex(0.0, 1.0)],
        vec![0, 1, 2],
    )
}

#[test]
fn mesh_lands_in_device_local_buffers() {
    let mut rig = TestRig::new().unwrap();
    let (vertices, indices) = triangle();
    let mesh = MeshData {
        vertices: &vertices,
        indices: &indices,
        material_index: 4,
    };

    let gpu = upload_mesh(
        &mut rig.buffers,
        &mesh,
        vk::BufferUsageFlags::STORAGE_BUFFER,
        vk::BufferUsageFlags::empty(),
        Recording::Immediate,
    )
    .unwrap();

    assert_eq!(gpu.index_count, 3);
    assert_eq!(gpu.material_index, 4);

    let vertex_meta = rig.buffers.metadata(gpu.vertex_buffer).unwrap();
    assert_eq!(
        vertex_meta.usage,
        vk::BufferUsageFlags::VERTEX_BUFFER
            | vk::BufferUsageFlags::STORAGE_BUFFER
            | vk::BufferUsageFlags::TRANSFER_DST
    );
    assert_eq!(vertex_meta.properties, vk::MemoryPropertyFlags::DEVICE_LOCAL);
    assert_eq!(
        rig.buffers.metadata(gpu.index_buffer).unwrap().usage,
        vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
    );

    let vertex_bytes: &[u8] = bytemuck::cast_slice(&vertices);
    let index_bytes: &[u8] = bytemuck::cast_slice(&indices);
    assert_eq!(rig.buffer_contents(gpu.vertex_buffer).unwrap(), vertex_bytes);
    assert_eq!(rig.buffer_contents(gpu.index_buffer).unwrap(), index_bytes);

    // Staging buffers are gone; only the two device-local buffers remain.
    assert_eq!(rig.buffers.len(), 2);
    assert_eq!(rig.tracker.live_allocations(), 2);
}

#[test]
fn empty_mesh_is_rejected_before_allocating() {
    let mut rig = TestRig::new().unwrap();
    let (vertices, _) = triangle();

    let err = upload_mesh(
        &mut rig.buffers,
        &MeshData {
            vertices: &vertices,
            indices: &[],
            material_index: 0,
        },
        vk::BufferUsageFlags::empty(),
        vk::BufferUsageFlags::empty(),
        Recording::Immediate,
    )
    .unwrap_err();

    assert!(matches!(err, GpuError::Precondition(_)));
    assert_eq!(rig.device.count(|c| matches!(c, DeviceCall::CreateBuffer { .. })), 0);
}

#[test]
fn failed_index_upload_frees_vertex_buffer() {
    let mut rig = TestRig::new().unwrap();
    let (vertices, indices) = triangle();
    // Vertex staging and vertex buffer succeed; the index staging buffer fails.
    rig.device
        .fail_after(FailPoint::CreateBuffer, 2, vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);

    let err = upload_mesh(
        &mut rig.buffers,
        &MeshData {
            vertices: &vertices,
            indices: &indices,
            material_index: 0,
        },
        vk::BufferUsageFlags::empty(),
        vk::BufferUsageFlags::empty(),
        Recording::Immediate,
    )
    .unwrap_err();

    assert!(matches!(
        err,
        GpuError::ResourceCreation {
            resource: "buffer",
            ..
        }
    ));
    assert!(rig.buffers.is_empty());
    assert_eq!(rig.tracker.live_allocations(), 0);
    assert_eq!(rig.device.live_memory_blocks(), 0);
}

#[test]
fn model_upload_releases_earlier_meshes_on_failure() {
    let mut rig = TestRig::new().unwrap();
    let (vertices, indices) = triangle();
    let meshes = [
        MeshData {
            vertices: &vertices[..],
            indices: &indices[..],
            material_index: 0,
        },
        MeshData {
            vertices: &vertices[..],
            indices: &[],
            material_index: 1,
        },
    ];

    let err = upload_model(
        &mut rig.buffers,
        &meshes,
        vk::BufferUsageFlags::empty(),
        vk::BufferUsageFlags::empty(),
        Recording::Immediate,
    )
    .unwrap_err();

    assert!(matches!(err, GpuError::Precondition(_)));
    assert!(rig.buffers.is_empty());
    assert_eq!(rig.tracker.live_bytes(), 0);
}

#[test]
fn model_round_trip_through_free_model() {
    let mut rig = TestRig::new().unwrap();
    let (vertices, indices) = triangle();
    let quad_indices = [0u32, 1, 2, 2, 1, 0];
    let meshes = [
        MeshData {
            vertices: &vertices[..],
            indices: &indices[..],
            material_index: 0,
        },
        MeshData {
            vertices: &vertices[..],
            indices: &quad_indices[..],
            material_index: 1,
        },
    ];

    let model = upload_model(
        &mut rig.buffers,
        &meshes,
        vk::BufferUsageFlags::empty(),
        vk::BufferUsageFlags::empty(),
        Recording::Immediate,
    )
    .unwrap();

    assert_eq!(model.meshes.len(), 2);
    assert_eq!(model.index_count(), 9);
    assert_eq!(model.meshes[1].material_index, 1);
    assert_eq!(rig.buffers.len(), 4);

    free_model(&mut rig.buffers, model).unwrap();
    assert!(rig.buffers.is_empty());
    assert_eq!(rig.tracker.live_allocations(), 0);
}

#[test]
fn recorded_mesh_upload_retires_both_staging_buffers() {
    let mut rig = TestRig::new().unwrap();
    let (vertices, indices) = triangle();
    let cmd = rig.pool.allocate_command_buffer(&*rig.device).unwrap();
    rig.device
        .begin_command_buffer(cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
        .unwrap();

    let gpu = upload_mesh(
        &mut rig.buffers,
        &MeshData {
            vertices: &vertices,
            indices: &indices,
            material_index: 0,
        },
        vk::BufferUsageFlags::empty(),
        vk::BufferUsageFlags::empty(),
        Recording::Into(cmd),
    )
    .unwrap();

    assert_eq!(rig.buffers.retired_count(), 2);
    assert_eq!(rig.buffers.len(), 4);

    rig.device.end_command_buffer(cmd).unwrap();
    let command_buffers = [cmd];
    let batch = SubmitBatch {
        command_buffers: &command_buffers,
        ..SubmitBatch::default()
    };
    rig.device
        .queue_submit(rig.device.graphics_queue(), &batch, vk::Fence::null())
        .unwrap();
    rig.device.queue_wait_idle(rig.device.graphics_queue()).unwrap();

    assert_eq!(rig.buffers.free_retired().unwrap(), 2);
    assert_eq!(rig.buffers.len(), 2);
    let index_bytes: &[u8] = bytemuck::cast_slice(&indices);
    assert_eq!(rig.buffer_contents(gpu.index_buffer).unwrap(), index_bytes);

    rig.pool.free_command_buffers(&*rig.device, &[cmd]);
}

#[test]
fn deferred_deletion_waits_out_frames_in_flight() {
    let mut rig = TestRig::new().unwrap();
    let buffer = rig
        .buffers
        .allocate(
            64,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            vk::SharingMode::EXCLUSIVE,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )
        .unwrap();

    let mut queue = DeferredDeletionQueue::new(2);
    queue.queue(buffer, 5);
    assert_eq!(queue.pending_count(), 1);

    assert_eq!(queue.process(&mut rig.buffers, &mut rig.images, 6).unwrap(), 0);
    assert_eq!(queue.process(&mut rig.buffers, &mut rig.images, 7).unwrap(), 0);
    assert!(rig.buffers.contains(buffer));

    assert_eq!(queue.process(&mut rig.buffers, &mut rig.images, 8).unwrap(), 1);
    assert!(!rig.buffers.contains(buffer));
    assert_eq!(queue.pending_count(), 0);
}

#[test]
fn deferred_deletion_frees_in_queue_order() {
    let mut rig = TestRig::new().unwrap();
    let allocate = |rig: &mut TestRig| {
        rig.buffers
            .allocate(
                16,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                vk::SharingMode::EXCLUSIVE,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )
            .unwrap()
    };
    let early = allocate(&mut rig);
    let late = allocate(&mut rig);

    let mut queue = DeferredDeletionQueue::new(1);
    queue.queue(early, 1);
    queue.queue(late, 3);

    assert_eq!(queue.process(&mut rig.buffers, &mut rig.images, 3).unwrap(), 1);
    assert!(!rig.buffers.contains(early));
    assert!(rig.buffers.contains(late));

    queue.set_frames_in_flight(0);
    assert_eq!(queue.process(&mut rig.buffers, &mut rig.images, 4).unwrap(), 1);
    assert!(rig.buffers.is_empty());
}

#[test]
fn deferred_image_deletion_cascades_and_flush_empties() {
    let mut rig = TestRig::new().unwrap();
    let extent = vk::Extent2D {
        width: 32,
        height: 32,
    };
    let image = rig
        .images
        .allocate_empty(extent, vk::Format::R8G8B8A8_UNORM, vk::ImageUsageFlags::SAMPLED)
        .unwrap();
    rig.images
        .create_image_view(image, vk::Format::R8G8B8A8_UNORM, vk::ImageAspectFlags::COLOR)
        .unwrap();
    let buffer = rig
        .buffers
        .allocate(
            16,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            vk::SharingMode::EXCLUSIVE,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )
        .unwrap();

    let mut queue = DeferredDeletionQueue::new(3);
    queue.queue(Retired::Image(image), 10);
    queue.queue(buffer, 10);
    assert_eq!(queue.process(&mut rig.buffers, &mut rig.images, 11).unwrap(), 0);

    queue.flush(&mut rig.buffers, &mut rig.images).unwrap();

    assert_eq!(queue.pending_count(), 0);
    assert_eq!(rig.images.image_count(), 0);
    assert_eq!(rig.images.view_count(), 0);
    assert!(rig.buffers.is_empty());
    assert_eq!(rig.tracker.live_allocations(), 0);
}
