use ash::vk;
use stagecraft_gpu::{
    GpuError, ImageCache, ImageLoadOptions, ImageMetadata, ImageTransition, LoadedImage,
    Recording, TextureKind,
};
use stagecraft_test::{BarrierRecord, DeviceCall, FixtureDir, ImageCopyRecord, TestRig};
use std::path::Path;

fn solid(width: u32, height: u32, channels: u32, value: u8) -> LoadedImage {
    LoadedImage::from_rgba8(
        vec![value; (width * height * 4) as usize],
        width,
        height,
        channels,
    )
    .unwrap()
}

fn extent(width: u32, height: u32) -> vk::Extent2D {
    vk::Extent2D { width, height }
}

#[test]
fn array_extent_is_per_axis_maximum() {
    let mut rig = TestRig::new().unwrap();
    let mut cache = ImageCache::new();
    cache.insert("wide.png", false, solid(4, 2, 4, 10));
    cache.insert("tall.png", false, solid(2, 4, 4, 20));

    let (image, metadata) = rig
        .images
        .allocate_array(
            &mut rig.buffers,
            &mut cache,
            &["wide.png", "tall.png"],
            vk::ImageUsageFlags::SAMPLED,
            ImageLoadOptions::default(),
            Recording::Immediate,
        )
        .unwrap();

    let info = rig.images.info(image).unwrap();
    assert_eq!(info.extent, extent(4, 4));
    assert_eq!(info.array_layers, 2);
    assert_eq!(info.format, vk::Format::R8G8B8A8_SRGB);
    assert!(info.usage.contains(vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST));
    assert_eq!(
        metadata,
        vec![
            ImageMetadata { width: 4, height: 2, channels: 4 },
            ImageMetadata { width: 2, height: 4, channels: 4 },
        ]
    );

    let raw = rig.images.raw_image(image).unwrap();
    let copies = rig
        .device
        .calls_matching(|c| matches!(c, DeviceCall::CopyBufferToImage { .. }));
    assert_eq!(copies.len(), 1);
    let DeviceCall::CopyBufferToImage { dst, layout, regions, .. } = &copies[0] else {
        unreachable!()
    };
    assert_eq!(*dst, raw);
    assert_eq!(*layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
    assert_eq!(
        regions,
        &vec![
            ImageCopyRecord { buffer_offset: 0, layer: 0, width: 4, height: 2 },
            ImageCopyRecord { buffer_offset: 32, layer: 1, width: 2, height: 4 },
        ]
    );

    // Staging is gone once the one-shot copy completed.
    assert!(rig.buffers.is_empty());
}

#[test]
fn array_upload_brackets_copy_with_layout_transitions() {
    let mut rig = TestRig::new().unwrap();
    let mut cache = ImageCache::new();
    for (i, name) in ["a", "b", "c"].iter().enumerate() {
        cache.insert(*name, false, solid(8, 8, 4, i as u8));
    }

    let (image, _) = rig
        .images
        .allocate_array(
            &mut rig.buffers,
            &mut cache,
            &["a", "b", "c"],
            vk::ImageUsageFlags::SAMPLED,
            ImageLoadOptions::default(),
            Recording::Immediate,
        )
        .unwrap();
    let raw = rig.images.raw_image(image).unwrap();

    let sequence: Vec<_> = rig
        .device
        .calls()
        .into_iter()
        .filter(|c| {
            matches!(
                c,
                DeviceCall::PipelineBarrier { .. } | DeviceCall::CopyBufferToImage { .. }
            )
        })
        .collect();
    assert_eq!(sequence.len(), 3);

    let barrier = |call: &DeviceCall| match call {
        DeviceCall::PipelineBarrier { barriers, .. } => barriers[0],
        other => panic!("expected barrier, got {other:?}"),
    };
    assert_eq!(
        barrier(&sequence[0]),
        BarrierRecord {
            image: raw,
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::TRANSFER_WRITE,
            layer_count: 3,
        }
    );
    assert!(matches!(sequence[1], DeviceCall::CopyBufferToImage { .. }));
    assert_eq!(
        barrier(&sequence[2]),
        BarrierRecord {
            image: raw,
            old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            new_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            src_access: vk::AccessFlags::TRANSFER_WRITE,
            dst_access: vk::AccessFlags::SHADER_READ,
            layer_count: 3,
        }
    );

    let stages = |call: &DeviceCall| match call {
        DeviceCall::PipelineBarrier {
            src_stage,
            dst_stage,
            ..
        } => (*src_stage, *dst_stage),
        other => panic!("expected barrier, got {other:?}"),
    };
    for (call, preset) in [
        (&sequence[0], ImageTransition::undefined_to_transfer_dst()),
        (&sequence[2], ImageTransition::transfer_dst_to_shader_read()),
    ] {
        assert_eq!(stages(call), (preset.src_stage, preset.dst_stage));
    }
}

#[test]
fn array_sources_must_agree_on_channels() {
    let mut rig = TestRig::new().unwrap();
    let mut cache = ImageCache::new();
    cache.insert("rgb", false, solid(4, 4, 3, 0));
    cache.insert("rgba", false, solid(4, 4, 4, 0));

    let err = rig
        .images
        .allocate_array(
            &mut rig.buffers,
            &mut cache,
            &["rgb", "rgba"],
            vk::ImageUsageFlags::SAMPLED,
            ImageLoadOptions::default(),
            Recording::Immediate,
        )
        .unwrap_err();

    assert!(matches!(err, GpuError::Precondition(_)));
    assert_eq!(rig.images.image_count(), 0);
    assert_eq!(rig.device.count(|c| matches!(c, DeviceCall::CreateImage { .. })), 0);

    // An explicit format overrides the check.
    let (image, _) = rig
        .images
        .allocate_array(
            &mut rig.buffers,
            &mut cache,
            &["rgb", "rgba"],
            vk::ImageUsageFlags::SAMPLED,
            ImageLoadOptions::default().with_format(vk::Format::R8G8B8A8_UNORM),
            Recording::Immediate,
        )
        .unwrap();
    assert_eq!(rig.images.info(image).unwrap().format, vk::Format::R8G8B8A8_UNORM);
}

#[test]
fn empty_array_is_rejected() {
    let mut rig = TestRig::new().unwrap();
    let mut cache = ImageCache::new();
    let paths: [&Path; 0] = [];

    let err = rig
        .images
        .allocate_array(
            &mut rig.buffers,
            &mut cache,
            &paths,
            vk::ImageUsageFlags::SAMPLED,
            ImageLoadOptions::default(),
            Recording::Immediate,
        )
        .unwrap_err();
    assert!(matches!(err, GpuError::Precondition(_)));
}

#[test]
fn png_files_upload_at_their_own_resolution() {
    let dir = FixtureDir::new("png-array").unwrap();
    let landscape = dir.write_png("landscape.png", 8, 4, 3).unwrap();
    let portrait = dir.write_png("portrait.png", 4, 8, 3).unwrap();

    let mut rig = TestRig::new().unwrap();
    let mut cache = ImageCache::new();
    let (image, metadata) = rig
        .images
        .allocate_array(
            &mut rig.buffers,
            &mut cache,
            &[&landscape, &portrait],
            vk::ImageUsageFlags::SAMPLED,
            ImageLoadOptions::default().with_kind(TextureKind::Normal),
            Recording::Immediate,
        )
        .unwrap();

    let info = rig.images.info(image).unwrap();
    assert_eq!(info.extent, extent(8, 8));
    assert_eq!(info.format, vk::Format::R8G8B8A8_UNORM);
    assert_eq!(metadata[0], ImageMetadata { width: 8, height: 4, channels: 3 });
    assert_eq!(metadata[1], ImageMetadata { width: 4, height: 8, channels: 3 });

    // Both files are now served from the cache.
    assert_eq!(cache.len(), 2);
    assert!(cache.contains(&landscape, false));
    let (again, _) = rig
        .images
        .allocate_from_file(
            &mut rig.buffers,
            &mut cache,
            &landscape,
            vk::ImageUsageFlags::SAMPLED,
            ImageLoadOptions::default(),
            Recording::Immediate,
        )
        .unwrap();
    assert_eq!(cache.len(), 2);
    assert_eq!(rig.images.info(again).unwrap().extent, extent(8, 4));
}

#[test]
fn single_file_defaults_to_srgb() {
    let dir = FixtureDir::new("png-single").unwrap();
    let path = dir.write_png("albedo.png", 16, 16, 4).unwrap();

    let mut rig = TestRig::new().unwrap();
    let mut cache = ImageCache::new();
    let (image, metadata) = rig
        .images
        .allocate_from_file(
            &mut rig.buffers,
            &mut cache,
            &path,
            vk::ImageUsageFlags::SAMPLED,
            ImageLoadOptions::default(),
            Recording::Immediate,
        )
        .unwrap();

    assert_eq!(metadata, ImageMetadata { width: 16, height: 16, channels: 4 });
    let info = rig.images.info(image).unwrap();
    assert_eq!(info.format, vk::Format::R8G8B8A8_SRGB);
    assert_eq!(info.array_layers, 1);
    assert_eq!(rig.images.allocation(image).unwrap().memory_type, 0);
}

#[test]
fn flipped_load_is_cached_separately() {
    let dir = FixtureDir::new("png-flip").unwrap();
    let path = dir.write_png("gradient.png", 2, 3, 4).unwrap();

    let mut cache = ImageCache::new();
    let upright = cache.load(&path, false).unwrap();
    let flipped = cache.load(&path, true).unwrap();

    assert_eq!(cache.len(), 2);
    let row = |image: &LoadedImage, y: usize| image.pixels[y * 8..(y + 1) * 8].to_vec();
    assert_eq!(row(&upright, 0), row(&flipped, 2));
    assert_eq!(row(&upright, 2), row(&flipped, 0));
    assert_ne!(row(&upright, 0), row(&upright, 2));

    assert_eq!(cache.evict(&path), 2);
    assert!(cache.is_empty());
}

#[test]
fn missing_file_reports_path() {
    let mut rig = TestRig::new().unwrap();
    let mut cache = ImageCache::new();
    let missing = std::env::temp_dir().join("stagecraft-definitely-missing.png");

    let err = rig
        .images
        .allocate_from_file(
            &mut rig.buffers,
            &mut cache,
            &missing,
            vk::ImageUsageFlags::SAMPLED,
            ImageLoadOptions::default(),
            Recording::Immediate,
        )
        .unwrap_err();

    match err {
        GpuError::ImageLoad { path, .. } => assert_eq!(path, missing),
        other => panic!("expected ImageLoad, got {other:?}"),
    }
    assert!(rig.buffers.is_empty());
    assert_eq!(rig.images.image_count(), 0);
}

#[test]
fn recorded_upload_retires_staging() {
    let mut rig = TestRig::new().unwrap();
    let mut cache = ImageCache::new();
    cache.insert("tile", false, solid(4, 4, 4, 7));
    let cmd = rig.pool.allocate_command_buffer(&*rig.device).unwrap();

    rig.images
        .allocate_from_file(
            &mut rig.buffers,
            &mut cache,
            Path::new("tile"),
            vk::ImageUsageFlags::SAMPLED,
            ImageLoadOptions::default(),
            Recording::Into(cmd),
        )
        .unwrap();

    assert_eq!(rig.buffers.retired_count(), 1);
    assert_eq!(rig.device.count(|c| matches!(c, DeviceCall::QueueSubmit { .. })), 0);
    assert_eq!(rig.buffers.free_retired().unwrap(), 1);
    assert!(rig.buffers.is_empty());
}

#[test]
fn freeing_an_image_destroys_its_views_first() {
    let mut rig = TestRig::new().unwrap();
    let image = rig
        .images
        .allocate_empty(
            extent(16, 16),
            vk::Format::R8G8B8A8_UNORM,
            vk::ImageUsageFlags::COLOR_ATTACHMENT,
        )
        .unwrap();
    let first = rig
        .images
        .create_image_view(image, vk::Format::R8G8B8A8_UNORM, vk::ImageAspectFlags::COLOR)
        .unwrap();
    let second = rig
        .images
        .create_image_view(image, vk::Format::R8G8B8A8_SRGB, vk::ImageAspectFlags::COLOR)
        .unwrap();
    assert_eq!(rig.images.view_owner(first).unwrap(), image);
    let raw = rig.images.raw_image(image).unwrap();
    rig.device.clear_calls();

    rig.images.free_image(image).unwrap();

    assert_eq!(rig.images.view_count(), 0);
    assert!(matches!(rig.images.raw_view(second), Err(GpuError::NotFound(_))));
    let calls = rig.device.calls();
    let destroyed_image = calls
        .iter()
        .position(|c| *c == DeviceCall::DestroyImage(raw))
        .unwrap();
    let views: Vec<_> = calls
        .iter()
        .enumerate()
        .filter(|(_, c)| matches!(c, DeviceCall::DestroyImageView(_)))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(views.len(), 2);
    assert!(views.iter().all(|&i| i < destroyed_image));
    assert_eq!(rig.tracker.live_allocations(), 0);
}

#[test]
fn array_views_cover_every_layer() {
    let mut rig = TestRig::new().unwrap();
    let mut cache = ImageCache::new();
    cache.insert("0", false, solid(2, 2, 4, 0));
    cache.insert("1", false, solid(2, 2, 4, 1));

    let (array, _) = rig
        .images
        .allocate_array(
            &mut rig.buffers,
            &mut cache,
            &["0", "1"],
            vk::ImageUsageFlags::SAMPLED,
            ImageLoadOptions::default(),
            Recording::Immediate,
        )
        .unwrap();
    let single = rig
        .images
        .allocate_empty(extent(2, 2), vk::Format::R8G8B8A8_UNORM, vk::ImageUsageFlags::SAMPLED)
        .unwrap();
    rig.device.clear_calls();

    rig.images
        .create_image_view(array, vk::Format::R8G8B8A8_SRGB, vk::ImageAspectFlags::COLOR)
        .unwrap();
    rig.images
        .create_image_view(single, vk::Format::R8G8B8A8_UNORM, vk::ImageAspectFlags::COLOR)
        .unwrap();

    let views: Vec<_> = rig
        .device
        .calls_matching(|c| matches!(c, DeviceCall::CreateImageView { .. }))
        .into_iter()
        .map(|c| match c {
            DeviceCall::CreateImageView { view_type, layer_count, .. } => (view_type, layer_count),
            _ => unreachable!(),
        })
        .collect();
    assert_eq!(
        views,
        vec![
            (vk::ImageViewType::TYPE_2D_ARRAY, 2),
            (vk::ImageViewType::TYPE_2D, 1),
        ]
    );
}

#[test]
fn empty_image_keeps_requested_usage_and_rejects_zero_extent() {
    let mut rig = TestRig::new().unwrap();
    let image = rig
        .images
        .allocate_empty(extent(32, 8), vk::Format::D32_SFLOAT, vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
        .unwrap();
    let info = rig.images.info(image).unwrap();
    assert_eq!(info.usage, vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT);
    assert!(rig.device.calls().contains(&DeviceCall::CreateImage {
        image: rig.images.raw_image(image).unwrap(),
        width: 32,
        height: 8,
        array_layers: 1,
        format: vk::Format::D32_SFLOAT,
        usage: info.usage,
        tiling: vk::ImageTiling::OPTIMAL,
    }));

    let err = rig
        .images
        .allocate_empty(extent(0, 8), vk::Format::D32_SFLOAT, vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
        .unwrap_err();
    assert!(matches!(err, GpuError::Precondition(_)));
}

#[test]
fn transition_records_one_barrier() {
    let mut rig = TestRig::new().unwrap();
    let image = rig
        .images
        .allocate_empty(extent(4, 4), vk::Format::R8G8B8A8_UNORM, vk::ImageUsageFlags::SAMPLED)
        .unwrap();
    rig.device.clear_calls();

    rig.images
        .transition_image(
            image,
            &ImageTransition::undefined_to_transfer_dst(),
            Recording::Immediate,
        )
        .unwrap();

    assert_eq!(rig.device.count(|c| matches!(c, DeviceCall::PipelineBarrier { .. })), 1);
    assert_eq!(rig.device.count(|c| matches!(c, DeviceCall::QueueWaitIdle)), 1);
}

#[test]
fn samplers_and_shutdown() {
    let mut rig = TestRig::new().unwrap();
    let sampler = rig
        .images
        .create_sampler(&vk::SamplerCreateInfo::default())
        .unwrap();
    rig.images.raw_sampler(sampler).unwrap();
    let image = rig
        .images
        .allocate_empty(extent(4, 4), vk::Format::R8G8B8A8_UNORM, vk::ImageUsageFlags::SAMPLED)
        .unwrap();
    rig.images
        .create_image_view(image, vk::Format::R8G8B8A8_UNORM, vk::ImageAspectFlags::COLOR)
        .unwrap();

    rig.images.shutdown();

    assert_eq!(rig.images.image_count(), 0);
    assert_eq!(rig.images.view_count(), 0);
    assert_eq!(rig.images.sampler_count(), 0);
    assert_eq!(rig.device.count(|c| matches!(c, DeviceCall::DestroySampler(_))), 1);
    assert!(matches!(rig.images.free_sampler(sampler), Err(GpuError::NotFound(_))));
}
