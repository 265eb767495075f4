//! Image allocation, layout transitions, views and samplers.

use crate::buffer::{BufferAllocator, BufferHandle};
use crate::command::{CommandSubmitter, Recording};
use crate::device::GpuDevice;
use crate::error::{GpuError, Result};
use crate::loader::{select_upload_format, ImageCache, ImageMetadata, LoadedImage, TextureKind};
use crate::memory::{allocate_dedicated, free_dedicated, Allocation, AllocationTracker};
use ash::vk;
use slotmap::{new_key_type, SlotMap};
use std::path::Path;
use std::sync::Arc;

new_key_type! {
    /// Generation-checked handle to an image owned by an [`ImageAllocator`].
    pub struct ImageHandle;
    /// Handle to an image view. Always belongs to exactly one live image.
    pub struct ImageViewHandle;
    /// Handle to a sampler.
    pub struct SamplerHandle;
}

/// Creation parameters of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub array_layers: u32,
}

#[derive(Debug)]
struct ImageRecord {
    image: vk::Image,
    allocation: Allocation,
    info: ImageInfo,
}

#[derive(Debug)]
struct ViewRecord {
    view: vk::ImageView,
    image: ImageHandle,
}

/// How file-backed images are uploaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImageLoadOptions {
    /// Use this format instead of deriving one. Also skips the array channel check.
    pub format: Option<vk::Format>,
    /// What the texels mean; `None` is treated as colour.
    pub kind: Option<TextureKind>,
    pub flip_vertically: bool,
}

impl ImageLoadOptions {
    /// Set an explicit format.
    pub fn with_format(mut self, format: vk::Format) -> Self {
        self.format = Some(format);
        self
    }

    /// Set the texture kind used for format selection.
    pub fn with_kind(mut self, kind: TextureKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Flip rows on load.
    pub fn flipped(mut self, flip: bool) -> Self {
        self.flip_vertically = flip;
        self
    }
}

/// A single image memory barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageTransition {
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub aspect_mask: vk::ImageAspectFlags,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
    /// Layers covered starting at 0; `None` covers every layer of the image.
    pub layer_count: Option<u32>,
}

impl ImageTransition {
    /// Make a colour image writable by transfers, discarding its contents.
    pub fn undefined_to_transfer_dst() -> Self {
        Self {
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            aspect_mask: vk::ImageAspectFlags::COLOR,
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::TRANSFER_WRITE,
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_stage: vk::PipelineStageFlags::TRANSFER,
            layer_count: None,
        }
    }

    /// Make a transfer-written colour image sampleable from fragment shaders.
    pub fn transfer_dst_to_shader_read() -> Self {
        Self {
            old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            new_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            aspect_mask: vk::ImageAspectFlags::COLOR,
            src_access: vk::AccessFlags::TRANSFER_WRITE,
            dst_access: vk::AccessFlags::SHADER_READ,
            src_stage: vk::PipelineStageFlags::TRANSFER,
            dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
            layer_count: None,
        }
    }

    /// Restrict the barrier to the first `count` layers.
    pub fn with_layer_count(mut self, count: u32) -> Self {
        self.layer_count = Some(count);
        self
    }

    fn barrier(&self, image: vk::Image, image_layers: u32) -> vk::ImageMemoryBarrier<'static> {
        vk::ImageMemoryBarrier::default()
            .old_layout(self.old_layout)
            .new_layout(self.new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(self.aspect_mask)
                    .base_mip_level(0)
                    .level_count(1)
                    .base_array_layer(0)
                    .layer_count(self.layer_count.unwrap_or(image_layers)),
            )
            .src_access_mask(self.src_access)
            .dst_access_mask(self.dst_access)
    }
}

/// Owns images, their memory, image views and samplers.
///
/// Uploads stage through a [`BufferAllocator`] passed to each call. Not internally
/// synchronized.
pub struct ImageAllocator<D: GpuDevice> {
    device: Arc<D>,
    submitter: CommandSubmitter,
    tracker: Arc<AllocationTracker>,
    images: SlotMap<ImageHandle, ImageRecord>,
    views: SlotMap<ImageViewHandle, ViewRecord>,
    samplers: SlotMap<SamplerHandle, vk::Sampler>,
}

impl<D: GpuDevice> ImageAllocator<D> {
    /// Create an allocator. One-shot transfers go through `submitter`.
    pub fn new(device: Arc<D>, submitter: CommandSubmitter, tracker: Arc<AllocationTracker>) -> Self {
        Self {
            device,
            submitter,
            tracker,
            images: SlotMap::with_key(),
            views: SlotMap::with_key(),
            samplers: SlotMap::with_key(),
        }
    }

    /// Get the device.
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    /// Load `path` through `cache` and upload it into a sampleable device-local image.
    ///
    /// The image ends in `SHADER_READ_ONLY_OPTIMAL`.
    pub fn allocate_from_file(
        &mut self,
        buffers: &mut BufferAllocator<D>,
        cache: &mut ImageCache,
        path: &Path,
        usage: vk::ImageUsageFlags,
        options: ImageLoadOptions,
        recording: Recording,
    ) -> Result<(ImageHandle, ImageMetadata)> {
        let (handle, mut metadata) =
            self.allocate_array(buffers, cache, &[path], usage, options, recording)?;
        let metadata = metadata
            .pop()
            .ok_or_else(|| GpuError::Other("image upload produced no metadata".into()))?;
        Ok((handle, metadata))
    }

    /// Load every path into one layer of a single image array.
    ///
    /// The image extent is the per-axis maximum of the sources; each layer is written at its
    /// own resolution and the rest of the layer is left undefined. All sources must agree on
    /// channel count unless `options.format` is set.
    pub fn allocate_array<P: AsRef<Path>>(
        &mut self,
        buffers: &mut BufferAllocator<D>,
        cache: &mut ImageCache,
        paths: &[P],
        usage: vk::ImageUsageFlags,
        options: ImageLoadOptions,
        recording: Recording,
    ) -> Result<(ImageHandle, Vec<ImageMetadata>)> {
        if paths.is_empty() {
            return Err(GpuError::Precondition("image array needs at least one source".into()));
        }

        let sources = paths
            .iter()
            .map(|p| cache.load(p.as_ref(), options.flip_vertically))
            .collect::<Result<Vec<_>>>()?;

        let format = match options.format {
            Some(format) => format,
            None => {
                let channels = sources[0].source_channels;
                if let Some(mismatch) = sources.iter().find(|s| s.source_channels != channels) {
                    return Err(GpuError::Precondition(format!(
                        "image array sources disagree on channel count ({channels} vs {})",
                        mismatch.source_channels
                    )));
                }
                select_upload_format(crate::loader::BYTES_PER_PIXEL, options.kind)?
            }
        };

        let extent = sources.iter().fold(vk::Extent2D::default(), |acc, s| vk::Extent2D {
            width: acc.width.max(s.width),
            height: acc.height.max(s.height),
        });

        let layers = u32::try_from(sources.len())
            .map_err(|_| GpuError::Precondition("too many array layers".into()))?;
        let handle = self.upload_layers(buffers, &sources, extent, format, usage, layers, recording)?;

        tracing::debug!(
            ?handle,
            width = extent.width,
            height = extent.height,
            layers,
            ?format,
            "Uploaded image"
        );

        Ok((handle, sources.iter().map(|s| s.metadata()).collect()))
    }

    #[allow(clippy::too_many_arguments)]
    fn upload_layers(
        &mut self,
        buffers: &mut BufferAllocator<D>,
        sources: &[Arc<LoadedImage>],
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        layers: u32,
        recording: Recording,
    ) -> Result<ImageHandle> {
        let total: vk::DeviceSize = sources.iter().map(|s| s.byte_len()).sum();
        let staging = buffers.allocate(
            total,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::SharingMode::EXCLUSIVE,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;

        let result = self.fill_and_copy(
            buffers, staging, sources, extent, format, usage, layers, recording,
        );

        let released = match recording {
            Recording::Immediate => buffers.free(staging),
            Recording::Into(_) => buffers.retire(staging),
        };
        let handle = result?;
        released?;
        Ok(handle)
    }

    #[allow(clippy::too_many_arguments)]
    fn fill_and_copy(
        &mut self,
        buffers: &mut BufferAllocator<D>,
        staging: BufferHandle,
        sources: &[Arc<LoadedImage>],
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        layers: u32,
        recording: Recording,
    ) -> Result<ImageHandle> {
        let mut regions = Vec::with_capacity(sources.len());
        let mut offset: vk::DeviceSize = 0;
        for (layer, source) in (0u32..).zip(sources) {
            buffers.write_bytes(staging, offset, &source.pixels)?;
            regions.push(
                vk::BufferImageCopy::default()
                    .buffer_offset(offset)
                    .buffer_row_length(0)
                    .buffer_image_height(0)
                    .image_subresource(
                        vk::ImageSubresourceLayers::default()
                            .aspect_mask(vk::ImageAspectFlags::COLOR)
                            .mip_level(0)
                            .base_array_layer(layer)
                            .layer_count(1),
                    )
                    .image_offset(vk::Offset3D::default())
                    .image_extent(vk::Extent3D {
                        width: source.width,
                        height: source.height,
                        depth: 1,
                    }),
            );
            offset += source.byte_len();
        }

        let src_buffer = buffers.raw(staging)?;
        let handle = self.create(
            extent,
            format,
            usage | vk::ImageUsageFlags::TRANSFER_DST,
            layers,
        )?;
        let image = self.images[handle].image;

        let device = Arc::clone(&self.device);
        let recorded = self.submitter.record(&*device, recording, |cmd| {
            let to_dst = ImageTransition::undefined_to_transfer_dst();
            device.cmd_pipeline_barrier(
                cmd,
                to_dst.src_stage,
                to_dst.dst_stage,
                &[to_dst.barrier(image, layers)],
            );
            device.cmd_copy_buffer_to_image(
                cmd,
                src_buffer,
                image,
                to_dst.new_layout,
                &regions,
            );
            let to_read = ImageTransition::transfer_dst_to_shader_read();
            device.cmd_pipeline_barrier(
                cmd,
                to_read.src_stage,
                to_read.dst_stage,
                &[to_read.barrier(image, layers)],
            );
            Ok(())
        });

        if let Err(e) = recorded {
            self.free_image(handle)?;
            return Err(e);
        }
        Ok(handle)
    }

    /// Create an empty device-local image left in `UNDEFINED` layout.
    pub fn allocate_empty(
        &mut self,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
    ) -> Result<ImageHandle> {
        let handle = self.create(extent, format, usage, 1)?;
        tracing::debug!(?handle, width = extent.width, height = extent.height, ?format, "Allocated empty image");
        Ok(handle)
    }

    fn create(
        &mut self,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        array_layers: u32,
    ) -> Result<ImageHandle> {
        if extent.width == 0 || extent.height == 0 {
            return Err(GpuError::Precondition(format!(
                "image extent {}x{} is empty",
                extent.width, extent.height
            )));
        }

        let create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(array_layers)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = self.device.create_image(&create_info).map_err(|e| {
            tracing::error!(?format, "Failed to create image: {e}");
            GpuError::creation("image")(e)
        })?;

        let requirements = self.device.image_memory_requirements(image);
        let allocation = match allocate_dedicated(
            &*self.device,
            &self.tracker,
            &requirements,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ) {
            Ok(allocation) => allocation,
            Err(e) => {
                self.device.destroy_image(image);
                return Err(e);
            }
        };

        if let Err(e) = self.device.bind_image_memory(image, allocation.memory, 0) {
            tracing::error!("Failed to bind image memory: {e}");
            free_dedicated(&*self.device, &self.tracker, &allocation);
            self.device.destroy_image(image);
            return Err(GpuError::Bind(e));
        }

        Ok(self.images.insert(ImageRecord {
            image,
            allocation,
            info: ImageInfo {
                extent,
                format,
                usage,
                array_layers,
            },
        }))
    }

    /// Record a layout transition for `handle`.
    pub fn transition_image(
        &self,
        handle: ImageHandle,
        transition: &ImageTransition,
        recording: Recording,
    ) -> Result<()> {
        let record = self.image_record(handle)?;
        let barrier = transition.barrier(record.image, record.info.array_layers);
        self.submitter.record(&*self.device, recording, |cmd| {
            self.device.cmd_pipeline_barrier(
                cmd,
                transition.src_stage,
                transition.dst_stage,
                &[barrier],
            );
            Ok(())
        })
    }

    /// Destroy an image and release its memory. Views of the image are destroyed first.
    pub fn free_image(&mut self, handle: ImageHandle) -> Result<()> {
        let record = self
            .images
            .remove(handle)
            .ok_or_else(|| not_found("image", handle))?;

        let dependent: Vec<ImageViewHandle> = self
            .views
            .iter()
            .filter(|(_, v)| v.image == handle)
            .map(|(k, _)| k)
            .collect();
        if !dependent.is_empty() {
            tracing::debug!(?handle, count = dependent.len(), "Destroying views of freed image");
        }
        for view in dependent {
            if let Some(v) = self.views.remove(view) {
                self.device.destroy_image_view(v.view);
            }
        }

        self.device.destroy_image(record.image);
        free_dedicated(&*self.device, &self.tracker, &record.allocation);
        tracing::debug!(?handle, "Freed image");
        Ok(())
    }

    /// Create a view over every layer of `image`.
    pub fn create_image_view(
        &mut self,
        image: ImageHandle,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
    ) -> Result<ImageViewHandle> {
        let record = self.image_record(image)?;
        let layers = record.info.array_layers;
        let view_type = if layers > 1 {
            vk::ImageViewType::TYPE_2D_ARRAY
        } else {
            vk::ImageViewType::TYPE_2D
        };

        let view_info = vk::ImageViewCreateInfo::default()
            .image(record.image)
            .view_type(view_type)
            .format(format)
            .components(vk::ComponentMapping::default())
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(aspect)
                    .base_mip_level(0)
                    .level_count(1)
                    .base_array_layer(0)
                    .layer_count(layers),
            );

        let view = self
            .device
            .create_image_view(&view_info)
            .map_err(GpuError::creation("image view"))?;

        Ok(self.views.insert(ViewRecord { view, image }))
    }

    /// Destroy an image view.
    pub fn free_image_view(&mut self, handle: ImageViewHandle) -> Result<()> {
        let record = self
            .views
            .remove(handle)
            .ok_or_else(|| not_found("image view", handle))?;
        self.device.destroy_image_view(record.view);
        Ok(())
    }

    /// Create a sampler.
    pub fn create_sampler(&mut self, info: &vk::SamplerCreateInfo<'_>) -> Result<SamplerHandle> {
        let sampler = self
            .device
            .create_sampler(info)
            .map_err(GpuError::creation("sampler"))?;
        Ok(self.samplers.insert(sampler))
    }

    /// Destroy a sampler.
    pub fn free_sampler(&mut self, handle: SamplerHandle) -> Result<()> {
        let sampler = self
            .samplers
            .remove(handle)
            .ok_or_else(|| not_found("sampler", handle))?;
        self.device.destroy_sampler(sampler);
        Ok(())
    }

    fn image_record(&self, handle: ImageHandle) -> Result<&ImageRecord> {
        self.images
            .get(handle)
            .ok_or_else(|| not_found("image", handle))
    }

    /// Raw image handle.
    pub fn raw_image(&self, handle: ImageHandle) -> Result<vk::Image> {
        self.image_record(handle).map(|r| r.image)
    }

    /// Creation parameters of an image.
    pub fn info(&self, handle: ImageHandle) -> Result<ImageInfo> {
        self.image_record(handle).map(|r| r.info)
    }

    /// Backing allocation of an image.
    pub fn allocation(&self, handle: ImageHandle) -> Result<Allocation> {
        self.image_record(handle).map(|r| r.allocation)
    }

    /// Raw image view handle.
    pub fn raw_view(&self, handle: ImageViewHandle) -> Result<vk::ImageView> {
        self.views
            .get(handle)
            .map(|v| v.view)
            .ok_or_else(|| not_found("image view", handle))
    }

    /// Image a view was created from.
    pub fn view_owner(&self, handle: ImageViewHandle) -> Result<ImageHandle> {
        self.views
            .get(handle)
            .map(|v| v.image)
            .ok_or_else(|| not_found("image view", handle))
    }

    /// Raw sampler handle.
    pub fn raw_sampler(&self, handle: SamplerHandle) -> Result<vk::Sampler> {
        self.samplers
            .get(handle)
            .copied()
            .ok_or_else(|| not_found("sampler", handle))
    }

    /// Number of live images.
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Number of live image views.
    pub fn view_count(&self) -> usize {
        self.views.len()
    }

    /// Number of live samplers.
    pub fn sampler_count(&self) -> usize {
        self.samplers.len()
    }

    /// Destroy all views, then all images, then all samplers. The device must be idle.
    pub fn shutdown(&mut self) {
        if self.images.is_empty() && self.views.is_empty() && self.samplers.is_empty() {
            return;
        }

        let views = self.views.len();
        for (_, record) in self.views.drain() {
            self.device.destroy_image_view(record.view);
        }

        let images: Vec<ImageRecord> = self.images.drain().map(|(_, r)| r).collect();
        for record in &images {
            self.device.destroy_image(record.image);
            free_dedicated(&*self.device, &self.tracker, &record.allocation);
        }

        let samplers = self.samplers.len();
        for (_, sampler) in self.samplers.drain() {
            self.device.destroy_sampler(sampler);
        }

        tracing::info!(views, images = images.len(), samplers, "Image allocator shut down");
    }
}

impl<D: GpuDevice> Drop for ImageAllocator<D> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn not_found(kind: &str, handle: impl std::fmt::Debug) -> GpuError {
    GpuError::NotFound(format!("{kind} {handle:?}"))
}
