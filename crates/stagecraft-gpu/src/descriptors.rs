//! Descriptor set management.

use crate::device::GpuDevice;
use crate::error::{GpuError, Result};
use ash::vk;

/// Upper bound on sets a pool hands out when none is given.
pub const DEFAULT_MAX_SETS: u32 = 10;

/// Descriptor set layout builder.
pub struct DescriptorSetLayoutBuilder<'a> {
    bindings: Vec<vk::DescriptorSetLayoutBinding<'a>>,
}

impl<'a> DescriptorSetLayoutBuilder<'a> {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            bindings: Vec::new(),
        }
    }

    /// Add a binding.
    pub fn binding(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        count: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(descriptor_type)
                .descriptor_count(count)
                .stage_flags(stage_flags),
        );
        self
    }

    /// Add a storage buffer binding.
    pub fn storage_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::STORAGE_BUFFER, 1, stage_flags)
    }

    /// Add a uniform buffer binding.
    pub fn uniform_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::UNIFORM_BUFFER, 1, stage_flags)
    }

    /// Add a storage image binding.
    pub fn storage_image(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::STORAGE_IMAGE, 1, stage_flags)
    }

    /// Add a combined image sampler binding.
    pub fn sampled_image(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(
            binding,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            1,
            stage_flags,
        )
    }

    /// Number of bindings added so far.
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Build the descriptor set layout.
    ///
    /// The caller owns the layout until it is handed to [`DescriptorPool::allocate`].
    pub fn build<D: GpuDevice>(self, device: &D) -> Result<vk::DescriptorSetLayout> {
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&self.bindings);

        device
            .create_descriptor_set_layout(&layout_info)
            .map_err(GpuError::creation("descriptor set layout"))
    }
}

impl Default for DescriptorSetLayoutBuilder<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// Single-descriptor pool sizes for common bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolSizePreset {
    StorageBuffer,
    UniformBuffer,
    CombinedImageSampler,
}

impl PoolSizePreset {
    /// Room for one descriptor of this kind.
    pub fn size(self) -> vk::DescriptorPoolSize {
        let ty = match self {
            Self::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
            Self::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            Self::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        };
        vk::DescriptorPoolSize::default().ty(ty).descriptor_count(1)
    }
}

/// Descriptor pool for allocating descriptor sets.
///
/// Sets can be freed one by one. Layouts passed to [`DescriptorPool::allocate`] become owned by
/// the pool and are destroyed with it.
#[derive(Debug)]
pub struct DescriptorPool {
    pool: vk::DescriptorPool,
    max_sets: u32,
    layouts: Vec<vk::DescriptorSetLayout>,
}

impl DescriptorPool {
    /// Create a pool of at most `max_sets` sets drawing on `pool_sizes`.
    pub fn new<D: GpuDevice>(
        device: &D,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<Self> {
        if max_sets == 0 || pool_sizes.is_empty() {
            return Err(GpuError::Precondition(
                "descriptor pool needs at least one set and one pool size".into(),
            ));
        }

        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes)
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET);

        let pool = device.create_descriptor_pool(&create_info).map_err(|e| {
            tracing::error!(max_sets, "Failed to create descriptor pool: {e}");
            GpuError::creation("descriptor pool")(e)
        })?;

        tracing::debug!(max_sets, sizes = pool_sizes.len(), "Created descriptor pool");
        Ok(Self {
            pool,
            max_sets,
            layouts: Vec::new(),
        })
    }

    /// Pool of [`DEFAULT_MAX_SETS`] sets sized from presets.
    pub fn with_presets<D: GpuDevice>(device: &D, presets: &[PoolSizePreset]) -> Result<Self> {
        let sizes: Vec<vk::DescriptorPoolSize> = presets.iter().map(|p| p.size()).collect();
        Self::new(device, DEFAULT_MAX_SETS, &sizes)
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }

    /// Maximum number of sets the pool was created for.
    pub fn max_sets(&self) -> u32 {
        self.max_sets
    }

    /// Layouts the pool owns, in the order first seen.
    pub fn owned_layouts(&self) -> &[vk::DescriptorSetLayout] {
        &self.layouts
    }

    /// Allocate one set, taking ownership of `layout`.
    pub fn allocate<D: GpuDevice>(
        &mut self,
        device: &D,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet> {
        self.allocate_many(device, &[layout])?
            .first()
            .copied()
            .ok_or_else(|| GpuError::Other("Device returned no descriptor sets".into()))
    }

    /// Allocate one set per layout, taking ownership of every distinct layout.
    ///
    /// Ownership is taken even when allocation fails.
    pub fn allocate_many<D: GpuDevice>(
        &mut self,
        device: &D,
        layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Vec<vk::DescriptorSet>> {
        for &layout in layouts {
            if !self.layouts.contains(&layout) {
                self.layouts.push(layout);
            }
        }

        let sets = device
            .allocate_descriptor_sets(self.pool, layouts)
            .map_err(|e| {
                tracing::error!(count = layouts.len(), "Failed to allocate descriptor sets: {e}");
                GpuError::creation("descriptor set")(e)
            })?;
        tracing::trace!(count = sets.len(), "Allocated descriptor sets");
        Ok(sets)
    }

    /// Return sets to the pool.
    pub fn free<D: GpuDevice>(&self, device: &D, sets: &[vk::DescriptorSet]) -> Result<()> {
        if sets.is_empty() {
            return Ok(());
        }
        device.free_descriptor_sets(self.pool, sets)?;
        tracing::trace!(count = sets.len(), "Freed descriptor sets");
        Ok(())
    }

    /// Reset the pool, invalidating every set allocated from it. Owned layouts survive.
    pub fn reset<D: GpuDevice>(&self, device: &D) -> Result<()> {
        device.reset_descriptor_pool(self.pool)?;
        Ok(())
    }

    /// Destroy the pool, its sets and every owned layout.
    pub fn destroy<D: GpuDevice>(self, device: &D) {
        device.destroy_descriptor_pool(self.pool);
        for &layout in &self.layouts {
            device.destroy_descriptor_set_layout(layout);
        }
        tracing::debug!(layouts = self.layouts.len(), "Descriptor pool destroyed");
    }
}

/// Write a uniform buffer descriptor.
pub fn write_uniform_buffer<D: GpuDevice>(
    device: &D,
    dst_set: vk::DescriptorSet,
    binding: u32,
    buffer: vk::Buffer,
    offset: u64,
    range: u64,
) {
    write_buffer(
        device,
        dst_set,
        binding,
        vk::DescriptorType::UNIFORM_BUFFER,
        buffer,
        offset,
        range,
    );
}

/// Write a storage buffer descriptor.
pub fn write_storage_buffer<D: GpuDevice>(
    device: &D,
    dst_set: vk::DescriptorSet,
    binding: u32,
    buffer: vk::Buffer,
    offset: u64,
    range: u64,
) {
    write_buffer(
        device,
        dst_set,
        binding,
        vk::DescriptorType::STORAGE_BUFFER,
        buffer,
        offset,
        range,
    );
}

fn write_buffer<D: GpuDevice>(
    device: &D,
    dst_set: vk::DescriptorSet,
    binding: u32,
    descriptor_type: vk::DescriptorType,
    buffer: vk::Buffer,
    offset: u64,
    range: u64,
) {
    let buffer_info = vk::DescriptorBufferInfo::default()
        .buffer(buffer)
        .offset(offset)
        .range(range);

    let write = vk::WriteDescriptorSet::default()
        .dst_set(dst_set)
        .dst_binding(binding)
        .descriptor_type(descriptor_type)
        .buffer_info(std::slice::from_ref(&buffer_info));

    device.update_descriptor_sets(&[write]);
}

/// Write a storage image descriptor.
pub fn write_storage_image<D: GpuDevice>(
    device: &D,
    dst_set: vk::DescriptorSet,
    binding: u32,
    image_view: vk::ImageView,
    layout: vk::ImageLayout,
) {
    let image_info = vk::DescriptorImageInfo::default()
        .image_view(image_view)
        .image_layout(layout);

    let write = vk::WriteDescriptorSet::default()
        .dst_set(dst_set)
        .dst_binding(binding)
        .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
        .image_info(std::slice::from_ref(&image_info));

    device.update_descriptor_sets(&[write]);
}

/// Write a combined image sampler descriptor for an image in `SHADER_READ_ONLY_OPTIMAL`.
pub fn write_sampled_image<D: GpuDevice>(
    device: &D,
    dst_set: vk::DescriptorSet,
    binding: u32,
    image_view: vk::ImageView,
    sampler: vk::Sampler,
) {
    let image_info = vk::DescriptorImageInfo::default()
        .image_view(image_view)
        .sampler(sampler)
        .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);

    let write = vk::WriteDescriptorSet::default()
        .dst_set(dst_set)
        .dst_binding(binding)
        .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
        .image_info(std::slice::from_ref(&image_info));

    device.update_descriptor_sets(&[write]);
}
