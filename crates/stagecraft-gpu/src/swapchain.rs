//! Swapchain management.

use crate::device::{AshDevice, GpuDevice, Presenter};
use crate::error::{GpuError, Result};
use crate::surface::{SurfaceCapabilities, SurfaceContext};
use ash::prelude::VkResult;
use ash::vk;
use std::sync::Arc;

/// Swapchain configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainConfig {
    /// Desired width, used when the surface leaves the extent to the application.
    pub width: u32,
    pub height: u32,
    pub vsync: bool,
}

impl Default for SwapchainConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            vsync: true,
        }
    }
}

impl SwapchainConfig {
    /// Set the desired extent.
    pub fn with_extent(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Enable or disable vsync.
    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }
}

/// Swapchain images and views presented to a surface.
pub struct Swapchain {
    device: Arc<AshDevice>,
    loader: ash::khr::swapchain::Device,
    surface_loader: ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
    config: SwapchainConfig,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    format: vk::Format,
    extent: vk::Extent2D,
}

impl Swapchain {
    /// Create a swapchain for `surface`.
    pub fn new(
        device: Arc<AshDevice>,
        surface: &SurfaceContext,
        config: SwapchainConfig,
    ) -> Result<Self> {
        let mut swapchain = Self {
            loader: surface.swapchain_loader.clone(),
            surface_loader: surface.surface_loader.clone(),
            surface: surface.surface,
            device,
            config,
            swapchain: vk::SwapchainKHR::null(),
            images: Vec::new(),
            image_views: Vec::new(),
            format: vk::Format::UNDEFINED,
            extent: vk::Extent2D::default(),
        };
        unsafe { swapchain.build()? };
        Ok(swapchain)
    }

    /// Update the desired extent, typically on window resize. Takes effect on recreation.
    pub fn set_extent(&mut self, width: u32, height: u32) {
        self.config.width = width;
        self.config.height = height;
    }

    /// Raw swapchain handle.
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    /// Swapchain images.
    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    /// Build the swapchain, retiring the current one if present.
    ///
    /// # Safety
    /// The current swapchain's images must not be in use.
    unsafe fn build(&mut self) -> Result<()> {
        let caps = unsafe {
            SurfaceCapabilities::query(
                &self.surface_loader,
                self.device.physical_device(),
                self.surface,
            )?
        };
        let surface_format = select_surface_format(&caps.formats)?;
        let present_mode = select_present_mode(&caps.present_modes, self.config.vsync);
        let extent = calculate_extent(&caps.capabilities, self.config.width, self.config.height);
        let image_count = select_image_count(&caps.capabilities);

        let queue_families = [self.device.graphics_queue_family()];
        let old_swapchain = self.swapchain;
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .queue_family_indices(&queue_families)
            .pre_transform(caps.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let swapchain = unsafe { self.loader.create_swapchain(&create_info, None) }
            .map_err(|e| GpuError::SwapchainCreation(e.to_string()))?;

        unsafe { self.destroy_views() };
        if old_swapchain != vk::SwapchainKHR::null() {
            unsafe { self.loader.destroy_swapchain(old_swapchain, None) };
        }
        self.swapchain = swapchain;
        self.format = surface_format.format;
        self.extent = extent;

        self.images = unsafe { self.loader.get_swapchain_images(swapchain)? };
        for &image in &self.images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(surface_format.format)
                .components(vk::ComponentMapping::default())
                .subresource_range(
                    vk::ImageSubresourceRange::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .base_mip_level(0)
                        .level_count(1)
                        .base_array_layer(0)
                        .layer_count(1),
                );
            let view = unsafe { self.device.raw().create_image_view(&view_info, None) }
                .map_err(GpuError::creation("swapchain image view"))?;
            self.image_views.push(view);
        }

        tracing::info!(
            width = extent.width,
            height = extent.height,
            images = self.images.len(),
            ?present_mode,
            format = ?surface_format.format,
            "Created swapchain"
        );
        Ok(())
    }

    unsafe fn destroy_views(&mut self) {
        for view in self.image_views.drain(..) {
            unsafe { self.device.raw().destroy_image_view(view, None) };
        }
    }
}

impl Presenter for Swapchain {
    fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn format(&self) -> vk::Format {
        self.format
    }

    fn image_count(&self) -> usize {
        self.image_views.len()
    }

    fn image_view(&self, index: usize) -> vk::ImageView {
        self.image_views
            .get(index)
            .copied()
            .unwrap_or(vk::ImageView::null())
    }

    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    fn acquire_next_image(
        &mut self,
        semaphore: vk::Semaphore,
        timeout_ns: u64,
    ) -> VkResult<(u32, bool)> {
        unsafe {
            self.loader
                .acquire_next_image(self.swapchain, timeout_ns, semaphore, vk::Fence::null())
        }
    }

    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    fn present(
        &mut self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> VkResult<bool> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        unsafe { self.loader.queue_present(queue, &present_info) }
    }

    fn recreate(&mut self) -> Result<()> {
        // Callers wait for device idle before recreating
        unsafe { self.build() }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe {
            self.destroy_views();
            if self.swapchain != vk::SwapchainKHR::null() {
                self.loader.destroy_swapchain(self.swapchain, None);
            }
        }
    }
}

/// Select the best surface format, preferring sRGB BGRA.
pub fn select_surface_format(available: &[vk::SurfaceFormatKHR]) -> Result<vk::SurfaceFormatKHR> {
    available
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| available.first())
        .copied()
        .ok_or_else(|| GpuError::SwapchainCreation("surface reports no formats".into()))
}

/// Select the best present mode.
pub fn select_present_mode(available: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }
    // Mailbox, then immediate, then FIFO (always supported)
    [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
        .into_iter()
        .find(|mode| available.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// Calculate swapchain extent.
pub fn calculate_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired_width: u32,
    desired_height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: desired_width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: desired_height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

/// One more than the minimum image count, capped by the maximum (0 means no cap).
pub fn select_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}
