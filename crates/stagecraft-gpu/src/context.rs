//! GPU context management.

use crate::command::{CommandPool, CommandSubmitter};
use crate::device::{AshDevice, GpuDevice};
use crate::error::{GpuError, Result};
use crate::instance::{create_instance, find_graphics_queue_family, select_physical_device};
use crate::memory::AllocationTracker;
use ash::vk;
use std::ffi::{c_char, CStr};
use std::sync::Arc;

/// Instance, device and the graphics command pool.
///
/// Allocators, frame pipelines and swapchains built from this context must be dropped first.
pub struct GpuContext {
    // Entry must be kept alive for the lifetime of the context
    entry: ash::Entry,
    instance: ash::Instance,
    device: Arc<AshDevice>,
    command_pool: CommandPool,
    tracker: Arc<AllocationTracker>,
}

impl GpuContext {
    /// The device seam shared with allocators and frame pipelines.
    pub fn device(&self) -> &Arc<AshDevice> {
        &self.device
    }

    /// Raw `ash` device.
    pub fn raw_device(&self) -> &ash::Device {
        self.device.raw()
    }

    /// Get the physical device handle.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.device.physical_device()
    }

    /// Get the Vulkan entry point.
    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    /// Get the Vulkan instance handle.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get the graphics queue.
    pub fn graphics_queue(&self) -> vk::Queue {
        self.device.graphics_queue()
    }

    /// Get the graphics queue family index.
    pub fn graphics_queue_family(&self) -> u32 {
        self.device.graphics_queue_family()
    }

    /// Graphics command pool. Command buffers can be reset individually.
    pub fn command_pool(&self) -> CommandPool {
        self.command_pool
    }

    /// One-shot submitter on the graphics queue.
    pub fn submitter(&self) -> CommandSubmitter {
        CommandSubmitter::for_graphics(&*self.device, self.command_pool)
    }

    /// Tracker to share between the buffer and image allocators.
    pub fn tracker(&self) -> &Arc<AllocationTracker> {
        &self.tracker
    }

    /// Wait for device to be idle.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn wait_idle(&self) -> Result<()> {
        self.device.device_wait_idle()?;
        Ok(())
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        if let Err(e) = self.device.device_wait_idle() {
            tracing::warn!("device_wait_idle failed during shutdown: {e}");
        }
        if Arc::strong_count(&self.device) > 1 {
            tracing::warn!("GPU context dropped while device handles are still shared");
        }
        self.command_pool.destroy(&*self.device);
        unsafe {
            self.device.raw().destroy_device(None);
            self.instance.destroy_instance(None);
        }
        tracing::info!("GPU context destroyed");
    }
}

/// Builder for creating a GPU context.
pub struct GpuContextBuilder {
    app_name: String,
    enable_validation: bool,
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "Stagecraft".to_string(),
            enable_validation: cfg!(debug_assertions),
        }
    }
}

impl GpuContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Build the GPU context.
    pub fn build(self) -> Result<GpuContext> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Other(format!("Failed to load Vulkan: {e}")))?;

        let instance = unsafe { create_instance(&entry, &self.app_name, self.enable_validation) }?;

        match unsafe { create_device(&instance) } {
            Ok((device, command_pool)) => Ok(GpuContext {
                entry,
                instance,
                device,
                command_pool,
                tracker: Arc::new(AllocationTracker::new()),
            }),
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                Err(e)
            }
        }
    }
}

/// Required device extensions.
fn required_device_extensions() -> [&'static CStr; 1] {
    [ash::khr::swapchain::NAME]
}

/// Pick a physical device, create the logical device and its graphics command pool.
///
/// # Safety
/// The instance must be valid.
unsafe fn create_device(instance: &ash::Instance) -> Result<(Arc<AshDevice>, CommandPool)> {
    let physical_device = unsafe { select_physical_device(instance) }?;
    let graphics_family = unsafe { find_graphics_queue_family(instance, physical_device) }
        .ok_or(GpuError::NoSuitableDevice)?;

    let queue_priority = 1.0_f32;
    let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
        .queue_family_index(graphics_family)
        .queue_priorities(std::slice::from_ref(&queue_priority))];

    let extension_names: Vec<*const c_char> = required_device_extensions()
        .iter()
        .map(|ext| ext.as_ptr())
        .collect();

    let features = vk::PhysicalDeviceFeatures::default();

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .enabled_features(&features);

    let device = unsafe { instance.create_device(physical_device, &device_create_info, None) }
        .map_err(|e| {
            tracing::error!("Failed to create logical device: {e}");
            GpuError::from(e)
        })?;

    let device = Arc::new(unsafe {
        AshDevice::new(instance.clone(), physical_device, device, graphics_family)
    });

    match CommandPool::new(&*device, graphics_family) {
        Ok(pool) => {
            tracing::info!(graphics_family, "Created logical device");
            Ok((device, pool))
        }
        Err(e) => {
            unsafe { device.raw().destroy_device(None) };
            Err(e)
        }
    }
}
