//! Frames in flight: acquire, wait, record, submit, present.
//!
//! Each frame slot owns a command buffer, an image-available semaphore and an in-flight fence.
//! Each swapchain image owns a render-finished semaphore and remembers the fence of the slot
//! that last rendered to it. Slots and images are counted independently, so a slot may land on
//! an image still being rendered by another slot; the per-image fence catches that case.

use crate::command::{begin_command_buffer, end_command_buffer, submit_command_buffers, CommandPool};
use crate::device::{GpuDevice, Presenter, SubmitBatch};
use crate::error::{GpuError, Result};
use crate::image::{ImageAllocator, ImageViewHandle};
use crate::render_pass::{create_render_pass, RenderPassDesc, RenderTargets};
use crate::sync::{
    create_image_syncs, create_semaphore, reset_fence, wait_for_fence, FrameSlot, ImageSync,
};
use ash::vk;
use std::sync::Arc;

/// Frame pipeline configuration.
#[derive(Debug, Clone)]
pub struct FramePipelineConfig {
    /// Number of frame slots.
    pub frames_in_flight: usize,
    /// Timeout for fence waits, in nanoseconds.
    pub fence_timeout_ns: u64,
    /// Timeout for swapchain image acquisition, in nanoseconds.
    pub acquire_timeout_ns: u64,
    pub render_pass: RenderPassDesc,
}

impl Default for FramePipelineConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            fence_timeout_ns: u64::MAX,
            acquire_timeout_ns: u64::MAX,
            render_pass: RenderPassDesc::default(),
        }
    }
}

impl FramePipelineConfig {
    /// Set the number of frames in flight.
    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames;
        self
    }

    /// Bound fence waits.
    pub fn with_fence_timeout(mut self, timeout_ns: u64) -> Self {
        self.fence_timeout_ns = timeout_ns;
        self
    }

    /// Bound image acquisition.
    pub fn with_acquire_timeout(mut self, timeout_ns: u64) -> Self {
        self.acquire_timeout_ns = timeout_ns;
        self
    }

    /// Use a custom render pass.
    pub fn with_render_pass(mut self, render_pass: RenderPassDesc) -> Self {
        self.render_pass = render_pass;
        self
    }
}

/// Result of [`FramePipeline::submit_and_present`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    /// The swapchain is suboptimal or out of date; call [`FramePipeline::rebuild`].
    NeedsRebuild,
}

/// Drives the per-frame acquire/record/submit/present cycle.
pub struct FramePipeline<D: GpuDevice, P: Presenter> {
    device: Arc<D>,
    presenter: P,
    pool: CommandPool,
    config: FramePipelineConfig,
    formats: Vec<vk::Format>,
    render_pass: vk::RenderPass,
    targets: RenderTargets,
    slots: Vec<FrameSlot>,
    images: Vec<ImageSync>,
    current_frame: usize,
    /// Image acquired by the open frame; `Some` between start and submit.
    acquired: Option<u32>,
    acquire_suboptimal: bool,
    /// Image acquired by a `start_frame` that timed out on the image's fence. The slot's
    /// semaphore is already signaled for it.
    pending_acquire: Option<(u32, bool)>,
}

impl<D: GpuDevice, P: Presenter> FramePipeline<D, P> {
    /// Create the render pass, attachments, framebuffers and sync objects.
    ///
    /// Attachment images are allocated from `images` and must be returned with
    /// [`FramePipeline::destroy`].
    pub fn new(
        device: Arc<D>,
        presenter: P,
        pool: CommandPool,
        images: &mut ImageAllocator<D>,
        config: FramePipelineConfig,
    ) -> Result<Self> {
        if config.frames_in_flight == 0 {
            return Err(GpuError::Precondition(
                "frames_in_flight must be at least 1".into(),
            ));
        }
        config.render_pass.validate()?;

        let formats = config
            .render_pass
            .resolve_formats(&*device, presenter.format())?;

        let mut pipeline = Self {
            device,
            presenter,
            pool,
            config,
            formats,
            render_pass: vk::RenderPass::null(),
            targets: RenderTargets::default(),
            slots: Vec::new(),
            images: Vec::new(),
            current_frame: 0,
            acquired: None,
            acquire_suboptimal: false,
            pending_acquire: None,
        };

        if let Err(e) = pipeline.build(images) {
            pipeline.release(Some(images));
            return Err(e);
        }

        tracing::info!(
            frames_in_flight = pipeline.slots.len(),
            swapchain_images = pipeline.images.len(),
            "Frame pipeline created"
        );
        Ok(pipeline)
    }

    fn build(&mut self, images: &mut ImageAllocator<D>) -> Result<()> {
        let device = &*self.device;
        let frames = u32::try_from(self.config.frames_in_flight)
            .map_err(|_| GpuError::Precondition("too many frames in flight".into()))?;

        let command_buffers = self.pool.allocate_command_buffers(device, frames)?;
        for (i, &cmd) in command_buffers.iter().enumerate() {
            match FrameSlot::new(device, cmd) {
                Ok(slot) => self.slots.push(slot),
                Err(e) => {
                    self.pool
                        .free_command_buffers(device, &command_buffers[i..]);
                    return Err(e);
                }
            }
        }

        self.render_pass = create_render_pass(device, &self.config.render_pass, &self.formats)?;
        self.targets = RenderTargets::create(
            device,
            images,
            &self.presenter,
            self.render_pass,
            &self.config.render_pass,
            &self.formats,
        )?;
        self.images = create_image_syncs(device, self.presenter.image_count())?;
        Ok(())
    }

    /// Begin a frame and return its command buffer, already inside the render pass.
    ///
    /// Blocks until the slot's previous submission and the acquired image's previous user
    /// have completed. Returns [`GpuError::SwapchainOutOfDate`] without touching slot state when
    /// the swapchain must be rebuilt first. If the wait on the image's previous user times out,
    /// the acquired image is kept and the next call resumes with it.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn start_frame(&mut self, clear_values: &[vk::ClearValue]) -> Result<vk::CommandBuffer> {
        if self.acquired.is_some() {
            return Err(GpuError::Precondition(
                "start_frame called while a frame is already open".into(),
            ));
        }

        let device = &*self.device;
        let slot = self.slots[self.current_frame];

        wait_for_fence(device, slot.in_flight, self.config.fence_timeout_ns)?;

        let (image_index, suboptimal) = match self.pending_acquire.take() {
            Some(pending) => pending,
            None => match self
                .presenter
                .acquire_next_image(slot.image_available, self.config.acquire_timeout_ns)
            {
                Ok(acquired) => acquired,
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                    tracing::debug!("Swapchain out of date on acquire");
                    return Err(GpuError::SwapchainOutOfDate);
                }
                Err(e) => return Err(GpuError::from_wait("swapchain image", e)),
            },
        };

        let index = image_index as usize;
        let image = self.images.get_mut(index).ok_or_else(|| {
            GpuError::Other(format!("presenter returned image index {image_index} out of range"))
        })?;

        if let Some(previous) = image.last_fence {
            if previous != slot.in_flight {
                if let Err(e) = wait_for_fence(device, previous, self.config.fence_timeout_ns) {
                    tracing::debug!(image = image_index, "Image still in use, keeping acquisition");
                    self.pending_acquire = Some((image_index, suboptimal));
                    return Err(e);
                }
            }
        }
        image.last_fence = Some(slot.in_flight);

        reset_fence(device, slot.in_flight)?;

        device
            .reset_command_buffer(slot.command_buffer)
            .map_err(GpuError::CommandRecord)?;
        begin_command_buffer(
            device,
            slot.command_buffer,
            vk::CommandBufferUsageFlags::empty(),
        )?;

        let render_pass_info = vk::RenderPassBeginInfo::default()
            .render_pass(self.render_pass)
            .framebuffer(self.targets.framebuffers[index])
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: self.presenter.extent(),
            })
            .clear_values(clear_values);
        device.cmd_begin_render_pass(slot.command_buffer, &render_pass_info);

        self.acquired = Some(image_index);
        self.acquire_suboptimal = suboptimal;
        tracing::trace!(frame = self.current_frame, image = image_index, "Frame started");

        Ok(slot.command_buffer)
    }

    /// End the open frame, submit it and present its image.
    ///
    /// The slot advances even when presentation reports the swapchain needs rebuilding.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn submit_and_present(&mut self) -> Result<PresentOutcome> {
        let image_index = self.acquired.take().ok_or_else(|| {
            GpuError::Precondition("submit_and_present called without start_frame".into())
        })?;

        let device = &*self.device;
        let slot = self.slots[self.current_frame];
        let render_finished = self.images[image_index as usize].render_finished;

        device.cmd_end_render_pass(slot.command_buffer);
        end_command_buffer(device, slot.command_buffer)?;

        let command_buffers = [slot.command_buffer];
        let wait_semaphores = [slot.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [render_finished];
        let batch = SubmitBatch {
            command_buffers: &command_buffers,
            wait_semaphores: &wait_semaphores,
            wait_stages: &wait_stages,
            signal_semaphores: &signal_semaphores,
        };
        submit_command_buffers(device, device.graphics_queue(), &batch, slot.in_flight)
            .inspect_err(|e| tracing::error!("Failed to submit frame: {e}"))?;

        let presented =
            self.presenter
                .present(device.graphics_queue(), image_index, &signal_semaphores);

        self.current_frame = (self.current_frame + 1) % self.slots.len();

        match presented {
            Ok(false) if !self.acquire_suboptimal => Ok(PresentOutcome::Presented),
            Ok(_) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                tracing::debug!(image = image_index, "Swapchain needs rebuilding after present");
                Ok(PresentOutcome::NeedsRebuild)
            }
            Err(e) => Err(GpuError::from(e)),
        }
    }

    /// Recreate the swapchain and everything sized by it.
    ///
    /// Waits for the device to go idle. Attachment images and framebuffers are rebuilt, and
    /// per-image semaphores and fence records are recreated for the new image count.
    pub fn rebuild(&mut self, images: &mut ImageAllocator<D>) -> Result<()> {
        if self.acquired.is_some() {
            return Err(GpuError::Precondition(
                "cannot rebuild while a frame is open".into(),
            ));
        }

        let device = Arc::clone(&self.device);
        device.device_wait_idle()?;

        // A kept acquisition left the slot's semaphore signaled with no waiter.
        if self.pending_acquire.take().is_some() {
            let slot = &mut self.slots[self.current_frame];
            let fresh = create_semaphore(&*device)?;
            device.destroy_semaphore(slot.image_available);
            slot.image_available = fresh;
        }

        self.targets.destroy(&*device, Some(images));
        for sync in self.images.drain(..) {
            sync.destroy(&*device);
        }

        self.presenter.recreate()?;

        let formats = self
            .config
            .render_pass
            .resolve_formats(&*device, self.presenter.format())?;
        if formats != self.formats {
            device.destroy_render_pass(self.render_pass);
            self.render_pass = vk::RenderPass::null();
            self.render_pass = create_render_pass(&*device, &self.config.render_pass, &formats)?;
            self.formats = formats;
        }

        self.targets = RenderTargets::create(
            &*device,
            images,
            &self.presenter,
            self.render_pass,
            &self.config.render_pass,
            &self.formats,
        )?;
        self.images = create_image_syncs(&*device, self.presenter.image_count())?;
        self.acquire_suboptimal = false;

        let extent = self.presenter.extent();
        tracing::info!(
            width = extent.width,
            height = extent.height,
            images = self.images.len(),
            "Swapchain rebuilt"
        );
        Ok(())
    }

    /// Command buffer of the open frame.
    pub fn current_command_buffer(&self) -> Option<vk::CommandBuffer> {
        self.acquired
            .map(|_| self.slots[self.current_frame].command_buffer)
    }

    /// Image index acquired by the open frame.
    pub fn image_index(&self) -> Option<u32> {
        self.acquired
    }

    /// Index of the current frame slot.
    pub fn current_frame(&self) -> usize {
        self.current_frame
    }

    /// Number of frame slots.
    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    /// Number of swapchain images tracked.
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// The render pass draws are recorded against.
    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    /// Resolved format of every attachment, swapchain last.
    pub fn attachment_formats(&self) -> &[vk::Format] {
        &self.formats
    }

    /// View of the `index`th owned (non-swapchain) attachment.
    pub fn attachment_view(&self, index: usize) -> Option<ImageViewHandle> {
        self.targets.views.get(index).copied()
    }

    /// Framebuffer used for swapchain image `index`.
    pub fn framebuffer(&self, index: usize) -> Option<vk::Framebuffer> {
        self.targets.framebuffers.get(index).copied()
    }

    /// Fence of the slot that last rendered to swapchain image `index`.
    pub fn image_fence(&self, index: usize) -> Option<vk::Fence> {
        self.images.get(index).and_then(|i| i.last_fence)
    }

    /// The presenter.
    pub fn presenter(&self) -> &P {
        &self.presenter
    }

    /// The presenter, mutably (for resize notifications).
    pub fn presenter_mut(&mut self) -> &mut P {
        &mut self.presenter
    }

    /// Wait for the device and release everything, returning attachments to `images`.
    pub fn destroy(mut self, images: &mut ImageAllocator<D>) {
        self.release(Some(images));
    }

    fn release(&mut self, images: Option<&mut ImageAllocator<D>>) {
        if self.render_pass == vk::RenderPass::null() && self.slots.is_empty() {
            return;
        }

        let device = &*self.device;
        if let Err(e) = device.device_wait_idle() {
            tracing::warn!("device_wait_idle failed during frame pipeline shutdown: {e}");
        }

        for slot in &self.slots {
            device.destroy_fence(slot.in_flight);
        }
        for slot in &self.slots {
            device.destroy_semaphore(slot.image_available);
        }
        for sync in self.images.drain(..) {
            sync.destroy(device);
        }

        self.targets.destroy(device, images);

        if self.render_pass != vk::RenderPass::null() {
            device.destroy_render_pass(self.render_pass);
            self.render_pass = vk::RenderPass::null();
        }

        let command_buffers: Vec<vk::CommandBuffer> =
            self.slots.drain(..).map(|s| s.command_buffer).collect();
        self.pool.free_command_buffers(device, &command_buffers);

        tracing::info!("Frame pipeline shut down");
    }
}

impl<D: GpuDevice, P: Presenter> Drop for FramePipeline<D, P> {
    fn drop(&mut self) {
        self.release(None);
    }
}
