//! Scriptable [`Presenter`] for driving the frame pipeline without a window.

use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use stagecraft_gpu::{GpuError, Presenter};
use std::collections::VecDeque;

/// Scripted result of one acquire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    Image(u32),
    Suboptimal(u32),
    OutOfDate,
    Timeout,
}

/// A presenter with `image_count` fake swapchain images.
///
/// Without a script, acquires return images round-robin and presents succeed.
#[derive(Debug)]
pub struct MockPresenter {
    extent: vk::Extent2D,
    format: vk::Format,
    views: Vec<vk::ImageView>,
    next_view: u64,
    next_image: u32,
    acquires: VecDeque<Acquire>,
    presents: VecDeque<VkResult<bool>>,
    acquired: Vec<u32>,
    presented: Vec<u32>,
    recreate_count: usize,
    recreate_extent: Option<vk::Extent2D>,
    recreate_image_count: Option<usize>,
    fail_recreate: bool,
}

impl MockPresenter {
    /// Presenter with `image_count` images of 800x600 `B8G8R8A8_SRGB`.
    pub fn new(image_count: usize) -> Self {
        let mut presenter = Self {
            extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            format: vk::Format::B8G8R8A8_SRGB,
            views: Vec::new(),
            next_view: 0x00F0_0000,
            next_image: 0,
            acquires: VecDeque::new(),
            presents: VecDeque::new(),
            acquired: Vec::new(),
            presented: Vec::new(),
            recreate_count: 0,
            recreate_extent: None,
            recreate_image_count: None,
            fail_recreate: false,
        };
        presenter.make_views(image_count);
        presenter
    }

    /// Change the reported surface format.
    #[must_use]
    pub fn with_format(mut self, format: vk::Format) -> Self {
        self.format = format;
        self
    }

    /// Change the reported extent.
    #[must_use]
    pub fn with_extent(mut self, width: u32, height: u32) -> Self {
        self.extent = vk::Extent2D { width, height };
        self
    }

    /// Queue acquire results, consumed before round-robin resumes.
    pub fn script_acquires(&mut self, script: impl IntoIterator<Item = Acquire>) {
        self.acquires.extend(script);
    }

    /// Queue present results, consumed before presents go back to succeeding.
    pub fn script_presents(&mut self, script: impl IntoIterator<Item = VkResult<bool>>) {
        self.presents.extend(script);
    }

    /// Extent and image count the next [`Presenter::recreate`] switches to.
    pub fn on_recreate(&mut self, extent: vk::Extent2D, image_count: usize) {
        self.recreate_extent = Some(extent);
        self.recreate_image_count = Some(image_count);
    }

    /// Make [`Presenter::recreate`] fail.
    pub fn fail_recreate(&mut self, fail: bool) {
        self.fail_recreate = fail;
    }

    /// Image indices returned by successful acquires, in order.
    pub fn acquired(&self) -> &[u32] {
        &self.acquired
    }

    /// Image indices passed to present, in order.
    pub fn presented(&self) -> &[u32] {
        &self.presented
    }

    /// Number of completed recreates.
    pub fn recreate_count(&self) -> usize {
        self.recreate_count
    }

    fn make_views(&mut self, count: usize) {
        self.views = (0..count)
            .map(|_| {
                self.next_view += 1;
                vk::ImageView::from_raw(self.next_view)
            })
            .collect();
        self.next_image = 0;
    }

    fn round_robin(&mut self) -> u32 {
        let index = self.next_image;
        let count = u32::try_from(self.views.len()).unwrap_or(u32::MAX).max(1);
        self.next_image = (index + 1) % count;
        index
    }
}

impl Presenter for MockPresenter {
    fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn format(&self) -> vk::Format {
        self.format
    }

    fn image_count(&self) -> usize {
        self.views.len()
    }

    fn image_view(&self, index: usize) -> vk::ImageView {
        self.views.get(index).copied().unwrap_or_else(vk::ImageView::null)
    }

    fn acquire_next_image(
        &mut self,
        _semaphore: vk::Semaphore,
        _timeout_ns: u64,
    ) -> VkResult<(u32, bool)> {
        let (index, suboptimal) = match self.acquires.pop_front() {
            Some(Acquire::Image(index)) => (index, false),
            Some(Acquire::Suboptimal(index)) => (index, true),
            Some(Acquire::OutOfDate) => return Err(vk::Result::ERROR_OUT_OF_DATE_KHR),
            Some(Acquire::Timeout) => return Err(vk::Result::TIMEOUT),
            None => (self.round_robin(), false),
        };
        self.acquired.push(index);
        Ok((index, suboptimal))
    }

    fn present(
        &mut self,
        _queue: vk::Queue,
        image_index: u32,
        _wait_semaphores: &[vk::Semaphore],
    ) -> VkResult<bool> {
        self.presented.push(image_index);
        self.presents.pop_front().unwrap_or(Ok(false))
    }

    fn recreate(&mut self) -> stagecraft_gpu::Result<()> {
        if self.fail_recreate {
            return Err(GpuError::SwapchainCreation("surface lost".into()));
        }
        if let Some(extent) = self.recreate_extent.take() {
            self.extent = extent;
        }
        let count = self.recreate_image_count.take().unwrap_or(self.views.len());
        self.make_views(count);
        self.recreate_count += 1;
        Ok(())
    }
}
