//! GPU resource management and frame submission over Vulkan.
//!
//! This crate provides:
//! - Buffer and image allocation with explicit memory-type selection and staged uploads
//! - Command pools, one-shot submission and caller-owned recording
//! - A frames-in-flight pipeline with render pass, framebuffers and swapchain rebuild
//! - Mesh and model upload on top of the buffer allocator
//! - Descriptor pools and set layouts for binding buffers and sampled images
//! - Instance, device, surface and swapchain bootstrap over `ash`
//!
//! Allocators and the frame pipeline are generic over [`GpuDevice`] and [`Presenter`], so they
//! run against [`AshDevice`] and [`Swapchain`] in an application and against a mock in tests.

pub mod buffer;
pub mod command;
pub mod context;
pub mod deferred;
pub mod descriptors;
pub mod device;
pub mod error;
pub mod frame;
pub mod image;
pub mod instance;
pub mod loader;
pub mod memory;
pub mod model;
pub mod pipeline;
pub mod render_pass;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use buffer::{BufferAllocator, BufferHandle, BufferMetadata};
pub use command::{
    execute_single_time_commands, CommandPool, CommandSubmitter, Recording,
};
pub use context::{GpuContext, GpuContextBuilder};
pub use deferred::{DeferredDeletionQueue, Retired};
pub use descriptors::{
    write_sampled_image, write_storage_buffer, write_storage_image, write_uniform_buffer,
    DescriptorPool, DescriptorSetLayoutBuilder, PoolSizePreset, DEFAULT_MAX_SETS,
};
pub use device::{AshDevice, GpuDevice, Presenter, SubmitBatch};
pub use error::{GpuError, Result};
pub use frame::{FramePipeline, FramePipelineConfig, PresentOutcome};
pub use image::{
    ImageAllocator, ImageHandle, ImageInfo, ImageLoadOptions, ImageTransition, ImageViewHandle,
    SamplerHandle,
};
pub use loader::{select_upload_format, ImageCache, ImageMetadata, LoadedImage, TextureKind};
pub use memory::{select_memory_type, Allocation, AllocationTracker};
pub use model::{
    free_model, upload_mesh, upload_model, GpuMesh, GpuModel, MaterialTextures, MeshData,
    ModelVertex,
};
pub use pipeline::{ComputePipelineDesc, GraphicsPipelineDesc, Pipeline, PipelineDesc};
pub use render_pass::{
    default_colour_attachment, default_depth_attachment, AttachmentDesc, AttachmentKind,
    RenderPassDesc, SubpassDesc,
};
pub use surface::{SurfaceCapabilities, SurfaceContext};
pub use swapchain::{Swapchain, SwapchainConfig};
pub use sync::{create_fence, create_semaphore, FrameSlot, ImageSync};
