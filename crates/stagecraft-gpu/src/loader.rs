//! Pixel loading and upload-format selection.

use crate::error::{GpuError, Result};
use ash::vk;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Bytes per uploaded pixel. Sources are always expanded to RGBA8.
pub const BYTES_PER_PIXEL: u32 = 4;

/// What a texture's texels mean, which decides whether the sampler should decode sRGB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureKind {
    Diffuse,
    Normal,
    Specular,
    Metallic,
    Roughness,
    AmbientOcclusion,
}

impl TextureKind {
    /// Every kind, in material slot order.
    pub const ALL: [Self; 6] = [
        Self::Diffuse,
        Self::Normal,
        Self::Specular,
        Self::Metallic,
        Self::Roughness,
        Self::AmbientOcclusion,
    ];

    /// Whether texels are colours (sRGB encoded) rather than numeric data.
    pub fn is_color(self) -> bool {
        matches!(self, Self::Diffuse)
    }
}

/// Pick the 8-bit format for `channels` channels.
///
/// Colour data (including an absent hint) uses sRGB formats; everything else uses UNORM.
pub fn select_upload_format(channels: u32, kind: Option<TextureKind>) -> Result<vk::Format> {
    let srgb = kind.map_or(true, TextureKind::is_color);
    let format = match (channels, srgb) {
        (1, true) => vk::Format::R8_SRGB,
        (2, true) => vk::Format::R8G8_SRGB,
        (3, true) => vk::Format::R8G8B8_SRGB,
        (4, true) => vk::Format::R8G8B8A8_SRGB,
        (1, false) => vk::Format::R8_UNORM,
        (2, false) => vk::Format::R8G8_UNORM,
        (3, false) => vk::Format::R8G8B8_UNORM,
        (4, false) => vk::Format::R8G8B8A8_UNORM,
        _ => {
            return Err(GpuError::Precondition(format!(
                "unsupported channel count {channels}"
            )))
        }
    };
    Ok(format)
}

/// Decoded pixels, always RGBA8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedImage {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Channel count of the source file before expansion to RGBA.
    pub source_channels: u32,
}

impl LoadedImage {
    /// Wrap RGBA8 pixels. `pixels.len()` must equal `width * height * 4`.
    pub fn from_rgba8(
        pixels: Vec<u8>,
        width: u32,
        height: u32,
        source_channels: u32,
    ) -> Result<Self> {
        let expected = width as usize * height as usize * BYTES_PER_PIXEL as usize;
        if pixels.len() != expected || expected == 0 {
            return Err(GpuError::Precondition(format!(
                "{width}x{height} RGBA8 image needs {expected} bytes, got {}",
                pixels.len()
            )));
        }
        Ok(Self {
            pixels,
            width,
            height,
            source_channels,
        })
    }

    /// Size of the pixel data in bytes.
    pub fn byte_len(&self) -> vk::DeviceSize {
        self.pixels.len() as vk::DeviceSize
    }

    /// Size and source channel count.
    pub fn metadata(&self) -> ImageMetadata {
        ImageMetadata {
            width: self.width,
            height: self.height,
            channels: self.source_channels,
        }
    }
}

/// Dimensions and channel count reported for a loaded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageMetadata {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
}

/// Decoded images keyed by path and flip, owned by the caller.
///
/// Nothing is shared between instances; dropping the cache drops every entry.
#[derive(Debug, Default)]
pub struct ImageCache {
    entries: HashMap<(PathBuf, bool), Arc<LoadedImage>>,
}

impl ImageCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `path`, or return the cached copy.
    pub fn load(&mut self, path: &Path, flip_vertically: bool) -> Result<Arc<LoadedImage>> {
        let key = (path.to_path_buf(), flip_vertically);
        if let Some(image) = self.entries.get(&key) {
            tracing::trace!(path = %path.display(), "Image cache hit");
            return Ok(Arc::clone(image));
        }

        let image = Arc::new(decode(path, flip_vertically)?);
        tracing::debug!(
            path = %path.display(),
            width = image.width,
            height = image.height,
            channels = image.source_channels,
            "Loaded image from disk"
        );
        self.entries.insert(key, Arc::clone(&image));
        Ok(image)
    }

    /// Store already-decoded pixels under `path`.
    pub fn insert(&mut self, path: impl Into<PathBuf>, flip_vertically: bool, image: LoadedImage) {
        self.entries
            .insert((path.into(), flip_vertically), Arc::new(image));
    }

    /// Drop every entry for `path`. Returns how many were removed.
    pub fn evict(&mut self, path: &Path) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(p, _), _| p != path);
        before - self.entries.len()
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Whether `path` with `flip_vertically` is cached.
    pub fn contains(&self, path: &Path, flip_vertically: bool) -> bool {
        self.entries
            .contains_key(&(path.to_path_buf(), flip_vertically))
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn decode(path: &Path, flip_vertically: bool) -> Result<LoadedImage> {
    let image = image::open(path).map_err(|e| GpuError::ImageLoad {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let source_channels = u32::from(image.color().channel_count());
    let image = if flip_vertically { image.flipv() } else { image };
    let rgba = image.into_rgba8();
    let (width, height) = rgba.dimensions();

    LoadedImage::from_rgba8(rgba.into_raw(), width, height, source_channels)
}
