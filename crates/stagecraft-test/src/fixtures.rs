//! Image files on disk for loader tests.

use crate::Result;
use image::{DynamicImage, GrayAlphaImage, GrayImage, RgbImage, RgbaImage};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

static NEXT_DIR: AtomicUsize = AtomicUsize::new(0);

/// A scratch directory under the system temp dir, removed on drop.
#[derive(Debug)]
pub struct FixtureDir {
    path: PathBuf,
}

impl FixtureDir {
    /// Create a fresh directory. `name` only makes failures easier to trace.
    pub fn new(name: &str) -> Result<Self> {
        let unique = NEXT_DIR.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!(
            "stagecraft-{name}-{}-{unique}",
            std::process::id()
        ));
        if path.exists() {
            std::fs::remove_dir_all(&path)?;
        }
        std::fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    /// Directory path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a `width`x`height` PNG with `channels` channels (1 to 4).
    ///
    /// Texel values are a deterministic gradient so flips are observable.
    pub fn write_png(&self, file: &str, width: u32, height: u32, channels: u8) -> Result<PathBuf> {
        let value = |x: u32, y: u32, c: u32| ((x * 31 + y * 17 + c * 7) % 251) as u8;
        let image = match channels {
            1 => DynamicImage::ImageLuma8(GrayImage::from_fn(width, height, |x, y| {
                image::Luma([value(x, y, 0)])
            })),
            2 => DynamicImage::ImageLumaA8(GrayAlphaImage::from_fn(width, height, |x, y| {
                image::LumaA([value(x, y, 0), value(x, y, 1)])
            })),
            3 => DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
                image::Rgb([value(x, y, 0), value(x, y, 1), value(x, y, 2)])
            })),
            _ => DynamicImage::ImageRgba8(RgbaImage::from_fn(width, height, |x, y| {
                image::Rgba([value(x, y, 0), value(x, y, 1), value(x, y, 2), 255])
            })),
        };

        let path = self.path.join(file);
        image.save(&path)?;
        Ok(path)
    }
}

impl Drop for FixtureDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}
