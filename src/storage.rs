use std::fs;
use std::io::Cursor;
use std::path::{Component, Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat, Rgb};
use tracing::debug;

use crate::error::{PrepError, Result};
use crate::locator::Locator;
use crate::transform::flatten_alpha;

/// Blob storage addressed by [`Locator`]
pub trait ObjectStore {
    fn get(&self, locator: &Locator) -> Result<Vec<u8>>;
    fn put(&self, locator: &Locator, bytes: &[u8]) -> Result<()>;
}

/// Object store backed by a directory: `bucket/key` lives at `<root>/bucket/key`
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Filesystem path for a locator. Keys that would climb out of the bucket
    /// directory are rejected.
    pub fn path_for(&self, locator: &Locator) -> Result<PathBuf> {
        let relative = Path::new(&locator.bucket).join(&locator.key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if escapes {
            return Err(PrepError::Locator(locator.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

impl ObjectStore for LocalStore {
    fn get(&self, locator: &Locator) -> Result<Vec<u8>> {
        let path = self.path_for(locator)?;
        debug!(%locator, path = %path.display(), "Reading object");
        Ok(fs::read(path)?)
    }

    fn put(&self, locator: &Locator, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(locator)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        debug!(%locator, path = %path.display(), bytes = bytes.len(), "Writing object");
        fs::write(path, bytes)?;
        Ok(())
    }
}

/// Fetch and decode an image
pub fn load_image<S: ObjectStore + ?Sized>(store: &S, locator: &Locator) -> Result<DynamicImage> {
    let bytes = store.get(locator)?;
    Ok(image::load_from_memory(&bytes)?)
}

/// Encoding options for written images
#[derive(Debug, Clone, Copy)]
pub struct EncodeOptions {
    pub jpeg_quality: u8,
    /// Backdrop for formats without transparency
    pub background: Rgb<u8>,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            jpeg_quality: 95,
            background: Rgb([255, 255, 255]),
        }
    }
}

/// Encode an image in `format`. JPEG output is flattened onto the background.
pub fn encode_image(img: &DynamicImage, format: ImageFormat, options: &EncodeOptions) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    match format {
        ImageFormat::Jpeg => {
            let rgb = if img.color().has_alpha() {
                flatten_alpha(&img.to_rgba8(), options.background)
            } else {
                img.to_rgb8()
            };
            let encoder = JpegEncoder::new_with_quality(&mut buffer, options.jpeg_quality);
            rgb.write_with_encoder(encoder)?;
        }
        _ => img.write_to(&mut Cursor::new(&mut buffer), format)?,
    }
    Ok(buffer)
}
