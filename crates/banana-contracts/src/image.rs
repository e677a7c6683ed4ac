use std::fmt;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use image::imageops::FilterType;
use image::{ColorType, DynamicImage, GrayImage, ImageFormat, Luma};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Mask pixel value for "regenerate this pixel".
pub const MASK_EDITABLE: u8 = 255;
/// Mask pixel value for "keep this pixel".
pub const MASK_PRESERVE: u8 = 0;
/// Painted-pixel threshold used when a mask is lifted from a paint layer:
/// any channel brighter than ~5% counts as paint.
pub const DEFAULT_MASK_THRESHOLD: u8 = 13;

/// Content handle for an [`Image`] or [`Mask`], stable for the session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageHandle(String);

impl ImageHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn digest(width: u32, height: u32, layout: &str, bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(width.to_be_bytes());
        hasher.update(height.to_be_bytes());
        hasher.update(layout.as_bytes());
        hasher.update(bytes);
        let digest = hasher.finalize();
        Self(hex::encode(&digest[..8]))
    }
}

impl fmt::Display for ImageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorLayout {
    Luma,
    LumaAlpha,
    Rgb,
    Rgba,
    Other,
}

impl ColorLayout {
    fn from_color_type(color: ColorType) -> Self {
        match color {
            ColorType::L8 | ColorType::L16 => Self::Luma,
            ColorType::La8 | ColorType::La16 => Self::LumaAlpha,
            ColorType::Rgb8 | ColorType::Rgb16 | ColorType::Rgb32F => Self::Rgb,
            ColorType::Rgba8 | ColorType::Rgba16 | ColorType::Rgba32F => Self::Rgba,
            _ => Self::Other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Luma => "luma",
            Self::LumaAlpha => "luma_alpha",
            Self::Rgb => "rgb",
            Self::Rgba => "rgba",
            Self::Other => "other",
        }
    }
}

/// Immutable pixel buffer. Clones share the underlying pixels.
#[derive(Clone)]
pub struct Image {
    handle: ImageHandle,
    layout: ColorLayout,
    pixels: Arc<DynamicImage>,
}

impl Image {
    pub fn from_dynamic(pixels: DynamicImage) -> Self {
        let layout = ColorLayout::from_color_type(pixels.color());
        let handle = ImageHandle::digest(
            pixels.width(),
            pixels.height(),
            layout.as_str(),
            pixels.as_bytes(),
        );
        Self {
            handle,
            layout,
            pixels: Arc::new(pixels),
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let pixels = image::load_from_memory(bytes).context("image decode failed")?;
        Ok(Self::from_dynamic(pixels))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let pixels =
            image::open(path).with_context(|| format!("failed reading {}", path.display()))?;
        Ok(Self::from_dynamic(pixels))
    }

    pub fn handle(&self) -> &ImageHandle {
        &self.handle
    }

    pub fn layout(&self) -> ColorLayout {
        self.layout
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width(), self.height())
    }

    pub fn as_dynamic(&self) -> &DynamicImage {
        &self.pixels
    }

    /// Lossless PNG encoding of the pixels.
    pub fn encode_png(&self) -> Result<Vec<u8>> {
        encode_png(&self.pixels)
    }

    pub fn save_png(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        std::fs::write(path, self.encode_png()?)
            .with_context(|| format!("failed to write {}", path.display()))
    }

    pub fn resized_exact(&self, width: u32, height: u32) -> Self {
        if self.dimensions() == (width, height) {
            return self.clone();
        }
        Self::from_dynamic(self.pixels.resize_exact(width, height, FilterType::Lanczos3))
    }
}

impl PartialEq for Image {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle
    }
}

impl Eq for Image {}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("handle", &self.handle)
            .field("width", &self.width())
            .field("height", &self.height())
            .field("layout", &self.layout)
            .finish()
    }
}

/// Single-channel edit mask: [`MASK_EDITABLE`] pixels are regenerated,
/// [`MASK_PRESERVE`] pixels are kept.
#[derive(Clone)]
pub struct Mask {
    handle: ImageHandle,
    bitmap: Arc<GrayImage>,
}

impl Mask {
    /// Thresholds the brightest colour channel of a painted layer.
    pub fn from_image(painted: &Image, threshold: u8) -> Self {
        let rgb = painted.as_dynamic().to_rgb8();
        let bitmap = GrayImage::from_fn(rgb.width(), rgb.height(), |x, y| {
            let [r, g, b] = rgb.get_pixel(x, y).0;
            if r.max(g).max(b) > threshold {
                Luma([MASK_EDITABLE])
            } else {
                Luma([MASK_PRESERVE])
            }
        });
        Self::from_bitmap(bitmap)
    }

    /// Mask of the given size whose editable area is the rectangle
    /// `(x, y, w, h)`, clipped to the mask bounds.
    pub fn from_rect(width: u32, height: u32, rect: (u32, u32, u32, u32)) -> Self {
        let (rx, ry, rw, rh) = rect;
        let x_end = rx.saturating_add(rw);
        let y_end = ry.saturating_add(rh);
        let bitmap = GrayImage::from_fn(width, height, |x, y| {
            if x >= rx && x < x_end && y >= ry && y < y_end {
                Luma([MASK_EDITABLE])
            } else {
                Luma([MASK_PRESERVE])
            }
        });
        Self::from_bitmap(bitmap)
    }

    /// Normalizes an arbitrary grey bitmap: anything non-zero is editable.
    pub fn from_gray(gray: GrayImage) -> Self {
        let bitmap = GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
            if gray.get_pixel(x, y).0[0] > 0 {
                Luma([MASK_EDITABLE])
            } else {
                Luma([MASK_PRESERVE])
            }
        });
        Self::from_bitmap(bitmap)
    }

    pub fn load(path: impl AsRef<Path>, threshold: u8) -> Result<Self> {
        Ok(Self::from_image(&Image::load(path)?, threshold))
    }

    fn from_bitmap(bitmap: GrayImage) -> Self {
        let handle = ImageHandle::digest(
            bitmap.width(),
            bitmap.height(),
            "mask",
            bitmap.as_raw().as_slice(),
        );
        Self {
            handle,
            bitmap: Arc::new(bitmap),
        }
    }

    pub fn handle(&self) -> &ImageHandle {
        &self.handle
    }

    pub fn width(&self) -> u32 {
        self.bitmap.width()
    }

    pub fn height(&self) -> u32 {
        self.bitmap.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width(), self.height())
    }

    pub fn is_editable(&self, x: u32, y: u32) -> bool {
        x < self.width() && y < self.height() && self.bitmap.get_pixel(x, y).0[0] == MASK_EDITABLE
    }

    pub fn editable_pixels(&self) -> u64 {
        self.bitmap
            .pixels()
            .filter(|pixel| pixel.0[0] == MASK_EDITABLE)
            .count() as u64
    }

    pub fn encode_png(&self) -> Result<Vec<u8>> {
        encode_png(&DynamicImage::ImageLuma8(self.bitmap.as_ref().clone()))
    }

    pub fn save_png(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        std::fs::write(path, self.encode_png()?)
            .with_context(|| format!("failed to write {}", path.display()))
    }
}

impl PartialEq for Mask {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle
    }
}

impl Eq for Mask {}

impl fmt::Debug for Mask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mask")
            .field("handle", &self.handle)
            .field("width", &self.width())
            .field("height", &self.height())
            .finish()
    }
}

fn encode_png(pixels: &DynamicImage) -> Result<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    pixels
        .write_to(&mut out, ImageFormat::Png)
        .context("png encode failed")?;
    Ok(out.into_inner())
}

#[cfg(test)]
mod tests {
    use image::{DynamicImage, Rgb, RgbImage};

    use super::*;

    fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Image {
        Image::from_dynamic(DynamicImage::ImageRgb8(RgbImage::from_pixel(
            width,
            height,
            Rgb(rgb),
        )))
    }

    #[test]
    fn handle_is_stable_for_identical_pixels() {
        let a = solid(8, 4, [10, 20, 30]);
        let b = solid(8, 4, [10, 20, 30]);
        let c = solid(8, 4, [10, 20, 31]);
        assert_eq!(a.handle(), b.handle());
        assert_ne!(a.handle(), c.handle());
        assert_eq!(a.layout(), ColorLayout::Rgb);
        assert_eq!(a.handle().as_str().len(), 16);
    }

    #[test]
    fn png_encoding_is_lossless() -> anyhow::Result<()> {
        let mut pixels = RgbImage::new(5, 3);
        for (x, y, pixel) in pixels.enumerate_pixels_mut() {
            *pixel = Rgb([x as u8 * 40, y as u8 * 70, 9]);
        }
        let original = Image::from_dynamic(DynamicImage::ImageRgb8(pixels));
        let decoded = Image::decode(&original.encode_png()?)?;
        assert_eq!(decoded.handle(), original.handle());
        assert_eq!(decoded.dimensions(), (5, 3));
        Ok(())
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(Image::decode(b"definitely not an image").is_err());
    }

    #[test]
    fn mask_from_painted_layer_counts_bright_pixels() {
        let mut painted = RgbImage::new(4, 4);
        painted.put_pixel(0, 0, Rgb([200, 0, 0]));
        painted.put_pixel(3, 3, Rgb([0, 0, 14]));
        painted.put_pixel(2, 2, Rgb([5, 5, 5]));
        let mask = Mask::from_image(
            &Image::from_dynamic(DynamicImage::ImageRgb8(painted)),
            DEFAULT_MASK_THRESHOLD,
        );
        assert_eq!(mask.editable_pixels(), 2);
        assert!(mask.is_editable(0, 0));
        assert!(mask.is_editable(3, 3));
        assert!(!mask.is_editable(2, 2));
        assert!(!mask.is_editable(9, 9));
    }

    #[test]
    fn rect_mask_is_clipped_to_bounds() {
        let mask = Mask::from_rect(10, 10, (8, 8, 5, 5));
        assert_eq!(mask.editable_pixels(), 4);
        assert!(mask.is_editable(9, 9));
        assert!(!mask.is_editable(7, 9));
    }

    #[test]
    fn mask_png_keeps_binary_values() -> anyhow::Result<()> {
        let mask = Mask::from_rect(6, 6, (0, 0, 3, 3));
        let reloaded = Image::decode(&mask.encode_png()?)?;
        assert_eq!(reloaded.layout(), ColorLayout::Luma);
        let gray = reloaded.as_dynamic().to_luma8();
        assert_eq!(gray.get_pixel(0, 0).0[0], MASK_EDITABLE);
        assert_eq!(gray.get_pixel(5, 5).0[0], MASK_PRESERVE);
        assert_eq!(Mask::from_gray(gray), mask);
        Ok(())
    }

    #[test]
    fn resized_exact_reuses_matching_image() {
        let image = solid(16, 8, [1, 2, 3]);
        assert_eq!(image.resized_exact(16, 8).handle(), image.handle());
        assert_eq!(image.resized_exact(32, 16).dimensions(), (32, 16));
    }
}
