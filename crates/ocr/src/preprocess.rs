use image::{DynamicImage, GrayImage, ImageFormat, ImageReader};
use imageproc::morphology::Mask;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use thiserror::Error;

use crate::filters;

#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("Failed to read image: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to decode image: {primary}; fallback decoder: {fallback}")]
    Decode { primary: String, fallback: String },
    #[error("Image has no pixels")]
    Empty,
    #[error("Filter pipeline failed: {0}")]
    Filter(String),
    #[error("Failed to encode processed image: {0}")]
    Encode(String),
    #[error("Invalid purifier settings: {0}")]
    InvalidConfig(String),
}

/// Filter parameters. Defaults are tuned for phone photos of paper receipts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PurifierConfig {
    /// Non-local-means filter strength `h`.
    pub denoise_strength: f32,
    pub template_window: u32,
    pub search_window: u32,
    pub clahe_clip_limit: f32,
    pub clahe_tiles: u32,
    pub threshold_block: u32,
    pub threshold_c: f32,
    pub opening_size: u32,
    /// Downscale anything larger than this before filtering. Off by default.
    pub max_side: Option<u32>,
}

impl Default for PurifierConfig {
    fn default() -> Self {
        Self {
            denoise_strength: 15.0,
            template_window: 7,
            search_window: 21,
            clahe_clip_limit: 3.0,
            clahe_tiles: 8,
            threshold_block: 35,
            threshold_c: 10.0,
            opening_size: 2,
            max_side: None,
        }
    }
}

impl PurifierConfig {
    pub fn validate(&self) -> Result<(), PreprocessError> {
        let odd = |name: &str, v: u32| {
            if v == 0 || v % 2 == 0 {
                Err(PreprocessError::InvalidConfig(format!("{name} must be odd, got {v}")))
            } else {
                Ok(())
            }
        };
        odd("template_window", self.template_window)?;
        odd("search_window", self.search_window)?;
        odd("threshold_block", self.threshold_block)?;
        if self.threshold_block < 3 {
            return Err(PreprocessError::InvalidConfig("threshold_block must be at least 3".into()));
        }
        if self.denoise_strength <= 0.0 {
            return Err(PreprocessError::InvalidConfig("denoise_strength must be positive".into()));
        }
        if self.clahe_tiles == 0 || self.opening_size == 0 {
            return Err(PreprocessError::InvalidConfig(
                "clahe_tiles and opening_size must be at least 1".into(),
            ));
        }
        if self.opening_size > 255 {
            return Err(PreprocessError::InvalidConfig(format!(
                "opening_size must be at most 255, got {}",
                self.opening_size
            )));
        }
        if self.max_side == Some(0) {
            return Err(PreprocessError::InvalidConfig("max_side must be positive".into()));
        }
        Ok(())
    }
}

/// Turns a receipt photograph into a two-valued image ready for OCR:
/// grayscale → non-local-means denoise → CLAHE → Gaussian adaptive threshold → opening.
#[derive(Debug, Clone)]
pub struct Purifier {
    config: PurifierConfig,
    opening: Mask,
}

impl Default for Purifier {
    fn default() -> Self {
        let config = PurifierConfig::default();
        let opening = filters::square_mask(config.opening_size);
        Self { config, opening }
    }
}

impl Purifier {
    pub fn new(config: PurifierConfig) -> Result<Self, PreprocessError> {
        config.validate()?;
        let opening = filters::square_mask(config.opening_size);
        Ok(Self { config, opening })
    }

    /// Load an image file and return purified PNG bytes.
    pub fn purify_file(&self, path: &Path) -> Result<Vec<u8>, PreprocessError> {
        let data = std::fs::read(path)?;
        let ext = path.extension().and_then(|e| e.to_str());
        self.purify_bytes(&data, ext)
    }

    /// Process raw image bytes (PNG / JPEG / BMP / TIFF …) and return purified PNG bytes.
    pub fn purify_bytes(&self, data: &[u8], ext_hint: Option<&str>) -> Result<Vec<u8>, PreprocessError> {
        let img = decode(data, ext_hint)?;
        encode_as_png(self.purify(img)?)
    }

    /// Run the filter chain on a decoded image.
    pub fn purify(&self, img: DynamicImage) -> Result<GrayImage, PreprocessError> {
        if img.width() == 0 || img.height() == 0 {
            return Err(PreprocessError::Empty);
        }
        let img = match self.config.max_side {
            Some(max) if img.width() > max || img.height() > max => {
                img.resize(max, max, image::imageops::FilterType::Lanczos3)
            }
            _ => img,
        };
        let gray = img.to_luma8();
        let c = &self.config;

        catch_unwind(AssertUnwindSafe(|| {
            let denoised =
                filters::non_local_means(&gray, c.denoise_strength, c.template_window, c.search_window);
            let equalized = filters::clahe(&denoised, c.clahe_clip_limit, c.clahe_tiles);
            let binary = filters::adaptive_threshold_gaussian(&equalized, c.threshold_block, c.threshold_c);
            filters::open(&binary, &self.opening)
        }))
        .map_err(|panic| {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "filter panicked".to_string());
            PreprocessError::Filter(msg)
        })
    }
}

/// Decode using the format the extension claims; if that fails (wrong
/// extension, oversized image), sniff the format from the content with decoder
/// limits lifted.
pub fn decode(data: &[u8], ext_hint: Option<&str>) -> Result<DynamicImage, PreprocessError> {
    let primary = match ext_hint.and_then(ImageFormat::from_extension) {
        Some(format) => image::load_from_memory_with_format(data, format),
        None => image::load_from_memory(data),
    };
    match primary {
        Ok(img) => Ok(img),
        Err(primary_err) => {
            tracing::debug!("Primary decode failed ({primary_err}), trying fallback");
            decode_fallback(data).map_err(|fallback| PreprocessError::Decode {
                primary: primary_err.to_string(),
                fallback,
            })
        }
    }
}

fn decode_fallback(data: &[u8]) -> Result<DynamicImage, String> {
    let mut reader = ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .map_err(|e| e.to_string())?;
    reader.no_limits();
    reader.decode().map_err(|e| e.to_string())
}

pub fn encode_as_png(img: GrayImage) -> Result<Vec<u8>, PreprocessError> {
    let mut buf = Vec::new();
    DynamicImage::ImageLuma8(img)
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .map_err(|e| PreprocessError::Encode(e.to_string()))?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Luma, Rgb, RgbImage};
    use std::collections::HashSet;

    /// Light paper with a few dark strokes and some salt noise.
    fn fake_receipt(width: u32, height: u32) -> RgbImage {
        ImageBuffer::from_fn(width, height, |x, y| {
            let stroke = (y % 10 == 5 && x > 4 && x < width - 4) || (x % 17 == 3 && y > 8);
            let speck = (x * 31 + y * 17) % 97 == 0;
            let shade = 200 - (x * 40 / width) as u8; // uneven lighting
            if stroke {
                Rgb([30, 30, 40])
            } else if speck {
                Rgb([120, 120, 120])
            } else {
                Rgb([shade, shade, shade.saturating_sub(5)])
            }
        })
    }

    fn encode(img: DynamicImage, format: ImageFormat) -> Vec<u8> {
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), format).unwrap();
        buf
    }

    fn small_config() -> PurifierConfig {
        PurifierConfig { template_window: 3, search_window: 7, ..PurifierConfig::default() }
    }

    #[test]
    fn output_is_two_valued_with_same_dimensions() {
        let purifier = Purifier::new(small_config()).unwrap();
        let out = purifier.purify(DynamicImage::ImageRgb8(fake_receipt(48, 40))).unwrap();
        assert_eq!(out.dimensions(), (48, 40));
        let values: HashSet<u8> = out.pixels().map(|p| p[0]).collect();
        assert!(values.iter().all(|v| *v == 0 || *v == 255), "values: {values:?}");
        assert!(values.len() <= 2);
    }

    #[test]
    fn purification_is_deterministic() {
        let purifier = Purifier::new(small_config()).unwrap();
        let png = encode(DynamicImage::ImageRgb8(fake_receipt(32, 24)), ImageFormat::Png);
        let a = purifier.purify_bytes(&png, Some("png")).unwrap();
        let b = purifier.purify_bytes(&png, Some("png")).unwrap();
        assert_eq!(a, b);
        assert_eq!(&a[..4], b"\x89PNG");
    }

    #[test]
    fn default_parameters_run_on_small_image() {
        let purifier = Purifier::default();
        let out = purifier.purify(DynamicImage::ImageRgb8(fake_receipt(24, 20))).unwrap();
        assert_eq!(out.dimensions(), (24, 20));
    }

    #[test]
    fn wrong_extension_falls_back_to_sniffing() {
        let png = encode(DynamicImage::ImageRgb8(fake_receipt(8, 8)), ImageFormat::Png);
        // Claimed JPEG, actually PNG.
        let img = decode(&png, Some("jpg")).unwrap();
        assert_eq!(img.width(), 8);
    }

    #[test]
    fn bmp_decodes_by_extension() {
        let bmp = encode(DynamicImage::ImageRgb8(fake_receipt(6, 5)), ImageFormat::Bmp);
        let img = decode(&bmp, Some("bmp")).unwrap();
        assert_eq!((img.width(), img.height()), (6, 5));
    }

    #[test]
    fn garbage_bytes_fail_both_paths() {
        let err = decode(b"definitely not an image", Some("png")).unwrap_err();
        assert!(matches!(err, PreprocessError::Decode { .. }));
    }

    #[test]
    fn max_side_downscales_before_filtering() {
        let config = PurifierConfig { max_side: Some(16), ..small_config() };
        let purifier = Purifier::new(config).unwrap();
        let gray: GrayImage = ImageBuffer::from_fn(40, 20, |_, _| Luma([200u8]));
        let out = purifier.purify(DynamicImage::ImageLuma8(gray)).unwrap();
        assert!(out.width() <= 16 && out.height() <= 16);
    }

    #[test]
    fn even_windows_are_rejected() {
        let config = PurifierConfig { search_window: 20, ..PurifierConfig::default() };
        assert!(matches!(Purifier::new(config), Err(PreprocessError::InvalidConfig(_))));
        let config = PurifierConfig { threshold_block: 1, ..PurifierConfig::default() };
        assert!(Purifier::new(config).is_err());
    }

    #[test]
    fn oversized_opening_is_rejected() {
        let config = PurifierConfig { opening_size: 256, ..PurifierConfig::default() };
        assert!(matches!(Purifier::new(config), Err(PreprocessError::InvalidConfig(_))));
        let config = PurifierConfig { opening_size: 255, ..small_config() };
        assert!(Purifier::new(config).is_ok());
    }
}
