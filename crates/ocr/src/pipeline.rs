use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use receipt_core::{ExtractedRecord, ImageAsset};

use crate::llm::{LlmBackend, LlmError};
use crate::parser::FieldParser;
use crate::preprocess::{PreprocessError, Purifier};
use crate::recognizer::{OcrBackend, OcrError};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Image preprocessing failed: {0}")]
    Preprocess(#[from] PreprocessError),
    #[error("OCR recognition failed: {0}")]
    Ocr(#[from] OcrError),
    #[error("Field extraction failed: {0}")]
    Llm(#[from] LlmError),
    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Purify one image into `<purified_dir>/<stem>.png`, replacing any previous
/// file for that stem. The filter chain runs on the blocking pool.
pub async fn purify_asset(
    purifier: Arc<Purifier>,
    asset: &ImageAsset,
    purified_dir: &Path,
) -> Result<(PathBuf, Vec<u8>), PipelineError> {
    let data = tokio::fs::read(&asset.path).await?;
    let ext = asset.extension();
    let png = tokio::task::spawn_blocking(move || purifier.purify_bytes(&data, ext.as_deref())).await??;

    tokio::fs::create_dir_all(purified_dir).await?;
    let dest = purified_dir.join(format!("{}.png", asset.stem));
    tokio::fs::write(&dest, &png).await?;
    tracing::info!("Purified {} -> {}", asset.path.display(), dest.display());
    Ok((dest, png))
}

/// What one image produced.
#[derive(Debug, Clone)]
pub struct ImageOutcome {
    pub stem: String,
    /// Where the purified PNG was written.
    pub purified_path: PathBuf,
    pub text: String,
    pub record: ExtractedRecord,
}

/// Orchestrates: purify → persist purified PNG → OCR → field parsing.
///
/// Holds no per-image state, so one instance is shared (via `Arc`) by all the
/// image tasks of a batch.
pub struct ReceiptPipeline<R: OcrBackend, L: LlmBackend> {
    purifier: Arc<Purifier>,
    recognizer: R,
    parser: FieldParser<L>,
}

impl<R: OcrBackend, L: LlmBackend> ReceiptPipeline<R, L> {
    pub fn new(purifier: Purifier, recognizer: R, llm: L) -> Self {
        Self {
            purifier: Arc::new(purifier),
            recognizer,
            parser: FieldParser::new(llm),
        }
    }

    pub async fn purify_to(&self, asset: &ImageAsset, purified_dir: &Path) -> Result<(PathBuf, Vec<u8>), PipelineError> {
        purify_asset(Arc::clone(&self.purifier), asset, purified_dir).await
    }

    /// Run the full chain for one image.
    pub async fn process_image(&self, asset: &ImageAsset, purified_dir: &Path) -> Result<ImageOutcome, PipelineError> {
        let (purified_path, png) = self.purify_to(asset, purified_dir).await?;

        let text = self.recognizer.recognize(&png).await?;
        tracing::info!("Recognized {} characters in {}", text.chars().count(), asset.stem);

        let record = self.parser.parse(&text).await?;
        tracing::info!("Extracted {}: {record}", asset.stem);

        Ok(ImageOutcome {
            stem: asset.stem.clone(),
            purified_path,
            text,
            record,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlm;
    use crate::preprocess::PurifierConfig;
    use crate::recognizer::MockRecognizer;
    use image::{DynamicImage, GrayImage, ImageBuffer, Luma};
    use std::io::Cursor;

    fn tiny_png() -> Vec<u8> {
        let img: GrayImage = ImageBuffer::from_fn(12, 10, |x, y| {
            if y == 5 && x > 2 { Luma([20u8]) } else { Luma([210u8]) }
        });
        let mut buf = Vec::new();
        DynamicImage::ImageLuma8(img)
            .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    fn fast_purifier() -> Purifier {
        Purifier::new(PurifierConfig { template_window: 3, search_window: 5, ..PurifierConfig::default() })
            .unwrap()
    }

    fn write_asset(dir: &Path, name: &str, data: &[u8]) -> ImageAsset {
        let path = dir.join(name);
        std::fs::write(&path, data).unwrap();
        ImageAsset::new(path)
    }

    #[tokio::test]
    async fn process_image_produces_record_and_purified_png() {
        let dir = tempfile::tempdir().unwrap();
        let asset = write_asset(dir.path(), "lunch.PNG", &tiny_png());
        let purified = dir.path().join("purified");

        let pipeline = ReceiptPipeline::new(
            fast_purifier(),
            MockRecognizer::new("STORE X\nApples 2.50\nTOTAL 2.50\n2024-01-05"),
            MockLlm::new(r#"{"merchant":"STORE X","item":"Apples","amount":2.50,"date":"2024-01-05"}"#),
        );

        let out = pipeline.process_image(&asset, &purified).await.unwrap();

        assert_eq!(out.stem, "lunch");
        assert_eq!(out.purified_path, purified.join("lunch.png"));
        let written = image::open(&out.purified_path).unwrap();
        assert_eq!((written.width(), written.height()), (12, 10));
        assert_eq!(out.record.merchant.as_deref(), Some("STORE X"));
        assert_eq!(out.record.amount, Some(rust_decimal::Decimal::new(25, 1)));
    }

    #[tokio::test]
    async fn empty_ocr_text_gives_null_record() {
        let dir = tempfile::tempdir().unwrap();
        let asset = write_asset(dir.path(), "blank.png", &tiny_png());
        let pipeline = ReceiptPipeline::new(fast_purifier(), MockRecognizer::new(""), MockLlm::new("{}"));

        let out = pipeline.process_image(&asset, dir.path()).await.unwrap();
        assert!(out.record.is_empty());
    }

    #[tokio::test]
    async fn undecodable_image_is_a_preprocess_error() {
        let dir = tempfile::tempdir().unwrap();
        let asset = write_asset(dir.path(), "broken.jpg", b"not really a jpeg");
        let pipeline = ReceiptPipeline::new(fast_purifier(), MockRecognizer::new("x"), MockLlm::new("{}"));

        let err = pipeline.process_image(&asset, dir.path()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Preprocess(PreprocessError::Decode { .. })));
    }

    #[tokio::test]
    async fn ocr_failure_is_propagated() {
        let dir = tempfile::tempdir().unwrap();
        let asset = write_asset(dir.path(), "r.png", &tiny_png());
        let pipeline = ReceiptPipeline::new(
            fast_purifier(),
            MockRecognizer::failing("PERMISSION_DENIED"),
            MockLlm::new("{}"),
        );

        let err = pipeline.process_image(&asset, dir.path()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Ocr(OcrError::Service(_))));
    }

    #[tokio::test]
    async fn rerun_overwrites_purified_file() {
        let dir = tempfile::tempdir().unwrap();
        let asset = write_asset(dir.path(), "same.png", &tiny_png());
        let purified = dir.path().join("out");
        std::fs::create_dir_all(&purified).unwrap();
        std::fs::write(purified.join("same.png"), b"stale").unwrap();

        let pipeline = ReceiptPipeline::new(fast_purifier(), MockRecognizer::new(""), MockLlm::new("{}"));
        pipeline.purify_to(&asset, &purified).await.unwrap();

        let bytes = std::fs::read(purified.join("same.png")).unwrap();
        assert_eq!(&bytes[..4], b"\x89PNG");
    }
}
