pub mod batch;
pub mod config;

use receipt_core::Credentials;
use receipt_ocr::{OpenAiLlm, Purifier, ReceiptPipeline, VisionRecognizer};

pub use batch::{BatchError, BatchReport, BatchRunner, ImageFailure};
pub use config::{OnError, Settings, SettingsError};

pub type CloudPipeline = ReceiptPipeline<VisionRecognizer, OpenAiLlm>;

/// Wire the cloud clients from validated credentials.
pub fn build_pipeline(settings: &Settings, credentials: &Credentials) -> anyhow::Result<CloudPipeline> {
    let purifier = Purifier::new(settings.purifier.clone())?;
    let recognizer = VisionRecognizer::new(credentials.service_account.clone(), &settings.ocr)?;
    let llm = OpenAiLlm::new(credentials.openai_key.clone(), settings.llm.clone())?;
    tracing::debug!("Pipeline ready: Vision OCR, model {}", llm.model());
    Ok(ReceiptPipeline::new(purifier, recognizer, llm))
}
