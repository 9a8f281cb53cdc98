pub mod auth;
pub mod filters;
pub mod llm;
pub mod parser;
pub mod pipeline;
pub mod preprocess;
pub mod recognizer;

pub use auth::ServiceAccountAuth;
pub use llm::{LlmBackend, LlmConfig, LlmError, MockLlm, OpenAiLlm};
pub use parser::{build_prompt, parse_response, FieldParser};
pub use pipeline::{purify_asset, ImageOutcome, PipelineError, ReceiptPipeline};
pub use preprocess::{PreprocessError, Purifier, PurifierConfig};
pub use recognizer::{MockRecognizer, OcrBackend, OcrError, VisionConfig, VisionRecognizer};
