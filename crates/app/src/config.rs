use receipt_ocr::{LlmConfig, PurifierConfig, VisionConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Looked up in the working directory when no `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = "receipt-reader.toml";
pub const COMBINED_FILE_NAME: &str = "receipt_extractions.csv";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Failed to read settings file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse settings file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Invalid setting: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OnError {
    /// The first failing image fails the whole batch.
    #[default]
    Abort,
    /// Log the failure, record it in the report and keep going.
    Skip,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    pub purified_dir: PathBuf,
    pub extractions_dir: PathBuf,
    /// Combined table. Defaults to the user's Downloads folder.
    pub output: Option<PathBuf>,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            purified_dir: PathBuf::from("images_purified"),
            extractions_dir: PathBuf::from("ocr_extractions"),
            output: None,
        }
    }
}

impl PathSettings {
    pub fn output_path(&self) -> PathBuf {
        self.output.clone().unwrap_or_else(default_output_path)
    }
}

/// `<Downloads>/receipt_extractions.csv`, or the working directory when the
/// platform has no Downloads folder.
pub fn default_output_path() -> PathBuf {
    directories::UserDirs::new()
        .and_then(|dirs| dirs.download_dir().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
        .join(COMBINED_FILE_NAME)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    pub on_error: OnError,
    /// Images processed at once. 1 keeps the run sequential.
    pub concurrency: usize,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self { on_error: OnError::Abort, concurrency: 1 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub paths: PathSettings,
    pub batch: BatchSettings,
    pub ocr: VisionConfig,
    pub llm: LlmConfig,
    pub purifier: PurifierConfig,
}

impl Settings {
    /// Load from `path`, or from `receipt-reader.toml` if it exists, or fall
    /// back to defaults. An explicit path that does not exist is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        let settings = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).is_file() => Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?,
            None => {
                tracing::debug!("No {DEFAULT_CONFIG_FILE}; using default settings");
                Self::default()
            }
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self, SettingsError> {
        let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let settings = toml::from_str(&text).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.batch.concurrency == 0 {
            return Err(SettingsError::Invalid("batch.concurrency must be at least 1".into()));
        }
        let (purified, extractions) = (&self.paths.purified_dir, &self.paths.extractions_dir);
        if purified.starts_with(extractions) || extractions.starts_with(purified) {
            return Err(SettingsError::Invalid(
                "paths.purified_dir and paths.extractions_dir must be separate, non-nested directories".into(),
            ));
        }
        if self.ocr.timeout_secs == 0 || self.llm.timeout_secs == 0 {
            return Err(SettingsError::Invalid("timeouts must be at least one second".into()));
        }
        self.purifier
            .validate()
            .map_err(|e| SettingsError::Invalid(e.to_string()))
    }
}
