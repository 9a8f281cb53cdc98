use receipt_core::ImageAsset;
use receipt_export::{artifact_path, combine_artifacts, write_record_artifact, ArtifactError};
use receipt_ocr::{LlmBackend, OcrBackend, PipelineError, ReceiptPipeline};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;

use crate::config::{BatchSettings, OnError, PathSettings};

pub const LOCK_FILE_NAME: &str = ".receipt-reader.lock";

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("Another batch is already running (lock file {}); remove it if no batch is active", .0.display())]
    BatchInProgress(PathBuf),
    #[error("IO error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Processing {stem} failed: {source}")]
    Image {
        stem: String,
        #[source]
        source: PipelineError,
    },
    #[error("Failed to combine extractions: {0}")]
    Artifact(#[from] ArtifactError),
    #[error("Image task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// An image that did not make it into the combined table, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageFailure {
    pub stem: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub combined_path: PathBuf,
    pub rows: usize,
    /// Images whose pipeline failed under the `skip` policy.
    pub skipped: Vec<ImageFailure>,
    /// Images that were processed but whose artifact could not be written.
    pub artifact_failures: Vec<ImageFailure>,
}

/// Removes the lock file when dropped.
struct LockFile {
    path: PathBuf,
}

impl LockFile {
    fn acquire(path: PathBuf) -> Result<Self, BatchError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|source| BatchError::Io { path: parent.to_path_buf(), source })?;
        }
        match std::fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                let _ = writeln!(file, "{}", std::process::id());
                Ok(Self { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(BatchError::BatchInProgress(path)),
            Err(source) => Err(BatchError::Io { path, source }),
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!("Could not remove lock file {}: {e}", self.path.display());
        }
    }
}

/// Delete and recreate a working directory.
fn reset_dir(dir: &Path) -> Result<(), BatchError> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(source) => return Err(BatchError::Io { path: dir.to_path_buf(), source }),
    }
    std::fs::create_dir_all(dir).map_err(|source| BatchError::Io { path: dir.to_path_buf(), source })
}

/// Runs the per-image pipeline over a set of images and merges the results
/// into one combined CSV.
///
/// Only one batch runs at a time per runner and per working directory; a
/// second attempt fails with [`BatchError::BatchInProgress`].
pub struct BatchRunner<R: OcrBackend + 'static, L: LlmBackend + 'static> {
    pipeline: Arc<ReceiptPipeline<R, L>>,
    paths: PathSettings,
    settings: BatchSettings,
    gate: Mutex<()>,
}

impl<R: OcrBackend + 'static, L: LlmBackend + 'static> BatchRunner<R, L> {
    pub fn new(pipeline: ReceiptPipeline<R, L>, paths: PathSettings, settings: BatchSettings) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            paths,
            settings,
            gate: Mutex::new(()),
        }
    }

    /// One lock file next to each working directory, since both are wiped
    /// at the start of every batch. Sorted so every runner takes them in the
    /// same order.
    pub fn lock_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = [&self.paths.purified_dir, &self.paths.extractions_dir]
            .into_iter()
            .map(|dir| match dir.parent() {
                Some(root) if !root.as_os_str().is_empty() => root.join(LOCK_FILE_NAME),
                _ => PathBuf::from(LOCK_FILE_NAME),
            })
            .collect();
        paths.sort();
        paths.dedup();
        paths
    }

    pub async fn run(&self, assets: Vec<ImageAsset>) -> Result<BatchReport, BatchError> {
        let lock_paths = self.lock_paths();
        let _gate = self
            .gate
            .try_lock()
            .map_err(|_| BatchError::BatchInProgress(lock_paths[0].clone()))?;
        let _locks = lock_paths
            .into_iter()
            .map(LockFile::acquire)
            .collect::<Result<Vec<_>, _>>()?;

        let purified_dir = self.paths.purified_dir.clone();
        let extractions_dir = self.paths.extractions_dir.clone();
        reset_dir(&purified_dir)?;
        reset_dir(&extractions_dir)?;

        tracing::info!(
            "Processing {} image(s), concurrency {}, on_error {:?}",
            assets.len(),
            self.settings.concurrency,
            self.settings.on_error
        );

        let semaphore = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for asset in assets {
            let pipeline = Arc::clone(&self.pipeline);
            let semaphore = Arc::clone(&semaphore);
            let purified_dir = purified_dir.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let result = pipeline.process_image(&asset, &purified_dir).await;
                (asset.stem, result)
            });
        }

        let mut skipped = Vec::new();
        let mut artifact_failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (stem, result) = joined?;
            match result {
                Ok(outcome) => {
                    let path = artifact_path(&extractions_dir, &stem);
                    let dest = path.clone();
                    let written =
                        tokio::task::spawn_blocking(move || write_record_artifact(&dest, &outcome.record)).await?;
                    if let Err(e) = written {
                        tracing::error!("Failed to write extraction for {stem} to {}: {e:?}", path.display());
                        artifact_failures.push(ImageFailure { stem, reason: e.to_string() });
                    }
                }
                Err(source) => match self.settings.on_error {
                    OnError::Abort => {
                        tracing::error!("Processing {stem} failed; aborting batch: {source}");
                        tasks.abort_all();
                        return Err(BatchError::Image { stem, source });
                    }
                    OnError::Skip => {
                        tracing::warn!("Skipping {stem}: {source}");
                        skipped.push(ImageFailure { stem, reason: source.to_string() });
                    }
                },
            }
        }

        skipped.sort_by(|a, b| a.stem.cmp(&b.stem));
        artifact_failures.sort_by(|a, b| a.stem.cmp(&b.stem));

        let output = self.paths.output_path();
        let summary = tokio::task::spawn_blocking(move || combine_artifacts(&extractions_dir, &output)).await??;
        Ok(BatchReport {
            combined_path: summary.path,
            rows: summary.rows,
            skipped,
            artifact_failures,
        })
    }
}
