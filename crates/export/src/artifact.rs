//! Per-image CSV artifacts and their combination into one table.
//!
//! Every artifact has the header `merchant,date,item,amount` and one data row;
//! a null field is an empty cell.

use receipt_core::{ExtractedRecord, CSV_HEADER};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("IO error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("CSV error in {}: {source}", .path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("Unexpected header in {}: {found}", .path.display())]
    HeaderMismatch { path: PathBuf, found: String },
    #[error("No data row in {}", .0.display())]
    EmptyArtifact(PathBuf),
    #[error("Invalid amount {value:?} in {}", .path.display())]
    InvalidAmount { path: PathBuf, value: String },
    #[error("No OCR extractions found in {}", .0.display())]
    NoExtractions(PathBuf),
}

impl ArtifactError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io { path: path.to_path_buf(), source }
    }

    fn csv(path: &Path, source: csv::Error) -> Self {
        Self::Csv { path: path.to_path_buf(), source }
    }
}

/// One CSV row. Field order is the column order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ArtifactRow {
    merchant: Option<String>,
    date: Option<String>,
    item: Option<String>,
    amount: Option<String>,
}

impl From<&ExtractedRecord> for ArtifactRow {
    fn from(r: &ExtractedRecord) -> Self {
        Self {
            merchant: r.merchant.clone(),
            date: r.date.clone(),
            item: r.item.clone(),
            amount: r.amount.map(|a| a.to_string()),
        }
    }
}

impl ArtifactRow {
    fn into_record(self, path: &Path) -> Result<ExtractedRecord, ArtifactError> {
        let amount = match self.amount.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(s) => Some(Decimal::from_str(s).map_err(|_| ArtifactError::InvalidAmount {
                path: path.to_path_buf(),
                value: s.to_string(),
            })?),
            None => None,
        };
        Ok(ExtractedRecord {
            merchant: self.merchant,
            date: self.date,
            item: self.item,
            amount,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CombineSummary {
    pub path: PathBuf,
    pub rows: usize,
}

/// `<dir>/<stem>.csv`
pub fn artifact_path(dir: &Path, stem: &str) -> PathBuf {
    dir.join(format!("{stem}.csv"))
}

fn writer_for(path: &Path) -> Result<csv::Writer<std::fs::File>, ArtifactError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| ArtifactError::io(parent, e))?;
    }
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)
        .map_err(|e| ArtifactError::csv(path, e))?;
    writer.write_record(CSV_HEADER).map_err(|e| ArtifactError::csv(path, e))?;
    Ok(writer)
}

fn reader_for(path: &Path) -> Result<csv::Reader<std::fs::File>, ArtifactError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(|e| ArtifactError::csv(path, e))?;
    let headers = reader.headers().map_err(|e| ArtifactError::csv(path, e))?;
    if headers.iter().ne(CSV_HEADER) {
        return Err(ArtifactError::HeaderMismatch {
            path: path.to_path_buf(),
            found: headers.iter().collect::<Vec<_>>().join(","),
        });
    }
    Ok(reader)
}

fn read_rows(path: &Path) -> Result<Vec<ArtifactRow>, ArtifactError> {
    let mut reader = reader_for(path)?;
    let mut rows = Vec::new();
    for row in reader.deserialize() {
        rows.push(row.map_err(|e| ArtifactError::csv(path, e))?);
    }
    Ok(rows)
}

/// Write a single-row artifact, replacing any file already at `path`.
pub fn write_record_artifact(path: &Path, record: &ExtractedRecord) -> Result<(), ArtifactError> {
    let mut writer = writer_for(path)?;
    writer
        .serialize(ArtifactRow::from(record))
        .map_err(|e| ArtifactError::csv(path, e))?;
    writer.flush().map_err(|e| ArtifactError::io(path, e))
}

pub fn read_record_artifact(path: &Path) -> Result<ExtractedRecord, ArtifactError> {
    let row = read_rows(path)?
        .into_iter()
        .next()
        .ok_or_else(|| ArtifactError::EmptyArtifact(path.to_path_buf()))?;
    row.into_record(path)
}

/// All `*.csv` files directly inside `dir`, sorted by file name.
pub fn collect_artifacts(dir: &Path) -> Result<Vec<PathBuf>, ArtifactError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(ArtifactError::io(dir, e)),
    };
    let mut paths = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| ArtifactError::io(dir, e))?.path();
        let is_csv = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("csv"));
        if is_csv && path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

/// Concatenate every artifact in `dir` into `output` (header once), then
/// delete the merged artifacts.
///
/// Sources are only removed once the combined file has been written in full.
pub fn combine_artifacts(dir: &Path, output: &Path) -> Result<CombineSummary, ArtifactError> {
    let sources = collect_artifacts(dir)?;
    if sources.is_empty() {
        return Err(ArtifactError::NoExtractions(dir.to_path_buf()));
    }

    let mut rows = Vec::new();
    for source in &sources {
        rows.extend(read_rows(source)?);
    }

    let mut writer = writer_for(output)?;
    for row in &rows {
        writer.serialize(row).map_err(|e| ArtifactError::csv(output, e))?;
    }
    writer.flush().map_err(|e| ArtifactError::io(output, e))?;
    drop(writer);

    for source in &sources {
        if let Err(e) = std::fs::remove_file(source) {
            tracing::warn!("Could not remove {}: {e}", source.display());
        }
    }
    tracing::info!("Combined {} extraction(s) into {}", rows.len(), output.display());

    Ok(CombineSummary {
        path: output.to_path_buf(),
        rows: rows.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(merchant: &str, item: &str, amount: &str, date: &str) -> ExtractedRecord {
        ExtractedRecord {
            merchant: Some(merchant.into()),
            date: Some(date.into()),
            item: Some(item.into()),
            amount: Some(Decimal::from_str(amount).unwrap()),
        }
    }

    #[test]
    fn artifact_has_header_and_one_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = artifact_path(dir.path(), "a");
        write_record_artifact(&path, &record("STORE X", "Apples", "2.50", "2024-01-05")).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "merchant,date,item,amount\nSTORE X,2024-01-05,Apples,2.50\n");
    }

    #[test]
    fn nulls_are_empty_cells() {
        let dir = tempfile::tempdir().unwrap();
        let path = artifact_path(dir.path(), "blank");
        write_record_artifact(&path, &ExtractedRecord::empty()).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "merchant,date,item,amount\n,,,\n");
        assert_eq!(read_record_artifact(&path).unwrap(), ExtractedRecord::empty());
    }

    #[test]
    fn artifact_round_trip_preserves_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = artifact_path(dir.path(), "r");
        let original = ExtractedRecord {
            merchant: Some("Joe's \"Diner\", Inc".into()),
            date: None,
            item: Some("Coffee\nrefill".into()),
            amount: Some(Decimal::from_str("1234.5").unwrap()),
        };
        write_record_artifact(&path, &original).unwrap();

        let back = read_record_artifact(&path).unwrap();
        assert_eq!(back.merchant, original.merchant);
        assert_eq!(back.item, original.item);
        assert_eq!(back.date, None);
        assert_eq!(back.amount, Some(Decimal::new(12345, 1)));
    }

    #[test]
    fn combine_merges_and_deletes_sources() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("ocr_extractions");
        let out = dir.path().join("out").join("combined.csv");
        write_record_artifact(&artifact_path(&work, "B"), &record("Shop B", "Bread", "3", "2024-02-02")).unwrap();
        write_record_artifact(&artifact_path(&work, "A"), &record("Shop A", "Milk", "1.20", "2024-02-01")).unwrap();

        let summary = combine_artifacts(&work, &out).unwrap();
        assert_eq!(summary.rows, 2);
        assert_eq!(summary.path, out);

        let text = std::fs::read_to_string(&out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "merchant,date,item,amount");
        assert_eq!(lines.iter().filter(|l| **l == "merchant,date,item,amount").count(), 1);
        assert!(lines[1].starts_with("Shop A"));
        assert!(lines[2].starts_with("Shop B"));

        assert!(!artifact_path(&work, "A").exists());
        assert!(!artifact_path(&work, "B").exists());
    }

    #[test]
    fn combine_without_artifacts_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = combine_artifacts(dir.path(), &dir.path().join("out.csv")).unwrap_err();
        assert!(matches!(err, ArtifactError::NoExtractions(_)));

        let missing = dir.path().join("never-created");
        assert!(matches!(
            combine_artifacts(&missing, &dir.path().join("out.csv")),
            Err(ArtifactError::NoExtractions(_))
        ));
    }

    #[test]
    fn foreign_header_is_rejected_and_sources_kept() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("x.csv");
        std::fs::write(&bad, "a,b\n1,2\n").unwrap();

        let err = combine_artifacts(dir.path(), &dir.path().join("out").join("c.csv")).unwrap_err();
        assert!(matches!(err, ArtifactError::HeaderMismatch { .. }));
        assert!(bad.exists());
    }

    #[test]
    fn non_csv_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "hi").unwrap();
        write_record_artifact(&artifact_path(dir.path(), "only"), &ExtractedRecord::empty()).unwrap();

        let found = collect_artifacts(dir.path()).unwrap();
        assert_eq!(found, vec![dir.path().join("only.csv")]);
    }
}
