//! CSV dataset persistence and dated archival.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::NaiveDate;
use sums_core::{Dataset, Record};
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "sums-store";

pub const ARCHIVE_DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("csv error at {path}: {source}")]
    Csv {
        path: String,
        #[source]
        source: csv::Error,
    },
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }

    fn csv(path: &Path, source: csv::Error) -> Self {
        Self::Csv {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Load a persisted dataset. A missing file is the normal "no prior data"
/// state and yields an empty dataset, not an error. Every cell is read
/// back as a string; no type inference happens on load.
pub async fn load(path: &Path) -> Result<Dataset, StoreError> {
    match fs::read(path).await {
        Ok(bytes) => parse_csv(path, &bytes),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Dataset::empty()),
        Err(err) => Err(StoreError::io(path, err)),
    }
}

fn parse_csv(path: &Path, bytes: &[u8]) -> Result<Dataset, StoreError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(false)
        .from_reader(bytes);
    let columns: Vec<String> = reader
        .headers()
        .map_err(|e| StoreError::csv(path, e))?
        .iter()
        .map(String::from)
        .collect();
    let mut dataset = Dataset::with_columns(columns);
    for result in reader.records() {
        let record = result.map_err(|e| StoreError::csv(path, e))?;
        dataset
            .rows
            .push(Record::new(record.iter().map(String::from).collect()));
    }
    Ok(dataset)
}

fn render_csv(path: &Path, dataset: &Dataset) -> Result<Vec<u8>, StoreError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(&dataset.columns)
        .map_err(|e| StoreError::csv(path, e))?;
    for record in &dataset.rows {
        writer
            .write_record(&record.cells)
            .map_err(|e| StoreError::csv(path, e))?;
    }
    writer
        .into_inner()
        .map_err(|e| StoreError::io(path, e.into_error()))
}

/// Persist the dataset as delimited text with a header row, column order
/// exactly as given, replacing any prior file. The write goes to a temp
/// file in the destination directory and is renamed into place, so a
/// reader never observes a half-written file.
pub async fn save(dataset: &Dataset, path: &Path) -> Result<(), StoreError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .map_err(|e| StoreError::io(parent, e))?;

    let bytes = render_csv(path, dataset)?;
    let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
    fs::write(&temp_path, &bytes)
        .await
        .map_err(|e| StoreError::io(&temp_path, e))?;

    match fs::rename(&temp_path, path).await {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(StoreError::io(path, err))
        }
    }
}

/// What `maybe_archive` decided for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveOutcome {
    Created(PathBuf),
    /// Most recent archive is still within the interval.
    Skipped { most_recent: NaiveDate },
    /// The live dataset file was missing at copy time. Reported, not raised.
    SourceMissing,
}

fn split_name(path: &Path) -> (String, String) {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    (stem, ext)
}

/// Dates of existing archives for the given live file, discovered by
/// scanning `archive_dir` for `<stem>_<YYYY-MM-DD>.<ext>` names. The
/// manifest is derived on every run, never separately persisted.
pub async fn scan_archive_dates(
    current_file: &Path,
    archive_dir: &Path,
) -> anyhow::Result<Vec<NaiveDate>> {
    let (stem, ext) = split_name(current_file);
    let prefix = format!("{stem}_");
    let suffix = format!(".{ext}");

    let mut dates = Vec::new();
    let mut entries = match fs::read_dir(archive_dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(dates),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("scanning archive dir {}", archive_dir.display()))
        }
    };
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("scanning archive dir {}", archive_dir.display()))?
    {
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(rest) = name.strip_prefix(&prefix) else {
            continue;
        };
        let Some(token) = rest.strip_suffix(&suffix) else {
            continue;
        };
        if let Ok(date) = NaiveDate::parse_from_str(token, ARCHIVE_DATE_FORMAT) {
            dates.push(date);
        }
    }
    Ok(dates)
}

/// Snapshot the live dataset file into a dated, immutable archive copy if
/// the most recent archive is at least `min_interval_days` old (or none
/// exists). At most one archive is created per invocation, named for
/// `today`; a same-day rerun lands on the same name rather than producing
/// a second file for one date.
pub async fn maybe_archive(
    current_file: &Path,
    archive_dir: &Path,
    min_interval_days: i64,
    today: NaiveDate,
) -> anyhow::Result<ArchiveOutcome> {
    let dates = scan_archive_dates(current_file, archive_dir).await?;
    if let Some(most_recent) = dates.into_iter().max() {
        let age_days = (today - most_recent).num_days();
        if age_days < min_interval_days {
            return Ok(ArchiveOutcome::Skipped { most_recent });
        }
    }

    let exists = fs::try_exists(current_file)
        .await
        .with_context(|| format!("checking {}", current_file.display()))?;
    if !exists {
        warn!(path = %current_file.display(), "archive source file missing; skipping");
        return Ok(ArchiveOutcome::SourceMissing);
    }

    fs::create_dir_all(archive_dir)
        .await
        .with_context(|| format!("creating archive dir {}", archive_dir.display()))?;
    let (stem, ext) = split_name(current_file);
    let target = archive_dir.join(format!(
        "{stem}_{}.{ext}",
        today.format(ARCHIVE_DATE_FORMAT)
    ));
    fs::copy(current_file, &target).await.with_context(|| {
        format!(
            "copying {} -> {}",
            current_file.display(),
            target.display()
        )
    })?;
    info!(archive = %target.display(), "created dataset archive");
    Ok(ArchiveOutcome::Created(target))
}
