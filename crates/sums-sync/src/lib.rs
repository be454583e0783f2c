//! Dataset reconciliation and sync pipeline orchestration.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sums_core::{Dataset, Record, ShapeDescriptor, UNSET_PLACEHOLDER};
use sums_source::{
    normalize_report, BackoffPolicy, FixtureReportingSource, HttpReportingSource,
    HttpSourceConfig, ReportQuery, ReportingSource,
};
use sums_store::ArchiveOutcome;
use thiserror::Error;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "sums-sync";

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(
        "schema mismatch for shape {shape}: dataset columns {found:?} do not match {expected:?}"
    )]
    SchemaMismatch {
        shape: String,
        expected: Vec<String>,
        found: Vec<String>,
    },
}

fn scrub_placeholders(rows: &mut [Record]) {
    for row in rows {
        for cell in &mut row.cells {
            if cell == UNSET_PLACEHOLDER {
                cell.clear();
            }
        }
    }
}

/// Merge a freshly normalized batch into the previously persisted dataset.
///
/// Existing rows come first, then incoming; for equal keys the last
/// occurrence wins, so a later run's fresher value for the same key always
/// replaces the stored one and re-running with overlapping fetch windows
/// is idempotent. The result is deduplicated on the shape's key columns,
/// scrubbed of the unset placeholder, stripped of obsolete transient
/// columns, and stably sorted ascending by the shape's temporal column.
pub fn reconcile(
    existing: &Dataset,
    incoming: &Dataset,
    shape: &ShapeDescriptor,
) -> Result<Dataset, ReconcileError> {
    // A persisted dataset whose cleaned column set disagrees with the
    // fresh batch signals the shape changed incompatibly; that is never
    // silently coerced.
    let cleaned = |cols: &[String]| -> HashSet<String> {
        cols.iter()
            .filter(|c| !shape.obsolete_columns.iter().any(|o| *o == c.as_str()))
            .cloned()
            .collect()
    };
    if !existing.columns.is_empty()
        && !incoming.columns.is_empty()
        && cleaned(&existing.columns) != cleaned(&incoming.columns)
    {
        return Err(ReconcileError::SchemaMismatch {
            shape: shape.name.to_string(),
            expected: incoming.columns.clone(),
            found: existing.columns.clone(),
        });
    }

    // Column union, incoming order first: the latest fetch carries the
    // current shape of the data.
    let mut columns: Vec<String> = if incoming.columns.is_empty() {
        existing.columns.clone()
    } else {
        incoming.columns.clone()
    };
    if columns.is_empty() {
        columns = shape.staging_columns();
    }
    for column in &existing.columns {
        if !columns.contains(column) {
            columns.push(column.clone());
        }
    }

    let remap = |ds: &Dataset| -> Vec<Record> {
        let indices: Vec<Option<usize>> = columns.iter().map(|c| ds.column_index(c)).collect();
        ds.rows
            .iter()
            .map(|row| {
                Record::new(
                    indices
                        .iter()
                        .map(|idx| {
                            idx.and_then(|i| row.cells.get(i).cloned())
                                .unwrap_or_default()
                        })
                        .collect(),
                )
            })
            .collect()
    };

    let mut rows = remap(existing);
    rows.extend(remap(incoming));

    // Persisted rows may predate the placeholder policy; clean them again.
    scrub_placeholders(&mut rows);

    // Obsolete transient columns leave the dataset here, not earlier.
    let kept: Vec<usize> = columns
        .iter()
        .enumerate()
        .filter(|(_, c)| !shape.obsolete_columns.iter().any(|o| *o == c.as_str()))
        .map(|(i, _)| i)
        .collect();
    let columns: Vec<String> = kept.iter().map(|&i| columns[i].clone()).collect();
    let mut rows: Vec<Record> = rows
        .into_iter()
        .map(|row| Record::new(kept.iter().map(|&i| row.cells[i].clone()).collect()))
        .collect();

    let expected: Vec<String> = shape.columns.iter().map(|c| c.to_string()).collect();
    let found_set: HashSet<&String> = columns.iter().collect();
    let expected_set: HashSet<&String> = expected.iter().collect();
    if found_set != expected_set {
        return Err(ReconcileError::SchemaMismatch {
            shape: shape.name.to_string(),
            expected,
            found: columns,
        });
    }

    // Deterministic canonical order, never set-derived.
    let order: Vec<usize> = expected
        .iter()
        .map(|c| columns.iter().position(|x| x == c).expect("checked above"))
        .collect();
    let columns = expected;
    for row in &mut rows {
        row.cells = order.iter().map(|&i| row.cells[i].clone()).collect();
    }

    // Dedup keeping the last occurrence, positionally stable.
    let mut seen: HashSet<Vec<String>> = HashSet::new();
    let mut kept_rows: Vec<Record> = Vec::with_capacity(rows.len());
    for row in rows.into_iter().rev() {
        if seen.insert(shape.key_cells(&columns, &row)) {
            kept_rows.push(row);
        }
    }
    kept_rows.reverse();

    let temporal_idx = columns
        .iter()
        .position(|c| c == shape.temporal_column)
        .expect("temporal column is canonical");
    kept_rows.sort_by(|a, b| a.cells[temporal_idx].cmp(&b.cells[temporal_idx]));

    Ok(Dataset {
        columns,
        rows: kept_rows,
    })
}

fn default_true() -> bool {
    true
}

fn default_mode() -> String {
    "http".to_string()
}

fn default_archive_interval() -> i64 {
    30
}

/// `datasets.yaml` at the workspace root: the set of datasets one run
/// maintains.
#[derive(Debug, Clone, Deserialize)]
pub struct DatasetRegistry {
    /// The operator's own site host, for self-link redaction.
    #[serde(default)]
    pub site_host: String,
    pub datasets: Vec<DatasetConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatasetConfig {
    pub id: String,
    pub shape: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// "http" against the configured endpoint, or "fixture" for captured
    /// responses.
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default)]
    pub fixture: Option<PathBuf>,
    pub output: PathBuf,
    pub archive_dir: PathBuf,
    #[serde(default = "default_archive_interval")]
    pub archive_min_interval_days: i64,
    pub query: QuerySpec,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuerySpec {
    pub dimensions: Vec<String>,
    pub metrics: Vec<String>,
    pub start_date: String,
    pub end_date: String,
}

impl QuerySpec {
    pub fn to_query(&self) -> ReportQuery {
        ReportQuery {
            dimensions: self.dimensions.clone(),
            metrics: self.metrics.clone(),
            start_date: self.start_date.clone(),
            end_date: self.end_date.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub report_endpoint: String,
    pub property_id: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub sync_cron_1: String,
    pub sync_cron_2: String,
    pub workspace_root: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            report_endpoint: std::env::var("SUMS_REPORT_ENDPOINT")
                .unwrap_or_else(|_| "https://analyticsdata.googleapis.com".to_string()),
            property_id: std::env::var("SUMS_PROPERTY_ID").unwrap_or_default(),
            user_agent: std::env::var("SUMS_USER_AGENT")
                .unwrap_or_else(|_| "sums-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("SUMS_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            scheduler_enabled: std::env::var("SUMS_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron_1: std::env::var("SUMS_SYNC_CRON_1")
                .unwrap_or_else(|_| "0 0 6 * * *".to_string()),
            sync_cron_2: std::env::var("SUMS_SYNC_CRON_2")
                .unwrap_or_else(|_| "0 0 18 * * *".to_string()),
            workspace_root: PathBuf::from("."),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetRunReport {
    pub id: String,
    pub shape: String,
    pub status: String,
    pub fetched_rows: usize,
    pub existing_rows: usize,
    pub merged_rows: usize,
    pub added_rows: i64,
    pub sha256: Option<String>,
    pub archive: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub datasets: Vec<DatasetRunReport>,
}

pub struct SyncPipeline {
    config: SyncConfig,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Self {
        Self { config }
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let registry = self.load_registry().await?;

        let mut reports = Vec::new();
        for dataset in registry.datasets.iter().filter(|d| d.enabled) {
            let report = self
                .run_dataset(&registry.site_host, dataset)
                .await
                .with_context(|| format!("syncing dataset {}", dataset.id))?;
            reports.push(report);
        }

        let finished_at = Utc::now();
        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at,
            datasets: reports,
        };
        self.write_summary(&summary).await?;
        info!(%run_id, datasets = summary.datasets.len(), "sync run complete");
        Ok(summary)
    }

    async fn load_registry(&self) -> Result<DatasetRegistry> {
        let path = self.config.workspace_root.join("datasets.yaml");
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    fn source_for(&self, dataset: &DatasetConfig) -> Result<Box<dyn ReportingSource>> {
        if dataset.mode == "fixture" {
            let fixture = dataset
                .fixture
                .as_ref()
                .with_context(|| format!("dataset {} is fixture mode without a fixture", dataset.id))?;
            Ok(Box::new(FixtureReportingSource::new(
                self.config.workspace_root.join(fixture),
            )))
        } else {
            let source = HttpReportingSource::new(HttpSourceConfig {
                endpoint: self.config.report_endpoint.clone(),
                property_id: self.config.property_id.clone(),
                timeout: Duration::from_secs(self.config.http_timeout_secs),
                user_agent: Some(self.config.user_agent.clone()),
                backoff: BackoffPolicy::default(),
            })?;
            Ok(Box::new(source))
        }
    }

    async fn run_dataset(
        &self,
        site_host: &str,
        dataset: &DatasetConfig,
    ) -> Result<DatasetRunReport> {
        let shape = ShapeDescriptor::by_name(&dataset.shape)
            .with_context(|| format!("unknown shape {:?}", dataset.shape))?;
        let output = self.config.workspace_root.join(&dataset.output);
        let archive_dir = self.config.workspace_root.join(&dataset.archive_dir);

        let existing = sums_store::load(&output).await?;
        let source = self.source_for(dataset)?;
        let report = source
            .run_report(&dataset.query.to_query())
            .await
            .context("running report")?;

        if report.rows.is_empty() {
            // A no-op fetch must never truncate existing data.
            info!(dataset = %dataset.id, "report returned zero rows; leaving dataset untouched");
            return Ok(DatasetRunReport {
                id: dataset.id.clone(),
                shape: shape.name.to_string(),
                status: "no-input".to_string(),
                fetched_rows: 0,
                existing_rows: existing.len(),
                merged_rows: existing.len(),
                added_rows: 0,
                sha256: None,
                archive: None,
            });
        }

        let batch = normalize_report(&report, &shape, site_host)?;
        let merged = reconcile(&existing, &batch, &shape)?;
        sums_store::save(&merged, &output).await?;

        let added = merged.len() as i64 - existing.len() as i64;
        info!(dataset = %dataset.id, rows = merged.len(), added, "dataset saved");

        let sha256 = file_sha256(&output).await?;

        // Archival is best-effort backup; its failure never undoes the save.
        let archive = match sums_store::maybe_archive(
            &output,
            &archive_dir,
            dataset.archive_min_interval_days,
            Utc::now().date_naive(),
        )
        .await
        {
            Ok(ArchiveOutcome::Created(path)) => Some(format!("created {}", path.display())),
            Ok(ArchiveOutcome::Skipped { most_recent }) => {
                Some(format!("skipped (most recent {most_recent})"))
            }
            Ok(ArchiveOutcome::SourceMissing) => Some("source missing".to_string()),
            Err(err) => {
                warn!(dataset = %dataset.id, error = %err, "archive attempt failed");
                Some(format!("failed: {err}"))
            }
        };

        Ok(DatasetRunReport {
            id: dataset.id.clone(),
            shape: shape.name.to_string(),
            status: "updated".to_string(),
            fetched_rows: report.rows.len(),
            existing_rows: existing.len(),
            merged_rows: merged.len(),
            added_rows: added,
            sha256: Some(sha256),
            archive,
        })
    }

    async fn write_summary(&self, summary: &SyncRunSummary) -> Result<()> {
        let dir = self
            .config
            .workspace_root
            .join("reports")
            .join(summary.run_id.to_string());
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
        let bytes = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
        fs::write(dir.join("summary.json"), bytes)
            .await
            .context("writing summary.json")?;
        Ok(())
    }

    pub async fn maybe_build_scheduler(&self) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for cron in [&self.config.sync_cron_1, &self.config.sync_cron_2] {
            let config = self.config.clone();
            let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
                let config = config.clone();
                Box::pin(async move {
                    if let Err(err) = SyncPipeline::new(config).run_once().await {
                        warn!(error = %err, "scheduled sync run failed");
                    }
                })
            })
            .with_context(|| format!("creating scheduler job for cron {cron}"))?;
            sched.add(job).await.context("adding scheduler job")?;
        }
        Ok(Some(sched))
    }
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env();
    SyncPipeline::new(config).run_once().await
}

async fn file_sha256(path: &std::path::Path) -> Result<String> {
    let bytes = fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregate_dataset(rows: &[[&str; 5]]) -> Dataset {
        let mut ds = Dataset::with_columns(vec![
            "date".into(),
            "country".into(),
            "city".into(),
            "activeUsers".into(),
            "newUsers".into(),
        ]);
        for row in rows {
            ds.rows
                .push(Record::new(row.iter().map(|c| c.to_string()).collect()));
        }
        ds
    }

    fn detail_staging_dataset(rows: &[[&str; 9]]) -> Dataset {
        let mut ds = Dataset::with_columns(
            [
                "time", "country", "city", "device", "newUsers", "page", "fileName", "linkUrl",
                "activeUsers",
            ]
            .iter()
            .map(|c| c.to_string())
            .collect(),
        );
        for row in rows {
            ds.rows
                .push(Record::new(row.iter().map(|c| c.to_string()).collect()));
        }
        ds
    }

    #[test]
    fn incoming_row_wins_for_an_existing_key() {
        let shape = ShapeDescriptor::aggregate();
        let existing = aggregate_dataset(&[["2024-01-01", "US", "NY", "5", "1"]]);
        let incoming = aggregate_dataset(&[
            ["2024-01-01", "US", "NY", "7", "2"],
            ["2024-01-02", "US", "NY", "3", "3"],
        ]);

        let merged = reconcile(&existing, &incoming, &shape).expect("reconcile");
        assert_eq!(merged.len(), 2);
        assert_eq!(merged.cell(0, "date"), Some("2024-01-01"));
        assert_eq!(merged.cell(0, "activeUsers"), Some("7"));
        assert_eq!(merged.cell(0, "newUsers"), Some("2"));
        assert_eq!(merged.cell(1, "date"), Some("2024-01-02"));
        assert_eq!(merged.cell(1, "activeUsers"), Some("3"));
    }

    #[test]
    fn reconcile_is_idempotent() {
        let shape = ShapeDescriptor::aggregate();
        let existing = aggregate_dataset(&[
            ["2024-01-03", "JP", "Tokyo", "2", "0"],
            ["2024-01-01", "US", "NY", "5", "1"],
        ]);
        let incoming = aggregate_dataset(&[
            ["2024-01-01", "US", "NY", "7", "2"],
            ["2024-01-02", "US", "NY", "3", "3"],
        ]);

        let once = reconcile(&existing, &incoming, &shape).expect("first");
        let with_empty = reconcile(&once, &Dataset::empty(), &shape).expect("empty incoming");
        assert_eq!(with_empty, once);

        let again = reconcile(&once, &incoming, &shape).expect("same batch again");
        assert_eq!(again, once);
    }

    #[test]
    fn output_keys_are_unique_and_temporally_ordered() {
        let shape = ShapeDescriptor::aggregate();
        let existing = aggregate_dataset(&[
            ["2024-02-01", "US", "NY", "1", "0"],
            ["2024-01-05", "DE", "Berlin", "4", "2"],
        ]);
        let incoming = aggregate_dataset(&[
            ["2024-01-05", "DE", "Berlin", "6", "2"],
            ["2024-01-01", "US", "NY", "5", "1"],
            ["2024-01-05", "DE", "Berlin", "9", "3"],
        ]);

        let merged = reconcile(&existing, &incoming, &shape).expect("reconcile");
        let mut keys = HashSet::new();
        for (i, row) in merged.rows.iter().enumerate() {
            assert!(keys.insert(shape.key_cells(&merged.columns, row)));
            if i > 0 {
                let prev = merged.cell(i - 1, "date").expect("prev");
                let cur = merged.cell(i, "date").expect("cur");
                assert!(prev <= cur);
            }
        }
        // The internal duplicate keeps its last value.
        assert_eq!(merged.cell(1, "activeUsers"), Some("9"));
    }

    #[test]
    fn stale_placeholders_in_persisted_rows_are_scrubbed() {
        let shape = ShapeDescriptor::aggregate();
        let existing = aggregate_dataset(&[["2024-01-01", "(not set)", "(not set)", "5", "1"]]);
        let incoming = aggregate_dataset(&[["2024-01-02", "US", "NY", "3", "3"]]);

        let merged = reconcile(&existing, &incoming, &shape).expect("reconcile");
        for row in &merged.rows {
            for cell in &row.cells {
                assert_ne!(cell, UNSET_PLACEHOLDER);
            }
        }
        assert_eq!(merged.cell(0, "country"), Some(""));
    }

    #[test]
    fn obsolete_transient_column_is_dropped_at_merge() {
        let shape = ShapeDescriptor::detail();
        let existing = Dataset::with_columns(
            shape
                .columns
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>(),
        );
        let incoming = detail_staging_dataset(&[[
            "2024-01-01 12:30:00",
            "US",
            "NY",
            "mobile",
            "New",
            "/",
            "",
            "",
            "1",
        ]]);

        let merged = reconcile(&existing, &incoming, &shape).expect("reconcile");
        assert!(merged.column_index("activeUsers").is_none());
        assert_eq!(merged.columns.len(), shape.columns.len());
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn whole_row_identity_dedups_exact_duplicates_only() {
        let shape = ShapeDescriptor::detail();
        let row = [
            "2024-01-01 12:30:00",
            "US",
            "NY",
            "mobile",
            "New",
            "/",
            "",
            "",
            "1",
        ];
        let mut near_duplicate = row;
        near_duplicate[5] = "/about";
        let incoming = detail_staging_dataset(&[row, row, near_duplicate]);

        let merged = reconcile(&Dataset::empty(), &incoming, &shape).expect("reconcile");
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn schema_drift_is_an_error_not_a_coercion() {
        let shape = ShapeDescriptor::aggregate();
        let mut existing = aggregate_dataset(&[["2024-01-01", "US", "NY", "5", "1"]]);
        existing.columns.push("browser".into());
        for row in &mut existing.rows {
            row.cells.push("firefox".into());
        }
        let incoming = aggregate_dataset(&[["2024-01-02", "US", "NY", "3", "3"]]);

        let err = reconcile(&existing, &incoming, &shape).expect_err("drift");
        let ReconcileError::SchemaMismatch {
            shape: shape_name,
            found,
            ..
        } = err;
        assert_eq!(shape_name, "aggregate");
        assert!(found.contains(&"browser".to_string()));
    }

    #[test]
    fn a_column_missing_from_existing_is_also_a_mismatch() {
        let shape = ShapeDescriptor::aggregate();
        let mut existing = aggregate_dataset(&[["2024-01-01", "US", "NY", "5", "1"]]);
        existing.columns.pop();
        for row in &mut existing.rows {
            row.cells.pop();
        }
        let incoming = aggregate_dataset(&[["2024-01-02", "US", "NY", "3", "3"]]);

        assert!(reconcile(&existing, &incoming, &shape).is_err());
    }

    #[test]
    fn empty_existing_still_dedups_the_incoming_batch() {
        let shape = ShapeDescriptor::aggregate();
        let incoming = aggregate_dataset(&[
            ["2024-01-01", "US", "NY", "5", "1"],
            ["2024-01-01", "US", "NY", "8", "2"],
        ]);

        let merged = reconcile(&Dataset::empty(), &incoming, &shape).expect("reconcile");
        assert_eq!(merged.len(), 1);
        assert_eq!(merged.cell(0, "activeUsers"), Some("8"));
    }
}
