//! Reporting-source contract, fixture/HTTP clients, and the row normalizer.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sums_core::{
    Dataset, NewUsersRule, Record, SelfLinkPolicy, ShapeDescriptor, UNSET_PLACEHOLDER,
};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "sums-source";

/// Query descriptor handed to a reporting source: ordered dimension and
/// metric names plus a date window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportQuery {
    pub dimensions: Vec<String>,
    pub metrics: Vec<String>,
    pub start_date: String,
    pub end_date: String,
}

/// One raw fetched row: ordered dimension values then ordered metric values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRow {
    pub dimension_values: Vec<String>,
    pub metric_values: Vec<String>,
}

/// A full report response. No row ordering is assumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawReport {
    pub dimension_headers: Vec<String>,
    pub metric_headers: Vec<String>,
    pub rows: Vec<RawRow>,
}

impl RawReport {
    /// Combined header list, dimensions first, as the source orders cells.
    pub fn headers(&self) -> Vec<String> {
        self.dimension_headers
            .iter()
            .chain(self.metric_headers.iter())
            .cloned()
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("report request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} from {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding report response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("reading report fixture {path}: {source}")]
    Fixture {
        path: String,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: reqwest::StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_request_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Opaque provider of report rows. The engine treats it as a black box
/// returning typed tuples; retry policy and latency bounds live behind
/// this seam.
#[async_trait]
pub trait ReportingSource: Send + Sync {
    async fn run_report(&self, query: &ReportQuery) -> Result<RawReport, SourceError>;
}

// GA-style wire format for run-report responses.

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireReport {
    #[serde(default)]
    dimension_headers: Vec<WireHeader>,
    #[serde(default)]
    metric_headers: Vec<WireHeader>,
    #[serde(default)]
    rows: Vec<WireRow>,
}

#[derive(Debug, Deserialize)]
struct WireHeader {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireRow {
    #[serde(default)]
    dimension_values: Vec<WireValue>,
    #[serde(default)]
    metric_values: Vec<WireValue>,
}

#[derive(Debug, Deserialize)]
struct WireValue {
    #[serde(default)]
    value: String,
}

impl From<WireReport> for RawReport {
    fn from(wire: WireReport) -> Self {
        RawReport {
            dimension_headers: wire.dimension_headers.into_iter().map(|h| h.name).collect(),
            metric_headers: wire.metric_headers.into_iter().map(|h| h.name).collect(),
            rows: wire
                .rows
                .into_iter()
                .map(|row| RawRow {
                    dimension_values: row.dimension_values.into_iter().map(|v| v.value).collect(),
                    metric_values: row.metric_values.into_iter().map(|v| v.value).collect(),
                })
                .collect(),
        }
    }
}

fn decode_wire_report(bytes: &[u8]) -> Result<RawReport, SourceError> {
    let wire: WireReport = serde_json::from_slice(bytes)?;
    Ok(wire.into())
}

#[derive(Debug, Clone)]
pub struct HttpSourceConfig {
    pub endpoint: String,
    pub property_id: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

/// Run-report client speaking the GA-style JSON wire format, with bounded
/// retries for transient failures.
#[derive(Debug)]
pub struct HttpReportingSource {
    client: reqwest::Client,
    endpoint: String,
    property_id: String,
    backoff: BackoffPolicy,
}

impl HttpReportingSource {
    pub fn new(config: HttpSourceConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            endpoint: config.endpoint,
            property_id: config.property_id,
            backoff: config.backoff,
        })
    }

    fn report_url(&self) -> String {
        format!(
            "{}/v1beta/properties/{}:runReport",
            self.endpoint.trim_end_matches('/'),
            self.property_id
        )
    }

    fn request_body(&self, query: &ReportQuery) -> serde_json::Value {
        serde_json::json!({
            "property": format!("properties/{}", self.property_id),
            "dimensions": query.dimensions.iter()
                .map(|name| serde_json::json!({ "name": name }))
                .collect::<Vec<_>>(),
            "metrics": query.metrics.iter()
                .map(|name| serde_json::json!({ "name": name }))
                .collect::<Vec<_>>(),
            "dateRanges": [{
                "startDate": query.start_date,
                "endDate": query.end_date,
            }],
        })
    }
}

#[async_trait]
impl ReportingSource for HttpReportingSource {
    async fn run_report(&self, query: &ReportQuery) -> Result<RawReport, SourceError> {
        let url = self.report_url();
        let body = self.request_body(query);
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.client.post(&url).json(&body).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        let bytes = resp.bytes().await?;
                        return decode_wire_report(&bytes);
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(SourceError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_request_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(SourceError::Request(err));
                }
            }
        }

        Err(SourceError::Request(
            last_request_error.expect("retry loop captures a request error"),
        ))
    }
}

/// Reads a captured run-report response from disk. Used for offline runs
/// and tests; the query is recorded only for the trace.
#[derive(Debug, Clone)]
pub struct FixtureReportingSource {
    path: PathBuf,
}

impl FixtureReportingSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ReportingSource for FixtureReportingSource {
    async fn run_report(&self, query: &ReportQuery) -> Result<RawReport, SourceError> {
        debug!(path = %self.path.display(), ?query, "serving report from fixture");
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|source| SourceError::Fixture {
                path: self.path.display().to_string(),
                source,
            })?;
        decode_wire_report(&bytes)
    }
}

pub fn load_report_fixture(path: impl AsRef<Path>) -> Result<RawReport, SourceError> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).map_err(|source| SourceError::Fixture {
        path: path.display().to_string(),
        source,
    })?;
    decode_wire_report(&bytes)
}

/// Normalization failure. The whole batch is rejected; partially
/// normalized batches would break the uniqueness and ordering invariants
/// downstream.
#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("column {name:?} missing from report headers {headers:?}")]
    MissingColumn { name: String, headers: Vec<String> },
    #[error("temporal value {value:?} does not match fixed format {expected}")]
    BadTemporal {
        value: String,
        expected: &'static str,
    },
}

/// Where a staging column's value comes from in the raw row.
enum CellSource {
    Raw(usize),
    Device { category: usize, model: usize },
}

fn synthesize_device(category: &str, model: &str) -> String {
    if category == UNSET_PLACEHOLDER && model == UNSET_PLACEHOLDER {
        UNSET_PLACEHOLDER.to_string()
    } else if model == UNSET_PLACEHOLDER || model.is_empty() {
        category.to_string()
    } else {
        format!("{category} ({model})")
    }
}

fn recode_new_users(rule: NewUsersRule, value: &str) -> String {
    match rule {
        NewUsersRule::PlainCount => value.to_string(),
        NewUsersRule::NewReturnLabel => {
            if value == "1" {
                "New".to_string()
            } else {
                "Return".to_string()
            }
        }
    }
}

/// Normalize one fetched report into a canonical batch for the given shape.
///
/// Rules apply in a fixed order: source-header renames, fixed-width
/// temporal parsing, device synthesis, per-shape newUsers recoding,
/// self-link redaction against `site_host`, a final global
/// placeholder-to-empty pass, and reordering into the shape's staging
/// column order. All-or-nothing: the first bad row rejects the batch.
pub fn normalize_report(
    report: &RawReport,
    shape: &ShapeDescriptor,
    site_host: &str,
) -> Result<Dataset, NormalizeError> {
    let raw_headers = report.headers();
    let renamed: Vec<String> = raw_headers
        .iter()
        .map(|header| {
            shape
                .renames
                .iter()
                .find(|(from, _)| from == header)
                .map(|(_, to)| to.to_string())
                .unwrap_or_else(|| header.clone())
        })
        .collect();

    let find_raw = |name: &str| -> Result<usize, NormalizeError> {
        renamed
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| NormalizeError::MissingColumn {
                name: name.to_string(),
                headers: renamed.clone(),
            })
    };

    let staging = shape.staging_columns();
    let mut sources = Vec::with_capacity(staging.len());
    for column in &staging {
        let source = match shape.device {
            Some(device) if column == device.output => CellSource::Device {
                category: find_raw(device.category)?,
                model: find_raw(device.model)?,
            },
            _ => CellSource::Raw(find_raw(column)?),
        };
        sources.push(source);
    }

    let mut out = Dataset::with_columns(staging.clone());
    'rows: for row in &report.rows {
        let raw_cells: Vec<&str> = row
            .dimension_values
            .iter()
            .chain(row.metric_values.iter())
            .map(String::as_str)
            .collect();
        let fetch = |idx: usize| raw_cells.get(idx).copied().unwrap_or("");

        let mut cells = Vec::with_capacity(staging.len());
        for (column, source) in staging.iter().zip(&sources) {
            let mut value = match source {
                CellSource::Raw(idx) => fetch(*idx).to_string(),
                CellSource::Device { category, model } => {
                    synthesize_device(fetch(*category), fetch(*model))
                }
            };
            if column == shape.temporal_column {
                value = shape.temporal_format.normalize(&value).ok_or_else(|| {
                    NormalizeError::BadTemporal {
                        value: value.clone(),
                        expected: shape.temporal_format.expected_input(),
                    }
                })?;
            }
            if column == "newUsers" {
                value = recode_new_users(shape.new_users_rule, &value);
            }
            cells.push(value);
        }

        if !site_host.is_empty() {
            for link_column in shape.link_columns {
                let idx = staging
                    .iter()
                    .position(|c| c == link_column)
                    .expect("link columns are part of the shape");
                if cells[idx].contains(site_host) {
                    match shape.self_link_policy {
                        SelfLinkPolicy::BlankCell => cells[idx].clear(),
                        SelfLinkPolicy::DropRow => continue 'rows,
                    }
                }
            }
        }

        // Final pass: the source's unset sentinel never leaves this stage.
        for cell in &mut cells {
            if cell == UNSET_PLACEHOLDER {
                cell.clear();
            }
        }

        out.rows.push(Record::new(cells));
    }

    Ok(out)
}
