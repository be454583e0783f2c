//! Core domain model for SUMS: records, datasets, and shape descriptors.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "sums-core";

/// The reporting source's literal sentinel for "value not collected".
/// It must never survive into a persisted dataset.
pub const UNSET_PLACEHOLDER: &str = "(not set)";

/// One observation. Cells are plain strings aligned to the owning
/// [`Dataset`]'s column list; all semantic typing was already baked in
/// as printed strings by the normalizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub cells: Vec<String>,
}

impl Record {
    pub fn new(cells: Vec<String>) -> Self {
        Self { cells }
    }
}

/// An ordered sequence of records sharing one column set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Dataset {
    pub columns: Vec<String>,
    pub rows: Vec<Record>,
}

impl Dataset {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_columns(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn cell(&self, row: usize, column: &str) -> Option<&str> {
        let idx = self.column_index(column)?;
        self.rows.get(row)?.cells.get(idx).map(String::as_str)
    }
}

/// How the source packs the shape's primary temporal column, and the
/// canonical printed form it normalizes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemporalFormat {
    /// `YYYYMMDD` (exactly 8 digits) -> `YYYY-MM-DD`.
    CalendarDate,
    /// `YYYYMMDDHHMM` (exactly 12 digits) -> `YYYY-MM-DD HH:MM:SS`.
    DateHourMinute,
}

impl TemporalFormat {
    pub fn expected_input(&self) -> &'static str {
        match self {
            TemporalFormat::CalendarDate => "YYYYMMDD",
            TemporalFormat::DateHourMinute => "YYYYMMDDHHMM",
        }
    }

    /// Parse a raw temporal token into the canonical printed form.
    /// Any deviation from the fixed width is a parse failure; temporal
    /// tokens are never guessed at.
    pub fn normalize(&self, raw: &str) -> Option<String> {
        match self {
            TemporalFormat::CalendarDate => {
                if raw.len() != 8 {
                    return None;
                }
                let date = NaiveDate::parse_from_str(raw, "%Y%m%d").ok()?;
                Some(date.format("%Y-%m-%d").to_string())
            }
            TemporalFormat::DateHourMinute => {
                if raw.len() != 12 {
                    return None;
                }
                let stamp = NaiveDateTime::parse_from_str(raw, "%Y%m%d%H%M").ok()?;
                Some(stamp.format("%Y-%m-%d %H:%M:%S").to_string())
            }
        }
    }
}

/// The column subset whose equality defines row identity for dedup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyColumns {
    Named(&'static [&'static str]),
    WholeRow,
}

/// What to do with a link cell that points back at the operator's own site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelfLinkPolicy {
    /// Drop the whole row from the batch.
    DropRow,
    /// Blank the offending cell, keep the row.
    BlankCell,
}

/// How the `newUsers` metric is rendered per shape. The aggregate shape
/// keeps the plain count; the detail shape recodes the 0/1 flag into a
/// visitor label. The two shapes must not share recoding logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NewUsersRule {
    PlainCount,
    NewReturnLabel,
}

/// Synthesis of a composite device column from two raw source columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSynthesis {
    pub output: &'static str,
    pub category: &'static str,
    pub model: &'static str,
}

/// A named schema variant: canonical column order, key columns, temporal
/// handling, recoding and redaction policy. Passed as a first-class value
/// so the engine never branches on which dataset it is processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShapeDescriptor {
    pub name: &'static str,
    /// Persisted column order. The durable contract other tools read.
    pub columns: &'static [&'static str],
    pub key_columns: KeyColumns,
    pub temporal_column: &'static str,
    pub temporal_format: TemporalFormat,
    /// Source header -> canonical name renames.
    pub renames: &'static [(&'static str, &'static str)],
    /// Transient columns carried through normalization and dropped only
    /// at the reconcile stage, so they stay visible to interim diagnostics.
    pub obsolete_columns: &'static [&'static str],
    /// Columns subject to self-link redaction.
    pub link_columns: &'static [&'static str],
    pub self_link_policy: SelfLinkPolicy,
    pub new_users_rule: NewUsersRule,
    pub device: Option<DeviceSynthesis>,
}

impl ShapeDescriptor {
    /// Daily-aggregate shape: one row per (date, country, city).
    pub fn aggregate() -> Self {
        Self {
            name: "aggregate",
            columns: &["date", "country", "city", "activeUsers", "newUsers"],
            key_columns: KeyColumns::Named(&["date", "country", "city"]),
            temporal_column: "date",
            temporal_format: TemporalFormat::CalendarDate,
            renames: &[],
            obsolete_columns: &[],
            link_columns: &[],
            self_link_policy: SelfLinkPolicy::DropRow,
            new_users_rule: NewUsersRule::PlainCount,
            device: None,
        }
    }

    /// Event-detail shape: whole-row identity, per-event timestamps.
    pub fn detail() -> Self {
        Self {
            name: "detail",
            columns: &[
                "time", "country", "city", "device", "newUsers", "page", "fileName", "linkUrl",
            ],
            key_columns: KeyColumns::WholeRow,
            temporal_column: "time",
            temporal_format: TemporalFormat::DateHourMinute,
            renames: &[
                ("dateHourMinute", "time"),
                ("pagePathPlusQueryString", "page"),
            ],
            obsolete_columns: &["activeUsers"],
            link_columns: &["linkUrl"],
            self_link_policy: SelfLinkPolicy::BlankCell,
            new_users_rule: NewUsersRule::NewReturnLabel,
            device: Some(DeviceSynthesis {
                output: "device",
                category: "deviceCategory",
                model: "deviceModel",
            }),
        }
    }

    pub fn by_name(name: &str) -> Option<Self> {
        match name {
            "aggregate" => Some(Self::aggregate()),
            "detail" => Some(Self::detail()),
            _ => None,
        }
    }

    /// Columns as emitted by the normalizer: canonical order followed by
    /// the transient obsolete columns.
    pub fn staging_columns(&self) -> Vec<String> {
        self.columns
            .iter()
            .chain(self.obsolete_columns.iter())
            .map(|c| c.to_string())
            .collect()
    }

    pub fn key_cells(&self, columns: &[String], record: &Record) -> Vec<String> {
        match self.key_columns {
            KeyColumns::WholeRow => record.cells.clone(),
            KeyColumns::Named(names) => names
                .iter()
                .filter_map(|name| {
                    columns
                        .iter()
                        .position(|c| c == name)
                        .and_then(|idx| record.cells.get(idx).cloned())
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calendar_date_requires_exact_width() {
        let fmt = TemporalFormat::CalendarDate;
        assert_eq!(fmt.normalize("20240101").as_deref(), Some("2024-01-01"));
        assert!(fmt.normalize("2024-01-01").is_none());
        assert!(fmt.normalize("202401011").is_none());
        assert!(fmt.normalize("").is_none());
    }

    #[test]
    fn date_hour_minute_requires_exact_width() {
        let fmt = TemporalFormat::DateHourMinute;
        assert_eq!(
            fmt.normalize("202401011230").as_deref(),
            Some("2024-01-01 12:30:00")
        );
        assert!(fmt.normalize("2024010112").is_none());
        assert!(fmt.normalize("20240101123000").is_none());
        assert!(fmt.normalize("20240199extra").is_none());
    }

    #[test]
    fn aggregate_shape_keys_are_date_country_city() {
        let shape = ShapeDescriptor::aggregate();
        assert_eq!(
            shape.key_columns,
            KeyColumns::Named(&["date", "country", "city"])
        );
        assert_eq!(shape.temporal_column, "date");
        assert!(shape.obsolete_columns.is_empty());
    }

    #[test]
    fn detail_shape_stages_active_users_after_canonical_columns() {
        let shape = ShapeDescriptor::detail();
        let staging = shape.staging_columns();
        assert_eq!(staging.last().map(String::as_str), Some("activeUsers"));
        assert_eq!(staging.len(), shape.columns.len() + 1);
    }

    #[test]
    fn whole_row_key_uses_every_cell() {
        let shape = ShapeDescriptor::detail();
        let columns: Vec<String> = shape.staging_columns();
        let record = Record::new(vec!["a".into(); columns.len()]);
        assert_eq!(shape.key_cells(&columns, &record).len(), columns.len());
    }

    #[test]
    fn dataset_cell_lookup_by_column_name() {
        let mut ds = Dataset::with_columns(vec!["date".into(), "country".into()]);
        ds.rows
            .push(Record::new(vec!["2024-01-01".into(), "US".into()]));
        assert_eq!(ds.cell(0, "country"), Some("US"));
        assert_eq!(ds.cell(0, "missing"), None);
        assert_eq!(ds.cell(1, "country"), None);
    }
}
