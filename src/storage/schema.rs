//! Output schemas and file layout
//!
//! One CSV per Region per phase. Column order is fixed by configuration;
//! records expose values by column name and the schema lays them out.

use std::borrow::Cow;
use std::path::{Path, PathBuf};

use crate::domain::{BasicRecord, DetailRecord, Region, collapse_whitespace, is_blank};
use crate::infrastructure::config::SchemaConfig;

pub const HAS_DETAIL_REFERENCE: &str = "has_detail_reference";
pub const READY_FOR_PHASE2: &str = "ready_for_phase2";
pub const REGION: &str = "region";
pub const REGION_ID: &str = "region_id";
pub const SUBREGION: &str = "subregion";
pub const SUBREGION_ID: &str = "subregion_id";
pub const EXTRACTED_AT: &str = "extracted_at";
pub const PRIMARY_ID: &str = "primary_id";
pub const DETAIL_REFERENCE: &str = "detail_reference";
pub const DETAIL_EXTRACTED_AT: &str = "detail_extracted_at";
pub const EXTRACTION_STATUS: &str = "extraction_status";
pub const FIELDS_EXTRACTED_COUNT: &str = "fields_extracted_count";
pub const CRITICAL_FIELDS_COUNT: &str = "critical_fields_count";

/// Columns the layout always writes; configured fields may not reuse them.
pub const FIXED_COLUMNS: &[&str] = &[
    HAS_DETAIL_REFERENCE,
    READY_FOR_PHASE2,
    REGION,
    REGION_ID,
    SUBREGION,
    SUBREGION_ID,
    EXTRACTED_AT,
    PRIMARY_ID,
    DETAIL_REFERENCE,
    DETAIL_EXTRACTED_AT,
    EXTRACTION_STATUS,
    FIELDS_EXTRACTED_COUNT,
    CRITICAL_FIELDS_COUNT,
];

/// Columns that exist only to steer the next phase and are not carried on.
const TRANSIENT_COLUMNS: &[&str] = &[READY_FOR_PHASE2];

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// A record that can be laid out as one output row.
pub trait TabularRecord {
    fn primary_id(&self) -> &str;

    /// Value for `column`, `None` when blank.
    fn column_value(&self, column: &str) -> Option<Cow<'_, str>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSchema {
    columns: Vec<String>,
    missing_value: String,
    placeholders: Vec<String>,
}

impl OutputSchema {
    pub fn phase1(schema: &SchemaConfig, missing_value: &str) -> Self {
        let mut columns: Vec<String> = [
            HAS_DETAIL_REFERENCE,
            READY_FOR_PHASE2,
            REGION,
            REGION_ID,
            SUBREGION,
            SUBREGION_ID,
            EXTRACTED_AT,
            PRIMARY_ID,
        ]
        .map(String::from)
        .to_vec();
        columns.extend(schema.record_fields.iter().cloned());
        columns.push(DETAIL_REFERENCE.to_string());
        Self::with_columns(columns, schema, missing_value)
    }

    pub fn phase2(schema: &SchemaConfig, missing_value: &str) -> Self {
        let mut columns: Vec<String> = Self::phase1(schema, missing_value)
            .columns
            .into_iter()
            .filter(|c| !TRANSIENT_COLUMNS.contains(&c.as_str()))
            .collect();
        columns.extend(schema.detail_fields.iter().cloned());
        columns.extend(
            [
                DETAIL_EXTRACTED_AT,
                EXTRACTION_STATUS,
                FIELDS_EXTRACTED_COUNT,
                CRITICAL_FIELDS_COUNT,
            ]
            .map(String::from),
        );
        Self::with_columns(columns, schema, missing_value)
    }

    fn with_columns(columns: Vec<String>, schema: &SchemaConfig, missing_value: &str) -> Self {
        Self {
            columns,
            missing_value: missing_value.to_string(),
            placeholders: schema.placeholder_values.clone(),
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }

    pub fn missing_value(&self) -> &str {
        &self.missing_value
    }

    pub fn placeholders(&self) -> &[String] {
        &self.placeholders
    }

    /// Blank as persisted: empty, the missing-value marker or a placeholder.
    pub fn is_blank_value(&self, value: &str) -> bool {
        value.trim() == self.missing_value || is_blank(value, &self.placeholders)
    }

    /// One row, single-line, blanks replaced by the missing-value marker.
    pub fn row<R: TabularRecord + ?Sized>(&self, record: &R) -> Vec<String> {
        self.columns
            .iter()
            .map(|column| {
                record
                    .column_value(column)
                    .map(|v| collapse_whitespace(&v))
                    .filter(|v| !v.is_empty())
                    .unwrap_or_else(|| self.missing_value.clone())
            })
            .collect()
    }
}

fn bool_flag(value: bool) -> Cow<'static, str> {
    Cow::Borrowed(if value { "true" } else { "false" })
}

impl TabularRecord for BasicRecord {
    fn primary_id(&self) -> &str {
        &self.primary_id
    }

    fn column_value(&self, column: &str) -> Option<Cow<'_, str>> {
        match column {
            HAS_DETAIL_REFERENCE | READY_FOR_PHASE2 => Some(bool_flag(self.has_detail_reference())),
            REGION => Some(Cow::Borrowed(&self.region_name)),
            REGION_ID => Some(Cow::Borrowed(&self.region_id)),
            SUBREGION => Some(Cow::Borrowed(&self.subregion_name)),
            SUBREGION_ID => Some(Cow::Borrowed(&self.subregion_id)),
            EXTRACTED_AT => Some(Cow::Owned(self.extracted_at.format(TIMESTAMP_FORMAT).to_string())),
            PRIMARY_ID => Some(Cow::Borrowed(&self.primary_id)),
            DETAIL_REFERENCE => self.detail_reference.as_deref().map(Cow::Borrowed),
            field => self.field(field).map(Cow::Borrowed),
        }
    }
}

impl TabularRecord for DetailRecord {
    fn primary_id(&self) -> &str {
        &self.basic.primary_id
    }

    fn column_value(&self, column: &str) -> Option<Cow<'_, str>> {
        match column {
            DETAIL_EXTRACTED_AT => Some(Cow::Owned(
                self.detail_extracted_at.format(TIMESTAMP_FORMAT).to_string(),
            )),
            EXTRACTION_STATUS => Some(Cow::Borrowed(self.status.as_str())),
            FIELDS_EXTRACTED_COUNT => Some(Cow::Owned(self.fields_extracted_count.to_string())),
            CRITICAL_FIELDS_COUNT => Some(Cow::Owned(self.critical_fields_count.to_string())),
            column => self
                .basic
                .column_value(column)
                .or_else(|| self.detail_fields.get(column).map(|v| Cow::Borrowed(v.as_str()))),
        }
    }
}

/// Which phase an output file belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Basic,
    Detail,
}

impl Phase {
    const fn suffix(self) -> &'static str {
        match self {
            Self::Basic => "_phase1.csv",
            Self::Detail => "_phase2.csv",
        }
    }
}

/// File naming inside the output directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLayout {
    dir: PathBuf,
}

impl OutputLayout {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn phase1_path(&self, region: &Region) -> PathBuf {
        self.path_for_slug(&region.slug(), Phase::Basic)
    }

    pub fn phase2_path(&self, region: &Region) -> PathBuf {
        self.path_for_slug(&region.slug(), Phase::Detail)
    }

    pub fn path_for_slug(&self, slug: &str, phase: Phase) -> PathBuf {
        self.dir.join(format!("{slug}{}", phase.suffix()))
    }

    /// Per-Subregion record counts of a count-only pass.
    pub fn counts_path(&self, region: &Region) -> PathBuf {
        self.dir.join(format!("{}_counts.csv", region.slug()))
    }

    pub fn run_summary_path(&self) -> PathBuf {
        self.dir.join("run_summary.json")
    }

    pub fn enrichment_summary_path(&self) -> PathBuf {
        self.dir.join("enrichment_summary.json")
    }

    /// Slugs of every Phase-1 file present, sorted.
    pub fn phase1_slugs(&self) -> std::io::Result<Vec<String>> {
        let mut slugs = Vec::new();
        if !self.dir.exists() {
            return Ok(slugs);
        }
        for entry in std::fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            if let Some(slug) = name
                .to_str()
                .and_then(|n| n.strip_suffix(Phase::Basic.suffix()))
            {
                slugs.push(slug.to_string());
            }
        }
        slugs.sort();
        Ok(slugs)
    }
}
