//! Record types flowing through both phases
//!
//! `RawFragment` → (structural filter) → `RawRecord` → (semantic filter) →
//! `BasicRecord` → (enrichment) → `DetailRecord`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A candidate record container as matched on a list page, before any
/// field extraction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawFragment {
    pub text: String,
    pub markup: String,
}

impl RawFragment {
    pub fn new(text: impl Into<String>, markup: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            markup: markup.into(),
        }
    }

    /// Visible text length, ignoring surrounding whitespace.
    pub fn text_len(&self) -> usize {
        self.text.trim().chars().count()
    }

    pub fn markup_len(&self) -> usize {
        self.markup.len()
    }
}

/// Field-name → value mapping produced by the extractor. No identity yet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRecord {
    fields: BTreeMap<String, String>,
}

impl RawRecord {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(field, value);
        self
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(field.into(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    /// Value of `field` when it carries real content.
    pub fn value(&self, field: &str, placeholders: &[String]) -> Option<String> {
        self.get(field)
            .filter(|v| !is_blank(v, placeholders))
            .map(collapse_whitespace)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for RawRecord {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            fields: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Empty, whitespace-only or one of the configured placeholders ("N/A", ...).
pub fn is_blank(value: &str, placeholders: &[String]) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty() || placeholders.iter().any(|p| p.eq_ignore_ascii_case(trimmed))
}

/// Collapses every run of whitespace (newlines included) to one space.
pub fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Phase-1 output unit. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicRecord {
    pub primary_id: String,
    pub region_id: String,
    pub region_name: String,
    pub subregion_id: String,
    pub subregion_name: String,
    pub extracted_at: DateTime<Utc>,
    /// Schema fields with content; blanks are simply absent.
    pub fields: BTreeMap<String, String>,
    pub detail_reference: Option<String>,
}

impl BasicRecord {
    pub const fn has_detail_reference(&self) -> bool {
        self.detail_reference.is_some()
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Outcome quality of one enrichment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExtractionStatus {
    Success,
    Partial,
    Failed,
}

impl ExtractionStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Partial => "PARTIAL",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for ExtractionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExtractionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SUCCESS" => Ok(Self::Success),
            "PARTIAL" => Ok(Self::Partial),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unknown extraction status: {other}")),
        }
    }
}

/// Phase-2 output unit: the basic record plus whatever the detail page gave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailRecord {
    pub basic: BasicRecord,
    pub detail_fields: BTreeMap<String, String>,
    pub detail_extracted_at: DateTime<Utc>,
    pub status: ExtractionStatus,
    pub fields_extracted_count: usize,
    pub critical_fields_count: usize,
    /// Why the detail fetch failed, when it did. Logged, not persisted.
    #[serde(skip)]
    pub fetch_failure: Option<String>,
}

impl DetailRecord {
    pub fn primary_id(&self) -> &str {
        &self.basic.primary_id
    }

    /// Phase-1 fields win over detail fields of the same name.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.basic
            .field(name)
            .or_else(|| self.detail_fields.get(name).map(String::as_str))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn placeholders() -> Vec<String> {
        vec!["N/A".to_string(), "-".to_string()]
    }

    #[test]
    fn test_blank_detection() {
        let p = placeholders();
        assert!(is_blank("", &p));
        assert!(is_blank("   \n", &p));
        assert!(is_blank("n/a", &p));
        assert!(is_blank(" - ", &p));
        assert!(!is_blank("0", &p));
        assert!(!is_blank("N/A school", &p));
    }

    #[test]
    fn test_collapse_whitespace_removes_newlines() {
        assert_eq!(collapse_whitespace("  a\n b\t\tc  "), "a b c");
    }

    #[test]
    fn test_raw_record_value_skips_placeholders() {
        let raw = RawRecord::new().with("code", "N/A").with("name", " Alpha\nSchool ");
        let p = placeholders();
        assert_eq!(raw.value("code", &p), None);
        assert_eq!(raw.value("name", &p).as_deref(), Some("Alpha School"));
        assert_eq!(raw.value("missing", &p), None);
    }

    #[test]
    fn test_fragment_lengths() {
        let fragment = RawFragment::new("  hello  ", "<li>hello</li>");
        assert_eq!(fragment.text_len(), 5);
        assert_eq!(fragment.markup_len(), 14);
    }

    #[test]
    fn test_status_parse_and_display() {
        assert_eq!("partial".parse::<ExtractionStatus>(), Ok(ExtractionStatus::Partial));
        assert_eq!(ExtractionStatus::Failed.to_string(), "FAILED");
        assert!("done".parse::<ExtractionStatus>().is_err());
    }
}
