//! Record validator / filter
//!
//! Element detection in the extractor is heuristic: it matches structural
//! containers, not records. This filter decides what counts as a record.
//!
//! 1. Structural pre-filter on raw fragments, before field extraction.
//! 2. Semantic post-filter: at least one essential field (primary id,
//!    display name, detail reference) must carry content.
//!
//! Rejections are counted and logged, never persisted.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::debug;

use super::extractor::RecordExtractor;
use crate::domain::{BasicRecord, RawFragment, RawRecord, Region, Subregion};
use crate::infrastructure::config::{ConfigError, FilterConfig, SchemaConfig};

/// Prefix of identifiers derived for records without a primary id.
pub const SYNTHETIC_ID_PREFIX: &str = "h:";

/// Where a validated record came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordContext {
    pub region_id: String,
    pub region_name: String,
    pub subregion_id: String,
    pub subregion_name: String,
}

impl RecordContext {
    pub fn new(region: &Region, subregion: &Subregion) -> Self {
        Self {
            region_id: region.id.clone(),
            region_name: region.name.clone(),
            subregion_id: subregion.id.clone(),
            subregion_name: subregion.name.clone(),
        }
    }
}

/// Records that survived the structural stage, with the count that did not.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Screened {
    pub records: Vec<RawRecord>,
    pub rejected: usize,
}

#[derive(Debug, Clone)]
pub struct RecordFilter {
    min_text_len: usize,
    min_markup_len: usize,
    id_field: String,
    name_field: String,
    detail_field: String,
    record_fields: Vec<String>,
    placeholders: Vec<String>,
    detail_pattern: Option<Regex>,
}

impl RecordFilter {
    pub fn new(filter: &FilterConfig, schema: &SchemaConfig) -> Result<Self, ConfigError> {
        let detail_pattern = schema
            .detail_reference_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| ConfigError::Validation {
                message: format!("schema.detail_reference_pattern: {e}"),
            })?;
        Ok(Self {
            min_text_len: filter.min_text_len,
            min_markup_len: filter.min_markup_len,
            id_field: schema.id_field.clone(),
            name_field: schema.name_field.clone(),
            detail_field: schema.detail_field.clone(),
            record_fields: schema.record_fields.clone(),
            placeholders: schema.placeholder_values.clone(),
            detail_pattern,
        })
    }

    /// Structural stage: enough visible text or enough markup.
    pub fn admits(&self, fragment: &RawFragment) -> bool {
        fragment.text_len() > self.min_text_len || fragment.markup_len() > self.min_markup_len
    }

    /// Drops undersized fragments, then extracts fields of the rest.
    pub fn screen(&self, fragments: &[RawFragment], extractor: &dyn RecordExtractor) -> Screened {
        let mut screened = Screened::default();
        for fragment in fragments {
            if self.admits(fragment) {
                screened.records.push(extractor.extract_fields(fragment));
            } else {
                screened.rejected += 1;
                debug!(
                    text_len = fragment.text_len(),
                    markup_len = fragment.markup_len(),
                    "Fragment rejected by structural filter"
                );
            }
        }
        screened
    }

    fn detail_reference(&self, raw: &RawRecord) -> Option<String> {
        raw.value(&self.detail_field, &self.placeholders)
            .filter(|r| self.detail_pattern.as_ref().is_none_or(|p| p.is_match(r)))
    }

    /// Whether at least one essential field carries content.
    pub fn has_essential_content(&self, raw: &RawRecord) -> bool {
        raw.value(&self.id_field, &self.placeholders).is_some()
            || raw.value(&self.name_field, &self.placeholders).is_some()
            || self.detail_reference(raw).is_some()
    }

    /// Semantic stage; stamps the record with the current time.
    pub fn validate(&self, raw: &RawRecord, context: &RecordContext) -> Option<BasicRecord> {
        self.validate_at(raw, context, Utc::now())
    }

    pub fn validate_at(
        &self,
        raw: &RawRecord,
        context: &RecordContext,
        extracted_at: DateTime<Utc>,
    ) -> Option<BasicRecord> {
        if !self.has_essential_content(raw) {
            debug!(
                region = %context.region_id,
                subregion = %context.subregion_id,
                fields = raw.len(),
                "Record rejected: every essential field is blank"
            );
            return None;
        }

        let detail_reference = self.detail_reference(raw);
        let fields: BTreeMap<String, String> = self
            .record_fields
            .iter()
            .filter_map(|field| {
                raw.value(field, &self.placeholders)
                    .map(|value| (field.clone(), value))
            })
            .collect();
        let primary_id = raw
            .value(&self.id_field, &self.placeholders)
            .unwrap_or_else(|| {
                synthetic_id(
                    context,
                    fields.get(&self.name_field).map_or("", String::as_str),
                    detail_reference.as_deref().unwrap_or(""),
                )
            });

        Some(BasicRecord {
            primary_id,
            region_id: context.region_id.clone(),
            region_name: context.region_name.clone(),
            subregion_id: context.subregion_id.clone(),
            subregion_name: context.subregion_name.clone(),
            extracted_at,
            fields,
            detail_reference,
        })
    }
}

/// Stable identifier for a record without one, so resume still skips it.
pub fn synthetic_id(context: &RecordContext, name: &str, detail_reference: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    for part in [
        context.region_id.as_str(),
        context.subregion_id.as_str(),
        name,
        detail_reference,
    ] {
        hasher.update(part.as_bytes());
        hasher.update(&[0x1f]);
    }
    let hex = hasher.finalize().to_hex();
    format!("{SYNTHETIC_ID_PREFIX}{}", &hex.as_str()[..16])
}
