//! Run reporting
//!
//! The summaries are what an operator reads after a run: every partial
//! Subregion is listed with the page it stopped at, so a selective re-run
//! is possible.

use std::fs;
use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::region::{Region, Subregion};

/// How a single Subregion ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SubregionOutcome {
    /// Last page reached with a structurally disabled next control.
    Completed,
    /// Stopped early; `page` is the cursor that could not be processed.
    Partial { page: u32, reason: String },
    /// Operator abort.
    Interrupted,
}

/// Counters for one Subregion, folded into its `RegionSummary`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubregionReport {
    pub subregion: Subregion,
    pub pages_visited: u32,
    pub records_written: usize,
    pub records_skipped_existing: usize,
    pub rejected_structural: usize,
    pub rejected_semantic: usize,
    pub outcome: SubregionOutcome,
}

impl SubregionReport {
    pub fn new(subregion: &Subregion) -> Self {
        Self {
            subregion: subregion.clone(),
            pages_visited: 0,
            records_written: 0,
            records_skipped_existing: 0,
            rejected_structural: 0,
            rejected_semantic: 0,
            outcome: SubregionOutcome::Completed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialSubregion {
    pub subregion_id: String,
    pub subregion_name: String,
    pub page: u32,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RegionOutcome {
    Completed,
    Partial,
    Failed { reason: String },
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionSummary {
    pub region_id: String,
    pub region_name: String,
    pub subregions_attempted: usize,
    pub subregions_completed: usize,
    pub partial_subregions: Vec<PartialSubregion>,
    pub pages_visited: u64,
    pub records_written: usize,
    pub records_skipped_existing: usize,
    pub rejected_structural: usize,
    pub rejected_semantic: usize,
    pub failure: Option<String>,
    pub interrupted: bool,
}

impl RegionSummary {
    pub fn new(region: &Region) -> Self {
        Self {
            region_id: region.id.clone(),
            region_name: region.name.clone(),
            subregions_attempted: 0,
            subregions_completed: 0,
            partial_subregions: Vec::new(),
            pages_visited: 0,
            records_written: 0,
            records_skipped_existing: 0,
            rejected_structural: 0,
            rejected_semantic: 0,
            failure: None,
            interrupted: false,
        }
    }

    pub fn failed(region: &Region, reason: impl Into<String>) -> Self {
        let mut summary = Self::new(region);
        summary.failure = Some(reason.into());
        summary
    }

    pub fn absorb(&mut self, report: SubregionReport) {
        self.subregions_attempted += 1;
        self.pages_visited += u64::from(report.pages_visited);
        self.records_written += report.records_written;
        self.records_skipped_existing += report.records_skipped_existing;
        self.rejected_structural += report.rejected_structural;
        self.rejected_semantic += report.rejected_semantic;
        match report.outcome {
            SubregionOutcome::Completed => self.subregions_completed += 1,
            SubregionOutcome::Partial { page, reason } => {
                self.partial_subregions.push(PartialSubregion {
                    subregion_id: report.subregion.id,
                    subregion_name: report.subregion.name,
                    page,
                    reason,
                });
            }
            SubregionOutcome::Interrupted => self.interrupted = true,
        }
    }

    pub fn outcome(&self) -> RegionOutcome {
        if let Some(reason) = &self.failure {
            RegionOutcome::Failed {
                reason: reason.clone(),
            }
        } else if self.interrupted {
            RegionOutcome::Interrupted
        } else if self.partial_subregions.is_empty() {
            RegionOutcome::Completed
        } else {
            RegionOutcome::Partial
        }
    }
}

/// Phase-1 run report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub interrupted: bool,
    pub regions: Vec<RegionSummary>,
}

impl RunSummary {
    pub fn start() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            interrupted: false,
            regions: Vec::new(),
        }
    }

    pub fn finish(&mut self) {
        self.interrupted |= self.regions.iter().any(|r| r.interrupted);
        self.finished_at = Some(Utc::now());
    }

    pub fn total_records_written(&self) -> usize {
        self.regions.iter().map(|r| r.records_written).sum()
    }

    pub fn region(&self, region_id: &str) -> Option<&RegionSummary> {
        self.regions.iter().find(|r| r.region_id == region_id)
    }

    pub fn partial_subregions(&self) -> impl Iterator<Item = (&RegionSummary, &PartialSubregion)> {
        self.regions
            .iter()
            .flat_map(|r| r.partial_subregions.iter().map(move |p| (r, p)))
    }

    pub fn write_json(&self, path: &Path) -> io::Result<()> {
        write_json_atomically(self, path)
    }
}

/// Result of counting one Subregion without persisting its records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubregionCount {
    pub region: String,
    pub region_id: String,
    pub subregion: String,
    pub subregion_id: String,
    /// Distinct records that passed validation
    pub records: usize,
    pub pages_visited: u32,
    pub complete: bool,
    /// Why counting stopped early; empty when complete
    pub note: String,
}

impl SubregionCount {
    pub fn new(region: &Region, subregion: &Subregion) -> Self {
        Self {
            region: region.name.clone(),
            region_id: region.id.clone(),
            subregion: subregion.name.clone(),
            subregion_id: subregion.id.clone(),
            records: 0,
            pages_visited: 0,
            complete: true,
            note: String::new(),
        }
    }

    pub fn stopped(&mut self, note: impl Into<String>) {
        self.complete = false;
        self.note = note.into();
    }
}

/// Phase-2 report for one Region.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentSummary {
    pub region_slug: String,
    pub records_seen: usize,
    pub skipped_no_detail: usize,
    pub skipped_existing: usize,
    pub enriched: usize,
    pub success: usize,
    pub partial: usize,
    pub failed: usize,
    pub fetch_failures: usize,
    pub limit_reached: bool,
    pub interrupted: bool,
    pub elapsed_ms: u64,
}

impl EnrichmentSummary {
    pub fn new(region_slug: impl Into<String>) -> Self {
        Self {
            region_slug: region_slug.into(),
            ..Self::default()
        }
    }

    pub fn write_json(summaries: &[Self], path: &Path) -> io::Result<()> {
        write_json_atomically(&summaries, path)
    }
}

fn write_json_atomically<T: Serialize + ?Sized>(value: &T, path: &Path) -> io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    let body = serde_json::to_vec_pretty(value).map_err(io::Error::other)?;
    fs::write(&tmp, body)?;
    fs::rename(&tmp, path)
}
