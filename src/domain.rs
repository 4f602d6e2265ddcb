//! Domain module - entities and value objects of the harvest
//!
//! - `region`: the read-only Region/Subregion hierarchy and page locators
//! - `record`: raw fragments, validated records and enrichment results
//! - `summary`: per-run and per-region reporting

pub mod record;
pub mod region;
pub mod summary;

pub use record::{
    BasicRecord, DetailRecord, ExtractionStatus, RawFragment, RawRecord, collapse_whitespace,
    is_blank,
};
pub use region::{Locator, PageCursor, Region, Subregion};
pub use summary::{
    EnrichmentSummary, PartialSubregion, RegionOutcome, RegionSummary, RunSummary,
    SubregionCount, SubregionOutcome, SubregionReport,
};
