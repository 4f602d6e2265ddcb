//! Phase-2 enrichment
//!
//! Detail pages are fetched for every Phase-1 record that carries a detail
//! reference; results land in a separate Phase-2 file with its own
//! checkpoint.

pub mod grouping;
pub mod pipeline;
pub mod status;

pub use grouping::GroupingScanner;
pub use pipeline::{Candidate, EnrichError, EnrichmentPipeline};
pub use status::{Assessment, StatusRules};
