//! Region Harvester - crash-safe hierarchical directory crawler
//!
//! Walks a Region → Subregion → Result-Page → Record directory, persists
//! validated records incrementally (Phase 1) and later enriches them from
//! per-record detail pages (Phase 2). Both phases resume from their own
//! durable output after any interruption.

// Module declarations
pub mod domain;
pub mod crawling;
pub mod storage;
pub mod enrichment;
pub mod infrastructure;
pub mod orchestrator;
pub mod test_utils;

// Re-export the pieces the binary and integration tests reach for
pub use crawling::{PaginationController, RecordFilter, TraversalController};
pub use domain::{BasicRecord, DetailRecord, ExtractionStatus, Region, Subregion};
pub use enrichment::EnrichmentPipeline;
pub use infrastructure::config::HarvestConfig;
pub use orchestrator::HarvestOrchestrator;
pub use storage::{CheckpointSet, CheckpointedWriter, OutputLayout, OutputSchema};
