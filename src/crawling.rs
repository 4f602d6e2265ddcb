//! # Crawling Module
//!
//! Phase 1 of the harvest: walking the Region/Subregion hierarchy and
//! persisting validated records as they are found.
//! - `navigator` / `extractor`: the contracts of the external collaborators
//! - `filter`: decides what counts as a record
//! - `pagination`: per-subregion page state machine
//! - `traversal`: region/subregion walk and run summary
//! - `counting`: count-only pass over the same pages

pub mod counting;
pub mod errors;
pub mod extractor;
pub mod filter;
pub mod navigator;
pub mod pagination;
pub mod retry;
pub mod traversal;

pub use counting::RecordCounter;
pub use errors::{CrawlError, ExtractError, NavError, PageError, WriteError};
pub use extractor::{DetailFields, ListPage, NextControl, RecordExtractor};
pub use filter::{RecordContext, RecordFilter};
pub use navigator::{PageContent, PageNavigator, RenderState};
pub use pagination::{PageEnd, PageResult, PaginationController, PaginationTiming};
pub use retry::RetryPolicy;
pub use traversal::{
    TraversalController, check_distinct_slugs, discover_regions, check_source_reachable, select_regions,
};
