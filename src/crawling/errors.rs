//! Error taxonomy of the crawl
//!
//! Navigation errors are retried and escalate into page errors; page errors
//! end a Subregion, never the run. Only storage failures and a completely
//! unreachable source are fatal.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::domain::Locator;

/// Failure of one navigator call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NavError {
    #[error("Timeout after {after:?} loading {locator}")]
    Timeout { locator: Locator, after: Duration },

    #[error("Not found: {0}")]
    NotFound(Locator),

    #[error("Blocked loading {locator}: {reason}")]
    Blocked { locator: Locator, reason: String },

    #[error("Transport error loading {locator}: {reason}")]
    Transport { locator: Locator, reason: String },

    /// No data source reachable at all. Fatal to the run.
    #[error("Data source unreachable: {0}")]
    Unreachable(String),

    #[error("Navigation cancelled")]
    Cancelled,
}

impl NavError {
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }
}

/// Failure of the extractor on page content.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractError {
    #[error("Malformed page content: {0}")]
    Malformed(String),

    #[error("Invalid selector '{selector}': {reason}")]
    Selector { selector: String, reason: String },
}

/// Page-level failure reported by the pagination controller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PageError {
    #[error("Page {page} still loading after {attempts} attempts")]
    Stalled { page: u32, attempts: u32 },

    #[error("Page {page} unrecoverable: {reason}")]
    Unrecoverable { page: u32, reason: String },

    #[error("Data source unreachable: {0}")]
    SourceUnreachable(String),

    #[error("Pagination cancelled")]
    Cancelled,
}

/// Persistence failure.
#[derive(Error, Debug)]
pub enum WriteError {
    #[error("Duplicate primary identifier: {0}")]
    Duplicate(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Header of {path} does not match the output schema (expected {expected:?}, found {found:?})")]
    SchemaMismatch {
        path: PathBuf,
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("Corrupt row {line} in {path}: {reason}")]
    Corrupt {
        path: PathBuf,
        line: u64,
        reason: String,
    },
}

impl WriteError {
    /// Storage unavailable or unwritable: durability can no longer be guaranteed.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Csv(_))
    }
}

/// Errors that end a whole run.
#[derive(Error, Debug)]
pub enum CrawlError {
    #[error("Storage error: {0}")]
    Storage(#[from] WriteError),

    #[error("Data source unreachable: {0}")]
    SourceUnreachable(String),

    #[error("Region discovery failed: {0}")]
    Discovery(NavError),

    /// Two regions would write to the same output files.
    #[error("Regions {first} and {second} share the output name {slug}")]
    SlugCollision {
        slug: String,
        first: String,
        second: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_unreachable_navigation_is_fatal() {
        assert!(NavError::Unreachable("dns".into()).is_fatal());
        assert!(!NavError::NotFound(Locator::detail("x")).is_fatal());
        assert!(
            !NavError::Timeout {
                locator: Locator::detail("x"),
                after: Duration::from_secs(1)
            }
            .is_fatal()
        );
    }

    #[test]
    fn test_duplicate_write_is_not_fatal() {
        assert!(!WriteError::Duplicate("A1".into()).is_fatal());
        let io = WriteError::from(std::io::Error::other("disk full"));
        assert!(io.is_fatal());
    }

    #[test]
    fn test_error_messages() {
        let err = PageError::Stalled {
            page: 2,
            attempts: 3,
        };
        assert_eq!(err.to_string(), "Page 2 still loading after 3 attempts");
    }
}
