//! Pagination controller
//!
//! Drives one Subregion's result pages. The "next" control is the only
//! end-of-data signal that is trusted, and only when it is present and
//! structurally disabled. A missing control, a page still rendering or a
//! first page with no records are transient until retries say otherwise.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::errors::{NavError, PageError};
use super::extractor::{NextControl, RecordExtractor};
use super::filter::RecordFilter;
use super::navigator::PageNavigator;
use super::retry::{RetryPolicy, fetch_with_retry, pause};
use crate::domain::{Locator, PageCursor, RawRecord, Subregion};
use crate::infrastructure::config::TimingConfig;

/// Why a page ended its Subregion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageEnd {
    /// Next control present and disabled.
    Confirmed,
    /// First page still empty after the recovery request.
    EmptySubregion,
    /// Next control never showed up; the end could not be confirmed.
    Unconfirmed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageResult {
    pub cursor: PageCursor,
    pub raw_records: Vec<RawRecord>,
    pub has_next_page: bool,
    pub end: Option<PageEnd>,
    /// Fragments dropped by the structural filter on this page
    pub rejected_structural: usize,
}

impl PageResult {
    fn more(cursor: PageCursor, raw_records: Vec<RawRecord>, rejected: usize) -> Self {
        Self {
            cursor,
            raw_records,
            has_next_page: true,
            end: None,
            rejected_structural: rejected,
        }
    }

    fn last(cursor: PageCursor, raw_records: Vec<RawRecord>, rejected: usize, end: PageEnd) -> Self {
        Self {
            cursor,
            raw_records,
            has_next_page: false,
            end: Some(end),
            rejected_structural: rejected,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PaginationTiming {
    pub fetch_timeout: Duration,
    pub navigation: RetryPolicy,
    /// Applies to pages still loading and to unsettled pages
    pub loading: RetryPolicy,
    pub first_page_recovery: Duration,
}

impl From<&TimingConfig> for PaginationTiming {
    fn from(timing: &TimingConfig) -> Self {
        Self {
            fetch_timeout: timing.fetch_timeout(),
            navigation: timing.navigation_policy(),
            loading: timing.loading_policy(),
            first_page_recovery: timing.first_page_recovery(),
        }
    }
}

#[derive(Clone)]
pub struct PaginationController {
    navigator: Arc<dyn PageNavigator>,
    extractor: Arc<dyn RecordExtractor>,
    filter: Arc<RecordFilter>,
    timing: PaginationTiming,
}

impl PaginationController {
    pub fn new(
        navigator: Arc<dyn PageNavigator>,
        extractor: Arc<dyn RecordExtractor>,
        filter: Arc<RecordFilter>,
        timing: PaginationTiming,
    ) -> Self {
        Self {
            navigator,
            extractor,
            filter,
            timing,
        }
    }

    /// Reads the page at `cursor` until it settles.
    pub async fn advance(
        &self,
        subregion: &Subregion,
        cursor: PageCursor,
        cancel: &CancellationToken,
    ) -> Result<PageResult, PageError> {
        let locator = Locator::list_page(subregion, cursor);
        let page = cursor.index();
        let mut loading_attempts = 0;
        let mut unsettled_attempts = 0;
        let mut malformed_attempts = 0;
        let mut recovery_used = false;

        loop {
            let content = match fetch_with_retry(
                self.navigator.as_ref(),
                &locator,
                self.timing.fetch_timeout,
                self.timing.navigation,
                cancel,
            )
            .await
            {
                Ok(content) => content,
                Err(NavError::Cancelled) => return Err(PageError::Cancelled),
                Err(NavError::Unreachable(reason)) => return Err(PageError::SourceUnreachable(reason)),
                Err(e) => {
                    return Err(PageError::Unrecoverable {
                        page,
                        reason: e.to_string(),
                    });
                }
            };

            if content.is_loading() {
                loading_attempts += 1;
                if !self.timing.loading.allows(loading_attempts) {
                    return Err(PageError::Stalled {
                        page,
                        attempts: loading_attempts,
                    });
                }
                debug!(%locator, attempt = loading_attempts, "Page still loading, waiting");
                self.wait(self.timing.loading.backoff, cancel).await?;
                continue;
            }

            let list = match self.extractor.extract_list(&content) {
                Ok(list) => list,
                Err(e) => {
                    malformed_attempts += 1;
                    if !self.timing.loading.allows(malformed_attempts) {
                        return Err(PageError::Unrecoverable {
                            page,
                            reason: e.to_string(),
                        });
                    }
                    debug!(%locator, error = %e, "Extraction failed, re-requesting page");
                    self.wait(self.timing.loading.backoff, cancel).await?;
                    continue;
                }
            };

            let screened = self.filter.screen(&list.fragments, self.extractor.as_ref());
            let empty = screened.records.is_empty();

            if empty && cursor.is_first() {
                if !recovery_used {
                    recovery_used = true;
                    info!(%locator, "First page returned no records, waiting once more before accepting it");
                    self.wait(self.timing.first_page_recovery, cancel).await?;
                    continue;
                }
                return Ok(match list.next {
                    NextControl::Enabled => PageResult::more(cursor, screened.records, screened.rejected),
                    NextControl::Disabled | NextControl::Absent => PageResult::last(
                        cursor,
                        screened.records,
                        screened.rejected,
                        PageEnd::EmptySubregion,
                    ),
                });
            }

            match list.next {
                NextControl::Disabled => {
                    debug!(%locator, records = screened.records.len(), "Terminal page reached");
                    return Ok(PageResult::last(
                        cursor,
                        screened.records,
                        screened.rejected,
                        PageEnd::Confirmed,
                    ));
                }
                NextControl::Enabled if !empty => {
                    debug!(%locator, records = screened.records.len(), "Page read");
                    return Ok(PageResult::more(cursor, screened.records, screened.rejected));
                }
                next => {
                    unsettled_attempts += 1;
                    if self.timing.loading.allows(unsettled_attempts) {
                        debug!(%locator, ?next, empty, attempt = unsettled_attempts, "Page not settled, re-requesting");
                        self.wait(self.timing.loading.backoff, cancel).await?;
                        continue;
                    }
                    if next == NextControl::Enabled {
                        return Ok(PageResult::more(cursor, screened.records, screened.rejected));
                    }
                    warn!(%locator, records = screened.records.len(), "Next control never appeared; end of results unconfirmed");
                    return Ok(PageResult::last(
                        cursor,
                        screened.records,
                        screened.rejected,
                        PageEnd::Unconfirmed,
                    ));
                }
            }
        }
    }

    async fn wait(&self, duration: Duration, cancel: &CancellationToken) -> Result<(), PageError> {
        if pause(duration, cancel).await {
            Ok(())
        } else {
            Err(PageError::Cancelled)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Region;
    use crate::infrastructure::config::{FilterConfig, SchemaConfig};
    use crate::test_utils::{FixtureExtractor, ScriptedNavigator, Step, list_body, numbered_records};

    fn subregion() -> Subregion {
        Region::new("n", "North")
            .with_subregion("n1", "North One")
            .subregions
            .remove(0)
    }

    fn controller(navigator: ScriptedNavigator) -> (PaginationController, Arc<ScriptedNavigator>) {
        let navigator = Arc::new(navigator);
        let filter =
            RecordFilter::new(&FilterConfig::default(), &SchemaConfig::default()).unwrap();
        let controller = PaginationController::new(
            navigator.clone(),
            Arc::new(FixtureExtractor),
            Arc::new(filter),
            PaginationTiming::from(&TimingConfig::immediate()),
        );
        (controller, navigator)
    }

    async fn advance(controller: &PaginationController, page: u32) -> Result<PageResult, PageError> {
        let mut cursor = PageCursor::first();
        for _ in 0..page {
            cursor = cursor.next();
        }
        controller
            .advance(&subregion(), cursor, &CancellationToken::new())
            .await
    }

    #[tokio::test]
    async fn test_enabled_next_continues() {
        let body = list_body(&numbered_records("N", 1, 5), NextControl::Enabled);
        let (controller, _) = controller(ScriptedNavigator::new().page("n", "n1", 0, vec![Step::body(body)]));
        let result = advance(&controller, 0).await.unwrap();
        assert!(result.has_next_page);
        assert_eq!(result.raw_records.len(), 5);
    }

    #[tokio::test]
    async fn test_disabled_next_is_terminal() {
        let body = list_body(&numbered_records("N", 1, 3), NextControl::Disabled);
        let (controller, _) = controller(ScriptedNavigator::new().page("n", "n1", 2, vec![Step::body(body)]));
        let result = advance(&controller, 2).await.unwrap();
        assert!(!result.has_next_page);
        assert_eq!(result.end, Some(PageEnd::Confirmed));
        assert_eq!(result.raw_records.len(), 3);
    }

    #[tokio::test]
    async fn test_absent_next_is_retried_before_trusting() {
        let records = numbered_records("N", 1, 4);
        let (controller, navigator) = controller(ScriptedNavigator::new().page(
            "n",
            "n1",
            1,
            vec![
                Step::body(list_body(&records, NextControl::Absent)),
                Step::body(list_body(&records, NextControl::Disabled)),
            ],
        ));
        let result = advance(&controller, 1).await.unwrap();
        assert_eq!(result.end, Some(PageEnd::Confirmed));
        assert_eq!(navigator.total_calls(), 2);
    }

    #[tokio::test]
    async fn test_persistently_absent_next_is_unconfirmed() {
        let body = list_body(&numbered_records("N", 1, 4), NextControl::Absent);
        let (controller, navigator) = controller(ScriptedNavigator::new().page("n", "n1", 1, vec![Step::body(body)]));
        let result = advance(&controller, 1).await.unwrap();
        assert!(!result.has_next_page);
        assert_eq!(result.end, Some(PageEnd::Unconfirmed));
        assert_eq!(result.raw_records.len(), 4);
        assert_eq!(navigator.total_calls(), 3);
    }

    #[tokio::test]
    async fn test_first_page_gets_one_recovery_request() {
        let (controller, navigator) = controller(ScriptedNavigator::new().page(
            "n",
            "n1",
            0,
            vec![
                Step::body(list_body(&[], NextControl::Disabled)),
                Step::body(list_body(&numbered_records("S", 1, 55), NextControl::Disabled)),
            ],
        ));
        let result = advance(&controller, 0).await.unwrap();
        assert_eq!(result.raw_records.len(), 55);
        assert_eq!(result.end, Some(PageEnd::Confirmed));
        assert_eq!(navigator.total_calls(), 2);
    }

    #[tokio::test]
    async fn test_empty_first_page_accepted_after_recovery() {
        let (controller, navigator) = controller(
            ScriptedNavigator::new().page("n", "n1", 0, vec![Step::body(list_body(&[], NextControl::Absent))]),
        );
        let result = advance(&controller, 0).await.unwrap();
        assert!(result.raw_records.is_empty());
        assert_eq!(result.end, Some(PageEnd::EmptySubregion));
        assert_eq!(navigator.total_calls(), 2);
    }

    #[tokio::test]
    async fn test_loading_page_stalls_after_retries() {
        let (controller, _) = controller(ScriptedNavigator::new().page("n", "n1", 0, vec![Step::loading()]));
        let err = advance(&controller, 0).await.unwrap_err();
        assert_eq!(err, PageError::Stalled { page: 0, attempts: 3 });
    }

    #[tokio::test]
    async fn test_loading_then_rendered_succeeds() {
        let body = list_body(&numbered_records("N", 1, 2), NextControl::Enabled);
        let (controller, _) = controller(
            ScriptedNavigator::new().page("n", "n1", 0, vec![Step::loading(), Step::body(body)]),
        );
        let result = advance(&controller, 0).await.unwrap();
        assert_eq!(result.raw_records.len(), 2);
    }

    #[tokio::test]
    async fn test_navigation_failure_is_unrecoverable() {
        let locator = crate::test_utils::list_locator("n", "n1", 3);
        let (controller, _) = controller(
            ScriptedNavigator::new().page("n", "n1", 3, vec![Step::error(NavError::NotFound(locator))]),
        );
        let err = advance(&controller, 3).await.unwrap_err();
        assert!(matches!(err, PageError::Unrecoverable { page: 3, .. }));
    }

    #[tokio::test]
    async fn test_unreachable_source_is_reported() {
        let (controller, _) = controller(
            ScriptedNavigator::new()
                .page("n", "n1", 0, vec![Step::error(NavError::Unreachable("no route".into()))]),
        );
        let err = advance(&controller, 0).await.unwrap_err();
        assert!(matches!(err, PageError::SourceUnreachable(_)));
    }

    #[tokio::test]
    async fn test_structural_rejections_reported() {
        let mut records = numbered_records("N", 1, 2);
        records.push(String::new());
        let body = list_body(&records, NextControl::Enabled);
        let (controller, _) = controller(ScriptedNavigator::new().page("n", "n1", 0, vec![Step::body(body)]));
        let result = advance(&controller, 0).await.unwrap();
        assert_eq!(result.raw_records.len(), 2);
        assert_eq!(result.rejected_structural, 1);
    }
}
