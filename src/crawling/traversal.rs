//! Traversal controller
//!
//! Region → Subregion → Page, writing records as they are validated.
//! A Subregion that fails is recorded as partial and the walk moves on;
//! only storage failures and an unreachable source stop the run.

use std::collections::HashMap;
use std::sync::Arc;

use futures::{StreamExt, TryStreamExt, stream};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::errors::{CrawlError, NavError, PageError, WriteError};
use super::extractor::RecordExtractor;
use super::filter::{RecordContext, RecordFilter};
use super::navigator::PageNavigator;
use super::pagination::{PageEnd, PaginationController, PaginationTiming};
use super::retry::fetch_once;
use crate::domain::{
    Locator, PageCursor, Region, RegionSummary, RunSummary, Subregion, SubregionOutcome,
    SubregionReport,
};
use crate::infrastructure::config::{ConfigError, HarvestConfig};
use crate::storage::{CheckpointedWriter, OutputLayout, OutputSchema, WriterOptions};

pub struct TraversalController {
    pagination: PaginationController,
    filter: Arc<RecordFilter>,
    layout: OutputLayout,
    schema: OutputSchema,
    writer_options: WriterOptions,
    max_pages: u32,
    region_concurrency: usize,
    cancel: CancellationToken,
}

impl TraversalController {
    pub fn from_config(
        config: &HarvestConfig,
        navigator: Arc<dyn PageNavigator>,
        extractor: Arc<dyn RecordExtractor>,
        cancel: CancellationToken,
    ) -> Result<Self, ConfigError> {
        let filter = Arc::new(RecordFilter::new(&config.filter, &config.schema)?);
        let pagination = PaginationController::new(
            navigator,
            extractor,
            filter.clone(),
            PaginationTiming::from(&config.timing),
        );
        Ok(Self {
            pagination,
            filter,
            layout: OutputLayout::new(&config.output.dir),
            schema: OutputSchema::phase1(&config.schema, &config.output.missing_value),
            writer_options: WriterOptions {
                fsync: config.output.fsync,
            },
            max_pages: config.crawl.max_pages_per_subregion,
            region_concurrency: config.crawl.region_concurrency,
            cancel,
        })
    }

    pub const fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    /// Walks every region. Resume state comes from each region's existing
    /// output, rebuilt when its writer opens.
    pub async fn run(&self, regions: &[Region]) -> Result<RunSummary, CrawlError> {
        check_distinct_slugs(regions)?;
        let mut summary = RunSummary::start();
        info!(
            run_id = %summary.run_id,
            regions = regions.len(),
            concurrency = self.region_concurrency,
            "🚀 Phase 1 crawl started"
        );

        if self.region_concurrency <= 1 {
            for region in regions {
                if self.cancel.is_cancelled() {
                    summary.interrupted = true;
                    break;
                }
                summary.regions.push(self.run_region(region).await?);
            }
        } else {
            let mut results: Vec<(usize, RegionSummary)> = stream::iter(regions.iter().enumerate())
                .map(|(index, region)| async move {
                    self.run_region(region).await.map(|summary| (index, summary))
                })
                .buffer_unordered(self.region_concurrency)
                .try_collect()
                .await?;
            results.sort_by_key(|(index, _)| *index);
            summary.regions = results.into_iter().map(|(_, s)| s).collect();
        }

        summary.interrupted |= self.cancel.is_cancelled();
        summary.finish();
        summary
            .write_json(&self.layout.run_summary_path())
            .map_err(WriteError::from)?;

        for (region, partial) in summary.partial_subregions() {
            warn!(
                region = %region.region_name,
                subregion = %partial.subregion_name,
                page = partial.page,
                reason = %partial.reason,
                "Subregion partially processed"
            );
        }
        info!(
            records_written = summary.total_records_written(),
            interrupted = summary.interrupted,
            "✅ Phase 1 crawl finished"
        );
        Ok(summary)
    }

    pub async fn run_region(&self, region: &Region) -> Result<RegionSummary, CrawlError> {
        let path = self.layout.phase1_path(region);
        let mut writer = match CheckpointedWriter::open(&path, self.schema.clone(), self.writer_options) {
            Ok(writer) => writer,
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                error!(region = %region, error = %e, "Region output unusable, skipping region");
                return Ok(RegionSummary::failed(region, e.to_string()));
            }
        };
        info!(
            region = %region,
            subregions = region.subregions.len(),
            already_written = writer.len(),
            "Region started"
        );

        let mut summary = RegionSummary::new(region);
        for subregion in &region.subregions {
            if self.cancel.is_cancelled() {
                summary.interrupted = true;
                break;
            }
            let report = self.run_subregion(region, subregion, &mut writer).await?;
            match &report.outcome {
                SubregionOutcome::Completed => info!(
                    subregion = %subregion,
                    pages = report.pages_visited,
                    written = report.records_written,
                    skipped = report.records_skipped_existing,
                    "Subregion completed"
                ),
                SubregionOutcome::Partial { page, reason } => warn!(
                    subregion = %subregion,
                    page,
                    reason = %reason,
                    written = report.records_written,
                    "Subregion partial"
                ),
                SubregionOutcome::Interrupted => warn!(subregion = %subregion, "Subregion interrupted"),
            }
            let interrupted = report.outcome == SubregionOutcome::Interrupted;
            summary.absorb(report);
            if interrupted {
                break;
            }
        }

        writer.close()?;
        info!(
            region = %region,
            written = summary.records_written,
            completed = summary.subregions_completed,
            partial = summary.partial_subregions.len(),
            "Region finished"
        );
        Ok(summary)
    }

    async fn run_subregion(
        &self,
        region: &Region,
        subregion: &Subregion,
        writer: &mut CheckpointedWriter,
    ) -> Result<SubregionReport, CrawlError> {
        let context = RecordContext::new(region, subregion);
        let mut report = SubregionReport::new(subregion);
        let mut cursor = PageCursor::first();

        loop {
            if self.cancel.is_cancelled() {
                report.outcome = SubregionOutcome::Interrupted;
                break;
            }
            if cursor.index() >= self.max_pages {
                report.outcome = SubregionOutcome::Partial {
                    page: cursor.index(),
                    reason: format!("page limit of {} reached", self.max_pages),
                };
                break;
            }

            let page = match self.pagination.advance(subregion, cursor, &self.cancel).await {
                Ok(page) => page,
                Err(PageError::Cancelled) => {
                    report.outcome = SubregionOutcome::Interrupted;
                    break;
                }
                Err(PageError::SourceUnreachable(reason)) => {
                    return Err(CrawlError::SourceUnreachable(reason));
                }
                Err(e) => {
                    report.outcome = SubregionOutcome::Partial {
                        page: cursor.index(),
                        reason: e.to_string(),
                    };
                    break;
                }
            };
            report.pages_visited += 1;
            report.rejected_structural += page.rejected_structural;

            for raw in &page.raw_records {
                let Some(record) = self.filter.validate(raw, &context) else {
                    report.rejected_semantic += 1;
                    continue;
                };
                if writer.contains(&record.primary_id) {
                    report.records_skipped_existing += 1;
                    continue;
                }
                match writer.write(&record) {
                    Ok(()) => report.records_written += 1,
                    Err(WriteError::Duplicate(id)) => {
                        error!(subregion = %subregion, primary_id = %id, "Duplicate write rejected, aborting subregion");
                        report.outcome = SubregionOutcome::Partial {
                            page: cursor.index(),
                            reason: format!("duplicate identifier {id}"),
                        };
                        return Ok(report);
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            match page.end {
                None => cursor = cursor.next(),
                Some(PageEnd::Confirmed | PageEnd::EmptySubregion) => break,
                Some(PageEnd::Unconfirmed) => {
                    report.outcome = SubregionOutcome::Partial {
                        page: cursor.index(),
                        reason: "end of results unconfirmed: next control never appeared".into(),
                    };
                    break;
                }
            }
        }
        Ok(report)
    }
}

/// Reads the region listing once; an unreachable source is fatal.
pub async fn discover_regions(
    navigator: &dyn PageNavigator,
    config: &HarvestConfig,
    cancel: &CancellationToken,
) -> Result<Vec<Region>, CrawlError> {
    let timeout = config.timing.fetch_timeout();
    let policy = config.timing.navigation_policy();
    let mut attempt = 0;
    let regions = loop {
        attempt += 1;
        let result = tokio::select! {
            result = tokio::time::timeout(timeout, navigator.discover_regions(timeout)) => {
                result.unwrap_or_else(|_| Err(NavError::Timeout { locator: Locator::detail("region listing"), after: timeout }))
            }
            () = cancel.cancelled() => Err(NavError::Cancelled),
        };
        match result {
            Ok(regions) => break regions,
            Err(NavError::Unreachable(reason)) => return Err(CrawlError::SourceUnreachable(reason)),
            Err(e @ NavError::Cancelled) => return Err(CrawlError::Discovery(e)),
            Err(e) if !policy.allows(attempt) => return Err(CrawlError::Discovery(e)),
            Err(e) => {
                warn!(attempt, error = %e, "Region discovery failed, retrying");
                if !policy.pause(cancel).await {
                    return Err(CrawlError::Discovery(NavError::Cancelled));
                }
            }
        }
    };
    let regions: Vec<Region> = regions.into_iter().map(Region::linked).collect();
    let regions = select_regions(regions, &config.crawl.target_regions, &config.crawl.target_subregions);
    check_distinct_slugs(&regions)?;
    Ok(regions)
}

/// Narrows `regions` to `targets` (ids or names) and their subregions to
/// `subregion_targets`. Empty targets keep everything; a region left with
/// no selected subregion is dropped.
pub fn select_regions(regions: Vec<Region>, targets: &[String], subregion_targets: &[String]) -> Vec<Region> {
    for target in targets {
        if !regions.iter().any(|r| r.matches(target)) {
            warn!(target = %target, "Requested region not found in listing");
        }
    }
    let mut selected: Vec<Region> = regions
        .into_iter()
        .filter(|r| targets.is_empty() || targets.iter().any(|t| r.matches(t)))
        .collect();
    if subregion_targets.is_empty() {
        return selected;
    }

    for target in subregion_targets {
        if !selected.iter().flat_map(|r| &r.subregions).any(|s| s.matches(target)) {
            warn!(target = %target, "Requested subregion not found in selected regions");
        }
    }
    for region in &mut selected {
        region
            .subregions
            .retain(|s| subregion_targets.iter().any(|t| s.matches(t)));
    }
    selected.retain(|r| !r.subregions.is_empty());
    selected
}

/// Rejects region sets where two regions map to the same output files.
pub fn check_distinct_slugs(regions: &[Region]) -> Result<(), CrawlError> {
    let mut seen: HashMap<String, &Region> = HashMap::new();
    for region in regions {
        if let Some(first) = seen.insert(region.slug(), region) {
            return Err(CrawlError::SlugCollision {
                slug: region.slug(),
                first: first.to_string(),
                second: region.to_string(),
            });
        }
    }
    Ok(())
}

/// Fetches one list page so a dead source fails fast instead of producing a
/// run full of partial subregions.
pub async fn check_source_reachable(
    navigator: &dyn PageNavigator,
    regions: &[Region],
    config: &HarvestConfig,
    cancel: &CancellationToken,
) -> Result<(), CrawlError> {
    let Some(subregion) = regions.iter().flat_map(|r| r.subregions.iter()).next() else {
        return Ok(());
    };
    let locator = Locator::list_page(subregion, PageCursor::first());
    match fetch_once(navigator, &locator, config.timing.fetch_timeout(), cancel).await {
        Err(NavError::Unreachable(reason)) => Err(CrawlError::SourceUnreachable(reason)),
        _ => Ok(()),
    }
}
