//! Count-only pass
//!
//! Pages every Subregion the same way a crawl does and counts the records
//! that pass validation, without writing any Phase-1 rows. Counts land in
//! one `{SLUG}_counts.csv` per Region, rewritten on every pass.

use std::collections::HashSet;
use std::fs;
use std::sync::Arc;

use csv::Terminator;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::errors::{CrawlError, PageError, WriteError};
use super::extractor::RecordExtractor;
use super::filter::{RecordContext, RecordFilter};
use super::navigator::PageNavigator;
use super::pagination::{PageEnd, PaginationController, PaginationTiming};
use super::traversal::check_distinct_slugs;
use crate::domain::{PageCursor, Region, Subregion, SubregionCount};
use crate::infrastructure::config::{ConfigError, HarvestConfig};
use crate::storage::OutputLayout;

pub struct RecordCounter {
    pagination: PaginationController,
    filter: Arc<RecordFilter>,
    layout: OutputLayout,
    max_pages: u32,
    cancel: CancellationToken,
}

impl RecordCounter {
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
            max_pages: config.crawl.max_pages_per_subregion,
            cancel,
        })
    }

    /// Counts every region in order; stops early on cancellation.
    pub async fn run(&self, regions: &[Region]) -> Result<Vec<SubregionCount>, CrawlError> {
        check_distinct_slugs(regions)?;
        info!(regions = regions.len(), "🔢 Count pass started");
        let mut counts = Vec::new();
        for region in regions {
            if self.cancel.is_cancelled() {
                break;
            }
            counts.extend(self.count_region(region).await?);
        }
        info!(
            subregions = counts.len(),
            records = counts.iter().map(|c| c.records).sum::<usize>(),
            incomplete = counts.iter().filter(|c| !c.complete).count(),
            "✅ Count pass finished"
        );
        Ok(counts)
    }

    /// Counts one region's subregions and writes its counts file.
    pub async fn count_region(&self, region: &Region) -> Result<Vec<SubregionCount>, CrawlError> {
        let mut counts = Vec::with_capacity(region.subregions.len());
        for subregion in &region.subregions {
            if self.cancel.is_cancelled() {
                break;
            }
            let count = self.count_subregion(region, subregion).await?;
            if count.complete {
                info!(subregion = %subregion, records = count.records, pages = count.pages_visited, "Subregion counted");
            } else {
                warn!(subregion = %subregion, records = count.records, note = %count.note, "Subregion count incomplete");
            }
            counts.push(count);
        }
        self.write_counts(region, &counts)?;
        Ok(counts)
    }

    pub async fn count_subregion(&self, region: &Region, subregion: &Subregion) -> Result<SubregionCount, CrawlError> {
        let context = RecordContext::new(region, subregion);
        let mut count = SubregionCount::new(region, subregion);
        let mut seen = HashSet::new();
        let mut cursor = PageCursor::first();

        loop {
            if cursor.index() >= self.max_pages {
                count.stopped(format!("page limit of {} reached", self.max_pages));
                break;
            }
            let page = match self.pagination.advance(subregion, cursor, &self.cancel).await {
                Ok(page) => page,
                Err(PageError::SourceUnreachable(reason)) => return Err(CrawlError::SourceUnreachable(reason)),
                Err(PageError::Cancelled) => {
                    count.stopped("interrupted");
                    break;
                }
                Err(e) => {
                    count.stopped(e.to_string());
                    break;
                }
            };
            count.pages_visited += 1;
            count.records += page
                .raw_records
                .iter()
                .filter_map(|raw| self.filter.validate(raw, &context))
                .filter(|record| seen.insert(record.primary_id.clone()))
                .count();

            match page.end {
                None => cursor = cursor.next(),
                Some(PageEnd::Confirmed | PageEnd::EmptySubregion) => break,
                Some(PageEnd::Unconfirmed) => {
                    count.stopped("end of results unconfirmed");
                    break;
                }
            }
        }
        Ok(count)
    }

    fn write_counts(&self, region: &Region, counts: &[SubregionCount]) -> Result<(), WriteError> {
        fs::create_dir_all(self.layout.dir())?;
        let path = self.layout.counts_path(region);
        let mut writer = csv::WriterBuilder::new()
            .terminator(Terminator::Any(b'\n'))
            .from_path(&path)?;
        for count in counts {
            writer.serialize(count)?;
        }
        writer.flush()?;
        info!(path = %path.display(), subregions = counts.len(), "Counts written");
        Ok(())
    }
}
