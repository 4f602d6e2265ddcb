//! # Harvest Orchestrator
//!
//! Runs the full cycle one Region at a time: Phase 1 for the Region, then
//! Phase 2 over the file it just wrote, then the next Region. Both run
//! summaries are written when the cycle ends, also when it ends in error.

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::crawling::{
    CrawlError, PageNavigator, RecordExtractor, TraversalController, WriteError, check_distinct_slugs,
};
use crate::domain::{EnrichmentSummary, Region, RunSummary};
use crate::enrichment::{EnrichError, EnrichmentPipeline};
use crate::infrastructure::config::{ConfigError, HarvestConfig};

#[derive(Error, Debug)]
pub enum HarvestError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Phase 1 failed: {0}")]
    Crawl(#[from] CrawlError),

    #[error("Phase 2 failed: {0}")]
    Enrich(#[from] EnrichError),

    #[error("Failed to write run summaries: {0}")]
    Summary(#[from] WriteError),
}

/// Everything one cycle produced.
#[derive(Debug)]
pub struct CycleReport {
    pub run: RunSummary,
    pub enrichment: Vec<EnrichmentSummary>,
}

pub struct HarvestOrchestrator {
    traversal: TraversalController,
    pipeline: EnrichmentPipeline,
    cancel: CancellationToken,
}

impl HarvestOrchestrator {
    pub fn from_config(
        config: &HarvestConfig,
        navigator: Arc<dyn PageNavigator>,
        extractor: Arc<dyn RecordExtractor>,
        cancel: CancellationToken,
    ) -> Result<Self, HarvestError> {
        let traversal =
            TraversalController::from_config(config, navigator.clone(), extractor.clone(), cancel.clone())?;
        let pipeline = EnrichmentPipeline::from_config(config, navigator, extractor, cancel.clone())?;
        Ok(Self {
            traversal,
            pipeline,
            cancel,
        })
    }

    /// Regions run strictly in order; region concurrency does not apply here.
    pub async fn run_cycle(&self, regions: &[Region]) -> Result<CycleReport, HarvestError> {
        check_distinct_slugs(regions)?;
        let mut report = CycleReport {
            run: RunSummary::start(),
            enrichment: Vec::new(),
        };
        info!(run_id = %report.run.run_id, regions = regions.len(), "🚀 Harvest cycle started");

        let outcome = self.cycle(regions, &mut report).await;
        report.run.interrupted |= self.cancel.is_cancelled();
        report.run.finish();
        self.write_summaries(&report)?;
        outcome?;

        info!(
            records_written = report.run.total_records_written(),
            enriched = report.enrichment.iter().map(|s| s.enriched).sum::<usize>(),
            interrupted = report.run.interrupted,
            "✅ Harvest cycle finished"
        );
        Ok(report)
    }

    async fn cycle(&self, regions: &[Region], report: &mut CycleReport) -> Result<(), HarvestError> {
        for region in regions {
            if self.cancel.is_cancelled() {
                report.run.interrupted = true;
                break;
            }
            let crawled = self.traversal.run_region(region).await?;
            let finished = crawled.failure.is_none() && !crawled.interrupted;
            report.run.regions.push(crawled);
            if !finished {
                warn!(region = %region, "Phase 1 did not finish, skipping Phase 2 for this region");
                continue;
            }

            match self.pipeline.run_region(&region.slug()).await {
                Ok(summary) => {
                    let interrupted = summary.interrupted;
                    report.enrichment.push(summary);
                    if interrupted {
                        break;
                    }
                }
                Err(EnrichError::Storage(e)) if !e.is_fatal() => {
                    warn!(region = %region, error = %e, "Region output unusable, skipping enrichment");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn write_summaries(&self, report: &CycleReport) -> Result<(), WriteError> {
        let layout = self.traversal.layout();
        report.run.write_json(&layout.run_summary_path())?;
        EnrichmentSummary::write_json(&report.enrichment, &layout.enrichment_summary_path())?;
        Ok(())
    }
}
