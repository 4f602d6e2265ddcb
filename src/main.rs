//! region-harvester command line
//!
//! `crawl` runs Phase 1, `enrich` runs Phase 2 over existing Phase-1 output,
//! `run` does both one Region at a time, `count` pages every Subregion and
//! writes record counts only, `regions` prints the discovered Region listing.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use region_harvester_lib::crawling::{
    PageNavigator, RecordCounter, RecordExtractor, TraversalController, check_source_reachable,
    discover_regions,
};
use region_harvester_lib::domain::{Region, RunSummary};
use region_harvester_lib::enrichment::EnrichmentPipeline;
use region_harvester_lib::infrastructure::logging::{init_logging_with_config, log_system_info};
use region_harvester_lib::infrastructure::{HarvestConfig, HtmlExtractor, HttpNavigator};
use region_harvester_lib::orchestrator::HarvestOrchestrator;

/// Crash-safe directory crawler with two-phase enrichment
#[derive(Parser, Debug)]
#[command(name = "region-harvester")]
#[command(version, about)]
struct Cli {
    /// Configuration file (TOML); defaults to config/default.toml and the user config
    #[arg(short, long, env = "HARVEST_CONFIG")]
    config: Option<PathBuf>,

    /// Output directory, overriding the configuration
    #[arg(short, long, global = true)]
    output: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Default, Clone)]
struct Targets {
    /// Region id or name; repeat to select several (default: all)
    #[arg(short, long = "region")]
    regions: Vec<String>,

    /// Subregion id or name within the selected regions; repeatable
    #[arg(short, long = "subregion")]
    subregions: Vec<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Phase 1: walk regions and write basic records
    Crawl {
        #[command(flatten)]
        targets: Targets,
    },
    /// Phase 2: enrich existing Phase-1 output from detail pages
    Enrich {
        #[command(flatten)]
        targets: Targets,
        /// Stop after this many newly enriched records per region
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Phase 1 then Phase 2, one region at a time
    Run {
        #[command(flatten)]
        targets: Targets,
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Count records per subregion without writing Phase-1 output
    Count {
        #[command(flatten)]
        targets: Targets,
    },
    /// Print the region listing and exit
    Regions,
}

impl Command {
    fn apply(&self, config: &mut HarvestConfig) {
        let (targets, limit) = match self {
            Self::Crawl { targets } | Self::Count { targets } => (Some(targets), None),
            Self::Enrich { targets, limit } | Self::Run { targets, limit } => (Some(targets), *limit),
            Self::Regions => (None, None),
        };
        if let Some(targets) = targets {
            if !targets.regions.is_empty() {
                config.crawl.target_regions.clone_from(&targets.regions);
            }
            if !targets.subregions.is_empty() {
                config.crawl.target_subregions.clone_from(&targets.subregions);
            }
        }
        if limit.is_some() {
            config.enrichment.limit = limit;
        }
    }
}

struct Harvester {
    config: HarvestConfig,
    navigator: Arc<dyn PageNavigator>,
    extractor: Arc<dyn RecordExtractor>,
    cancel: CancellationToken,
}

impl Harvester {
    async fn regions(&self) -> Result<Vec<Region>> {
        let regions = discover_regions(self.navigator.as_ref(), &self.config, &self.cancel)
            .await
            .context("Region discovery failed")?;
        if regions.is_empty() {
            bail!("No regions selected; check source.catalog_url, source.regions, --region and --subregion");
        }
        Ok(regions)
    }

    async fn crawl(&self, regions: &[Region]) -> Result<RunSummary> {
        check_source_reachable(self.navigator.as_ref(), regions, &self.config, &self.cancel)
            .await
            .context("Source check failed")?;
        let controller = TraversalController::from_config(
            &self.config,
            self.navigator.clone(),
            self.extractor.clone(),
            self.cancel.clone(),
        )?;
        let summary = controller.run(regions).await.context("Phase 1 crawl failed")?;
        info!(
            run_id = %summary.run_id,
            regions = summary.regions.len(),
            records = summary.total_records_written(),
            partial_subregions = summary.partial_subregions().count(),
            "Phase 1 summary written"
        );
        Ok(summary)
    }

    async fn enrich(&self) -> Result<()> {
        let pipeline = EnrichmentPipeline::from_config(
            &self.config,
            self.navigator.clone(),
            self.extractor.clone(),
            self.cancel.clone(),
        )?;
        let slugs = pipeline
            .target_slugs(&self.config.crawl.target_regions)
            .with_context(|| format!("Failed to list {}", self.config.output.dir.display()))?;
        if slugs.is_empty() {
            warn!(dir = %self.config.output.dir.display(), "No Phase-1 output to enrich");
            return Ok(());
        }
        let summaries = pipeline.run(&slugs).await.context("Phase 2 enrichment failed")?;
        for summary in &summaries {
            info!(
                region = %summary.region_slug,
                enriched = summary.enriched,
                success = summary.success,
                partial = summary.partial,
                failed = summary.failed,
                "Phase 2 region summary"
            );
        }
        Ok(())
    }

    async fn run(&self, regions: &[Region]) -> Result<()> {
        check_source_reachable(self.navigator.as_ref(), regions, &self.config, &self.cancel)
            .await
            .context("Source check failed")?;
        let orchestrator = HarvestOrchestrator::from_config(
            &self.config,
            self.navigator.clone(),
            self.extractor.clone(),
            self.cancel.clone(),
        )?;
        let report = orchestrator.run_cycle(regions).await.context("Harvest cycle failed")?;
        if report.run.interrupted {
            warn!(
                regions_done = report.enrichment.len(),
                "Cycle interrupted; rerun to resume from existing output"
            );
        }
        Ok(())
    }

    async fn count(&self, regions: &[Region]) -> Result<()> {
        let counter = RecordCounter::from_config(
            &self.config,
            self.navigator.clone(),
            self.extractor.clone(),
            self.cancel.clone(),
        )?;
        let counts = counter.run(regions).await.context("Count pass failed")?;
        for count in &counts {
            println!(
                "{}\t{}\t{}\t{}",
                count.region,
                count.subregion,
                count.records,
                if count.complete { "complete" } else { count.note.as_str() }
            );
        }
        Ok(())
    }
}

fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("🛑 Interrupt received, stopping after the current write");
            cancel.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = HarvestConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(output) = &cli.output {
        config.output.dir.clone_from(output);
    }
    cli.command.apply(&mut config);

    init_logging_with_config(&config.logging)?;
    log_system_info();

    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());

    let navigator: Arc<dyn PageNavigator> = Arc::new(
        HttpNavigator::new(&config.source, config.timing.fetch_timeout())
            .context("Failed to create HTTP navigator")?,
    );
    let extractor: Arc<dyn RecordExtractor> = Arc::new(
        HtmlExtractor::new(
            &config.source.list_selectors,
            &config.source.detail_selectors,
            &config.schema.detail_field,
        )
        .context("Invalid source selectors")?,
    );
    let harvester = Harvester {
        config,
        navigator,
        extractor,
        cancel,
    };

    match &cli.command {
        Command::Regions => {
            for region in harvester.regions().await? {
                println!(
                    "{}\t{}\t{} subregions\t{}",
                    region.id,
                    region.name,
                    region.subregions.len(),
                    region.slug()
                );
            }
        }
        Command::Crawl { .. } => {
            let regions = harvester.regions().await?;
            harvester.crawl(&regions).await?;
        }
        Command::Enrich { .. } => {
            harvester.enrich().await?;
        }
        Command::Run { .. } => {
            let regions = harvester.regions().await?;
            harvester.run(&regions).await?;
        }
        Command::Count { .. } => {
            let regions = harvester.regions().await?;
            harvester.count(&regions).await?;
        }
    }
    Ok(())
}
