//! Phase-2 enrichment pipeline
//!
//! Reads Phase-1 output lazily, fetches each record's detail page and
//! appends the merged `DetailRecord` to the region's own Phase-2 file.
//! Resume only consults Phase-2 output; Phase 1 is never rewritten.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::{Stream, StreamExt, stream};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::grouping::GroupingScanner;
use super::status::{Assessment, StatusRules};
use crate::crawling::errors::{ExtractError, NavError, WriteError};
use crate::crawling::extractor::RecordExtractor;
use crate::crawling::navigator::{PageContent, PageNavigator};
use crate::crawling::retry::{RetryPolicy, fetch_with_retry, pause};
use crate::domain::{
    BasicRecord, DetailRecord, EnrichmentSummary, ExtractionStatus, Locator, Region,
    collapse_whitespace, is_blank,
};
use crate::infrastructure::config::{ConfigError, HarvestConfig, SchemaConfig};
use crate::storage::{
    BasicRecordReader, CheckpointSet, CheckpointedWriter, OutputLayout, OutputSchema, Phase,
    WriterOptions,
};

#[derive(Error, Debug)]
pub enum EnrichError {
    #[error("Record {0} has no detail reference")]
    NoDetailReference(String),

    #[error("No data source reachable: {0}")]
    SourceUnreachable(String),

    #[error("Enrichment cancelled")]
    Cancelled,

    #[error(transparent)]
    Storage(#[from] WriteError),
}

/// One step of the enrichment stream.
#[derive(Debug)]
pub enum Candidate {
    Enriched(Box<DetailRecord>),
    SkippedNoDetail(String),
    SkippedExisting(String),
}

#[derive(Debug, Clone, Copy)]
struct DetailTiming {
    fetch_timeout: Duration,
    navigation: RetryPolicy,
    loading: RetryPolicy,
    delay: Duration,
}

enum FetchFailure {
    Failed(String),
    Fatal(EnrichError),
}

pub struct EnrichmentPipeline {
    navigator: Arc<dyn PageNavigator>,
    extractor: Arc<dyn RecordExtractor>,
    grouping: GroupingScanner,
    rules: StatusRules,
    detail_fields: Vec<String>,
    placeholders: Vec<String>,
    timing: DetailTiming,
    progress_interval: usize,
    limit: Option<usize>,
    layout: OutputLayout,
    schema_config: SchemaConfig,
    missing_value: String,
    writer_options: WriterOptions,
    cancel: CancellationToken,
}

impl EnrichmentPipeline {
    pub fn from_config(
        config: &HarvestConfig,
        navigator: Arc<dyn PageNavigator>,
        extractor: Arc<dyn RecordExtractor>,
        cancel: CancellationToken,
    ) -> Result<Self, ConfigError> {
        let grouping = GroupingScanner::new(&config.enrichment.groupings).map_err(|e| ConfigError::Validation {
            message: format!("enrichment.groupings: {e}"),
        })?;
        let schema = &config.schema;
        Ok(Self {
            navigator,
            extractor,
            grouping,
            rules: StatusRules::new(&schema.detail_fields, &schema.critical_fields, &schema.placeholder_values),
            detail_fields: schema.detail_fields.clone(),
            placeholders: schema.placeholder_values.clone(),
            timing: DetailTiming {
                fetch_timeout: config.timing.fetch_timeout(),
                navigation: config.timing.detail_policy(),
                loading: config.timing.loading_policy(),
                delay: config.timing.detail_delay(),
            },
            progress_interval: config.enrichment.progress_interval.max(1),
            limit: config.enrichment.limit,
            layout: OutputLayout::new(&config.output.dir),
            schema_config: schema.clone(),
            missing_value: config.output.missing_value.clone(),
            writer_options: WriterOptions {
                fsync: config.output.fsync,
            },
            cancel,
        })
    }

    pub const fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    async fn fetch_detail(&self, reference: &str) -> Result<PageContent, FetchFailure> {
        let locator = Locator::detail(reference);
        let mut loading_attempts = 0;
        loop {
            let result = fetch_with_retry(
                self.navigator.as_ref(),
                &locator,
                self.timing.fetch_timeout,
                self.timing.navigation,
                &self.cancel,
            )
            .await;
            match result {
                Ok(content) if content.is_loading() => {
                    loading_attempts += 1;
                    if !self.timing.loading.allows(loading_attempts) {
                        return Err(FetchFailure::Failed(format!(
                            "{locator} still loading after {loading_attempts} attempts"
                        )));
                    }
                    debug!(locator = %locator, attempt = loading_attempts, "Detail page still loading");
                    if !self.timing.loading.pause(&self.cancel).await {
                        return Err(FetchFailure::Fatal(EnrichError::Cancelled));
                    }
                }
                Ok(content) => return Ok(content),
                Err(NavError::Cancelled) => return Err(FetchFailure::Fatal(EnrichError::Cancelled)),
                Err(NavError::Unreachable(reason)) => {
                    return Err(FetchFailure::Fatal(EnrichError::SourceUnreachable(reason)));
                }
                Err(e) => return Err(FetchFailure::Failed(e.to_string())),
            }
        }
    }

    /// Detail extraction first, grouping values only where it left blanks.
    /// Keys outside the configured detail fields are dropped.
    fn merge_fields(
        &self,
        extracted: &BTreeMap<String, String>,
        grouped: &BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        let present = |map: &BTreeMap<String, String>, field: &str| {
            map.get(field)
                .filter(|v| !is_blank(v, &self.placeholders))
                .map(|v| collapse_whitespace(v))
        };
        self.detail_fields
            .iter()
            .filter_map(|field| {
                present(extracted, field)
                    .or_else(|| present(grouped, field))
                    .map(|value| (field.clone(), value))
            })
            .collect()
    }

    /// Fetches, extracts, merges and grades one record. A failed fetch
    /// still yields a record, graded FAILED.
    pub async fn enrich_one(&self, basic: &BasicRecord) -> Result<DetailRecord, EnrichError> {
        let reference = basic
            .detail_reference
            .as_deref()
            .filter(|r| !r.trim().is_empty())
            .ok_or_else(|| EnrichError::NoDetailReference(basic.primary_id.clone()))?;

        let content = match self.fetch_detail(reference).await {
            Ok(content) => content,
            Err(FetchFailure::Fatal(e)) => return Err(e),
            Err(FetchFailure::Failed(reason)) => {
                warn!(primary_id = %basic.primary_id, reason = %reason, "Detail fetch failed");
                return Ok(Self::assemble(basic, BTreeMap::new(), Assessment::fetch_failed(), Some(reason)));
            }
        };

        let extracted = self.extractor.extract_detail(&content).unwrap_or_else(|e: ExtractError| {
            warn!(primary_id = %basic.primary_id, error = %e, "Detail extraction failed");
            BTreeMap::new()
        });
        let grouped = self.grouping.scan(&content.body);
        let merged = self.merge_fields(&extracted, &grouped);
        let assessment = self.rules.assess(&merged);
        debug!(
            primary_id = %basic.primary_id,
            status = %assessment.status,
            fields = assessment.fields_extracted,
            critical = assessment.critical_present,
            "Record enriched"
        );
        Ok(Self::assemble(basic, merged, assessment, None))
    }

    fn assemble(
        basic: &BasicRecord,
        detail_fields: BTreeMap<String, String>,
        assessment: Assessment,
        fetch_failure: Option<String>,
    ) -> DetailRecord {
        DetailRecord {
            basic: basic.clone(),
            detail_fields,
            detail_extracted_at: Utc::now(),
            status: assessment.status,
            fields_extracted_count: assessment.fields_extracted,
            critical_fields_count: assessment.critical_present,
            fetch_failure,
        }
    }

    /// Lazily turns `records` into enrichment steps. Records in `done` and
    /// records without a detail reference are reported, never fetched. The
    /// stream ends once `limit` records have been enriched.
    pub fn enrich<'a, I>(
        &'a self,
        records: I,
        done: &'a CheckpointSet,
        limit: Option<usize>,
    ) -> impl Stream<Item = Result<Candidate, EnrichError>> + 'a
    where
        I: Iterator<Item = Result<BasicRecord, WriteError>> + 'a,
    {
        struct State<I> {
            records: I,
            remaining: Option<usize>,
            fetched_any: bool,
            finished: bool,
        }

        let state = State {
            records,
            remaining: limit,
            fetched_any: false,
            finished: false,
        };
        stream::unfold(state, move |mut state| async move {
            if state.finished || state.remaining == Some(0) {
                return None;
            }
            let basic = match state.records.next()? {
                Ok(basic) => basic,
                Err(e) => {
                    state.finished = true;
                    return Some((Err(EnrichError::Storage(e)), state));
                }
            };
            if !basic.has_detail_reference() {
                return Some((Ok(Candidate::SkippedNoDetail(basic.primary_id)), state));
            }
            if done.contains(&basic.primary_id) {
                return Some((Ok(Candidate::SkippedExisting(basic.primary_id)), state));
            }

            if state.fetched_any && !pause(self.timing.delay, &self.cancel).await {
                state.finished = true;
                return Some((Err(EnrichError::Cancelled), state));
            }
            state.fetched_any = true;

            let result = self.enrich_one(&basic).await;
            match &result {
                Ok(_) => {
                    if let Some(remaining) = state.remaining.as_mut() {
                        *remaining -= 1;
                    }
                }
                Err(_) => state.finished = true,
            }
            Some((result.map(|record| Candidate::Enriched(Box::new(record))), state))
        })
    }

    /// Enriches one region's Phase-1 output, resuming from its Phase-2 file.
    pub async fn run_region(&self, slug: &str) -> Result<EnrichmentSummary, EnrichError> {
        let started = Instant::now();
        let mut summary = EnrichmentSummary::new(slug);

        let phase1 = self.layout.path_for_slug(slug, Phase::Basic);
        let reader = BasicRecordReader::open(&phase1, &self.schema_config, &self.missing_value)?;
        let schema = OutputSchema::phase2(&self.schema_config, &self.missing_value);
        let mut writer = CheckpointedWriter::open(
            &self.layout.path_for_slug(slug, Phase::Detail),
            schema,
            self.writer_options,
        )?;
        let done = writer.checkpoint().clone();
        info!(region = %slug, already_enriched = done.len(), limit = ?self.limit, "🔍 Enrichment started");

        let steps = self.enrich(reader, &done, self.limit);
        futures::pin_mut!(steps);
        while let Some(step) = steps.next().await {
            match step {
                Ok(Candidate::SkippedNoDetail(_)) => {
                    summary.records_seen += 1;
                    summary.skipped_no_detail += 1;
                }
                Ok(Candidate::SkippedExisting(_)) => {
                    summary.records_seen += 1;
                    summary.skipped_existing += 1;
                }
                Ok(Candidate::Enriched(record)) => {
                    summary.records_seen += 1;
                    writer.write(&*record)?;
                    summary.enriched += 1;
                    match record.status {
                        ExtractionStatus::Success => summary.success += 1,
                        ExtractionStatus::Partial => summary.partial += 1,
                        ExtractionStatus::Failed => summary.failed += 1,
                    }
                    if record.fetch_failure.is_some() {
                        summary.fetch_failures += 1;
                    }
                    if summary.enriched % self.progress_interval == 0 {
                        self.log_progress(&summary, started.elapsed());
                    }
                }
                Err(EnrichError::Cancelled) => {
                    summary.interrupted = true;
                    break;
                }
                Err(e) => {
                    writer.close()?;
                    return Err(e);
                }
            }
        }

        summary.limit_reached = self.limit.is_some_and(|limit| summary.enriched >= limit);
        summary.interrupted |= self.cancel.is_cancelled();
        summary.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        writer.close()?;
        info!(
            region = %slug,
            enriched = summary.enriched,
            success = summary.success,
            partial = summary.partial,
            failed = summary.failed,
            skipped_existing = summary.skipped_existing,
            skipped_no_detail = summary.skipped_no_detail,
            limit_reached = summary.limit_reached,
            interrupted = summary.interrupted,
            "Region enrichment finished"
        );
        Ok(summary)
    }

    fn log_progress(&self, summary: &EnrichmentSummary, elapsed: Duration) {
        #[allow(clippy::cast_precision_loss)]
        let per_record = elapsed.as_secs_f64() / summary.enriched as f64;
        let eta = self.limit.map(|limit| {
            #[allow(clippy::cast_precision_loss)]
            let left = limit.saturating_sub(summary.enriched) as f64;
            Duration::from_secs_f64(per_record * left)
        });
        info!(
            region = %summary.region_slug,
            enriched = summary.enriched,
            success = summary.success,
            partial = summary.partial,
            failed = summary.failed,
            secs_per_record = %format!("{per_record:.2}"),
            eta_secs = ?eta.map(|d| d.as_secs()),
            "📊 Enrichment progress"
        );
    }

    /// Runs every slug in order and writes `enrichment_summary.json`.
    /// A region whose files are unusable is logged and skipped.
    pub async fn run(&self, slugs: &[String]) -> Result<Vec<EnrichmentSummary>, EnrichError> {
        info!(regions = slugs.len(), "🚀 Phase 2 enrichment started");
        let mut summaries = Vec::with_capacity(slugs.len());
        for slug in slugs {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.run_region(slug).await {
                Ok(summary) => {
                    let interrupted = summary.interrupted;
                    summaries.push(summary);
                    if interrupted {
                        break;
                    }
                }
                Err(EnrichError::Storage(e)) if !e.is_fatal() => {
                    warn!(region = %slug, error = %e, "Region output unusable, skipping enrichment");
                }
                Err(e) => {
                    EnrichmentSummary::write_json(&summaries, &self.layout.enrichment_summary_path())
                        .map_err(WriteError::from)?;
                    return Err(e);
                }
            }
        }
        EnrichmentSummary::write_json(&summaries, &self.layout.enrichment_summary_path())
            .map_err(WriteError::from)?;
        info!(
            enriched = summaries.iter().map(|s| s.enriched).sum::<usize>(),
            "✅ Phase 2 enrichment finished"
        );
        Ok(summaries)
    }

    /// Phase-1 slugs on disk narrowed to `targets`. A target names a file by
    /// its slug, or by the region id or name recorded in its first row.
    /// Empty targets keep every file.
    pub fn target_slugs(&self, targets: &[String]) -> Result<Vec<String>, EnrichError> {
        let available = self.layout.phase1_slugs().map_err(WriteError::from)?;
        if targets.is_empty() {
            return Ok(available);
        }
        let identities: Vec<(String, Option<Region>)> = available
            .into_iter()
            .map(|slug| {
                let region = self.recorded_region(&slug);
                (slug, region)
            })
            .collect();

        let names = |target: &str, slug: &str, region: Option<&Region>| {
            Region::new(target, target).slug() == slug || region.is_some_and(|r| r.matches(target))
        };
        for target in targets {
            if !identities.iter().any(|(slug, region)| names(target, slug, region.as_ref())) {
                warn!(target = %target, dir = %self.layout.dir().display(), "Requested region has no Phase-1 output");
            }
        }
        Ok(identities
            .into_iter()
            .filter(|(slug, region)| targets.iter().any(|t| names(t, slug, region.as_ref())))
            .map(|(slug, _)| slug)
            .collect())
    }

    /// Region id and name as written in the first row of a Phase-1 file.
    fn recorded_region(&self, slug: &str) -> Option<Region> {
        let path = self.layout.path_for_slug(slug, Phase::Basic);
        let mut reader = match BasicRecordReader::open(&path, &self.schema_config, &self.missing_value) {
            Ok(reader) => reader,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Phase-1 file not readable, matching by slug only");
                return None;
            }
        };
        let first = reader.next()?.ok()?;
        Some(Region::new(first.region_id, first.region_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FixtureExtractor, ScriptedNavigator, Step, detail_body, test_config};

    fn basic(id: &str, detail: Option<&str>) -> BasicRecord {
        BasicRecord {
            primary_id: id.into(),
            region_id: "n".into(),
            region_name: "North".into(),
            subregion_id: "n1".into(),
            subregion_name: "North One".into(),
            extracted_at: Utc::now(),
            fields: BTreeMap::from([("name".to_string(), format!("School {id}"))]),
            detail_reference: detail.map(String::from),
        }
    }

    fn pipeline(navigator: ScriptedNavigator, dir: &std::path::Path) -> EnrichmentPipeline {
        let config = test_config(dir);
        EnrichmentPipeline::from_config(&config, Arc::new(navigator), Arc::new(FixtureExtractor), CancellationToken::new())
            .unwrap()
    }

    #[tokio::test]
    async fn test_both_critical_fields_is_success() {
        let dir = tempfile::tempdir().unwrap();
        let navigator = ScriptedNavigator::new().script(
            Locator::detail("https://d/1"),
            vec![Step::body(detail_body(&[("total_students", "120"), ("total_teachers", "9")]))],
        );
        let record = pipeline(navigator, dir.path())
            .enrich_one(&basic("1", Some("https://d/1")))
            .await
            .unwrap();
        assert_eq!(record.status, ExtractionStatus::Success);
        assert_eq!(record.critical_fields_count, 2);
        assert_eq!(record.field("name"), Some("School 1"));
    }

    #[tokio::test]
    async fn test_failed_fetch_is_failed_with_zero_counts() {
        let dir = tempfile::tempdir().unwrap();
        let navigator = ScriptedNavigator::new().script(
            Locator::detail("https://d/2"),
            vec![Step::error(NavError::NotFound(Locator::detail("https://d/2")))],
        );
        let record = pipeline(navigator, dir.path())
            .enrich_one(&basic("2", Some("https://d/2")))
            .await
            .unwrap();
        assert_eq!(record.status, ExtractionStatus::Failed);
        assert_eq!(record.fields_extracted_count, 0);
        assert!(record.fetch_failure.is_some());
    }

    #[tokio::test]
    async fn test_grouping_fills_only_blank_fields() {
        let dir = tempfile::tempdir().unwrap();
        let mut body = detail_body(&[("total_students", "40"), ("total_teachers", "3")]);
        body.push_str(
            r#"<h2>Teachers</h2><ul><li><span>Total</span><span class="value">99</span></li><li><span>Female</span><span class="value">2</span></li></ul>"#,
        );
        let navigator = ScriptedNavigator::new().script(Locator::detail("https://d/3"), vec![Step::body(body)]);
        let record = pipeline(navigator, dir.path())
            .enrich_one(&basic("3", Some("https://d/3")))
            .await
            .unwrap();
        assert_eq!(record.detail_fields.get("total_teachers").map(String::as_str), Some("3"));
        assert_eq!(record.detail_fields.get("female_teachers").map(String::as_str), Some("2"));
    }

    #[tokio::test]
    async fn test_unreachable_source_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let navigator = ScriptedNavigator::new().script(
            Locator::detail("https://d/4"),
            vec![Step::error(NavError::Unreachable("dns".into()))],
        );
        let err = pipeline(navigator, dir.path())
            .enrich_one(&basic("4", Some("https://d/4")))
            .await
            .unwrap_err();
        assert!(matches!(err, EnrichError::SourceUnreachable(_)));
    }

    #[tokio::test]
    async fn test_stream_skips_and_limits() {
        let dir = tempfile::tempdir().unwrap();
        let navigator = ScriptedNavigator::new()
            .script(Locator::detail("https://d/b"), vec![Step::body(detail_body(&[("total_students", "1")]))])
            .script(Locator::detail("https://d/c"), vec![Step::body(detail_body(&[("total_students", "2")]))]);
        let pipeline = pipeline(navigator, dir.path());
        let records = vec![
            Ok(basic("a", None)),
            Ok(basic("done", Some("https://d/done"))),
            Ok(basic("b", Some("https://d/b"))),
            Ok(basic("c", Some("https://d/c"))),
        ];
        let done: CheckpointSet = ["done".to_string()].into_iter().collect();
        let steps: Vec<Candidate> = pipeline
            .enrich(records.into_iter(), &done, Some(1))
            .map(Result::unwrap)
            .collect()
            .await;
        assert_eq!(steps.len(), 3);
        assert!(matches!(&steps[0], Candidate::SkippedNoDetail(id) if id == "a"));
        assert!(matches!(&steps[1], Candidate::SkippedExisting(id) if id == "done"));
        assert!(matches!(&steps[2], Candidate::Enriched(r) if r.primary_id() == "b"));
    }

    #[tokio::test]
    async fn test_record_without_reference_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = pipeline(ScriptedNavigator::new(), dir.path())
            .enrich_one(&basic("x", None))
            .await
            .unwrap_err();
        assert!(matches!(err, EnrichError::NoDetailReference(_)));
    }

    fn write_phase1(dir: &std::path::Path, slug: &str, record: Option<BasicRecord>) {
        let config = test_config(dir);
        let schema = OutputSchema::phase1(&config.schema, &config.output.missing_value);
        let path = dir.join(format!("{slug}_phase1.csv"));
        let mut writer = CheckpointedWriter::open(&path, schema, WriterOptions { fsync: false }).unwrap();
        if let Some(record) = record {
            writer.write(&record).unwrap();
        }
        writer.close().unwrap();
    }

    #[test]
    fn test_target_slugs_match_id_name_or_slug() {
        let dir = tempfile::tempdir().unwrap();
        let mut karnataka = basic("K1", Some("https://d/k1"));
        karnataka.region_id = "ka".into();
        karnataka.region_name = "Karnataka".into();
        write_phase1(dir.path(), "KARNATAKA", Some(karnataka));
        write_phase1(dir.path(), "SOUTH_EAST", None);
        let pipeline = pipeline(ScriptedNavigator::new(), dir.path());

        assert_eq!(pipeline.target_slugs(&["ka".into()]).unwrap(), vec!["KARNATAKA".to_string()]);
        assert_eq!(pipeline.target_slugs(&["karnataka".into()]).unwrap(), vec!["KARNATAKA".to_string()]);
        assert_eq!(pipeline.target_slugs(&["south east".into()]).unwrap(), vec!["SOUTH_EAST".to_string()]);
        assert!(pipeline.target_slugs(&["tn".into()]).unwrap().is_empty());
        assert_eq!(pipeline.target_slugs(&[]).unwrap().len(), 2);
    }
}
