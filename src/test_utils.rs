//! Test utilities
//!
//! A scripted navigator that replays per-locator responses and a line-based
//! fixture extractor, so pagination, traversal, crash and enrichment
//! scenarios run without a network.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::crawling::errors::{ExtractError, NavError};
use crate::crawling::extractor::{DetailFields, ListPage, NextControl, RecordExtractor};
use crate::crawling::navigator::{PageContent, PageNavigator};
use crate::domain::{Locator, RawFragment, RawRecord, Region};
use crate::infrastructure::config::{HarvestConfig, TimingConfig};

/// One scripted navigator response.
#[derive(Debug, Clone)]
pub enum Step {
    Body(String),
    Loading,
    Error(NavError),
    /// Never completes; exercises the per-call timeout.
    Hang,
}

impl Step {
    pub fn body(body: impl Into<String>) -> Self {
        Self::Body(body.into())
    }

    pub const fn loading() -> Self {
        Self::Loading
    }

    pub const fn error(error: NavError) -> Self {
        Self::Error(error)
    }

    pub const fn hang() -> Self {
        Self::Hang
    }
}

/// Replays scripted steps per locator. The last step of a script repeats
/// once the others are used up; unscripted locators are `NotFound`.
#[derive(Debug, Default)]
pub struct ScriptedNavigator {
    scripts: Mutex<HashMap<Locator, VecDeque<Step>>>,
    calls: Mutex<HashMap<Locator, usize>>,
    regions: Vec<Region>,
    discovery_error: Option<NavError>,
}

impl ScriptedNavigator {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_regions(mut self, regions: Vec<Region>) -> Self {
        self.regions = regions;
        self
    }

    #[must_use]
    pub fn with_discovery_error(mut self, error: NavError) -> Self {
        self.discovery_error = Some(error);
        self
    }

    #[must_use]
    pub fn script(self, locator: Locator, steps: Vec<Step>) -> Self {
        self.push(locator, steps);
        self
    }

    /// Appends steps to a locator's script.
    pub fn push(&self, locator: Locator, steps: Vec<Step>) {
        let mut scripts = self.scripts.lock().unwrap_or_else(PoisonError::into_inner);
        scripts.entry(locator).or_default().extend(steps);
    }

    /// Scripts one list page.
    #[must_use]
    pub fn page(self, region_id: &str, subregion_id: &str, page: u32, steps: Vec<Step>) -> Self {
        self.script(list_locator(region_id, subregion_id, page), steps)
    }

    pub fn calls(&self, locator: &Locator) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).get(locator).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).values().sum()
    }

    fn next_step(&self, locator: &Locator) -> Option<Step> {
        let mut scripts = self.scripts.lock().unwrap_or_else(PoisonError::into_inner);
        let queue = scripts.get_mut(locator)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

#[async_trait]
impl PageNavigator for ScriptedNavigator {
    async fn fetch(&self, locator: &Locator, _timeout: Duration) -> Result<PageContent, NavError> {
        *self.calls.lock().unwrap_or_else(PoisonError::into_inner).entry(locator.clone()).or_default() += 1;
        match self.next_step(locator) {
            Some(Step::Body(body)) => Ok(PageContent::complete(locator.clone(), body)),
            Some(Step::Loading) => Ok(PageContent::loading(locator.clone())),
            Some(Step::Error(e)) => Err(e),
            Some(Step::Hang) => std::future::pending().await,
            None => Err(NavError::NotFound(locator.clone())),
        }
    }

    async fn discover_regions(&self, _timeout: Duration) -> Result<Vec<Region>, NavError> {
        match &self.discovery_error {
            Some(e) => Err(e.clone()),
            None => Ok(self.regions.clone()),
        }
    }
}

pub fn list_locator(region_id: &str, subregion_id: &str, page: u32) -> Locator {
    Locator::ListPage {
        region_id: region_id.to_string(),
        subregion_id: subregion_id.to_string(),
        page,
    }
}

/// Parses the line format produced by `list_body` / `detail_body`:
///
/// ```text
/// next: enabled|disabled|absent
/// record: code=A1; name=Alpha; detail_url=https://...
/// detail: total_students=120; total_teachers=8
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct FixtureExtractor;

impl FixtureExtractor {
    fn pairs(line: &str) -> impl Iterator<Item = (String, String)> + '_ {
        line.split(';').filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            Some((key.trim().to_string(), value.trim().to_string()))
        })
    }
}

impl RecordExtractor for FixtureExtractor {
    fn extract_list(&self, page: &PageContent) -> Result<ListPage, ExtractError> {
        let mut fragments = Vec::new();
        let mut next = NextControl::Absent;
        for line in page.body.lines() {
            if let Some(state) = line.strip_prefix("next:") {
                next = match state.trim() {
                    "enabled" => NextControl::Enabled,
                    "disabled" => NextControl::Disabled,
                    "absent" => NextControl::Absent,
                    other => return Err(ExtractError::Malformed(format!("next: {other}"))),
                };
            } else if let Some(record) = line.strip_prefix("record:") {
                let text = record.trim();
                fragments.push(RawFragment::new(text, format!("<li class=\"record\">{text}</li>")));
            }
        }
        Ok(ListPage { fragments, next })
    }

    fn extract_fields(&self, fragment: &RawFragment) -> RawRecord {
        Self::pairs(&fragment.text).collect()
    }

    fn extract_detail(&self, page: &PageContent) -> Result<DetailFields, ExtractError> {
        Ok(page
            .body
            .lines()
            .filter_map(|line| line.strip_prefix("detail:"))
            .flat_map(Self::pairs)
            .collect())
    }
}

pub fn record_line(code: &str, name: &str, detail_url: Option<&str>) -> String {
    match detail_url {
        Some(url) => format!("code={code}; name={name}; detail_url={url}"),
        None => format!("code={code}; name={name}"),
    }
}

/// `count` records `PREFIX-0001`, `PREFIX-0002`, ... with detail references.
pub fn numbered_records(prefix: &str, start: usize, count: usize) -> Vec<String> {
    (start..start + count)
        .map(|n| {
            let code = format!("{prefix}-{n:04}");
            record_line(
                &code,
                &format!("Record {code}"),
                Some(&format!("https://example.test/detail/{code}")),
            )
        })
        .collect()
}

pub fn list_body(records: &[String], next: NextControl) -> String {
    let state = match next {
        NextControl::Enabled => "enabled",
        NextControl::Disabled => "disabled",
        NextControl::Absent => "absent",
    };
    let mut body = format!("next: {state}\n");
    for record in records {
        body.push_str("record: ");
        body.push_str(record);
        body.push('\n');
    }
    body
}

pub fn detail_body(pairs: &[(&str, &str)]) -> String {
    let joined = pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("; ");
    format!("detail: {joined}\n")
}

/// Defaults with zero backoff, writing into `output_dir`.
pub fn test_config(output_dir: &Path) -> HarvestConfig {
    let mut config = HarvestConfig::default();
    config.output.dir = output_dir.to_path_buf();
    config.timing = TimingConfig::immediate();
    config.logging.file_output = false;
    config
}
