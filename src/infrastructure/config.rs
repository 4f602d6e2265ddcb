//! Configuration management
//!
//! Every timing, threshold and selector is configuration, not a constant:
//! the source portal's behaviour drifts and the values get tuned against it.
//! Loading order: built-in defaults, then an optional TOML file, then
//! `HARVEST__SECTION__KEY` environment variables.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crawling::retry::RetryPolicy;
use crate::domain::Region;
use crate::storage::schema::FIXED_COLUMNS;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load config: {source}")]
    FileLoad {
        #[from]
        source: config::ConfigError,
    },

    #[error("Configuration validation failed: {message}")]
    Validation { message: String },
}

impl ConfigError {
    fn invalid(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }
}

/// Default configuration values
pub mod defaults {
    /// Output directory, relative to the working directory
    pub const OUTPUT_DIR: &str = "output";

    /// Written in place of blank values
    pub const MISSING_VALUE: &str = "N/A";

    /// Safety limit on pages per subregion
    pub const MAX_PAGES_PER_SUBREGION: u32 = 500;

    pub const REGION_CONCURRENCY: usize = 1;

    pub const FETCH_TIMEOUT_MS: u64 = 25_000;
    pub const NAVIGATION_ATTEMPTS: u32 = 3;
    pub const NAVIGATION_BACKOFF_MS: u64 = 1_000;
    pub const LOADING_ATTEMPTS: u32 = 3;
    pub const LOADING_BACKOFF_MS: u64 = 2_000;

    /// Extra wait before re-requesting an empty first page
    pub const FIRST_PAGE_RECOVERY_MS: u64 = 3_000;

    pub const DETAIL_ATTEMPTS: u32 = 3;
    pub const DETAIL_BACKOFF_MS: u64 = 3_000;

    /// Pause between consecutive detail fetches
    pub const DETAIL_DELAY_MS: u64 = 1_000;

    /// Fragment passes the structural filter above either size
    pub const MIN_FRAGMENT_TEXT_LEN: usize = 10;
    pub const MIN_FRAGMENT_MARKUP_LEN: usize = 50;

    pub const PROGRESS_INTERVAL: usize = 10;

    pub const REQUESTS_PER_SECOND: u32 = 2;

    /// Consecutive connection failures before the source counts as unreachable
    pub const UNREACHABLE_AFTER: u32 = 5;
    pub const USER_AGENT: &str = "region-harvester/0.1";

    pub const ANCESTOR_WINDOW: usize = 4;

    pub const ENV_PREFIX: &str = "HARVEST";
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    pub output: OutputConfig,
    pub crawl: CrawlConfig,
    pub timing: TimingConfig,
    pub schema: SchemaConfig,
    pub filter: FilterConfig,
    pub enrichment: EnrichmentConfig,
    pub source: SourceConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub dir: PathBuf,
    pub missing_value: String,
    /// `sync_data` after every row
    pub fsync: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(defaults::OUTPUT_DIR),
            missing_value: defaults::MISSING_VALUE.to_string(),
            fsync: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlConfig {
    /// Region ids or names; empty means every discovered region
    pub target_regions: Vec<String>,
    /// Subregion ids or names within the selected regions; empty means all
    pub target_subregions: Vec<String>,
    pub max_pages_per_subregion: u32,
    pub region_concurrency: usize,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            target_regions: Vec::new(),
            target_subregions: Vec::new(),
            max_pages_per_subregion: defaults::MAX_PAGES_PER_SUBREGION,
            region_concurrency: defaults::REGION_CONCURRENCY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub fetch_timeout_ms: u64,
    pub navigation_attempts: u32,
    pub navigation_backoff_ms: u64,
    pub loading_attempts: u32,
    pub loading_backoff_ms: u64,
    pub first_page_recovery_ms: u64,
    pub detail_attempts: u32,
    pub detail_backoff_ms: u64,
    pub detail_delay_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_ms: defaults::FETCH_TIMEOUT_MS,
            navigation_attempts: defaults::NAVIGATION_ATTEMPTS,
            navigation_backoff_ms: defaults::NAVIGATION_BACKOFF_MS,
            loading_attempts: defaults::LOADING_ATTEMPTS,
            loading_backoff_ms: defaults::LOADING_BACKOFF_MS,
            first_page_recovery_ms: defaults::FIRST_PAGE_RECOVERY_MS,
            detail_attempts: defaults::DETAIL_ATTEMPTS,
            detail_backoff_ms: defaults::DETAIL_BACKOFF_MS,
            detail_delay_ms: defaults::DETAIL_DELAY_MS,
        }
    }
}

impl TimingConfig {
    /// Timings that never sleep, for tests and dry runs.
    pub const fn immediate() -> Self {
        Self {
            fetch_timeout_ms: 1_000,
            navigation_attempts: 3,
            navigation_backoff_ms: 0,
            loading_attempts: 3,
            loading_backoff_ms: 0,
            first_page_recovery_ms: 0,
            detail_attempts: 2,
            detail_backoff_ms: 0,
            detail_delay_ms: 0,
        }
    }

    pub const fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub const fn first_page_recovery(&self) -> Duration {
        Duration::from_millis(self.first_page_recovery_ms)
    }

    pub const fn detail_delay(&self) -> Duration {
        Duration::from_millis(self.detail_delay_ms)
    }

    pub const fn navigation_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.navigation_attempts,
            Duration::from_millis(self.navigation_backoff_ms),
        )
    }

    pub const fn loading_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.loading_attempts,
            Duration::from_millis(self.loading_backoff_ms),
        )
    }

    pub const fn detail_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.detail_attempts,
            Duration::from_millis(self.detail_backoff_ms),
        )
    }
}

/// Field layout of both output phases.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    /// Raw field holding the primary identifier
    pub id_field: String,
    /// Raw field holding the display name; must be one of `record_fields`
    pub name_field: String,
    /// Raw field holding the detail reference
    pub detail_field: String,
    /// Only references matching this pattern count as detail references
    pub detail_reference_pattern: Option<String>,
    /// Phase-1 extracted fields, in column order
    pub record_fields: Vec<String>,
    /// Phase-2 detail-only fields, in column order
    pub detail_fields: Vec<String>,
    /// Detail fields deciding SUCCESS/PARTIAL
    pub critical_fields: Vec<String>,
    /// Values treated as blank
    pub placeholder_values: Vec<String>,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            id_field: "code".into(),
            name_field: "name".into(),
            detail_field: "detail_url".into(),
            detail_reference_pattern: None,
            record_fields: [
                "name",
                "email",
                "status",
                "category",
                "management",
                "kind",
                "location",
                "address",
                "postal_code",
            ]
            .map(String::from)
            .to_vec(),
            detail_fields: [
                "detail_name",
                "academic_year",
                "class_from",
                "class_to",
                "established",
                "affiliation",
                "total_students",
                "total_boys",
                "total_girls",
                "total_teachers",
                "male_teachers",
                "female_teachers",
            ]
            .map(String::from)
            .to_vec(),
            critical_fields: vec!["total_students".into(), "total_teachers".into()],
            placeholder_values: vec![defaults::MISSING_VALUE.into(), "-".into()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub min_text_len: usize,
    pub min_markup_len: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            min_text_len: defaults::MIN_FRAGMENT_TEXT_LEN,
            min_markup_len: defaults::MIN_FRAGMENT_MARKUP_LEN,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    /// Newly enriched records per region and session; `None` is unbounded
    pub limit: Option<usize>,
    pub progress_interval: usize,
    pub groupings: Vec<GroupingRule>,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            limit: None,
            progress_interval: defaults::PROGRESS_INTERVAL,
            groupings: vec![GroupingRule::teachers()],
        }
    }
}

/// Nested label → value grouping on detail pages (e.g. a "Teachers" block
/// with total/male/female counts).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupingRule {
    /// Text identifying the grouping, matched case-insensitively
    pub heading: String,
    /// Selector of the value elements inside the grouping
    pub value_selector: String,
    /// How many ancestors of a value are searched for its label
    #[serde(default = "default_ancestor_window")]
    pub ancestor_window: usize,
    pub labels: Vec<LabelRule>,
}

const fn default_ancestor_window() -> usize {
    defaults::ANCESTOR_WINDOW
}

impl GroupingRule {
    pub fn teachers() -> Self {
        Self {
            heading: "teacher".into(),
            value_selector: ".value".into(),
            ancestor_window: defaults::ANCESTOR_WINDOW,
            labels: vec![
                LabelRule::new("total_teachers", "total", &[]),
                LabelRule::new("female_teachers", "female", &["total"]),
                LabelRule::new("male_teachers", "male", &["female", "total"]),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelRule {
    pub field: String,
    pub contains: String,
    #[serde(default)]
    pub excludes: Vec<String>,
}

impl LabelRule {
    pub fn new(field: &str, contains: &str, excludes: &[&str]) -> Self {
        Self {
            field: field.into(),
            contains: contains.into(),
            excludes: excludes.iter().map(|s| (*s).to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Base for relative detail references
    pub base_url: String,
    /// Placeholders: `{region_id}`, `{subregion_id}`, `{page}`, `{page_number}`
    pub list_url_template: String,
    /// JSON listing of regions; when absent `regions` is used
    pub catalog_url: Option<String>,
    pub regions: Vec<Region>,
    pub user_agent: String,
    pub requests_per_second: u32,
    pub unreachable_after: u32,
    /// Body text meaning the page has not finished rendering
    pub loading_markers: Vec<String>,
    pub list_selectors: ListSelectors,
    pub detail_selectors: DetailSelectors,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/".into(),
            list_url_template:
                "http://localhost:8080/directory/{region_id}/{subregion_id}?page={page_number}"
                    .into(),
            catalog_url: None,
            regions: Vec::new(),
            user_agent: defaults::USER_AGENT.into(),
            requests_per_second: defaults::REQUESTS_PER_SECOND,
            unreachable_after: defaults::UNREACHABLE_AFTER,
            loading_markers: vec!["Loading...".into(), "Please wait".into()],
            list_selectors: ListSelectors::default(),
            detail_selectors: DetailSelectors::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListSelectors {
    /// Candidate record containers
    pub record: String,
    /// Field → selector inside a record container
    pub fields: BTreeMap<String, String>,
    /// Field → regex with one capture group, tried on the container text
    /// when the selector finds nothing
    pub field_patterns: BTreeMap<String, String>,
    /// Element whose `href` is the detail reference
    pub detail_link: String,
    pub next_control: String,
    pub disabled_class: String,
}

impl Default for ListSelectors {
    fn default() -> Self {
        let fields = [
            ("code", ".code"),
            ("name", ".name"),
            ("email", ".email"),
            ("status", ".status"),
            ("category", ".category"),
            ("management", ".management"),
            ("kind", ".kind"),
            ("location", ".location"),
            ("address", ".address"),
            ("postal_code", ".postal-code"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let field_patterns = [("code", r"(?i)code\s*:?\s*(\d{6,})")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self {
            record: "li.record".into(),
            fields,
            field_patterns,
            detail_link: "a.detail-link".into(),
            next_control: "a.nextBtn".into(),
            disabled_class: "disabled".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetailSelectors {
    /// One label/value pair per matched element
    pub item: String,
    pub label: String,
    pub value: String,
    /// Lower-cased label text → detail field
    pub labels: BTreeMap<String, String>,
}

impl Default for DetailSelectors {
    fn default() -> Self {
        let labels = [
            ("school name", "detail_name"),
            ("academic year", "academic_year"),
            ("class from", "class_from"),
            ("class to", "class_to"),
            ("year of establishment", "established"),
            ("affiliation board", "affiliation"),
            ("total students", "total_students"),
            ("boys", "total_boys"),
            ("girls", "total_girls"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        Self {
            item: "li".into(),
            label: ".label".into(),
            value: ".value".into(),
            labels,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// "error", "warn", "info", "debug", "trace"
    pub level: String,
    pub json_format: bool,
    pub console_output: bool,
    pub file_output: bool,
    pub log_dir: PathBuf,
    pub file_name: String,
    /// Offset applied to log timestamps
    pub utc_offset_hours: i32,
    /// Per-module level overrides, e.g. `region_harvester_lib::storage = "debug"`
    pub module_filters: BTreeMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json_format: false,
            console_output: true,
            file_output: true,
            log_dir: PathBuf::from("logs"),
            file_name: "region-harvester.log".into(),
            utc_offset_hours: 0,
            module_filters: BTreeMap::new(),
        }
    }
}

impl HarvestConfig {
    /// Loads from `path`, or from the default search locations when `None`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        match path {
            Some(path) => {
                builder = builder.add_source(config::File::from(path).required(true));
            }
            None => {
                builder = builder.add_source(config::File::with_name("config/default").required(false));
                if let Some(user_config) = Self::user_config_path() {
                    builder = builder.add_source(config::File::from(user_config).required(false));
                }
            }
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(defaults::ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("crawl.target_regions")
                    .with_list_parse_key("crawl.target_subregions"),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// `<config dir>/region-harvester/config.toml`
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("region-harvester").join("config.toml"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let schema = &self.schema;
        for (name, value) in [
            ("schema.id_field", &schema.id_field),
            ("schema.name_field", &schema.name_field),
            ("schema.detail_field", &schema.detail_field),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::invalid(format!("{name} must not be empty")));
            }
        }
        if !schema.record_fields.contains(&schema.name_field) {
            return Err(ConfigError::invalid(format!(
                "schema.record_fields must contain the name field '{}'",
                schema.name_field
            )));
        }
        let mut seen = HashSet::new();
        for column in schema.record_fields.iter().chain(&schema.detail_fields) {
            if FIXED_COLUMNS.contains(&column.as_str()) {
                return Err(ConfigError::invalid(format!(
                    "field '{column}' collides with a fixed output column"
                )));
            }
            if !seen.insert(column.as_str()) {
                return Err(ConfigError::invalid(format!("duplicate field '{column}'")));
            }
        }
        if schema.critical_fields.is_empty() {
            return Err(ConfigError::invalid("schema.critical_fields must not be empty"));
        }
        if let Some(field) = schema
            .critical_fields
            .iter()
            .find(|f| !schema.detail_fields.contains(f))
        {
            return Err(ConfigError::invalid(format!(
                "critical field '{field}' is not a detail field"
            )));
        }
        if let Some(pattern) = &schema.detail_reference_pattern {
            regex::Regex::new(pattern).map_err(|e| {
                ConfigError::invalid(format!("schema.detail_reference_pattern: {e}"))
            })?;
        }
        for (field, pattern) in &self.source.list_selectors.field_patterns {
            regex::Regex::new(pattern).map_err(|e| {
                ConfigError::invalid(format!("list_selectors.field_patterns.{field}: {e}"))
            })?;
        }

        let timing = &self.timing;
        if timing.fetch_timeout_ms == 0 {
            return Err(ConfigError::invalid("timing.fetch_timeout_ms must be greater than 0"));
        }
        for (name, attempts) in [
            ("navigation_attempts", timing.navigation_attempts),
            ("loading_attempts", timing.loading_attempts),
            ("detail_attempts", timing.detail_attempts),
        ] {
            if attempts == 0 {
                return Err(ConfigError::invalid(format!(
                    "timing.{name} must be greater than 0"
                )));
            }
        }

        if self.crawl.region_concurrency == 0 {
            return Err(ConfigError::invalid("crawl.region_concurrency must be greater than 0"));
        }
        if self.crawl.max_pages_per_subregion == 0 {
            return Err(ConfigError::invalid(
                "crawl.max_pages_per_subregion must be greater than 0",
            ));
        }
        if self.enrichment.progress_interval == 0 {
            return Err(ConfigError::invalid(
                "enrichment.progress_interval must be greater than 0",
            ));
        }
        if self.source.requests_per_second == 0 {
            return Err(ConfigError::invalid("source.requests_per_second must be greater than 0"));
        }
        if self.source.unreachable_after == 0 {
            return Err(ConfigError::invalid("source.unreachable_after must be greater than 0"));
        }
        for rule in &self.enrichment.groupings {
            if rule.ancestor_window == 0 || rule.labels.is_empty() {
                return Err(ConfigError::invalid(format!(
                    "grouping '{}' needs a non-zero ancestor window and at least one label",
                    rule.heading
                )));
            }
        }
        Ok(())
    }
}
