//! Logging system configuration and initialization
//!
//! - Console and/or file output, optionally JSON
//! - Config file level, overridden by `RUST_LOG`
//! - Timestamps in a configurable UTC offset
//! - The previous run's log file is renamed with its timestamp on startup

use std::path::Path;
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result, anyhow};
use chrono::{FixedOffset, Utc};
use lazy_static::lazy_static;
use once_cell::sync::OnceCell;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::fmt::{self, time::FormatTime};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

pub use crate::infrastructure::config::LoggingConfig;

// Keeps the non-blocking file writers alive for the life of the process
lazy_static! {
    static ref LOG_GUARDS: Mutex<Vec<WorkerGuard>> = Mutex::new(Vec::new());
}

static INITIALIZED: OnceCell<()> = OnceCell::new();

/// Dependencies that are pinned to `warn` unless TRACE is requested
const QUIET_TARGETS: &[&str] = &["reqwest", "hyper", "hyper_util", "h2", "html5ever", "selectors", "governor"];

/// Formats timestamps in a fixed UTC offset
#[derive(Debug, Clone, Copy)]
struct OffsetTimeFormatter {
    offset: FixedOffset,
}

impl FormatTime for OffsetTimeFormatter {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = Utc::now().with_timezone(&self.offset);
        write!(w, "{}", now.format("%Y-%m-%d %H:%M:%S%.3f %:z"))
    }
}

fn offset_for(hours: i32) -> Result<FixedOffset> {
    FixedOffset::east_opt(hours * 3600).ok_or_else(|| anyhow!("Invalid UTC offset: {hours} hours"))
}

/// Filter built from configuration alone; `RUST_LOG` is applied by the caller.
pub fn build_env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    let mut filter = EnvFilter::try_new(&config.level)
        .with_context(|| format!("Invalid log level '{}'", config.level))?;

    if !config.level.to_lowercase().contains("trace") {
        for target in QUIET_TARGETS {
            filter = filter.add_directive(format!("{target}=warn").parse::<Directive>()?);
        }
    }
    for (module, level) in &config.module_filters {
        let directive = format!("{module}={level}")
            .parse::<Directive>()
            .with_context(|| format!("Invalid module filter {module}={level}"))?;
        filter = filter.add_directive(directive);
    }
    Ok(filter)
}

/// Renames an existing log file to `<stem>.<timestamp>.log`.
fn rotate_existing_log_file(log_dir: &Path, file_name: &str, offset: FixedOffset) -> Result<()> {
    let path = log_dir.join(file_name);
    if !path.exists() {
        return Ok(());
    }
    let metadata = std::fs::metadata(&path).context("Failed to get log file metadata")?;
    let file_time = metadata
        .modified()
        .unwrap_or_else(|_| std::time::SystemTime::now());
    let stamp: chrono::DateTime<Utc> = file_time.into();
    let stem = file_name.trim_end_matches(".log");
    let rotated = log_dir.join(format!(
        "{stem}.{}.log",
        stamp.with_timezone(&offset).format("%Y%m%dT%H%M%S")
    ));
    std::fs::rename(&path, &rotated)
        .with_context(|| format!("Failed to rotate {} to {}", path.display(), rotated.display()))?;
    Ok(())
}

/// Initialize logging with default configuration
pub fn init_logging() -> Result<()> {
    init_logging_with_config(&LoggingConfig::default())
}

/// Initialize logging with custom configuration.
///
/// `RUST_LOG` replaces the configured filter entirely when set:
/// ```bash
/// RUST_LOG="debug,reqwest=debug" region-harvester crawl
/// ```
pub fn init_logging_with_config(config: &LoggingConfig) -> Result<()> {
    if INITIALIZED.get().is_some() {
        return Ok(());
    }
    if !config.file_output && !config.console_output {
        return Err(anyhow!("No logging output configured"));
    }
    let offset = offset_for(config.utc_offset_hours)?;
    let timer = OffsetTimeFormatter { offset };

    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => build_env_filter(config)?,
    };

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    if config.file_output {
        std::fs::create_dir_all(&config.log_dir)
            .with_context(|| format!("Failed to create log directory {}", config.log_dir.display()))?;
        rotate_existing_log_file(&config.log_dir, &config.file_name, offset)?;

        let (file_writer, guard) = non_blocking(rolling::never(&config.log_dir, &config.file_name));
        LOG_GUARDS
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(guard);

        if config.json_format {
            layers.push(
                fmt::Layer::new()
                    .json()
                    .with_writer(file_writer)
                    .with_timer(timer)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_ansi(false)
                    .boxed(),
            );
        } else {
            layers.push(
                fmt::Layer::new()
                    .with_writer(file_writer)
                    .with_timer(timer)
                    .with_target(false)
                    .with_ansi(false)
                    .boxed(),
            );
        }
    }

    if config.console_output {
        layers.push(
            fmt::Layer::new()
                .with_writer(std::io::stdout)
                .with_timer(timer)
                .with_target(false)
                .boxed(),
        );
    }

    Registry::default()
        .with(layers)
        .with(env_filter)
        .try_init()
        .context("Failed to install tracing subscriber")?;
    let _ = INITIALIZED.set(());

    info!(
        level = %config.level,
        json = config.json_format,
        console = config.console_output,
        file = config.file_output,
        log_dir = %config.log_dir.display(),
        "Logging system initialized"
    );
    Ok(())
}

/// Log system information for diagnostics
pub fn log_system_info() {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        os = std::env::consts::OS,
        arch = std::env::consts::ARCH,
        "=== Region Harvester ==="
    );
    if let Ok(current_dir) = std::env::current_dir() {
        info!("Working directory: {}", current_dir.display());
    }
}
