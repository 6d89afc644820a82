//! Logger initialization
//!
//! Sets up a `tracing` subscriber with:
//! - an `EnvFilter` (default `info`, `RUST_LOG` overrides)
//! - a console layer on stderr
//! - an append-only log file layer
//!
//! Both layers render the same line format, which operators `tail -f` and
//! monitoring scripts grep:
//!
//! ```text
//! [INFO] [2026-10-17T09:14:03Z] Stage completed stage=init-cluster
//! ```

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};
use thiserror::Error;
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{self, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Default filter when neither the config nor `RUST_LOG` provide one
const DEFAULT_FILTER: &str = "info,kube=warn,hyper=warn,tower=warn";

/// Errors that can occur during logger initialization
#[derive(Debug, Error)]
pub enum LoggingError {
    /// The persistent log file could not be opened
    #[error("failed to open log file {path}: {source}")]
    OpenLogFile {
        /// Path of the log file
        path: PathBuf,
        /// Underlying I/O failure
        source: std::io::Error,
    },

    /// A global subscriber was already installed
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Configuration for logger initialization
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Persistent log file, opened in append mode
    pub log_file: Option<PathBuf>,
    /// Also write to stderr
    pub console: bool,
    /// Explicit filter directive; falls back to `RUST_LOG`, then `info`
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_file: None,
            console: true,
            filter: None,
        }
    }
}

/// Renders `[LEVEL] [timestamp] message key=value...`
#[derive(Debug, Clone, Copy, Default)]
pub struct LineFormat;

impl<S, N> FormatEvent<S, N> for LineFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let level = event.metadata().level();
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        write!(writer, "[{level}] [{timestamp}] ")?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Build the subscriber without installing it.
///
/// `init_logging` installs it globally; tests install it with
/// `tracing::subscriber::set_default` to capture a log file.
pub fn build_subscriber(
    config: &LogConfig,
) -> Result<impl Subscriber + Send + Sync + 'static, LoggingError> {
    let filter = match &config.filter {
        Some(directive) => EnvFilter::new(directive),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
    };

    let file_layer = match &config.log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|source| LoggingError::OpenLogFile {
                    path: path.clone(),
                    source,
                })?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| LoggingError::OpenLogFile {
                    path: path.clone(),
                    source,
                })?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .event_format(LineFormat),
            )
        }
        None => None,
    };

    let console_layer = config.console.then(|| {
        fmt::layer()
            .with_ansi(false)
            .with_writer(std::io::stderr)
            .event_format(LineFormat)
    });

    Ok(tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer))
}

/// Install the process-wide logger. Call once per run.
pub fn init_logging(config: &LogConfig) -> Result<(), LoggingError> {
    build_subscriber(config)?
        .try_init()
        .map_err(|e| LoggingError::SubscriberInit(e.to_string()))
}
