//! Structured logging setup for binaries and tests embedding the decoder.
//!
//! Two output modes:
//! - Pretty: human-readable lines (default)
//! - Json: one JSON object per event for log aggregation
//!
//! Set `BATCHDEC_LOG_FORMAT=json` for JSON output.
//! Set `RUST_LOG` to control log levels (default: info).

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

pub const LOG_FORMAT_ENV: &str = "BATCHDEC_LOG_FORMAT";

/// Log format mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl LogFormat {
    /// Detect the format from `BATCHDEC_LOG_FORMAT`.
    pub fn from_env() -> Self {
        Self::parse(&std::env::var(LOG_FORMAT_ENV).unwrap_or_default())
    }

    /// `"json"` (any case) selects JSON; anything else is pretty.
    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Pretty
        }
    }
}

/// Initialize logging from the environment.
///
/// Panics if a global subscriber is already installed; see [`try_init`].
pub fn init() {
    init_with_level_and_format(None, LogFormat::from_env());
}

/// Initialize logging with a fallback level used when `RUST_LOG` is unset.
pub fn init_with_level(level: &str) {
    init_with_level_and_format(Some(level), LogFormat::from_env());
}

pub fn init_with_format(format: LogFormat) {
    init_with_level_and_format(None, format);
}

pub fn init_with_level_and_format(level: Option<&str>, format: LogFormat) {
    subscriber(level, format).init();
}

/// Like [`init`], but reports an already-installed subscriber as an error so
/// test harnesses can call it repeatedly.
pub fn try_init(level: Option<&str>) -> anyhow::Result<()> {
    subscriber(level, LogFormat::from_env())
        .try_init()
        .map_err(|e| anyhow::anyhow!("logging init failed: {e}"))
}

fn env_filter(level: Option<&str>) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.unwrap_or("info")))
}

fn subscriber(
    level: Option<&str>,
    format: LogFormat,
) -> tracing_subscriber::layer::Layered<Box<dyn Layer<Registry> + Send + Sync>, Registry> {
    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = match format {
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_thread_names(true)
            .with_file(false)
            .with_line_number(false)
            .with_filter(env_filter(level))
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_current_span(true)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_filter(env_filter(level))
            .boxed(),
    };
    tracing_subscriber::registry().with(fmt_layer)
}
