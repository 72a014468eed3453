//! `tracing` subscriber setup for the host binaries.

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

use crate::CommonError;

/// How log lines are rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line, human-oriented.
    Pretty,
    /// One line per event.
    #[default]
    Compact,
    /// Newline-delimited JSON.
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format '{}' (pretty, compact, json)", other)),
        }
    }
}

/// Subscriber settings.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Level used when neither `directives` nor `RUST_LOG` apply.
    pub level: Level,
    pub format: LogFormat,
    /// Explicit filter directives, e.g. `turboscout_sw=trace,reqwest=warn`.
    pub directives: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::default(),
            directives: None,
        }
    }
}

impl LogConfig {
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_directives(mut self, directives: Option<String>) -> Self {
        self.directives = directives;
        self
    }

    /// Resolve the filter: explicit directives, then `RUST_LOG`, then the base level.
    pub fn env_filter(&self) -> crate::Result<EnvFilter> {
        match &self.directives {
            Some(directives) => EnvFilter::try_new(directives).map_err(|e| {
                CommonError::config_with_source(format!("invalid log filter '{}'", directives), e)
            }),
            None => Ok(EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(self.level.as_str()))),
        }
    }

    fn fmt_layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let located = self.level >= Level::DEBUG;
        match self.format {
            LogFormat::Pretty => fmt::layer()
                .pretty()
                .with_file(located)
                .with_line_number(located)
                .boxed(),
            LogFormat::Compact => fmt::layer().compact().with_target(located).boxed(),
            LogFormat::Json => fmt::layer().json().with_current_span(true).boxed(),
        }
    }
}

/// Install the global subscriber. Fails if one is already set or the filter is invalid.
pub fn init_logging(config: &LogConfig) -> crate::Result<()> {
    let filter = config.env_filter()?;
    tracing_subscriber::registry()
        .with(config.fmt_layer())
        .with(filter)
        .try_init()
        .map_err(|e| CommonError::config_with_source("cannot install log subscriber", e))
}
