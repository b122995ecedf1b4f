//! Tracing subscriber setup
//!
//! Every signpost crate logs through `tracing`. Call [`init`] once at startup
//! to print those events; the output is controlled by environment variables:
//!
//! - `SIGNPOST_LOG=directives` - `EnvFilter` directives (falls back to `RUST_LOG`, then `info`)
//! - `SIGNPOST_DEBUG=1` - Shorthand for `debug` when no filter is set
//! - `SIGNPOST_LOG_FORMAT=pretty|compact|json` - Output format (default `compact`)
//! - `SIGNPOST_LOG_COLOR=1|0` - Enable/disable colors (default: stderr is a terminal)

use std::env;
use std::io::IsTerminal;
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, fmt};

/// Output format for log events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Multi-line, human oriented
    Pretty,
    /// Single line per event
    Compact,
    /// One JSON object per event
    Json,
}

impl Format {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "pretty" => Some(Format::Pretty),
            "compact" => Some(Format::Compact),
            "json" => Some(Format::Json),
            _ => None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// `EnvFilter` directives
    pub filter: String,
    pub format: Format,
    pub color: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            format: Format::Compact,
            color: false,
        }
    }
}

impl LogConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::from_lookup(|name| env::var(name).ok());
        if env::var_os("SIGNPOST_LOG_COLOR").is_none() {
            config.color = std::io::stderr().is_terminal();
        }
        config
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |name: &str| {
            get(name)
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false)
        };

        let filter = get("SIGNPOST_LOG")
            .or_else(|| get("RUST_LOG"))
            .filter(|f| !f.trim().is_empty())
            .unwrap_or_else(|| {
                if flag("SIGNPOST_DEBUG") {
                    "debug".to_string()
                } else {
                    "info".to_string()
                }
            });

        let format = get("SIGNPOST_LOG_FORMAT")
            .and_then(|s| Format::parse(&s))
            .unwrap_or(Format::Compact);

        Self {
            filter,
            format,
            color: flag("SIGNPOST_LOG_COLOR"),
        }
    }
}

/// Install the global subscriber configured from the environment.
///
/// Fails when a global subscriber is already set.
pub fn init() -> Result<(), TryInitError> {
    init_with(&LogConfig::from_env())
}

/// Install the global subscriber with an explicit configuration.
pub fn init_with(config: &LogConfig) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_new(&config.filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match config.format {
        Format::Json => registry.with(fmt::layer().json()).try_init(),
        Format::Compact => registry
            .with(fmt::layer().compact().with_ansi(config.color))
            .try_init(),
        Format::Pretty => registry
            .with(fmt::layer().pretty().with_ansi(config.color))
            .try_init(),
    }
}
