//! Logging setup for binaries and demos embedding the orchestrator
//!
//! The library itself only emits `tracing` events; installing a subscriber
//! is left to the application. [`init_tracing`] is the usual way to do it.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::Subscriber;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter};

/// Default filter when `RUST_LOG` is not set
pub const DEFAULT_FILTER: &str = "nl2sql_orchestrator=info";

/// Output format of the log subscriber
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
}

/// Build the filter from `RUST_LOG`, falling back to `default_filter`
pub fn env_filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
}

/// Subscriber writing formatted events to `writer`
pub fn subscriber<W>(format: LogFormat, filter: EnvFilter, writer: W) -> Box<dyn Subscriber + Send + Sync>
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Pretty => Box::new(registry.with(fmt::layer().with_target(true).with_writer(writer))),
        LogFormat::Json => Box::new(
            registry.with(
                fmt::layer()
                    .json()
                    .with_current_span(false)
                    .with_writer(writer),
            ),
        ),
    }
}

/// Install a global subscriber on stdout. Fails if one is already installed.
pub fn init_tracing(format: LogFormat) -> Result<()> {
    let subscriber = subscriber(format, env_filter(DEFAULT_FILTER), std::io::stdout);
    tracing::subscriber::set_global_default(subscriber).map_err(|e| Error::Tracing(e.to_string()))
}
