//! Logging initialization.
//!
//! Logs always go to stderr: stdout carries the response envelope and must
//! hold nothing else.

use std::io;

use tracing::Subscriber;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter};

use crate::config::{Config, LogFormat};

/// Build the filter: `RUST_LOG` when set, the configured level otherwise.
fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Build the subscriber for `config`, writing to `writer`.
fn subscriber<W>(config: &Config, writer: W) -> Box<dyn Subscriber + Send + Sync>
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let registry = tracing_subscriber::registry().with(filter(&config.log_level));

    match config.log_format {
        LogFormat::Json => Box::new(
            registry.with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(false)
                    .with_writer(writer),
            ),
        ),
        LogFormat::Pretty => Box::new(
            registry.with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_writer(writer),
            ),
        ),
    }
}

/// Install the global subscriber.
pub fn init(config: &Config) -> anyhow::Result<()> {
    tracing::subscriber::set_global_default(subscriber(config, io::stderr))?;
    Ok(())
}
