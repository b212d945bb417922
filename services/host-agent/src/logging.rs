//! Tracing subscriber setup with a runtime-adjustable filter.

use anyhow::{Context, Result};
use edge_schema::LogLevel;
use tracing_subscriber::{
    layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry,
};

/// Something that can change the process log verbosity.
pub trait LogLevelControl: Send + Sync {
    fn set_level(&self, level: LogLevel) -> Result<()>;
}

/// Filter directive for a store log level.
pub fn directive(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warning => "warn",
        LogLevel::Error | LogLevel::Critical => "error",
    }
}

/// Handle to the installed filter.
#[derive(Clone)]
pub struct ReloadableFilter {
    handle: reload::Handle<EnvFilter, Registry>,
}

impl LogLevelControl for ReloadableFilter {
    fn set_level(&self, level: LogLevel) -> Result<()> {
        self.handle
            .reload(EnvFilter::new(directive(level)))
            .context("failed to reload log filter")
    }
}

/// Install the global JSON subscriber.
///
/// `RUST_LOG` wins over `default_level`.
pub fn init(default_level: &str) -> Result<ReloadableFilter> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_level)
            .with_context(|| format!("invalid log level: {default_level}"))?,
    };
    let (filter, handle) = reload::Layer::new(filter);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(ReloadableFilter { handle })
}
