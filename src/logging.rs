// Tracing setup shared by the CLI and worker processes

use once_cell::sync::OnceCell;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

use crate::config::LOG_LEVELS;

static FILTER_HANDLE: OnceCell<reload::Handle<EnvFilter, Registry>> = OnceCell::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Full,
}

impl LogFormat {
    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("full") {
            LogFormat::Full
        } else {
            LogFormat::Compact
        }
    }
}

/// CLI flags win over the configured level.
pub fn level_from_flags(debug: bool, verbose: bool, configured: &str) -> String {
    let level = if debug {
        Level::DEBUG
    } else if verbose {
        Level::INFO
    } else {
        return normalize_level(configured).to_string();
    };
    level.as_str().to_ascii_lowercase()
}

/// Map a level name onto one `EnvFilter` understands; unknown names become `warn`.
pub fn normalize_level(level: &str) -> &'static str {
    let lower = level.trim().to_ascii_lowercase();
    LOG_LEVELS
        .iter()
        .copied()
        .find(|l| *l == lower)
        .unwrap_or(match lower.as_str() {
            "warning" => "warn",
            "verbose" => "debug",
            _ => "warn",
        })
}

/// Install the global subscriber writing to stderr. `RUST_LOG` overrides `level`.
/// Safe to call more than once; later calls are ignored.
pub fn init_logging(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(normalize_level(level)));
    let (filter_layer, handle) = reload::Layer::new(filter);
    let registry = tracing_subscriber::registry().with(filter_layer);
    let fmt_layer = fmt::layer().with_writer(std::io::stderr).with_target(false);

    let installed = match format {
        LogFormat::Compact => registry.with(fmt_layer.compact()).try_init(),
        LogFormat::Full => registry.with(fmt_layer).try_init(),
    };
    if installed.is_ok() {
        let _ = FILTER_HANDLE.set(handle);
    }
}

/// Swap the active filter. A no-op when logging was never initialised.
pub fn set_level(level: &str) {
    let Some(handle) = FILTER_HANDLE.get() else {
        return;
    };
    let level = normalize_level(level);
    if let Err(e) = handle.reload(EnvFilter::new(level)) {
        tracing::warn!("Could not change log level to {}: {}", level, e);
    } else {
        tracing::debug!("Log level set to {}", level);
    }
}
