//! Tracing subscriber setup.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Install the global subscriber. `RUST_LOG` wins over `log_level` when set.
///
/// `log_format` is `json` for production or anything else for compact text.
pub fn init(log_format: &str, log_level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to initialize log filter: {e}"))?;

    let registry = tracing_subscriber::registry().with(filter);
    let result = if log_format.eq_ignore_ascii_case("json") {
        registry
            .with(fmt::layer().json().with_current_span(true).with_target(true))
            .try_init()
    } else {
        registry
            .with(fmt::layer().compact().with_target(true))
            .try_init()
    };
    result.map_err(|e| anyhow::anyhow!("Failed to install subscriber: {e}"))
}
