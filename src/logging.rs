use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Configure the tracing subscriber from the configured level and format.
///
/// `RUST_LOG` takes precedence over `--log-level` when set, so individual
/// targets can still be turned up without redeploying.
pub fn init_tracing(level: &str, format: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_owned()));

    let registry = tracing_subscriber::registry().with(env_filter);

    if format == "text" {
        registry.with(fmt::layer().with_target(false).compact()).init();
    } else {
        registry.with(fmt::layer().json()).init();
    }
}
