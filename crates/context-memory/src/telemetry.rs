// context-memory/crates/context-memory/src/telemetry.rs

use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber, honouring `RUST_LOG` (default `info`).
pub fn init_tracing() -> bool {
    init_tracing_with("info")
}

/// Install the global subscriber with `default_directives` when `RUST_LOG`
/// is unset. Returns false if a subscriber was already installed.
pub fn init_tracing_with(default_directives: &str) -> bool {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_target(true)
        .with_level(true)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).is_ok()
}
