use tracing_subscriber::{fmt, EnvFilter};

/// Initializes the tracing subscriber. `RUST_LOG` takes precedence; the
/// fallback keeps this crate at debug and its dependencies at info.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,nl_query=debug"));

    fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(false)
        .init();
}
