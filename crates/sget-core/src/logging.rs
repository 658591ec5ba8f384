//! Logging init for the CLI: tracing to stderr, env-filter controlled.

/// Initialize tracing to stderr. `debug` lowers the default filter so the
/// per-segment plumbing becomes visible; `RUST_LOG` still wins when set.
pub fn init_logging(debug: bool) {
    let default_filter = if debug { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(false)
        .init();
}
