use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::format::FmtSpan;

/// Log to stderr, filtered by `RUST_LOG`, defaulting to debug.
///
/// Both the original process and its re-executed copy log here, so each line carries the pid.
pub fn configure_logging() {
    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(LevelFilter::DEBUG.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_timer(tracing_subscriber::fmt::time::Uptime::default())
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .init();
    tracing::debug!(pid = std::process::id(), "logging configured");
}
