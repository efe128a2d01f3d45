use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Initialize structured logging for the daemon and CLI.
///
/// `XBOT_LOG` accepts the usual env-filter syntax (`debug`,
/// `xbot::core::orchestrator=trace`, ...); defaults to INFO.
pub fn init_logging() {
    let filter = EnvFilter::try_from_env("XBOT_LOG")
        .unwrap_or_else(|_| EnvFilter::default().add_directive(Level::INFO.into()));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .finish();

    // Ignore err so repeated init (tests, restart loops) is harmless.
    tracing::subscriber::set_global_default(subscriber).ok();
}
