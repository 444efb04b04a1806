//! Development helper: tracing setup for tests and examples.

/// Install a fmt subscriber tuned for debugging this runtime.
///
/// The filter comes from `RUST_LOG` when set and falls back to debug level
/// for the runtime crates otherwise. Thread names are included because most of
/// the interesting interleavings happen across the named runtime threads
/// (`longeron-reactor`, `longeron-timer`, `longeron-coroutine`) and the
/// executor workers. No-op when a global subscriber is already installed.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new("longeron_core=debug,longeron_net=debug")
    });
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init();
}
