use tracing_subscriber::EnvFilter;

/// Default directive when `RUST_LOG` is unset: the engine's own spans
/// at info, everything else quiet.
const DEFAULT_DIRECTIVE: &str = "correio_core=info";

/// Initialize the tracing subscriber for structured logging.
///
/// - Debug builds: pretty-printed human-readable output
/// - Release builds: JSON-formatted output for log aggregation
///
/// The filter comes from the `RUST_LOG` environment variable, falling
/// back to [`DEFAULT_DIRECTIVE`]. The engine is a library, so this
/// never panics if the embedding process already installed a
/// subscriber; the existing one wins.
pub fn init_tracing() {
    init_tracing_with(DEFAULT_DIRECTIVE);
}

/// Like [`init_tracing`] but with an explicit fallback directive, for
/// hosts that want a different default verbosity than the engine's.
pub fn init_tracing_with(default_directive: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    if cfg!(debug_assertions) {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init();
    }
}
