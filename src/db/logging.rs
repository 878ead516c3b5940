use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Installs a global `tracing` subscriber writing to stderr.
///
/// `filter` uses `EnvFilter` syntax (`info`, `arbol=debug,warn`); `RUST_LOG`
/// wins when set. Later calls, or a subscriber installed by the embedding
/// program, leave the existing one in place.
pub fn init_logging(filter: &str) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .try_init();
    });
}
