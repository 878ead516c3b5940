//! The database process surface: configuration, opening and closing a
//! store, and the broker pool callers go through.

mod config;
mod logging;
mod pool;
mod store;

pub use config::{ConfigError, JournalConfig, LockConfig, PoolConfig, StoreConfig};
pub use logging::init_logging;
pub use pool::{Broker, BrokerPool, Identity, PoolStats};
pub use store::{Store, CLEAN_SHUTDOWN_MARKER, JOURNAL_DIR_NAME, PAGE_FILE_NAME};
