//! Service configuration loaded from environment variables.
//!
//! Every setting has a default so an embedding application can start with
//! zero configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Synchronization service configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Explicit SQLite database path.
    /// Env: `CONCORD_DB_PATH`
    /// Default: `None` (platform data directory).
    pub db_path: Option<PathBuf>,

    /// Name of the thread delivering events to listeners.
    /// Env: `CONCORD_EVENT_THREAD`
    /// Default: `concord-events`
    pub event_thread_name: String,

    /// Listener invocations slower than this are logged.
    /// Env: `CONCORD_SLOW_LISTENER_MS`
    /// Default: `250`
    pub slow_listener_threshold: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            event_thread_name: "concord-events".to_string(),
            slow_listener_threshold: Duration::from_millis(250),
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(path) = lookup("CONCORD_DB_PATH") {
            if path.trim().is_empty() {
                tracing::warn!("Empty CONCORD_DB_PATH, using the platform data directory");
            } else {
                config.db_path = Some(PathBuf::from(path));
            }
        }

        if let Some(name) = lookup("CONCORD_EVENT_THREAD") {
            if name.trim().is_empty() {
                tracing::warn!("Empty CONCORD_EVENT_THREAD, using default");
            } else {
                config.event_thread_name = name;
            }
        }

        if let Some(ms) = lookup("CONCORD_SLOW_LISTENER_MS") {
            match ms.parse::<u64>() {
                Ok(ms) => config.slow_listener_threshold = Duration::from_millis(ms),
                Err(e) => {
                    tracing::warn!(
                        value = %ms,
                        error = %e,
                        "Invalid CONCORD_SLOW_LISTENER_MS, using default"
                    );
                }
            }
        }

        config
    }
}
