//! Schema versions, tracked in the `user_version` pragma.
//!
//! Each step runs in its own transaction together with the version bump, so
//! a failed step leaves the previous version intact.

pub mod v001_initial;

use rusqlite::Connection;

use crate::error::{Result, StoreError};

type Step = fn(&Connection) -> rusqlite::Result<()>;

/// `(version, name, step)` in ascending version order.
const STEPS: &[(u32, &str, Step)] = &[(1, "v001_initial", v001_initial::up)];

pub const CURRENT_VERSION: u32 = 1;

pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if current > CURRENT_VERSION {
        return Err(StoreError::Migration(format!(
            "database schema v{current} is newer than supported v{CURRENT_VERSION}"
        )));
    }

    for &(version, name, step) in STEPS.iter().filter(|(v, _, _)| *v > current) {
        tracing::info!(from = current, to = version, name, "applying migration");

        let tx = conn.unchecked_transaction()?;
        step(&tx).map_err(|e| StoreError::Migration(format!("{name}: {e}")))?;
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;
    }

    Ok(())
}
