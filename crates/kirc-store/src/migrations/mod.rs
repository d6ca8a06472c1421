//! Schema migrations, applied in order and tracked in `PRAGMA user_version`.

pub mod v001_initial;
pub mod v002_contact_blocking;

use rusqlite::Connection;

use crate::error::{Result, StoreError};

type Migration = fn(&Connection) -> rusqlite::Result<()>;

const MIGRATIONS: &[(u32, &str, Migration)] = &[
    (1, "v001_initial", v001_initial::up),
    (2, "v002_contact_blocking", v002_contact_blocking::up),
];

/// Highest schema version this build knows how to use.
pub const CURRENT_VERSION: u32 = 2;

pub fn run_migrations(conn: &Connection) -> Result<()> {
    let found: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if found > CURRENT_VERSION {
        return Err(StoreError::NewerSchema {
            found,
            supported: CURRENT_VERSION,
        });
    }

    for (version, name, up) in MIGRATIONS.iter().filter(|(v, _, _)| *v > found) {
        tracing::info!(version, name, "applying migration");
        up(conn).map_err(|e| StoreError::Migration(format!("{name}: {e}")))?;
        conn.pragma_update(None, "user_version", version)?;
    }
    Ok(())
}
