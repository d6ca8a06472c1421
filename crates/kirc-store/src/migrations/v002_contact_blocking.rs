//! v002 -- Contacts can be blocked.

use rusqlite::Connection;

const UP_SQL: &str = r#"
-- Blocked contacts get no direct messages, no channel keys, no presence
ALTER TABLE contacts ADD COLUMN is_blocked INTEGER NOT NULL DEFAULT 0;
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
