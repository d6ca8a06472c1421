//! v001 -- Initial schema: `contacts`, `channel_keys`, `channels`, `messages`.

use rusqlite::Connection;

const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Contacts (one row per remote username, upserted by the handshake)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS contacts (
    username     TEXT PRIMARY KEY NOT NULL,
    display_name TEXT NOT NULL DEFAULT '',
    public_key   TEXT NOT NULL,               -- 128 hex chars (x25519 || ed25519)
    service      TEXT NOT NULL,               -- JSON mailbox addressing
    created_at   TEXT NOT NULL,               -- RFC-3339
    updated_at   TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Channel key epochs, sealed to the local identity
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS channel_keys (
    channel       TEXT NOT NULL,
    key_id        TEXT NOT NULL,
    encrypted_key BLOB NOT NULL,
    is_current    INTEGER NOT NULL DEFAULT 0, -- boolean 0/1
    created_at    TEXT NOT NULL,

    PRIMARY KEY (channel, key_id)
);

-- ----------------------------------------------------------------
-- Channels this node has joined (rejoined on start)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS channels (
    name      TEXT PRIMARY KEY NOT NULL,
    joined_at TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Message history (ciphertext only)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    message_id TEXT PRIMARY KEY NOT NULL,     -- UUID v4, dedup key
    channel    TEXT,
    sender     TEXT NOT NULL,
    recipient  TEXT,
    kind       TEXT NOT NULL,                 -- 'chat' | 'direct'
    key_id     TEXT,
    ciphertext BLOB NOT NULL,
    timestamp  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_channel_ts
    ON messages(channel, timestamp DESC);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
