use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use kirc_shared::types::{ChannelName, KeyId};

use crate::database::{column_err, parse_timestamp, Database};
use crate::error::Result;
use crate::models::StoredChannelKey;

const SELECT_KEY: &str =
    "SELECT channel, key_id, encrypted_key, is_current, created_at FROM channel_keys";

impl Database {
    /// Retain an epoch. With `current` set, every other epoch of the channel
    /// loses its current flag in the same transaction.
    ///
    /// Storing an epoch twice is a no-op apart from the current flag.
    pub fn put_channel_key(
        &self,
        channel: &ChannelName,
        key_id: &KeyId,
        encrypted_key: &[u8],
        current: bool,
    ) -> Result<()> {
        let tx = self.conn().unchecked_transaction()?;
        if current {
            tx.execute(
                "UPDATE channel_keys SET is_current = 0 WHERE channel = ?1",
                params![channel.as_str()],
            )?;
        }
        tx.execute(
            "INSERT INTO channel_keys (channel, key_id, encrypted_key, is_current, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(channel, key_id) DO UPDATE SET
                 is_current = MAX(is_current, excluded.is_current)",
            params![
                channel.as_str(),
                key_id.as_str(),
                encrypted_key,
                current,
                Utc::now().to_rfc3339(),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn current_key_id(&self, channel: &ChannelName) -> Result<Option<KeyId>> {
        let key_id: Option<String> = self
            .conn()
            .query_row(
                "SELECT key_id FROM channel_keys WHERE channel = ?1 AND is_current = 1",
                params![channel.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(key_id.map(KeyId::from_string))
    }

    pub fn list_channel_keys(&self, channel: &ChannelName) -> Result<Vec<StoredChannelKey>> {
        let mut stmt = self
            .conn()
            .prepare(&format!("{SELECT_KEY} WHERE channel = ?1 ORDER BY created_at"))?;
        let rows = stmt.query_map(params![channel.as_str()], row_to_key)?;
        collect(rows)
    }

    /// Every retained epoch of every channel, for restoring the key ring.
    pub fn list_all_channel_keys(&self) -> Result<Vec<StoredChannelKey>> {
        let mut stmt = self
            .conn()
            .prepare(&format!("{SELECT_KEY} ORDER BY channel, created_at"))?;
        let rows = stmt.query_map([], row_to_key)?;
        collect(rows)
    }
}

fn collect(
    rows: impl Iterator<Item = rusqlite::Result<StoredChannelKey>>,
) -> Result<Vec<StoredChannelKey>> {
    let mut keys = Vec::new();
    for row in rows {
        keys.push(row?);
    }
    Ok(keys)
}

fn row_to_key(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredChannelKey> {
    let channel: String = row.get(0)?;
    let key_id: String = row.get(1)?;
    let encrypted_key: Vec<u8> = row.get(2)?;
    let is_current: bool = row.get(3)?;
    let created_at: String = row.get(4)?;

    Ok(StoredChannelKey {
        channel: ChannelName::new(channel).map_err(|e| column_err(0, e))?,
        key_id: KeyId::from_string(key_id),
        encrypted_key,
        is_current,
        created_at: parse_timestamp(4, &created_at)?,
    })
}
