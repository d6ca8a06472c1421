use chrono::Utc;
use rusqlite::params;

use kirc_shared::types::ChannelName;

use crate::database::{column_err, parse_timestamp, Database};
use crate::error::Result;
use crate::models::JoinedChannel;

impl Database {
    /// Remember that this node is in `name`. Joining again keeps the first timestamp.
    pub fn save_channel(&self, name: &ChannelName) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO channels (name, joined_at) VALUES (?1, ?2)",
            params![name.as_str(), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn remove_channel(&self, name: &ChannelName) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM channels WHERE name = ?1", params![name.as_str()])?;
        Ok(affected > 0)
    }

    pub fn list_joined_channels(&self) -> Result<Vec<JoinedChannel>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT name, joined_at FROM channels ORDER BY joined_at, name")?;
        let rows = stmt.query_map([], |row| {
            let name: String = row.get(0)?;
            let joined_at: String = row.get(1)?;
            Ok(JoinedChannel {
                name: ChannelName::new(name).map_err(|e| column_err(0, e))?,
                joined_at: parse_timestamp(1, &joined_at)?,
            })
        })?;

        let mut channels = Vec::new();
        for row in rows {
            channels.push(row?);
        }
        Ok(channels)
    }
}
