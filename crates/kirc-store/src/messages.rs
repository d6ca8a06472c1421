use rusqlite::params;
use uuid::Uuid;

use kirc_shared::protocol::{Envelope, MessageKind};
use kirc_shared::types::{ChannelName, KeyId, MessageId, Username};

use crate::database::{column_err, parse_timestamp, Database};
use crate::error::Result;
use crate::models::StoredMessage;

const SELECT_MESSAGE: &str =
    "SELECT message_id, channel, sender, recipient, kind, key_id, ciphertext, timestamp
     FROM messages";

impl Database {
    /// Append an envelope to history. Returns `false` if the message id was
    /// already stored (broker redelivery).
    pub fn append_message(&self, envelope: &Envelope) -> Result<bool> {
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO messages
                 (message_id, channel, sender, recipient, kind, key_id, ciphertext, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                envelope.message_id.to_string(),
                envelope.channel.as_ref().map(ChannelName::as_str),
                envelope.sender.as_str(),
                envelope.recipient.as_ref().map(Username::as_str),
                kind_to_str(envelope.kind),
                envelope.key_id.as_ref().map(KeyId::as_str),
                envelope.ciphertext,
                envelope.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(affected > 0)
    }

    /// The newest `limit` messages of a channel, oldest first.
    pub fn recent_messages(&self, channel: &ChannelName, limit: u32) -> Result<Vec<StoredMessage>> {
        let mut stmt = self.conn().prepare(&format!(
            "{SELECT_MESSAGE} WHERE channel = ?1 ORDER BY timestamp DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![channel.as_str(), limit], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        messages.reverse();
        Ok(messages)
    }

    /// The newest `limit` direct messages exchanged with `peer`, oldest first.
    pub fn direct_messages(&self, peer: &Username, limit: u32) -> Result<Vec<StoredMessage>> {
        let mut stmt = self.conn().prepare(&format!(
            "{SELECT_MESSAGE}
             WHERE kind = 'direct' AND (sender = ?1 OR recipient = ?1)
             ORDER BY timestamp DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![peer.as_str(), limit], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        messages.reverse();
        Ok(messages)
    }
}

fn kind_to_str(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::Chat => "chat",
        MessageKind::Direct => "direct",
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    let message_id: String = row.get(0)?;
    let channel: Option<String> = row.get(1)?;
    let sender: String = row.get(2)?;
    let recipient: Option<String> = row.get(3)?;
    let kind: String = row.get(4)?;
    let key_id: Option<String> = row.get(5)?;
    let ciphertext: Vec<u8> = row.get(6)?;
    let timestamp: String = row.get(7)?;

    let kind = match kind.as_str() {
        "chat" => MessageKind::Chat,
        "direct" => MessageKind::Direct,
        other => {
            return Err(rusqlite::Error::InvalidColumnType(
                4,
                format!("kind '{other}'"),
                rusqlite::types::Type::Text,
            ))
        }
    };

    Ok(StoredMessage {
        message_id: MessageId(Uuid::parse_str(&message_id).map_err(|e| column_err(0, e))?),
        channel: channel
            .map(ChannelName::new)
            .transpose()
            .map_err(|e| column_err(1, e))?,
        sender: Username::new(sender).map_err(|e| column_err(2, e))?,
        recipient: recipient
            .map(Username::new)
            .transpose()
            .map_err(|e| column_err(3, e))?,
        kind,
        key_id: key_id.map(KeyId::from_string),
        ciphertext,
        timestamp: parse_timestamp(7, &timestamp)?,
    })
}
