use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use kirc_shared::identity::PublicKey;
use kirc_shared::types::Username;

use crate::database::{column_err, parse_timestamp, Database};
use crate::error::Result;
use crate::models::Contact;

const SELECT_CONTACT: &str = "SELECT username, display_name, public_key, service, is_blocked,
            created_at, updated_at FROM contacts";

impl Database {
    /// Insert or refresh a contact. Returns `true` when the username was new.
    ///
    /// Re-accepting an invite from a known username replaces its key and
    /// addressing but keeps the original `created_at` and the block flag.
    pub fn upsert_contact(&self, contact: &Contact) -> Result<bool> {
        let existed = self.get_contact(&contact.username)?.is_some();
        self.conn().execute(
            "INSERT INTO contacts (username, display_name, public_key, service, is_blocked,
                                   created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(username) DO UPDATE SET
                 display_name = excluded.display_name,
                 public_key   = excluded.public_key,
                 service      = excluded.service,
                 updated_at   = excluded.updated_at",
            params![
                contact.username.as_str(),
                contact.display_name,
                contact.public_key.to_hex(),
                serde_json::to_string(&contact.service)?,
                contact.is_blocked,
                contact.created_at.to_rfc3339(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(!existed)
    }

    pub fn get_contact(&self, username: &Username) -> Result<Option<Contact>> {
        let contact = self
            .conn()
            .query_row(
                &format!("{SELECT_CONTACT} WHERE username = ?1"),
                params![username.as_str()],
                row_to_contact,
            )
            .optional()?;
        Ok(contact)
    }

    pub fn list_contacts(&self) -> Result<Vec<Contact>> {
        let mut stmt = self
            .conn()
            .prepare(&format!("{SELECT_CONTACT} ORDER BY username"))?;
        let rows = stmt.query_map([], row_to_contact)?;

        let mut contacts = Vec::new();
        for row in rows {
            contacts.push(row?);
        }
        Ok(contacts)
    }

    /// Returns `false` when there is no such contact.
    pub fn set_blocked(&self, username: &Username, blocked: bool) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE contacts SET is_blocked = ?2, updated_at = ?3 WHERE username = ?1",
            params![username.as_str(), blocked, Utc::now().to_rfc3339()],
        )?;
        Ok(affected > 0)
    }

    /// Unknown usernames are not blocked.
    pub fn is_blocked(&self, username: &Username) -> Result<bool> {
        let blocked = self
            .conn()
            .query_row(
                "SELECT is_blocked FROM contacts WHERE username = ?1",
                params![username.as_str()],
                |row| row.get::<_, bool>(0),
            )
            .optional()?;
        Ok(blocked.unwrap_or(false))
    }

    pub fn delete_contact(&self, username: &Username) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM contacts WHERE username = ?1",
            params![username.as_str()],
        )?;
        Ok(affected > 0)
    }
}

fn row_to_contact(row: &rusqlite::Row<'_>) -> rusqlite::Result<Contact> {
    let username: String = row.get(0)?;
    let display_name: String = row.get(1)?;
    let public_key: String = row.get(2)?;
    let service: String = row.get(3)?;
    let is_blocked: bool = row.get(4)?;
    let created_at: String = row.get(5)?;
    let updated_at: String = row.get(6)?;

    Ok(Contact {
        username: Username::new(username).map_err(|e| column_err(0, e))?,
        display_name,
        public_key: PublicKey::from_hex(&public_key).map_err(|e| column_err(2, e))?,
        service: serde_json::from_str(&service).map_err(|e| column_err(3, e))?,
        is_blocked,
        created_at: parse_timestamp(5, &created_at)?,
        updated_at: parse_timestamp(6, &updated_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kirc_shared::identity::Identity;
    use kirc_shared::invite::ServiceConfig;

    fn contact(name: &str, bootstrap: &str) -> Contact {
        let identity = Identity::generate(Username::new(name).unwrap(), name);
        let now = Utc::now();
        Contact {
            username: identity.username().clone(),
            display_name: name.to_uppercase(),
            public_key: identity.public_key(),
            service: ServiceConfig {
                bootstrap_servers: bootstrap.to_string(),
                topics: vec!["data-in".to_string()],
                cache_uri: None,
            },
            is_blocked: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn upsert_and_get() {
        let db = Database::open_in_memory().unwrap();
        let alice = contact("alice", "kafka-a:9092");

        assert!(db.upsert_contact(&alice).unwrap());
        let loaded = db.get_contact(&alice.username).unwrap().expect("stored");
        assert_eq!(loaded.public_key, alice.public_key);
        assert_eq!(loaded.service, alice.service);

        let missing = Username::new("nobody").unwrap();
        assert!(db.get_contact(&missing).unwrap().is_none());
    }

    #[test]
    fn reaccepting_updates_instead_of_duplicating() {
        let db = Database::open_in_memory().unwrap();
        let first = contact("bob", "kafka-old:9092");
        let second = contact("bob", "kafka-new:9092");
        assert_ne!(first.public_key, second.public_key);

        assert!(db.upsert_contact(&first).unwrap());
        assert!(!db.upsert_contact(&second).unwrap());

        let contacts = db.list_contacts().unwrap();
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].public_key, second.public_key);
        assert_eq!(contacts[0].service.bootstrap_servers, "kafka-new:9092");
    }

    #[test]
    fn blocking_survives_a_new_invite() {
        let db = Database::open_in_memory().unwrap();
        let mallory = contact("mallory", "kafka:9092");
        db.upsert_contact(&mallory).unwrap();
        assert!(!db.is_blocked(&mallory.username).unwrap());

        assert!(db.set_blocked(&mallory.username, true).unwrap());
        db.upsert_contact(&contact("mallory", "kafka-new:9092")).unwrap();
        assert!(db.is_blocked(&mallory.username).unwrap());
        assert!(db.get_contact(&mallory.username).unwrap().unwrap().is_blocked);

        assert!(db.set_blocked(&mallory.username, false).unwrap());
        assert!(!db.is_blocked(&mallory.username).unwrap());

        let stranger = Username::new("stranger").unwrap();
        assert!(!db.set_blocked(&stranger, true).unwrap());
        assert!(!db.is_blocked(&stranger).unwrap());
    }

    #[test]
    fn delete_contact() {
        let db = Database::open_in_memory().unwrap();
        let carol = contact("carol", "kafka:9092");
        db.upsert_contact(&carol).unwrap();

        assert!(db.delete_contact(&carol.username).unwrap());
        assert!(!db.delete_contact(&carol.username).unwrap());
        assert!(db.list_contacts().unwrap().is_empty());
    }
}
