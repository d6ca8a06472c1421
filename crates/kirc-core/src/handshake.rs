//! Trust bootstrap between two actors.
//!
//! Each direction is a separate step: accepting a peer's bundle makes the
//! peer our contact, it does not make us theirs.

use tracing::info;

use kirc_shared::identity::{Identity, PublicKey};
use kirc_shared::invite::{self, InviteBundle, ServiceConfig};
use kirc_store::{Contact, Database};

use crate::error::CoreError;

/// Build a bundle only `peer` can open.
pub fn create_invite(
    peer: &PublicKey,
    identity: &Identity,
    service: &ServiceConfig,
) -> Result<InviteBundle, CoreError> {
    let bundle = invite::create_invite(peer, identity, service)?;
    info!(len = bundle.as_str().len(), "Invite created");
    Ok(bundle)
}

/// Open a bundle sealed to us and upsert the sender as a contact.
///
/// Returns the stored contact and whether it was new. A known username has its
/// public key and addressing replaced; the original `created_at` is kept.
pub fn accept_invite(
    db: &Database,
    identity: &Identity,
    bundle: &InviteBundle,
) -> Result<(Contact, bool), CoreError> {
    let payload = invite::accept_invite(bundle, identity)?;
    let username = payload.username.clone();
    let created = db.upsert_contact(&Contact::from(payload))?;
    let contact = db
        .get_contact(&username)?
        .ok_or_else(|| CoreError::UnknownContact(username.clone()))?;

    info!(contact = %contact.username, created, "Invite accepted");
    Ok((contact, created))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kirc_shared::invite::InviteError;
    use kirc_shared::types::Username;

    fn service(servers: &str) -> ServiceConfig {
        ServiceConfig {
            bootstrap_servers: servers.to_string(),
            topics: vec!["data-in".to_string(), "rpc-in".to_string()],
            cache_uri: None,
        }
    }

    fn identity(name: &str) -> Identity {
        Identity::generate(Username::new(name).unwrap(), name.to_uppercase())
    }

    #[test]
    fn accept_stores_contact() {
        let alice = identity("alice");
        let bob = identity("bob");
        let db = Database::open_in_memory().unwrap();

        let bundle = create_invite(&bob.public_key(), &alice, &service("kafka:9092")).unwrap();
        let (contact, created) = accept_invite(&db, &bob, &bundle).unwrap();

        assert!(created);
        assert_eq!(contact.username, *alice.username());
        assert_eq!(contact.public_key, alice.public_key());
        assert_eq!(contact.service.bootstrap_servers, "kafka:9092");
    }

    #[test]
    fn reaccept_updates_instead_of_duplicating() {
        let alice = identity("alice");
        let bob = identity("bob");
        let db = Database::open_in_memory().unwrap();

        let first = create_invite(&bob.public_key(), &alice, &service("old:9092")).unwrap();
        accept_invite(&db, &bob, &first).unwrap();

        // Alice re-keys and moves her broker
        let rekeyed = Identity::generate(alice.username().clone(), "ALICE");
        let second = create_invite(&bob.public_key(), &rekeyed, &service("new:9092")).unwrap();
        let (contact, created) = accept_invite(&db, &bob, &second).unwrap();

        assert!(!created);
        assert_eq!(contact.public_key, rekeyed.public_key());
        assert_eq!(contact.service.bootstrap_servers, "new:9092");
        assert_eq!(db.list_contacts().unwrap().len(), 1);
    }

    #[test]
    fn wrong_recipient_is_a_decryption_error() {
        let alice = identity("alice");
        let bob = identity("bob");
        let carol = identity("carol");
        let db = Database::open_in_memory().unwrap();

        let bundle = create_invite(&bob.public_key(), &alice, &service("kafka:9092")).unwrap();
        let err = accept_invite(&db, &carol, &bundle).unwrap_err();

        assert!(matches!(err, CoreError::Invite(InviteError::Decryption)));
        assert!(db.list_contacts().unwrap().is_empty());
    }
}
