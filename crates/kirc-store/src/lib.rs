//! # kirc-store
//!
//! Local SQLite storage for a K-IRC actor: contacts learned through the
//! handshake, every channel key epoch the node has been given (sealed to the
//! local identity), the channels it has joined, and ciphertext-only message
//! history. The crate exposes a synchronous `Database` handle with typed
//! helpers per table.

pub mod channel_keys;
pub mod channels;
pub mod contacts;
pub mod database;
pub mod messages;
pub mod migrations;
pub mod models;

mod error;

pub use database::Database;
pub use error::StoreError;
pub use models::*;
