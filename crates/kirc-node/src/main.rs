//! # kirc
//!
//! Command-line front end of a K-IRC actor.
//!
//! - **identity**: create or show the local keypair
//! - **invite**: build a bundle for a peer, or accept one from a peer
//! - **contacts**: list the peers learned through invites
//! - **simulate**: run leader election, relay, kick and failover in-process

mod config;
mod simulate;

use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use kirc_core::handshake;
use kirc_shared::identity::{generate_identity, Identity, PublicKey};
use kirc_shared::invite::InviteBundle;
use kirc_shared::types::Username;
use kirc_store::Database;

use crate::config::NodeConfig;
use crate::simulate::Simulation;

#[derive(Parser)]
#[command(name = "kirc", about = "Leader-relayed end-to-end encrypted channels", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Debug logging for every crate
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the local identity
    Identity {
        #[command(subcommand)]
        action: IdentityAction,
    },
    /// Exchange invite bundles with a peer
    Invite {
        #[command(subcommand)]
        action: InviteAction,
    },
    /// List known contacts
    Contacts,
    /// Run a three-actor channel scenario in memory
    Simulate {
        #[arg(long, default_value = "#NET_RUNNERS")]
        channel: String,
        /// Lease TTL in milliseconds
        #[arg(long, default_value_t = 900)]
        lease_ms: u64,
    },
}

#[derive(Subcommand)]
enum IdentityAction {
    /// Generate the identity file (loads the existing one unless --force)
    Init {
        /// Defaults to KIRC_USERNAME
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        display_name: Option<String>,
        #[arg(long)]
        force: bool,
    },
    /// Print username and public key
    Show,
}

#[derive(Subcommand)]
enum InviteAction {
    /// Seal an invite to the peer's public key (128 hex chars)
    Create { peer: String },
    /// Open a bundle addressed to us and store the sender as a contact
    Accept { bundle: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    let fallback = if cli.verbose {
        "debug"
    } else {
        "info,kirc_core=debug,kirc_node=debug"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
        )
        .with_writer(std::io::stderr)
        .init();

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = NodeConfig::from_env();

    // -----------------------------------------------------------------------
    // 3. Run the command
    // -----------------------------------------------------------------------
    match cli.command {
        Commands::Identity { action } => match action {
            IdentityAction::Init {
                username,
                display_name,
                force,
            } => init_identity(&config, username, display_name, force),
            IdentityAction::Show => {
                let identity = load_identity(&config)?;
                println!("username:     {}", identity.username());
                println!("display name: {}", identity.display_name());
                println!("public key:   {}", identity.public_key());
                Ok(())
            }
        },
        Commands::Invite { action } => match action {
            InviteAction::Create { peer } => {
                let identity = load_identity(&config)?;
                let peer = PublicKey::from_hex(&peer).context("invalid peer public key")?;
                let bundle = handshake::create_invite(&peer, &identity, &config.service_config())?;
                println!("{bundle}");
                Ok(())
            }
            InviteAction::Accept { bundle } => {
                let identity = load_identity(&config)?;
                let db = Database::open(&config.data_dir)?;
                let bundle = InviteBundle::from(bundle.trim().to_string());
                let (contact, created) = handshake::accept_invite(&db, &identity, &bundle)?;
                let verb = if created { "Added" } else { "Updated" };
                println!(
                    "{verb} contact {} ({}) at {}",
                    contact.username, contact.display_name, contact.service.bootstrap_servers
                );
                Ok(())
            }
        },
        Commands::Contacts => {
            let db = Database::open(&config.data_dir)?;
            let contacts = db.list_contacts()?;
            if contacts.is_empty() {
                println!("No contacts yet");
            }
            for contact in contacts {
                println!(
                    "{:<24} {:<24} {}",
                    contact.username, contact.display_name, contact.service.bootstrap_servers
                );
            }
            Ok(())
        }
        Commands::Simulate { channel, lease_ms } => {
            info!(channel = %channel, lease_ms, "Starting in-process simulation");
            Simulation::new(&channel, Duration::from_millis(lease_ms), &config.core)?
                .run()
                .await
        }
    }
}

fn init_identity(
    config: &NodeConfig,
    username: Option<String>,
    display_name: Option<String>,
    force: bool,
) -> anyhow::Result<()> {
    let Some(name) = username.or_else(|| config.username.clone()) else {
        bail!("no username given: pass --username or set KIRC_USERNAME");
    };
    let username = Username::new(name)?;
    let display_name = display_name
        .or_else(|| config.display_name.clone())
        .unwrap_or_else(|| username.to_string());

    let path = config.identity_path();
    let (identity, created) = generate_identity(&path, &username, &display_name, force)?;
    if created {
        println!("Created identity for {}", identity.username());
    } else {
        println!("Identity already exists for {}", identity.username());
    }
    println!("public key: {}", identity.public_key());
    Ok(())
}

fn load_identity(config: &NodeConfig) -> anyhow::Result<Identity> {
    let path = config.identity_path();
    Identity::load(&path).with_context(|| {
        format!(
            "no identity at {} (run `kirc identity init` first)",
            path.display()
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_in(dir: &std::path::Path) -> NodeConfig {
        NodeConfig {
            data_dir: dir.to_path_buf(),
            ..NodeConfig::default()
        }
    }

    #[test]
    fn init_then_load_identity() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        assert!(load_identity(&config).is_err());

        init_identity(&config, Some("alice".into()), None, false).unwrap();
        let identity = load_identity(&config).unwrap();
        assert_eq!(identity.username().as_str(), "alice");
        assert_eq!(identity.display_name(), "alice");

        // A second init keeps the existing keypair
        init_identity(&config, Some("alice".into()), Some("Alice".into()), false).unwrap();
        let again = load_identity(&config).unwrap();
        assert_eq!(again.public_key(), identity.public_key());
    }

    #[test]
    fn init_without_username_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        assert!(init_identity(&config, None, None, false).is_err());
        assert!(!config.identity_path().exists());
    }
}
