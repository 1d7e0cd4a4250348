//! SecureChat CLI
//!
//! Runs a two-party conversation against an in-process directory and
//! inspects stored or received records.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use securechat_core::config::load_config;
use securechat_core::tracing_init::{default_filter, init_tracing};
use securechat_core::{Config, JsonFileBackend, UserDataStore};
use securechat_crypto::{CardDirectory, CardValidator, InMemoryDirectory, SecureChat, classify};

#[derive(Parser, Debug)]
#[command(name = "securechat")]
#[command(version, about = "PFS secure chat demo", long_about = None)]
struct Cli {
    /// Explicit config file (JSON), layered over the global one
    #[arg(short, long, env = "SECURECHAT_CONFIG")]
    config: Option<PathBuf>,

    /// Emit JSON log lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open a session between two identities and exchange messages
    Demo {
        #[arg(long, default_value = "alice")]
        initiator: String,
        #[arg(long, default_value = "bob")]
        responder: String,
        /// Messages sent in each direction after the handshake
        #[arg(short, long, default_value_t = 3)]
        rounds: u32,
    },
    /// Print the shape of a JSON record
    Classify {
        /// Record text; read from stdin when absent
        record: Option<String>,
    },
    /// Print the resolved configuration
    Config,
}

fn open_store(config: &Config, identity: &str) -> anyhow::Result<Arc<UserDataStore>> {
    let store = match &config.storage.path {
        Some(dir) => {
            // The in-process directory starts empty, so a store from an earlier
            // run would reference cards it never saw.
            let path = dir.join(format!("{identity}.json"));
            if path.exists() {
                std::fs::remove_file(&path)
                    .with_context(|| format!("removing stale store {}", path.display()))?;
            }
            UserDataStore::open(Box::new(JsonFileBackend::new(&path)))
                .with_context(|| format!("opening store {}", path.display()))?
        }
        None => UserDataStore::new(),
    };
    Ok(Arc::new(store))
}

fn open_chat(
    config: &Config,
    identity: &str,
    directory: &Arc<InMemoryDirectory>,
) -> anyhow::Result<SecureChat> {
    let (service_id, service_key) = directory.service_verifier();
    let chat = SecureChat::new(
        config.clone(),
        identity,
        Arc::clone(directory) as Arc<dyn CardDirectory>,
        open_store(config, identity)?,
    )?
    .with_validator(CardValidator::new().with_verifier(service_id, &service_key));
    chat.bootstrap()?;
    let rotation = chat.rotate_keys()?;
    info!(
        identity,
        long_term = ?rotation.long_term_card_id,
        one_time = rotation.one_time_cards_published,
        "Keys ready"
    );
    Ok(chat)
}

#[allow(clippy::print_stdout)]
fn run_demo(config: &Config, initiator: &str, responder: &str, rounds: u32) -> anyhow::Result<()> {
    let directory = Arc::new(InMemoryDirectory::default());
    let first = open_chat(config, initiator, &directory)?;
    let second = open_chat(config, responder, &directory)?;

    let wire = first.encrypt(responder, format!("hello {responder}").as_bytes())?;
    println!("{initiator} -> {responder}: {wire}");
    let text = second.decrypt(initiator, &wire)?;
    println!("{responder} read: {}", String::from_utf8_lossy(&text));

    for round in 1..=rounds {
        let reply = second.encrypt(initiator, format!("reply {round}").as_bytes())?;
        let text = first.decrypt(responder, &reply)?;
        println!("{initiator} read: {}", String::from_utf8_lossy(&text));

        let next = first.encrypt(responder, format!("message {round}").as_bytes())?;
        let text = second.decrypt(initiator, &next)?;
        println!("{responder} read: {}", String::from_utf8_lossy(&text));
    }

    for (chat, remote) in [(&first, responder), (&second, initiator)] {
        if let Some(summary) = chat.active_session(remote)? {
            println!(
                "{}: session {} phase={:?} sent={} received={}",
                chat.identity(),
                summary.session_id,
                summary.phase,
                summary.sent_count,
                summary.received_count
            );
        }
    }
    Ok(())
}

#[allow(clippy::print_stdout)]
fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    init_tracing(&default_filter(&config.log_level), cli.log_json)?;
    info!(version = env!("CARGO_PKG_VERSION"), "Starting securechat");

    match cli.command {
        Command::Demo {
            initiator,
            responder,
            rounds,
        } => run_demo(&config, &initiator, &responder, rounds),
        Command::Classify { record } => {
            let text = match record {
                Some(text) => text,
                None => std::io::read_to_string(std::io::stdin())?,
            };
            let value: serde_json::Value =
                serde_json::from_str(&text).context("record is not JSON")?;
            println!("{:?}", classify(&value));
            Ok(())
        }
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
