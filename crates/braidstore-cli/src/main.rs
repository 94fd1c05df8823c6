//! braidstore CLI
//!
//! Thin wrapper around braidstore-core for command-line usage.
//!
//! ## Usage
//!
//! ```bash
//! # Show store information
//! braidstore info
//!
//! # Write and read keys
//! braidstore set greeting "hello"
//! braidstore set profile '{"name":"ada"}' --json
//! braidstore get greeting
//! braidstore del greeting
//!
//! # Range queries
//! braidstore query --prefix user/ --limit 10
//!
//! # Topology
//! braidstore keys
//! braidstore writer add <hex key>
//! braidstore writer remove <hex key> --destroy
//! braidstore rebuild
//!
//! # Replicate with peers
//! braidstore serve --peer <endpoint id>
//! ```

mod kv;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use braidstore_core::{
    AddOptions, IrohSwarm, LogKey, ProtocolSet, RangeOptions, RemoveOptions, Store, StoreConfig,
    StoreEvent,
};
use clap::{Parser, Subcommand};

use kv::{display_value, KvOp, KvProtocol};

/// braidstore - replicated key-value store on multi-writer logs
#[derive(Parser)]
#[command(name = "braidstore")]
#[command(version = "0.1.0")]
#[command(about = "braidstore - replicated key-value store on multi-writer logs")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Data directory (default: ~/.braidstore/data)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Load store configuration from a JSON file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Store name; peers replicate stores with the same name
    #[arg(short, long, global = true, default_value = "braidstore")]
    name: String,

    /// Partition to operate on
    #[arg(short, long, global = true, default_value = braidstore_core::DEFAULT_PARTITION)]
    partition: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show store information
    Info,

    /// Set a key
    Set {
        /// Key to write
        key: String,
        /// Value to store
        value: String,
        /// Parse the value as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete a key
    Del {
        /// Key to delete
        key: String,
    },

    /// Read a key
    Get {
        /// Key to read
        key: String,
    },

    /// List keys within a range
    Query {
        /// Only keys starting with this prefix
        #[arg(long)]
        prefix: Option<String>,
        /// Keys greater than or equal to this
        #[arg(long)]
        gte: Option<String>,
        /// Keys strictly less than this
        #[arg(long)]
        lt: Option<String>,
        /// Maximum number of entries
        #[arg(long)]
        limit: Option<usize>,
        /// Descending order
        #[arg(long)]
        reverse: bool,
        /// Stream every matching entry instead of stopping at the limit
        #[arg(long)]
        all: bool,
    },

    /// Show writer and index keys
    Keys,

    /// Writer management
    Writer {
        #[command(subcommand)]
        action: MemberAction,
    },

    /// Index management
    Index {
        #[command(subcommand)]
        action: MemberAction,
    },

    /// Clear the index and replay every writer log
    Rebuild,

    /// Replicate with peers until interrupted
    Serve {
        /// Endpoint id (hex) of a peer to dial
        #[arg(long)]
        peer: Vec<String>,
    },
}

#[derive(Subcommand)]
enum MemberAction {
    /// Attach a remote key
    Add {
        /// Hex-encoded key
        key: String,
        /// Hex-encoded 32-byte key the member's entries are sealed with
        #[arg(long)]
        encryption_key: Option<String>,
    },
    /// Freeze (or destroy) a remote key
    Remove {
        /// Hex-encoded key
        key: String,
        /// Detach permanently and prune stored entries
        #[arg(long)]
        destroy: bool,
    },
}

/// Set up logging based on verbosity level
fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".braidstore")
        .join("data")
}

/// Build the store configuration from flags and the optional config file
fn load_config(cli: &Cli, live: bool) -> Result<StoreConfig> {
    let mut config = match &cli.config {
        Some(path) => StoreConfig::from_file(path)
            .map_err(|e| anyhow::anyhow!("Failed to load config '{}': {}", path.display(), e))?,
        None => StoreConfig::new(&cli.name, default_data_dir()),
    };
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    Ok(config.with_live(live))
}

/// Parse a log key from hex
fn parse_key(s: &str) -> Result<LogKey> {
    LogKey::from_hex(s).map_err(|e| anyhow::anyhow!("Invalid key '{}': {}", s, e))
}

/// Parse a 32-byte encryption key from hex
fn parse_encryption_key(s: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(s).map_err(|e| anyhow::anyhow!("Invalid hex format: {}", e))?;
    if bytes.len() != 32 {
        anyhow::bail!("Encryption key must be 32 bytes (got {})", bytes.len());
    }
    let mut array = [0u8; 32];
    array.copy_from_slice(&bytes);
    Ok(array)
}

/// Parse a peer endpoint id from hex
fn parse_endpoint_id(s: &str) -> Result<iroh::PublicKey> {
    let bytes = hex::decode(s).map_err(|e| anyhow::anyhow!("Invalid hex format: {}", e))?;
    if bytes.len() != 32 {
        anyhow::bail!("Endpoint ID must be 32 bytes (got {})", bytes.len());
    }
    let mut array = [0u8; 32];
    array.copy_from_slice(&bytes);
    iroh::PublicKey::from_bytes(&array).map_err(|e| anyhow::anyhow!("Invalid public key: {}", e))
}

fn protocols() -> ProtocolSet {
    ProtocolSet::new().with(KvProtocol)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let live = matches!(cli.command, Commands::Serve { .. });
    let config = load_config(&cli, live)?;
    let partition = cli.partition.clone();
    let store = Store::open(config, protocols()).await?;

    match cli.command {
        Commands::Info => {
            println!("braidstore v0.1.0");
            println!();
            println!("Store: {}", store.config().name);
            println!("  Topic: {}", store.topic());
            println!("  Data directory: {}", store.data_dir().display());
            println!("  Private: {}", if store.config().private { "Yes" } else { "No" });
            println!();
            println!("Partitions ({}):", store.partitions().len());
            for name in store.partitions() {
                let keys = store.get_keys(&name)?;
                let entries = store.view(&name)?.len()?;
                println!("  {}", name);
                println!("    Writer: {}", keys.writer);
                println!("    Index: {}", keys.index);
                println!("    Remote writers: {}", keys.writers.len());
                println!("    Entries: {}", entries);
            }
        }

        Commands::Set { key, value, json } => {
            let op = if json {
                let value: serde_json::Value = serde_json::from_str(&value)
                    .map_err(|e| anyhow::anyhow!("Invalid JSON value: {}", e))?;
                KvOp::SetJson {
                    key: key.clone(),
                    value,
                }
            } else {
                KvOp::Set {
                    key: key.clone(),
                    value,
                }
            };
            let length = store.append(&partition, &op)?;
            println!("Set {}", key);
            println!("  Log length: {}", length);
        }

        Commands::Del { key } => {
            store.append(&partition, &KvOp::Del { key: key.clone() })?;
            println!("Deleted {}", key);
        }

        Commands::Get { key } => match store.get(&partition, &key)? {
            Some(value) => println!("{}", display_value(&value)),
            None => anyhow::bail!("Key not found: {}", key),
        },

        Commands::Query {
            prefix,
            gte,
            lt,
            limit,
            reverse,
            all,
        } => {
            let mut range = match prefix {
                Some(prefix) => RangeOptions::prefix(&prefix),
                None => RangeOptions::all(),
            };
            if let Some(gte) = gte {
                range = range.with_gte(gte);
            }
            if let Some(lt) = lt {
                range = range.with_lt(lt);
            }
            if let Some(limit) = limit {
                range = range.with_limit(limit);
            }
            if reverse {
                range = range.reversed();
            }

            let mut count = 0;
            if all {
                for entry in store.query_stream(&partition, range)? {
                    let (key, value) = entry?;
                    println!("{} = {}", key, display_value(&value));
                    count += 1;
                }
            } else {
                for (key, value) in store.query(&partition, &range)? {
                    println!("{} = {}", key, display_value(&value));
                    count += 1;
                }
            }
            if count == 0 {
                println!("No entries found.");
            }
        }

        Commands::Keys => {
            let keys = store.get_keys(&partition)?;
            println!("Partition: {}", partition);
            println!("  Writer: {}", keys.writer);
            println!("  Index: {}", keys.index);
            if keys.writers.is_empty() {
                println!("  Remote writers: none");
            } else {
                println!("  Remote writers ({}):", keys.writers.len());
                for (key, state) in &keys.writers {
                    println!("    {} [{}]", key, state);
                }
            }
            if !keys.indexes.is_empty() {
                println!("  Remote indexes ({}):", keys.indexes.len());
                for (key, state) in &keys.indexes {
                    println!("    {} [{}]", key, state);
                }
            }
        }

        Commands::Writer { action } => {
            handle_member(&store, &partition, action, true)?;
        }

        Commands::Index { action } => {
            handle_member(&store, &partition, action, false)?;
        }

        Commands::Rebuild => {
            let entries = store.rebuild(&partition)?;
            println!("Rebuilt {}", partition);
            println!("  Entries replayed: {}", entries);
        }

        Commands::Serve { peer } => {
            serve(&store, &peer).await?;
        }
    }

    store.close().await?;
    Ok(())
}

fn handle_member(store: &Store, partition: &str, action: MemberAction, writer: bool) -> Result<()> {
    let role = if writer { "writer" } else { "index" };
    match action {
        MemberAction::Add {
            key,
            encryption_key,
        } => {
            let key = parse_key(&key)?;
            let options = AddOptions {
                encryption_key: encryption_key.as_deref().map(parse_encryption_key).transpose()?,
            };
            if writer {
                store.add_writer(partition, key, options)?;
                store.update(partition)?;
            } else {
                store.add_index(partition, key, options)?;
            }
            println!("Added {} {}", role, key);
        }
        MemberAction::Remove { key, destroy } => {
            let key = parse_key(&key)?;
            let options = if destroy {
                RemoveOptions::destroy()
            } else {
                RemoveOptions::freeze()
            };
            if writer {
                store.remove_writer(partition, key, options)?;
            } else {
                store.remove_index(partition, key, options)?;
            }
            let verb = if destroy { "Destroyed" } else { "Froze" };
            println!("{} {} {}", verb, role, key);
            if destroy && writer {
                println!("Run `braidstore rebuild` to drop its operations from the index.");
            }
        }
    }
    Ok(())
}

async fn serve(store: &Store, peers: &[String]) -> Result<()> {
    println!("Starting braidstore...");
    println!();

    let swarm = Arc::new(IrohSwarm::bind(None).await?);
    store.connect(swarm.clone())?;

    println!("Store: {}", store.config().name);
    println!("  Topic: {}", store.topic());
    println!("  Endpoint ID: {}", hex::encode(swarm.endpoint_id().as_bytes()));
    println!("  Data directory: {}", store.data_dir().display());

    for peer in peers {
        let id = parse_endpoint_id(peer)?;
        swarm
            .dial(store.topic(), iroh::EndpointAddr::new(id))
            .await?;
        println!("Dialed {}", peer);
    }

    println!();
    println!("Replicating. Press Ctrl+C to stop.");

    let mut events = store.subscribe();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event @ (StoreEvent::PeerConnected { .. }
                    | StoreEvent::PeerDisconnected { .. }
                    | StoreEvent::MemberAdded { .. }
                    | StoreEvent::ApplyFailed { .. })) => println!("{}", event),
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                println!();
                println!("Shutting down...");
                break;
            }
        }
    }

    store.disconnect().await?;
    if let Ok(swarm) = Arc::try_unwrap(swarm) {
        swarm.shutdown().await?;
    }
    Ok(())
}
