use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use labsync::sync::ConflictResolutionStrategy;
use labsync::{
    Document, Filter, HttpProbeSignal, HttpRemoteStore, OperationKind, SqliteStorage, SyncConfig,
    SyncEngine,
};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "labsync")]
#[command(about = "Inspect and replay the offline sync queue of a field device", long_about = None)]
struct Args {
    /// Sync database file (defaults to the user data directory)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// TOML configuration file; LABSYNC_* variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Remote document API base URL
    #[arg(long, global = true, default_value = "http://localhost:6745")]
    remote: String,

    /// Remote database name
    #[arg(long, global = true, default_value = "lab")]
    database: String,

    /// Bearer token for the remote API
    #[arg(long, global = true)]
    token: Option<String>,

    /// Health URL probed before running; the remote counts as offline unless it answers 2xx
    #[arg(long, global = true)]
    probe: Option<String>,

    /// Conflict strategy: last_write_wins, field_merge or manual
    #[arg(long, global = true, default_value = "last_write_wins")]
    conflicts: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show online state, pending count and unresolved errors
    Status,
    /// List queued operations
    Queue,
    /// Queue a local write
    Enqueue {
        /// create, update or delete
        kind: String,
        collection: String,
        id: String,
        /// JSON object payload
        payload: Option<String>,
    },
    /// Read a document from the local cache
    Get {
        collection: String,
        id: String,
        /// Fetch the remote copy first
        #[arg(long)]
        refresh: bool,
    },
    /// List cached documents of a collection
    List {
        collection: String,
        /// field=value equality filters
        #[arg(long = "where")]
        filters: Vec<String>,
        /// Only documents with unsynced changes
        #[arg(long)]
        dirty: bool,
    },
    /// Replay the queue against the remote store
    Sync,
    /// Put a permanently failed operation back in line
    Retry { sequence: u64 },
    /// Drop a permanently failed operation
    Discard { sequence: u64 },
    /// Print the effective configuration
    Config,
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<SyncConfig> {
    let _ = dotenvy::dotenv();
    let mut config = match path {
        Some(path) => SyncConfig::from_toml_file(path)?,
        None => SyncConfig::default(),
    };
    config.apply_env()?;
    // One-shot commands never sync behind the operator's back
    config.auto_sync = false;
    config.sync_on_write = false;
    Ok(config)
}

fn parse_payload(raw: Option<&str>) -> anyhow::Result<Document> {
    let Some(raw) = raw else {
        return Ok(Document::new());
    };
    match serde_json::from_str::<Value>(raw).context("payload is not valid JSON")? {
        Value::Object(map) => Ok(map),
        _ => bail!("payload must be a JSON object"),
    }
}

fn parse_filter(filters: &[String], dirty: bool) -> anyhow::Result<Filter> {
    let mut filter = Filter::new();
    for raw in filters {
        let Some((field, value)) = raw.split_once('=') else {
            bail!("filter '{}' is not field=value", raw);
        };
        let value = serde_json::from_str::<Value>(value)
            .unwrap_or_else(|_| Value::String(value.to_string()));
        filter = filter.eq(field, value);
    }
    if dirty {
        filter = filter.dirty_only();
    }
    Ok(filter)
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "labsync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = load_config(args.config.as_ref())?;
    if let Command::Config = args.command {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let storage = match &args.db {
        Some(path) => SqliteStorage::open(path)?,
        None => SqliteStorage::open_default("labsync")?,
    };
    let mut remote = HttpRemoteStore::new(&args.remote, &args.database, config.request_timeout())?;
    if let Some(token) = &args.token {
        remote = remote.with_token(token);
    }
    let strategy: ConflictResolutionStrategy = args.conflicts.parse()?;

    let timeout = config.request_timeout();
    let mut builder = SyncEngine::builder(Arc::new(storage), Arc::new(remote))
        .config(config)
        .default_resolver(strategy.create_resolver());
    if let Some(url) = &args.probe {
        let probe = HttpProbeSignal::new(url.as_str(), timeout, timeout);
        if !probe.probe().await {
            tracing::warn!("{} is unreachable, running offline", url);
        }
        builder = builder.signal(Arc::new(probe));
    }
    let engine = builder.build().await?;

    match args.command {
        Command::Status => print_json(&engine.status().await)?,
        Command::Queue => {
            for op in engine.operations().await {
                println!(
                    "#{:<6} {:<17} {:<7} {}/{}  retries={}{}",
                    op.sequence,
                    serde_json::to_string(&op.status)?.trim_matches('"'),
                    op.kind,
                    op.collection,
                    op.document_id,
                    op.retry_count,
                    op.last_error
                        .as_deref()
                        .map(|e| format!("  error={}", e))
                        .unwrap_or_default()
                );
            }
            println!("{} pending", engine.pending_count());
        }
        Command::Enqueue {
            kind,
            collection,
            id,
            payload,
        } => {
            let payload = parse_payload(payload.as_deref())?;
            let outcome = match kind.parse::<OperationKind>()? {
                OperationKind::Create => engine.create(&collection, &id, payload).await?,
                OperationKind::Update => engine.update(&collection, &id, payload).await?,
                OperationKind::Delete => engine.delete(&collection, &id).await?,
            };
            println!("{:?}", outcome);
        }
        Command::Get {
            collection,
            id,
            refresh,
        } => {
            let document = if refresh {
                engine.refresh(&collection, &id).await?
            } else {
                engine.get(&collection, &id)
            };
            match document {
                Some(doc) => print_json(&doc)?,
                None => bail!("{}/{} not found", collection, id),
            }
        }
        Command::List {
            collection,
            filters,
            dirty,
        } => {
            let filter = parse_filter(&filters, dirty)?;
            for (id, doc) in engine.list(&collection, &filter) {
                println!("{} {}", id, serde_json::to_string(&doc)?);
            }
        }
        Command::Sync => {
            let report = engine.trigger_sync().await;
            print_json(&report)?;
            if !report.success() {
                std::process::exit(2);
            }
        }
        Command::Retry { sequence } => {
            let op = engine.retry_failed(sequence).await?;
            println!("#{} {} {}/{} re-queued", op.sequence, op.kind, op.collection, op.document_id);
        }
        Command::Discard { sequence } => {
            let op = engine.discard_failed(sequence).await?;
            println!("#{} {} {}/{} discarded", op.sequence, op.kind, op.collection, op.document_id);
        }
        Command::Config => {}
    }

    Ok(())
}
