use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use flowstore::{
    audit_sink_for, normalize_collection, Entries, FileBackend, FileSecret, Flowstore,
    KeyringSecret, SecretProvider, SetOptions, StoreConfig,
};
use serde::Serialize;
use serde_json::{json, Value};

const CLI_CONTRACT_VERSION: &str = "flowstore.v1";

#[derive(Debug, Parser)]
#[command(name = "flowstore")]
#[command(about = "Inspect and maintain a flowstore data file")]
struct Cli {
    /// JSON document holding the store
    #[arg(long, default_value = "./flowstore.json")]
    store: PathBuf,

    /// Hex secret file, created on first use
    #[arg(long, default_value = "./flowstore.key")]
    secret_file: PathBuf,

    /// Read the secret from the OS keychain instead of a file
    #[arg(long, default_value_t = false, conflicts_with = "secret_file")]
    keyring: bool,

    /// YAML or JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Get(GetArgs),
    Set(SetArgs),
    Delete(KeyArg),
    /// List live keys
    Keys,
    /// Check every stored tag; fails if any entry was tampered with
    Verify,
    /// Wrap entries written before integrity tags existed
    MigrateIntegrity,
    /// Apply pending data migrations
    Migrate,
    Repair(RepairArgs),
    Health,
    Stats,
    Backups {
        #[command(subcommand)]
        command: BackupsCommand,
    },
}

#[derive(Debug, Subcommand)]
enum BackupsCommand {
    List(KeyArg),
    Purge(PurgeArgs),
    Restore(KeyArg),
}

#[derive(Debug, Args)]
struct KeyArg {
    key: String,
}

#[derive(Debug, Args)]
struct GetArgs {
    key: String,
    /// JSON returned when the key is absent or fails verification
    #[arg(long)]
    default: Option<String>,
}

#[derive(Debug, Args)]
struct SetArgs {
    key: String,
    /// JSON value
    value: String,
    /// Back up and verify even if the key is not configured as critical
    #[arg(long, default_value_t = false)]
    critical: bool,
}

#[derive(Debug, Args)]
struct RepairArgs {
    #[arg(long, default_value = "workflows")]
    collection: String,
    /// Report what would change without writing
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct PurgeArgs {
    #[arg(long)]
    key: Option<String>,
    /// Backups to keep per key; defaults to the configured retention
    #[arg(long)]
    keep: Option<usize>,
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let flowstore = open(&cli)?;
    run(cli.command, &flowstore).await
}

fn open(cli: &Cli) -> Result<Flowstore<FileBackend>> {
    let config = match &cli.config {
        Some(path) => StoreConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => StoreConfig::default(),
    };
    let audit = audit_sink_for(&config)?;
    let backend = FileBackend::open(&cli.store)
        .with_context(|| format!("failed to open store {}", cli.store.display()))?;

    let secret = if cli.keyring {
        KeyringSecret::default().load_secret()
    } else {
        FileSecret::new(&cli.secret_file).load_secret()
    }
    .context("failed to load integrity secret")?;

    tracing::debug!(store = %cli.store.display(), keyring = cli.keyring, "Opening store");
    Ok(Flowstore::new(backend, &secret, config, audit)?)
}

async fn run(command: Command, flowstore: &Flowstore<FileBackend>) -> Result<()> {
    let manager = flowstore.manager();
    match command {
        Command::Get(args) => {
            let value = manager.get_one(&args.key).await?;
            let found = value.is_some();
            let value = match (value, args.default) {
                (Some(value), _) => value,
                (None, Some(default)) => parse_json(&default)?,
                (None, None) => Value::Null,
            };
            emit_json(json!({ "key": args.key, "found": found, "value": value }))
        }
        Command::Set(args) => {
            let value = parse_json(&args.value)?;
            let opts = if args.critical {
                SetOptions::critical()
            } else {
                manager.options_for(&args.key)
            };
            let mut items = Entries::new();
            items.insert(args.key.clone(), value);
            manager.set(items, opts).await?;
            emit_json(json!({ "key": args.key, "written": true, "verified": opts.critical }))
        }
        Command::Delete(args) => {
            manager.remove(&[args.key.clone()]).await?;
            emit_json(json!({ "key": args.key, "deleted": true }))
        }
        Command::Keys => {
            let keys: Vec<String> = manager.get_live().await?.keys().cloned().collect();
            emit_json(json!({ "keys": keys }))
        }
        Command::Verify => {
            let report = flowstore.integrity().verify_all().await?;
            emit(&report)?;
            if !report.is_clean() {
                bail!("{} entries failed verification", report.tampered.len());
            }
            Ok(())
        }
        Command::MigrateIntegrity => emit(&flowstore.integrity().migrate_all().await?),
        Command::Migrate => emit(&manager.initialize().await?),
        Command::Repair(args) => run_repair(&args, flowstore).await,
        Command::Health => {
            let report = manager.health_check().await;
            emit(&report)?;
            if !report.healthy {
                bail!(
                    "store is unhealthy: {}",
                    report.error.unwrap_or_else(|| "unknown error".to_string())
                );
            }
            Ok(())
        }
        Command::Stats => emit(&manager.get_stats().await?),
        Command::Backups { command } => run_backups(command, flowstore).await,
    }
}

async fn run_repair(args: &RepairArgs, flowstore: &Flowstore<FileBackend>) -> Result<()> {
    let manager = flowstore.manager();
    let Some(stored) = manager.get_one(&args.collection).await? else {
        return emit_json(json!({ "collection": args.collection, "found": false }));
    };

    let outcome = if args.dry_run {
        normalize_collection(&args.collection, stored, flowstore.config().max_nesting_depth)?
    } else {
        flowstore.repair().inspect(&args.collection, stored)?
    };

    let persist = outcome.repaired && !args.dry_run;
    if persist {
        let mut items = Entries::new();
        items.insert(
            args.collection.clone(),
            Value::Object(outcome.collection.clone()),
        );
        manager.set(items, SetOptions::critical()).await?;
    }

    emit_json(json!({
        "collection": args.collection,
        "found": true,
        "repaired": outcome.repaired,
        "depth": outcome.depth,
        "dropped_entries": outcome.dropped_entries,
        "entries": outcome.collection.len(),
        "persisted": persist,
    }))
}

async fn run_backups(command: BackupsCommand, flowstore: &Flowstore<FileBackend>) -> Result<()> {
    let manager = flowstore.manager();
    match command {
        BackupsCommand::List(args) => {
            let backups = manager.list_backups(&args.key).await?;
            emit_json(json!({ "key": args.key, "backups": backups }))
        }
        BackupsCommand::Purge(args) => {
            let removed = manager.purge_backups(args.key.as_deref(), args.keep).await?;
            emit_json(json!({ "removed": removed }))
        }
        BackupsCommand::Restore(args) => {
            let restored = manager.restore_from_backup(&args.key).await?;
            emit_json(json!({
                "key": args.key,
                "restored": restored.is_some(),
                "timestamp": restored.map(|r| r.timestamp),
            }))
        }
    }
}

fn parse_json(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).map_err(|err| anyhow!("value is not valid JSON: {err}"))
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit<T: Serialize>(payload: &T) -> Result<()> {
    emit_json(serde_json::to_value(payload).context("failed to serialize output")?)
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}
