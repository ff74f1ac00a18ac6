use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use history_relay_api::{load_config_file, HistoryRelayApi};
use history_relay_core::{Filter, RelayConfig};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "hr")]
#[command(about = "History relay retention store CLI")]
struct Cli {
    #[arg(long, default_value = "./history_relay.sqlite3")]
    db: PathBuf,

    /// YAML relay configuration; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    /// Admit one JSON record read from a file, or stdin with `-`.
    Admit(AdmitArgs),
    /// Run a JSON filter and print the matched records with scan stats.
    Query(QueryArgs),
    /// List occupancy of every non-empty bucket.
    Buckets,
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct AdmitArgs {
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Args)]
struct QueryArgs {
    #[arg(long, default_value = "{}")]
    filter: String,
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
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config_file(path)?,
        None => RelayConfig::default(),
    };
    let api = HistoryRelayApi::new(cli.db, config)?;

    match cli.command {
        Command::Db { command } => run_db(command, &api),
        Command::Admit(args) => run_admit(&args, &api),
        Command::Query(args) => run_query(&args, &api),
        Command::Buckets => run_buckets(&api),
    }
}

fn run_db(command: DbCommand, api: &HistoryRelayApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => emit_json(serde_json::to_value(api.migrate(args.dry_run)?)?),
        DbCommand::IntegrityCheck => {
            let report = api.integrity_check()?;
            if !report.oversized_buckets.is_empty() {
                tracing::warn!(
                    buckets = report.oversized_buckets.len(),
                    retention = report.retention_per_bucket,
                    "buckets exceed the configured retention"
                );
            }
            emit_json(serde_json::to_value(report)?)
        }
    }
}

fn run_admit(args: &AdmitArgs, api: &HistoryRelayApi) -> Result<()> {
    let raw = if args.file.as_os_str() == "-" {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer).context("failed to read record from stdin")?;
        buffer
    } else {
        fs::read_to_string(&args.file)
            .with_context(|| format!("failed to read record file {}", args.file.display()))?
    };

    let outcome = api.decide_and_admit_json(&raw)?;
    emit_json(serde_json::json!({ "outcome": outcome }))
}

fn run_query(args: &QueryArgs, api: &HistoryRelayApi) -> Result<()> {
    let filter = Filter::from_json(&args.filter).context("invalid --filter")?;
    let mut stream = api.query(&filter)?;
    let records = stream.by_ref().collect::<Result<Vec<_>, _>>()?;

    emit_json(serde_json::json!({
        "records": records,
        "stats": stream.stats()
    }))
}

fn run_buckets(api: &HistoryRelayApi) -> Result<()> {
    let buckets = api.bucket_stats()?;
    emit_json(serde_json::json!({ "buckets": buckets }))
}
