use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::{Value, json};
use stord::logging::{self, LogConfig};
use stord::ops::FormatOptions;
use stord::rpc::RpcClient;
use stord::{adapters, config, context, core::Orchestrator, db};

#[derive(Parser)]
#[command(name = "stord")]
#[command(about = "Block device management daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to `$STORD_CONFIG` or /etc/stord/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Daemon socket (defaults to the configured `socket_path`).
    #[arg(long, global = true)]
    socket: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon.
    Daemon(ServerArgs),
    /// Show daemon health.
    Status,
    /// List published objects, or show one.
    Objects { path: Option<String> },
    /// Format a block device.
    Format(FormatArgs),
    /// Re-probe a block device.
    Rescan { path: String },
    /// Show running jobs, or the job log with `--history`.
    Jobs {
        #[arg(long)]
        history: bool,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Show one job with its status history.
    Job { id: String },
    /// Cancel a running job.
    Cancel { id: String },
}

#[derive(Args, Serialize)]
struct ServerArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    socket_path: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    database_path: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    json_logs: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    simulation: Option<bool>,
}

#[derive(Args)]
struct FormatArgs {
    /// Object path, e.g. /block_devices/sdb1
    path: String,
    /// Content type: ext4, xfs, vfat, swap, empty, dos, gpt, ...
    #[arg(name = "TYPE")]
    fs_type: String,
    #[arg(long)]
    label: Option<String>,
    /// zero, ata-secure-erase or ata-secure-erase-enhanced
    #[arg(long)]
    erase: Option<String>,
    /// Read a passphrase from stdin and put the content inside LUKS.
    #[arg(long)]
    encrypt: bool,
    #[arg(long)]
    take_ownership: bool,
    #[arg(long)]
    tear_down: bool,
    #[arg(long)]
    update_partition_type: bool,
    /// Return once the device is wiped; the rest runs in the background.
    #[arg(long)]
    no_block: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let server_args = match &cli.command {
        Commands::Daemon(args) => Some(args),
        _ => None,
    };
    let config = match &cli.config {
        Some(path) => config::AppConfig::load_from(path, server_args)?,
        None => config::AppConfig::new(server_args)?,
    };

    match cli.command {
        Commands::Daemon(_) => {
            logging::init(LogConfig {
                json: config.json_logs,
                verbose: config.verbose,
            });
            run_daemon(config).await.context("Failed to start daemon")
        }
        command => {
            let client =
                RpcClient::new(cli.socket.unwrap_or_else(|| config.socket_path.clone()));
            run_client(&client, command).await
        }
    }
}

async fn run_client(client: &RpcClient, command: Commands) -> Result<()> {
    let result: Value = match command {
        Commands::Daemon(_) => anyhow::bail!("`daemon` is not a client command"),
        Commands::Status => client.call("daemon.status", None).await?,
        Commands::Objects { path: None } => client.call("objects.list", None).await?,
        Commands::Objects { path: Some(path) } => {
            client.call("objects.get", Some(json!({ "path": path }))).await?
        }
        Commands::Format(args) => {
            let params = format_params(args)?;
            client.call("block.format", Some(params)).await?
        }
        Commands::Rescan { path } => {
            client.call("block.rescan", Some(json!({ "path": path }))).await?
        }
        Commands::Jobs { history: false, .. } => client.call("jobs.active", None).await?,
        Commands::Jobs { history: true, limit } => {
            client.call("jobs.list", Some(json!({ "limit": limit }))).await?
        }
        Commands::Job { id } => client.call("jobs.get", Some(json!({ "id": id }))).await?,
        Commands::Cancel { id } => client.call("jobs.cancel", Some(json!({ "id": id }))).await?,
    };

    if !result.is_null() {
        println!("{}", serde_json::to_string_pretty(&result)?);
    }
    Ok(())
}

fn format_params(args: FormatArgs) -> Result<Value> {
    let passphrase = if args.encrypt {
        let mut input = String::new();
        std::io::stdin()
            .read_to_string(&mut input)
            .context("Failed to read passphrase from stdin")?;
        Some(input.trim_end_matches('\n').to_string())
    } else {
        None
    };
    let options = FormatOptions {
        label: args.label,
        take_ownership: args.take_ownership,
        encrypt_passphrase: passphrase,
        erase: args.erase,
        no_block: args.no_block,
        update_partition_type: args.update_partition_type,
        config_items: Vec::new(),
        tear_down: args.tear_down,
    };
    Ok(json!({
        "path": args.path,
        "type": args.fs_type,
        "options": options,
    }))
}

async fn run_daemon(config: config::AppConfig) -> Result<()> {
    let db_conn = if config.simulation {
        db::init_in_memory().await?
    } else {
        db::init(&config.database_path).await?
    };

    let sim_dir = config.run_dir.join("simulation");
    if config.simulation {
        std::fs::create_dir_all(&sim_dir)
            .with_context(|| format!("Failed to create {}", sim_dir.display()))?;
    }
    let backend = adapters::get_backend(config.simulation, &sim_dir);
    let ctx = context::AppContext::from_config(
        config,
        db_conn,
        backend.platform,
        backend.mounts,
    );
    Orchestrator::new(ctx, backend.monitor).start().await
}
