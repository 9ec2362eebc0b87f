use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use ticketflow::config::FlowConfig;
use ticketflow::models::TaskType;

mod cmd;

#[derive(Parser)]
#[command(name = "ticketflow")]
#[command(version, about = "Issue intake orchestrator for AI evaluation and implementation")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to ticketflow.toml (defaults to ./ticketflow.toml when present)
    #[arg(short, long, global = true, env = "TICKETFLOW_CONFIG")]
    pub config: Option<PathBuf>,

    /// Database path. Overrides the config file.
    #[arg(long, global = true)]
    pub db_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the orchestrator: queue consumers, schedulers and the worker API
    Serve {
        /// Bind address for the worker API
        #[arg(long)]
        bind: Option<String>,
    },
    /// Run a broker-mode worker pool backed by an agent command
    Worker {
        /// Agent command (defaults to worker.command)
        #[arg(long)]
        command: Option<String>,
        /// Concurrent tasks (defaults to worker.prefetch)
        #[arg(long)]
        prefetch: Option<u16>,
    },
    /// Run a poll-mode worker against a ticketflow server
    PollWorker {
        /// Server base URL
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        server: String,
        /// Worker token from `register-worker`
        #[arg(long, env = "TICKETFLOW_WORKER_TOKEN")]
        token: String,
        /// Agent command (defaults to worker.command)
        #[arg(long)]
        command: Option<String>,
    },
    /// Register a task source
    AddSource {
        name: String,
        /// Repository as owner/repo
        repository: String,
        /// Only sync issues carrying this label
        #[arg(long)]
        label: Option<String>,
    },
    /// Sync a task source
    Sync {
        /// Source name or id
        source: String,
        /// Run the pass in this process instead of enqueueing it
        #[arg(long)]
        now: bool,
    },
    /// Enqueue evaluation or implementation for a task
    Enqueue {
        task_id: i64,
        #[arg(long, default_value = "evaluation")]
        task_type: TaskType,
    },
    /// Register a poll-mode worker and print its token
    RegisterWorker {
        name: String,
        /// Task types this worker accepts
        #[arg(long, value_delimiter = ',', default_value = "evaluation,implementation")]
        capabilities: Vec<TaskType>,
    },
    /// Requeue stuck work once and exit
    Recover,
    /// Create the database schema
    InitDb,
    /// List tasks and their phase statuses
    Tasks {
        /// Restrict to one source (name or id)
        #[arg(long)]
        source: Option<String>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let cwd = std::env::current_dir().context("Failed to get current directory")?;
    let mut config = FlowConfig::resolve(cli.config.as_deref(), &cwd)?;
    if let Some(path) = &cli.db_path {
        config.database.path = path.clone();
    }
    let _log_guard = ticketflow::logging::init(&config.logging, cli.verbose)?;

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            cmd::cmd_serve(config).await?;
        }
        Commands::Worker { command, prefetch } => {
            cmd::cmd_worker(&config, command, prefetch).await?;
        }
        Commands::PollWorker {
            server,
            token,
            command,
        } => cmd::cmd_poll_worker(&config, &server, &token, command).await?,
        Commands::AddSource {
            name,
            repository,
            label,
        } => cmd::cmd_add_source(&config, &name, &repository, label.as_deref()).await?,
        Commands::Sync { source, now } => cmd::cmd_sync(&config, &source, now).await?,
        Commands::Enqueue { task_id, task_type } => {
            cmd::cmd_enqueue(&config, task_id, task_type).await?
        }
        Commands::RegisterWorker { name, capabilities } => {
            cmd::cmd_register_worker(&config, &name, capabilities).await?
        }
        Commands::Recover => cmd::cmd_recover(&config).await?,
        Commands::InitDb => cmd::cmd_init_db(&config)?,
        Commands::Tasks { source } => cmd::cmd_tasks(&config, source.as_deref()).await?,
        Commands::Config { command } => cmd::cmd_config(&config, command)?,
    }

    Ok(())
}
