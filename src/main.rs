use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use conductor::config::ConductorConfig;

mod cmd;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(version, about = "Multi-agent orchestration core")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Data directory holding conductor.toml and the shared database
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize the data directory, database, and default config
    Init,
    /// Show worker, active, and queued counts
    Status,
    /// Create and inspect tasks, and drive their phase lifecycle
    Tasks {
        #[command(subcommand)]
        command: TasksCommands,
    },
    /// Enqueue tasks and operate the dispatch queue
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },
    /// Verify a task's ledger hash chain
    Verify { task_id: String },
}

#[derive(Subcommand, Clone)]
pub enum TasksCommands {
    /// Create a task at the start of the lifecycle
    Add {
        id: String,
        title: String,
        /// Task ids that must finish before this one is dispatched
        #[arg(long)]
        dep: Vec<String>,
        /// Capability the assigned worker must advertise
        #[arg(long)]
        capability: Option<String>,
        #[arg(long, default_value = "0")]
        priority: i64,
    },
    /// List all tasks with phase and coarse status
    List,
    /// Show one task in detail
    Show { id: String },
    /// Advance (or backtrack) a task to a target phase
    Advance {
        id: String,
        /// Target phase, e.g. "spec" or "implement"
        phase: String,
        #[arg(long, default_value = "cli")]
        actor: String,
    },
    /// Print the task's phase ledger
    History { id: String },
}

#[derive(Subcommand, Clone)]
pub enum QueueCommands {
    /// Classify and enqueue a task
    Dispatch {
        task_id: String,
        /// Explicit lane: urgent, normal, background
        #[arg(long)]
        lane: Option<String>,
        /// Interactive work; always lands in the urgent lane
        #[arg(long)]
        interactive: bool,
        #[arg(long)]
        critical: bool,
        /// Estimated duration in milliseconds
        #[arg(long)]
        estimated_ms: Option<i64>,
    },
    /// List queue items, optionally filtered by status
    List {
        /// queued, running, completed, cancelled
        #[arg(long)]
        status: Option<String>,
    },
    /// Show the next batch of items eligible to start
    Next {
        #[arg(long, default_value = "5")]
        max: usize,
    },
    /// Mark a task's queued item running
    Start { task_id: String },
    /// Mark a task's running item completed
    Complete {
        task_id: String,
        #[arg(long)]
        duration_ms: Option<i64>,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Cancel a task's open item, releasing its lease and claim
    Cancel {
        task_id: String,
        #[arg(long, default_value = "cancelled by operator")]
        reason: String,
    },
    /// Check the urgent lane for starvation
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    // conductor.toml lives inside the data directory; --data-dir beats the
    // file's own data_dir setting.
    let data_dir = cli
        .data_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(".conductor"));
    let mut config = ConductorConfig::load_or_default(&data_dir)?;
    config.store.data_dir = data_dir;

    match &cli.command {
        Commands::Init => cmd::cmd_init(&config)?,
        Commands::Status => cmd::cmd_status(&config).await?,
        Commands::Tasks { command } => match command {
            TasksCommands::Add {
                id,
                title,
                dep,
                capability,
                priority,
            } => cmd::cmd_task_add(&config, id, title, dep, capability.as_deref(), *priority).await?,
            TasksCommands::List => cmd::cmd_task_list(&config).await?,
            TasksCommands::Show { id } => cmd::cmd_task_show(&config, id).await?,
            TasksCommands::Advance { id, phase, actor } => {
                cmd::cmd_task_advance(&config, id, phase, actor).await?
            }
            TasksCommands::History { id } => cmd::cmd_task_history(&config, id).await?,
        },
        Commands::Queue { command } => match command {
            QueueCommands::Dispatch {
                task_id,
                lane,
                interactive,
                critical,
                estimated_ms,
            } => {
                cmd::cmd_queue_dispatch(
                    &config,
                    task_id,
                    lane.as_deref(),
                    *interactive,
                    *critical,
                    *estimated_ms,
                )
                .await?
            }
            QueueCommands::List { status } => {
                cmd::cmd_queue_list(&config, status.as_deref()).await?
            }
            QueueCommands::Next { max } => cmd::cmd_queue_next(&config, *max).await?,
            QueueCommands::Start { task_id } => cmd::cmd_queue_start(&config, task_id).await?,
            QueueCommands::Complete {
                task_id,
                duration_ms,
                notes,
            } => cmd::cmd_queue_complete(&config, task_id, *duration_ms, notes.clone()).await?,
            QueueCommands::Cancel { task_id, reason } => {
                cmd::cmd_queue_cancel(&config, task_id, reason).await?
            }
            QueueCommands::Check => cmd::cmd_queue_check(&config).await?,
        },
        Commands::Verify { task_id } => cmd::cmd_verify(&config, task_id).await?,
    }

    Ok(())
}
