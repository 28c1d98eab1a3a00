mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// selfai -- autonomous improvement runner with leveled plan/execute/test.
#[derive(Parser)]
#[command(name = "selfai", version, about)]
struct Cli {
    /// Repository to operate on (defaults to the current directory).
    #[arg(long, global = true)]
    repo: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one orchestration cycle.
    Run,

    /// Show task and level statistics (default when no subcommand is given).
    Status,

    /// Add a task to the backlog.
    Add {
        /// Task title; must be unique.
        title: String,
        #[arg(short, long, default_value = "")]
        description: String,
        #[arg(short, long, default_value = "general")]
        category: String,
        /// Higher runs first.
        #[arg(short, long, default_value_t = 50)]
        priority: i64,
    },

    /// Approve a plan waiting for review.
    Approve { id: i64 },

    /// Send a reviewed plan back for replanning with feedback.
    Feedback {
        id: i64,
        /// What the next plan should change.
        message: String,
    },

    /// Re-enable a cancelled task, optionally with feedback for the replan.
    Reenable { id: i64, feedback: Option<String> },

    /// Put a failed task back in the queue.
    Retry { id: i64 },

    /// Show the stored plans of a task.
    Plan { id: i64 },

    /// Show self-healing history statistics.
    Monitor,

    /// Ask the agent to review the repository and queue what it finds.
    Discover {
        /// Category to review; repeatable. Defaults to all of them.
        #[arg(short, long = "category")]
        categories: Vec<String>,
        /// Per-category agent timeout in seconds.
        #[arg(long, default_value_t = 180)]
        timeout: u64,
        /// Print the findings without adding tasks.
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let repo = commands::resolve_repo(cli.repo)?;

    match cli.command {
        Some(Commands::Run) => commands::run::run(&repo).await?,
        None | Some(Commands::Status) => commands::status::run(&repo).await?,
        Some(Commands::Add {
            title,
            description,
            category,
            priority,
        }) => commands::tasks::add(&repo, title, description, category, priority).await?,
        Some(Commands::Approve { id }) => commands::tasks::approve(&repo, id).await?,
        Some(Commands::Feedback { id, message }) => {
            commands::tasks::feedback(&repo, id, &message).await?
        }
        Some(Commands::Reenable { id, feedback }) => {
            commands::tasks::reenable(&repo, id, feedback.as_deref()).await?
        }
        Some(Commands::Retry { id }) => commands::tasks::retry(&repo, id).await?,
        Some(Commands::Plan { id }) => commands::tasks::plan(&repo, id).await?,
        Some(Commands::Monitor) => commands::monitor::run(&repo).await?,
        Some(Commands::Discover {
            categories,
            timeout,
            dry_run,
        }) => commands::discover::run(&repo, &categories, timeout, dry_run).await?,
    }

    Ok(())
}
