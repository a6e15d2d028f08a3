mod commands;
mod paths;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "ralph", about = "autonomous construct loop orchestrator")]
struct Cli {
    /// Repo root to operate on (defaults to the current directory)
    #[arg(long, global = true)]
    repo: Option<PathBuf>,

    /// Model override for this invocation (defaults to config/profile)
    #[arg(long, global = true)]
    model: Option<String>,

    /// Agent profile override for this invocation (defaults to the harness default)
    #[arg(long, global = true)]
    agent: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scaffold the ralph directory: prompt templates, specs dir, empty plan file
    Init,
    /// Run a single PLAN-stage invocation against a spec, seeding the initial task list
    Plan {
        /// Path to the spec file, relative to the repo root
        spec: String,
    },
    /// Run the construct loop for up to N iterations (default: config.max_iterations)
    Construct {
        /// Iteration budget for this invocation
        iterations: Option<u32>,
        /// Switch the active spec before starting (implies `set-spec`)
        spec: Option<String>,
    },
    /// Show the current stage, active spec, and ticket-store counts
    Status,
    /// Query a single piece of orchestration state, for scripting
    Query {
        #[command(subcommand)]
        target: QueryTarget,
    },
    /// Task management
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },
    /// Issue management
    Issue {
        #[command(subcommand)]
        action: IssueAction,
    },
    /// Validate the ticket store's current plan
    Validate,
    /// Trim old resolved tombstones out of the bootstrap plan file
    Compact,
    /// Show run/iteration ledger history
    Log {
        /// Show iteration-level detail, not just run summaries
        #[arg(long)]
        all: bool,
        /// Filter to runs against this spec file
        #[arg(long)]
        spec: Option<String>,
        /// Filter to runs on this branch
        #[arg(long)]
        branch: Option<String>,
        /// Only show runs started at or after this ISO8601 timestamp
        #[arg(long)]
        since: Option<String>,
    },
    /// Switch the active spec file
    SetSpec {
        /// Path to the spec file, relative to the repo root
        file: String,
    },
    /// Summarize rejection patterns and suggest follow-up issues
    Compare {
        /// Restrict analysis to this spec file
        #[arg(long)]
        spec: Option<String>,
        /// Config profile to resolve (defaults to RALPH_PROFILE/config default)
        #[arg(long)]
        profile: Option<String>,
        /// Emit machine-readable JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum QueryTarget {
    /// Current construct stage
    Stage,
    /// Pending task count and IDs
    Tasks,
    /// Open issue count and IDs
    Issues,
    /// Iteration count recorded in the ledger for the active spec
    Iteration,
    /// The task that would run next
    Next,
}

#[derive(Subcommand)]
enum TaskAction {
    /// Add a task directly, bypassing the agent
    Add {
        name: String,
        #[arg(long)]
        notes: Option<String>,
        #[arg(long)]
        accept: Option<String>,
        #[arg(long, value_delimiter = ',')]
        deps: Vec<String>,
        #[arg(long)]
        priority: Option<String>,
    },
    /// Mark a task done (omit id to mark the most recently built task)
    Done { id: Option<String> },
    /// Accept a done task (omit id to accept the most recent)
    Accept { id: Option<String> },
    /// Reject a task with a reason
    Reject { id: String, reason: String },
    /// Delete a task outright
    Delete { id: String },
    /// Change a task's priority
    Prioritize { id: String, priority: String },
}

#[derive(Subcommand)]
enum IssueAction {
    /// File a new issue directly
    Add {
        desc: String,
        #[arg(long)]
        priority: Option<String>,
    },
    /// Resolve a single issue
    Done { id: String },
    /// Resolve every open issue
    DoneAll,
    /// Resolve a specific set of issues
    DoneIds {
        #[arg(value_delimiter = ',')]
        ids: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let repo_root = cli
        .repo
        .clone()
        .unwrap_or_else(|| std::env::current_dir().expect("current directory is readable"));

    match dispatch(cli, &repo_root).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e:#}");
            ExitCode::from(1)
        }
    }
}

async fn dispatch(cli: Cli, repo_root: &std::path::Path) -> anyhow::Result<()> {
    match cli.command {
        Commands::Init => commands::init::run(repo_root),
        Commands::Plan { spec } => {
            commands::plan::run(repo_root, &spec, cli.model.as_deref(), cli.agent.as_deref()).await
        }
        Commands::Construct { iterations, spec } => {
            commands::construct::run(repo_root, iterations, spec, cli.model.as_deref(), cli.agent.as_deref()).await
        }
        Commands::Status => commands::status::run(repo_root).await,
        Commands::Query { target } => {
            let target = match target {
                QueryTarget::Stage => commands::query::Target::Stage,
                QueryTarget::Tasks => commands::query::Target::Tasks,
                QueryTarget::Issues => commands::query::Target::Issues,
                QueryTarget::Iteration => commands::query::Target::Iteration,
                QueryTarget::Next => commands::query::Target::Next,
            };
            commands::query::run(repo_root, target).await
        }
        Commands::Task { action } => {
            let action = match action {
                TaskAction::Add { name, notes, accept, deps, priority } => {
                    commands::task::Action::Add { name, notes, accept, deps, priority }
                }
                TaskAction::Done { id } => commands::task::Action::Done { id },
                TaskAction::Accept { id } => commands::task::Action::Accept { id },
                TaskAction::Reject { id, reason } => commands::task::Action::Reject { id, reason },
                TaskAction::Delete { id } => commands::task::Action::Delete { id },
                TaskAction::Prioritize { id, priority } => {
                    commands::task::Action::Prioritize { id, priority }
                }
            };
            commands::task::run(repo_root, action).await
        }
        Commands::Issue { action } => {
            let action = match action {
                IssueAction::Add { desc, priority } => commands::issue::Action::Add { desc, priority },
                IssueAction::Done { id } => commands::issue::Action::Done { id },
                IssueAction::DoneAll => commands::issue::Action::DoneAll,
                IssueAction::DoneIds { ids } => commands::issue::Action::DoneIds { ids },
            };
            commands::issue::run(repo_root, action).await
        }
        Commands::Validate => commands::validate::run(repo_root).await,
        Commands::Compact => commands::compact::run(repo_root),
        Commands::Log { all, spec, branch, since } => {
            commands::log::run(repo_root, all, spec, branch, since)
        }
        Commands::SetSpec { file } => commands::set_spec::run(repo_root, &file),
        Commands::Compare { spec, profile, json } => {
            commands::compare::run(repo_root, spec, profile, json)
        }
    }
}
