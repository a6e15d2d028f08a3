//! `ralph task`: direct ticket-store task management, bypassing the agent.

use std::path::Path;
use std::str::FromStr;

use anyhow::Context;

use ralph_core::model::Priority;
use ralph_core::ticket_store::TixClient;
use ralph_core::{Task, TicketStore};

pub enum Action {
    Add {
        name: String,
        notes: Option<String>,
        accept: Option<String>,
        deps: Vec<String>,
        priority: Option<String>,
    },
    Done { id: Option<String> },
    Accept { id: Option<String> },
    Reject { id: String, reason: String },
    Delete { id: String },
    Prioritize { id: String, priority: String },
}

pub async fn run(repo_root: &Path, action: Action) -> anyhow::Result<()> {
    let store = TixClient::new(repo_root);
    match action {
        Action::Add { name, notes, accept, deps, priority } => {
            let id = ralph_core::ids::gen_id("t");
            let mut task = Task::new(id, name, "");
            task.notes = notes;
            task.accept = accept;
            task.deps = if deps.is_empty() { None } else { Some(deps) };
            if let Some(p) = priority {
                task.priority = Some(Priority::from_str(&p).map_err(|e| anyhow::anyhow!(e))?);
            }
            let id = store.task_add(&task).await.context("failed to add task")?;
            println!("{id}");
        }
        Action::Done { id } => {
            store.task_done(id.as_deref()).await.context("failed to mark task done")?;
        }
        Action::Accept { id } => {
            store.task_accept(id.as_deref()).await.context("failed to accept task")?;
        }
        Action::Reject { id, reason } => {
            store.task_reject(&id, &reason).await.context("failed to reject task")?;
        }
        Action::Delete { id } => {
            store.task_delete(&id).await.context("failed to delete task")?;
        }
        Action::Prioritize { id, priority } => {
            let priority = Priority::from_str(&priority).map_err(|e| anyhow::anyhow!(e))?;
            store
                .task_prioritize(&id, priority)
                .await
                .context("failed to reprioritize task")?;
        }
    }
    Ok(())
}
