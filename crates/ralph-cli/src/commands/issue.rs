//! `ralph issue`: direct ticket-store issue management, bypassing the agent.

use std::path::Path;
use std::str::FromStr;

use anyhow::Context;

use ralph_core::model::Priority;
use ralph_core::ticket_store::TixClient;
use ralph_core::TicketStore;

pub enum Action {
    Add { desc: String, priority: Option<String> },
    Done { id: String },
    DoneAll,
    DoneIds { ids: Vec<String> },
}

pub async fn run(repo_root: &Path, action: Action) -> anyhow::Result<()> {
    let store = TixClient::new(repo_root);
    match action {
        Action::Add { desc, priority } => {
            let priority = priority
                .map(|p| Priority::from_str(&p))
                .transpose()
                .map_err(|e| anyhow::anyhow!(e))?;
            let id = store.issue_add(&desc, priority).await.context("failed to file issue")?;
            println!("{id}");
        }
        Action::Done { id } => {
            store.issue_done(&id).await.context("failed to resolve issue")?;
        }
        Action::DoneAll => {
            store.issue_done_all().await.context("failed to resolve issues")?;
        }
        Action::DoneIds { ids } => {
            store.issue_done_ids(&ids).await.context("failed to resolve issues")?;
        }
    }
    Ok(())
}
