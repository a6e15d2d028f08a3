//! `ralph validate`: ask the ticket store to check its own consistency.

use std::path::Path;

use anyhow::Context;

use ralph_core::ticket_store::TixClient;
use ralph_core::TicketStore;

pub async fn run(repo_root: &Path) -> anyhow::Result<()> {
    let store = TixClient::new(repo_root);
    let ok = store.validate().await.context("failed to validate ticket store")?;
    if ok {
        println!("ok");
        Ok(())
    } else {
        anyhow::bail!("ticket store failed validation");
    }
}
