use std::{sync::Arc, time::Duration};

use anyhow::Result;
use printer_agent::{agent::profile_book, discover::Discovery, storage::Storage, Config};

use super::Cli;

pub async fn main(_cli: &Cli, cfg: &Config, wait: u64) -> Result<()> {
    let profiles = Arc::new(profile_book(cfg, None));
    let storage = Storage::new(&cfg.storage.dir);
    let (discovery, _) = Discovery::from_config(cfg, profiles, &storage).await;

    tracing::debug!(wait, "listening before polling");
    tokio::time::sleep(Duration::from_secs(wait)).await;

    for candidate in discovery.poll().await {
        let marker = if candidate.disabled { " (disabled)" } else { "" };
        println!(
            "{}{}\t{}",
            candidate.identity.id_string(),
            marker,
            serde_json::to_string(&candidate.identity)?
        );
    }

    Ok(())
}
