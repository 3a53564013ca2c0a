use anyhow::Result;
use printer_agent::Config;
use tokio_util::sync::CancellationToken;

use super::Cli;

pub async fn main(cli: &Cli, cfg: Config, cancel: CancellationToken) -> Result<()> {
    tracing::info!(
        version = printer_agent::VERSION,
        config = ?cli.config,
        cloud = cfg.cloud.url.as_str(),
        offline = cfg.cloud.offline,
        "starting printer agent"
    );
    printer_agent::agent::run(cfg, cancel).await
}
