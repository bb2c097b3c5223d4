//! Top-level archiver: registers every configured account and runs the
//! ingestion controller until interrupted (spec §4.G, §7).

use std::sync::Arc;

use archive_cli::Config;
use archive_ingest::{ControllerMessage, IngestController};
use archive_rest::ReqwestDownloader;
use archive_store::{BlobStore, Store};
use clap::Parser;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    archive_cli::init_logging(&config.log);
    let _progress = archive_cli::progress_sink(config.stats);

    if let Err(e) = run(config).await {
        tracing::error!(error = %e, "archive run ended with an error");
        std::process::exit(1);
    }
    Ok(())
}

async fn run(config: Config) -> anyhow::Result<()> {
    let store = Store::open(&config.store)?;
    let blobs = BlobStore::open(&config.blobs)?;
    let downloader = Arc::new(ReqwestDownloader::new(reqwest::Client::builder().build()?));
    let registry = archive_scheduler::AccountRegistry::new();
    let mut controller = IngestController::new(store, blobs, registry.clone(), downloader);

    let (tx, rx) = mpsc::unbounded_channel::<ControllerMessage>();
    for entry in config.load_accounts()? {
        let options: archive_scheduler::RegisterOptions = entry.into();
        let account = registry.register(options).await?;
        controller.forward_account_events(account, tx.clone()).await;
        tracing::info!(%account, "registered account");
    }
    drop(tx);

    tokio::select! {
        _ = controller.run(rx) => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested");
        }
    }
    controller.shutdown().await;
    Ok(())
}
