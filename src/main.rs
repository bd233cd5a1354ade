use std::sync::Arc;
use eyre::WrapErr;
use tokio::signal;
use tokio::time::{sleep, timeout, Duration};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use wallet_ledger::{
    api, config,
    db::SqliteLedgerStore,
    indexer,
    ingest::{IngestSettings, Ingestor, RunOptions},
    notify::LogNotifier,
    rpc::HttpRpcClient,
};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> eyre::Result<()> {
    // RUST_LOG overrides, INFO otherwise
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stdout)
        .with_target(false)
        .init();

    info!("Wallet ledger starting...");

    let cfg = config::load()?;

    let store = Arc::new(
        SqliteLedgerStore::open(&cfg.db_path)
            .wrap_err_with(|| format!("opening ledger database {}", cfg.db_path))?,
    );
    let client = Arc::new(HttpRpcClient::new(&cfg.rpc_http_url, cfg.rpc_api_key.clone())?);

    let ingestor = Arc::new(Ingestor::new(
        IngestSettings::from_config(&cfg),
        client,
        store,
        Arc::new(LogNotifier),
    ));
    ingestor
        .hydrate()
        .await
        .wrap_err("loading persisted ledger")?;
    info!(
        "Tracking {} with {} known transactions",
        cfg.wallet_address,
        ingestor.ledger().len()
    );

    // Spawn API task
    let api_handle = tokio::spawn({
        let cfg = cfg.clone();
        let ingestor = Arc::clone(&ingestor);
        async move { api::serve(cfg, ingestor).await }
    });

    // Spawn Indexer task
    let indexer_handle = tokio::spawn({
        let ingestor = Arc::clone(&ingestor);
        let options = RunOptions::from_config(&cfg);
        let poll_interval = cfg.poll_interval;
        async move { indexer::run(ingestor, options, poll_interval).await }
    });

    // Graceful shutdown
    tokio::select! {
        res = api_handle => match res {
            Ok(Ok(_)) => info!("API exited cleanly"),
            Ok(Err(e)) => error!("API error: {:?}", e),
            Err(e) => error!("API task panicked: {:?}", e),
        },
        res = indexer_handle => match res {
            Ok(Ok(_)) => info!("Indexer exited cleanly"),
            Ok(Err(e)) => error!("Indexer error: {:?}", e),
            Err(e) => error!("Indexer task panicked: {:?}", e),
        },
        _ = signal::ctrl_c() => {
            info!("Shutdown signal received, stopping...");
            ingestor.cancel();
            // let the in-flight call finish so the run checkpoints its cursor
            let drained = timeout(SHUTDOWN_GRACE, async {
                while ingestor.is_refreshing() {
                    sleep(Duration::from_millis(100)).await;
                }
            })
            .await;
            if drained.is_err() {
                error!("Run did not stop within {:?}, exiting anyway", SHUTDOWN_GRACE);
            }
        }
    }

    info!("Wallet ledger stopped.");
    Ok(())
}
