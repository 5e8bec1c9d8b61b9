use std::process::ExitCode;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use mintscope_ingestor::{IngestorConfig, RecordStore, RpcTransactionFetcher, Session, SessionState, WsConnector};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match IngestorConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return ExitCode::FAILURE;
    }
    let registry = match config.load_registry() {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            error!("Failed to load instruction schemas: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let store_path = config.resolved_store_path();
    let store = match RecordStore::open_with(&store_path, config.checkpoint_every) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Failed to open store {}: {}", store_path.display(), e);
            return ExitCode::FAILURE;
        }
    };
    info!("Store {} holds {} records", store_path.display(), store.len());

    let fetcher = match RpcTransactionFetcher::new(config.rpc_url.clone(), config.commitment) {
        Ok(fetcher) => Arc::new(fetcher),
        Err(e) => {
            error!("Failed to build RPC client: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let connector = Arc::new(WsConnector::new(config.connect_timeout()));

    let mut session = match Session::new(config, connector, fetcher, registry, store) {
        Ok(session) => session,
        Err(e) => {
            error!("Failed to start session: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                // Dropping the sender would stop the session
                warn!("Failed to listen for ctrl-c: {}", e);
                std::future::pending::<()>().await;
            }
        }
    });

    let stats = session.run(shutdown_rx).await;
    info!(
        "Appended {} records from {} creation events ({} soft failures, {} duplicates, {} reconnects)",
        stats.records_appended, stats.creation_events, stats.soft_failures, stats.duplicates_skipped, stats.reconnects
    );

    if session.state() == SessionState::Failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
