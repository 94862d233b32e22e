use log::{info, warn};
use tokio_util::sync::CancellationToken;

use crate::l1::SolanaConnector;

mod aggregator;
mod batcher;
mod config;
mod error;
mod feed;
mod health;
mod inbox;
mod l1;
mod mode;
mod monitor;
mod profiling;
mod rpc;
mod startup;
mod supervisor;
mod txdb;
mod validator;
mod wallet;

#[tokio::main]
async fn main() {
    // Step1. cancel on interrupt or terminate
    let cancel = CancellationToken::new();
    tokio::spawn(listen_for_shutdown(cancel.clone()));

    // Step2. bring the node up and supervise it
    let code = match startup::run(std::env::args_os(), &SolanaConnector, cancel).await {
        Ok(()) => 0,
        Err(e) => e.exit_code(),
    };
    std::process::exit(code);
}

async fn listen_for_shutdown(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(terminate) => terminate,
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                wait_for_interrupt().await;
                cancel.cancel();
                return;
            }
        };
        tokio::select! {
            _ = wait_for_interrupt() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    wait_for_interrupt().await;

    info!("Shutdown signal received");
    cancel.cancel();
}

async fn wait_for_interrupt() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for interrupt: {}", e);
        std::future::pending::<()>().await;
    }
}
