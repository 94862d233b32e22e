use log::{error, info};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{NodeError, NodeResult};
use crate::txdb::TxStore;

pub const SHUTDOWN_MESSAGE: &str = "Cleanly shutting down node";

/// Store cleanup run once the node stops.
pub trait CloseStore {
    fn close(self);
}

impl CloseStore for TxStore {
    fn close(self) {
        TxStore::close(self)
    }
}

/// Every event that can end a running node.
pub struct TerminalSignals {
    pub store_errors: mpsc::Receiver<NodeError>,
    pub batcher_errors: mpsc::Receiver<anyhow::Error>,
    pub rpc_errors: mpsc::Receiver<anyhow::Error>,
    pub cancel: CancellationToken,
}

/// Wait for the first terminal event, then stop everything and close the store.
///
/// A channel whose senders are all gone stops being watched; cancellation always is.
pub async fn supervise<S: CloseStore>(store: S, signals: TerminalSignals) -> NodeResult<()> {
    let TerminalSignals {
        mut store_errors,
        mut batcher_errors,
        mut rpc_errors,
        cancel,
    } = signals;

    let outcome = tokio::select! {
        biased;
        Some(err) = store_errors.recv() => Err(err),
        Some(err) = batcher_errors.recv() => Err(NodeError::Background(err.context("batcher"))),
        Some(err) = rpc_errors.recv() => Err(NodeError::Background(err.context("rpc server"))),
        _ = cancel.cancelled() => Ok(()),
    };

    if let Err(e) = &outcome {
        error!("Node stopping: {}", e);
    }
    cancel.cancel();
    store.close();
    info!("{}", SHUTDOWN_MESSAGE);
    outcome
}
