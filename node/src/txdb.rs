use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use share::transaction::{decode_transaction, transaction_id};
use solana_sdk::pubkey::Pubkey;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{NodeError, NodeResult};
use crate::monitor::CoreHandle;

/// Interval at which the index polls the chain core for new messages.
pub const TXDB_POLL_INTERVAL: Duration = Duration::from_millis(100);

const ROLLUP_KEY: &str = "txdb_rollup";
const INDEXED_COUNT_KEY: &str = "txdb_indexed_count";
const TX_PREFIX: &str = "tx_";

/// Location of an indexed transaction in the chain core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRecord {
    pub sequence_number: u64,
    pub raw: Vec<u8>,
}

/// Local transaction index over the chain core.
///
/// Cloned freely for reads; `close` is reserved for the supervisor.
#[derive(Clone, Debug)]
pub struct TxStore {
    core: CoreHandle,
    tree: sled::Tree,
    rollup: Pubkey,
    poller: CancellationToken,
}

impl TxStore {
    /// Open the index and spawn its poller.
    ///
    /// Errors raised by the poller after startup arrive on the returned channel.
    pub fn open(
        core: CoreHandle,
        node_store: sled::Tree,
        rollup: Pubkey,
        poll_interval: Duration,
        cancel: &CancellationToken,
    ) -> NodeResult<(Self, mpsc::Receiver<NodeError>)> {
        bind_rollup(&node_store, &rollup)
            .context("error opening txdb")
            .map_err(NodeError::ResourceInit)?;

        let store = Self {
            core,
            tree: node_store,
            rollup,
            poller: cancel.child_token(),
        };
        let (err_tx, err_rx) = mpsc::channel(1);
        tokio::spawn(store.clone().poll(poll_interval, err_tx));
        info!(
            "Opened txdb for rollup {} at {} indexed messages",
            rollup,
            store.indexed_count().unwrap_or_default()
        );
        Ok((store, err_rx))
    }

    async fn poll(self, poll_interval: Duration, err_tx: mpsc::Sender<NodeError>) {
        let mut ticker = tokio::time::interval(poll_interval);
        loop {
            tokio::select! {
                _ = self.poller.cancelled() => return,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.index_new_messages() {
                warn!("txdb indexing for rollup {} failed: {:#}", self.rollup, e);
                let _ = err_tx.send(NodeError::Background(e.context("txdb poller"))).await;
                return;
            }
        }
    }

    /// Index every chain core message not yet seen; returns how many were processed.
    pub fn index_new_messages(&self) -> Result<u64> {
        let indexed = self.indexed_count()?;
        let available = self.core.message_count()?;
        if available < indexed {
            return Err(anyhow!(
                "chain core has {} messages but {} are indexed",
                available,
                indexed
            ));
        }
        for seq in indexed..available {
            let raw = self
                .core
                .message(seq)?
                .ok_or_else(|| anyhow!("chain core message {} missing", seq))?;
            match decode_transaction(&raw).as_ref().and_then(transaction_id) {
                Some(id) => {
                    self.tree
                        .insert(tx_key(&id), &seq.to_be_bytes()[..])?;
                }
                None => debug!("Message {} is not a rollup transaction", seq),
            }
        }
        self.tree
            .insert(INDEXED_COUNT_KEY, &available.to_be_bytes()[..])?;
        Ok(available - indexed)
    }

    pub fn indexed_count(&self) -> Result<u64> {
        read_u64(&self.tree, INDEXED_COUNT_KEY)
    }

    pub fn message_count(&self) -> Result<u64> {
        self.core.message_count()
    }

    pub fn get_transaction(&self, id: &str) -> Result<Option<TxRecord>> {
        let seq = match self.tree.get(tx_key(id))? {
            Some(bytes) => u64_from_bytes(&bytes)?,
            None => return Ok(None),
        };
        let raw = self
            .core
            .message(seq)?
            .ok_or_else(|| anyhow!("indexed message {} missing from chain core", seq))?;
        Ok(Some(TxRecord {
            sequence_number: seq,
            raw,
        }))
    }

    /// Stop the poller and flush the index.
    pub fn close(self) {
        self.poller.cancel();
        if let Err(e) = self.tree.flush() {
            warn!("Failed to flush txdb: {}", e);
        }
        if let Err(e) = self.core.flush() {
            warn!("Failed to flush chain core: {:#}", e);
        }
    }
}

fn bind_rollup(tree: &sled::Tree, rollup: &Pubkey) -> Result<()> {
    match tree.get(ROLLUP_KEY)? {
        Some(stored) if stored.as_ref() != rollup.as_ref() => Err(anyhow!(
            "node store belongs to rollup {}, not {}",
            Pubkey::try_from(stored.as_ref()).map(|p| p.to_string()).unwrap_or_default(),
            rollup
        )),
        Some(_) => Ok(()),
        None => {
            tree.insert(ROLLUP_KEY, rollup.as_ref())?;
            Ok(())
        }
    }
}

fn tx_key(id: &str) -> String {
    format!("{}{}", TX_PREFIX, id)
}

fn read_u64(tree: &sled::Tree, key: &str) -> Result<u64> {
    match tree.get(key)? {
        Some(bytes) => u64_from_bytes(&bytes),
        None => Ok(0),
    }
}

fn u64_from_bytes(bytes: &[u8]) -> Result<u64> {
    let num_bytes: [u8; 8] = bytes
        .try_into()
        .map_err(|_| anyhow!("Invalid u64 format"))?;
    Ok(u64::from_be_bytes(num_bytes))
}
