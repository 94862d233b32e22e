use anyhow::Result;
use log::{info, warn};
use solana_sdk::{pubkey::Pubkey, transaction::Transaction};
use std::sync::Arc;

use crate::batcher::{Batcher, SubmitReceipt};
use crate::txdb::{TxRecord, TxStore};
use crate::validator::TransactionValidator;

/// Status of a transaction as seen by this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxStatus {
    Sequenced(TxRecord),
    Pending,
    Unknown,
}

/// Public RPC backend: validates and hands transactions to the batcher, answers queries
/// from the local transaction index.
pub struct Aggregator {
    batcher: Arc<Batcher>,
    rollup: Pubkey,
    store: TxStore,
}

impl Aggregator {
    pub fn new(batcher: Arc<Batcher>, rollup: Pubkey, store: TxStore) -> Self {
        Self {
            batcher,
            rollup,
            store,
        }
    }

    pub async fn send_transaction(&self, txn: &Transaction) -> Result<SubmitReceipt> {
        if let Err(e) = TransactionValidator::validate_transaction(txn) {
            warn!("Transaction validation failed: {}", e);
            return Err(e.context("Transaction validation failed"));
        }
        let receipt = self.batcher.send_transaction(txn).await?;
        info!("Accepted transaction {}", receipt.id);
        Ok(receipt)
    }

    pub async fn transaction_status(&self, id: &str) -> Result<TxStatus> {
        if let Some(record) = self.store.get_transaction(id)? {
            return Ok(TxStatus::Sequenced(record));
        }
        if self.batcher.is_pending(id).await? {
            return Ok(TxStatus::Pending);
        }
        Ok(TxStatus::Unknown)
    }

    pub fn message_count(&self) -> Result<u64> {
        self.store.message_count()
    }

    pub async fn pending_count(&self) -> Result<usize> {
        self.batcher.pending_count().await
    }

    pub fn rollup(&self) -> &Pubkey {
        &self.rollup
    }

    pub fn mode_name(&self) -> &'static str {
        self.batcher.mode_name()
    }
}
