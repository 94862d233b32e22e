use anyhow::{anyhow, Context, Result};
use log::info;
use std::path::Path;
use std::sync::Arc;

use crate::error::{NodeError, NodeResult};

const MESSAGES_TREE: &str = "core_messages";
const NODE_STORE_TREE: &str = "node_store";
const MESSAGE_COUNT_KEY: &str = "message_count";

pub type CoreHandle = Arc<ChainCore>;

/// Ordered log of every L2 message accepted into the rollup inbox.
#[derive(Debug)]
pub struct ChainCore {
    messages: sled::Tree,
}

impl ChainCore {
    fn new(messages: sled::Tree) -> Self {
        Self { messages }
    }

    pub fn message_count(&self) -> Result<u64> {
        let count = match self.messages.get(MESSAGE_COUNT_KEY)? {
            Some(bytes) => {
                let num_bytes: [u8; 8] = bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| anyhow!("Invalid message count format"))?;
                u64::from_be_bytes(num_bytes)
            }
            None => 0,
        };
        Ok(count)
    }

    /// Append a message and return its sequence number.
    ///
    /// Only the sequencer batcher and the inbox reader write here, and at most one of them is
    /// active in a process.
    pub fn append(&self, message: &[u8]) -> Result<u64> {
        let seq = self.message_count()?;
        self.messages.insert(message_key(seq), message)?;
        self.messages
            .insert(MESSAGE_COUNT_KEY, &(seq + 1).to_be_bytes()[..])?;
        Ok(seq)
    }

    pub fn message(&self, seq: u64) -> Result<Option<Vec<u8>>> {
        Ok(self.messages.get(message_key(seq))?.map(|v| v.to_vec()))
    }

    pub fn flush(&self) -> Result<()> {
        self.messages.flush()?;
        Ok(())
    }
}

fn message_key(seq: u64) -> Vec<u8> {
    let mut key = b"msg_".to_vec();
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

/// Checkpoint storage of the validator folder.
pub struct Monitor {
    pub core: CoreHandle,
    db: sled::Db,
}

impl Monitor {
    pub fn open(db_path: &Path, contract_file: &Path) -> NodeResult<Self> {
        Self::try_open(db_path, contract_file)
            .context("error opening monitor")
            .map_err(NodeError::ResourceInit)
    }

    fn try_open(db_path: &Path, contract_file: &Path) -> Result<Self> {
        if !contract_file.is_file() {
            return Err(anyhow!(
                "contract bytecode {} not found",
                contract_file.display()
            ));
        }
        let db = sled::open(db_path)
            .with_context(|| format!("error opening checkpoint db {}", db_path.display()))?;
        let core = Arc::new(ChainCore::new(db.open_tree(MESSAGES_TREE)?));
        info!(
            "Opened checkpoint db {} with {} messages",
            db_path.display(),
            core.message_count()?
        );
        Ok(Self { core, db })
    }

    /// Backing store shared with the transaction index.
    pub fn node_store(&self) -> NodeResult<sled::Tree> {
        self.db
            .open_tree(NODE_STORE_TREE)
            .map_err(|e| NodeError::ResourceInit(e.into()))
    }

    pub fn close(self) {
        if let Err(e) = self.db.flush() {
            log::warn!("Failed to flush checkpoint db: {}", e);
        }
    }
}

#[cfg(test)]
pub(crate) fn temporary_core() -> (CoreHandle, sled::Tree) {
    let db = sled::Config::new().temporary(true).open().unwrap();
    let core = Arc::new(ChainCore::new(db.open_tree(MESSAGES_TREE).unwrap()));
    (core, db.open_tree(NODE_STORE_TREE).unwrap())
}
