use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use solana_sdk::transaction::Transaction;

/// Decode an L2 message as a rollup transaction.
pub fn decode_transaction(data: &[u8]) -> Option<Transaction> {
    bincode::deserialize(data).ok()
}

pub fn encode_transaction(txn: &Transaction) -> bincode::Result<Vec<u8>> {
    bincode::serialize(txn)
}

/// Transactions are identified by their first signature.
pub fn transaction_id(txn: &Transaction) -> Option<String> {
    txn.signatures.first().map(|sig| sig.to_string())
}

// Encoded size of a batch without messages: two u64 headers, the vec length and the root.
pub const EMPTY_BATCH_SIZE: usize = 8 + 8 + 8 + 32;

/// A batch of sequenced messages posted to the L1 inbox.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub batch_index: u64,
    pub first_sequence_number: u64,
    pub messages: Vec<Vec<u8>>,
    pub messages_root: [u8; 32],
}

impl Batch {
    pub fn new(batch_index: u64, first_sequence_number: u64, messages: Vec<Vec<u8>>) -> Self {
        let messages_root = calculate_messages_root(&messages);
        Self {
            batch_index,
            first_sequence_number,
            messages,
            messages_root,
        }
    }

    pub fn encode(&self) -> bincode::Result<Vec<u8>> {
        bincode::serialize(self)
    }

    /// Bytes a message adds to an encoded batch.
    pub fn message_size(message: &[u8]) -> usize {
        8 + message.len()
    }
}

/// Calculate messages root for the batch
pub fn calculate_messages_root(messages: &[Vec<u8>]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for message in messages {
        hasher.update((message.len() as u64).to_be_bytes());
        hasher.update(message);
    }
    hasher.finalize().into()
}
