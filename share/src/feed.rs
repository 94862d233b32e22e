use serde::{Deserialize, Serialize};

/// Capacity of the queue between the feed subscriber and the inbox reader.
pub const FEED_QUEUE_CAPACITY: usize = 128;

/// Handshake header naming the first sequence number a feed client still needs.
pub const REQUESTED_SEQUENCE_HEADER: &str = "rollup-requested-sequence-number";

/// A sequenced L2 message pushed by the sequencer before it is posted to L1.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedMessage {
    pub sequence_number: u64,
    pub message: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Vec<u8>>,
}

impl FeedMessage {
    pub fn new(sequence_number: u64, message: Vec<u8>) -> Self {
        Self {
            sequence_number,
            message,
            signature: None,
        }
    }

    /// Bytes covered by the sequencer signature.
    pub fn signing_payload(&self) -> Vec<u8> {
        let mut payload = self.sequence_number.to_be_bytes().to_vec();
        payload.extend_from_slice(&self.message);
        payload
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }
}
