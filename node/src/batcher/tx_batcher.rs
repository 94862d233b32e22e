use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use share::transaction::{Batch, EMPTY_BATCH_SIZE};
use solana_sdk::pubkey::Pubkey;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::broadcaster::Broadcaster;
use crate::inbox::InboxReader;
use crate::l1::L1Client;
use crate::monitor::CoreHandle;
use crate::txdb::TxStore;
use crate::wallet::Identity;

// Commands buffered between RPC handlers and the batcher task.
pub(crate) const COMMAND_QUEUE: usize = 1024;

static MAX_MESSAGES_IN_BATCH: usize = 256;

// Submissions refused once this many messages wait for L1.
const MAX_PENDING_MESSAGES: usize = 16_384;

// Accepted ids remembered for duplicate detection, beyond what the index already holds.
const RECENT_IDS: usize = 65_536;

pub(crate) enum BatcherCommand {
    Submit {
        id: String,
        raw: Vec<u8>,
        reply: oneshot::Sender<Result<Option<u64>>>,
    },
    PendingCount {
        reply: oneshot::Sender<usize>,
    },
    IsPending {
        id: String,
        reply: oneshot::Sender<bool>,
    },
}

pub(crate) enum BatchKind {
    Sequencer {
        core: CoreHandle,
        reader: Arc<InboxReader>,
        broadcaster: Broadcaster,
        delayed_messages_target_delay: u64,
    },
    Stateful,
    Stateless,
}

struct PendingMessage {
    id: String,
    raw: Vec<u8>,
}

/// Ids accepted by this batcher, oldest forgotten first.
struct RecentIds {
    ids: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    fn insert(&mut self, id: String) {
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.ids.insert(id.clone());
        self.order.push_back(id);
    }
}

/// Owns every pending message; only reachable through [`BatcherCommand`]s.
pub(crate) struct TxBatcher {
    client: Arc<dyn L1Client>,
    identity: Identity,
    target: Pubkey,
    store: TxStore,
    kind: BatchKind,
    pending: Vec<PendingMessage>,
    recent: RecentIds,
    max_pending: usize,
    max_payload: usize,
    first_sequence_number: u64,
    next_batch_index: u64,
    last_batch_slot: u64,
}

impl TxBatcher {
    pub(crate) fn new(
        client: Arc<dyn L1Client>,
        identity: Identity,
        target: Pubkey,
        store: TxStore,
        kind: BatchKind,
    ) -> Self {
        let (first_sequence_number, last_batch_slot) = match &kind {
            BatchKind::Sequencer { core, reader, .. } => (
                core.message_count().unwrap_or_default(),
                reader.progress().l1_slot,
            ),
            _ => (0, 0),
        };
        let max_payload = client.max_batch_payload();
        Self {
            client,
            identity,
            target,
            store,
            kind,
            pending: vec![],
            recent: RecentIds::new(RECENT_IDS),
            max_pending: MAX_PENDING_MESSAGES,
            max_payload,
            first_sequence_number,
            next_batch_index: 1,
            last_batch_slot,
        }
    }

    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::Receiver<BatcherCommand>,
        max_batch_time: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = interval_at(Instant::now() + max_batch_time, max_batch_time);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if !self.pending.is_empty() {
                        warn!("Batcher stopping with {} unsubmitted messages", self.pending.len());
                    }
                    return;
                }
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => return,
                },
                _ = ticker.tick() => self.submit().await,
            }
        }
    }

    fn handle(&mut self, cmd: BatcherCommand) {
        match cmd {
            BatcherCommand::Submit { id, raw, reply } => {
                let _ = reply.send(self.accept(id, raw));
            }
            BatcherCommand::PendingCount { reply } => {
                let _ = reply.send(self.pending.len());
            }
            BatcherCommand::IsPending { id, reply } => {
                let pending = matches!(self.kind, BatchKind::Stateful)
                    && self.pending.iter().any(|msg| msg.id == id);
                let _ = reply.send(pending);
            }
        }
    }

    fn accept(&mut self, id: String, raw: Vec<u8>) -> Result<Option<u64>> {
        if self.recent.contains(&id) || self.store.get_transaction(&id)?.is_some() {
            return Err(anyhow!("transaction {} already known", id));
        }
        if self.pending.len() >= self.max_pending {
            return Err(anyhow!(
                "batch queue is full with {} pending messages",
                self.pending.len()
            ));
        }
        if EMPTY_BATCH_SIZE + Batch::message_size(&raw) > self.max_payload {
            return Err(anyhow!(
                "transaction of {} bytes does not fit in a batch",
                raw.len()
            ));
        }

        let seq = match &self.kind {
            BatchKind::Sequencer {
                core, broadcaster, ..
            } => {
                let seq = core.append(&raw)?;
                match broadcaster.broadcast(seq, &raw) {
                    Ok(()) => debug!(
                        "Sequenced message {} for {} feed clients",
                        seq,
                        broadcaster.client_count()
                    ),
                    Err(e) => warn!("Failed to broadcast message {}: {:#}", seq, e),
                }
                Some(seq)
            }
            BatchKind::Stateful | BatchKind::Stateless => None,
        };
        self.recent.insert(id.clone());
        self.pending.push(PendingMessage { id, raw });
        Ok(seq)
    }

    /// Number of leading pending messages that fit one batch payload.
    fn batch_len(&self) -> usize {
        let mut size = EMPTY_BATCH_SIZE;
        self.pending
            .iter()
            .take(MAX_MESSAGES_IN_BATCH)
            .take_while(|msg| {
                size += Batch::message_size(&msg.raw);
                size <= self.max_payload
            })
            .count()
    }

    /// Post pending messages to L1. Failed submissions stay pending for the next tick.
    pub(crate) async fn submit(&mut self) {
        if self.pending.is_empty() && !self.delayed_messages_due() {
            return;
        }
        let take = self.batch_len();
        let batch = Batch::new(
            self.next_batch_index,
            self.first_sequence_number,
            self.pending[..take].iter().map(|msg| msg.raw.clone()).collect(),
        );
        let payload = match batch.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode batch {}: {}", batch.batch_index, e);
                return;
            }
        };
        match self
            .client
            .submit_batch(&self.target, payload, self.identity.keypair())
            .await
        {
            Ok(signature) => {
                info!(
                    "Committed batch {} with {} messages to {} ({})",
                    batch.batch_index,
                    batch.messages.len(),
                    self.target,
                    signature
                );
                self.first_sequence_number += batch.messages.len() as u64;
                self.next_batch_index += 1;
                self.pending.drain(..take);
                if let BatchKind::Sequencer { reader, .. } = &self.kind {
                    self.last_batch_slot = reader.progress().l1_slot;
                }
            }
            Err(e) => warn!("Batch {} submission failed: {:#}", batch.batch_index, e),
        }
    }

    /// The sequencer posts even an empty batch once L1 has moved past the delayed message delay.
    fn delayed_messages_due(&self) -> bool {
        match &self.kind {
            BatchKind::Sequencer {
                reader,
                delayed_messages_target_delay,
                ..
            } => {
                reader.progress().l1_slot
                    >= self.last_batch_slot.saturating_add(*delayed_messages_target_delay)
            }
            _ => false,
        }
    }
}

/// Send a command and wait for the batcher's reply.
pub(crate) async fn request<T>(
    commands: &mpsc::Sender<BatcherCommand>,
    build: impl FnOnce(oneshot::Sender<T>) -> BatcherCommand,
) -> Result<T> {
    let (tx, rx) = oneshot::channel();
    commands
        .send(build(tx))
        .await
        .map_err(|_| anyhow!("batcher stopped"))?;
    rx.await.map_err(|_| anyhow!("batcher dropped the request"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HealthSettings;
    use crate::feed::idle_feed;
    use crate::health::HealthReporter;
    use crate::inbox::ReaderCheckpoint;
    use crate::l1::mock::MockL1;
    use crate::mode::{BroadcasterSettings, BROADCASTER_IO_TIMEOUT};
    use crate::monitor::temporary_core;
    use crate::txdb::{tests::signed_transaction, TXDB_POLL_INTERVAL};
    use share::transaction::{encode_transaction, transaction_id};
    use solana_sdk::signature::Keypair;
    use std::sync::atomic::Ordering;

    fn store(core: CoreHandle, node_store: sled::Tree) -> TxStore {
        TxStore::open(
            core,
            node_store,
            Pubkey::new_unique(),
            TXDB_POLL_INTERVAL,
            &CancellationToken::new(),
        )
        .unwrap()
        .0
    }

    fn stateless(l1: Arc<MockL1>) -> TxBatcher {
        let (core, node_store) = temporary_core();
        TxBatcher::new(
            l1,
            Identity::new(Keypair::new()),
            Pubkey::new_unique(),
            store(core, node_store),
            BatchKind::Stateless,
        )
    }

    fn encoded() -> (String, Vec<u8>) {
        let txn = signed_transaction();
        (
            transaction_id(&txn).unwrap(),
            encode_transaction(&txn).unwrap(),
        )
    }

    fn decode(payload: &[u8]) -> Batch {
        bincode::deserialize(payload).unwrap()
    }

    #[test]
    fn recent_ids_forget_the_oldest() {
        let mut recent = RecentIds::new(2);
        recent.insert("a".to_owned());
        recent.insert("b".to_owned());
        recent.insert("c".to_owned());
        assert!(!recent.contains("a"));
        assert!(recent.contains("b"));
        assert!(recent.contains("c"));
    }

    #[tokio::test]
    async fn resubmitted_transaction_is_rejected() {
        let mut batcher = stateless(Arc::new(MockL1::default()));
        let (id, raw) = encoded();
        batcher.accept(id.clone(), raw.clone()).unwrap();
        let err = batcher.accept(id.clone(), raw.clone()).unwrap_err();
        assert!(err.to_string().contains("already known"));

        // Still known after it has been posted.
        batcher.submit().await;
        assert!(batcher.pending.is_empty());
        assert!(batcher.accept(id, raw).is_err());
    }

    #[tokio::test]
    async fn batches_are_split_to_fit_the_payload_limit() {
        let (_, raw) = encoded();
        let limit = EMPTY_BATCH_SIZE + 2 * Batch::message_size(&raw);
        let l1 = Arc::new(MockL1 {
            max_payload: Some(limit),
            ..Default::default()
        });
        let mut batcher = stateless(l1.clone());
        for _ in 0..5 {
            let (id, raw) = encoded();
            batcher.accept(id, raw).unwrap();
        }

        for _ in 0..3 {
            batcher.submit().await;
        }
        let batches: Vec<Batch> = l1.submitted().iter().map(|(_, p)| decode(p)).collect();
        assert!(l1.submitted().iter().all(|(_, p)| p.len() <= limit));
        assert_eq!(
            batches.iter().map(|b| b.messages.len()).collect::<Vec<_>>(),
            vec![2, 2, 1]
        );
        assert_eq!(
            batches.iter().map(|b| b.first_sequence_number).collect::<Vec<_>>(),
            vec![0, 2, 4]
        );
        assert!(batcher.pending.is_empty());
    }

    #[tokio::test]
    async fn oversized_transaction_is_refused_up_front() {
        let l1 = Arc::new(MockL1 {
            max_payload: Some(EMPTY_BATCH_SIZE + 16),
            ..Default::default()
        });
        let mut batcher = stateless(l1.clone());
        let (id, raw) = encoded();
        assert!(batcher.accept(id, raw).is_err());
        assert!(batcher.pending.is_empty());
        batcher.submit().await;
        assert!(l1.submitted().is_empty());
    }

    #[tokio::test]
    async fn pending_queue_is_bounded() {
        let mut batcher = stateless(Arc::new(MockL1::default()));
        batcher.max_pending = 2;
        for _ in 0..2 {
            let (id, raw) = encoded();
            batcher.accept(id, raw).unwrap();
        }
        let (id, raw) = encoded();
        let err = batcher.accept(id, raw).unwrap_err();
        assert!(err.to_string().contains("queue is full"));
        assert_eq!(batcher.pending.len(), 2);
    }

    #[tokio::test]
    async fn maximal_delayed_message_delay_never_forces_a_batch() {
        let l1 = Arc::new(MockL1::default());
        l1.slot.store(5, Ordering::SeqCst);
        let (core, node_store) = temporary_core();
        let cancel = CancellationToken::new();
        let (health, _) = HealthReporter::init(HealthSettings::default());
        let reader = InboxReader::spawn(
            ReaderCheckpoint {
                l1_slot: 5,
                message_count: 0,
            },
            core.clone(),
            l1.clone(),
            Pubkey::new_unique(),
            health,
            idle_feed(),
            cancel.clone(),
        );
        let broadcaster = Broadcaster::start(
            BroadcasterSettings {
                addr: "127.0.0.1:0".to_owned(),
                workers: 1,
                queue: 1,
                io_read_write_timeout: BROADCASTER_IO_TIMEOUT,
                client_ping_interval: Duration::from_secs(5),
                client_no_response_timeout: Duration::from_secs(15),
            },
            core.clone(),
            None,
            cancel.clone(),
        )
        .await
        .unwrap();

        let mut batcher = TxBatcher::new(
            l1.clone(),
            Identity::new(Keypair::new()),
            Pubkey::new_unique(),
            store(core.clone(), node_store),
            BatchKind::Sequencer {
                core,
                reader,
                broadcaster,
                delayed_messages_target_delay: u64::MAX,
            },
        );
        assert_eq!(batcher.last_batch_slot, 5);
        assert!(!batcher.delayed_messages_due());
        batcher.submit().await;
        assert!(l1.submitted().is_empty());
        cancel.cancel();
    }
}
