use anyhow::{Context, Result};
use log::{debug, info, warn};
use share::feed::FeedMessage;
use share::health::HealthEvent;
use solana_sdk::pubkey::Pubkey;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::{NodeError, NodeResult};
use crate::feed::FeedReceiver;
use crate::health::HealthSender;
use crate::l1::L1Client;
use crate::monitor::CoreHandle;

/// Wait between failed attempts to start the inbox reader.
pub const READER_RETRY_INTERVAL: Duration = Duration::from_secs(5);

const L1_POLL_INTERVAL: Duration = Duration::from_secs(1);
const LIVENESS_COMPONENT: &str = "inbox_reader";

/// Where the reader starts from, returned by a successful connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderCheckpoint {
    pub l1_slot: u64,
    pub message_count: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderProgress {
    /// Last L1 slot the reader has processed up to.
    pub l1_slot: u64,
    /// Messages in the chain core after the last delivery.
    pub message_count: u64,
}

/// Handle to the running inbox reader.
#[derive(Debug)]
pub struct InboxReader {
    rollup: Pubkey,
    progress: watch::Receiver<ReaderProgress>,
}

impl InboxReader {
    /// One start attempt: check the L1 endpoint and read the local chain core.
    pub async fn connect(
        client: &dyn L1Client,
        core: &CoreHandle,
        rollup: &Pubkey,
    ) -> Result<ReaderCheckpoint> {
        let l1_slot = client
            .latest_slot()
            .await
            .with_context(|| format!("inbox reader for rollup {} cannot reach L1", rollup))?;
        let message_count = core.message_count()?;
        Ok(ReaderCheckpoint {
            l1_slot,
            message_count,
        })
    }

    /// Spawn the reader loop. Called once per process, after a successful `connect`.
    pub fn spawn(
        checkpoint: ReaderCheckpoint,
        core: CoreHandle,
        client: Arc<dyn L1Client>,
        rollup: Pubkey,
        health: HealthSender,
        feed: FeedReceiver,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (progress_tx, progress_rx) = watch::channel(ReaderProgress {
            l1_slot: checkpoint.l1_slot,
            message_count: checkpoint.message_count,
        });
        info!(
            "Inbox reader for rollup {} starting at L1 slot {} with {} messages",
            rollup, checkpoint.l1_slot, checkpoint.message_count
        );
        tokio::spawn(run_reader(core, client, health, feed, progress_tx, cancel));
        Arc::new(Self {
            rollup,
            progress: progress_rx,
        })
    }

    pub fn progress(&self) -> ReaderProgress {
        *self.progress.borrow()
    }

    /// Block until the reader has processed L1 up to the slot current at call time.
    pub async fn wait_to_catch_up(&self, client: &dyn L1Client) -> Result<()> {
        let target = client.latest_slot().await?;
        info!(
            "Waiting for inbox reader of rollup {} to catch up to L1 slot {}",
            self.rollup, target
        );
        let mut progress = self.progress.clone();
        progress
            .wait_for(|p| p.l1_slot >= target)
            .await
            .context("inbox reader stopped before catching up")?;
        info!("Inbox reader caught up");
        Ok(())
    }
}

async fn run_reader(
    core: CoreHandle,
    client: Arc<dyn L1Client>,
    health: HealthSender,
    mut feed: FeedReceiver,
    progress: watch::Sender<ReaderProgress>,
    cancel: CancellationToken,
) {
    let mut poll = tokio::time::interval(L1_POLL_INTERVAL);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Inbox reader stopped");
                return;
            }
            Some(msg) = feed.recv() => {
                match deliver_feed_message(&core, &msg) {
                    Ok(count) => progress.send_modify(|p| p.message_count = count),
                    Err(e) => warn!("Failed to store feed message {}: {:#}", msg.sequence_number, e),
                }
            }
            _ = poll.tick() => {
                match client.latest_slot().await {
                    Ok(slot) => {
                        progress.send_modify(|p| p.l1_slot = p.l1_slot.max(slot));
                        health.log(HealthEvent::liveness(LIVENESS_COMPONENT)).await;
                    }
                    Err(e) => warn!("Inbox reader failed to poll L1: {:#}", e),
                }
            }
        }
    }
}

/// Append a feed message if it is the next one in sequence; returns the new message count.
fn deliver_feed_message(core: &CoreHandle, msg: &FeedMessage) -> Result<u64> {
    let count = core.message_count()?;
    if msg.sequence_number < count {
        debug!("Skipping already known feed message {}", msg.sequence_number);
        return Ok(count);
    }
    if msg.sequence_number > count {
        warn!(
            "Gap in sequencer feed: expected {}, got {}",
            count, msg.sequence_number
        );
        return Ok(count);
    }
    core.append(&msg.message)?;
    Ok(count + 1)
}

/// Run `attempt` until it succeeds, waiting `interval` between failures.
///
/// The wait observes `cancel`; there is no attempt bound.
pub async fn start_with_retry<T, F, Fut>(
    cancel: &CancellationToken,
    interval: Duration,
    url: &str,
    rollup: &Pubkey,
    mut attempt: F,
) -> NodeResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    loop {
        match attempt().await {
            Ok(started) => return Ok(started),
            Err(e) => {
                warn!(
                    "failed to start inbox reader, waiting and retrying: url={} rollup={} err={:#}",
                    url, rollup, e
                );
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(NodeError::Cancelled),
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HealthSettings;
    use crate::feed::idle_feed;
    use crate::health::HealthReporter;
    use crate::l1::mock::MockL1;
    use crate::monitor::temporary_core;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn retries_until_success_and_waits_between_attempts() {
        let l1 = Arc::new(MockL1 {
            slot_failures: AtomicUsize::new(3),
            ..Default::default()
        });
        let (core, _) = temporary_core();
        let rollup = Pubkey::new_unique();
        let attempts = AtomicUsize::new(0);
        let started = Instant::now();

        let checkpoint = start_with_retry(
            &CancellationToken::new(),
            READER_RETRY_INTERVAL,
            "mock://l1",
            &rollup,
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                InboxReader::connect(l1.as_ref(), &core, &rollup)
            },
        )
        .await
        .unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert!(started.elapsed() >= READER_RETRY_INTERVAL * 3);
        assert_eq!(checkpoint.message_count, 0);
    }

    /// Counts live reader instances; a failed attempt drops its own.
    struct ReaderInstance(Arc<AtomicUsize>);

    impl ReaderInstance {
        fn new(live: &Arc<AtomicUsize>, peak: &AtomicUsize) -> Self {
            let now = live.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            Self(live.clone())
        }
    }

    impl Drop for ReaderInstance {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_attempts_leave_a_single_reader_running() {
        let live = Arc::new(AtomicUsize::new(0));
        let peak = AtomicUsize::new(0);
        let attempts = AtomicUsize::new(0);

        let reader = start_with_retry(
            &CancellationToken::new(),
            READER_RETRY_INTERVAL,
            "mock://l1",
            &Pubkey::new_unique(),
            || {
                let instance = ReaderInstance::new(&live, &peak);
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    if attempt < 3 {
                        return Err(anyhow::anyhow!("attempt {} failed", attempt));
                    }
                    Ok(instance)
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(live.load(Ordering::SeqCst), 1);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        drop(reader);
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_retry_wait() {
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let result: NodeResult<()> = start_with_retry(
            &cancel,
            READER_RETRY_INTERVAL,
            "mock://l1",
            &Pubkey::new_unique(),
            || async { Err(anyhow::anyhow!("down")) },
        )
        .await;

        assert!(matches!(result, Err(NodeError::Cancelled)));
        assert!(started.elapsed() < READER_RETRY_INTERVAL);
    }

    #[tokio::test]
    async fn delivers_feed_messages_in_sequence_order() {
        let (core, _) = temporary_core();
        let (health, _reporter) = HealthReporter::init(HealthSettings::default());
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let reader = InboxReader::spawn(
            ReaderCheckpoint {
                l1_slot: 0,
                message_count: 0,
            },
            core.clone(),
            Arc::new(MockL1::default()),
            Pubkey::new_unique(),
            health,
            rx,
            cancel.clone(),
        );

        tx.send(FeedMessage::new(0, b"a".to_vec())).await.unwrap();
        tx.send(FeedMessage::new(0, b"dup".to_vec())).await.unwrap();
        tx.send(FeedMessage::new(2, b"gap".to_vec())).await.unwrap();
        tx.send(FeedMessage::new(1, b"b".to_vec())).await.unwrap();

        let mut progress = reader.progress.clone();
        progress.wait_for(|p| p.message_count == 2).await.unwrap();
        assert_eq!(core.message(0).unwrap().unwrap(), b"a".to_vec());
        assert_eq!(core.message(1).unwrap().unwrap(), b"b".to_vec());
        cancel.cancel();
    }

    #[tokio::test]
    async fn late_follower_catches_up_from_the_sequencer_feed() {
        use crate::batcher::broadcaster::Broadcaster;
        use crate::feed::FeedSubscriber;
        use crate::mode::{BroadcasterSettings, BROADCASTER_IO_TIMEOUT};

        let cancel = CancellationToken::new();
        let (sequencer_core, _) = temporary_core();
        for seq in 0..5u8 {
            sequencer_core.append(&[seq]).unwrap();
        }
        let broadcaster = Broadcaster::start(
            BroadcasterSettings {
                addr: "127.0.0.1:0".to_owned(),
                workers: 2,
                queue: 1,
                io_read_write_timeout: BROADCASTER_IO_TIMEOUT,
                client_ping_interval: Duration::from_secs(5),
                client_no_response_timeout: Duration::from_secs(15),
            },
            sequencer_core.clone(),
            None,
            cancel.clone(),
        )
        .await
        .unwrap();

        let feed = FeedSubscriber::new(format!("ws://{}", broadcaster.local_addr()))
            .connect(cancel.clone())
            .await
            .unwrap();
        let (follower_core, _) = temporary_core();
        let (health, _reporter) = HealthReporter::init(HealthSettings::default());
        let reader = InboxReader::spawn(
            ReaderCheckpoint {
                l1_slot: 0,
                message_count: 0,
            },
            follower_core.clone(),
            Arc::new(MockL1::default()),
            Pubkey::new_unique(),
            health,
            feed,
            cancel.clone(),
        );

        let mut progress = reader.progress.clone();
        tokio::time::timeout(Duration::from_secs(5), progress.wait_for(|p| p.message_count == 5))
            .await
            .unwrap()
            .unwrap();

        let seq = sequencer_core.append(&[5]).unwrap();
        broadcaster.broadcast(seq, &[5]).unwrap();
        tokio::time::timeout(Duration::from_secs(5), progress.wait_for(|p| p.message_count == 6))
            .await
            .unwrap()
            .unwrap();
        for seq in 0..6u64 {
            assert_eq!(follower_core.message(seq).unwrap().unwrap(), vec![seq as u8]);
        }
        cancel.cancel();
    }

    #[tokio::test]
    async fn wait_to_catch_up_tracks_l1_slot() {
        let (core, _) = temporary_core();
        let l1 = Arc::new(MockL1::default());
        l1.slot.store(7, Ordering::SeqCst);
        let (health, _reporter) = HealthReporter::init(HealthSettings::default());
        let cancel = CancellationToken::new();
        let reader = InboxReader::spawn(
            ReaderCheckpoint {
                l1_slot: 0,
                message_count: 0,
            },
            core,
            l1.clone(),
            Pubkey::new_unique(),
            health,
            idle_feed(),
            cancel.clone(),
        );

        tokio::time::timeout(Duration::from_secs(5), reader.wait_to_catch_up(l1.as_ref()))
            .await
            .unwrap()
            .unwrap();
        assert!(reader.progress().l1_slot >= 7);
        cancel.cancel();
    }
}
