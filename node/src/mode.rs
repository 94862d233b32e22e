//! Batch submission mode selection.
//!
//! Exactly one [`BatcherMode`] is produced per process. The choice itself is a pure function of
//! the configuration and the resolved identity; the async wrapper only performs the identity and
//! balance resolution that non-forwarding modes require.

use anyhow::anyhow;
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::error::{NodeError, NodeResult};
use crate::inbox::InboxReader;
use crate::l1::L1Client;
use crate::monitor::CoreHandle;
use crate::wallet::Identity;
use solana_sdk::pubkey::Pubkey;

pub const BROADCASTER_WORKERS: usize = 128;
pub const BROADCASTER_QUEUE: usize = 1;
pub const BROADCASTER_IO_TIMEOUT: Duration = Duration::from_secs(2);

const BALANCE_ATTEMPTS: usize = 10;
const BALANCE_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Settings of the sequencer feed output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcasterSettings {
    pub addr: String,
    pub workers: usize,
    pub queue: usize,
    pub io_read_write_timeout: Duration,
    pub client_ping_interval: Duration,
    pub client_no_response_timeout: Duration,
}

impl BroadcasterSettings {
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            addr: format!("{}:{}", config.feed_output.addr, config.feed_output.port),
            workers: BROADCASTER_WORKERS,
            queue: BROADCASTER_QUEUE,
            io_read_write_timeout: BROADCASTER_IO_TIMEOUT,
            client_ping_interval: config.feed_output.ping_interval,
            client_no_response_timeout: config.feed_output.timeout,
        }
    }
}

/// Handles only the sequencer mode needs.
#[derive(Clone)]
pub struct SequencerHandles {
    pub core: CoreHandle,
    pub reader: Arc<InboxReader>,
}

#[derive(Clone)]
pub enum BatcherMode {
    Forwarder {
        target_url: String,
    },
    Sequencer {
        identity: Identity,
        core: CoreHandle,
        reader: Arc<InboxReader>,
        delayed_messages_target_delay: u64,
        broadcaster: BroadcasterSettings,
    },
    Stateful {
        identity: Identity,
        inbox: Pubkey,
    },
    Stateless {
        identity: Identity,
        inbox: Pubkey,
    },
}

impl BatcherMode {
    pub fn name(&self) -> &'static str {
        match self {
            BatcherMode::Forwarder { .. } => "forwarder",
            BatcherMode::Sequencer { .. } => "sequencer",
            BatcherMode::Stateful { .. } => "stateful",
            BatcherMode::Stateless { .. } => "stateless",
        }
    }

    pub fn identity(&self) -> Option<&Identity> {
        match self {
            BatcherMode::Forwarder { .. } => None,
            BatcherMode::Sequencer { identity, .. }
            | BatcherMode::Stateful { identity, .. }
            | BatcherMode::Stateless { identity, .. } => Some(identity),
        }
    }
}

// Handles compare by identity: two modes are equal when they share the same core and reader.
impl PartialEq for BatcherMode {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                BatcherMode::Forwarder { target_url: a },
                BatcherMode::Forwarder { target_url: b },
            ) => a == b,
            (
                BatcherMode::Sequencer {
                    identity: ia,
                    core: ca,
                    reader: ra,
                    delayed_messages_target_delay: da,
                    broadcaster: ba,
                },
                BatcherMode::Sequencer {
                    identity: ib,
                    core: cb,
                    reader: rb,
                    delayed_messages_target_delay: db,
                    broadcaster: bb,
                },
            ) => ia == ib && Arc::ptr_eq(ca, cb) && Arc::ptr_eq(ra, rb) && da == db && ba == bb,
            (
                BatcherMode::Stateful {
                    identity: ia,
                    inbox: xa,
                },
                BatcherMode::Stateful {
                    identity: ib,
                    inbox: xb,
                },
            )
            | (
                BatcherMode::Stateless {
                    identity: ia,
                    inbox: xa,
                },
                BatcherMode::Stateless {
                    identity: ib,
                    inbox: xb,
                },
            ) => ia == ib && xa == xb,
            _ => false,
        }
    }
}

impl std::fmt::Debug for BatcherMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatcherMode::Forwarder { target_url } => f
                .debug_struct("Forwarder")
                .field("target_url", target_url)
                .finish(),
            BatcherMode::Sequencer {
                identity,
                delayed_messages_target_delay,
                broadcaster,
                ..
            } => f
                .debug_struct("Sequencer")
                .field("identity", identity)
                .field("delayed_messages_target_delay", delayed_messages_target_delay)
                .field("broadcaster", broadcaster)
                .finish_non_exhaustive(),
            BatcherMode::Stateful { identity, inbox } => f
                .debug_struct("Stateful")
                .field("identity", identity)
                .field("inbox", inbox)
                .finish(),
            BatcherMode::Stateless { identity, inbox } => f
                .debug_struct("Stateless")
                .field("identity", identity)
                .field("inbox", inbox)
                .finish(),
        }
    }
}

/// Pick the batcher mode. Pure: no I/O, same inputs give the same mode.
pub fn select_batcher_mode(
    config: &NodeConfig,
    identity: Option<&Identity>,
    sequencer: Option<&SequencerHandles>,
) -> NodeResult<BatcherMode> {
    if let Some(url) = &config.forward_url {
        return Ok(BatcherMode::Forwarder {
            target_url: url.clone(),
        });
    }

    let identity = identity
        .cloned()
        .ok_or_else(|| NodeError::Wallet(anyhow!("batch submission requires a signing identity")))?;

    if config.sequencer {
        let handles = sequencer.ok_or_else(|| {
            NodeError::ResourceInit(anyhow!("sequencer mode requires the chain core and inbox reader"))
        })?;
        return Ok(BatcherMode::Sequencer {
            identity,
            core: handles.core.clone(),
            reader: handles.reader.clone(),
            delayed_messages_target_delay: config.delayed_messages_target_delay,
            broadcaster: BroadcasterSettings::from_config(config),
        });
    }

    let inbox = config.inbox_address.ok_or(NodeError::MissingInboxAddress)?;
    if config.keep_pending_state {
        Ok(BatcherMode::Stateful { identity, inbox })
    } else {
        Ok(BatcherMode::Stateless { identity, inbox })
    }
}

/// Resolve the identity (non-forwarder modes only), wait for its balance, then select.
pub async fn resolve_batcher_mode<L>(
    config: &NodeConfig,
    client: &dyn L1Client,
    load_identity: L,
    sequencer: Option<&SequencerHandles>,
    cancel: &CancellationToken,
) -> NodeResult<BatcherMode>
where
    L: FnOnce() -> NodeResult<Identity>,
{
    if let Some(url) = &config.forward_url {
        info!("Rollup node starting in forwarder mode, forwarding to {}", url);
        return select_batcher_mode(config, None, None);
    }

    let identity = load_identity()?;
    if !config.sequencer && config.inbox_address.is_none() {
        return Err(NodeError::MissingInboxAddress);
    }
    info!("Rollup node submitting batches from {}", identity.pubkey());
    wait_for_balance(client, &identity.pubkey(), cancel).await?;

    let mode = select_batcher_mode(config, Some(&identity), sequencer)?;
    info!("Selected {} batcher mode", mode.name());
    Ok(mode)
}

/// Block until the balance of `account` can be read.
pub async fn wait_for_balance(
    client: &dyn L1Client,
    account: &Pubkey,
    cancel: &CancellationToken,
) -> NodeResult<u64> {
    let mut last_err = None;
    for attempt in 1..=BALANCE_ATTEMPTS {
        match client.balance(account).await {
            Ok(balance) => {
                if balance == 0 {
                    warn!("Batch submitter {} has zero balance", account);
                }
                return Ok(balance);
            }
            Err(e) => {
                warn!(
                    "Balance of {} unavailable (attempt {}/{}): {:#}",
                    account, attempt, BALANCE_ATTEMPTS, e
                );
                last_err = Some(e);
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(NodeError::Cancelled),
            _ = tokio::time::sleep(BALANCE_RETRY_INTERVAL) => {}
        }
    }
    let err = last_err.unwrap_or_else(|| anyhow!("balance unavailable"));
    Err(NodeError::Wallet(err.context("error waiting for balance")))
}
