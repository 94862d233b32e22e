//! Transaction batching in the selected [`BatcherMode`].

pub mod broadcaster;
mod tx_batcher;

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose, Engine};
use log::{error, info};
use serde_json::{json, Value};
use share::transaction::{encode_transaction, transaction_id};
use solana_sdk::{pubkey::Pubkey, transaction::Transaction};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{NodeError, NodeResult};
use crate::l1::L1Client;
use crate::mode::BatcherMode;
use crate::txdb::TxStore;
use crate::wallet::DataSigner;
use broadcaster::Broadcaster;
use tx_batcher::{request, BatchKind, BatcherCommand, TxBatcher, COMMAND_QUEUE};

const FORWARD_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything the batcher is constructed from.
///
/// `store` is a [`TxStore`], which only exists once the transaction index has opened.
pub struct BatcherSetup {
    pub mode: BatcherMode,
    pub client: Arc<dyn L1Client>,
    pub rollup: Pubkey,
    pub store: TxStore,
    pub max_batch_time: Duration,
    pub data_signer: Option<DataSigner>,
    /// Receives a report if the batcher task ends before cancellation.
    pub errors: mpsc::Sender<anyhow::Error>,
    pub cancel: CancellationToken,
}

/// Result of accepting a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub id: String,
    /// Position in the chain core, known only when this node sequences.
    pub sequence_number: Option<u64>,
}

enum Backend {
    Forwarder(Forwarder),
    Local(mpsc::Sender<BatcherCommand>),
}

pub struct Batcher {
    backend: Backend,
    mode_name: &'static str,
    store: TxStore,
}

impl Batcher {
    /// Construct the batcher for `setup.mode` and start its background task.
    pub async fn setup(setup: BatcherSetup) -> NodeResult<Arc<Self>> {
        let BatcherSetup {
            mode,
            client,
            rollup,
            store,
            max_batch_time,
            data_signer,
            errors,
            cancel,
        } = setup;
        let mode_name = mode.name();

        let backend = match mode {
            BatcherMode::Forwarder { target_url } => Backend::Forwarder(
                Forwarder::new(target_url).map_err(NodeError::ResourceInit)?,
            ),
            BatcherMode::Sequencer {
                identity,
                core,
                reader,
                delayed_messages_target_delay,
                broadcaster,
            } => {
                let broadcaster =
                    Broadcaster::start(broadcaster, core.clone(), data_signer, cancel.clone())
                        .await
                        .context("error starting feed output")
                        .map_err(NodeError::ResourceInit)?;
                info!("Feed output listening on {}", broadcaster.local_addr());
                let kind = BatchKind::Sequencer {
                    core,
                    reader,
                    broadcaster,
                    delayed_messages_target_delay,
                };
                spawn_batcher(
                    TxBatcher::new(client, identity, rollup, store.clone(), kind),
                    max_batch_time,
                    errors,
                    cancel,
                )
            }
            BatcherMode::Stateful { identity, inbox } => spawn_batcher(
                TxBatcher::new(client, identity, inbox, store.clone(), BatchKind::Stateful),
                max_batch_time,
                errors,
                cancel,
            ),
            BatcherMode::Stateless { identity, inbox } => spawn_batcher(
                TxBatcher::new(client, identity, inbox, store.clone(), BatchKind::Stateless),
                max_batch_time,
                errors,
                cancel,
            ),
        };
        info!("Started {} batcher for rollup {}", mode_name, rollup);

        Ok(Arc::new(Self {
            backend,
            mode_name,
            store,
        }))
    }

    pub fn mode_name(&self) -> &'static str {
        self.mode_name
    }

    /// Hand a validated transaction to the batcher.
    ///
    /// Local batchers reject duplicates inside their task, where submissions are serialized.
    pub async fn send_transaction(&self, txn: &Transaction) -> Result<SubmitReceipt> {
        let id = transaction_id(txn).ok_or_else(|| anyhow!("transaction has no signature"))?;

        match &self.backend {
            Backend::Forwarder(forwarder) => {
                if self.store.get_transaction(&id)?.is_some() {
                    return Err(anyhow!("transaction {} already known", id));
                }
                forwarder.forward(txn).await?;
                Ok(SubmitReceipt {
                    id,
                    sequence_number: None,
                })
            }
            Backend::Local(commands) => {
                let raw = encode_transaction(txn)?;
                let sequence_number = request(commands, |reply| BatcherCommand::Submit {
                    id: id.clone(),
                    raw,
                    reply,
                })
                .await??;
                Ok(SubmitReceipt {
                    id,
                    sequence_number,
                })
            }
        }
    }

    /// Messages accepted locally but not yet posted to L1.
    pub async fn pending_count(&self) -> Result<usize> {
        match &self.backend {
            Backend::Forwarder(_) => Ok(0),
            Backend::Local(commands) => {
                request(commands, |reply| BatcherCommand::PendingCount { reply }).await
            }
        }
    }

    /// Whether `id` is waiting in the batch queue. Only tracked with pending state enabled.
    pub async fn is_pending(&self, id: &str) -> Result<bool> {
        match &self.backend {
            Backend::Forwarder(_) => Ok(false),
            Backend::Local(commands) => {
                request(commands, |reply| BatcherCommand::IsPending {
                    id: id.to_owned(),
                    reply,
                })
                .await
            }
        }
    }
}

/// Start the batcher task and report on `errors` if it ends before `cancel` fires.
fn spawn_batcher(
    batcher: TxBatcher,
    max_batch_time: Duration,
    errors: mpsc::Sender<anyhow::Error>,
    cancel: CancellationToken,
) -> Backend {
    let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
    let task = tokio::spawn(batcher.run(rx, max_batch_time, cancel.clone()));
    tokio::spawn(async move {
        let err = match task.await {
            Ok(()) if cancel.is_cancelled() => return,
            Ok(()) => anyhow!("batcher task exited"),
            Err(e) => anyhow!("batcher task failed: {}", e),
        };
        error!("{:#}", err);
        let _ = errors.send(err).await;
    });
    Backend::Local(tx)
}

/// Relays transactions to another node's RPC.
struct Forwarder {
    client: reqwest::Client,
    target_url: String,
}

impl Forwarder {
    fn new(target_url: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(FORWARD_TIMEOUT)
            .build()
            .context("error building forwarding client")?;
        Ok(Self { client, target_url })
    }

    async fn forward(&self, txn: &Transaction) -> Result<()> {
        let encoded = general_purpose::STANDARD.encode(encode_transaction(txn)?);
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "sendTransaction",
            "params": [encoded, { "encoding": "base64" }],
        });
        let response: Value = self
            .client
            .post(&self.target_url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("error forwarding to {}", self.target_url))?
            .json()
            .await?;
        if let Some(err) = response.get("error").filter(|e| !e.is_null()) {
            return Err(anyhow!("forward target rejected transaction: {}", err));
        }
        Ok(())
    }
}
