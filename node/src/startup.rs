//! Ordered bring-up of the node and hand-off to the supervisor.

use log::{error, info};
use share::health::HealthEvent;
use share::{RPC_PRIMARY_PORT, RPC_SECONDARY_PORT};
use std::ffi::OsString;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::aggregator::Aggregator;
use crate::batcher::{Batcher, BatcherSetup};
use crate::config::{parse_args, LogArgs, NodeConfig};
use crate::error::{NodeError, NodeResult};
use crate::feed::{idle_feed, FeedSubscriber};
use crate::health::{HealthReporter, HealthSender};
use crate::inbox::{start_with_retry, InboxReader, READER_RETRY_INTERVAL};
use crate::l1::{connect_l1, L1Client, L1Connector};
use crate::mode::{resolve_batcher_mode, BatcherMode, SequencerHandles};
use crate::monitor::Monitor;
use crate::profiling::ProfilingServer;
use crate::rpc::RpcServer;
use crate::supervisor::{supervise, TerminalSignals, SHUTDOWN_MESSAGE};
use crate::txdb::{TxStore, TXDB_POLL_INTERVAL};
use crate::wallet::load_identity;

/// Run the node until a terminal event. `Ok(())` means a requested shutdown.
pub async fn run<I, T>(
    args: I,
    connector: &dyn L1Connector,
    cancel: CancellationToken,
) -> NodeResult<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let result = match parse_args(args) {
        Ok(config) => {
            init_logging(&config.log);
            run_node(&config, connector, &cancel).await
        }
        Err(e) => {
            init_logging(&LogArgs::default());
            log_stopped(&e);
            Err(e)
        }
    };
    if result.is_err() {
        // Stop anything spawned before the failing stage.
        cancel.cancel();
    }
    result
}

/// Terminal log lines for a node that never reached the supervisor.
fn log_stopped(err: &NodeError) {
    if !err.is_cancelled() {
        error!("Error running node: {}", err);
    }
    info!("{}", SHUTDOWN_MESSAGE);
}

async fn run_node(
    config: &NodeConfig,
    connector: &dyn L1Connector,
    cancel: &CancellationToken,
) -> NodeResult<()> {
    let node = start_node(config, connector, cancel).await;
    let RunningNode {
        monitor,
        store,
        store_errors,
        batcher_errors,
        rpc_errors,
    } = match node {
        Ok(node) => node,
        Err(e) => {
            log_stopped(&e);
            return Err(e);
        }
    };

    let result = supervise(
        store,
        TerminalSignals {
            store_errors,
            batcher_errors,
            rpc_errors,
            cancel: cancel.clone(),
        },
    )
    .await;
    monitor.close();
    result
}

/// Resources held once every stage before the supervisor is up.
struct RunningNode {
    monitor: Monitor,
    store: TxStore,
    store_errors: mpsc::Receiver<NodeError>,
    batcher_errors: mpsc::Receiver<anyhow::Error>,
    rpc_errors: mpsc::Receiver<anyhow::Error>,
}

async fn start_node(
    config: &NodeConfig,
    connector: &dyn L1Connector,
    cancel: &CancellationToken,
) -> NodeResult<RunningNode> {
    let feed = if config.subscribes_to_feed() {
        let url = config.sequencer_url.clone().unwrap_or_default();
        FeedSubscriber::new(url).connect(cancel.clone()).await?
    } else {
        idle_feed()
    };

    if config.enable_pprof {
        ProfilingServer::default().spawn(cancel.clone());
    }

    let (client, _chain_id) = connect_l1(connector, &config.l1_url).await?;
    let monitor = Monitor::open(&config.checkpoint_db, &config.contract_file)?;

    let (health, reporter) = HealthReporter::init(config.health.clone());
    reporter.start(cancel.clone());
    log_health_config(&health, config).await;

    let rollup = config.rollup_address;
    let checkpoint = start_with_retry(
        cancel,
        READER_RETRY_INTERVAL,
        &config.l1_url,
        &rollup,
        || InboxReader::connect(client.as_ref(), &monitor.core, &rollup),
    )
    .await?;
    let reader = InboxReader::spawn(
        checkpoint,
        monitor.core.clone(),
        client.clone(),
        rollup,
        health,
        feed,
        cancel.clone(),
    );

    let sequencer = config.sequencer.then(|| SequencerHandles {
        core: monitor.core.clone(),
        reader: reader.clone(),
    });
    let mode = resolve_batcher_mode(
        config,
        client.as_ref(),
        || load_identity(&config.validator_folder, &config.wallet),
        sequencer.as_ref(),
        cancel,
    )
    .await?;

    let (store, store_errors) = TxStore::open(
        monitor.core.clone(),
        monitor.node_store()?,
        rollup,
        TXDB_POLL_INTERVAL,
        cancel,
    )?;

    let (batcher_tx, batcher_errors) = mpsc::channel(1);
    let services = launch_services(config, client, &reader, mode, store.clone(), batcher_tx, cancel);
    let rpc_errors = match services.await {
        Ok(rpc_errors) => rpc_errors,
        Err(e) => {
            store.close();
            monitor.close();
            return Err(e);
        }
    };

    Ok(RunningNode {
        monitor,
        store,
        store_errors,
        batcher_errors,
        rpc_errors,
    })
}

/// Catch up if asked, then batcher, aggregator and public RPC, in that order.
async fn launch_services(
    config: &NodeConfig,
    client: Arc<dyn L1Client>,
    reader: &InboxReader,
    mode: BatcherMode,
    store: TxStore,
    batcher_errors: mpsc::Sender<anyhow::Error>,
    cancel: &CancellationToken,
) -> NodeResult<mpsc::Receiver<anyhow::Error>> {
    if config.wait_to_catch_up {
        tokio::select! {
            _ = cancel.cancelled() => return Err(NodeError::Cancelled),
            caught_up = reader.wait_to_catch_up(client.as_ref()) => {
                caught_up.map_err(NodeError::Connection)?;
            }
        }
    }

    let data_signer = mode
        .identity()
        .filter(|_| config.sequencer)
        .map(|identity| identity.data_signer());
    let batcher = Batcher::setup(BatcherSetup {
        mode,
        client,
        rollup: config.rollup_address,
        store: store.clone(),
        max_batch_time: config.max_batch_time,
        data_signer,
        errors: batcher_errors,
        cancel: cancel.clone(),
    })
    .await?;

    let aggregator = Arc::new(Aggregator::new(batcher, config.rollup_address, store));
    Ok(RpcServer::new(aggregator).launch(&[RPC_PRIMARY_PORT, RPC_SECONDARY_PORT], cancel.clone()))
}

async fn log_health_config(health: &HealthSender, config: &NodeConfig) {
    let settings = &config.health;
    health
        .log(HealthEvent::config_bool("healthcheckMetrics", settings.metrics))
        .await;
    health
        .log(HealthEvent::config_bool(
            "disablePrimaryCheck",
            settings.disable_primary_check,
        ))
        .await;
    health
        .log(HealthEvent::config_bool("disableL1Check", settings.disable_l1_check))
        .await;
    health
        .log(HealthEvent::config_str("healthcheckRPC", settings.rpc_addr.as_str()))
        .await;
    if let Some(url) = &config.forward_url {
        health
            .log(HealthEvent::config_str("primaryHealthcheckRPC", url.as_str()))
            .await;
    }
    health
        .log(HealthEvent::config_str("l1HealthcheckRPC", config.l1_url.as_str()))
        .await;
}

/// Install the global logger; `RUST_LOG` overrides `--log.level`.
pub fn init_logging(log: &LogArgs) {
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(log.level.as_str()),
    )
    .try_init();
}
