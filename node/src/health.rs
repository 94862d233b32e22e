use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use log::{debug, error, info};
use serde::Serialize;
use share::health::{ConfigValue, HealthEvent, HEALTH_QUEUE_CAPACITY};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::config::HealthSettings;

/// Latest value per key, as exposed on the health endpoint.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub config: BTreeMap<String, ConfigValue>,
    /// Unix seconds of the last liveness signal per component.
    pub liveness: BTreeMap<String, u64>,
}

/// Producer side of the health event queue. Cheap to clone.
#[derive(Clone, Debug)]
pub struct HealthSender {
    tx: mpsc::Sender<HealthEvent>,
}

impl HealthSender {
    /// Queue an event; only waits when the queue is full.
    pub async fn log(&self, event: HealthEvent) {
        if self.tx.send(event).await.is_err() {
            debug!("Health reporter stopped, dropping event");
        }
    }
}

pub struct HealthReporter {
    rx: mpsc::Receiver<HealthEvent>,
    settings: HealthSettings,
}

impl HealthReporter {
    pub fn init(settings: HealthSettings) -> (HealthSender, Self) {
        let (tx, rx) = mpsc::channel(HEALTH_QUEUE_CAPACITY);
        (HealthSender { tx }, Self { rx, settings })
    }

    /// Spawn the drain task and, when an address is configured, the health HTTP server.
    pub fn start(self, cancel: CancellationToken) -> watch::Receiver<HealthSnapshot> {
        let (snapshot_tx, snapshot_rx) = watch::channel(HealthSnapshot::default());
        let HealthReporter { mut rx, settings } = self;

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                snapshot_tx.send_modify(|snapshot| apply(snapshot, event));
            }
        });

        if !settings.rpc_addr.is_empty() {
            let state = HealthState {
                snapshot: snapshot_rx.clone(),
                metrics: settings.metrics,
            };
            let addr = settings.rpc_addr.clone();
            tokio::spawn(async move {
                if let Err(e) = serve(addr, state, cancel).await {
                    error!("healthcheck server failed: {:#}", e);
                }
            });
        }

        snapshot_rx
    }
}

fn apply(snapshot: &mut HealthSnapshot, event: HealthEvent) {
    match event {
        HealthEvent::Config { key, value } => {
            snapshot.config.insert(key, value);
        }
        HealthEvent::Liveness { component } => {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default();
            snapshot.liveness.insert(component, now);
        }
    }
}

#[derive(Clone)]
struct HealthState {
    snapshot: watch::Receiver<HealthSnapshot>,
    metrics: bool,
}

async fn serve(addr: String, state: HealthState, cancel: CancellationToken) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/health", get(get_health))
        .route("/metrics", get(get_metrics))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Starting healthcheck server on {:?}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    Ok(())
}

async fn get_health(State(state): State<HealthState>) -> Json<HealthSnapshot> {
    Json(state.snapshot.borrow().clone())
}

async fn get_metrics(State(state): State<HealthState>) -> impl IntoResponse {
    if !state.metrics {
        return (StatusCode::NOT_FOUND, String::new());
    }
    (StatusCode::OK, render_metrics(&state.snapshot.borrow()))
}

fn render_metrics(snapshot: &HealthSnapshot) -> String {
    let mut out = String::new();
    for (key, value) in &snapshot.config {
        if let ConfigValue::Bool(b) = value {
            out.push_str(&format!("node_config{{key=\"{}\"}} {}\n", key, u8::from(*b)));
        }
    }
    for (component, seen) in &snapshot.liveness {
        out.push_str(&format!(
            "node_last_alive_seconds{{component=\"{}\"}} {}\n",
            component, seen
        ));
    }
    out
}
