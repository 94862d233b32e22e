use axum::{extract::State, routing::get, Json, Router};
use log::{error, info};
use serde::Serialize;
use share::PROFILING_ADDR;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Runtime introspection endpoint, served on its own listener.
#[derive(Debug, Clone)]
pub struct ProfilingServer {
    addr: String,
    started: Instant,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct RuntimeStats {
    pub num_workers: usize,
    pub num_alive_tasks: usize,
    pub global_queue_depth: usize,
    pub uptime_secs: u64,
}

impl Default for ProfilingServer {
    fn default() -> Self {
        Self::new(PROFILING_ADDR)
    }
}

impl ProfilingServer {
    pub fn new(addr: &str) -> Self {
        Self {
            addr: addr.to_owned(),
            started: Instant::now(),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Serve in the background. Failures are logged; profiling never stops the node.
    pub fn spawn(self, cancel: CancellationToken) {
        tokio::spawn(async move {
            let addr = self.addr().to_owned();
            if let Err(e) = self.serve(cancel).await {
                error!("profiling server on {} failed: {:#}", addr, e);
            }
        });
    }

    async fn serve(self, cancel: CancellationToken) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.addr).await?;
        info!("Starting profiling server on {:?}", self.addr);
        let app = Router::new()
            .route("/debug/runtime", get(runtime_stats))
            .with_state(self);
        axum::serve(listener, app)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await?;
        Ok(())
    }

    fn stats(&self) -> RuntimeStats {
        let metrics = tokio::runtime::Handle::current().metrics();
        RuntimeStats {
            num_workers: metrics.num_workers(),
            num_alive_tasks: metrics.num_alive_tasks(),
            global_queue_depth: metrics.global_queue_depth(),
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }
}

async fn runtime_stats(State(server): State<ProfilingServer>) -> Json<RuntimeStats> {
    Json(server.stats())
}
