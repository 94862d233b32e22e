use anyhow::Context;
use axum::{extract::State, http::StatusCode, response::Json, routing::post, Router};
use base64::{self, engine::general_purpose, Engine};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use share::utils::read_env_var;
use share::DEFAULT_RPC_HOST;
use solana_sdk::{bs58, transaction::Transaction};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use crate::aggregator::{Aggregator, TxStatus};

// JSON-RPC request structure
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    pub params: Option<Value>,
}

// JSON-RPC response structure
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
}

const INVALID_PARAMS: i32 = -32602;
const METHOD_NOT_FOUND: i32 = -32601;
const INTERNAL_ERROR: i32 = -32603;
const VALIDATION_FAILED: i32 = -32003;

impl JsonRpcResponse {
    fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    fn failure(id: Value, code: i32, message: String) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError { code, message }),
        }
    }
}

/// Public JSON-RPC server in front of the aggregator.
pub struct RpcServer {
    aggregator: Arc<Aggregator>,
}

impl RpcServer {
    pub fn new(aggregator: Arc<Aggregator>) -> Self {
        Self { aggregator }
    }

    /// Serve on every port in the background. Bind and serve failures arrive on the channel.
    pub fn launch(self, ports: &[&str], cancel: CancellationToken) -> mpsc::Receiver<anyhow::Error> {
        let host = read_env_var("ROLLUP_NODE_RPC_HOST", DEFAULT_RPC_HOST.to_owned());
        let (err_tx, err_rx) = mpsc::channel(ports.len().max(1));
        let app = Router::new()
            .route("/", post(handle_rpc_request))
            .layer(CorsLayer::permissive())
            .with_state(self.aggregator);

        for port in ports {
            let addr = format!("{}:{}", host, port);
            let app = app.clone();
            let err_tx = err_tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = serve(&addr, app, cancel).await {
                    error!("RPC server on {} failed: {:#}", addr, e);
                    let _ = err_tx.send(e).await;
                }
            });
        }
        err_rx
    }
}

async fn serve(addr: &str, app: Router, cancel: CancellationToken) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("error binding RPC server to {}", addr))?;
    info!("Starting node rpc server on {:?}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .with_context(|| format!("RPC server on {} stopped", addr))?;
    Ok(())
}

// Main RPC handler
async fn handle_rpc_request(
    State(aggregator): State<Arc<Aggregator>>,
    Json(request): Json<JsonRpcRequest>,
) -> Result<Json<JsonRpcResponse>, StatusCode> {
    info!("Received rpc request of method: {:?}", request.method);
    Ok(Json(dispatch(&aggregator, request).await))
}

async fn dispatch(aggregator: &Aggregator, request: JsonRpcRequest) -> JsonRpcResponse {
    match request.method.as_str() {
        "getHealth" => JsonRpcResponse::success(request.id, serde_json::json!("ok")),
        "getVersion" => get_version(aggregator, request.id),
        "sendTransaction" => send_transaction(aggregator, request.id, request.params).await,
        "getTransaction" => get_transaction(aggregator, request.id, request.params).await,
        "getMessageCount" => match aggregator.message_count() {
            Ok(count) => JsonRpcResponse::success(request.id, serde_json::json!(count)),
            Err(e) => JsonRpcResponse::failure(request.id, INTERNAL_ERROR, format!("{:#}", e)),
        },
        "getRollupAddress" => JsonRpcResponse::success(
            request.id,
            serde_json::json!(aggregator.rollup().to_string()),
        ),
        "getPendingCount" => match aggregator.pending_count().await {
            Ok(count) => JsonRpcResponse::success(request.id, serde_json::json!(count)),
            Err(e) => JsonRpcResponse::failure(request.id, INTERNAL_ERROR, format!("{:#}", e)),
        },
        _ => JsonRpcResponse {
            jsonrpc: request.jsonrpc,
            id: request.id,
            result: None,
            error: Some(JsonRpcError {
                code: METHOD_NOT_FOUND,
                message: "Method not found".to_string(),
            }),
        },
    }
}

// Version information
fn get_version(aggregator: &Aggregator, id: Value) -> JsonRpcResponse {
    JsonRpcResponse::success(
        id,
        serde_json::json!({
            "rollup-node": env!("CARGO_PKG_VERSION"),
            "mode": aggregator.mode_name(),
        }),
    )
}

// Send transaction
async fn send_transaction(aggregator: &Aggregator, id: Value, params: Option<Value>) -> JsonRpcResponse {
    let transaction = match parse_and_decode_transaction(&id, params) {
        Ok(tx) => tx,
        Err(error_response) => return error_response,
    };

    match aggregator.send_transaction(&transaction).await {
        Ok(receipt) => JsonRpcResponse::success(id, serde_json::json!(receipt.id)),
        Err(e) => {
            warn!("Transaction rejected: {:#}", e);
            JsonRpcResponse::failure(id, VALIDATION_FAILED, format!("{:#}", e))
        }
    }
}

// Get Transaction
async fn get_transaction(aggregator: &Aggregator, id: Value, params: Option<Value>) -> JsonRpcResponse {
    let signature: String = match params
        .as_ref()
        .and_then(|p| p.as_array())
        .and_then(|arr| arr.first())
        .and_then(|v| v.as_str())
    {
        Some(sig) => sig.to_string(),
        None => {
            return JsonRpcResponse::failure(
                id,
                INVALID_PARAMS,
                "Invalid params: transaction signature required".to_string(),
            );
        }
    };

    match aggregator.transaction_status(&signature).await {
        Ok(TxStatus::Sequenced(record)) => JsonRpcResponse::success(
            id,
            serde_json::json!({
                "sequenceNumber": record.sequence_number,
                "transaction": [general_purpose::STANDARD.encode(&record.raw), "base64"],
            }),
        ),
        Ok(TxStatus::Pending) => {
            JsonRpcResponse::success(id, serde_json::json!({ "status": "pending" }))
        }
        Ok(TxStatus::Unknown) => JsonRpcResponse::success(id, Value::Null),
        Err(e) => JsonRpcResponse::failure(id, INTERNAL_ERROR, format!("{:#}", e)),
    }
}

// Parse and decode transaction from RPC parameters
fn parse_and_decode_transaction(
    id: &Value,
    params: Option<Value>,
) -> Result<Transaction, JsonRpcResponse> {
    let (transaction_str, encoding) = match params.as_ref().and_then(|p| p.as_array()) {
        Some(arr) => {
            let tx_str = arr.first().and_then(|v| v.as_str()).unwrap_or("");
            let encoding = arr
                .get(1)
                .and_then(|v| v.as_object())
                .and_then(|obj| obj.get("encoding"))
                .and_then(|v| v.as_str())
                .unwrap_or("base64");
            (tx_str.to_string(), encoding)
        }
        None => {
            return Err(JsonRpcResponse::failure(
                id.clone(),
                INVALID_PARAMS,
                "Invalid params".to_string(),
            ));
        }
    };

    // Decode transaction
    let transaction_bytes = match encoding {
        "base64" => general_purpose::STANDARD
            .decode(&transaction_str)
            .map_err(|e| invalid(id, format!("Invalid base64 transaction: {}", e)))?,
        "base58" => bs58::decode(&transaction_str)
            .into_vec()
            .map_err(|e| invalid(id, format!("Invalid base58 transaction: {}", e)))?,
        _ => return Err(invalid(id, format!("Unsupported encoding: {}", encoding))),
    };

    bincode::deserialize(&transaction_bytes)
        .map_err(|e| invalid(id, format!("Invalid transaction format: {}", e)))
}

fn invalid(id: &Value, message: String) -> JsonRpcResponse {
    error!("{}", message);
    JsonRpcResponse::failure(id.clone(), INVALID_PARAMS, message)
}
