//! # HTTP API
//!
//! The node's front door. All handlers share [`AppState`] through axum's
//! `State` extractor.
//!
//! ## Endpoints
//!
//! | Method | Path                       | Description                          |
//! |--------|----------------------------|--------------------------------------|
//! | GET    | `/health`                  | Liveness probe                       |
//! | GET    | `/status`                  | Lifecycle, readiness, quorum, height |
//! | POST   | `/tx`                      | Submit a transaction for ordering    |
//! | GET    | `/accounts/:account/nonce` | Next nonce the engine expects        |
//! | GET    | `/metrics`                 | Prometheus exposition                |

use axum::{
    extract::{FromRef, Path, State},
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use rbft_order::network::{Node, OrderError};
use rbft_order::transaction::Transaction;

use crate::metrics::{metrics_handler, SharedMetrics};

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Cheap to clone. Everything is behind `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub version: String,
    pub node: Arc<Node>,
    pub metrics: SharedMetrics,
}

impl FromRef<AppState> for SharedMetrics {
    fn from_ref(state: &AppState) -> Self {
        state.metrics.clone()
    }
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/tx", post(submit_handler))
        .route("/accounts/:account/nonce", get(nonce_handler))
        .route("/metrics", get(metrics_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request / Response Types
// ---------------------------------------------------------------------------

/// `POST /tx` body. Binary fields are hex.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub from: String,
    #[serde(default)]
    pub to: String,
    pub nonce: u64,
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub signature: String,
}

impl SubmitRequest {
    fn into_transaction(self) -> Result<Transaction, String> {
        let payload = hex::decode(&self.payload).map_err(|e| format!("payload: {e}"))?;
        let signature = hex::decode(&self.signature).map_err(|e| format!("signature: {e}"))?;
        Ok(Transaction {
            from: self.from,
            to: self.to,
            nonce: self.nonce,
            payload,
            timestamp: self.timestamp,
            signature,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub hash: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub id: u64,
    pub lifecycle: String,
    pub ready: bool,
    /// Why the node is not ready, or "Normal".
    pub status: String,
    pub quorum: u64,
    pub peers: usize,
    pub committed_height: u64,
    pub head_hash: String,
    pub state_updating: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NonceResponse {
    pub account: String,
    pub nonce: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, error: impl ToString) -> axum::response::Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

/// Backpressure is 503 so clients retry; everything else is a bad request.
fn submit_error_status(e: &OrderError) -> StatusCode {
    match e {
        OrderError::NotReady(_)
        | OrderError::Busy
        | OrderError::Lifecycle(_)
        | OrderError::Exhausted
        | OrderError::Cache(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::BAD_REQUEST,
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /health`: 200 while the process is alive. Readiness is `/status`.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

/// `GET /status`
async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let node = &state.node;
    let ready = node.ready();
    state.metrics.set_ready(ready.is_ok());
    let (committed_height, head_hash) = node.head();

    Json(StatusResponse {
        version: state.version.clone(),
        id: node.id(),
        lifecycle: node.state().to_string(),
        ready: ready.is_ok(),
        status: match ready {
            Ok(()) => "Normal".to_string(),
            Err(e) => e.to_string(),
        },
        quorum: node.quorum(),
        peers: node.peers().len(),
        committed_height,
        head_hash: hex::encode(head_hash),
        state_updating: node.is_state_updating(),
    })
}

/// `POST /tx`: 202 once the transaction is in the cache. Acceptance is not
/// ordering; watch `/status` height or the account nonce.
async fn submit_handler(
    State(state): State<AppState>,
    Json(req): Json<SubmitRequest>,
) -> axum::response::Response {
    let tx = match req.into_transaction() {
        Ok(tx) => tx,
        Err(e) => {
            state.metrics.transactions_rejected_total.inc();
            return error_response(StatusCode::BAD_REQUEST, e);
        }
    };
    let hash = tx.hash_hex();

    match state.node.prepare(tx) {
        Ok(()) => {
            state.metrics.transactions_submitted_total.inc();
            (StatusCode::ACCEPTED, Json(SubmitResponse { hash })).into_response()
        }
        Err(e) => {
            state.metrics.transactions_rejected_total.inc();
            tracing::debug!(hash = %hash, error = %e, "transaction refused");
            error_response(submit_error_status(&e), e)
        }
    }
}

/// `GET /accounts/:account/nonce`
async fn nonce_handler(
    State(state): State<AppState>,
    Path(account): Path<String>,
) -> impl IntoResponse {
    let nonce = state.node.pending_nonce(&account);
    Json(NonceResponse { account, nonce })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use rbft_order::crypto::keys::ReplicaKeypair;
    use rbft_order::network::{MemoryTransport, SoloEngine};
    use rbft_order::storage::SledStore;
    use rbft_order::OrderConfig;

    use crate::metrics::OrderMetrics;

    fn test_app_state() -> AppState {
        let keypair = ReplicaKeypair::from_seed(&[1; 32]);
        let config = OrderConfig::solo(1, &keypair.public_key());
        let store = Arc::new(SledStore::open_temporary().unwrap());
        let node = Node::new(
            &config,
            keypair,
            Arc::new(MemoryTransport::new(1)),
            store,
            SoloEngine::build,
        )
        .unwrap();
        AppState {
            version: "test".into(),
            node: Arc::new(node),
            metrics: Arc::new(OrderMetrics::new().unwrap()),
        }
    }

    async fn get(router: &Router, path: &str) -> (StatusCode, Vec<u8>) {
        let req = Request::builder().uri(path).body(Body::empty()).unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes().to_vec();
        (status, body)
    }

    async fn post_json(
        router: &Router,
        path: &str,
        body: serde_json::Value,
    ) -> (StatusCode, Vec<u8>) {
        let req = Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes().to_vec();
        (status, body)
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let router = create_router(test_app_state());
        let (status, body) = get(&router, "/health").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn status_reflects_lifecycle() {
        let state = test_app_state();
        let router = create_router(state.clone());

        let (_, body) = get(&router, "/status").await;
        let status: StatusResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(status.lifecycle, "stopped");
        assert!(!status.ready);
        assert_eq!(status.status, "node is stopped");

        state.node.start().unwrap();
        let (code, body) = get(&router, "/status").await;
        assert_eq!(code, StatusCode::OK);
        let status: StatusResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(status.lifecycle, "running");
        assert!(status.ready);
        assert_eq!(status.quorum, 1);
        assert_eq!(status.peers, 1);
        assert_eq!(status.committed_height, 0);
        state.node.stop();
    }

    #[tokio::test]
    async fn submit_is_refused_until_started() {
        let state = test_app_state();
        let router = create_router(state.clone());
        let tx = serde_json::json!({ "from": "alice", "nonce": 1, "payload": "00ff" });

        let (code, body) = post_json(&router, "/tx", tx.clone()).await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        let err: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(err.error, "node is stopped");

        state.node.start().unwrap();
        let (code, body) = post_json(&router, "/tx", tx).await;
        assert_eq!(code, StatusCode::ACCEPTED);
        let resp: SubmitResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(resp.hash, Transaction::new("alice", 1, vec![0x00, 0xff]).hash_hex());

        let (_, body) = get(&router, "/metrics").await;
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("order_transactions_submitted_total 1"));
        assert!(text.contains("order_transactions_rejected_total 1"));
        state.node.stop();
    }

    #[tokio::test]
    async fn malformed_payload_is_bad_request() {
        let state = test_app_state();
        state.node.start().unwrap();
        let router = create_router(state.clone());

        let tx = serde_json::json!({ "from": "alice", "nonce": 1, "payload": "zz" });
        let (code, body) = post_json(&router, "/tx", tx).await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
        let err: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert!(err.error.starts_with("payload"));
        state.node.stop();
    }

    #[tokio::test]
    async fn nonce_endpoint_starts_at_one() {
        let router = create_router(test_app_state());
        let (code, body) = get(&router, "/accounts/alice/nonce").await;
        assert_eq!(code, StatusCode::OK);
        let resp: NonceResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(resp.account, "alice");
        assert_eq!(resp.nonce, 1);
    }
}
