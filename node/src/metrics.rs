//! # Prometheus Metrics
//!
//! Ordering metrics, registered in a dedicated [`prometheus::Registry`]
//! under the `order` prefix and served at `GET /metrics`.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::core::Collector;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

use rbft_order::block::CommitEvent;

#[derive(Clone)]
pub struct OrderMetrics {
    registry: Registry,
    pub blocks_committed_total: IntCounter,
    pub transactions_committed_total: IntCounter,
    /// Transactions accepted by `prepare`.
    pub transactions_submitted_total: IntCounter,
    /// Transactions refused by `prepare`, for any reason.
    pub transactions_rejected_total: IntCounter,
    pub committed_height: IntGauge,
    /// 1 while the engine reports `Normal`.
    pub engine_ready: IntGauge,
}

fn register<T: Collector + Clone + 'static>(registry: &Registry, metric: T) -> prometheus::Result<T> {
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

impl OrderMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("order".into()), None)?;

        Ok(Self {
            blocks_committed_total: register(
                &registry,
                IntCounter::new("blocks_committed_total", "Blocks delivered on the commit stream")?,
            )?,
            transactions_committed_total: register(
                &registry,
                IntCounter::new(
                    "transactions_committed_total",
                    "Transactions included in committed blocks",
                )?,
            )?,
            transactions_submitted_total: register(
                &registry,
                IntCounter::new(
                    "transactions_submitted_total",
                    "Transactions accepted into the transaction cache",
                )?,
            )?,
            transactions_rejected_total: register(
                &registry,
                IntCounter::new(
                    "transactions_rejected_total",
                    "Transactions refused at submission",
                )?,
            )?,
            committed_height: register(
                &registry,
                IntGauge::new("committed_height", "Height of the last committed block")?,
            )?,
            engine_ready: register(
                &registry,
                IntGauge::new("engine_ready", "1 when the engine is in Normal status")?,
            )?,
            registry,
        })
    }

    pub fn record_commit(&self, event: &CommitEvent) {
        self.blocks_committed_total.inc();
        self.transactions_committed_total
            .inc_by(event.block.transactions.len() as u64);
        self.committed_height.set(event.block.height() as i64);
    }

    pub fn set_ready(&self, ready: bool) {
        self.engine_ready.set(i64::from(ready));
    }

    /// Render every registered metric in the text exposition format.
    pub fn encode(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

pub type SharedMetrics = Arc<OrderMetrics>;

/// `GET /metrics`
pub async fn metrics_handler(State(metrics): State<SharedMetrics>) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}
