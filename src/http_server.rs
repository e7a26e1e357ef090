use std::sync::Arc;

use axum::{routing::get, Json};
use prometheus_client::{encoding::text::encode, registry::Registry};
use tokio_util::sync::CancellationToken;

use crate::{
    pipeline::{runner::Runner, share_rate::SnapshotRunner},
    types::chain::Chain,
};

/// Progress of a running importer, served on `/status`.
pub trait Status: Send + Sync {
    fn status(&self) -> serde_json::Value;
}

impl Status for Runner {
    fn status(&self) -> serde_json::Value {
        serde_json::json!({
            "stage": format!("{:?}", self.stage()),
            "last_imported_block": self.last_imported(),
        })
    }
}

impl Status for SnapshotRunner {
    fn status(&self) -> serde_json::Value {
        serde_json::json!({
            "stage": format!("{:?}", self.stage()),
            "last_imported_datetime": self.last_imported(),
        })
    }
}

async fn get_status(status: Arc<dyn Status>, chain: Chain) -> Json<serde_json::Value> {
    let mut status = status.status();
    status["chain"] = serde_json::json!(chain);
    Json(status)
}

async fn get_metrics(registry: Arc<Registry>) -> String {
    let mut buffer = String::new();
    encode(&mut buffer, &registry).unwrap();
    buffer
}

pub struct Server {
    router: axum::Router,
}

impl Server {
    pub fn new(status: Arc<dyn Status>, chain: Chain, metrics_registry: Registry) -> Self {
        let metrics_registry = Arc::new(metrics_registry);
        let router = axum::Router::new()
            .route("/status", get(move || get_status(status, chain)))
            .route("/metrics", get(move || get_metrics(metrics_registry)));
        let router = Self::add_common_layers(router);
        Self { router }
    }

    pub async fn run(self, port: u16, cancellation_token: CancellationToken) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
        axum::serve(listener, self.router)
            .with_graceful_shutdown(cancellation_token.cancelled_owned())
            .await?;
        Ok(())
    }

    fn add_common_layers(router: axum::Router) -> axum::Router {
        router
            .layer(sentry_tower::NewSentryLayer::new_from_top())
            .layer(sentry_tower::SentryHttpLayer::with_transaction())
            .layer(tower_http::catch_panic::CatchPanicLayer::new())
    }
}
