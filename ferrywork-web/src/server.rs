//! The dashboard HTTP server.
//!
//! ```rust,no_run
//! use ferrywork::{config::DashboardConfig, queue::MemoryQueue};
//! use ferrywork_web::WebDashboard;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let dashboard = WebDashboard::new(DashboardConfig::default(), Arc::new(MemoryQueue::new()));
//!     dashboard.start(CancellationToken::new()).await
//! }
//! ```

use crate::{Result, api};
use ferrywork::{JobQueue, config::DashboardConfig};
use serde_json::json;
use std::{convert::Infallible, future::Future, net::SocketAddr, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use warp::{Filter, Rejection, Reply, http::StatusCode};

/// Read-only dashboard over one job store.
pub struct WebDashboard {
    config: DashboardConfig,
    queue: Arc<dyn JobQueue>,
}

impl WebDashboard {
    pub fn new(config: DashboardConfig, queue: Arc<dyn JobQueue>) -> Self {
        Self { config, queue }
    }

    pub fn config(&self) -> &DashboardConfig {
        &self.config
    }

    /// Bind the listener. The returned future serves requests until
    /// `shutdown` is cancelled, then finishes in-flight requests.
    pub fn bind(
        self,
        shutdown: CancellationToken,
    ) -> Result<(SocketAddr, impl Future<Output = ()> + Send + 'static)> {
        let addr: SocketAddr = self.config.bind_address().parse()?;
        let (bound, server) = warp::serve(routes(self.queue))
            .try_bind_with_graceful_shutdown(addr, async move { shutdown.cancelled().await })?;
        Ok((bound, server))
    }

    /// Serve until `shutdown` is cancelled.
    pub async fn start(self, shutdown: CancellationToken) -> Result<()> {
        let (addr, server) = self.bind(shutdown)?;
        info!("Dashboard listening on http://{}", addr);
        server.await;
        info!("Dashboard stopped");
        Ok(())
    }
}

/// Every route, with rejections rendered as JSON.
pub fn routes(queue: Arc<dyn JobQueue>) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let health_queue = queue.clone();
    let health = warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .and(warp::any().map(move || health_queue.clone()))
        .and_then(health_handler);

    let api_routes = warp::path("api").and(api::queues::routes(queue));

    health.or(api_routes).recover(api::handle_api_error)
}

async fn health_handler(queue: Arc<dyn JobQueue>) -> std::result::Result<impl Reply, Rejection> {
    let (status, code, store) = match queue.ping().await {
        Ok(()) => ("healthy", StatusCode::OK, "ok".to_string()),
        Err(e) => {
            warn!("Health check could not reach the store: {}", e);
            ("degraded", StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
    };
    Ok(warp::reply::with_status(
        warp::reply::json(&json!({
            "status": status,
            "store": store,
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        })),
        code,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrywork::queue::MemoryQueue;

    fn dashboard() -> WebDashboard {
        let config = DashboardConfig {
            port: 0,
            ..DashboardConfig::default()
        };
        WebDashboard::new(config, Arc::new(MemoryQueue::new()))
    }

    #[tokio::test]
    async fn test_health() {
        let response = warp::test::request()
            .path("/health")
            .reply(&routes(Arc::new(MemoryQueue::new())))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["store"], "ok");
    }

    #[tokio::test]
    async fn test_writes_are_refused() {
        let response = warp::test::request()
            .method("POST")
            .path("/api/queues")
            .reply(&routes(Arc::new(MemoryQueue::new())))
            .await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_bind_stops_on_cancel() {
        let shutdown = CancellationToken::new();
        let (addr, server) = dashboard().bind(shutdown.clone()).unwrap();
        assert_ne!(addr.port(), 0);
        let handle = tokio::spawn(server);
        shutdown.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
