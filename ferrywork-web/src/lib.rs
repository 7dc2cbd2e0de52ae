//! # Ferrywork Web Dashboard
//!
//! A read-only HTTP API for looking into Ferrywork queues:
//! - Per-queue job counts and the next cron tick
//! - Failed and pending jobs with their last error
//! - Cron registrations
//! - Store health
//!
//! ## Usage
//!
//! ### As a Binary
//!
//! ```bash
//! ferrywork-web --store-url redis://127.0.0.1:6379 --port 3000
//! ```
//!
//! ### As a Library
//!
//! ```rust,no_run
//! use ferrywork::{config::DashboardConfig, queue::RedisQueue};
//! use ferrywork_web::WebDashboard;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let queue = Arc::new(RedisQueue::connect("redis://127.0.0.1:6379").await?);
//!     let dashboard = WebDashboard::new(DashboardConfig::default(), queue);
//!     dashboard.start(CancellationToken::new()).await
//! }
//! ```

pub mod api;
pub mod server;

pub use api::ApiResponse;
pub use server::{WebDashboard, routes};

/// Result type alias for consistent error handling
pub type Result<T> = std::result::Result<T, anyhow::Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use ferrywork::{config::DashboardConfig, queue::MemoryQueue};
    use std::sync::Arc;

    #[test]
    fn test_dashboard_keeps_its_config() {
        let config = DashboardConfig {
            host: "0.0.0.0".to_string(),
            port: 9090,
            ..DashboardConfig::default()
        };
        let dashboard = WebDashboard::new(config, Arc::new(MemoryQueue::new()));
        assert_eq!(dashboard.config().bind_address(), "0.0.0.0:9090");
    }

    #[test]
    fn test_bad_bind_address_is_an_error() {
        let config = DashboardConfig {
            host: "not an address".to_string(),
            ..DashboardConfig::default()
        };
        let dashboard = WebDashboard::new(config, Arc::new(MemoryQueue::new()));
        let result = tokio_test::block_on(async move {
            dashboard
                .start(tokio_util::sync::CancellationToken::new())
                .await
        });
        assert!(result.is_err());
    }
}
