use anyhow::{Context, Result};
use ferrywork::{
    JobQueue, KeyValueStore,
    config::StoreConfig,
    queue::{MemoryQueue, RedisQueue},
};
use std::sync::Arc;
use tracing::{info, warn};

/// One backend seen through both of its interfaces.
#[derive(Clone)]
pub struct StoreHandle {
    pub queue: Arc<dyn JobQueue>,
    pub kv: Arc<dyn KeyValueStore>,
    pub in_memory: bool,
}

impl StoreHandle {
    pub fn memory() -> Self {
        let store = Arc::new(MemoryQueue::new());
        Self {
            queue: store.clone(),
            kv: store,
            in_memory: true,
        }
    }

    /// Connect to the configured backend. `url_override` replaces the
    /// configured URL.
    pub async fn connect(config: &StoreConfig, url_override: Option<&str>) -> Result<Self> {
        if config.memory {
            warn!("Using the in-memory store; nothing survives a restart");
            return Ok(Self::memory());
        }

        let url = url_override.unwrap_or(&config.url);
        let store = Arc::new(
            RedisQueue::connect_with_prefix(url, &config.prefix)
                .await
                .context("Failed to connect to the store")?,
        );
        info!("Using store prefix {}", config.prefix);
        Ok(Self {
            queue: store.clone(),
            kv: store,
            in_memory: false,
        })
    }
}
