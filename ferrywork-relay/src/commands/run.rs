use anyhow::{Context, Result};
use clap::Args;
use ferrywork::{
    FerryworkConfig, ShutdownTracker, WorkerPool,
    delivery::{DeliverySink, TelegramSink},
    events::spawn_event_logger,
    relay::Relay,
};
use ferrywork_web::WebDashboard;
use std::{sync::Arc, time::Duration};
use tracing::{error, info, warn};

use crate::utils::store::StoreHandle;

/// Extra time after the worker drain deadline before giving up on stragglers.
const EXIT_SLACK: Duration = Duration::from_secs(5);

#[derive(Args, Debug, Default)]
pub struct RunCommand {
    #[arg(short, long, env = "FERRYWORK_STORE_URL", help = "Store connection URL")]
    pub store_url: Option<String>,
    #[arg(long, help = "Keep jobs in process memory instead of Redis")]
    pub memory: bool,
    #[arg(long, help = "Do not serve the dashboard API")]
    pub no_dashboard: bool,
    #[arg(long, help = "Run startup checks and exit")]
    pub check_only: bool,
}

impl RunCommand {
    pub async fn execute(&self, mut config: FerryworkConfig) -> Result<()> {
        if self.memory {
            config.store.memory = true;
        }
        if self.no_dashboard {
            config.dashboard.enabled = false;
        }

        let store = StoreHandle::connect(&config.store, self.store_url.as_deref()).await?;
        let sink: Arc<dyn DeliverySink> =
            Arc::new(TelegramSink::from_config(&config.telegram).context("Telegram is not configured")?);
        run_relay(config, store, sink, self.check_only).await
    }
}

/// Start every source worker and the dashboard, then block until a signal
/// arrives and every component has stopped.
pub async fn run_relay(
    config: FerryworkConfig,
    store: StoreHandle,
    sink: Arc<dyn DeliverySink>,
    check_only: bool,
) -> Result<()> {
    let relay = Relay::new(config.clone(), store.queue.clone(), store.kv.clone(), sink);

    let identity = relay.preflight().await.context("Startup checks failed")?;
    if check_only {
        println!("✅ Store reachable, bot {}", identity);
        return Ok(());
    }

    let tracker = ShutdownTracker::new();
    let _signals = tracker.listen_for_signals();
    run_until_stopped(relay, store, tracker).await
}

/// The daemon body, driven by `tracker`. Returns once every registered
/// component has confirmed its stop.
pub async fn run_until_stopped(relay: Relay, store: StoreHandle, tracker: ShutdownTracker) -> Result<()> {
    let config = relay.config().clone();
    let _logger = spawn_event_logger(relay.events().subscribe());

    let workers = relay.workers().await.context("Failed to set up source workers")?;
    if workers.is_empty() {
        anyhow::bail!("No sources to run; configure [[sources.rss]] or attach a mailbox");
    }

    if config.dashboard.enabled {
        let obligation = tracker.register("dashboard");
        let dashboard = WebDashboard::new(config.dashboard.clone(), store.queue.clone());
        let (addr, server) = dashboard
            .bind(tracker.token())
            .context("Failed to bind the dashboard")?;
        info!("Dashboard listening on http://{}", addr);
        tokio::spawn(async move {
            server.await;
            obligation.confirm();
        });
    }

    let mut pool = WorkerPool::new(tracker.clone());
    for worker in workers {
        pool.add_worker(worker);
    }
    info!("Relay running with {} sources", pool.len());

    let outcome = pool.start().await;
    if !tracker.is_triggered() {
        warn!("Workers stopped without a shutdown request");
        tracker.trigger();
    }

    let grace = config.worker.shutdown_timeout + EXIT_SLACK;
    if let Err(outstanding) = tracker.wait(grace).await {
        error!("Gave up waiting for: {}", outstanding.join(", "));
        anyhow::bail!("{} components did not stop in time", outstanding.len());
    }
    outcome?;
    info!("Relay stopped");
    Ok(())
}
