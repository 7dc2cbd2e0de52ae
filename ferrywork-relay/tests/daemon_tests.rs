//! Daemon lifecycle over the in-memory store.

use ferrywork::{FerryworkConfig, JobStatus, ShutdownTracker, delivery::TelegramSink, relay::Relay};
use ferrywork_relay::commands::run::run_until_stopped;
use ferrywork_relay::utils::store::StoreHandle;
use std::{sync::Arc, time::Duration};

fn relay(config: FerryworkConfig, store: &StoreHandle) -> Relay {
    let sink = TelegramSink::new("123:abc", "-100200")
        .unwrap()
        .with_api_base("http://127.0.0.1:9");
    Relay::new(config, store.queue.clone(), store.kv.clone(), Arc::new(sink))
}

#[tokio::test]
async fn test_daemon_registers_ticks_and_stops_on_shutdown() {
    let mut config = FerryworkConfig::default();
    config.dashboard.port = 0;
    config.worker.shutdown_timeout = Duration::from_secs(2);

    let store = StoreHandle::memory();
    let tracker = ShutdownTracker::new();
    let daemon = tokio::spawn(run_until_stopped(relay(config, &store), store.clone(), tracker.clone()));

    let mut registered = Vec::new();
    for _ in 0..100 {
        registered = store.queue.list_repeatable("slickdeals").await.unwrap();
        if !registered.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(registered.len(), 1);
    assert_eq!(registered[0].spec.name, "slickdeals-tick");

    // The first tick is a delayed job, not due for minutes.
    let counts = store.queue.counts("slickdeals").await.unwrap();
    assert_eq!(counts.get(JobStatus::Delayed), 1);

    tracker.trigger();
    tokio::time::timeout(Duration::from_secs(10), daemon)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(tracker.outstanding().is_empty());
}

#[tokio::test]
async fn test_daemon_refuses_to_run_without_sources() {
    let mut config = FerryworkConfig::default();
    config.sources.rss.clear();
    config.dashboard.enabled = false;

    let store = StoreHandle::memory();
    let err = run_until_stopped(relay(config, &store), store.clone(), ShutdownTracker::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("No sources"));
}
