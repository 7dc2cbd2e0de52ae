//! Integration tests for the Ferrywork Web Dashboard
//!
//! These start the server on an ephemeral port over an in-memory store and
//! query it over HTTP.

use ferrywork::{
    CronSchedule, Job, JobQueue, JobOptions, MockClock, RepeatableJobSpec, config::DashboardConfig,
    queue::MemoryQueue,
};
use ferrywork_web::WebDashboard;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

async fn seeded_store() -> Arc<MemoryQueue> {
    let store = Arc::new(MemoryQueue::with_clock(MockClock::new()));

    store
        .enqueue(Job::new("slickdeals", "deliver", json!({"kind": "deliver"})).with_max_attempts(1))
        .await
        .unwrap();
    let mut job = store.dequeue("slickdeals").await.unwrap().unwrap();
    job.attempts = 1;
    store.nack(&job, "telegram rejected message (400): chat not found", None).await.unwrap();

    store
        .enqueue(Job::new("slickdeals", "deliver", json!({"kind": "deliver"})))
        .await
        .unwrap();

    store
        .add_repeatable(
            "slickdeals",
            RepeatableJobSpec::new(
                "slickdeals-tick",
                json!({"kind": "tick", "source": "slickdeals"}),
                CronSchedule::new("0 */15 * * * *").unwrap(),
            ),
            &JobOptions::default(),
        )
        .await
        .unwrap();

    store
}

async fn serve(store: Arc<MemoryQueue>) -> (String, CancellationToken, tokio::task::JoinHandle<()>) {
    let config = DashboardConfig {
        port: 0,
        ..DashboardConfig::default()
    };
    let shutdown = CancellationToken::new();
    let (addr, server) = WebDashboard::new(config, store).bind(shutdown.clone()).unwrap();
    let handle = tokio::spawn(server);
    (format!("http://{}", addr), shutdown, handle)
}

async fn get_json(url: String) -> (u16, Value) {
    let response = reqwest::get(url).await.unwrap();
    let status = response.status().as_u16();
    (status, response.json().await.unwrap())
}

#[tokio::test]
async fn test_queue_overview_and_failed_jobs() {
    let (base, shutdown, handle) = serve(seeded_store().await).await;

    let (status, body) = get_json(format!("{}/api/queues", base)).await;
    assert_eq!(status, 200);
    let queue = &body["data"][0];
    assert_eq!(queue["queue_name"], "slickdeals");
    assert_eq!(queue["counts"]["failed"], 1);
    assert_eq!(queue["counts"]["waiting"], 1);
    assert_eq!(queue["counts"]["delayed"], 1);
    assert_eq!(queue["repeatable_jobs"], 1);

    let (status, body) = get_json(format!("{}/api/queues/slickdeals/jobs?status=failed&limit=50", base)).await;
    assert_eq!(status, 200);
    let jobs = body["data"]["jobs"].as_array().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0]["status"], "failed");
    assert_eq!(jobs[0]["attempts"], 1);
    assert_eq!(
        jobs[0]["error_message"],
        "telegram rejected message (400): chat not found"
    );

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_repeatables_and_health() {
    let (base, shutdown, handle) = serve(seeded_store().await).await;

    let (status, body) = get_json(format!("{}/api/queues/slickdeals/repeatables", base)).await;
    assert_eq!(status, 200);
    let repeatables = body["data"].as_array().unwrap();
    assert_eq!(repeatables.len(), 1);
    assert_eq!(repeatables[0]["spec"]["name"], "slickdeals-tick");

    let (status, body) = get_json(format!("{}/health", base)).await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "healthy");

    let (status, body) = get_json(format!("{}/api/queues/missing/repeatables", base)).await;
    assert_eq!(status, 404);
    assert_eq!(body["success"], false);

    shutdown.cancel();
    handle.await.unwrap();
}
