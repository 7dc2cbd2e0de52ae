//! End-to-end behavior of the job runtime over the in-memory store with a
//! mock clock: dedup windows, retry bounds, backoff growth, rate-limit pauses
//! and the tick -> deliver flow.

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use ferrywork::{
    CronSchedule, DedupCache, HandlerError, IngestGate, Job, JobOptions, JobQueue,
    JobStatus, MockClock, RepeatableJobSpec, Worker,
    delivery::{DeliveryReceipt, DeliverySink},
    ingest::{CandidateItem, EmailSource, InMemoryMailbox, IngestSource, Ingestor, MailMessage},
    payload::{DeliveryItem, JobPayload},
    queue::MemoryQueue,
    relay::RelayHandler,
    worker::{JobHandler, JobOutcome, Step},
};
use serde_json::json;
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU32, Ordering},
};
use std::time::Duration;

fn store() -> (Arc<MemoryQueue>, MockClock) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("ferrywork=debug")
        .with_test_writer()
        .try_init();
    let clock = MockClock::new();
    (Arc::new(MemoryQueue::with_clock(clock.clone())), clock)
}

/// Returns the same candidates on every poll.
struct FixedSource {
    items: Vec<CandidateItem>,
}

#[async_trait]
impl IngestSource for FixedSource {
    fn name(&self) -> &str {
        "example"
    }

    async fn poll(&self) -> ferrywork::Result<Vec<CandidateItem>> {
        Ok(self.items.clone())
    }
}

#[derive(Default)]
struct RecordingSink {
    delivered: Mutex<Vec<DeliveryItem>>,
}

#[async_trait]
impl DeliverySink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    async fn check(&self) -> ferrywork::Result<String> {
        Ok("recorder".to_string())
    }

    async fn deliver(&self, item: &DeliveryItem) -> Result<DeliveryReceipt, HandlerError> {
        let mut delivered = self.delivered.lock().unwrap();
        delivered.push(item.clone());
        Ok(DeliveryReceipt {
            sink: "recording".to_string(),
            message_id: Some(delivered.len() as i64),
        })
    }

    async fn alert(&self, _item: &DeliveryItem, _matched: &[String]) -> Result<DeliveryReceipt, HandlerError> {
        Ok(DeliveryReceipt {
            sink: "recording".to_string(),
            message_id: None,
        })
    }
}

fn failing_handler(calls: Arc<AtomicU32>) -> JobHandler {
    Arc::new(move |_job| {
        calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Err(HandlerError::failed("downstream said no")) })
    })
}

#[tokio::test]
async fn test_same_link_is_enqueued_once_per_ttl_window() {
    let (queue, clock) = store();
    let source = Arc::new(FixedSource {
        items: vec![CandidateItem {
            identity: "https://example.com/f/123".to_string(),
            category: "frontpage".to_string(),
            title: "A deal".to_string(),
            body: String::new(),
            link: Some("https://example.com/f/123".to_string()),
            author: None,
            published_at: None,
        }],
    });
    let cache = DedupCache::new(queue.clone(), "example");
    let ingestor = Ingestor::new(source, IngestGate::new(cache), queue.clone(), "example");

    let first = ingestor.run_tick().await.unwrap();
    assert_eq!((first.enqueued, first.duplicates), (1, 0));

    let second = ingestor.run_tick().await.unwrap();
    assert_eq!((second.enqueued, second.duplicates), (0, 1));
    assert_eq!(queue.counts("example").await.unwrap().waiting, 1);

    clock.advance(ChronoDuration::days(7) + ChronoDuration::seconds(1));
    let third = ingestor.run_tick().await.unwrap();
    assert_eq!((third.enqueued, third.duplicates), (1, 0));
    assert_eq!(queue.counts("example").await.unwrap().waiting, 2);
}

#[tokio::test]
async fn test_always_failing_job_stops_after_max_attempts() {
    let (queue, clock) = store();
    let calls = Arc::new(AtomicU32::new(0));
    let worker = Worker::new(queue.clone(), "example", failing_handler(calls.clone()))
        .with_job_options(JobOptions {
            max_attempts: 3,
            ..JobOptions::default()
        });

    let id = worker.add_job("deliver", json!({})).await.unwrap();
    for _ in 0..10 {
        worker.run_once().await.unwrap();
        clock.advance(ChronoDuration::minutes(1));
    }

    let job = queue.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 3);
    assert_eq!(job.error_message.as_deref(), Some("downstream said no"));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_retry_delays_double() {
    let (queue, clock) = store();
    let worker = Worker::new(queue.clone(), "example", failing_handler(Arc::default()))
        .with_job_options(JobOptions {
            max_attempts: 4,
            ..JobOptions::default()
        });

    let id = worker.add_job("deliver", json!({})).await.unwrap();
    let mut delays = Vec::new();
    for _ in 0..3 {
        let now = queue.now();
        assert!(matches!(worker.run_once().await.unwrap(), Step::Processed(_)));
        let job = queue.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Delayed);
        let delay = job.scheduled_at - now;
        delays.push(delay.num_milliseconds());
        clock.advance(delay);
    }
    assert_eq!(delays, vec![1000, 2000, 4000]);
}

#[tokio::test]
async fn test_rate_limit_holds_the_whole_queue() {
    let (queue, clock) = store();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let handler: JobHandler = Arc::new(move |_job| {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            if n == 0 {
                Err(HandlerError::rate_limited(Duration::from_secs(30)))
            } else {
                Ok(JobOutcome::done())
            }
        })
    });
    let worker = Worker::new(queue.clone(), "example", handler);

    let throttled = worker.add_job("deliver", json!({"n": 1})).await.unwrap();
    worker.add_job("deliver", json!({"n": 2})).await.unwrap();
    worker.run_once().await.unwrap();

    let job = queue.get_job(throttled).await.unwrap().unwrap();
    assert_eq!(job.attempts, 0);
    assert_eq!(job.status, JobStatus::Delayed);

    // The second job is waiting but the worker must not take it.
    for seconds in [1, 10, 29] {
        clock.set_time(job.scheduled_at - ChronoDuration::seconds(30 - seconds));
        assert!(matches!(worker.run_once().await.unwrap(), Step::Paused(_)));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    clock.set_time(job.scheduled_at);
    assert!(matches!(worker.run_once().await.unwrap(), Step::Processed(_)));
    assert!(matches!(worker.run_once().await.unwrap(), Step::Processed(_)));
    let counts = queue.counts("example").await.unwrap();
    assert_eq!(counts.completed, 2);
    assert_eq!(queue.get_job(throttled).await.unwrap().unwrap().attempts, 0);
}

#[tokio::test]
async fn test_registering_a_schedule_twice_keeps_one() {
    let (queue, _) = store();
    let worker = Worker::new(queue.clone(), "example", failing_handler(Arc::default()));
    let spec = RepeatableJobSpec::new(
        "example-tick",
        JobPayload::tick("example").to_value().unwrap(),
        CronSchedule::new("0 */15 * * * *").unwrap(),
    );

    worker.register_repeatable(spec.clone()).await.unwrap();
    worker.register_repeatable(spec).await.unwrap();

    assert_eq!(queue.list_repeatable("example").await.unwrap().len(), 1);
    assert_eq!(queue.counts("example").await.unwrap().delayed, 1);
}

#[tokio::test]
async fn test_mail_tick_delivers_each_message_once() {
    let (queue, _) = store();
    let mailbox = Arc::new(InMemoryMailbox::new());
    for uid in 1..=2 {
        mailbox.deliver(MailMessage {
            uid,
            message_id: Some(format!("<m{}@example.com>", uid)),
            from_address: "deals@example.com".to_string(),
            from_name: None,
            subject: Some(format!("Deal {}", uid)),
            body: "Half price".to_string(),
            date: None,
        });
    }
    mailbox.deliver(MailMessage {
        uid: 3,
        message_id: Some("<spam@elsewhere>".to_string()),
        from_address: "spam@elsewhere.net".to_string(),
        from_name: None,
        subject: Some("Buy now".to_string()),
        body: String::new(),
        date: None,
    });

    let source = Arc::new(
        EmailSource::new("outlook", mailbox.clone()).with_allowed_senders(["Deals@Example.com"]),
    );
    let gate = IngestGate::new(DedupCache::new(queue.clone(), "outlook"));
    let ingestor = Ingestor::new(source, gate, queue.clone(), "outlook");
    let sink = Arc::new(RecordingSink::default());
    let handler = RelayHandler::new(ingestor, sink.clone()).into_job_handler();
    let worker = Worker::new(queue.clone(), "outlook", handler);

    let tick = JobPayload::tick("outlook");
    worker.add_job(tick.job_name(), tick.to_value().unwrap()).await.unwrap();
    while let Step::Processed(_) = worker.run_once().await.unwrap() {}

    let delivered = sink.delivered.lock().unwrap().clone();
    assert_eq!(delivered.len(), 2);
    assert_eq!(delivered[0].title, "Deal 1");
    assert!(delivered[0].body.starts_with("From: deals@example.com"));
    assert_eq!(mailbox.unread_count(), 1);

    let counts = queue.counts("outlook").await.unwrap();
    assert_eq!(counts.completed, 3);
    assert_eq!(counts.failed, 0);
}

#[tokio::test]
async fn test_tick_for_another_source_fails() {
    let (queue, _) = store();
    let ingestor = Ingestor::new(
        Arc::new(FixedSource { items: Vec::new() }),
        IngestGate::new(DedupCache::new(queue.clone(), "example")),
        queue.clone(),
        "example",
    );
    let handler = RelayHandler::new(ingestor, Arc::new(RecordingSink::default()));

    let job = Job::new("example", "tick", JobPayload::tick("other").to_value().unwrap());
    match handler.handle(job).await.unwrap_err() {
        HandlerError::Failed { message } => assert!(message.contains("tick for other")),
        other => panic!("unexpected error {:?}", other),
    }

    let malformed = Job::new("example", "deliver", json!({"kind": "unknown"}));
    assert!(handler.handle(malformed).await.is_err());
}
