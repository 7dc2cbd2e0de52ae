//! Wiring of sources, dedup, sinks and workers into a running relay.
//!
//! Every configured source gets its own queue, named after the source. The
//! queue carries two kinds of jobs (see [`JobPayload`]): cron ticks that poll
//! the source, and deliveries of the items that tick found.

use crate::{
    FerryworkError, Result,
    config::FerryworkConfig,
    dedup::{DedupCache, IngestGate},
    delivery::{DeliverySink, KeywordWatch},
    error::HandlerError,
    events::EventBus,
    ingest::{EmailSource, IngestSource, Ingestor, Mailbox, RssSource},
    job::Job,
    payload::JobPayload,
    queue::{JobQueue, KeyValueStore, RepeatableJob, RepeatableJobSpec},
    scheduler::Scheduler,
    worker::{HandlerResult, JobHandler, JobOutcome, Worker},
};
use std::{collections::HashMap, sync::Arc};
use tracing::{info, warn};

/// Handles both payload kinds for one source queue.
pub struct RelayHandler {
    ingestor: Ingestor,
    sink: Arc<dyn DeliverySink>,
    watch: Option<KeywordWatch>,
}

impl RelayHandler {
    pub fn new(ingestor: Ingestor, sink: Arc<dyn DeliverySink>) -> Self {
        Self {
            ingestor,
            sink,
            watch: None,
        }
    }

    pub fn with_keyword_watch(mut self, watch: KeywordWatch) -> Self {
        self.watch = Some(watch);
        self
    }

    pub async fn handle(&self, job: Job) -> HandlerResult {
        match JobPayload::from_job(&job)? {
            JobPayload::Tick { source } => {
                if source != self.ingestor.source().name() {
                    return Err(HandlerError::failed(format!(
                        "tick for {} reached the {} queue",
                        source, job.queue_name
                    )));
                }
                let report = self.ingestor.run_tick().await?;
                Ok(JobOutcome::note(format!(
                    "tick: {} polled, {} new",
                    report.polled, report.enqueued
                )))
            }
            JobPayload::Deliver(item) => {
                let receipt = self.sink.deliver(&item).await?;

                // The item is already out; a failed alert must not resend it.
                if let Some(watch) = &self.watch {
                    match watch.matches(&item).await {
                        Ok(matched) if !matched.is_empty() => {
                            if let Err(e) = self.sink.alert(&item, &matched).await {
                                warn!("Keyword alert for {} not sent: {}", item.fingerprint, e);
                            }
                        }
                        Ok(_) => {}
                        Err(e) => warn!("Could not read keyword list: {}", e),
                    }
                }

                Ok(JobOutcome::note(receipt.note()))
            }
        }
    }

    pub fn into_job_handler(self) -> JobHandler {
        let handler = Arc::new(self);
        Arc::new(move |job: Job| {
            let handler = handler.clone();
            Box::pin(async move { handler.handle(job).await })
        })
    }
}

/// Name of the repeatable tick job for a source.
pub fn tick_job_name(source: &str) -> String {
    format!("{}-tick", source)
}

/// A configured source, ready to be attached to a worker.
pub struct SourceBinding {
    pub source: Arc<dyn IngestSource>,
    pub tick: RepeatableJobSpec,
}

pub struct Relay {
    config: FerryworkConfig,
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn KeyValueStore>,
    sink: Arc<dyn DeliverySink>,
    mailboxes: HashMap<String, Arc<dyn Mailbox>>,
    events: EventBus,
}

impl Relay {
    pub fn new(
        config: FerryworkConfig,
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn KeyValueStore>,
        sink: Arc<dyn DeliverySink>,
    ) -> Self {
        Self {
            config,
            queue,
            store,
            sink,
            mailboxes: HashMap::new(),
            events: EventBus::default(),
        }
    }

    /// Attach the mailbox for the email source called `name`.
    pub fn with_mailbox(mut self, name: impl Into<String>, mailbox: Arc<dyn Mailbox>) -> Self {
        self.mailboxes.insert(name.into(), mailbox);
        self
    }

    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &FerryworkConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Store ping, then sink credentials. Either failing is fatal.
    pub async fn preflight(&self) -> Result<String> {
        self.queue.ping().await?;
        let identity = self.sink.check().await?;
        info!("Store reachable, {} sink authenticated as {}", self.sink.name(), identity);
        Ok(identity)
    }

    /// Sources from the configuration. Email sources without an attached
    /// mailbox are skipped with a warning.
    pub fn sources(&self) -> Result<Vec<SourceBinding>> {
        let mut bindings = Vec::new();

        for rss in &self.config.sources.rss {
            let source: Arc<dyn IngestSource> = Arc::new(RssSource::from_config(rss)?);
            bindings.push(SourceBinding {
                tick: self.tick_spec(&rss.name, rss.schedule()?)?,
                source,
            });
        }

        for email in &self.config.sources.email {
            let Some(mailbox) = self.mailboxes.get(&email.name) else {
                warn!("No mailbox attached for email source {}, skipping it", email.name);
                continue;
            };
            let source: Arc<dyn IngestSource> = Arc::new(EmailSource::from_config(email, mailbox.clone()));
            bindings.push(SourceBinding {
                tick: self.tick_spec(&email.name, email.schedule()?)?,
                source,
            });
        }

        Ok(bindings)
    }

    fn tick_spec(&self, source: &str, cron: crate::cron::CronSchedule) -> Result<RepeatableJobSpec> {
        Ok(RepeatableJobSpec::new(
            tick_job_name(source),
            JobPayload::tick(source).to_value()?,
            cron,
        ))
    }

    /// Build the worker for one source and register its tick schedule.
    pub async fn attach(&self, binding: SourceBinding) -> Result<(Worker, RepeatableJob)> {
        let name = binding.source.name().to_string();
        let options = self.config.jobs;

        let cache = DedupCache::new(self.store.clone(), name.clone()).with_ttl(self.config.dedup.ttl);
        let ingestor = Ingestor::new(binding.source, IngestGate::new(cache), self.queue.clone(), name.clone())
            .with_job_options(options);

        let watch = KeywordWatch::new(self.config.telegram.keywords.clone())
            .with_store(self.store.clone(), &self.config.telegram.namespace);
        let handler = RelayHandler::new(ingestor, self.sink.clone())
            .with_keyword_watch(watch)
            .into_job_handler();

        let worker_config = &self.config.worker;
        let mut worker = Worker::new(self.queue.clone(), name.clone(), handler)
            .with_concurrency(worker_config.concurrency)
            .with_poll_interval(worker_config.poll_interval)
            .with_shutdown_timeout(worker_config.shutdown_timeout)
            .with_job_options(options)
            .with_event_bus(self.events.clone());
        if let Some(timeout) = worker_config.job_timeout {
            worker = worker.with_job_timeout(timeout);
        }
        if let Some(rate_limit) = worker_config.rate_limit() {
            worker = worker.with_limiter(rate_limit);
        }

        let mut registered = Scheduler::new(self.queue.clone(), name.clone())
            .with_job_options(options)
            .with_spec(binding.tick)
            .register_all()
            .await?;
        let tick = registered.pop().ok_or_else(|| FerryworkError::Queue {
            message: format!("no tick schedule registered for {}", name),
        })?;

        Ok((worker, tick))
    }

    /// One worker per configured source, schedules registered.
    pub async fn workers(&self) -> Result<Vec<Worker>> {
        let mut workers = Vec::new();
        for binding in self.sources()? {
            let (worker, tick) = self.attach(binding).await?;
            info!("{} ready, first tick at {}", worker.queue_name(), tick.next_run_at);
            workers.push(worker);
        }
        Ok(workers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::config::EmailSourceConfig;
    use crate::delivery::DeliveryReceipt;
    use crate::ingest::{InMemoryMailbox, MailMessage};
    use crate::job::JobStatus;
    use crate::payload::DeliveryItem;
    use crate::queue::MemoryQueue;
    use crate::worker::Step;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<String>>,
        alerts: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl DeliverySink for RecordingSink {
        fn name(&self) -> &str {
            "recording"
        }

        async fn check(&self) -> Result<String> {
            Ok("recorder".to_string())
        }

        async fn deliver(&self, item: &DeliveryItem) -> std::result::Result<DeliveryReceipt, HandlerError> {
            let mut sent = self.sent.lock().unwrap();
            sent.push(item.title.clone());
            Ok(DeliveryReceipt {
                sink: "recording".to_string(),
                message_id: Some(sent.len() as i64),
            })
        }

        async fn alert(
            &self,
            _item: &DeliveryItem,
            matched: &[String],
        ) -> std::result::Result<DeliveryReceipt, HandlerError> {
            self.alerts.lock().unwrap().push(matched.to_vec());
            Err(HandlerError::rate_limited(Duration::from_secs(1)))
        }
    }

    fn mail(uid: u32, subject: &str) -> MailMessage {
        MailMessage {
            uid,
            message_id: Some(format!("<{}@mail>", uid)),
            from_address: "alerts@bank.example".to_string(),
            from_name: None,
            subject: Some(subject.to_string()),
            body: "body".to_string(),
            date: None,
        }
    }

    fn email_relay(
        queue: Arc<MemoryQueue>,
        sink: Arc<RecordingSink>,
        mailbox: Arc<InMemoryMailbox>,
    ) -> Relay {
        let mut config = FerryworkConfig::new();
        config.sources.rss.clear();
        config.sources.email.push(EmailSourceConfig::new("outlook"));
        config.telegram.keywords = vec!["invoice".to_string()];
        config.worker.job_timeout = None;
        Relay::new(config, queue.clone(), queue, sink).with_mailbox("outlook", mailbox)
    }

    #[tokio::test]
    async fn test_tick_then_deliver() {
        let clock = MockClock::new();
        let queue = Arc::new(MemoryQueue::with_clock(clock.clone()));
        let sink = Arc::new(RecordingSink::default());
        let mailbox = Arc::new(InMemoryMailbox::new());
        mailbox.deliver(mail(1, "Your invoice"));
        mailbox.deliver(mail(2, "Hello"));

        let relay = email_relay(queue.clone(), sink.clone(), mailbox);
        assert_eq!(relay.preflight().await.unwrap(), "recorder");

        let workers = relay.workers().await.unwrap();
        assert_eq!(workers.len(), 1);
        let worker = &workers[0];
        assert_eq!(worker.queue_name(), "outlook");

        // The first tick is due at the next whole minute.
        assert_eq!(worker.run_once().await.unwrap(), Step::Idle);
        clock.advance(chrono::Duration::seconds(60));
        assert!(matches!(worker.run_once().await.unwrap(), Step::Processed(_)));
        assert_eq!(queue.counts("outlook").await.unwrap().waiting, 2);

        worker.run_once().await.unwrap();
        worker.run_once().await.unwrap();
        assert_eq!(*sink.sent.lock().unwrap(), vec!["Your invoice", "Hello"]);

        // A failed alert does not fail or resend the delivery.
        assert_eq!(*sink.alerts.lock().unwrap(), vec![vec!["invoice".to_string()]]);
        let completed = queue.jobs_by_status("outlook", JobStatus::Completed, 10).await.unwrap();
        assert_eq!(completed.len(), 3);
    }

    #[tokio::test]
    async fn test_email_source_without_mailbox_is_skipped() {
        let queue = Arc::new(MemoryQueue::new());
        let mut config = FerryworkConfig::new();
        config.sources.rss.clear();
        config.sources.email.push(EmailSourceConfig::new("outlook"));
        let relay = Relay::new(config, queue.clone(), queue, Arc::new(RecordingSink::default()));

        assert!(relay.sources().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_misrouted_tick_fails() {
        let queue = Arc::new(MemoryQueue::new());
        let sink = Arc::new(RecordingSink::default());
        let relay = email_relay(queue.clone(), sink, Arc::new(InMemoryMailbox::new()));
        let binding = relay.sources().unwrap().pop().unwrap();
        let (worker, _) = relay.attach(binding).await.unwrap();

        let id = worker
            .add_job("tick", JobPayload::tick("slickdeals").to_value().unwrap())
            .await
            .unwrap();
        worker.run_once().await.unwrap();

        let job = queue.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.attempts, 1);
        assert!(job.error_message.unwrap().contains("reached the outlook queue"));
    }
}
