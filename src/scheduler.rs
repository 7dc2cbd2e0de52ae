//! Cron registrations for a queue.
//!
//! A [`Scheduler`] holds the repeatable jobs a queue should have and brings
//! the store in line with them on startup. Registering is idempotent: each
//! spec replaces whatever was stored under its name, and names that are no
//! longer configured are removed.

use crate::{
    Result,
    job::JobOptions,
    queue::{JobQueue, RepeatableJob, RepeatableJobSpec},
};
use std::{collections::HashSet, sync::Arc};
use tracing::info;

pub struct Scheduler {
    queue: Arc<dyn JobQueue>,
    queue_name: String,
    options: JobOptions,
    specs: Vec<RepeatableJobSpec>,
}

impl Scheduler {
    pub fn new(queue: Arc<dyn JobQueue>, queue_name: impl Into<String>) -> Self {
        Self {
            queue,
            queue_name: queue_name.into(),
            options: JobOptions::default(),
            specs: Vec::new(),
        }
    }

    pub fn with_job_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    /// Add a spec. A later spec with the same name replaces an earlier one.
    pub fn with_spec(mut self, spec: RepeatableJobSpec) -> Self {
        self.specs.retain(|existing| existing.name != spec.name);
        self.specs.push(spec);
        self
    }

    pub fn specs(&self) -> &[RepeatableJobSpec] {
        &self.specs
    }

    /// Store every spec, replacing earlier registrations, and drop stored
    /// registrations whose names are not configured any more.
    pub async fn register_all(&self) -> Result<Vec<RepeatableJob>> {
        let wanted: HashSet<&str> = self.specs.iter().map(|s| s.name.as_str()).collect();

        for stale in self.queue.list_repeatable(&self.queue_name).await? {
            if !wanted.contains(stale.spec.name.as_str())
                && self.queue.remove_repeatable(&self.queue_name, &stale.spec.name).await?
            {
                info!("Removed stale schedule {} from {}", stale.spec.name, self.queue_name);
            }
        }

        let mut registered = Vec::with_capacity(self.specs.len());
        for spec in &self.specs {
            self.queue.remove_repeatable(&self.queue_name, &spec.name).await?;
            let repeat = self
                .queue
                .add_repeatable(&self.queue_name, spec.clone(), &self.options)
                .await?;
            info!(
                "Scheduled {} on {} ({} {}), next run {}",
                spec.name,
                self.queue_name,
                spec.cron.expression(),
                spec.cron.timezone(),
                repeat.next_run_at
            );
            registered.push(repeat);
        }
        Ok(registered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::cron::CronSchedule;
    use crate::queue::MemoryQueue;
    use serde_json::json;

    fn spec(name: &str, expr: &str) -> RepeatableJobSpec {
        RepeatableJobSpec::new(name, json!({"kind": "tick", "source": "rss"}), CronSchedule::new(expr).unwrap())
    }

    #[tokio::test]
    async fn test_register_all_is_idempotent() {
        let queue = Arc::new(MemoryQueue::with_clock(MockClock::new()));
        let scheduler = Scheduler::new(queue.clone(), "rss").with_spec(spec("rss-tick", "0 */15 * * * *"));

        scheduler.register_all().await.unwrap();
        scheduler.register_all().await.unwrap();

        let stored = queue.list_repeatable("rss").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(queue.counts("rss").await.unwrap().delayed, 1);
    }

    #[tokio::test]
    async fn test_changed_schedule_replaces_old_one() {
        let queue = Arc::new(MemoryQueue::with_clock(MockClock::new()));
        Scheduler::new(queue.clone(), "rss")
            .with_spec(spec("rss-tick", "0 */15 * * * *"))
            .register_all()
            .await
            .unwrap();
        Scheduler::new(queue.clone(), "rss")
            .with_spec(spec("rss-tick", "0 */5 * * * *"))
            .register_all()
            .await
            .unwrap();

        let stored = queue.list_repeatable("rss").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].spec.cron.expression(), "0 */5 * * * *");
        assert_eq!(queue.counts("rss").await.unwrap().delayed, 1);
    }

    #[tokio::test]
    async fn test_unconfigured_names_are_pruned() {
        let queue = Arc::new(MemoryQueue::with_clock(MockClock::new()));
        Scheduler::new(queue.clone(), "rss")
            .with_spec(spec("old", "0 0 * * * *"))
            .with_spec(spec("rss-tick", "0 */15 * * * *"))
            .register_all()
            .await
            .unwrap();

        let scheduler = Scheduler::new(queue.clone(), "rss").with_spec(spec("rss-tick", "0 */15 * * * *"));
        scheduler.register_all().await.unwrap();

        let names: Vec<String> = queue
            .list_repeatable("rss")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.spec.name)
            .collect();
        assert_eq!(names, vec!["rss-tick"]);
        assert_eq!(scheduler.specs().len(), 1);
    }
}
