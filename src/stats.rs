use crate::job::JobStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Number of jobs per state in one queue.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobCounts {
    pub waiting: u64,
    pub active: u64,
    pub delayed: u64,
    pub completed: u64,
    pub failed: u64,
}

impl JobCounts {
    pub fn get(&self, status: JobStatus) -> u64 {
        match status {
            JobStatus::Waiting => self.waiting,
            JobStatus::Active => self.active,
            JobStatus::Delayed => self.delayed,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
        }
    }

    pub fn increment(&mut self, status: JobStatus) {
        match status {
            JobStatus::Waiting => self.waiting += 1,
            JobStatus::Active => self.active += 1,
            JobStatus::Delayed => self.delayed += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
        }
    }

    /// Jobs that still have work ahead of them.
    pub fn pending(&self) -> u64 {
        self.waiting + self.active + self.delayed
    }

    pub fn total(&self) -> u64 {
        self.pending() + self.completed + self.failed
    }
}

/// Point-in-time view of a queue for logs and the dashboard.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueStats {
    pub queue_name: String,
    pub counts: JobCounts,
    pub repeatable_jobs: usize,
    pub next_repeat_at: Option<DateTime<Utc>>,
    pub captured_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_by_status() {
        let mut counts = JobCounts::default();
        counts.increment(JobStatus::Waiting);
        counts.increment(JobStatus::Waiting);
        counts.increment(JobStatus::Failed);

        assert_eq!(counts.get(JobStatus::Waiting), 2);
        assert_eq!(counts.get(JobStatus::Failed), 1);
        assert_eq!(counts.pending(), 2);
        assert_eq!(counts.total(), 3);
    }

    #[test]
    fn test_counts_json_field_names() {
        let counts = JobCounts {
            waiting: 1,
            active: 2,
            delayed: 3,
            completed: 4,
            failed: 5,
        };
        let json = serde_json::to_value(counts).unwrap();
        assert_eq!(json["delayed"], 3);
        assert_eq!(json["completed"], 4);
    }
}
