use chrono::{DateTime, Utc};
use comfy_table::Table;
use ferrywork::{Job, JobStatus, QueueStats, RepeatableJob};
use std::fmt;

fn status_icon(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Waiting => "🟡",
        JobStatus::Active => "🔵",
        JobStatus::Delayed => "🟠",
        JobStatus::Completed => "🟢",
        JobStatus::Failed => "🔴",
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Cut `text` to `limit` characters for a table cell.
pub fn ellipsize(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.to_string(),
    }
}

pub struct QueueTable {
    table: Table,
}

impl Default for QueueTable {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueTable {
    pub fn new() -> Self {
        let mut table = Table::new();
        table.set_header(vec![
            "Queue",
            "Waiting",
            "Active",
            "Delayed",
            "Completed",
            "Failed",
            "Next Tick",
        ]);
        Self { table }
    }

    pub fn add_queue_row(&mut self, stats: &QueueStats) {
        let counts = &stats.counts;
        self.table.add_row(vec![
            stats.queue_name.clone(),
            counts.waiting.to_string(),
            counts.active.to_string(),
            counts.delayed.to_string(),
            counts.completed.to_string(),
            counts.failed.to_string(),
            stats.next_repeat_at.map(timestamp).unwrap_or_else(|| "-".to_string()),
        ]);
    }
}

impl fmt::Display for QueueTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.table)
    }
}

pub struct JobTable {
    table: Table,
}

impl Default for JobTable {
    fn default() -> Self {
        Self::new()
    }
}

impl JobTable {
    pub fn new() -> Self {
        let mut table = Table::new();
        table.set_header(vec![
            "ID",
            "Name",
            "Status",
            "Attempts",
            "Scheduled At",
            "Error",
        ]);
        Self { table }
    }

    pub fn add_job_row(&mut self, job: &Job) {
        let id = job.id.to_string();
        self.table.add_row(vec![
            id[..8].to_string(),
            job.name.clone(),
            format!("{} {}", status_icon(job.status), job.status),
            format!("{}/{}", job.attempts, job.max_attempts),
            timestamp(job.scheduled_at),
            job.error_message
                .as_deref()
                .map(|e| ellipsize(e, 60))
                .unwrap_or_default(),
        ]);
    }
}

impl fmt::Display for JobTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.table)
    }
}

pub struct ScheduleTable {
    table: Table,
}

impl Default for ScheduleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ScheduleTable {
    pub fn new() -> Self {
        let mut table = Table::new();
        table.set_header(vec!["Queue", "Name", "Cron", "Timezone", "Next Run"]);
        Self { table }
    }

    pub fn add_schedule_row(&mut self, repeat: &RepeatableJob) {
        self.table.add_row(vec![
            repeat.queue_name.clone(),
            repeat.spec.name.clone(),
            repeat.spec.cron.expression().to_string(),
            repeat.spec.cron.timezone().to_string(),
            timestamp(repeat.next_run_at),
        ]);
    }
}

impl fmt::Display for ScheduleTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.table)
    }
}
