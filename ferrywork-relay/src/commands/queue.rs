use anyhow::Result;
use clap::Subcommand;
use ferrywork::{FerryworkConfig, JobQueue, JobStatus};

use crate::utils::display::{JobTable, QueueTable};
use crate::utils::store::StoreHandle;

#[derive(Subcommand, Debug)]
pub enum QueueCommand {
    #[command(about = "List queues with job counts")]
    List {
        #[arg(short, long, help = "Store connection URL")]
        store_url: Option<String>,
    },
    #[command(about = "List jobs in one queue")]
    Jobs {
        #[arg(short, long, help = "Store connection URL")]
        store_url: Option<String>,
        #[arg(help = "Queue name (the source name)")]
        queue: String,
        #[arg(long, default_value = "failed", help = "Job state: waiting, active, delayed, completed or failed")]
        status: JobStatus,
        #[arg(short, long, default_value_t = 20, help = "Maximum number of jobs")]
        limit: usize,
    },
}

impl QueueCommand {
    pub async fn execute(&self, config: &FerryworkConfig) -> Result<()> {
        let store = StoreHandle::connect(&config.store, self.store_url()).await?;

        match self {
            QueueCommand::List { .. } => list_queues(store.queue.as_ref()).await,
            QueueCommand::Jobs {
                queue,
                status,
                limit,
                ..
            } => list_jobs(store.queue.as_ref(), queue, *status, *limit).await,
        }
    }

    fn store_url(&self) -> Option<&str> {
        match self {
            QueueCommand::List { store_url } => store_url.as_deref(),
            QueueCommand::Jobs { store_url, .. } => store_url.as_deref(),
        }
    }
}

pub async fn list_queues(queue: &dyn JobQueue) -> Result<()> {
    let mut names = queue.queue_names().await?;
    if names.is_empty() {
        println!("No queues found");
        return Ok(());
    }
    names.sort();

    let mut table = QueueTable::new();
    for name in &names {
        table.add_queue_row(&queue.stats(name).await?);
    }
    println!("{}", table);
    Ok(())
}

pub async fn list_jobs(queue: &dyn JobQueue, name: &str, status: JobStatus, limit: usize) -> Result<()> {
    let jobs = queue.jobs_by_status(name, status, limit).await?;
    if jobs.is_empty() {
        println!("No {} jobs in {}", status, name);
        return Ok(());
    }

    let mut table = JobTable::new();
    for job in &jobs {
        table.add_job_row(job);
    }
    println!("{}", table);
    println!("{} {} jobs shown", jobs.len(), status);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrywork::{Job, queue::MemoryQueue};
    use serde_json::json;

    #[tokio::test]
    async fn test_listing_an_empty_store() {
        let store = MemoryQueue::new();
        list_queues(&store).await.unwrap();
        list_jobs(&store, "slickdeals", JobStatus::Failed, 10).await.unwrap();
    }

    #[tokio::test]
    async fn test_listing_jobs() {
        let store = MemoryQueue::new();
        store
            .enqueue(Job::new("slickdeals", "deliver", json!({"kind": "deliver"})))
            .await
            .unwrap();
        list_queues(&store).await.unwrap();
        list_jobs(&store, "slickdeals", JobStatus::Waiting, 10).await.unwrap();
    }
}
