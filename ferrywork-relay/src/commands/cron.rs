use anyhow::Result;
use chrono::Utc;
use clap::Subcommand;
use ferrywork::{CronSchedule, FerryworkConfig, JobQueue, RepeatableJob};

use crate::utils::display::ScheduleTable;
use crate::utils::store::StoreHandle;

#[derive(Subcommand, Debug)]
pub enum CronCommand {
    #[command(about = "List stored tick schedules")]
    List {
        #[arg(short, long, help = "Store connection URL")]
        store_url: Option<String>,
        #[arg(short = 'n', long, help = "Only this queue")]
        queue: Option<String>,
    },
    #[command(about = "Show next execution times for a cron expression")]
    Next {
        #[arg(help = "Six-field cron expression, e.g. \"0 */15 * * * *\"")]
        expression: String,
        #[arg(long, default_value = "UTC", help = "IANA timezone")]
        timezone: String,
        #[arg(long, default_value_t = 5, help = "Number of occurrences")]
        count: usize,
    },
}

impl CronCommand {
    pub async fn execute(&self, config: &FerryworkConfig) -> Result<()> {
        match self {
            CronCommand::List { store_url, queue } => {
                let store = StoreHandle::connect(&config.store, store_url.as_deref()).await?;
                let schedules = collect_schedules(store.queue.as_ref(), queue.as_deref()).await?;
                if schedules.is_empty() {
                    println!("No schedules registered");
                    return Ok(());
                }
                let mut table = ScheduleTable::new();
                for repeat in &schedules {
                    table.add_schedule_row(repeat);
                }
                println!("{}", table);
            }
            CronCommand::Next {
                expression,
                timezone,
                count,
            } => {
                let schedule = CronSchedule::with_timezone(expression, timezone)?;
                for (i, at) in next_runs(&schedule, *count).iter().enumerate() {
                    println!("{:>3}. {}", i + 1, at.to_rfc3339());
                }
            }
        }
        Ok(())
    }
}

/// Stored registrations, soonest first.
pub async fn collect_schedules(queue: &dyn JobQueue, only: Option<&str>) -> Result<Vec<RepeatableJob>> {
    let names = match only {
        Some(name) => vec![name.to_string()],
        None => queue.queue_names().await?,
    };

    let mut schedules = Vec::new();
    for name in &names {
        schedules.extend(queue.list_repeatable(name).await?);
    }
    schedules.sort_by(|a, b| a.next_run_at.cmp(&b.next_run_at));
    Ok(schedules)
}

fn next_runs(schedule: &CronSchedule, count: usize) -> Vec<chrono::DateTime<Utc>> {
    let mut runs = Vec::with_capacity(count);
    let mut after = Utc::now();
    while runs.len() < count {
        match schedule.next_after(after) {
            Some(at) => {
                runs.push(at);
                after = at;
            }
            None => break,
        }
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrywork::{JobOptions, RepeatableJobSpec, queue::MemoryQueue};
    use serde_json::json;

    #[test]
    fn test_next_runs_are_increasing() {
        let schedule = CronSchedule::new("0 */15 * * * *").unwrap();
        let runs = next_runs(&schedule, 4);
        assert_eq!(runs.len(), 4);
        for pair in runs.windows(2) {
            assert_eq!((pair[1] - pair[0]).num_minutes(), 15);
        }
    }

    #[tokio::test]
    async fn test_collect_schedules_across_queues() {
        let store = MemoryQueue::new();
        for (queue, expr) in [("slickdeals", "0 */15 * * * *"), ("outlook", "0 */1 * * * *")] {
            store
                .add_repeatable(
                    queue,
                    RepeatableJobSpec::new(
                        format!("{}-tick", queue),
                        json!({"kind": "tick", "source": queue}),
                        CronSchedule::new(expr).unwrap(),
                    ),
                    &JobOptions::default(),
                )
                .await
                .unwrap();
        }

        let all = collect_schedules(&store, None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0].next_run_at <= all[1].next_run_at);

        let one = collect_schedules(&store, Some("outlook")).await.unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].spec.name, "outlook-tick");
    }
}
