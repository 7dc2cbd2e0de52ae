//! Queue inspection endpoints.
//!
//! # API Endpoints
//!
//! - `GET /api/queues` - Statistics for every known queue
//! - `GET /api/queues/{name}` - Statistics for one queue
//! - `GET /api/queues/{name}/jobs?status=failed&limit=50` - Jobs in one queue
//! - `GET /api/queues/{name}/repeatables` - Cron registrations of one queue

use super::{ApiResponse, InvalidStatus, JobsQuery, QueueNotFound, store_error};
use ferrywork::{Job, JobQueue, JobStatus, QueueStats, RepeatableJob};
use serde::Serialize;
use std::sync::Arc;
use warp::{Filter, Rejection, Reply};

/// Jobs of one queue, as returned by the jobs endpoint.
#[derive(Debug, Serialize)]
pub struct JobListing {
    pub queue_name: String,
    /// The state filter that was applied, if any.
    pub status: Option<JobStatus>,
    pub limit: usize,
    pub jobs: Vec<Job>,
}

/// Create queue routes
pub fn routes(
    queue: Arc<dyn JobQueue>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let queue_filter = warp::any().map(move || queue.clone());

    let list_queues = warp::path("queues")
        .and(warp::path::end())
        .and(warp::get())
        .and(queue_filter.clone())
        .and_then(list_queues_handler);

    let get_queue = warp::path("queues")
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::get())
        .and(queue_filter.clone())
        .and_then(get_queue_handler);

    let queue_jobs = warp::path("queues")
        .and(warp::path::param::<String>())
        .and(warp::path("jobs"))
        .and(warp::path::end())
        .and(warp::get())
        .and(queue_filter.clone())
        .and(warp::query::<JobsQuery>())
        .and_then(queue_jobs_handler);

    let queue_repeatables = warp::path("queues")
        .and(warp::path::param::<String>())
        .and(warp::path("repeatables"))
        .and(warp::path::end())
        .and(warp::get())
        .and(queue_filter)
        .and_then(queue_repeatables_handler);

    list_queues
        .or(get_queue)
        .or(queue_jobs)
        .or(queue_repeatables)
}

/// Reject names the store has never seen, so typos answer 404 instead of an
/// empty queue.
async fn ensure_known(queue: &Arc<dyn JobQueue>, name: &str) -> Result<(), Rejection> {
    let names = queue.queue_names().await.map_err(store_error)?;
    if names.iter().any(|known| known == name) {
        Ok(())
    } else {
        Err(warp::reject::custom(QueueNotFound(name.to_string())))
    }
}

async fn list_queues_handler(queue: Arc<dyn JobQueue>) -> Result<impl Reply, Rejection> {
    let mut names = queue.queue_names().await.map_err(store_error)?;
    names.sort();

    let mut stats: Vec<QueueStats> = Vec::with_capacity(names.len());
    for name in &names {
        stats.push(queue.stats(name).await.map_err(store_error)?);
    }
    Ok(warp::reply::json(&ApiResponse::success(stats)))
}

async fn get_queue_handler(name: String, queue: Arc<dyn JobQueue>) -> Result<impl Reply, Rejection> {
    ensure_known(&queue, &name).await?;
    let stats = queue.stats(&name).await.map_err(store_error)?;
    Ok(warp::reply::json(&ApiResponse::success(stats)))
}

async fn queue_jobs_handler(
    name: String,
    queue: Arc<dyn JobQueue>,
    query: JobsQuery,
) -> Result<impl Reply, Rejection> {
    let status = query.get_status().map_err(warp::reject::custom::<InvalidStatus>)?;
    let limit = query.get_limit();
    ensure_known(&queue, &name).await?;

    let jobs = match status {
        Some(status) => queue
            .jobs_by_status(&name, status, limit)
            .await
            .map_err(store_error)?,
        None => {
            let mut jobs = Vec::new();
            for status in JobStatus::ALL {
                if jobs.len() >= limit {
                    break;
                }
                let page = queue
                    .jobs_by_status(&name, status, limit - jobs.len())
                    .await
                    .map_err(store_error)?;
                jobs.extend(page);
            }
            jobs
        }
    };

    Ok(warp::reply::json(&ApiResponse::success(JobListing {
        queue_name: name,
        status,
        limit,
        jobs,
    })))
}

async fn queue_repeatables_handler(
    name: String,
    queue: Arc<dyn JobQueue>,
) -> Result<impl Reply, Rejection> {
    ensure_known(&queue, &name).await?;
    let mut repeatables: Vec<RepeatableJob> = queue.list_repeatable(&name).await.map_err(store_error)?;
    repeatables.sort_by(|a, b| a.next_run_at.cmp(&b.next_run_at));
    Ok(warp::reply::json(&ApiResponse::success(repeatables)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::handle_api_error;
    use ferrywork::{MockClock, queue::MemoryQueue};
    use serde_json::{Value, json};
    use warp::http::StatusCode;

    async fn seeded() -> Arc<MemoryQueue> {
        let queue = Arc::new(MemoryQueue::with_clock(MockClock::new()));
        queue
            .enqueue(Job::new("slickdeals", "deliver", json!({"kind": "deliver"})))
            .await
            .unwrap();
        queue
            .enqueue(Job::new("slickdeals", "deliver", json!({"kind": "deliver"})))
            .await
            .unwrap();
        queue
    }

    fn api(queue: Arc<MemoryQueue>) -> impl Filter<Extract = (impl Reply,), Error = std::convert::Infallible> + Clone {
        warp::path("api").and(routes(queue)).recover(handle_api_error)
    }

    async fn get(queue: Arc<MemoryQueue>, path: &str) -> (StatusCode, Value) {
        let response = warp::test::request().method("GET").path(path).reply(&api(queue)).await;
        let body: Value = serde_json::from_slice(response.body()).unwrap();
        (response.status(), body)
    }

    #[tokio::test]
    async fn test_list_queues() {
        let (status, body) = get(seeded().await, "/api/queues").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"][0]["queue_name"], "slickdeals");
        assert_eq!(body["data"][0]["counts"]["waiting"], 2);
    }

    #[tokio::test]
    async fn test_unknown_queue_is_404() {
        let (status, body) = get(seeded().await, "/api/queues/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "Queue not found: nope");
    }

    #[tokio::test]
    async fn test_jobs_limit_and_bad_status() {
        let (status, body) = get(seeded().await, "/api/queues/slickdeals/jobs?limit=1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["jobs"].as_array().unwrap().len(), 1);
        assert_eq!(body["data"]["status"], Value::Null);

        let (status, _) = get(seeded().await, "/api/queues/slickdeals/jobs?status=dead").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
