//! REST API endpoints for the Ferrywork dashboard.
//!
//! Every endpoint is a `GET` and answers with an [`ApiResponse`] envelope.
//! Nothing here writes to the store.

pub mod queues;

use ferrywork::{FerryworkError, JobStatus};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tracing::error;
use warp::{Rejection, Reply, http::StatusCode, reject::Reject};

/// Standard API response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now(),
        }
    }
}

/// Default number of jobs a listing returns.
pub const DEFAULT_JOB_LIMIT: usize = 50;

/// Largest page a listing will return.
pub const MAX_JOB_LIMIT: usize = 500;

/// Query string of job listings, e.g. `?status=failed&limit=50`.
#[derive(Debug, Default, Deserialize)]
pub struct JobsQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

impl JobsQuery {
    pub fn get_limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_JOB_LIMIT).clamp(1, MAX_JOB_LIMIT)
    }

    /// `None` means every state.
    pub fn get_status(&self) -> Result<Option<JobStatus>, InvalidStatus> {
        match self.status.as_deref().map(str::trim) {
            None | Some("") | Some("all") => Ok(None),
            Some(raw) => raw.parse().map(Some).map_err(InvalidStatus),
        }
    }
}

#[derive(Debug)]
pub struct QueueNotFound(pub String);

impl Reject for QueueNotFound {}

#[derive(Debug)]
pub struct InvalidStatus(pub String);

impl Reject for InvalidStatus {}

#[derive(Debug)]
pub struct StoreUnavailable(pub String);

impl Reject for StoreUnavailable {}

/// Log a store failure and turn it into a rejection.
pub(crate) fn store_error(err: FerryworkError) -> Rejection {
    error!("Dashboard store query failed: {}", err);
    warp::reject::custom(StoreUnavailable(err.to_string()))
}

/// Common error handling for API endpoints
pub async fn handle_api_error(err: Rejection) -> Result<impl Reply, Infallible> {
    let (status, message) = if let Some(QueueNotFound(name)) = err.find() {
        (StatusCode::NOT_FOUND, format!("Queue not found: {}", name))
    } else if let Some(InvalidStatus(message)) = err.find() {
        (StatusCode::BAD_REQUEST, message.clone())
    } else if let Some(StoreUnavailable(message)) = err.find() {
        (StatusCode::SERVICE_UNAVAILABLE, format!("Store unavailable: {}", message))
    } else if err.is_not_found() {
        (StatusCode::NOT_FOUND, "Resource not found".to_string())
    } else if err.find::<warp::reject::InvalidQuery>().is_some() {
        (StatusCode::BAD_REQUEST, "Invalid query parameters".to_string())
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "The dashboard is read-only".to_string())
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
    };

    Ok(warp::reply::with_status(
        warp::reply::json(&ApiResponse::<()>::error(message)),
        status,
    ))
}
