use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FerryworkError {
    #[error("Connection error: {message}")]
    Connection { message: String },

    #[cfg(feature = "redis")]
    #[error("Store error: {0}")]
    Store(redis::RedisError),

    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("UUID parsing error: {0}")]
    UuidParsing(#[from] uuid::Error),

    #[error("Worker error: {message}")]
    Worker { message: String },

    #[error("Queue error: {message}")]
    Queue { message: String },

    #[error("Invalid job payload: {message}")]
    InvalidJobPayload { message: String },

    #[error("Schedule error: {0}")]
    Cron(#[from] crate::cron::CronError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Feed parse error: {0}")]
    Feed(#[from] quick_xml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl FerryworkError {
    /// Whether the store could not be reached. These are retried by callers
    /// rather than treated as job failures.
    pub fn is_connection(&self) -> bool {
        match self {
            FerryworkError::Connection { .. } => true,
            #[cfg(feature = "redis")]
            FerryworkError::Store(e) => {
                e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal()
            }
            _ => false,
        }
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for FerryworkError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_connection_dropped() || err.is_io_error() {
            FerryworkError::Connection {
                message: err.to_string(),
            }
        } else {
            FerryworkError::Store(err)
        }
    }
}

impl From<toml::de::Error> for FerryworkError {
    fn from(err: toml::de::Error) -> Self {
        FerryworkError::Config(format!("TOML deserialization error: {}", err))
    }
}

impl From<toml::ser::Error> for FerryworkError {
    fn from(err: toml::ser::Error) -> Self {
        FerryworkError::Config(format!("TOML serialization error: {}", err))
    }
}

/// Outcome reported by a job handler when it could not finish the job.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The downstream API asked us to slow down. Not counted as an attempt.
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("Handler failed: {message}")]
    Failed { message: String },
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed {
            message: message.into(),
        }
    }

    pub fn rate_limited(retry_after: Duration) -> Self {
        HandlerError::RateLimited { retry_after }
    }
}

impl From<FerryworkError> for HandlerError {
    fn from(err: FerryworkError) -> Self {
        HandlerError::Failed {
            message: err.to_string(),
        }
    }
}
