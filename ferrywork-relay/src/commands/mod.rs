pub mod config;
pub mod cron;
pub mod queue;
pub mod run;

pub use config::ConfigCommand;
pub use cron::CronCommand;
pub use queue::QueueCommand;
pub use run::RunCommand;
