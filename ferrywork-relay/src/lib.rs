//! # Ferrywork Relay
//!
//! The forwarder daemon and its inspection commands.
//!
//! ## Running
//!
//! ```bash
//! # Write a starting configuration, then fill in the Telegram section
//! ferrywork-relay config init
//!
//! # Check the store and the bot token without starting workers
//! ferrywork-relay run --check-only
//!
//! # Run every configured source until SIGINT/SIGTERM
//! ferrywork-relay run
//!
//! # Same, without Redis
//! ferrywork-relay run --memory
//! ```
//!
//! ## Inspecting
//!
//! ```bash
//! ferrywork-relay queue list
//! ferrywork-relay queue jobs slickdeals --status failed --limit 20
//! ferrywork-relay cron list
//! ferrywork-relay cron next "0 */15 * * * *" --timezone America/New_York
//! ```
//!
//! ## Configuration
//!
//! The file is read from `--config`, then `FERRYWORK_CONFIG`, then
//! `~/.config/ferrywork/config.toml`. `FERRYWORK_*` environment variables
//! override individual values.
//!
//! ## Logging
//!
//! `-v` turns on debug output, `-q` limits output to errors, and
//! `--log-format json` emits one JSON object per line. `RUST_LOG` directives
//! are honored as well.

pub mod commands;
pub mod config;
pub mod utils;

pub use commands::*;
pub use config::*;
pub use utils::*;
