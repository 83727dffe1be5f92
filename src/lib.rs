//! `agentfleet_monitor` — discovers terminal-multiplexer agent windows,
//! classifies their health, and recovers crashed project managers.
//!
//! See `SPEC_FULL.md` for the full behavioral specification this crate
//! implements.

pub mod cache;
pub mod config;
pub mod detector;
pub mod discovery;
pub mod error;
pub mod health;
pub mod model;
pub mod notification;
pub mod persistence;
pub mod pool;
pub mod recovery;
pub mod scheduler;
pub mod strategy;
pub mod target;
pub mod tmux;
pub mod tracker;

pub use config::Config;
pub use error::{AdapterError, CoreError, CoreResult};
pub use scheduler::{MonitorScheduler, SchedulerState, SchedulerStatus};
pub use target::Target;
pub use tmux::{ShellTmuxAdapter, TmuxAdapter};
