//! End-to-end checks for a functions host wired to queue and blob storage.
//!
//! The core is [`poll`]: bounded retry-until-success waiting for output that
//! appears asynchronously. Everything else feeds it probes.

pub mod cli;
pub mod config;
pub mod fixture;
pub mod host;
pub mod invoke;
mod logging;
pub mod poll;
pub mod scenarios;
pub mod storage;

pub use logging::{init_tracing, LOG_FORMAT_ENV};
pub use poll::{
    wait_for, wait_for_cancellable, wait_until, wait_until_cancellable, PollError, PollSuccess,
    RetryPolicy,
};

// Re-export tracing for use in tests
pub use tracing;
