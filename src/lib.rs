//! FATE: a fault-tolerant executor for long-running, multi-step
//! administrative operations.
//!
//! An operation is a chain of [`Step`](fate::Step)s persisted as a stack in a
//! [`FateStore`](fate::FateStore). Workers run the chain one step at a time,
//! resume it from the store after a crash and undo completed steps in
//! reverse order when one fails.

pub mod cli;
pub mod config;
pub mod demo;
pub mod error;
pub mod fate;
pub mod manager_client;
pub mod retry;
pub mod ui;

pub use config::FateConfig;
pub use error::{FateError, Result};
