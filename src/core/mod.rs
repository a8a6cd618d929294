//! Run orchestration

pub mod runner;

pub use runner::{prepare_cases, shutdown_timeout, ReplayRunner};
