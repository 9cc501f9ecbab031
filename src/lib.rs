//! Shared library modules for the oddswatch target monitor.
//!
//! The daemon (`main.rs`) and the `reset_state` maintenance tool both build
//! on these modules.

pub mod api;
pub mod config;
pub mod detect;
pub mod metrics;
pub mod notify;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod target;
pub mod worker;
