//! Multi-tenant approval intake pipeline.
//!
//! Library crate behind the `approvald` binary; integration tests in
//! `tests/` drive it on the in-memory backends.

pub mod api;
pub mod app;
pub mod audit;
pub mod bus;
pub mod config;
pub mod errors;
pub mod identity;
pub mod intake;
pub mod jobs;
pub mod metrics;
pub mod models;
pub mod notification;
pub mod pipeline;
pub mod store;
pub mod tenant;
pub mod validation;
