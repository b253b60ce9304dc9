//! Edge service library crate.
//!
//! # Purpose
//! Exposes the edge subsystems (token mirror, flag cache, change streaming,
//! telemetry buffers, HTTP API) for the `edge` binary and integration tests.
//!
//! # Notes
//! Cross-instance state lives only in the coordination store: per-environment
//! revision counters and the shared change channel. Everything else here is
//! per process.
pub mod api;
pub mod app;
pub mod authority;
pub mod cache;
mod changes;
pub mod config;
pub mod mirror;
pub mod observability;
pub mod streaming;
pub mod telemetry;

#[cfg(test)]
mod test_support;
