//! HTTP handlers for the public SDK API and the internal operations API.
pub mod auth;
pub mod client;
pub mod error;
pub mod internal;
pub mod stream;
