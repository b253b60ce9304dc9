//! Access-token model and validation for the edge.
//!
//! # Purpose
//! Holds the mirrored token shape and the pure, synchronous validation
//! decision. Nothing here performs I/O; the edge service owns fetching and
//! swapping generations of the index.
//!
//! # Key invariants
//! - Exactly one token per secret in a [`TokenIndex`].
//! - [`UNSECURED_TOKEN`] validates without touching the index and yields a
//!   synthesized token with id 0.
//!
//! # Examples
//! ```rust
//! use chrono::Utc;
//! use edge_tokens::{RejectReason, TokenIndex, TokenType};
//!
//! let index = TokenIndex::default();
//! let result = index.validate("nope", TokenType::Client, Some("prod"), Utc::now());
//! assert_eq!(result.reason(), Some(RejectReason::NotFound));
//! ```
mod errors;
mod index;
mod token;

pub use errors::{TokenError, TokenResult};
pub use index::{RejectReason, TokenIndex, TokenValidation};
pub use token::{ENVIRONMENT_WILDCARD, MirroredToken, TokenType, UNSECURED_TOKEN};
