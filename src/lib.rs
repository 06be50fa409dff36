//! Client-side data access for the order management API.
//!
//! [`api::ApiClient`] fronts a remote JSON API with a versioned, TTL-bounded
//! cache spread over three storage backends, coalesces concurrent reads of
//! the same resource, and purges affected cache prefixes after successful
//! mutations.

pub mod api;
pub mod cache;
pub mod config;
pub mod infra;
