//! Remote API access: action catalogue, transport, response decoding and the
//! cached client that ties them to the cache engine.

mod actions;
mod client;
mod response;
mod transport;

pub use actions::{
    CachePolicy, DEFAULT_BACKEND, DEFAULT_TTL, Invalidation, Mutation, Params, PolicyTable, Query,
};
pub use client::{ApiClient, ClientError};
pub use response::{decode, transport_failure};
pub use transport::{RawResponse, ReqwestTransport, Transport, TransportError};

pub use hc_api_types::{ApiErrorBody, ApiResponse, ErrorCode};
