//! Response decoding.
//!
//! Transport and decoding failures become ordinary failure responses; nothing
//! here returns an error to the caller.

use hc_api_types::{ApiResponse, ErrorCode};
use serde_json::Value;
use tracing::{debug, warn};

use super::transport::{RawResponse, TransportError};

const INVALID_JSON_MESSAGE: &str = "Response was not valid JSON.";

/// Decode a raw HTTP response into an [`ApiResponse`].
pub fn decode(raw: &RawResponse) -> ApiResponse {
    if !raw.is_success() {
        debug!(status = raw.status, "API returned non-success status");
        return ApiResponse::http_error(raw.status);
    }

    match serde_json::from_slice::<Value>(&raw.body) {
        Ok(value) => ApiResponse::from(value),
        Err(err) => {
            debug!(error = %err, bytes = raw.body.len(), "API returned unparseable body");
            ApiResponse::failure(ErrorCode::InvalidJson, INVALID_JSON_MESSAGE)
        }
    }
}

/// Convert a request that never produced a response into a failure.
pub fn transport_failure(err: &TransportError) -> ApiResponse {
    warn!(error = %err, "API request failed");
    ApiResponse::failure(ErrorCode::NetworkError, err.to_string())
}
