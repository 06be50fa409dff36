//! Wire types for the order API.
//!
//! Every endpoint answers with a JSON object carrying a boolean `success`
//! flag. The rest of the payload is action specific, so [`ApiResponse`] keeps
//! the decoded body as-is and only interprets the envelope fields.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Error codes produced on the client side when a response cannot be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The server answered with a non-success HTTP status.
    HttpError,
    /// The body could not be parsed as JSON.
    InvalidJson,
    /// The request never produced a response (connection refused, timeout).
    NetworkError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HttpError => "HTTP_ERROR",
            Self::InvalidJson => "INVALID_JSON",
            Self::NetworkError => "NETWORK_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `error` object of a failed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

/// A decoded API response.
///
/// Serializes transparently as the underlying JSON body, so a response can be
/// cached and restored without loss.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApiResponse(Value);

impl ApiResponse {
    /// Build a client-side failure with the given code and message.
    pub fn failure(code: ErrorCode, message: impl Into<String>) -> Self {
        Self(json!({
            "success": false,
            "error": {
                "code": code.as_str(),
                "message": message.into(),
            }
        }))
    }

    /// Build an `HTTP_ERROR` failure carrying the response status.
    pub fn http_error(status: u16) -> Self {
        Self(json!({
            "success": false,
            "error": {
                "code": ErrorCode::HttpError.as_str(),
                "message": format!("HTTP {status}"),
                "status": status,
            }
        }))
    }

    /// Only a literal `"success": true` counts as success.
    pub fn is_success(&self) -> bool {
        matches!(self.0.get("success"), Some(Value::Bool(true)))
    }

    pub fn data(&self) -> Option<&Value> {
        self.0.get("data")
    }

    /// The `error` object, if present and well formed.
    pub fn error(&self) -> Option<ApiErrorBody> {
        self.0
            .get("error")
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    /// Returns true if this is a failure with the given client-side code.
    pub fn has_error_code(&self, code: ErrorCode) -> bool {
        self.0
            .get("error")
            .and_then(|error| error.get("code"))
            .and_then(Value::as_str)
            .is_some_and(|value| value == code.as_str())
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

impl From<Value> for ApiResponse {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

impl From<ApiResponse> for Value {
    fn from(response: ApiResponse) -> Self {
        response.0
    }
}
