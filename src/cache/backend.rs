//! Backend selector.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Chooses which storage a cache entry lives in.
///
/// The same logical key may exist independently in every backend, so lookups
/// and invalidations always name the backend explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Durable until explicitly cleared.
    Global,
    /// Durable until the current session ends.
    Session,
    /// Process memory only.
    Memory,
}

impl Backend {
    pub const ALL: [Backend; 3] = [Backend::Global, Backend::Session, Backend::Memory];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Session => "session",
            Self::Memory => "memory",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown backend `{0}` (expected global, session or memory)")]
pub struct UnknownBackend(String);

impl FromStr for Backend {
    type Err = UnknownBackend;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "global" | "local" => Ok(Self::Global),
            "session" => Ok(Self::Session),
            "memory" => Ok(Self::Memory),
            _ => Err(UnknownBackend(value.to_string())),
        }
    }
}
