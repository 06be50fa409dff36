//! Runtime bootstrap: logging, metric descriptions and top-level errors.

pub mod error;
pub mod telemetry;
