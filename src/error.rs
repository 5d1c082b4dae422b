//! Error taxonomy for the detection pipeline.
//!
//! Only [`PipelineError`] ever reaches the caller of the lifecycle API. The
//! per-stream, per-task and per-delivery errors are contained by the component
//! that detects them and surface only through logs and counters.

use thiserror::Error;

/// Lifecycle status code for a successful `start()` / `stop()`.
pub const STATUS_OK: i32 = 0;

/// Failures that abort `start()`. The pipeline never partially starts.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0:#}")]
    Config(anyhow::Error),

    #[error("worker pool initialization failed for model '{model}': {source:#}")]
    PoolInit {
        model: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to spawn {what} thread: {source}")]
    Spawn {
        what: String,
        #[source]
        source: std::io::Error,
    },

    #[error("pipeline state unavailable: {0}")]
    InvalidState(&'static str),
}

impl PipelineError {
    /// Negative status code for the integer lifecycle API.
    pub fn status_code(&self) -> i32 {
        match self {
            PipelineError::Config(_) => -2,
            PipelineError::PoolInit { .. } => -3,
            PipelineError::Spawn { .. } => -4,
            PipelineError::InvalidState(_) => -5,
        }
    }
}

/// Per-stream failures raised by a decoder. Recovered inside the frame source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("stream ended")]
    Ended,
}

/// Hook delivery failure. Transient failures are retried; permanent ones are not.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("transient delivery failure: {0}")]
    Transient(String),

    #[error("permanent delivery failure: {0}")]
    Permanent(String),
}

impl DeliveryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DeliveryError::Transient(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_are_distinct_and_negative() {
        let codes = [
            PipelineError::Config(anyhow::anyhow!("x")).status_code(),
            PipelineError::PoolInit {
                model: "det1".into(),
                source: anyhow::anyhow!("x"),
            }
            .status_code(),
            PipelineError::Spawn {
                what: "worker".into(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "x"),
            }
            .status_code(),
            PipelineError::InvalidState("x").status_code(),
        ];
        for (i, code) in codes.iter().enumerate() {
            assert!(*code < 0);
            assert!(!codes[i + 1..].contains(code));
        }
        assert_eq!(codes[1], -3);
    }

    #[test]
    fn delivery_error_classification() {
        assert!(DeliveryError::Transient("503".into()).is_transient());
        assert!(!DeliveryError::Permanent("404".into()).is_transient());
    }
}
