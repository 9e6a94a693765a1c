//! Error types for the voice-agent pipeline.

use std::time::Duration;

/// Error raised by a remote provider (STT/LLM/TTS) API call.
///
/// The pipeline classifies these into retryable and terminal errors:
/// timeouts, connection drops, 429 and 5xx responses are retried per
/// [`ApiConnectOptions`](crate::types::ApiConnectOptions); everything else
/// fails the current turn immediately.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    /// The request did not complete within the configured timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The provider returned a non-success status code.
    #[error("status {status_code}: {message}")]
    Status {
        /// HTTP (or equivalent) status code.
        status_code: u16,
        /// Provider-supplied error message, if any.
        message: String,
    },

    /// The connection failed or dropped mid-stream.
    #[error("connection error: {0}")]
    Connection(String),

    /// The provider violated its own protocol (e.g. a TTS websocket closed
    /// before consuming all pushed tokens). Never retried.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl ApiError {
    /// Whether a retry may succeed.
    pub fn retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Connection(_) => true,
            Self::Status { status_code, .. } => *status_code == 429 || *status_code >= 500,
            Self::Protocol(_) => false,
        }
    }
}

/// Top-level error type for the voice-agent pipeline.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Remote provider API error (after retries were exhausted, when the
    /// operation carries a retry policy).
    #[error("api error: {0}")]
    Api(#[from] ApiError),

    /// Audio frame or sink error.
    #[error("audio error: {0}")]
    Audio(String),

    /// Voice activity detection error.
    #[error("VAD error: {0}")]
    Vad(String),

    /// Speech-to-text error.
    #[error("STT error: {0}")]
    Stt(String),

    /// Language model error.
    #[error("LLM error: {0}")]
    Llm(String),

    /// Text-to-speech error.
    #[error("TTS error: {0}")]
    Tts(String),

    /// Pipeline orchestration error.
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Channel send/receive error (a stage shut down unexpectedly).
    #[error("channel error: {0}")]
    Channel(String),

    /// Compressed-audio decode error.
    #[error("decode error: {0}")]
    Decode(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// Whether the underlying cause is a retryable provider error.
    pub fn retryable(&self) -> bool {
        match self {
            Self::Api(e) => e.retryable(),
            _ => false,
        }
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_and_connection_are_retryable() {
        assert!(ApiError::Timeout(Duration::from_secs(10)).retryable());
        assert!(ApiError::Connection("reset by peer".into()).retryable());
    }

    #[test]
    fn status_codes_classify() {
        let too_many = ApiError::Status {
            status_code: 429,
            message: "rate limited".into(),
        };
        let server = ApiError::Status {
            status_code: 503,
            message: "unavailable".into(),
        };
        let auth = ApiError::Status {
            status_code: 401,
            message: "bad key".into(),
        };
        assert!(too_many.retryable());
        assert!(server.retryable());
        assert!(!auth.retryable());
    }

    #[test]
    fn protocol_violation_is_terminal() {
        assert!(!ApiError::Protocol("closed early".into()).retryable());
    }

    #[test]
    fn agent_error_wraps_api() {
        let err: AgentError = ApiError::Connection("refused".into()).into();
        assert!(err.retryable());
        assert!(!AgentError::Pipeline("bad state".into()).retryable());
    }
}
