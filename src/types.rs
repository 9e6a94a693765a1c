//! Shared types used across pipeline stages.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Connection and retry policy for provider API calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiConnectOptions {
    /// Number of retries after the initial attempt.
    pub max_retry: u32,
    /// Base interval between retries.
    pub retry_interval: Duration,
    /// Per-attempt timeout.
    pub timeout: Duration,
}

impl Default for ApiConnectOptions {
    fn default() -> Self {
        Self {
            max_retry: 3,
            retry_interval: Duration::from_secs(2),
            timeout: Duration::from_secs(10),
        }
    }
}

impl ApiConnectOptions {
    /// Interval to wait before retry number `attempt` (0-based).
    ///
    /// The first retry fires quickly; later retries use the configured
    /// interval.
    pub fn interval_for_retry(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            self.retry_interval.min(Duration::from_millis(100))
        } else {
            self.retry_interval
        }
    }
}

/// Coarse lifecycle state of the agent, reported to embedders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// Publishing the output track, not yet listening.
    Initializing,
    /// Waiting for user speech.
    Listening,
    /// A reply is being synthesized but not yet audible.
    Thinking,
    /// The agent is speaking.
    Speaking,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Listening => write!(f, "listening"),
            Self::Thinking => write!(f, "thinking"),
            Self::Speaking => write!(f, "speaking"),
        }
    }
}

/// Generate a short unique id with the given prefix.
///
/// Used for speech ids, request ids, and segment ids.
pub fn short_id(prefix: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}_{}", &id[..12])
}
