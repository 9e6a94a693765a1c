//! Metrics records emitted by pipeline stages.
//!
//! Every record carries a timestamp and the emitting component's label;
//! records tied to one agent turn share a `sequence_id` (the speech handle
//! id), letting STT, LLM, TTS, and end-of-utterance records be correlated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Speech-to-text usage and latency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttMetrics {
    /// When the record was produced.
    pub timestamp: DateTime<Utc>,
    /// Recognition request id.
    pub request_id: String,
    /// Emitting STT label.
    pub label: String,
    /// Duration of recognized audio.
    pub audio_duration: Duration,
    /// Wall-clock processing duration.
    pub duration: Duration,
    /// Whether this came from a streaming session.
    pub streamed: bool,
    /// Terminal error, if the request failed.
    pub error: Option<String>,
}

/// Language-model completion latency and token usage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmMetrics {
    /// When the record was produced.
    pub timestamp: DateTime<Utc>,
    /// Completion request id.
    pub request_id: String,
    /// Emitting LLM label.
    pub label: String,
    /// Turn this completion belongs to.
    pub sequence_id: Option<String>,
    /// Time to first token.
    pub ttft: Option<Duration>,
    /// Total stream duration.
    pub duration: Duration,
    /// Tokens generated.
    pub completion_tokens: u32,
    /// Tokens in the prompt.
    pub prompt_tokens: u32,
    /// Total tokens billed.
    pub total_tokens: u32,
    /// Generation throughput.
    pub tokens_per_second: f64,
    /// Whether the stream was cancelled before completion.
    pub cancelled: bool,
    /// Terminal error, if the request failed.
    pub error: Option<String>,
}

/// Text-to-speech latency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsMetrics {
    /// When the record was produced.
    pub timestamp: DateTime<Utc>,
    /// Synthesis request id.
    pub request_id: String,
    /// Emitting TTS label.
    pub label: String,
    /// Turn this synthesis belongs to.
    pub sequence_id: Option<String>,
    /// Time to first audio byte.
    pub ttfb: Option<Duration>,
    /// Total stream duration.
    pub duration: Duration,
    /// Duration of synthesized audio.
    pub audio_duration: Duration,
    /// Whether the stream was cancelled before completion.
    pub cancelled: bool,
    /// Terminal error, if the request failed.
    pub error: Option<String>,
}

/// Voice-activity-detector inference accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadMetrics {
    /// When the record was produced.
    pub timestamp: DateTime<Utc>,
    /// Emitting VAD label.
    pub label: String,
    /// Time spent waiting for audio.
    pub idle_time: Duration,
    /// Total inference compute time in the reporting window.
    pub inference_duration_total: Duration,
    /// Number of inferences in the reporting window.
    pub inference_count: u64,
}

/// End-of-utterance timing for one validated turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEouMetrics {
    /// When the record was produced.
    pub timestamp: DateTime<Utc>,
    /// Turn this measurement belongs to.
    pub sequence_id: String,
    /// Time from actual end of user speech to reply validation.
    pub end_of_utterance_delay: Duration,
    /// Time from end of user speech to the final transcript.
    pub transcription_delay: Duration,
}

/// Any metrics record, as published on the agent event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MetricsRecord {
    /// Speech-to-text record.
    Stt(SttMetrics),
    /// Language-model record.
    Llm(LlmMetrics),
    /// Text-to-speech record.
    Tts(TtsMetrics),
    /// Voice-activity-detection record.
    Vad(VadMetrics),
    /// End-of-utterance record.
    Eou(PipelineEouMetrics),
}

impl MetricsRecord {
    /// The turn id this record belongs to, when tied to one.
    pub fn sequence_id(&self) -> Option<&str> {
        match self {
            Self::Llm(m) => m.sequence_id.as_deref(),
            Self::Tts(m) => m.sequence_id.as_deref(),
            Self::Eou(m) => Some(&m.sequence_id),
            Self::Stt(_) | Self::Vad(_) => None,
        }
    }

    /// Attach a turn id where the record supports one.
    pub fn with_sequence_id(mut self, sequence_id: &str) -> Self {
        match &mut self {
            Self::Llm(m) => m.sequence_id = Some(sequence_id.to_string()),
            Self::Tts(m) => m.sequence_id = Some(sequence_id.to_string()),
            Self::Eou(m) => m.sequence_id = sequence_id.to_string(),
            Self::Stt(_) | Self::Vad(_) => {}
        }
        self
    }
}
