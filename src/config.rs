//! Configuration types for the voice pipeline agent.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::tokenize::basic::{hyphenate_word, BasicSentenceTokenizer, BasicWordTokenizer};
use crate::tokenize::{HyphenateFn, SentenceTokenizer, WordTokenizer};

/// Barge-in behavior while the agent is speaking.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterruptionOptions {
    /// Whether the user may interrupt agent speech at all.
    pub allow_interruptions: bool,
    /// VAD speech run length at which to attempt an interruption.
    pub speech_duration_ms: u64,
    /// Minimum transcribed words required for barge-in. 0 disables the
    /// check.
    pub min_words: usize,
}

impl Default for InterruptionOptions {
    fn default() -> Self {
        Self {
            allow_interruptions: true,
            speech_duration_ms: 500,
            min_words: 0,
        }
    }
}

impl InterruptionOptions {
    /// Speech run length threshold as a duration.
    pub fn speech_duration(&self) -> Duration {
        Duration::from_millis(self.speech_duration_ms)
    }
}

/// Turn-end delay bounds for the deferred reply validator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointingOptions {
    /// Base delay before a pending reply is validated.
    pub min_delay_ms: u64,
    /// Delay used when the turn detector thinks the user is not finished.
    pub max_delay_ms: u64,
}

impl Default for EndpointingOptions {
    fn default() -> Self {
        Self {
            min_delay_ms: 500,
            max_delay_ms: 6_000,
        }
    }
}

impl EndpointingOptions {
    /// Base delay as a duration.
    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    /// Maximum delay as a duration.
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Top-level pipeline tuning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineOptions {
    /// Barge-in behavior.
    pub interruption: InterruptionOptions,
    /// Turn-end delay bounds.
    pub endpointing: EndpointingOptions,
    /// Cap on tool-call recursion for one turn.
    pub max_nested_tool_calls: u32,
    /// Begin synthesizing on final transcript, before deferred validation
    /// fires.
    pub preemptive_synthesis: bool,
}

impl PipelineOptions {
    /// Defaults with one level of tool-call nesting.
    pub fn new() -> Self {
        Self {
            max_nested_tool_calls: 1,
            ..Self::default()
        }
    }
}

/// User-visible transcript policy.
#[derive(Clone)]
pub struct TranscriptionOptions {
    /// Forward the user's transcript to the client.
    pub user_transcription: bool,
    /// Forward the agent's transcript to the client.
    pub agent_transcription: bool,
    /// Pacing multiplier for the agent transcript; above 1.0 marks words as
    /// spoken faster than estimated.
    pub agent_transcription_speed: f64,
    /// Sentence tokenizer shaping TTS input and transcript finalization.
    pub sentence_tokenizer: Arc<dyn SentenceTokenizer>,
    /// Word tokenizer used for interim pacing and barge-in word counts.
    pub word_tokenizer: Arc<dyn WordTokenizer>,
    /// Word splitter for pacing estimates.
    pub hyphenate_word: HyphenateFn,
}

impl Default for TranscriptionOptions {
    fn default() -> Self {
        Self {
            user_transcription: true,
            agent_transcription: true,
            agent_transcription_speed: 1.0,
            sentence_tokenizer: Arc::new(BasicSentenceTokenizer::default()),
            word_tokenizer: Arc::new(BasicWordTokenizer::new(false)),
            hyphenate_word,
        }
    }
}

impl fmt::Debug for TranscriptionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TranscriptionOptions")
            .field("user_transcription", &self.user_transcription)
            .field("agent_transcription", &self.agent_transcription)
            .field(
                "agent_transcription_speed",
                &self.agent_transcription_speed,
            )
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let opts = PipelineOptions::new();
        assert!(opts.interruption.allow_interruptions);
        assert_eq!(opts.interruption.speech_duration(), Duration::from_millis(500));
        assert_eq!(opts.endpointing.min_delay(), Duration::from_millis(500));
        assert_eq!(opts.endpointing.max_delay(), Duration::from_secs(6));
        assert_eq!(opts.max_nested_tool_calls, 1);
        assert!(!opts.preemptive_synthesis);
    }

    #[test]
    fn options_deserialize_with_partial_input() {
        let parsed: Result<PipelineOptions, _> = serde_json::from_str(
            r#"{ "interruption": { "min_words": 2 }, "preemptive_synthesis": true }"#,
        );
        let opts = match parsed {
            Ok(o) => o,
            Err(e) => unreachable!("deserialization failed: {e}"),
        };
        assert_eq!(opts.interruption.min_words, 2);
        assert!(opts.interruption.allow_interruptions);
        assert!(opts.preemptive_synthesis);
    }

    #[test]
    fn transcription_defaults_are_enabled() {
        let opts = TranscriptionOptions::default();
        assert!(opts.user_transcription);
        assert!(opts.agent_transcription);
        assert!((opts.agent_transcription_speed - 1.0).abs() < f64::EPSILON);
    }
}
