//! Cadenza: a real-time voice-agent pipeline.
//!
//! A bidirectional streaming orchestrator coupling a human speaker and a
//! synthetic agent over a low-latency audio channel:
//! Microphone → VAD → STT → turn-taking → LLM → TTS → playout.
//!
//! # Architecture
//!
//! The pipeline is built from independent stages connected by async
//! channels:
//! - **Human input**: subscribes to the participant's audio and drives VAD
//!   and STT concurrently
//! - **Deferred validation**: decides when the user's turn has ended without
//!   cutting them off
//! - **Orchestrator**: owns the chat context and the FIFO speech queue,
//!   arbitrates barge-in, and drives nested tool-call speech
//! - **Synthesis**: streams LLM text through a sentence-shaping tokenizer
//!   into TTS, producing audio frames and a paced transcript
//! - **Playout**: writes frames to the published track with volume ducking
//!
//! Vendor VAD/STT/LLM/TTS integrations implement the provider traits in
//! [`vad`], [`stt`], [`llm`], and [`tts`]; the room transport implements
//! [`room::Room`].

pub mod audio;
pub mod config;
pub mod error;
pub mod llm;
pub mod metrics;
pub mod pipeline;
pub mod room;
pub mod stt;
pub mod test_utils;
pub mod tokenize;
pub mod transcription;
pub mod tts;
pub mod types;
pub mod vad;

pub use config::{EndpointingOptions, InterruptionOptions, PipelineOptions, TranscriptionOptions};
pub use error::{AgentError, ApiError, Result};
pub use pipeline::{AgentEvent, SpeechHandle, TurnDetector, VoicePipelineAgent};
pub use types::{AgentState, ApiConnectOptions};
