//! Channel-backed mock providers for tests.
//!
//! These run the full pipeline without any network or model dependency:
//! an energy-triggered STT that replays canned transcripts, a word-streaming
//! LLM with optional tool-call scripts, and a TTS whose audio duration is
//! proportional to the text length.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::audio::AudioFrame;
use crate::error::Result;
use crate::llm::{
    ChatChunk, ChatContext, ChatRequest, ChatRole, Choice, ChoiceDelta, CompletionUsage,
    FunctionCallInfo, LanguageModel, LlmSession, LlmStream, LlmStreamIo,
};
use crate::stt::{
    RecognizeIo, RecognizeSession, RecognizeStream, SpeechData, SpeechEvent, SpeechEventType,
    SpeechToText, SttCapabilities, SttStreamInput, SttStreamOptions,
};
use crate::tts::{
    ChunkedSession, ChunkedStream, SynthesizeIo, SynthesizeSession, SynthesizeStream,
    SynthesizedAudio, TextToSpeech, TtsCapabilities, TtsInput, TtsIo,
};
use crate::types::{short_id, ApiConnectOptions};

/// Synthesized audio time per character of input text.
const MOCK_TTS_MS_PER_CHAR: u64 = 10;
/// RMS threshold the mock STT treats as speech.
const MOCK_STT_THRESHOLD: f32 = 0.01;

// ── LLM ───────────────────────────────────────────────────────

/// One scripted LLM response.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Stream this text word by word.
    Text(String),
    /// Request a tool call (optionally speaking text alongside it).
    ToolCall {
        /// Function name to call.
        name: String,
        /// Arguments to pass.
        arguments: Value,
        /// Text spoken in the same turn, if any.
        speak: Option<String>,
    },
}

/// Scripted language model.
pub struct MockLlm {
    replies: Arc<Mutex<VecDeque<MockReply>>>,
    default_reply: String,
}

impl MockLlm {
    /// A model answering `default_reply` whenever the script is empty.
    pub fn new(default_reply: &str) -> Self {
        Self {
            replies: Arc::new(Mutex::new(VecDeque::new())),
            default_reply: default_reply.to_string(),
        }
    }

    /// Queue the next scripted response.
    pub fn push_reply(&self, reply: MockReply) {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_back(reply);
        }
    }
}

struct MockLlmSession {
    reply: MockReply,
}

#[async_trait]
impl LlmSession for MockLlmSession {
    async fn attempt(&self, io: &LlmStreamIo) -> Result<()> {
        let request_id = short_id("req");
        match &self.reply {
            MockReply::Text(text) => {
                let words: Vec<&str> = text.split_inclusive(' ').collect();
                let count = words.len();
                for (i, word) in words.into_iter().enumerate() {
                    io.send(ChatChunk {
                        request_id: request_id.clone(),
                        choices: vec![Choice {
                            delta: ChoiceDelta {
                                role: Some(ChatRole::Assistant),
                                content: Some(word.to_string()),
                                tool_calls: Vec::new(),
                            },
                            index: 0,
                        }],
                        usage: if i + 1 == count {
                            Some(CompletionUsage {
                                completion_tokens: count as u32,
                                prompt_tokens: 10,
                                total_tokens: count as u32 + 10,
                            })
                        } else {
                            None
                        },
                    })?;
                    tokio::task::yield_now().await;
                }
            }
            MockReply::ToolCall {
                name,
                arguments,
                speak,
            } => {
                io.send(ChatChunk {
                    request_id: request_id.clone(),
                    choices: vec![Choice {
                        delta: ChoiceDelta {
                            role: Some(ChatRole::Assistant),
                            content: speak.clone(),
                            tool_calls: vec![FunctionCallInfo {
                                tool_call_id: short_id("call"),
                                name: name.clone(),
                                raw_arguments: arguments.to_string(),
                                arguments: arguments.clone(),
                            }],
                        },
                        index: 0,
                    }],
                    usage: Some(CompletionUsage {
                        completion_tokens: 1,
                        prompt_tokens: 10,
                        total_tokens: 11,
                    }),
                })?;
            }
        }
        Ok(())
    }
}

impl LanguageModel for MockLlm {
    fn label(&self) -> &str {
        "mock-llm"
    }

    fn chat(&self, request: ChatRequest) -> LlmStream {
        let reply = self
            .replies
            .lock()
            .ok()
            .and_then(|mut r| r.pop_front())
            .unwrap_or_else(|| MockReply::Text(self.default_reply.clone()));
        LlmStream::spawn(
            self.label(),
            request.chat_ctx,
            request.fnc_ctx,
            request.conn_options,
            Arc::new(MockLlmSession { reply }),
        )
    }
}

// ── STT ───────────────────────────────────────────────────────

/// Energy-triggered STT replaying canned final transcripts.
///
/// After a run of loud frames followed by a short silence, the next queued
/// transcript is emitted as a final. Silence alone produces nothing.
pub struct MockStt {
    finals: Arc<Mutex<VecDeque<String>>>,
}

impl MockStt {
    /// An STT with an empty transcript queue.
    pub fn new() -> Self {
        Self {
            finals: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Queue the transcript emitted for the next detected utterance.
    pub fn push_final(&self, text: &str) {
        if let Ok(mut finals) = self.finals.lock() {
            finals.push_back(text.to_string());
        }
    }
}

impl Default for MockStt {
    fn default() -> Self {
        Self::new()
    }
}

struct MockSttSession {
    finals: Arc<Mutex<VecDeque<String>>>,
}

#[async_trait]
impl RecognizeSession for MockSttSession {
    async fn attempt(&self, io: &RecognizeIo) -> Result<()> {
        let request_id = short_id("stt");
        let mut loud_frames = 0u32;
        let mut quiet_after_speech = 0u32;

        while let Some(input) = io.recv().await {
            let SttStreamInput::Frame(frame) = input else {
                continue;
            };
            let rms = {
                let sum: f32 = frame.data.iter().map(|s| s * s).sum();
                (sum / frame.data.len().max(1) as f32).sqrt()
            };
            if rms > MOCK_STT_THRESHOLD {
                loud_frames += 1;
                quiet_after_speech = 0;
            } else if loud_frames >= 2 {
                quiet_after_speech += 1;
                if quiet_after_speech >= 2 {
                    let text = self.finals.lock().ok().and_then(|mut f| f.pop_front());
                    if let Some(text) = text {
                        io.send(SpeechEvent {
                            kind: SpeechEventType::FinalTranscript,
                            request_id: request_id.clone(),
                            alternatives: vec![SpeechData {
                                language: Some("en".into()),
                                text,
                                confidence: 1.0,
                                ..SpeechData::default()
                            }],
                            recognition_usage: None,
                        })?;
                    }
                    loud_frames = 0;
                    quiet_after_speech = 0;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SpeechToText for MockStt {
    fn label(&self) -> &str {
        "mock-stt"
    }

    fn capabilities(&self) -> SttCapabilities {
        SttCapabilities {
            streaming: true,
            interim_results: false,
        }
    }

    async fn recognize_once(
        &self,
        _frames: &[AudioFrame],
        _language: Option<&str>,
    ) -> Result<SpeechEvent> {
        let text = self
            .finals
            .lock()
            .ok()
            .and_then(|mut f| f.pop_front())
            .unwrap_or_default();
        Ok(SpeechEvent {
            kind: SpeechEventType::FinalTranscript,
            request_id: short_id("stt"),
            alternatives: vec![SpeechData {
                language: Some("en".into()),
                text,
                confidence: 1.0,
                ..SpeechData::default()
            }],
            recognition_usage: None,
        })
    }

    fn stream(&self, options: SttStreamOptions) -> RecognizeStream {
        RecognizeStream::spawn(
            self.label(),
            options.conn_options,
            Arc::new(MockSttSession {
                finals: Arc::clone(&self.finals),
            }),
        )
    }
}

// ── TTS ───────────────────────────────────────────────────────

/// Streaming TTS producing silence proportional to the input length.
pub struct MockTts;

fn frame_for_text(text: &str) -> AudioFrame {
    let ms = (text.len() as u64 * MOCK_TTS_MS_PER_CHAR).max(MOCK_TTS_MS_PER_CHAR);
    let samples = (ms * 24) as u32; // 24kHz mono
    AudioFrame::silence(24_000, 1, samples)
}

/// Duration of audio [`MockTts`] produces for `text`.
pub fn mock_tts_duration(text: &str) -> Duration {
    Duration::from_millis((text.len() as u64 * MOCK_TTS_MS_PER_CHAR).max(MOCK_TTS_MS_PER_CHAR))
}

struct MockTtsStreamSession;

#[async_trait]
impl SynthesizeSession for MockTtsStreamSession {
    async fn attempt(&self, io: &SynthesizeIo) -> Result<()> {
        let request_id = short_id("tts");
        let mut segment_id = short_id("seg");
        let mut sent_in_segment = false;
        while let Some(input) = io.recv().await {
            match input {
                TtsInput::Text(text) => {
                    io.send(SynthesizedAudio {
                        request_id: request_id.clone(),
                        segment_id: segment_id.clone(),
                        frame: frame_for_text(&text),
                        is_final: false,
                    })?;
                    sent_in_segment = true;
                    tokio::task::yield_now().await;
                }
                TtsInput::Flush => {
                    if sent_in_segment {
                        io.send(SynthesizedAudio {
                            request_id: request_id.clone(),
                            segment_id: segment_id.clone(),
                            frame: AudioFrame::silence(24_000, 1, 24),
                            is_final: true,
                        })?;
                    }
                    segment_id = short_id("seg");
                    sent_in_segment = false;
                }
            }
        }
        Ok(())
    }
}

struct MockTtsChunkedSession {
    text: String,
}

#[async_trait]
impl ChunkedSession for MockTtsChunkedSession {
    async fn attempt(&self, io: &TtsIo) -> Result<()> {
        let request_id = short_id("tts");
        let segment_id = short_id("seg");
        io.send(SynthesizedAudio {
            request_id,
            segment_id,
            frame: frame_for_text(&self.text),
            is_final: true,
        })?;
        Ok(())
    }
}

impl TextToSpeech for MockTts {
    fn label(&self) -> &str {
        "mock-tts"
    }

    fn sample_rate(&self) -> u32 {
        24_000
    }

    fn num_channels(&self) -> u32 {
        1
    }

    fn capabilities(&self) -> TtsCapabilities {
        TtsCapabilities { streaming: true }
    }

    fn synthesize(&self, text: &str, conn_options: ApiConnectOptions) -> ChunkedStream {
        ChunkedStream::spawn(
            self.label(),
            conn_options,
            Arc::new(MockTtsChunkedSession { text: text.into() }),
        )
    }

    fn stream(&self, conn_options: ApiConnectOptions) -> SynthesizeStream {
        SynthesizeStream::spawn(self.label(), conn_options, Arc::new(MockTtsStreamSession))
    }
}

/// Loud mono audio frames (100ms each) for driving the VAD.
pub fn loud_frames(count: usize) -> Vec<AudioFrame> {
    (0..count)
        .map(|_| match AudioFrame::new(vec![0.5; 1600], 16_000, 1) {
            Ok(frame) => frame,
            Err(_) => AudioFrame::silence(16_000, 1, 1600),
        })
        .collect()
}

/// Silent mono audio frames (100ms each).
pub fn quiet_frames(count: usize) -> Vec<AudioFrame> {
    (0..count)
        .map(|_| AudioFrame::silence(16_000, 1, 1600))
        .collect()
}

/// A chat context with a standard system prompt for tests.
pub fn test_chat_ctx() -> ChatContext {
    ChatContext::with_system_prompt("You are a concise voice assistant.")
}
