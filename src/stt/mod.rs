//! Speech-to-text provider interface and streaming plumbing.
//!
//! Providers implement [`SpeechToText`] plus a [`RecognizeSession`] running
//! one streaming attempt. [`RecognizeStream`] owns the input channel, the
//! retry loop (sessions are restartable: unconsumed input survives a retry),
//! and metrics emission.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::audio::{combined_duration, AudioFrame};
use crate::error::{AgentError, Result};
use crate::metrics::SttMetrics;
use crate::types::{short_id, ApiConnectOptions};

/// Kind of a [`SpeechEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeechEventType {
    /// The user started speaking. STTs without native support emit this
    /// together with the first interim transcript.
    StartOfSpeech,
    /// Unstable partial transcript.
    InterimTranscript,
    /// Transcript the STT will not change anymore.
    FinalTranscript,
    /// Periodic usage report.
    RecognitionUsage,
    /// The user stopped speaking.
    EndOfSpeech,
}

/// One transcription alternative.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpeechData {
    /// Detected language, if reported.
    pub language: Option<String>,
    /// Transcript text.
    pub text: String,
    /// Start of the recognized span, seconds from session start.
    pub start_time: f64,
    /// End of the recognized span, seconds from session start.
    pub end_time: f64,
    /// Confidence in `[0, 1]`.
    pub confidence: f32,
}

/// Usage accounting attached to [`SpeechEventType::RecognitionUsage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecognitionUsage {
    /// Audio processed since the last usage event.
    pub audio_duration: std::time::Duration,
}

/// An event from a recognition session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeechEvent {
    /// Event kind.
    pub kind: SpeechEventType,
    /// Recognition session id.
    pub request_id: String,
    /// Transcription alternatives, best first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternatives: Vec<SpeechData>,
    /// Present iff `kind` is `RecognitionUsage`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recognition_usage: Option<RecognitionUsage>,
}

impl SpeechEvent {
    /// An event with no alternatives.
    pub fn new(kind: SpeechEventType) -> Self {
        Self {
            kind,
            request_id: String::new(),
            alternatives: Vec::new(),
            recognition_usage: None,
        }
    }

    /// Best alternative's text, if any.
    pub fn text(&self) -> Option<&str> {
        self.alternatives.first().map(|a| a.text.as_str())
    }

    /// Best alternative's language, if any.
    pub fn language(&self) -> Option<&str> {
        self.alternatives.first().and_then(|a| a.language.as_deref())
    }
}

/// STT capability flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SttCapabilities {
    /// Whether the provider supports a push-based streaming session.
    pub streaming: bool,
    /// Whether interim transcripts are produced.
    pub interim_results: bool,
}

/// Options for opening a [`RecognizeStream`].
#[derive(Debug, Clone, Default)]
pub struct SttStreamOptions {
    /// Language hint.
    pub language: Option<String>,
    /// Connection and retry policy.
    pub conn_options: ApiConnectOptions,
}

/// A speech-to-text provider.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Provider label used in logs and metrics.
    fn label(&self) -> &str;

    /// Capability flags.
    fn capabilities(&self) -> SttCapabilities;

    /// One batch recognition attempt over buffered audio. Use
    /// [`recognize`] for the retrying wrapper.
    async fn recognize_once(
        &self,
        frames: &[AudioFrame],
        language: Option<&str>,
    ) -> Result<SpeechEvent>;

    /// Open a streaming recognition session.
    fn stream(&self, options: SttStreamOptions) -> RecognizeStream;
}

/// Batch recognition with retries per `conn_options`.
///
/// Returns the final transcript event and the metrics record for the
/// successful attempt.
///
/// # Errors
///
/// Returns the last error once retries are exhausted or a terminal error
/// occurs.
pub async fn recognize(
    stt: &dyn SpeechToText,
    frames: &[AudioFrame],
    language: Option<&str>,
    conn_options: ApiConnectOptions,
) -> Result<(SpeechEvent, SttMetrics)> {
    let mut attempt = 0u32;
    loop {
        let started = Instant::now();
        match stt.recognize_once(frames, language).await {
            Ok(event) => {
                let metrics = SttMetrics {
                    timestamp: Utc::now(),
                    request_id: event.request_id.clone(),
                    label: stt.label().to_string(),
                    audio_duration: combined_duration(frames),
                    duration: started.elapsed(),
                    streamed: false,
                    error: None,
                };
                return Ok((event, metrics));
            }
            Err(e) => {
                if !e.retryable() || attempt >= conn_options.max_retry {
                    return Err(e);
                }
                let interval = conn_options.interval_for_retry(attempt);
                warn!(
                    stt = %stt.label(),
                    attempt = attempt + 1,
                    "failed to recognize speech, retrying in {interval:?}: {e}"
                );
                tokio::time::sleep(interval).await;
                attempt += 1;
            }
        }
    }
}

/// Input items pushed into a recognition session.
#[derive(Debug, Clone)]
pub enum SttStreamInput {
    /// An audio frame to recognize.
    Frame(AudioFrame),
    /// Segment boundary marker.
    Flush,
}

/// Session-facing io handle: pull input, push events.
pub struct RecognizeIo {
    input: Arc<Mutex<mpsc::UnboundedReceiver<SttStreamInput>>>,
    tx: mpsc::UnboundedSender<SpeechEvent>,
    metrics_tx: mpsc::UnboundedSender<SttMetrics>,
    label: String,
    started: Instant,
}

impl RecognizeIo {
    /// Next input item, or `None` once the caller ended input.
    pub async fn recv(&self) -> Option<SttStreamInput> {
        self.input.lock().await.recv().await
    }

    /// Emit a speech event to the consumer.
    ///
    /// # Errors
    ///
    /// Returns an error if the consumer side has been dropped.
    pub fn send(&self, event: SpeechEvent) -> Result<()> {
        if event.kind == SpeechEventType::RecognitionUsage {
            if let Some(usage) = &event.recognition_usage {
                let _ = self.metrics_tx.send(SttMetrics {
                    timestamp: Utc::now(),
                    request_id: event.request_id.clone(),
                    label: self.label.clone(),
                    audio_duration: usage.audio_duration,
                    duration: self.started.elapsed(),
                    streamed: true,
                    error: None,
                });
            }
        }
        self.tx
            .send(event)
            .map_err(|_| AgentError::Channel("recognize stream consumer dropped".into()))
    }
}

/// One streaming recognition attempt.
///
/// Re-invoked on retryable failures with the same input channel, so frames
/// pushed while a previous attempt was failing are recognized by the next
/// one.
#[async_trait]
pub trait RecognizeSession: Send + Sync + 'static {
    /// Run one attempt.
    async fn attempt(&self, io: &RecognizeIo) -> Result<()>;
}

/// Push-based streaming recognition with retry and metrics.
pub struct RecognizeStream {
    request_id: String,
    input_tx: Option<mpsc::UnboundedSender<SttStreamInput>>,
    rx: mpsc::UnboundedReceiver<SpeechEvent>,
    metrics_rx: Option<mpsc::UnboundedReceiver<SttMetrics>>,
    pushed_sample_rate: Option<u32>,
    cancel: CancellationToken,
    task: Option<JoinHandle<Result<()>>>,
}

impl RecognizeStream {
    /// Spawn the stream driver over a provider session.
    pub fn spawn(
        label: &str,
        conn_options: ApiConnectOptions,
        session: Arc<dyn RecognizeSession>,
    ) -> Self {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (tx, rx) = mpsc::unbounded_channel();
        let (metrics_tx, metrics_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let io = RecognizeIo {
            input: Arc::new(Mutex::new(input_rx)),
            tx,
            metrics_tx,
            label: label.to_string(),
            started: Instant::now(),
        };
        let label = label.to_string();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let run = async {
                let mut attempt = 0u32;
                loop {
                    match session.attempt(&io).await {
                        Ok(()) => break Ok(()),
                        Err(e) => {
                            if !e.retryable() || attempt >= conn_options.max_retry {
                                break Err(e);
                            }
                            let interval = conn_options.interval_for_retry(attempt);
                            warn!(
                                stt = %label,
                                attempt = attempt + 1,
                                "recognize stream failed, retrying in {interval:?}: {e}"
                            );
                            tokio::time::sleep(interval).await;
                            attempt += 1;
                        }
                    }
                }
            };
            tokio::select! {
                () = token.cancelled() => Ok(()),
                res = run => res,
            }
        });

        Self {
            request_id: short_id("stt"),
            input_tx: Some(input_tx),
            rx,
            metrics_rx: Some(metrics_rx),
            pushed_sample_rate: None,
            cancel,
            task: Some(task),
        }
    }

    /// Id of this recognition session.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Push audio to be recognized.
    ///
    /// # Errors
    ///
    /// Returns an error if input already ended or the frame's sample rate
    /// differs from previously pushed frames.
    pub fn push_frame(&mut self, frame: AudioFrame) -> Result<()> {
        let Some(input_tx) = &self.input_tx else {
            return Err(AgentError::Stt("recognize stream input ended".into()));
        };
        if let Some(rate) = self.pushed_sample_rate {
            if rate != frame.sample_rate {
                return Err(AgentError::Stt(format!(
                    "input sample rate changed from {rate} to {}",
                    frame.sample_rate
                )));
            }
        } else {
            self.pushed_sample_rate = Some(frame.sample_rate);
        }
        input_tx
            .send(SttStreamInput::Frame(frame))
            .map_err(|_| AgentError::Channel("recognize session ended".into()))
    }

    /// Mark the end of the current segment.
    pub fn flush(&mut self) {
        if let Some(input_tx) = &self.input_tx {
            let _ = input_tx.send(SttStreamInput::Flush);
        }
    }

    /// Mark the end of input; no more audio will be pushed.
    pub fn end_input(&mut self) {
        self.flush();
        self.input_tx = None;
    }

    /// Next event; yields a terminal error once, after the channel drains,
    /// when the driver failed.
    pub async fn next(&mut self) -> Option<Result<SpeechEvent>> {
        if let Some(event) = self.rx.recv().await {
            return Some(Ok(event));
        }
        match self.task.take() {
            Some(handle) => match handle.await {
                Ok(Err(e)) => Some(Err(e)),
                Ok(Ok(())) => None,
                Err(e) => Some(Err(AgentError::Pipeline(format!(
                    "recognize stream task panicked: {e}"
                )))),
            },
            None => None,
        }
    }

    /// Streamed usage metrics records. May be taken once.
    pub fn take_metrics(&mut self) -> Option<mpsc::UnboundedReceiver<SttMetrics>> {
        self.metrics_rx.take()
    }

    /// Close the stream immediately.
    pub async fn aclose(&mut self) {
        self.input_tx = None;
        self.cancel.cancel();
        if let Some(handle) = self.task.take() {
            let _ = handle.await;
        }
    }

    /// Split into an input half and an event half so pushing and consuming
    /// can live on different tasks.
    pub fn into_parts(mut self) -> (RecognizeSink, RecognizeEvents) {
        let sink = RecognizeSink {
            input_tx: self.input_tx.take(),
            pushed_sample_rate: self.pushed_sample_rate,
        };
        (sink, RecognizeEvents { stream: self })
    }
}

/// Input half of a split [`RecognizeStream`].
pub struct RecognizeSink {
    input_tx: Option<mpsc::UnboundedSender<SttStreamInput>>,
    pushed_sample_rate: Option<u32>,
}

impl RecognizeSink {
    /// Push audio to be recognized.
    ///
    /// # Errors
    ///
    /// Returns an error if input already ended or the frame's sample rate
    /// differs from previously pushed frames.
    pub fn push_frame(&mut self, frame: AudioFrame) -> Result<()> {
        let Some(input_tx) = &self.input_tx else {
            return Err(AgentError::Stt("recognize stream input ended".into()));
        };
        if let Some(rate) = self.pushed_sample_rate {
            if rate != frame.sample_rate {
                return Err(AgentError::Stt(format!(
                    "input sample rate changed from {rate} to {}",
                    frame.sample_rate
                )));
            }
        } else {
            self.pushed_sample_rate = Some(frame.sample_rate);
        }
        input_tx
            .send(SttStreamInput::Frame(frame))
            .map_err(|_| AgentError::Channel("recognize session ended".into()))
    }

    /// Mark the end of the current segment.
    pub fn flush(&mut self) {
        if let Some(input_tx) = &self.input_tx {
            let _ = input_tx.send(SttStreamInput::Flush);
        }
    }

    /// Mark the end of input.
    pub fn end_input(&mut self) {
        self.flush();
        self.input_tx = None;
    }
}

/// Event half of a split [`RecognizeStream`].
pub struct RecognizeEvents {
    stream: RecognizeStream,
}

impl RecognizeEvents {
    /// Next event, see [`RecognizeStream::next`].
    pub async fn next(&mut self) -> Option<Result<SpeechEvent>> {
        self.stream.next().await
    }

    /// Streamed usage metrics records. May be taken once.
    pub fn take_metrics(&mut self) -> Option<mpsc::UnboundedReceiver<SttMetrics>> {
        self.stream.take_metrics()
    }

    /// Close the stream immediately.
    pub async fn aclose(&mut self) {
        self.stream.aclose().await;
    }
}
