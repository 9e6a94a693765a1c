//! Text-to-speech provider interface and streaming plumbing.
//!
//! Providers implement [`TextToSpeech`] plus a session type per mode:
//! [`ChunkedSession`] for one-shot synthesis, [`SynthesizeSession`] for
//! incremental push-based synthesis. The stream structs own retry loops and
//! metrics. Chunked-only providers gain streaming through
//! [`StreamAdapter`].

mod pool;
mod stream_adapter;

pub use pool::{connect_websocket, ConnectionPool, PooledConnection, WsStream};
pub use stream_adapter::StreamAdapter;

use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::audio::AudioFrame;
use crate::error::{AgentError, Result};
use crate::metrics::TtsMetrics;
use crate::types::{short_id, ApiConnectOptions};

/// One synthesized audio frame with its stream coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesizedAudio {
    /// Synthesis request id, constant across one stream.
    pub request_id: String,
    /// Segment this frame belongs to; rotates on flush.
    pub segment_id: String,
    /// The audio.
    pub frame: AudioFrame,
    /// Whether this is the last frame of its segment.
    pub is_final: bool,
}

/// TTS capability flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtsCapabilities {
    /// Whether the provider supports incremental text input natively.
    pub streaming: bool,
}

/// A text-to-speech provider.
pub trait TextToSpeech: Send + Sync {
    /// Provider label used in logs and metrics.
    fn label(&self) -> &str;

    /// Output sample rate in Hz.
    fn sample_rate(&self) -> u32;

    /// Output channel count.
    fn num_channels(&self) -> u32;

    /// Capability flags.
    fn capabilities(&self) -> TtsCapabilities;

    /// Synthesize a complete text.
    fn synthesize(&self, text: &str, conn_options: ApiConnectOptions) -> ChunkedStream;

    /// Open an incremental synthesis stream.
    fn stream(&self, conn_options: ApiConnectOptions) -> SynthesizeStream;
}

/// Frame sink handed to TTS sessions; tracks timing for metrics.
pub struct TtsIo {
    tx: mpsc::UnboundedSender<SynthesizedAudio>,
    stats: Arc<StdMutex<TtsStats>>,
}

impl TtsIo {
    /// Forward one frame to the consumer.
    ///
    /// # Errors
    ///
    /// Returns an error if the consumer side has been dropped.
    pub fn send(&self, audio: SynthesizedAudio) -> Result<()> {
        if let Ok(mut stats) = self.stats.lock() {
            if stats.first_frame.is_none() {
                stats.first_frame = Some(Instant::now());
            }
            stats.request_id = audio.request_id.clone();
            stats.audio_duration += audio.frame.duration();
        }
        self.tx
            .send(audio)
            .map_err(|_| AgentError::Channel("synthesis consumer dropped".into()))
    }
}

#[derive(Debug)]
struct TtsStats {
    started: Instant,
    first_frame: Option<Instant>,
    request_id: String,
    audio_duration: Duration,
}

impl TtsStats {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            first_frame: None,
            request_id: String::new(),
            audio_duration: Duration::ZERO,
        }
    }
}

/// One chunked synthesis attempt for a fixed text.
#[async_trait]
pub trait ChunkedSession: Send + Sync + 'static {
    /// Run one attempt, sending frames through `io`.
    async fn attempt(&self, io: &TtsIo) -> Result<()>;
}

/// One-shot synthesis stream with retry and metrics.
pub struct ChunkedStream {
    rx: mpsc::UnboundedReceiver<SynthesizedAudio>,
    metrics_rx: Option<oneshot::Receiver<TtsMetrics>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<Result<()>>>,
}

impl ChunkedStream {
    /// Spawn the stream driver over a provider session.
    pub fn spawn(
        label: &str,
        conn_options: ApiConnectOptions,
        session: Arc<dyn ChunkedSession>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(StdMutex::new(TtsStats::new()));
        let io = TtsIo {
            tx,
            stats: Arc::clone(&stats),
        };
        let cancel = CancellationToken::new();
        let (task, metrics_rx) = spawn_tts_driver(
            label,
            conn_options,
            cancel.clone(),
            stats,
            io,
            move |io| {
                let session = Arc::clone(&session);
                async move { session.attempt(&io).await }
            },
        );
        Self {
            rx,
            metrics_rx: Some(metrics_rx),
            cancel,
            task: Some(task),
        }
    }

    /// Next frame; yields a terminal error once, after the channel drains,
    /// when the driver failed.
    pub async fn next(&mut self) -> Option<Result<SynthesizedAudio>> {
        next_or_task_error(&mut self.rx, &mut self.task).await
    }

    /// Metrics for this stream, resolved when it finishes. May be taken
    /// once.
    pub fn take_metrics(&mut self) -> Option<oneshot::Receiver<TtsMetrics>> {
        self.metrics_rx.take()
    }

    /// Cancel synthesis and wait for the driver to exit.
    pub async fn aclose(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.task.take() {
            let _ = handle.await;
        }
    }
}

/// Input items pushed into a streaming synthesis session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TtsInput {
    /// A text fragment to synthesize.
    Text(String),
    /// Segment boundary marker.
    Flush,
}

/// Session-facing io for streaming synthesis: pull input, push frames.
pub struct SynthesizeIo {
    input: Arc<Mutex<mpsc::UnboundedReceiver<TtsInput>>>,
    out: TtsIo,
}

impl SynthesizeIo {
    /// Next input item, or `None` once the caller ended input.
    pub async fn recv(&self) -> Option<TtsInput> {
        self.input.lock().await.recv().await
    }

    /// Forward one frame to the consumer.
    ///
    /// # Errors
    ///
    /// Returns an error if the consumer side has been dropped.
    pub fn send(&self, audio: SynthesizedAudio) -> Result<()> {
        self.out.send(audio)
    }
}

/// One streaming synthesis attempt.
///
/// Re-invoked on retryable failures with the same input channel, so text
/// pushed while a previous attempt was failing is synthesized by the next
/// one (under a new request id).
#[async_trait]
pub trait SynthesizeSession: Send + Sync + 'static {
    /// Run one attempt.
    async fn attempt(&self, io: &SynthesizeIo) -> Result<()>;
}

/// Push-based streaming synthesis with retry and metrics.
pub struct SynthesizeStream {
    input_tx: Option<mpsc::UnboundedSender<TtsInput>>,
    rx: mpsc::UnboundedReceiver<SynthesizedAudio>,
    metrics_rx: Option<oneshot::Receiver<TtsMetrics>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<Result<()>>>,
}

impl SynthesizeStream {
    /// Spawn the stream driver over a provider session.
    pub fn spawn(
        label: &str,
        conn_options: ApiConnectOptions,
        session: Arc<dyn SynthesizeSession>,
    ) -> Self {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(StdMutex::new(TtsStats::new()));
        let io = SynthesizeIo {
            input: Arc::new(Mutex::new(input_rx)),
            out: TtsIo {
                tx,
                stats: Arc::clone(&stats),
            },
        };
        let cancel = CancellationToken::new();
        let (task, metrics_rx) = spawn_tts_driver(
            label,
            conn_options,
            cancel.clone(),
            stats,
            io,
            move |io| {
                let session = Arc::clone(&session);
                async move { session.attempt(&io).await }
            },
        );
        Self {
            input_tx: Some(input_tx),
            rx,
            metrics_rx: Some(metrics_rx),
            cancel,
            task: Some(task),
        }
    }

    /// Push a text fragment.
    pub fn push_text(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Some(tx) = &self.input_tx {
            let _ = tx.send(TtsInput::Text(text.to_string()));
        }
    }

    /// Take the input half so pushing can live on another task. After this,
    /// the stream's own push methods are inert.
    pub fn take_input(&mut self) -> Option<SynthesizeInput> {
        self.input_tx.take().map(|tx| SynthesizeInput { tx: Some(tx) })
    }

    /// Mark the end of the current segment.
    pub fn flush(&self) {
        if let Some(tx) = &self.input_tx {
            let _ = tx.send(TtsInput::Flush);
        }
    }

    /// Mark the end of input; no more text will be pushed.
    pub fn end_input(&mut self) {
        self.flush();
        self.input_tx = None;
    }

    /// Next frame; yields a terminal error once, after the channel drains,
    /// when the driver failed.
    pub async fn next(&mut self) -> Option<Result<SynthesizedAudio>> {
        next_or_task_error(&mut self.rx, &mut self.task).await
    }

    /// Metrics for this stream, resolved when it finishes. May be taken
    /// once.
    pub fn take_metrics(&mut self) -> Option<oneshot::Receiver<TtsMetrics>> {
        self.metrics_rx.take()
    }

    /// Cancel synthesis and wait for the driver to exit.
    pub async fn aclose(&mut self) {
        self.input_tx = None;
        self.cancel.cancel();
        if let Some(handle) = self.task.take() {
            let _ = handle.await;
        }
    }
}

/// Detached input half of a [`SynthesizeStream`].
pub struct SynthesizeInput {
    tx: Option<mpsc::UnboundedSender<TtsInput>>,
}

impl SynthesizeInput {
    /// Push a text fragment.
    pub fn push_text(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Some(tx) = &self.tx {
            let _ = tx.send(TtsInput::Text(text.to_string()));
        }
    }

    /// Mark the end of the current segment.
    pub fn flush(&self) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(TtsInput::Flush);
        }
    }

    /// Mark the end of input.
    pub fn end_input(&mut self) {
        self.flush();
        self.tx = None;
    }
}

/// Shared retry/metrics driver for both stream kinds.
fn spawn_tts_driver<Io, F, Fut>(
    label: &str,
    conn_options: ApiConnectOptions,
    cancel: CancellationToken,
    stats: Arc<StdMutex<TtsStats>>,
    io: Io,
    attempt_fn: F,
) -> (JoinHandle<Result<()>>, oneshot::Receiver<TtsMetrics>)
where
    Io: Send + Sync + 'static,
    F: Fn(Arc<Io>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send,
{
    let (metrics_tx, metrics_rx) = oneshot::channel();
    let label = label.to_string();
    let io = Arc::new(io);
    let task = tokio::spawn(async move {
        let run = async {
            let mut attempt = 0u32;
            loop {
                match attempt_fn(Arc::clone(&io)).await {
                    Ok(()) => break Ok(()),
                    Err(e) => {
                        if !e.retryable() || attempt >= conn_options.max_retry {
                            break Err(e);
                        }
                        let interval = conn_options.interval_for_retry(attempt);
                        warn!(
                            tts = %label,
                            attempt = attempt + 1,
                            "failed to synthesize speech, retrying in {interval:?}: {e}"
                        );
                        tokio::time::sleep(interval).await;
                        attempt += 1;
                    }
                }
            }
        };
        let (cancelled, outcome) = tokio::select! {
            () = cancel.cancelled() => (true, Ok(())),
            res = run => (false, res),
        };
        drop(io);

        let (ttfb, request_id, audio_duration, duration) = match stats.lock() {
            Ok(stats) => (
                stats.first_frame.map(|at| at - stats.started),
                stats.request_id.clone(),
                stats.audio_duration,
                stats.started.elapsed(),
            ),
            Err(_) => (None, String::new(), Duration::ZERO, Duration::ZERO),
        };
        let _ = metrics_tx.send(TtsMetrics {
            timestamp: Utc::now(),
            request_id,
            label,
            sequence_id: None,
            ttfb,
            duration,
            audio_duration,
            cancelled,
            error: outcome.as_ref().err().map(ToString::to_string),
        });
        outcome
    });
    (task, metrics_rx)
}

async fn next_or_task_error(
    rx: &mut mpsc::UnboundedReceiver<SynthesizedAudio>,
    task: &mut Option<JoinHandle<Result<()>>>,
) -> Option<Result<SynthesizedAudio>> {
    if let Some(audio) = rx.recv().await {
        return Some(Ok(audio));
    }
    match task.take() {
        Some(handle) => match handle.await {
            Ok(Err(e)) => Some(Err(e)),
            Ok(Ok(())) => None,
            Err(e) => Some(Err(AgentError::Pipeline(format!(
                "synthesis task panicked: {e}"
            )))),
        },
        None => None,
    }
}

/// Build a `SynthesizedAudio` sequence helper for sessions that produce one
/// audio blob per segment.
pub fn segment_frames(
    request_id: &str,
    frame_samples: Vec<Vec<f32>>,
    sample_rate: u32,
) -> Result<Vec<SynthesizedAudio>> {
    let segment_id = short_id("seg");
    let count = frame_samples.len();
    let mut out = Vec::with_capacity(count);
    for (i, samples) in frame_samples.into_iter().enumerate() {
        out.push(SynthesizedAudio {
            request_id: request_id.to_string(),
            segment_id: segment_id.clone(),
            frame: AudioFrame::new(samples, sample_rate, 1)?,
            is_final: i + 1 == count,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSession {
        request_id: String,
        frames: usize,
    }

    #[async_trait]
    impl ChunkedSession for FixedSession {
        async fn attempt(&self, io: &TtsIo) -> Result<()> {
            let segment_id = short_id("seg");
            for i in 0..self.frames {
                io.send(SynthesizedAudio {
                    request_id: self.request_id.clone(),
                    segment_id: segment_id.clone(),
                    frame: AudioFrame::silence(24_000, 1, 240),
                    is_final: i + 1 == self.frames,
                })?;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn chunked_stream_delivers_frames_and_metrics() {
        let mut stream = ChunkedStream::spawn(
            "mock-tts",
            ApiConnectOptions::default(),
            Arc::new(FixedSession {
                request_id: "req_tts".into(),
                frames: 4,
            }),
        );
        let metrics_rx = stream.take_metrics();

        let mut frames = 0;
        let mut saw_final = false;
        while let Some(audio) = stream.next().await {
            let audio = match audio {
                Ok(a) => a,
                Err(e) => unreachable!("unexpected error: {e}"),
            };
            frames += 1;
            saw_final = audio.is_final;
        }
        assert_eq!(frames, 4);
        assert!(saw_final);

        let metrics = match metrics_rx {
            Some(rx) => rx.await,
            None => unreachable!("metrics taken once"),
        };
        match metrics {
            Ok(m) => {
                assert_eq!(m.request_id, "req_tts");
                assert_eq!(m.audio_duration, Duration::from_millis(40));
                assert!(m.ttfb.is_some());
            }
            Err(_) => unreachable!("driver emits metrics"),
        }
    }

    struct EchoStreamSession;

    #[async_trait]
    impl SynthesizeSession for EchoStreamSession {
        async fn attempt(&self, io: &SynthesizeIo) -> Result<()> {
            let request_id = short_id("req");
            let mut segment_id = short_id("seg");
            let mut sent_in_segment = false;
            while let Some(input) = io.recv().await {
                match input {
                    TtsInput::Text(text) => {
                        // one frame per 10 chars, crude but deterministic
                        let frames = text.len().div_ceil(10).max(1);
                        for _ in 0..frames {
                            io.send(SynthesizedAudio {
                                request_id: request_id.clone(),
                                segment_id: segment_id.clone(),
                                frame: AudioFrame::silence(24_000, 1, 240),
                                is_final: false,
                            })?;
                        }
                        sent_in_segment = true;
                    }
                    TtsInput::Flush => {
                        if sent_in_segment {
                            io.send(SynthesizedAudio {
                                request_id: request_id.clone(),
                                segment_id: segment_id.clone(),
                                frame: AudioFrame::silence(24_000, 1, 240),
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

    #[tokio::test]
    async fn synthesize_stream_segments_on_flush() {
        let mut stream = SynthesizeStream::spawn(
            "mock-tts",
            ApiConnectOptions::default(),
            Arc::new(EchoStreamSession),
        );
        stream.push_text("hello world, first segment");
        stream.flush();
        stream.push_text("second");
        stream.end_input();

        let mut segments = Vec::new();
        let mut finals = 0;
        while let Some(audio) = stream.next().await {
            let audio = match audio {
                Ok(a) => a,
                Err(e) => unreachable!("unexpected error: {e}"),
            };
            if !segments.contains(&audio.segment_id) {
                segments.push(audio.segment_id.clone());
            }
            if audio.is_final {
                finals += 1;
            }
        }
        assert_eq!(segments.len(), 2);
        assert_eq!(finals, 2);
    }

    #[tokio::test]
    async fn empty_push_is_ignored() {
        let mut stream = SynthesizeStream::spawn(
            "mock-tts",
            ApiConnectOptions::default(),
            Arc::new(EchoStreamSession),
        );
        stream.push_text("");
        stream.end_input();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn aclose_reports_cancelled_metrics() {
        struct HangingSession;
        #[async_trait]
        impl SynthesizeSession for HangingSession {
            async fn attempt(&self, _io: &SynthesizeIo) -> Result<()> {
                std::future::pending::<()>().await;
                Ok(())
            }
        }

        let mut stream = SynthesizeStream::spawn(
            "mock-tts",
            ApiConnectOptions::default(),
            Arc::new(HangingSession),
        );
        let metrics_rx = stream.take_metrics();
        stream.aclose().await;
        if let Some(rx) = metrics_rx {
            match rx.await {
                Ok(m) => assert!(m.cancelled),
                Err(_) => unreachable!("driver emits metrics on cancel"),
            }
        }
    }

    #[test]
    fn segment_frames_marks_last_final() {
        let frames = segment_frames("req", vec![vec![0.0; 240], vec![0.0; 240]], 24_000);
        let frames = match frames {
            Ok(f) => f,
            Err(_) => unreachable!("valid samples"),
        };
        assert!(!frames[0].is_final);
        assert!(frames[1].is_final);
        assert_eq!(frames[0].segment_id, frames[1].segment_id);
    }
}
