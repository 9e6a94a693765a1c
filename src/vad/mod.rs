//! Voice activity detection interface, with an energy-based default.
//!
//! Model-backed detectors (Silero and friends) plug in through
//! [`VoiceActivityDetector`]; [`EnergyVad`] is a dependency-free RMS
//! thresholding implementation good enough for tests and quiet rooms.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::audio::AudioFrame;
use crate::error::{AgentError, Result};
use crate::metrics::VadMetrics;

/// Kind of a [`VadEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VadEventKind {
    /// Speech onset detected.
    StartOfSpeech,
    /// One inference pass completed; carries the current probability.
    InferenceDone,
    /// Speech offset detected.
    EndOfSpeech,
}

/// An event from a VAD stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VadEvent {
    /// Event kind.
    pub kind: VadEventKind,
    /// Speech probability in `[0, 1]` for the analyzed window.
    pub probability: f32,
    /// Length of the current speech run (with hysteresis applied).
    pub speech_duration: Duration,
    /// Length of the current silence run (with hysteresis applied).
    pub silence_duration: Duration,
    /// Raw accumulated speech in the current run, before hysteresis.
    pub raw_accumulated_speech: Duration,
    /// Raw accumulated silence in the current run, before hysteresis.
    pub raw_accumulated_silence: Duration,
}

/// A voice activity detector.
pub trait VoiceActivityDetector: Send + Sync {
    /// Detector label used in logs and metrics.
    fn label(&self) -> &str;

    /// Open a detection stream.
    fn stream(&self) -> VadStream;
}

/// One detection session: pull frames, push events.
pub struct VadIo {
    input: mpsc::UnboundedReceiver<AudioFrame>,
    tx: mpsc::UnboundedSender<VadEvent>,
}

impl VadIo {
    /// Next frame, or `None` once input ended.
    pub async fn recv(&mut self) -> Option<AudioFrame> {
        self.input.recv().await
    }

    /// Emit an event.
    ///
    /// # Errors
    ///
    /// Returns an error if the consumer side has been dropped.
    pub fn send(&self, event: VadEvent) -> Result<()> {
        self.tx
            .send(event)
            .map_err(|_| AgentError::Channel("vad stream consumer dropped".into()))
    }
}

/// Detection logic driving a [`VadStream`].
#[async_trait::async_trait]
pub trait VadSession: Send + Sync + 'static {
    /// Run detection until input ends.
    async fn run(&self, io: VadIo) -> Result<()>;
}

/// Push-based VAD stream.
pub struct VadStream {
    input_tx: Option<mpsc::UnboundedSender<AudioFrame>>,
    rx: mpsc::UnboundedReceiver<VadEvent>,
    metrics_rx: Option<mpsc::UnboundedReceiver<VadMetrics>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<Result<()>>>,
}

impl VadStream {
    /// Spawn the stream over a session.
    pub fn spawn(label: &str, session: Arc<dyn VadSession>) -> Self {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (tx, rx) = mpsc::unbounded_channel();
        let (metrics_tx, metrics_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let io = VadIo { input: input_rx, tx };
        let token = cancel.clone();
        let label = label.to_string();
        let started = Instant::now();
        let task = tokio::spawn(async move {
            let result = tokio::select! {
                () = token.cancelled() => Ok(()),
                res = session.run(io) => res,
            };
            let _ = metrics_tx.send(VadMetrics {
                timestamp: Utc::now(),
                label,
                idle_time: Duration::ZERO,
                inference_duration_total: started.elapsed(),
                inference_count: 0,
            });
            result
        });

        Self {
            input_tx: Some(input_tx),
            rx,
            metrics_rx: Some(metrics_rx),
            cancel,
            task: Some(task),
        }
    }

    /// Push a frame for analysis.
    pub fn push_frame(&self, frame: AudioFrame) {
        if let Some(tx) = &self.input_tx {
            let _ = tx.send(frame);
        }
    }

    /// Mark the end of input.
    pub fn end_input(&mut self) {
        self.input_tx = None;
    }

    /// Next event, or `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<VadEvent> {
        self.rx.recv().await
    }

    /// Session metrics records. May be taken once.
    pub fn take_metrics(&mut self) -> Option<mpsc::UnboundedReceiver<VadMetrics>> {
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
    pub fn into_parts(mut self) -> (VadSink, VadEvents) {
        let sink = VadSink {
            input_tx: self.input_tx.take(),
        };
        (sink, VadEvents { stream: self })
    }
}

/// Input half of a split [`VadStream`].
pub struct VadSink {
    input_tx: Option<mpsc::UnboundedSender<AudioFrame>>,
}

impl VadSink {
    /// Push a frame for analysis.
    pub fn push_frame(&self, frame: AudioFrame) {
        if let Some(tx) = &self.input_tx {
            let _ = tx.send(frame);
        }
    }

    /// Mark the end of input.
    pub fn end_input(&mut self) {
        self.input_tx = None;
    }
}

/// Event half of a split [`VadStream`].
pub struct VadEvents {
    stream: VadStream,
}

impl VadEvents {
    /// Next event, or `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<VadEvent> {
        self.stream.next().await
    }

    /// Session metrics records. May be taken once.
    pub fn take_metrics(&mut self) -> Option<mpsc::UnboundedReceiver<VadMetrics>> {
        self.stream.take_metrics()
    }

    /// Close the stream immediately.
    pub async fn aclose(&mut self) {
        self.stream.aclose().await;
    }
}

/// Tuning for [`EnergyVad`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnergyVadOptions {
    /// RMS threshold above which a window counts as speech.
    pub activation_threshold: f32,
    /// Speech run length required before `StartOfSpeech` fires.
    pub min_speech_duration_ms: u64,
    /// Silence run length required before `EndOfSpeech` fires.
    pub min_silence_duration_ms: u64,
}

impl Default for EnergyVadOptions {
    fn default() -> Self {
        Self {
            activation_threshold: 0.01,
            min_speech_duration_ms: 50,
            min_silence_duration_ms: 550,
        }
    }
}

/// RMS-energy voice activity detector.
#[derive(Debug, Clone, Default)]
pub struct EnergyVad {
    options: EnergyVadOptions,
}

impl EnergyVad {
    /// Create a detector with the given tuning.
    pub fn new(options: EnergyVadOptions) -> Self {
        Self { options }
    }
}

impl VoiceActivityDetector for EnergyVad {
    fn label(&self) -> &str {
        "energy-vad"
    }

    fn stream(&self) -> VadStream {
        VadStream::spawn(
            self.label(),
            Arc::new(EnergySession {
                options: self.options.clone(),
            }),
        )
    }
}

struct EnergySession {
    options: EnergyVadOptions,
}

#[async_trait::async_trait]
impl VadSession for EnergySession {
    async fn run(&self, mut io: VadIo) -> Result<()> {
        let min_speech = Duration::from_millis(self.options.min_speech_duration_ms);
        let min_silence = Duration::from_millis(self.options.min_silence_duration_ms);

        let mut speaking = false;
        let mut speech_run = Duration::ZERO;
        let mut silence_run = Duration::ZERO;

        while let Some(frame) = io.recv().await {
            let window = frame.duration();
            let rms = rms_energy(&frame.data);
            let is_speech = rms > self.options.activation_threshold;
            // map energy onto a coarse pseudo-probability around the threshold
            let probability =
                (rms / (self.options.activation_threshold * 2.0)).clamp(0.0, 1.0);

            if is_speech {
                speech_run += window;
                silence_run = Duration::ZERO;
            } else {
                silence_run += window;
                if !speaking {
                    speech_run = Duration::ZERO;
                }
            }

            if !speaking && speech_run >= min_speech {
                speaking = true;
                io.send(VadEvent {
                    kind: VadEventKind::StartOfSpeech,
                    probability,
                    speech_duration: speech_run,
                    silence_duration: Duration::ZERO,
                    raw_accumulated_speech: speech_run,
                    raw_accumulated_silence: Duration::ZERO,
                })?;
            }

            io.send(VadEvent {
                kind: VadEventKind::InferenceDone,
                probability,
                speech_duration: if speaking { speech_run } else { Duration::ZERO },
                silence_duration: silence_run,
                raw_accumulated_speech: speech_run,
                raw_accumulated_silence: silence_run,
            })?;

            if speaking && silence_run >= min_silence {
                speaking = false;
                io.send(VadEvent {
                    kind: VadEventKind::EndOfSpeech,
                    probability,
                    speech_duration: speech_run,
                    silence_duration: silence_run,
                    raw_accumulated_speech: speech_run,
                    raw_accumulated_silence: silence_run,
                })?;
                speech_run = Duration::ZERO;
                silence_run = Duration::ZERO;
            }
        }
        Ok(())
    }
}

fn rms_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loud_frame() -> AudioFrame {
        match AudioFrame::new(vec![0.5; 1600], 16_000, 1) {
            Ok(f) => f,
            Err(_) => unreachable!("valid frame"),
        }
    }

    fn quiet_frame() -> AudioFrame {
        AudioFrame::silence(16_000, 1, 1600)
    }

    #[tokio::test]
    async fn detects_speech_boundaries() {
        let vad = EnergyVad::default();
        let mut stream = vad.stream();

        for _ in 0..3 {
            stream.push_frame(loud_frame());
        }
        for _ in 0..6 {
            stream.push_frame(quiet_frame());
        }
        stream.end_input();

        let mut kinds = Vec::new();
        while let Some(event) = stream.next().await {
            kinds.push(event.kind);
        }
        assert_eq!(kinds.first(), Some(&VadEventKind::StartOfSpeech));
        assert!(kinds.contains(&VadEventKind::EndOfSpeech));
        let inference_count = kinds
            .iter()
            .filter(|k| **k == VadEventKind::InferenceDone)
            .count();
        assert_eq!(inference_count, 9);
    }

    #[tokio::test]
    async fn silence_alone_emits_no_boundaries() {
        let vad = EnergyVad::default();
        let mut stream = vad.stream();
        for _ in 0..5 {
            stream.push_frame(quiet_frame());
        }
        stream.end_input();

        while let Some(event) = stream.next().await {
            assert_eq!(event.kind, VadEventKind::InferenceDone);
            assert_eq!(event.speech_duration, Duration::ZERO);
        }
    }

    #[tokio::test]
    async fn speech_duration_accumulates() {
        let vad = EnergyVad::default();
        let mut stream = vad.stream();
        for _ in 0..5 {
            stream.push_frame(loud_frame());
        }
        stream.end_input();

        let mut last_speech = Duration::ZERO;
        while let Some(event) = stream.next().await {
            if event.kind == VadEventKind::InferenceDone {
                assert!(event.speech_duration >= last_speech);
                last_speech = event.speech_duration;
            }
        }
        assert_eq!(last_speech, Duration::from_millis(500));
    }
}
