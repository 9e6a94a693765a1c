//! Microphone-side input: drives VAD and STT for one participant.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Result;
use crate::metrics::MetricsRecord;
use crate::room::Room;
use crate::stt::{SpeechEvent, SpeechEventType, SpeechToText, SttStreamOptions};
use crate::types::ApiConnectOptions;
use crate::vad::{VadEvent, VadEventKind, VoiceActivityDetector};

/// Events surfaced to the orchestrator from the human side.
#[derive(Debug, Clone)]
pub enum HumanInputEvent {
    /// VAD detected speech onset.
    StartOfSpeech(VadEvent),
    /// One VAD inference completed.
    VadInferenceDone(VadEvent),
    /// VAD detected speech offset.
    EndOfSpeech(VadEvent),
    /// Unstable transcript update.
    InterimTranscript(SpeechEvent),
    /// Final transcript for a span of speech.
    FinalTranscript(SpeechEvent),
}

/// Subscribes to a participant's audio and fans it into VAD and STT.
pub struct HumanInput {
    identity: String,
    speaking: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl HumanInput {
    /// Start listening to `identity` in `room`.
    ///
    /// Returns the input alongside the event channel consumed by the
    /// orchestrator. STT usage metrics are forwarded to `metrics_tx`.
    ///
    /// # Errors
    ///
    /// Returns an error if the participant's audio cannot be subscribed.
    pub fn start(
        room: &Arc<dyn Room>,
        identity: &str,
        vad: Arc<dyn VoiceActivityDetector>,
        stt: Arc<dyn SpeechToText>,
        conn_options: ApiConnectOptions,
        metrics_tx: mpsc::UnboundedSender<MetricsRecord>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<HumanInputEvent>)> {
        let mut audio_rx = room.subscribe_audio(identity)?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let speaking = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        let (mut vad_sink, mut vad_events) = vad.stream().into_parts();
        let mut stt_stream = stt.stream(SttStreamOptions {
            language: None,
            conn_options,
        });
        if let Some(mut stt_metrics) = stt_stream.take_metrics() {
            let metrics_tx = metrics_tx.clone();
            tokio::spawn(async move {
                while let Some(m) = stt_metrics.recv().await {
                    let _ = metrics_tx.send(MetricsRecord::Stt(m));
                }
            });
        }
        if let Some(mut vad_metrics) = vad_events.take_metrics() {
            tokio::spawn(async move {
                while let Some(m) = vad_metrics.recv().await {
                    let _ = metrics_tx.send(MetricsRecord::Vad(m));
                }
            });
        }
        let (mut stt_sink, mut stt_events) = stt_stream.into_parts();

        // audio fan-out task
        let forward_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = forward_cancel.cancelled() => break,
                    frame = audio_rx.recv() => {
                        let Some(frame) = frame else { break };
                        vad_sink.push_frame(frame.clone());
                        if let Err(e) = stt_sink.push_frame(frame) {
                            warn!("dropping frame for STT: {e}");
                        }
                    }
                }
            }
            vad_sink.end_input();
            stt_sink.end_input();
        });

        // event pump task
        let pump_cancel = cancel.clone();
        let pump_speaking = Arc::clone(&speaking);
        let pump_identity = identity.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = pump_cancel.cancelled() => break,
                    event = vad_events.next() => {
                        let Some(event) = event else { break };
                        let mapped = match event.kind {
                            VadEventKind::StartOfSpeech => {
                                pump_speaking.store(true, Ordering::Relaxed);
                                HumanInputEvent::StartOfSpeech(event)
                            }
                            VadEventKind::InferenceDone => HumanInputEvent::VadInferenceDone(event),
                            VadEventKind::EndOfSpeech => {
                                pump_speaking.store(false, Ordering::Relaxed);
                                HumanInputEvent::EndOfSpeech(event)
                            }
                        };
                        if events_tx.send(mapped).is_err() {
                            break;
                        }
                    }
                    event = stt_events.next() => {
                        let Some(event) = event else { break };
                        let event = match event {
                            Ok(event) => event,
                            Err(e) => {
                                warn!(participant = %pump_identity, "STT stream failed: {e}");
                                break;
                            }
                        };
                        let mapped = match event.kind {
                            SpeechEventType::InterimTranscript => {
                                Some(HumanInputEvent::InterimTranscript(event))
                            }
                            SpeechEventType::FinalTranscript => {
                                Some(HumanInputEvent::FinalTranscript(event))
                            }
                            _ => None,
                        };
                        if let Some(mapped) = mapped {
                            if events_tx.send(mapped).is_err() {
                                break;
                            }
                        }
                    }
                }
            }
            debug!(participant = %pump_identity, "human input pump stopped");
        });

        Ok((
            Self {
                identity: identity.to_string(),
                speaking,
                cancel,
            },
            events_rx,
        ))
    }

    /// The linked participant's identity.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Whether VAD currently considers the user to be speaking.
    pub fn speaking(&self) -> bool {
        self.speaking.load(Ordering::Relaxed)
    }

    /// Stop listening.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for HumanInput {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
