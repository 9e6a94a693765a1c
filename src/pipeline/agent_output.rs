//! Synthesis pipeline: a speech source becomes audio frames plus a paced
//! transcript.
//!
//! Stages run concurrently: the text source is pushed into the TTS stream,
//! synthesized frames feed both the transcription forwarder and the playout
//! buffer, and the transcript source feeds the forwarder. An interrupt
//! cancels all readers and closes the playout buffer on any exit path.

use std::pin::Pin;
use std::sync::{Arc, Mutex};

use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::agent_playout::{AgentPlayout, PlayoutHandle};
use crate::audio::AudioFrame;
use crate::config::TranscriptionOptions;
use crate::error::{AgentError, Result};
use crate::metrics::MetricsRecord;
use crate::transcription::TranscriptionForwarder;
use crate::tts::TextToSpeech;
use crate::types::ApiConnectOptions;

/// A lazily produced text sequence.
pub type TextStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// Where the text of an utterance comes from.
pub enum SpeechSource {
    /// A complete string.
    Text(String),
    /// A string still being computed.
    Pending(futures_util::future::BoxFuture<'static, String>),
    /// A lazy text sequence (LLM output, token stream).
    Stream(TextStream),
}

impl From<String> for SpeechSource {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for SpeechSource {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl SpeechSource {
    async fn resolve(self) -> ResolvedSource {
        match self {
            Self::Text(text) => ResolvedSource::Text(text),
            Self::Pending(fut) => ResolvedSource::Text(fut.await),
            Self::Stream(stream) => ResolvedSource::Stream(stream),
        }
    }
}

enum ResolvedSource {
    Text(String),
    Stream(TextStream),
}

/// Split a text stream into two with bounded fan-out.
///
/// Channels have capacity 1: a reader that falls behind blocks the faster
/// one, bounding memory regardless of source speed.
pub fn tee_text_stream(mut stream: TextStream) -> (TextStream, TextStream) {
    let (tx_a, rx_a) = mpsc::channel::<String>(1);
    let (tx_b, rx_b) = mpsc::channel::<String>(1);
    tokio::spawn(async move {
        while let Some(item) = stream.next().await {
            let (a, b) = tokio::join!(tx_a.send(item.clone()), tx_b.send(item));
            if a.is_err() && b.is_err() {
                break;
            }
        }
    });
    (
        Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx_a)),
        Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx_b)),
    )
}

/// One in-flight synthesis. Owned by its speech handle; releases the frame
/// buffer and playout handle on interruption.
#[derive(Clone)]
pub struct SynthesisHandle {
    speech_id: String,
    inner: Arc<SynthesisShared>,
}

struct SynthesisShared {
    buf_rx: Mutex<Option<mpsc::UnboundedReceiver<AudioFrame>>>,
    forwarder: TranscriptionForwarder,
    playout: AgentPlayout,
    interrupt: CancellationToken,
    play_handle: Mutex<Option<PlayoutHandle>>,
}

impl SynthesisHandle {
    /// Id of the speech being synthesized.
    pub fn speech_id(&self) -> &str {
        &self.speech_id
    }

    /// The transcription forwarder pacing this utterance.
    pub fn tts_forwarder(&self) -> TranscriptionForwarder {
        self.inner.forwarder.clone()
    }

    /// Whether the speech has been validated for playout.
    pub fn validated(&self) -> bool {
        self.inner
            .play_handle
            .lock()
            .map(|h| h.is_some())
            .unwrap_or(false)
    }

    /// Whether this synthesis has been interrupted.
    pub fn interrupted(&self) -> bool {
        self.inner.interrupt.is_cancelled()
    }

    /// Validate the speech for playout.
    ///
    /// # Errors
    ///
    /// Returns an error if the synthesis was interrupted or already played.
    pub fn play(&self) -> Result<PlayoutHandle> {
        if self.interrupted() {
            return Err(AgentError::Pipeline("synthesis was interrupted".into()));
        }
        let buf_rx = self
            .inner
            .buf_rx
            .lock()
            .ok()
            .and_then(|mut b| b.take())
            .ok_or_else(|| AgentError::Pipeline("synthesis already played".into()))?;
        let handle = self
            .inner
            .playout
            .play(&self.speech_id, buf_rx, self.inner.forwarder.clone());
        if let Ok(mut slot) = self.inner.play_handle.lock() {
            *slot = Some(handle.clone());
        }
        Ok(handle)
    }

    /// The playout handle, once validated.
    pub fn play_handle(&self) -> Option<PlayoutHandle> {
        self.inner.play_handle.lock().ok().and_then(|h| h.clone())
    }

    /// Interrupt the synthesis and any ongoing playout. Idempotent.
    pub fn interrupt(&self) {
        if self.interrupted() {
            return;
        }
        debug!(speech_id = %self.speech_id, "synthesis interrupted");
        if let Some(handle) = self.play_handle() {
            handle.interrupt();
        }
        self.inner.interrupt.cancel();
    }
}

/// Couples text sources with the TTS stream and the playout stage.
pub struct AgentOutput {
    playout: AgentPlayout,
    tts: Arc<dyn TextToSpeech>,
    conn_options: ApiConnectOptions,
}

impl AgentOutput {
    /// Create the synthesis stage.
    pub fn new(
        playout: AgentPlayout,
        tts: Arc<dyn TextToSpeech>,
        conn_options: ApiConnectOptions,
    ) -> Self {
        Self {
            playout,
            tts,
            conn_options,
        }
    }

    /// The playout stage.
    pub fn playout(&self) -> &AgentPlayout {
        &self.playout
    }

    /// Start synthesizing an utterance.
    ///
    /// `tts_source` feeds the TTS engine (possibly rewritten by a pre-TTS
    /// hook); `transcript_source` feeds the transcription forwarder
    /// unmodified. TTS metrics are forwarded to `metrics_tx` tagged with
    /// the speech id.
    pub fn synthesize(
        &self,
        speech_id: &str,
        tts_source: SpeechSource,
        transcript_source: SpeechSource,
        transcription: &TranscriptionOptions,
        metrics_tx: Option<mpsc::UnboundedSender<MetricsRecord>>,
    ) -> SynthesisHandle {
        let forwarder = TranscriptionForwarder::new(
            Arc::clone(&transcription.word_tokenizer),
            transcription.hyphenate_word,
            transcription.agent_transcription_speed,
        );
        let (buf_tx, buf_rx) = mpsc::unbounded_channel();
        let interrupt = CancellationToken::new();

        let handle = SynthesisHandle {
            speech_id: speech_id.to_string(),
            inner: Arc::new(SynthesisShared {
                buf_rx: Mutex::new(Some(buf_rx)),
                forwarder: forwarder.clone(),
                playout: self.playout.clone(),
                interrupt: interrupt.clone(),
                play_handle: Mutex::new(None),
            }),
        };

        let mut tts_stream = self.tts.stream(self.conn_options);
        if let Some(metrics_tx) = metrics_tx {
            if let Some(metrics_rx) = tts_stream.take_metrics() {
                let sequence_id = speech_id.to_string();
                tokio::spawn(async move {
                    if let Ok(metrics) = metrics_rx.await {
                        let _ = metrics_tx
                            .send(MetricsRecord::Tts(metrics).with_sequence_id(&sequence_id));
                    }
                });
            }
        }
        let input = tts_stream.take_input();

        let speech_id = speech_id.to_string();
        tokio::spawn(async move {
            let Some(mut input) = input else {
                error!(speech_id = %speech_id, "tts stream input unavailable");
                return;
            };

            let outcome = {
                let forwarder = &forwarder;
                let buf_tx = &buf_tx;
                let tts_stream = &mut tts_stream;
                let input = &mut input;
                let work = async move {
                    let tts_source = tts_source.resolve().await;
                    let transcript_source = transcript_source.resolve().await;

                    let push_text = async move {
                        match tts_source {
                            ResolvedSource::Text(text) => input.push_text(&text),
                            ResolvedSource::Stream(mut stream) => {
                                while let Some(segment) = stream.next().await {
                                    input.push_text(&segment);
                                }
                            }
                        }
                        input.end_input();
                        Ok::<(), AgentError>(())
                    };

                    let read_audio = async move {
                        while let Some(item) = tts_stream.next().await {
                            let audio = item?;
                            if !forwarder.closed() {
                                forwarder.push_audio(&audio.frame);
                            }
                            if buf_tx.send(audio.frame).is_err() {
                                break;
                            }
                        }
                        forwarder.mark_audio_segment_end();
                        Ok::<(), AgentError>(())
                    };

                    let read_transcript = async move {
                        match transcript_source {
                            ResolvedSource::Text(text) => forwarder.push_text(&text),
                            ResolvedSource::Stream(mut stream) => {
                                while let Some(segment) = stream.next().await {
                                    if forwarder.closed() {
                                        break;
                                    }
                                    forwarder.push_text(&segment);
                                }
                            }
                        }
                        forwarder.mark_text_segment_end();
                        Ok::<(), AgentError>(())
                    };

                    let (push, audio, transcript) =
                        tokio::join!(push_text, read_audio, read_transcript);
                    push.and(audio).and(transcript)
                };

                tokio::select! {
                    () = interrupt.cancelled() => None,
                    res = work => Some(res),
                }
            };

            // cancels the provider session when the work was cut short
            tts_stream.aclose().await;
            drop(buf_tx);

            match outcome {
                Some(Err(e)) => error!(speech_id = %speech_id, "synthesis failed: {e}"),
                Some(Ok(())) => debug!(speech_id = %speech_id, "synthesis complete"),
                None => debug!(speech_id = %speech_id, "synthesis cancelled"),
            }
        });

        handle
    }
}
