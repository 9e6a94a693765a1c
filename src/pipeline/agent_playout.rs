//! Serialized playout of synthesized audio into the published track.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::audio::AudioFrame;
use crate::room::AudioSink;
use crate::transcription::TranscriptionForwarder;

/// Capacity of the playout event fan-out.
const PLAYOUT_EVENT_CAPACITY: usize = 16;
/// Exponential smoothing factor applied to the ducking volume per frame.
const VOLUME_SMOOTHING: f32 = 0.15;

/// Lifecycle events of the playout stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayoutEvent {
    /// The first frame of an utterance became audible.
    Started,
    /// Playout of an utterance ended.
    Stopped {
        /// Whether it was cut short by an interruption.
        interrupted: bool,
    },
}

/// Consumes audio frame channels one utterance at a time and writes them to
/// the room's audio sink, applying volume ducking.
#[derive(Clone)]
pub struct AgentPlayout {
    inner: Arc<PlayoutShared>,
    queue_tx: mpsc::UnboundedSender<PlayJob>,
}

struct PlayoutShared {
    target_volume: AtomicU32,
    smoothed_volume: AtomicU32,
    events_tx: broadcast::Sender<PlayoutEvent>,
}

struct PlayJob {
    frames: mpsc::UnboundedReceiver<AudioFrame>,
    forwarder: TranscriptionForwarder,
    handle: PlayoutHandle,
}

impl AgentPlayout {
    /// Create a playout stage over the published track's sink.
    pub fn new(sink: Arc<dyn AudioSink>) -> Self {
        let (events_tx, _) = broadcast::channel(PLAYOUT_EVENT_CAPACITY);
        let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<PlayJob>();
        let inner = Arc::new(PlayoutShared {
            target_volume: AtomicU32::new(1.0f32.to_bits()),
            smoothed_volume: AtomicU32::new(1.0f32.to_bits()),
            events_tx,
        });

        let shared = Arc::clone(&inner);
        tokio::spawn(async move {
            while let Some(job) = queue_rx.recv().await {
                run_playout(&shared, &sink, job).await;
            }
        });

        Self { inner, queue_tx }
    }

    /// Schedule one utterance for playout. Utterances play strictly in the
    /// order scheduled.
    pub fn play(
        &self,
        speech_id: &str,
        frames: mpsc::UnboundedReceiver<AudioFrame>,
        forwarder: TranscriptionForwarder,
    ) -> PlayoutHandle {
        let handle = PlayoutHandle::new(speech_id);
        let job = PlayJob {
            frames,
            forwarder,
            handle: handle.clone(),
        };
        if self.queue_tx.send(job).is_err() {
            error!("playout stage is gone, dropping speech {speech_id}");
            handle.mark_done(true);
        }
        handle
    }

    /// Ducking target in `[0, 1]`, applied gradually.
    pub fn target_volume(&self) -> f32 {
        f32::from_bits(self.inner.target_volume.load(Ordering::Relaxed))
    }

    /// Set the ducking target.
    pub fn set_target_volume(&self, volume: f32) {
        self.inner
            .target_volume
            .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    /// Current smoothed volume.
    pub fn smoothed_volume(&self) -> f32 {
        f32::from_bits(self.inner.smoothed_volume.load(Ordering::Relaxed))
    }

    /// Subscribe to playout lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<PlayoutEvent> {
        self.inner.events_tx.subscribe()
    }
}

async fn run_playout(shared: &PlayoutShared, sink: &Arc<dyn AudioSink>, mut job: PlayJob) {
    let handle = job.handle;
    let mut started = false;
    let mut interrupted = false;

    loop {
        tokio::select! {
            () = handle.inner.interrupt.cancelled() => {
                interrupted = true;
                break;
            }
            frame = job.frames.recv() => {
                let Some(frame) = frame else { break };
                if !started {
                    started = true;
                    job.forwarder.segment_playout_started();
                    let _ = shared.events_tx.send(PlayoutEvent::Started);
                }

                let target = f32::from_bits(shared.target_volume.load(Ordering::Relaxed));
                let smoothed = f32::from_bits(shared.smoothed_volume.load(Ordering::Relaxed));
                let volume = smoothed + (target - smoothed) * VOLUME_SMOOTHING;
                shared.smoothed_volume.store(volume.to_bits(), Ordering::Relaxed);

                if let Err(e) = sink.capture_frame(&frame.scaled(volume)).await {
                    error!("playout sink failed: {e}");
                    interrupted = true;
                    break;
                }
                handle.add_time_played(frame.duration());
            }
        }
    }

    if interrupted {
        sink.clear_buffer();
        debug!(speech_id = %handle.speech_id(), "playout interrupted");
    } else if started {
        job.forwarder.segment_playout_finished();
    }

    handle.mark_done(interrupted);
    if started {
        let _ = shared.events_tx.send(PlayoutEvent::Stopped { interrupted });
    }
}

/// Handle to one scheduled utterance's playout.
#[derive(Clone)]
pub struct PlayoutHandle {
    inner: Arc<PlayoutHandleInner>,
}

struct PlayoutHandleInner {
    speech_id: String,
    time_played: Mutex<Duration>,
    interrupt: CancellationToken,
    interrupted: AtomicBool,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl PlayoutHandle {
    fn new(speech_id: &str) -> Self {
        let (done_tx, done_rx) = watch::channel(false);
        Self {
            inner: Arc::new(PlayoutHandleInner {
                speech_id: speech_id.to_string(),
                time_played: Mutex::new(Duration::ZERO),
                interrupt: CancellationToken::new(),
                interrupted: AtomicBool::new(false),
                done_tx,
                done_rx,
            }),
        }
    }

    /// Id of the speech being played.
    pub fn speech_id(&self) -> &str {
        &self.inner.speech_id
    }

    /// Audible time played so far.
    pub fn time_played(&self) -> Duration {
        self.inner
            .time_played
            .lock()
            .map(|t| *t)
            .unwrap_or(Duration::ZERO)
    }

    /// Stop playout; at most one in-flight frame may still be written.
    pub fn interrupt(&self) {
        self.inner.interrupt.cancel();
    }

    /// Whether playout ended due to an interruption.
    pub fn interrupted(&self) -> bool {
        self.inner.interrupted.load(Ordering::Relaxed)
    }

    /// Whether playout has ended.
    pub fn done(&self) -> bool {
        *self.inner.done_rx.borrow()
    }

    /// Wait for playout to end.
    pub async fn join(&self) {
        let mut rx = self.inner.done_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    fn add_time_played(&self, duration: Duration) {
        if let Ok(mut time) = self.inner.time_played.lock() {
            *time += duration;
        }
    }

    fn mark_done(&self, interrupted: bool) {
        self.inner.interrupted.store(interrupted, Ordering::Relaxed);
        let _ = self.inner.done_tx.send(true);
    }
}
