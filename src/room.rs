//! Transport boundary: participants, audio tracks, and publication.
//!
//! The pipeline is transport-agnostic; a vendor WebRTC room implements
//! [`Room`] at this boundary. [`LocalRoom`] is an in-process loopback
//! implementation for tests and embedders without a network transport.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, watch};

use crate::audio::AudioFrame;
use crate::error::{AgentError, Result};

/// Capacity of the participant event fan-out.
const PARTICIPANT_EVENT_CAPACITY: usize = 16;

/// Membership change in a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParticipantEvent {
    /// A remote participant joined.
    Connected(String),
    /// A remote participant left.
    Disconnected(String),
}

/// Destination for the agent's synthesized audio.
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Write one frame. May apply backpressure.
    async fn capture_frame(&self, frame: &AudioFrame) -> Result<()>;

    /// Drop any locally queued audio (used on interruption).
    fn clear_buffer(&self);
}

/// A published output track: the sink plus its subscription gate.
pub struct PublishedTrack {
    sink: Arc<dyn AudioSink>,
    subscribed: watch::Receiver<bool>,
}

impl PublishedTrack {
    /// Bundle a sink with a subscription signal.
    pub fn new(sink: Arc<dyn AudioSink>, subscribed: watch::Receiver<bool>) -> Self {
        Self { sink, subscribed }
    }

    /// The audio sink.
    pub fn sink(&self) -> Arc<dyn AudioSink> {
        Arc::clone(&self.sink)
    }

    /// Resolve once a remote side subscribed to the track.
    pub async fn wait_for_subscription(&self) {
        let mut rx = self.subscribed.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

/// A media room holding one human participant and the agent.
#[async_trait]
pub trait Room: Send + Sync {
    /// Identities of currently connected remote participants.
    fn remote_participants(&self) -> Vec<String>;

    /// Subscribe to a participant's microphone audio.
    ///
    /// # Errors
    ///
    /// Returns an error if the identity is unknown.
    fn subscribe_audio(&self, identity: &str) -> Result<mpsc::UnboundedReceiver<AudioFrame>>;

    /// Publish the agent's output audio track.
    async fn publish_audio_track(
        &self,
        sample_rate: u32,
        num_channels: u32,
    ) -> Result<PublishedTrack>;

    /// Membership change notifications.
    fn participant_events(&self) -> broadcast::Receiver<ParticipantEvent>;
}

/// In-process loopback room.
pub struct LocalRoom {
    state: Mutex<LocalRoomState>,
    events_tx: broadcast::Sender<ParticipantEvent>,
}

#[derive(Default)]
struct LocalRoomState {
    participants: HashMap<String, Vec<mpsc::UnboundedSender<AudioFrame>>>,
    output_rx: Option<mpsc::UnboundedReceiver<AudioFrame>>,
}

impl LocalRoom {
    /// An empty room.
    pub fn new() -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(PARTICIPANT_EVENT_CAPACITY);
        Arc::new(Self {
            state: Mutex::new(LocalRoomState::default()),
            events_tx,
        })
    }

    /// Connect a participant and get a handle for feeding microphone audio.
    pub fn add_participant(self: &Arc<Self>, identity: &str) -> LocalParticipant {
        if let Ok(mut state) = self.state.lock() {
            state.participants.entry(identity.to_string()).or_default();
        }
        let _ = self
            .events_tx
            .send(ParticipantEvent::Connected(identity.to_string()));
        LocalParticipant {
            room: Arc::clone(self),
            identity: identity.to_string(),
        }
    }

    /// Frames the agent has played into the room. Available once after the
    /// agent published its track.
    pub fn take_output_frames(&self) -> Option<mpsc::UnboundedReceiver<AudioFrame>> {
        self.state.lock().ok()?.output_rx.take()
    }
}

#[async_trait]
impl Room for LocalRoom {
    fn remote_participants(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|s| s.participants.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn subscribe_audio(&self, identity: &str) -> Result<mpsc::UnboundedReceiver<AudioFrame>> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| AgentError::Pipeline("room state poisoned".into()))?;
        let subscribers = state
            .participants
            .get_mut(identity)
            .ok_or_else(|| AgentError::Pipeline(format!("unknown participant '{identity}'")))?;
        let (tx, rx) = mpsc::unbounded_channel();
        subscribers.push(tx);
        Ok(rx)
    }

    async fn publish_audio_track(
        &self,
        _sample_rate: u32,
        _num_channels: u32,
    ) -> Result<PublishedTrack> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut state) = self.state.lock() {
            state.output_rx = Some(rx);
        }
        // loopback tracks are subscribed immediately
        let (_sub_tx, sub_rx) = watch::channel(true);
        // keep the sender alive inside the sink so the watch never errors
        Ok(PublishedTrack::new(
            Arc::new(LocalSink {
                tx,
                _sub_tx,
            }),
            sub_rx,
        ))
    }

    fn participant_events(&self) -> broadcast::Receiver<ParticipantEvent> {
        self.events_tx.subscribe()
    }
}

/// Microphone-side handle for a [`LocalRoom`] participant.
pub struct LocalParticipant {
    room: Arc<LocalRoom>,
    identity: String,
}

impl LocalParticipant {
    /// The participant identity.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Push one microphone frame to every subscriber.
    pub fn push_audio(&self, frame: AudioFrame) {
        if let Ok(mut state) = self.room.state.lock() {
            if let Some(subscribers) = state.participants.get_mut(&self.identity) {
                subscribers.retain(|tx| tx.send(frame.clone()).is_ok());
            }
        }
    }

    /// Disconnect the participant.
    pub fn disconnect(self) {
        if let Ok(mut state) = self.room.state.lock() {
            state.participants.remove(&self.identity);
        }
        let _ = self
            .room
            .events_tx
            .send(ParticipantEvent::Disconnected(self.identity));
    }
}

struct LocalSink {
    tx: mpsc::UnboundedSender<AudioFrame>,
    _sub_tx: watch::Sender<bool>,
}

#[async_trait]
impl AudioSink for LocalSink {
    async fn capture_frame(&self, frame: &AudioFrame) -> Result<()> {
        self.tx
            .send(frame.clone())
            .map_err(|_| AgentError::Channel("room output closed".into()))?;
        // drain at playback rate, like a real output device
        tokio::time::sleep(frame.duration()).await;
        Ok(())
    }

    fn clear_buffer(&self) {}
}
