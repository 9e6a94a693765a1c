//! The voice pipeline orchestrator.
//!
//! Owns the chat context and the speech queue, arbitrates barge-in, commits
//! user and agent speech to the conversation, and drives nested tool-call
//! speech. One logical consumer plays queued utterances strictly FIFO;
//! everything else (VAD/STT events, validation timers, synthesis) feeds it
//! through channels.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use futures_util::StreamExt;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::agent_output::{tee_text_stream, AgentOutput, SpeechSource, TextStream};
use super::agent_playout::{AgentPlayout, PlayoutEvent};
use super::human_input::{HumanInput, HumanInputEvent};
use super::speech_handle::{LlmSourceInfo, SpeechHandle, SpeechSourceInfo};
use super::validation::{DeferredReplyValidation, TurnDetector};
use crate::config::{PipelineOptions, TranscriptionOptions};
use crate::error::{AgentError, Result};
use crate::llm::{
    CalledFunction, ChatContext, ChatMessage, ChatRequest, ChatRole, FunctionCallInfo,
    FunctionContext, LanguageModel, LlmStream,
};
use crate::metrics::{MetricsRecord, PipelineEouMetrics};
use crate::room::{PublishedTrack, Room};
use crate::stt::SpeechToText;
use crate::tokenize::basic::BasicSentenceTokenizer;
use crate::tts::{StreamAdapter, TextToSpeech};
use crate::types::{ApiConnectOptions, AgentState};
use crate::vad::VoiceActivityDetector;

/// Minimum audible time before a user question is committed, so a barely
/// started reply does not mark the question as answered.
const MIN_TIME_PLAYED_FOR_COMMIT: Duration = Duration::from_millis(100);
/// How often commit conditions are reconsidered while speech plays.
const PLAYING_SPEECH_POLL: Duration = Duration::from_millis(200);
/// Capacity of the agent event fan-out.
const AGENT_EVENT_CAPACITY: usize = 64;
/// Marker sent to the LLM when validation fired without a transcript.
const CONTINUE_MARKER: &str = "<continue>";

/// Events emitted by [`VoicePipelineAgent`].
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// VAD detected user speech onset.
    UserStartedSpeaking,
    /// VAD detected user speech offset.
    UserStoppedSpeaking,
    /// The agent's speech became audible.
    AgentStartedSpeaking,
    /// The agent's speech ended.
    AgentStoppedSpeaking,
    /// The user's turn was committed to the chat context.
    UserSpeechCommitted(ChatMessage),
    /// The agent's speech was committed to the chat context.
    AgentSpeechCommitted(ChatMessage),
    /// The agent's speech was interrupted; the spoken prefix was committed.
    AgentSpeechInterrupted(ChatMessage),
    /// The LLM requested tool calls.
    FunctionCallsCollected(Vec<FunctionCallInfo>),
    /// All requested tool calls finished executing.
    FunctionCallsFinished(Vec<CalledFunction>),
    /// A pipeline metrics record.
    MetricsCollected(MetricsRecord),
}

/// Context handed to tool implementations during a tool-call turn.
#[derive(Clone)]
pub struct AgentCallContext {
    speech_id: String,
    chat_ctx: ChatContext,
    extra_messages: Arc<Mutex<Vec<ChatMessage>>>,
}

impl AgentCallContext {
    fn new(speech_id: &str, chat_ctx: ChatContext) -> Self {
        Self {
            speech_id: speech_id.to_string(),
            chat_ctx,
            extra_messages: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// The speech this tool call belongs to.
    pub fn speech_id(&self) -> &str {
        &self.speech_id
    }

    /// The chat context of the originating completion.
    pub fn chat_ctx(&self) -> &ChatContext {
        &self.chat_ctx
    }

    /// Append a message after the tool outputs for the follow-up
    /// completion.
    pub fn add_extra_chat_message(&self, message: ChatMessage) {
        if let Ok(mut extra) = self.extra_messages.lock() {
            extra.push(message);
        }
    }

    /// Messages appended so far.
    pub fn extra_chat_messages(&self) -> Vec<ChatMessage> {
        self.extra_messages
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }
}

/// Outcome of a `before_llm` hook.
pub enum BeforeLlmResult {
    /// Run the default completion.
    Default,
    /// Skip this turn entirely.
    Cancel,
    /// Use the provided stream instead.
    Stream(LlmStream),
}

/// Hook invoked before each reply completion; may inject context (RAG) or
/// cancel the turn.
pub type BeforeLlmCallback = Arc<
    dyn Fn(
            Arc<dyn LanguageModel>,
            ChatContext,
            Option<Arc<FunctionContext>>,
        ) -> BoxFuture<'static, BeforeLlmResult>
        + Send
        + Sync,
>;

/// Hook rewriting the TTS text source (e.g. pronunciation fixes). The
/// transcript source is not affected.
pub type BeforeTtsCallback = Arc<dyn Fn(SpeechSource) -> SpeechSource + Send + Sync>;

/// Sources accepted by [`VoicePipelineAgent::say`].
pub enum AgentSpeechSource {
    /// A complete string.
    Text(String),
    /// A lazy text sequence.
    Stream(TextStream),
    /// An LLM completion stream.
    Llm(LlmStream),
}

impl From<&str> for AgentSpeechSource {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for AgentSpeechSource {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

struct SynthesizedSpeech {
    synthesis: super::agent_output::SynthesisHandle,
    source: SpeechSourceInfo,
}

struct PipelineIo {
    track: PublishedTrack,
    playout: AgentPlayout,
    agent_output: AgentOutput,
}

/// A VAD + STT + LLM + TTS voice agent.
#[derive(Clone)]
pub struct VoicePipelineAgent {
    inner: Arc<AgentInner>,
}

struct AgentInner {
    opts: PipelineOptions,
    transcription: TranscriptionOptions,
    conn_options: ApiConnectOptions,
    vad: Arc<dyn VoiceActivityDetector>,
    stt: Arc<dyn SpeechToText>,
    llm: Arc<dyn LanguageModel>,
    tts: Arc<dyn TextToSpeech>,
    before_llm_cb: Option<BeforeLlmCallback>,
    before_tts_cb: Option<BeforeTtsCallback>,

    chat_ctx: Mutex<ChatContext>,
    fnc_ctx: Mutex<Option<Arc<FunctionContext>>>,
    events_tx: broadcast::Sender<AgentEvent>,
    metrics_tx: mpsc::UnboundedSender<MetricsRecord>,
    metrics_rx: Mutex<Option<mpsc::UnboundedReceiver<MetricsRecord>>>,

    started: AtomicBool,
    closed: CancellationToken,
    state: Mutex<AgentState>,

    speech_q: Mutex<VecDeque<SpeechHandle>>,
    speech_q_changed: Notify,
    playing_speech: Mutex<Option<SpeechHandle>>,
    pending_agent_reply: Mutex<Option<SpeechHandle>>,
    agent_reply_task: Mutex<Option<JoinHandle<()>>>,

    transcribed_text: Mutex<String>,
    interim_text: Mutex<String>,
    last_final_transcript_time: Mutex<Option<Instant>>,
    last_speech_time: Mutex<Option<Instant>>,

    deferred_validation: DeferredReplyValidation,
    validate_rx: Mutex<Option<mpsc::UnboundedReceiver<()>>>,

    io: OnceLock<PipelineIo>,
    track_published_tx: watch::Sender<bool>,
    track_published_rx: watch::Receiver<bool>,
    human_input: Mutex<Option<HumanInput>>,
    active_call_ctx: Mutex<Option<AgentCallContext>>,
}

impl VoicePipelineAgent {
    /// Create an agent over the four providers with default options.
    ///
    /// A TTS without native streaming is wrapped in a [`StreamAdapter`]
    /// automatically.
    pub fn new(
        vad: Arc<dyn VoiceActivityDetector>,
        stt: Arc<dyn SpeechToText>,
        llm: Arc<dyn LanguageModel>,
        tts: Arc<dyn TextToSpeech>,
    ) -> Self {
        let tts = if tts.capabilities().streaming {
            tts
        } else {
            Arc::new(StreamAdapter::new(
                tts,
                Arc::new(BasicSentenceTokenizer::default()),
            ))
        };

        let (events_tx, _) = broadcast::channel(AGENT_EVENT_CAPACITY);
        let (metrics_tx, metrics_rx) = mpsc::unbounded_channel();
        let (validate_tx, validate_rx) = mpsc::unbounded_channel();
        let (track_published_tx, track_published_rx) = watch::channel(false);

        let opts = PipelineOptions::new();
        let deferred_validation = DeferredReplyValidation::new(
            opts.endpointing.min_delay(),
            opts.endpointing.max_delay(),
            None,
            validate_tx,
        );

        Self {
            inner: Arc::new(AgentInner {
                opts,
                transcription: TranscriptionOptions::default(),
                conn_options: ApiConnectOptions::default(),
                vad,
                stt,
                llm,
                tts,
                before_llm_cb: None,
                before_tts_cb: None,
                chat_ctx: Mutex::new(ChatContext::new()),
                fnc_ctx: Mutex::new(None),
                events_tx,
                metrics_tx,
                metrics_rx: Mutex::new(Some(metrics_rx)),
                started: AtomicBool::new(false),
                closed: CancellationToken::new(),
                state: Mutex::new(AgentState::Initializing),
                speech_q: Mutex::new(VecDeque::new()),
                speech_q_changed: Notify::new(),
                playing_speech: Mutex::new(None),
                pending_agent_reply: Mutex::new(None),
                agent_reply_task: Mutex::new(None),
                transcribed_text: Mutex::new(String::new()),
                interim_text: Mutex::new(String::new()),
                last_final_transcript_time: Mutex::new(None),
                last_speech_time: Mutex::new(None),
                deferred_validation,
                validate_rx: Mutex::new(Some(validate_rx)),
                io: OnceLock::new(),
                track_published_tx,
                track_published_rx,
                human_input: Mutex::new(None),
                active_call_ctx: Mutex::new(None),
            }),
        }
    }

    fn configure(mut self, f: impl FnOnce(&mut AgentInner)) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => f(inner),
            None => warn!("agent already shared, configuration change ignored"),
        }
        self
    }

    /// Set pipeline options. Must be called before [`start`](Self::start).
    pub fn with_options(self, opts: PipelineOptions) -> Self {
        self.configure(|inner| {
            inner.deferred_validation.set_delays(
                opts.endpointing.min_delay(),
                opts.endpointing.max_delay(),
            );
            inner.opts = opts;
        })
    }

    /// Set transcript policy.
    pub fn with_transcription(self, transcription: TranscriptionOptions) -> Self {
        self.configure(|inner| inner.transcription = transcription)
    }

    /// Seed the chat context.
    pub fn with_chat_ctx(self, chat_ctx: ChatContext) -> Self {
        self.configure(|inner| {
            if let Ok(mut ctx) = inner.chat_ctx.lock() {
                *ctx = chat_ctx;
            }
        })
    }

    /// Set the function (tool) registry.
    pub fn with_fnc_ctx(self, fnc_ctx: Arc<FunctionContext>) -> Self {
        self.configure(|inner| {
            if let Ok(mut slot) = inner.fnc_ctx.lock() {
                *slot = Some(fnc_ctx);
            }
        })
    }

    /// Attach a turn detector refining endpointing delays.
    pub fn with_turn_detector(self, turn_detector: Arc<dyn TurnDetector>) -> Self {
        self.configure(|inner| {
            inner
                .deferred_validation
                .set_turn_detector(Some(turn_detector));
        })
    }

    /// Set the pre-LLM hook.
    pub fn with_before_llm_cb(self, cb: BeforeLlmCallback) -> Self {
        self.configure(|inner| inner.before_llm_cb = Some(cb))
    }

    /// Set the pre-TTS hook.
    pub fn with_before_tts_cb(self, cb: BeforeTtsCallback) -> Self {
        self.configure(|inner| inner.before_tts_cb = Some(cb))
    }

    /// Set the provider connection/retry policy.
    pub fn with_conn_options(self, conn_options: ApiConnectOptions) -> Self {
        self.configure(|inner| inner.conn_options = conn_options)
    }

    /// Subscribe to agent events.
    pub fn events(&self) -> broadcast::Receiver<AgentEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Snapshot of the chat context.
    pub fn chat_ctx(&self) -> ChatContext {
        self.inner
            .chat_ctx
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    /// Replace the function (tool) registry for future turns.
    pub fn set_fnc_ctx(&self, fnc_ctx: Option<Arc<FunctionContext>>) {
        if let Ok(mut slot) = self.inner.fnc_ctx.lock() {
            *slot = fnc_ctx;
        }
    }

    /// Current coarse state.
    pub fn state(&self) -> AgentState {
        self.inner
            .state
            .lock()
            .map(|s| *s)
            .unwrap_or(AgentState::Initializing)
    }

    /// Attach to a room and start the pipeline.
    ///
    /// With no `participant`, the first remote participant is used; if the
    /// room is empty, the next participant to connect is linked.
    ///
    /// # Errors
    ///
    /// Returns an error if the agent was already started.
    pub fn start(&self, room: Arc<dyn Room>, participant: Option<&str>) -> Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(AgentError::Pipeline("agent already started".into()));
        }
        info!("starting voice pipeline agent");

        let identity = participant
            .map(str::to_string)
            .or_else(|| self.inner.remote_first(&room));
        match identity {
            Some(identity) => self.inner.link_participant(&room, &identity),
            None => {
                // link whoever connects first
                let inner = Arc::clone(&self.inner);
                let mut events = room.participant_events();
                let watch_room = Arc::clone(&room);
                tokio::spawn(async move {
                    while let Ok(event) = events.recv().await {
                        if let crate::room::ParticipantEvent::Connected(identity) = event {
                            if inner.human_input.lock().map(|h| h.is_none()).unwrap_or(false) {
                                inner.link_participant(&watch_room, &identity);
                            }
                            break;
                        }
                    }
                });
            }
        }

        // validation pump
        if let Some(mut validate_rx) = self.inner.validate_rx.lock().ok().and_then(|mut v| v.take())
        {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = inner.closed.cancelled() => break,
                        fired = validate_rx.recv() => {
                            if fired.is_none() {
                                break;
                            }
                            inner.validate_reply_if_possible();
                        }
                    }
                }
            });
        }

        // metrics pump
        if let Some(mut metrics_rx) = self.inner.metrics_rx.lock().ok().and_then(|mut m| m.take())
        {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                while let Some(record) = metrics_rx.recv().await {
                    inner.emit(AgentEvent::MetricsCollected(record));
                }
            });
        }

        // main playout loop
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.main_task(room).await;
        });

        Ok(())
    }

    /// Speak a pre-formed utterance.
    ///
    /// Inside a tool call, the utterance nests into the currently playing
    /// speech and is appended to the call context so the follow-up
    /// completion sees it.
    pub async fn say(
        &self,
        source: impl Into<AgentSpeechSource>,
        allow_interruptions: bool,
        add_to_chat_ctx: bool,
    ) -> Result<SpeechHandle> {
        self.inner
            .say(source.into(), allow_interruptions, add_to_chat_ctx)
            .await
    }

    /// Interrupt the current speech; with `interrupt_all`, also cancel the
    /// pending reply and everything queued.
    pub fn interrupt(&self, interrupt_all: bool) {
        self.inner.interrupt(interrupt_all);
    }

    /// Stop the agent.
    pub async fn aclose(&self) {
        self.inner.closed.cancel();
        self.inner.deferred_validation.aclose();
        if let Ok(input) = self.inner.human_input.lock() {
            if let Some(input) = input.as_ref() {
                input.close();
            }
        }
    }
}

impl AgentInner {
    fn emit(&self, event: AgentEvent) {
        let _ = self.events_tx.send(event);
    }

    fn set_state(&self, state: AgentState) {
        if let Ok(mut slot) = self.state.lock() {
            if *slot != state {
                let previous = *slot;
                debug!("agent state: {previous} -> {state}");
                *slot = state;
            }
        }
    }

    fn remote_first(&self, room: &Arc<dyn Room>) -> Option<String> {
        room.remote_participants().into_iter().next()
    }

    fn playing(&self) -> Option<SpeechHandle> {
        self.playing_speech.lock().ok().and_then(|p| p.clone())
    }

    fn set_playing(&self, speech: Option<SpeechHandle>) {
        if let Ok(mut slot) = self.playing_speech.lock() {
            *slot = speech;
        }
    }

    fn io(&self) -> Option<&PipelineIo> {
        self.io.get()
    }

    fn chat_snapshot(&self) -> ChatContext {
        self.chat_ctx.lock().map(|c| c.copy()).unwrap_or_default()
    }

    /// Chat snapshot plus the in-flight user text, for turn detection.
    fn detect_ctx(&self) -> ChatContext {
        let mut ctx = self.chat_snapshot();
        let text = self
            .transcribed_text
            .lock()
            .map(|t| t.clone())
            .unwrap_or_default();
        ctx.append(ChatMessage::new(ChatRole::User, text));
        ctx
    }

    fn link_participant(self: &Arc<Self>, room: &Arc<dyn Room>, identity: &str) {
        let started = HumanInput::start(
            room,
            identity,
            Arc::clone(&self.vad),
            Arc::clone(&self.stt),
            self.conn_options,
            self.metrics_tx.clone(),
        );
        let (input, events_rx) = match started {
            Ok(pair) => pair,
            Err(e) => {
                error!(participant = %identity, "failed to link participant: {e}");
                return;
            }
        };
        info!(participant = %identity, "linked participant");
        if let Ok(mut slot) = self.human_input.lock() {
            *slot = Some(input);
        }

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.human_event_pump(events_rx).await;
        });
    }

    async fn human_event_pump(
        self: Arc<Self>,
        mut events_rx: mpsc::UnboundedReceiver<HumanInputEvent>,
    ) {
        loop {
            let event = tokio::select! {
                () = self.closed.cancelled() => break,
                event = events_rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            match event {
                HumanInputEvent::StartOfSpeech(_) => {
                    self.emit(AgentEvent::UserStartedSpeaking);
                    self.deferred_validation.on_human_start_of_speech();
                }
                HumanInputEvent::VadInferenceDone(ev) => {
                    if *self.track_published_rx.borrow() {
                        if let Some(io) = self.io() {
                            if self.opts.interruption.allow_interruptions {
                                io.playout.set_target_volume(1.0 - ev.probability);
                            }
                        }
                    }
                    if ev.speech_duration >= self.opts.interruption.speech_duration() {
                        self.interrupt_if_possible();
                    }
                    if ev.raw_accumulated_speech > Duration::ZERO {
                        if let Ok(mut slot) = self.last_speech_time.lock() {
                            *slot = Some(Instant::now() - ev.raw_accumulated_silence);
                        }
                    }
                }
                HumanInputEvent::EndOfSpeech(_) => {
                    self.emit(AgentEvent::UserStoppedSpeaking);
                    self.deferred_validation
                        .on_human_end_of_speech(self.detect_ctx());
                }
                HumanInputEvent::InterimTranscript(ev) => {
                    if let Some(text) = ev.text() {
                        if let Ok(mut slot) = self.interim_text.lock() {
                            *slot = text.to_string();
                        }
                    }
                }
                HumanInputEvent::FinalTranscript(ev) => {
                    self.on_final_transcript(&ev);
                }
            }
        }
    }

    fn on_final_transcript(self: &Arc<Self>, ev: &crate::stt::SpeechEvent) {
        let Some(text) = ev.text().filter(|t| !t.is_empty()) else {
            return;
        };
        debug!(user_transcript = %text, "received user transcript");

        if let Ok(mut slot) = self.last_final_transcript_time.lock() {
            *slot = Some(Instant::now());
        }
        {
            let Ok(mut transcribed) = self.transcribed_text.lock() else {
                return;
            };
            if !transcribed.is_empty() {
                transcribed.push(' ');
            }
            transcribed.push_str(text);
        }

        if self.opts.preemptive_synthesis {
            let playing = self.playing();
            if playing.is_none() || playing.is_some_and(|p| p.allow_interruptions()) {
                self.synthesize_agent_reply();
            }
        }

        self.deferred_validation
            .on_human_final_transcript(text, ev.language(), self.detect_ctx());

        // VAD can miss speech onsets; a sufficiently long transcript is
        // treated as an interruption attempt of its own
        let words = self.transcription.word_tokenizer.tokenize(text);
        if words.len() >= 3 {
            self.interrupt_if_possible();
        }
    }

    // ── reply synthesis ───────────────────────────────────────

    fn synthesize_agent_reply(self: &Arc<Self>) {
        if let Ok(mut pending) = self.pending_agent_reply.lock() {
            if let Some(old) = pending.take() {
                old.cancel(false);
            }
        }
        if self
            .human_input
            .lock()
            .ok()
            .and_then(|h| h.as_ref().map(HumanInput::speaking))
            != Some(true)
        {
            self.set_state(AgentState::Thinking);
        }

        let question = self
            .transcribed_text
            .lock()
            .map(|t| t.clone())
            .unwrap_or_default();
        let handle = SpeechHandle::create_assistant_reply(
            self.opts.interruption.allow_interruptions,
            true,
            &question,
        );
        if let Ok(mut pending) = self.pending_agent_reply.lock() {
            *pending = Some(handle.clone());
        }

        let inner = Arc::clone(self);
        let task = tokio::spawn(async move {
            inner.synthesize_answer_task(handle).await;
        });
        if let Ok(mut slot) = self.agent_reply_task.lock() {
            if let Some(old) = slot.replace(task) {
                old.abort();
            }
        }
    }

    async fn synthesize_answer_task(self: Arc<Self>, handle: SpeechHandle) {
        // preemptive synthesis can fire before the output track exists
        let mut published = self.track_published_rx.clone();
        while !*published.borrow() {
            if published.changed().await.is_err() {
                return;
            }
        }

        let mut copied_ctx = self.chat_snapshot();

        // fold an uncommitted in-flight speech into the context so the new
        // reply knows what is already being said
        if let Some(playing) = self.playing() {
            if playing.initialized()
                && (playing.user_question().is_empty() || playing.user_committed())
                && !playing.speech_committed()
            {
                if !playing.extra_tools_messages().is_empty() {
                    if let Some(fnc_id) = playing.fnc_text_message_id() {
                        if copied_ctx.last().map(|m| m.id.as_str()) == Some(fnc_id) {
                            copied_ctx.messages.pop();
                        }
                    }
                    copied_ctx
                        .messages
                        .extend(playing.extra_tools_messages().to_vec());
                }
                if let Some(synthesis) = playing.synthesis_handle() {
                    copied_ctx.append(ChatMessage::new(
                        ChatRole::Assistant,
                        synthesis.tts_forwarder().played_text(),
                    ));
                }
            }
        }

        // an empty question means a false-positive interruption; some LLMs
        // reject empty content, so send an explicit continue marker
        let mut user_input = handle.user_question().to_string();
        if user_input.trim().is_empty() {
            user_input = CONTINUE_MARKER.to_string();
        }
        copied_ctx.append(ChatMessage::new(ChatRole::User, &user_input));

        let fnc_ctx = self.fnc_ctx.lock().ok().and_then(|f| f.clone());
        let llm_stream = match &self.before_llm_cb {
            Some(cb) => {
                match cb(Arc::clone(&self.llm), copied_ctx.copy(), fnc_ctx.clone()).await {
                    BeforeLlmResult::Cancel => {
                        debug!(speech_id = %handle.id(), "reply cancelled by before_llm hook");
                        // drop the question so it isn't committed by a later turn
                        let question = handle.user_question();
                        if let Ok(mut transcribed) = self.transcribed_text.lock() {
                            if transcribed.len() >= question.len() {
                                *transcribed = transcribed[question.len()..].trim_start().to_string();
                            }
                        }
                        handle.cancel(false);
                        return;
                    }
                    BeforeLlmResult::Stream(stream) => stream,
                    BeforeLlmResult::Default => self.default_chat(copied_ctx, fnc_ctx),
                }
            }
            None => self.default_chat(copied_ctx, fnc_ctx),
        };

        if handle.interrupted() {
            return;
        }

        let synthesized = self.synthesize_agent_speech(handle.id(), AgentSpeechSource::Llm(llm_stream));
        handle.initialize(synthesized.source, synthesized.synthesis);
    }

    fn default_chat(
        &self,
        chat_ctx: ChatContext,
        fnc_ctx: Option<Arc<FunctionContext>>,
    ) -> LlmStream {
        self.llm.chat(ChatRequest {
            chat_ctx,
            fnc_ctx,
            conn_options: self.conn_options,
            ..ChatRequest::default()
        })
    }

    fn synthesize_agent_speech(
        self: &Arc<Self>,
        speech_id: &str,
        source: AgentSpeechSource,
    ) -> SynthesizedSpeech {
        let (speech_source, source_info) = match source {
            AgentSpeechSource::Text(text) => {
                (SpeechSource::Text(text.clone()), SpeechSourceInfo::Text(text))
            }
            AgentSpeechSource::Stream(stream) => {
                (SpeechSource::Stream(stream), SpeechSourceInfo::Stream)
            }
            AgentSpeechSource::Llm(mut stream) => {
                if let Some(metrics_rx) = stream.take_metrics() {
                    let metrics_tx = self.metrics_tx.clone();
                    let sequence_id = speech_id.to_string();
                    tokio::spawn(async move {
                        if let Ok(metrics) = metrics_rx.await {
                            let _ = metrics_tx
                                .send(MetricsRecord::Llm(metrics).with_sequence_id(&sequence_id));
                        }
                    });
                }
                let info = LlmSourceInfo {
                    chat_ctx: stream.chat_ctx().copy(),
                    fnc_ctx: stream.fnc_ctx().cloned(),
                    function_calls: stream.function_calls_handle(),
                };
                (
                    SpeechSource::Stream(llm_stream_to_text(stream)),
                    SpeechSourceInfo::Llm(info),
                )
            }
        };

        let (tts_source, transcript_source) = match speech_source {
            SpeechSource::Text(text) => {
                (SpeechSource::Text(text.clone()), SpeechSource::Text(text))
            }
            SpeechSource::Stream(stream) => {
                let (a, b) = tee_text_stream(stream);
                (SpeechSource::Stream(a), SpeechSource::Stream(b))
            }
            SpeechSource::Pending(fut) => {
                // resolved by the synthesis task; transcript mirrors it
                let (a, b) = tee_text_stream(Box::pin(futures_util::stream::once(fut)));
                (SpeechSource::Stream(a), SpeechSource::Stream(b))
            }
        };
        let tts_source = match &self.before_tts_cb {
            Some(cb) => cb(tts_source),
            None => tts_source,
        };

        let Some(io) = self.io() else {
            // start() publishes the track before any synthesis can happen
            unreachable!("synthesize called before the output track exists");
        };
        let synthesis = io.agent_output.synthesize(
            speech_id,
            tts_source,
            transcript_source,
            &self.transcription,
            Some(self.metrics_tx.clone()),
        );
        SynthesizedSpeech {
            synthesis,
            source: source_info,
        }
    }

    // ── validation & barge-in ─────────────────────────────────

    fn validate_reply_if_possible(self: &Arc<Self>) {
        let transcribed = self
            .transcribed_text
            .lock()
            .map(|t| t.clone())
            .unwrap_or_default();
        if transcribed.trim().is_empty() {
            debug!("validation fired without transcript, skipping reply");
            return;
        }

        if let Some(playing) = self.playing() {
            if !playing.interrupted() {
                let ignore = if !playing.allow_interruptions() {
                    debug!(speech_id = %playing.id(), "agent speaking and uninterruptible, ignoring input");
                    true
                } else if !self.should_interrupt() {
                    debug!(speech_id = %playing.id(), "interrupt threshold not met, ignoring input");
                    true
                } else {
                    false
                };
                if ignore {
                    if let Ok(mut t) = self.transcribed_text.lock() {
                        t.clear();
                    }
                    return;
                }
            }
        }

        let pending_is_none = self
            .pending_agent_reply
            .lock()
            .map(|p| p.is_none())
            .unwrap_or(true);
        if pending_is_none {
            if self.opts.preemptive_synthesis {
                return;
            }
            self.synthesize_agent_reply();
        }

        let Some(pending) = self
            .pending_agent_reply
            .lock()
            .ok()
            .and_then(|mut p| p.take())
        else {
            return;
        };

        // timing races can leave several replies queued; keep only the one
        // being validated now
        let queued: Vec<SpeechHandle> = self
            .speech_q
            .lock()
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default();
        for speech in queued {
            if speech.is_reply() && speech.allow_interruptions() {
                speech.interrupt();
            }
        }

        debug!(speech_id = %pending.id(), text = %transcribed, "validated agent reply");

        if let Some(last_speech) = self.last_speech_time.lock().ok().and_then(|t| *t) {
            let transcription_delay = self
                .last_final_transcript_time
                .lock()
                .ok()
                .and_then(|t| *t)
                .map(|t| t.duration_since(last_speech))
                .unwrap_or(Duration::ZERO);
            let _ = self.metrics_tx.send(MetricsRecord::Eou(PipelineEouMetrics {
                timestamp: chrono::Utc::now(),
                sequence_id: pending.id().to_string(),
                end_of_utterance_delay: last_speech.elapsed(),
                transcription_delay,
            }));
        }

        self.add_speech_for_playout(pending);
        if let Ok(mut interim) = self.interim_text.lock() {
            interim.clear();
        }
        // transcribed_text is trimmed once the user question commits
    }

    fn interrupt_if_possible(self: &Arc<Self>) {
        if self.should_interrupt() {
            self.interrupt(true);
        }
    }

    fn should_interrupt(&self) -> bool {
        let Some(playing) = self.playing() else {
            return false;
        };
        if !playing.allow_interruptions() || playing.interrupted() {
            return false;
        }

        // if nothing has been spoken yet, the reply is not audible; cut it
        // without any word-count requirement
        let Some(synthesis) = playing.synthesis_handle() else {
            return true;
        };
        if synthesis.tts_forwarder().played_text().trim().is_empty() {
            return true;
        }

        let min_words = self.opts.interruption.min_words;
        if min_words > 0 {
            let transcribed = self
                .transcribed_text
                .lock()
                .map(|t| t.clone())
                .unwrap_or_default();
            let interim = self
                .interim_text
                .lock()
                .map(|t| t.clone())
                .unwrap_or_default();
            let text = if interim.len() > transcribed.len() {
                interim
            } else {
                transcribed
            };
            let words = self.transcription.word_tokenizer.tokenize(&text);
            if words.len() < min_words {
                return false;
            }
        }
        true
    }

    fn interrupt(&self, interrupt_all: bool) {
        if interrupt_all {
            if let Ok(pending) = self.pending_agent_reply.lock() {
                if let Some(pending) = pending.as_ref() {
                    pending.cancel(true);
                }
            }
            let queued: Vec<SpeechHandle> = self
                .speech_q
                .lock()
                .map(|q| q.iter().cloned().collect())
                .unwrap_or_default();
            for speech in queued {
                speech.cancel(true);
            }
        }
        if let Some(playing) = self.playing() {
            playing.cancel(true);
        }
    }

    fn add_speech_for_playout(&self, speech: SpeechHandle) {
        if let Ok(mut queue) = self.speech_q.lock() {
            queue.push_back(speech);
        }
        self.speech_q_changed.notify_one();
    }

    // ── say ───────────────────────────────────────────────────

    async fn say(
        self: &Arc<Self>,
        source: AgentSpeechSource,
        allow_interruptions: bool,
        add_to_chat_ctx: bool,
    ) -> Result<SpeechHandle> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(AgentError::Pipeline("agent not started".into()));
        }
        // publish-ready gate
        let mut published = self.track_published_rx.clone();
        while !*published.borrow() {
            if published.changed().await.is_err() {
                return Err(AgentError::Pipeline("agent output closed".into()));
            }
        }

        let call_ctx = self
            .active_call_ctx
            .lock()
            .ok()
            .and_then(|c| c.clone())
            .filter(|_| add_to_chat_ctx);

        let (source, fnc_source) = match (source, call_ctx.is_some()) {
            (AgentSpeechSource::Llm(stream), true) => {
                warn!("LLM stream source is not added to a tool-call chat context");
                (AgentSpeechSource::Llm(stream), None)
            }
            (AgentSpeechSource::Text(text), true) => {
                (AgentSpeechSource::Text(text.clone()), Some(SpeechSource::Text(text)))
            }
            (AgentSpeechSource::Stream(stream), true) => {
                let (a, b) = tee_text_stream(stream);
                (AgentSpeechSource::Stream(a), Some(SpeechSource::Stream(b)))
            }
            (source, false) => (source, None),
        };

        let handle = SpeechHandle::create_assistant_speech(allow_interruptions, add_to_chat_ctx);
        let synthesized = self.synthesize_agent_speech(handle.id(), source);
        handle.initialize(synthesized.source, synthesized.synthesis);

        let playing = self.playing();
        if let Some(playing) = playing.filter(|p| !p.nested_speech_done()) {
            playing.add_nested_speech(handle.clone());
        } else if let Some(head) = self.speech_q.lock().ok().and_then(|q| q.front().cloned()) {
            head.add_nested_speech(handle.clone());
        } else {
            self.add_speech_for_playout(handle.clone());
        }

        if let (Some(call_ctx), Some(fnc_source)) = (call_ctx, fnc_source) {
            let text = match fnc_source {
                SpeechSource::Text(text) => text,
                SpeechSource::Stream(mut stream) => {
                    let mut text = String::new();
                    while let Some(segment) = stream.next().await {
                        text.push_str(&segment);
                    }
                    text
                }
                SpeechSource::Pending(fut) => fut.await,
            };
            debug!(text = %text, "added speech to tool-call chat context");
            call_ctx.add_extra_chat_message(ChatMessage::new(ChatRole::Assistant, text));
        }

        Ok(handle)
    }

    // ── playout loop ──────────────────────────────────────────

    async fn main_task(self: Arc<Self>, room: Arc<dyn Room>) {
        let track = match room
            .publish_audio_track(self.tts.sample_rate(), self.tts.num_channels())
            .await
        {
            Ok(track) => track,
            Err(e) => {
                error!("failed to publish output track: {e}");
                return;
            }
        };
        let playout = AgentPlayout::new(track.sink());
        let agent_output = AgentOutput::new(playout.clone(), Arc::clone(&self.tts), self.conn_options);

        let mut playout_events = playout.subscribe();
        let events_inner = Arc::clone(&self);
        tokio::spawn(async move {
            while let Ok(event) = playout_events.recv().await {
                match event {
                    PlayoutEvent::Started => {
                        events_inner.emit(AgentEvent::AgentStartedSpeaking);
                        events_inner.set_state(AgentState::Speaking);
                    }
                    PlayoutEvent::Stopped { .. } => {
                        events_inner.emit(AgentEvent::AgentStoppedSpeaking);
                        events_inner.set_state(AgentState::Listening);
                    }
                }
            }
        });

        let _ = self.io.set(PipelineIo {
            track,
            playout,
            agent_output,
        });
        let _ = self.track_published_tx.send(true);
        self.set_state(AgentState::Listening);

        loop {
            tokio::select! {
                () = self.closed.cancelled() => break,
                () = self.speech_q_changed.notified() => {}
            }
            loop {
                let speech = self.speech_q.lock().ok().and_then(|mut q| q.pop_front());
                let Some(speech) = speech else { break };
                self.set_playing(Some(speech.clone()));
                self.play_speech(&speech).await;
                self.set_playing(None);
            }
        }
    }

    fn play_speech<'a>(self: &'a Arc<Self>, handle: &'a SpeechHandle) -> BoxFuture<'a, ()> {
        async move {
            if let Some(io) = self.io() {
                io.track.wait_for_subscription().await;
            }

            let fnc_done = CancellationToken::new();
            let playing_lock = Arc::new(tokio::sync::Mutex::new(()));
            let (nested_played_tx, nested_played_rx) = watch::channel(true);

            // nested driver: plays tool speech attached to this handle, FIFO,
            // never overlapping the outer playout thanks to the lock
            let driver = {
                let agent = Arc::clone(self);
                let handle = handle.clone();
                let playing_lock = Arc::clone(&playing_lock);
                let fnc_done = fnc_done.clone();
                tokio::spawn(async move {
                    while !handle.nested_speech_done() {
                        tokio::select! {
                            () = handle.nested_changed() => {}
                            () = fnc_done.cancelled() => {}
                        }
                        while let Some(nested) = handle.peek_nested() {
                            let _ = nested_played_tx.send(false);
                            if handle.nested_speech_done() {
                                // tool speech added after the window closed
                                nested.cancel(true);
                                handle.pop_nested();
                                continue;
                            }
                            let _guard = playing_lock.lock().await;
                            agent.set_playing(Some(nested.clone()));
                            agent.play_speech(&nested).await;
                            handle.pop_nested();
                            agent.set_playing(Some(handle.clone()));
                        }
                        let _ = nested_played_tx.send(true);
                        if fnc_done.is_cancelled() {
                            handle.mark_nested_speech_done();
                        }
                    }
                })
            };

            let stop_nested = |driver: JoinHandle<()>| {
                let fnc_done = fnc_done.clone();
                async move {
                    fnc_done.cancel();
                    let _ = driver.await;
                }
            };

            if handle.wait_for_initialization().await.is_err() {
                stop_nested(driver).await;
                handle.set_done();
                return;
            }

            // pre-added nested speech plays before the main synthesis
            while handle.has_nested() {
                let mut rx = nested_played_rx.clone();
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    // escape hatch for the drain-before-subscribe race
                    () = tokio::time::sleep(Duration::from_millis(50)) => {}
                }
            }

            let guard = playing_lock.lock().await;
            let Some(synthesis) = handle.synthesis_handle() else {
                drop(guard);
                stop_nested(driver).await;
                handle.set_done();
                return;
            };
            if synthesis.interrupted() {
                drop(guard);
                stop_nested(driver).await;
                handle.set_done();
                return;
            }

            let user_question = handle.user_question().to_string();
            let play_handle = match synthesis.play() {
                Ok(play_handle) => play_handle,
                Err(e) => {
                    debug!(speech_id = %handle.id(), "playout not started: {e}");
                    drop(guard);
                    stop_nested(driver).await;
                    handle.set_done();
                    return;
                }
            };

            let commit_user_question = || {
                if user_question.is_empty() || synthesis.interrupted() || handle.user_committed() {
                    return;
                }
                let is_using_tools = handle
                    .llm_source()
                    .is_some_and(|s| !s.collected_calls().is_empty());
                // require some audible speech before marking the question
                // answered; fast interruptions must not commit it
                if handle.allow_interruptions() && !is_using_tools {
                    let spoken = synthesis.tts_forwarder().played_text();
                    if spoken.trim().is_empty()
                        || (play_handle.time_played() < MIN_TIME_PLAYED_FOR_COMMIT
                            && !play_handle.done())
                    {
                        return;
                    }
                }

                let user_msg = ChatMessage::new(ChatRole::User, &user_question);
                if let Ok(mut chat) = self.chat_ctx.lock() {
                    chat.append(user_msg.clone());
                }
                self.emit(AgentEvent::UserSpeechCommitted(user_msg));
                if let Ok(mut transcribed) = self.transcribed_text.lock() {
                    if transcribed.len() >= user_question.len() {
                        *transcribed =
                            transcribed[user_question.len()..].trim_start().to_string();
                    } else {
                        transcribed.clear();
                    }
                }
                handle.mark_user_committed();
            };

            commit_user_question();
            while !play_handle.done() {
                tokio::select! {
                    () = play_handle.join() => {}
                    () = tokio::time::sleep(PLAYING_SPEECH_POLL) => {}
                }
                commit_user_question();
                if handle.interrupted() {
                    break;
                }
            }
            commit_user_question();

            let collected_text = synthesis.tts_forwarder().played_text();
            let interrupted = handle.interrupted();
            let is_using_tools = handle
                .llm_source()
                .is_some_and(|s| !s.collected_calls().is_empty());

            let mut message_id_committed: Option<String> = None;
            if handle.add_to_chat_ctx()
                && (user_question.is_empty() || handle.user_committed())
            {
                if let Ok(mut chat) = self.chat_ctx.lock() {
                    if !handle.extra_tools_messages().is_empty() {
                        let mut extra = handle.extra_tools_messages().to_vec();
                        if let Some(fnc_id) = handle.fnc_text_message_id() {
                            if chat.last().map(|m| m.id.as_str()) == Some(fnc_id) {
                                // the spoken text message is superseded by the
                                // tool-call carrier
                                chat.messages.pop();
                            } else if !extra[0].tool_calls.is_empty() {
                                extra[0].content = None;
                            }
                        }
                        chat.messages.extend(extra);
                    }

                    if !collected_text.is_empty() {
                        let msg = ChatMessage::new(ChatRole::Assistant, &collected_text);
                        message_id_committed = Some(msg.id.clone());
                        chat.append(msg.clone());
                        handle.mark_speech_committed();
                        debug!(
                            agent_transcript = %collected_text,
                            interrupted,
                            speech_id = %handle.id(),
                            "committed agent speech"
                        );
                        if interrupted {
                            self.emit(AgentEvent::AgentSpeechInterrupted(msg));
                        } else {
                            self.emit(AgentEvent::AgentSpeechCommitted(msg));
                        }
                    }
                }
            }
            drop(guard);

            if !is_using_tools || interrupted {
                stop_nested(driver).await;
                handle.set_done();
                return;
            }

            let fnc_task = {
                let agent = Arc::clone(self);
                let handle = handle.clone();
                let collected_text = collected_text.clone();
                let fnc_done = fnc_done.clone();
                tokio::spawn(async move {
                    agent
                        .execute_function_calls(&handle, &collected_text, message_id_committed)
                        .await;
                    fnc_done.cancel();
                })
            };

            let _ = driver.await;
            if !fnc_task.is_finished() {
                debug!(speech_id = %handle.id(), "cancelling function calls task");
                fnc_task.abort();
            }
            handle.set_done();
        }
        .boxed()
    }

    async fn execute_function_calls(
        self: &Arc<Self>,
        handle: &SpeechHandle,
        collected_text: &str,
        message_id_committed: Option<String>,
    ) {
        if handle.fnc_nested_depth() >= self.opts.max_nested_tool_calls {
            warn!(
                speech_id = %handle.id(),
                fnc_nested_depth = handle.fnc_nested_depth(),
                "max function calls nested depth reached"
            );
            return;
        }
        let Some(llm_source) = handle.llm_source() else {
            return;
        };
        let calls = llm_source.collected_calls();
        if calls.is_empty() {
            return;
        }

        let call_ctx = AgentCallContext::new(handle.id(), llm_source.chat_ctx.copy());
        if let Ok(mut slot) = self.active_call_ctx.lock() {
            *slot = Some(call_ctx.clone());
        }
        self.emit(AgentEvent::FunctionCallsCollected(calls.clone()));

        let mut called = Vec::new();
        if let Some(fnc_ctx) = &llm_source.fnc_ctx {
            for call in &calls {
                debug!(function = %call.name, speech_id = %handle.id(), "executing ai function");
                let executed = fnc_ctx.execute(call).await;
                if let Some(error) = &executed.error {
                    error!(
                        function = %call.name,
                        speech_id = %handle.id(),
                        "error executing ai function: {error}"
                    );
                }
                called.push(executed);
            }
        } else {
            warn!(speech_id = %handle.id(), "tool calls requested without a function context");
        }

        let mut tool_calls_info = Vec::new();
        let mut tool_results = Vec::new();
        for executed in &called {
            // functions returning nothing are excluded from the follow-up
            if executed.is_void() {
                continue;
            }
            tool_calls_info.push(executed.call_info.clone());
            tool_results.push(ChatMessage::from_called_function(executed));
        }

        if tool_calls_info.is_empty() {
            if let Ok(mut slot) = self.active_call_ctx.lock() {
                *slot = None;
            }
            return;
        }

        let mut extra_tools_messages =
            vec![ChatMessage::with_tool_calls(tool_calls_info, collected_text)];
        extra_tools_messages.extend(tool_results);

        let new_handle = SpeechHandle::create_tool_speech(
            handle.allow_interruptions(),
            handle.add_to_chat_ctx(),
            extra_tools_messages.clone(),
            handle.fnc_nested_depth() + 1,
            message_id_committed,
        );

        let mut chat_ctx = llm_source.chat_ctx.copy();
        chat_ctx.messages.extend(extra_tools_messages);
        chat_ctx.messages.extend(call_ctx.extra_chat_messages());

        let mut fnc_ctx = self.fnc_ctx.lock().ok().and_then(|f| f.clone());
        if fnc_ctx.is_some()
            && new_handle.fnc_nested_depth() >= self.opts.max_nested_tool_calls
            && !self.llm.capabilities().requires_persistent_functions
        {
            debug!(
                speech_id = %handle.id(),
                "max nested depth reached, dropping function context for the follow-up"
            );
            fnc_ctx = None;
        }

        let answer_stream = self.default_chat(chat_ctx, fnc_ctx);
        let synthesized =
            self.synthesize_agent_speech(new_handle.id(), AgentSpeechSource::Llm(answer_stream));
        new_handle.initialize(synthesized.source, synthesized.synthesis);
        handle.add_nested_speech(new_handle);

        self.emit(AgentEvent::FunctionCallsFinished(called));
        if let Ok(mut slot) = self.active_call_ctx.lock() {
            *slot = None;
        }
    }
}

/// Flatten an LLM stream to its text deltas, closing it on exhaustion.
fn llm_stream_to_text(mut stream: LlmStream) -> TextStream {
    Box::pin(async_stream::stream! {
        loop {
            match stream.next().await {
                Some(Ok(chunk)) => {
                    let content = chunk
                        .choices
                        .into_iter()
                        .next()
                        .and_then(|choice| choice.delta.content);
                    if let Some(content) = content {
                        yield content;
                    }
                }
                Some(Err(e)) => {
                    error!("LLM stream failed: {e}");
                    break;
                }
                None => break,
            }
        }
        stream.aclose().await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_context_accumulates_extra_messages() {
        let ctx = AgentCallContext::new("speech_1", ChatContext::new());
        assert_eq!(ctx.speech_id(), "speech_1");
        ctx.add_extra_chat_message(ChatMessage::new(ChatRole::Assistant, "one moment"));
        let extra = ctx.extra_chat_messages();
        assert_eq!(extra.len(), 1);
        assert_eq!(extra[0].text(), "one moment");
    }

    #[test]
    fn say_source_conversions() {
        match AgentSpeechSource::from("hello") {
            AgentSpeechSource::Text(text) => assert_eq!(text, "hello"),
            _ => unreachable!("expected text source"),
        }
        match AgentSpeechSource::from(String::from("hi")) {
            AgentSpeechSource::Text(text) => assert_eq!(text, "hi"),
            _ => unreachable!("expected text source"),
        }
    }
}
