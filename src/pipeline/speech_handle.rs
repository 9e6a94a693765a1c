//! Handles for scheduled agent utterances.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::agent_output::SynthesisHandle;
use crate::llm::{ChatContext, ChatMessage, FunctionCallInfo, FunctionContext};
use crate::types::short_id;

/// Why an utterance was scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechKind {
    /// A reply to a user turn.
    Reply,
    /// A direct `say()` call.
    AssistantSay,
    /// A follow-up spoken after tool execution.
    Tool,
}

/// Post-hoc information about an LLM-backed speech source.
#[derive(Clone)]
pub struct LlmSourceInfo {
    /// Chat context the completion was requested with.
    pub chat_ctx: ChatContext,
    /// Function context the completion was requested with.
    pub fnc_ctx: Option<Arc<FunctionContext>>,
    /// Tool calls collected from the stream (shared with the stream
    /// adapter, filled as chunks arrive).
    pub function_calls: Arc<Mutex<Vec<FunctionCallInfo>>>,
}

impl LlmSourceInfo {
    /// Tool calls requested so far.
    pub fn collected_calls(&self) -> Vec<FunctionCallInfo> {
        self.function_calls
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }
}

/// What kind of source backs a speech handle.
#[derive(Clone)]
pub enum SpeechSourceInfo {
    /// A plain string.
    Text(String),
    /// A lazy text sequence with no post-hoc metadata.
    Stream,
    /// An LLM completion.
    Llm(LlmSourceInfo),
}

/// One scheduled agent utterance.
///
/// Cheap to clone; all clones share state. Lifecycle:
/// `Created → Initialized → Playing → Done`, with interruption possible at
/// any point.
#[derive(Clone)]
pub struct SpeechHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    id: String,
    kind: SpeechKind,
    allow_interruptions: bool,
    add_to_chat_ctx: bool,
    user_question: String,
    fnc_nested_depth: u32,
    extra_tools_messages: Vec<ChatMessage>,
    fnc_text_message_id: Option<String>,

    source: Mutex<Option<SpeechSourceInfo>>,
    synthesis: Mutex<Option<SynthesisHandle>>,
    initialized_tx: watch::Sender<bool>,
    initialized_rx: watch::Receiver<bool>,
    cancelled: AtomicBool,
    cancel_token: CancellationToken,
    user_committed: AtomicBool,
    speech_committed: AtomicBool,

    nested: Mutex<VecDeque<SpeechHandle>>,
    nested_changed: Notify,
    nested_done: AtomicBool,

    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl SpeechHandle {
    fn new(
        kind: SpeechKind,
        allow_interruptions: bool,
        add_to_chat_ctx: bool,
        user_question: String,
        extra_tools_messages: Vec<ChatMessage>,
        fnc_nested_depth: u32,
        fnc_text_message_id: Option<String>,
    ) -> Self {
        let (initialized_tx, initialized_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        Self {
            inner: Arc::new(HandleInner {
                id: short_id("speech"),
                kind,
                allow_interruptions,
                add_to_chat_ctx,
                user_question,
                fnc_nested_depth,
                extra_tools_messages,
                fnc_text_message_id,
                source: Mutex::new(None),
                synthesis: Mutex::new(None),
                initialized_tx,
                initialized_rx,
                cancelled: AtomicBool::new(false),
                cancel_token: CancellationToken::new(),
                user_committed: AtomicBool::new(false),
                speech_committed: AtomicBool::new(false),
                nested: Mutex::new(VecDeque::new()),
                nested_changed: Notify::new(),
                nested_done: AtomicBool::new(false),
                done_tx,
                done_rx,
            }),
        }
    }

    /// A reply to the given user question.
    pub fn create_assistant_reply(
        allow_interruptions: bool,
        add_to_chat_ctx: bool,
        user_question: &str,
    ) -> Self {
        Self::new(
            SpeechKind::Reply,
            allow_interruptions,
            add_to_chat_ctx,
            user_question.to_string(),
            Vec::new(),
            0,
            None,
        )
    }

    /// A pre-formed utterance from `say()`.
    pub fn create_assistant_speech(allow_interruptions: bool, add_to_chat_ctx: bool) -> Self {
        Self::new(
            SpeechKind::AssistantSay,
            allow_interruptions,
            add_to_chat_ctx,
            String::new(),
            Vec::new(),
            0,
            None,
        )
    }

    /// A tool-call follow-up nested under its parent speech.
    pub fn create_tool_speech(
        allow_interruptions: bool,
        add_to_chat_ctx: bool,
        extra_tools_messages: Vec<ChatMessage>,
        fnc_nested_depth: u32,
        fnc_text_message_id: Option<String>,
    ) -> Self {
        Self::new(
            SpeechKind::Tool,
            allow_interruptions,
            add_to_chat_ctx,
            String::new(),
            extra_tools_messages,
            fnc_nested_depth,
            fnc_text_message_id,
        )
    }

    /// Unique id, also used as the metrics `sequence_id`.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Why this utterance was scheduled.
    pub fn kind(&self) -> SpeechKind {
        self.inner.kind
    }

    /// Whether this is a reply to a user turn.
    pub fn is_reply(&self) -> bool {
        self.inner.kind == SpeechKind::Reply
    }

    /// Whether barge-in may cut this utterance short.
    pub fn allow_interruptions(&self) -> bool {
        self.inner.allow_interruptions
    }

    /// Whether the spoken text is committed to the chat context afterwards.
    pub fn add_to_chat_ctx(&self) -> bool {
        self.inner.add_to_chat_ctx
    }

    /// The user turn this replies to; empty for non-replies.
    pub fn user_question(&self) -> &str {
        &self.inner.user_question
    }

    /// Tool recursion depth of this utterance.
    pub fn fnc_nested_depth(&self) -> u32 {
        self.inner.fnc_nested_depth
    }

    /// Tool-call and tool-result messages to splice into the chat context.
    pub fn extra_tools_messages(&self) -> &[ChatMessage] {
        &self.inner.extra_tools_messages
    }

    /// Id of the text message spoken alongside the tool calls, if any.
    pub fn fnc_text_message_id(&self) -> Option<&str> {
        self.inner.fnc_text_message_id.as_deref()
    }

    /// Attach the source and synthesis; transitions `Created → Initialized`.
    pub fn initialize(&self, source: SpeechSourceInfo, synthesis: SynthesisHandle) {
        if self.interrupted() {
            synthesis.interrupt();
        }
        if let Ok(mut slot) = self.inner.source.lock() {
            *slot = Some(source);
        }
        if let Ok(mut slot) = self.inner.synthesis.lock() {
            *slot = Some(synthesis);
        }
        let _ = self.inner.initialized_tx.send(true);
    }

    /// Whether `initialize` has been called.
    pub fn initialized(&self) -> bool {
        *self.inner.initialized_rx.borrow()
    }

    /// Wait until initialized.
    ///
    /// # Errors
    ///
    /// Returns `Err(())` if the handle was cancelled first.
    pub async fn wait_for_initialization(&self) -> Result<(), ()> {
        let mut rx = self.inner.initialized_rx.clone();
        loop {
            if *rx.borrow() {
                return Ok(());
            }
            tokio::select! {
                () = self.inner.cancel_token.cancelled() => return Err(()),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(());
                    }
                }
            }
        }
    }

    /// The source info, once initialized.
    pub fn source(&self) -> Option<SpeechSourceInfo> {
        self.inner.source.lock().ok().and_then(|s| s.clone())
    }

    /// LLM source info, when this speech is LLM-backed.
    pub fn llm_source(&self) -> Option<LlmSourceInfo> {
        match self.source() {
            Some(SpeechSourceInfo::Llm(info)) => Some(info),
            _ => None,
        }
    }

    /// The synthesis handle, once initialized.
    pub fn synthesis_handle(&self) -> Option<SynthesisHandle> {
        self.inner.synthesis.lock().ok().and_then(|s| s.clone())
    }

    /// Whether the utterance is interrupted (cancelled before init, or its
    /// synthesis was interrupted).
    pub fn interrupted(&self) -> bool {
        if self.inner.cancelled.load(Ordering::Relaxed) {
            return true;
        }
        self.synthesis_handle().is_some_and(|s| s.interrupted())
    }

    /// Interrupt the utterance, respecting `allow_interruptions`.
    pub fn interrupt(&self) {
        if !self.inner.allow_interruptions {
            debug!(speech_id = %self.inner.id, "speech does not allow interruptions");
            return;
        }
        self.cancel(true);
    }

    /// Cancel the utterance unconditionally.
    pub fn cancel(&self, cancel_nested: bool) {
        self.inner.cancelled.store(true, Ordering::Relaxed);
        self.inner.cancel_token.cancel();
        if let Some(synthesis) = self.synthesis_handle() {
            synthesis.interrupt();
        }
        if cancel_nested {
            let nested: Vec<SpeechHandle> = self
                .inner
                .nested
                .lock()
                .map(|n| n.iter().cloned().collect())
                .unwrap_or_default();
            for speech in nested {
                speech.cancel(true);
            }
        }
    }

    /// Whether the user question has been committed to the chat context.
    pub fn user_committed(&self) -> bool {
        self.inner.user_committed.load(Ordering::Relaxed)
    }

    /// Record the user-question commit.
    pub fn mark_user_committed(&self) {
        self.inner.user_committed.store(true, Ordering::Relaxed);
    }

    /// Whether the spoken text has been committed to the chat context.
    pub fn speech_committed(&self) -> bool {
        self.inner.speech_committed.load(Ordering::Relaxed)
    }

    /// Record the spoken-text commit.
    pub fn mark_speech_committed(&self) {
        self.inner.speech_committed.store(true, Ordering::Relaxed);
    }

    // ── nested speech ─────────────────────────────────────────

    /// Attach an utterance to play within this one's play scope.
    pub fn add_nested_speech(&self, speech: SpeechHandle) {
        if let Ok(mut nested) = self.inner.nested.lock() {
            nested.push_back(speech);
        }
        self.inner.nested_changed.notify_one();
    }

    /// Head of the nested queue, if any.
    pub fn peek_nested(&self) -> Option<SpeechHandle> {
        self.inner
            .nested
            .lock()
            .ok()
            .and_then(|n| n.front().cloned())
    }

    /// Pop the head of the nested queue.
    pub fn pop_nested(&self) -> Option<SpeechHandle> {
        self.inner.nested.lock().ok().and_then(|mut n| n.pop_front())
    }

    /// Whether nested utterances are pending.
    pub fn has_nested(&self) -> bool {
        self.inner
            .nested
            .lock()
            .map(|n| !n.is_empty())
            .unwrap_or(false)
    }

    /// Wait for a nested-queue change or done signal.
    pub async fn nested_changed(&self) {
        self.inner.nested_changed.notified().await;
    }

    /// Whether no further nested speech will be accepted.
    pub fn nested_speech_done(&self) -> bool {
        self.inner.nested_done.load(Ordering::Relaxed)
    }

    /// Close the nested queue.
    pub fn mark_nested_speech_done(&self) {
        self.inner.nested_done.store(true, Ordering::Relaxed);
        self.inner.nested_changed.notify_one();
    }

    // ── completion ────────────────────────────────────────────

    /// Whether playout (including nested speech) has finished.
    pub fn done(&self) -> bool {
        *self.inner.done_rx.borrow()
    }

    /// Mark the utterance finished.
    pub fn set_done(&self) {
        let _ = self.inner.done_tx.send(true);
    }

    /// Wait for the utterance to finish.
    pub async fn join(&self) {
        let mut rx = self.inner.done_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_handles_carry_the_question() {
        let handle = SpeechHandle::create_assistant_reply(true, true, "what time is it?");
        assert!(handle.is_reply());
        assert_eq!(handle.user_question(), "what time is it?");
        assert!(handle.allow_interruptions());
        assert!(!handle.initialized());
        assert!(!handle.done());
    }

    #[test]
    fn ids_are_unique() {
        let a = SpeechHandle::create_assistant_speech(true, true);
        let b = SpeechHandle::create_assistant_speech(true, true);
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn cancel_before_initialization_unblocks_waiters() {
        let handle = SpeechHandle::create_assistant_reply(true, true, "hello");
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.wait_for_initialization().await })
        };
        handle.cancel(false);
        match waiter.await {
            Ok(result) => assert!(result.is_err()),
            Err(e) => unreachable!("waiter panicked: {e}"),
        }
        assert!(handle.interrupted());
    }

    #[test]
    fn uninterruptible_speech_ignores_interrupt() {
        let handle = SpeechHandle::create_assistant_speech(false, true);
        handle.interrupt();
        assert!(!handle.interrupted());
        // cancel is unconditional
        handle.cancel(false);
        assert!(handle.interrupted());
    }

    #[test]
    fn nested_queue_is_fifo() {
        let parent = SpeechHandle::create_assistant_reply(true, true, "q");
        let first = SpeechHandle::create_assistant_speech(true, true);
        let second = SpeechHandle::create_assistant_speech(true, true);
        parent.add_nested_speech(first.clone());
        parent.add_nested_speech(second.clone());

        assert!(parent.has_nested());
        assert_eq!(parent.pop_nested().map(|h| h.id().to_string()), Some(first.id().to_string()));
        assert_eq!(parent.pop_nested().map(|h| h.id().to_string()), Some(second.id().to_string()));
        assert!(!parent.has_nested());
    }

    #[test]
    fn cancel_propagates_to_nested() {
        let parent = SpeechHandle::create_assistant_reply(true, true, "q");
        let nested = SpeechHandle::create_assistant_speech(true, true);
        parent.add_nested_speech(nested.clone());
        parent.cancel(true);
        assert!(nested.interrupted());
    }

    #[tokio::test]
    async fn join_resolves_after_set_done() {
        let handle = SpeechHandle::create_assistant_speech(true, true);
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.join().await })
        };
        handle.set_done();
        assert!(waiter.await.is_ok());
        assert!(handle.done());
    }

    #[test]
    fn commit_flags_are_sticky() {
        let handle = SpeechHandle::create_assistant_reply(true, true, "q");
        assert!(!handle.user_committed());
        handle.mark_user_committed();
        handle.mark_speech_committed();
        assert!(handle.user_committed());
        assert!(handle.speech_committed());
    }
}
