//! Deferred reply validation: deciding when the user's turn has ended.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::Result;
use crate::llm::ChatContext;

/// If STT never delivers a final transcript after end of speech, validate
/// anyway so the agent doesn't lock up.
const FINAL_TRANSCRIPT_TIMEOUT: Duration = Duration::from_secs(5);

/// Characters that let us validate faster.
const PUNCTUATION: [char; 3] = ['.', '!', '?'];
const PUNCTUATION_REDUCE_FACTOR: f64 = 0.75;

/// Predicts whether the user has finished their turn.
#[async_trait]
pub trait TurnDetector: Send + Sync {
    /// Probability threshold below which the user is likely not finished.
    fn unlikely_threshold(&self) -> f32;

    /// Whether the detector supports the given language.
    fn supports_language(&self, language: Option<&str>) -> bool;

    /// Probability in `[0, 1]` that the user's turn is over.
    async fn predict_end_of_turn(&self, chat_ctx: &ChatContext) -> Result<f32>;
}

/// Decides when to fire the validation callback after the user stops
/// speaking, balancing responsiveness against cutting the user off.
///
/// At most one validation is pending; any new VAD/transcript event
/// reschedules it, and speech onset cancels it unconditionally.
pub struct DeferredReplyValidation {
    validate_tx: mpsc::UnboundedSender<()>,
    turn_detector: Option<Arc<dyn TurnDetector>>,
    min_delay: Duration,
    max_delay: Duration,
    state: Arc<Mutex<ValidatorState>>,
}

#[derive(Default)]
struct ValidatorState {
    speaking: bool,
    last_final_transcript: String,
    last_language: Option<String>,
    last_start_of_speech: Option<Instant>,
    last_end_of_speech: Option<Instant>,
    last_transcript: Option<Instant>,
    task: Option<JoinHandle<()>>,
}

impl DeferredReplyValidation {
    /// Create a validator that fires on `validate_tx`.
    pub fn new(
        min_delay: Duration,
        max_delay: Duration,
        turn_detector: Option<Arc<dyn TurnDetector>>,
        validate_tx: mpsc::UnboundedSender<()>,
    ) -> Self {
        Self {
            validate_tx,
            turn_detector,
            min_delay,
            max_delay,
            state: Arc::new(Mutex::new(ValidatorState::default())),
        }
    }

    /// Adjust the delay bounds. Takes effect for subsequent scheduling.
    pub fn set_delays(&mut self, min_delay: Duration, max_delay: Duration) {
        self.min_delay = min_delay;
        self.max_delay = max_delay;
    }

    /// Attach or replace the turn detector.
    pub fn set_turn_detector(&mut self, turn_detector: Option<Arc<dyn TurnDetector>>) {
        self.turn_detector = turn_detector;
    }

    /// Whether a validation is currently scheduled.
    pub fn validating(&self) -> bool {
        self.state
            .lock()
            .map(|s| s.task.as_ref().is_some_and(|t| !t.is_finished()))
            .unwrap_or(false)
    }

    /// The user started speaking: cancel any pending validation.
    pub fn on_human_start_of_speech(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.speaking = true;
            state.last_start_of_speech = Some(Instant::now());
            if let Some(task) = state.task.take() {
                task.abort();
            }
        }
    }

    /// The user stopped speaking: (re)schedule validation.
    pub fn on_human_end_of_speech(&self, chat_ctx: ChatContext) {
        let delay = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            state.speaking = false;
            state.last_end_of_speech = Some(Instant::now());
            self.compute_delay(&state)
        };
        if let Some(delay) = delay {
            self.schedule(delay, chat_ctx);
        }
    }

    /// A final transcript arrived: (re)schedule validation.
    pub fn on_human_final_transcript(
        &self,
        transcript: &str,
        language: Option<&str>,
        chat_ctx: ChatContext,
    ) {
        let delay = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            if !state.last_final_transcript.is_empty() {
                state.last_final_transcript.push(' ');
            }
            state.last_final_transcript.push_str(transcript.trim());
            state.last_language = language.map(str::to_string);
            state.last_transcript = Some(Instant::now());
            self.compute_delay(&state)
        };
        if let Some(delay) = delay {
            self.schedule(delay, chat_ctx);
        }
    }

    /// Cancel any pending validation.
    pub fn aclose(&self) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(task) = state.task.take() {
                task.abort();
            }
        }
    }

    /// Delay before validating, or `None` to do nothing.
    fn compute_delay(&self, state: &ValidatorState) -> Option<Duration> {
        // never validate while the user is speaking
        if state.speaking {
            return None;
        }

        if state.last_final_transcript.is_empty() {
            return Some(FINAL_TRANSCRIPT_TIMEOUT);
        }

        let mut delay = self.min_delay;
        if state
            .last_final_transcript
            .trim_end()
            .ends_with(PUNCTUATION)
        {
            delay = delay.mul_f64(PUNCTUATION_REDUCE_FACTOR);
        }

        // the true end of user speech is whichever came first: VAD offset or
        // the final transcript, when the transcript arrived inside the
        // speech window. With no VAD offset at all (missed onset, or a
        // transcript arriving after a fired validation), validate now.
        let Some(mut end_of_speech) = state.last_end_of_speech else {
            return Some(Duration::ZERO);
        };
        if let (Some(transcript_at), Some(start)) = (state.last_transcript, state.last_start_of_speech)
        {
            if transcript_at > start && transcript_at < end_of_speech {
                end_of_speech = transcript_at;
            }
        }

        Some(delay.saturating_sub(end_of_speech.elapsed()))
    }

    fn schedule(&self, delay: Duration, chat_ctx: ChatContext) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if let Some(task) = state.task.take() {
            task.abort();
        }

        let use_turn_detector = !state.last_final_transcript.is_empty() && !state.speaking;
        let language = state.last_language.clone();
        let turn_detector = self.turn_detector.clone();
        let max_delay = self.max_delay;
        let validate_tx = self.validate_tx.clone();
        let shared = Arc::clone(&self.state);

        state.task = Some(tokio::spawn(async move {
            let mut delay = delay;
            if use_turn_detector {
                if let Some(detector) = turn_detector {
                    if detector.supports_language(language.as_deref()) {
                        let started = Instant::now();
                        match detector.predict_end_of_turn(&chat_ctx).await {
                            Ok(probability) => {
                                if probability < detector.unlikely_threshold() {
                                    debug!(
                                        probability,
                                        "turn detector thinks the user is not finished"
                                    );
                                    delay = max_delay;
                                }
                            }
                            Err(e) => warn!("turn detector failed: {e}"),
                        }
                        delay = delay.saturating_sub(started.elapsed());
                    }
                }
            }

            tokio::time::sleep(delay).await;

            if let Ok(mut state) = shared.lock() {
                state.last_final_transcript.clear();
                state.last_end_of_speech = None;
                state.last_transcript = None;
            }
            let _ = validate_tx.send(());
        }));
    }
}

impl Drop for DeferredReplyValidation {
    fn drop(&mut self) {
        self.aclose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator(
        detector: Option<Arc<dyn TurnDetector>>,
    ) -> (DeferredReplyValidation, mpsc::UnboundedReceiver<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            DeferredReplyValidation::new(
                Duration::from_millis(500),
                Duration::from_secs(6),
                detector,
                tx,
            ),
            rx,
        )
    }

    async fn fired(rx: &mut mpsc::UnboundedReceiver<()>) -> bool {
        for _ in 0..16 {
            tokio::task::yield_now().await;
            if rx.try_recv().is_ok() {
                return true;
            }
        }
        false
    }

    #[tokio::test(start_paused = true)]
    async fn validates_after_min_delay() {
        let (validator, mut rx) = validator(None);
        validator.on_human_start_of_speech();
        validator.on_human_final_transcript("turn it off", None, ChatContext::new());
        validator.on_human_end_of_speech(ChatContext::new());
        assert!(validator.validating());

        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(400)).await;
        assert!(!fired(&mut rx).await);
        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(fired(&mut rx).await);
    }

    #[tokio::test(start_paused = true)]
    async fn punctuation_shortens_the_delay() {
        let (validator, mut rx) = validator(None);
        validator.on_human_start_of_speech();
        validator.on_human_final_transcript("turn it off.", None, ChatContext::new());
        validator.on_human_end_of_speech(ChatContext::new());
        tokio::task::yield_now().await;

        // 500ms * 0.75 = 375ms
        tokio::time::advance(Duration::from_millis(300)).await;
        assert!(!fired(&mut rx).await);
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(fired(&mut rx).await);
    }

    #[tokio::test(start_paused = true)]
    async fn speech_onset_cancels_pending_validation() {
        let (validator, mut rx) = validator(None);
        validator.on_human_start_of_speech();
        validator.on_human_final_transcript("wait", None, ChatContext::new());
        validator.on_human_end_of_speech(ChatContext::new());
        assert!(validator.validating());

        validator.on_human_start_of_speech();
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(!fired(&mut rx).await);
    }

    #[tokio::test(start_paused = true)]
    async fn no_final_transcript_uses_timeout() {
        let (validator, mut rx) = validator(None);
        validator.on_human_start_of_speech();
        validator.on_human_end_of_speech(ChatContext::new());
        tokio::task::yield_now().await;

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(!fired(&mut rx).await);
        tokio::time::advance(Duration::from_millis(1_100)).await;
        assert!(fired(&mut rx).await);
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_fires_while_speaking() {
        let (validator, mut rx) = validator(None);
        validator.on_human_start_of_speech();
        validator.on_human_final_transcript("still going", None, ChatContext::new());
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!fired(&mut rx).await);
    }

    struct UnlikelyDetector;

    #[async_trait]
    impl TurnDetector for UnlikelyDetector {
        fn unlikely_threshold(&self) -> f32 {
            0.5
        }

        fn supports_language(&self, _language: Option<&str>) -> bool {
            true
        }

        async fn predict_end_of_turn(&self, _chat_ctx: &ChatContext) -> Result<f32> {
            Ok(0.1)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unlikely_end_of_turn_extends_delay() {
        let (validator, mut rx) = validator(Some(Arc::new(UnlikelyDetector)));
        validator.on_human_start_of_speech();
        validator.on_human_final_transcript("and then", None, ChatContext::new());
        validator.on_human_end_of_speech(ChatContext::new());
        tokio::task::yield_now().await;

        // way past min_delay, but the detector pushed it to max_delay
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!fired(&mut rx).await);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(fired(&mut rx).await);
    }

    #[tokio::test(start_paused = true)]
    async fn elapsed_time_since_end_of_speech_is_subtracted() {
        let (validator, mut rx) = validator(None);
        validator.on_human_start_of_speech();
        validator.on_human_end_of_speech(ChatContext::new());
        // transcript arrives 450ms after end of speech; only ~50ms remain
        tokio::time::advance(Duration::from_millis(450)).await;
        validator.on_human_final_transcript("done now", None, ChatContext::new());
        tokio::task::yield_now().await;

        tokio::time::advance(Duration::from_millis(80)).await;
        assert!(fired(&mut rx).await);
    }
}
