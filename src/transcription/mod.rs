//! Paced transcript tracking for agent speech.
//!
//! The forwarder receives the transcript text stream and the synthesized
//! audio frames for one utterance, and answers the question the orchestrator
//! cares about: *what has actually been spoken so far?* Word pacing is
//! estimated from hyphenation parts scaled by the configured transcript
//! speed, clocked from playout start. `played_text` is the commit source of
//! truth for spoken text, including the prefix kept after an interruption.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use crate::audio::AudioFrame;
use crate::tokenize::{HyphenateFn, WordTokenizer};

/// Baseline per-word speaking time.
const WORD_BASE_DURATION: Duration = Duration::from_millis(50);
/// Additional speaking time per hyphenation part.
const PART_DURATION: Duration = Duration::from_millis(120);

/// Tracks synthesized text/audio and paces what counts as spoken.
///
/// Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct TranscriptionForwarder {
    state: Arc<Mutex<ForwarderState>>,
    word_tokenizer: Arc<dyn WordTokenizer>,
    hyphenate: HyphenateFn,
    speed: f64,
}

#[derive(Default)]
struct ForwarderState {
    text: String,
    pushed_audio: Duration,
    playout_started_at: Option<Instant>,
    played_before_current_run: Duration,
    playout_finished: bool,
    text_done: bool,
    audio_done: bool,
    closed: bool,
}

impl TranscriptionForwarder {
    /// Create a forwarder.
    ///
    /// `speed` scales pacing: values above 1.0 mark words as spoken faster
    /// than the estimate.
    pub fn new(word_tokenizer: Arc<dyn WordTokenizer>, hyphenate: HyphenateFn, speed: f64) -> Self {
        Self {
            state: Arc::new(Mutex::new(ForwarderState::default())),
            word_tokenizer,
            hyphenate,
            speed: if speed > 0.0 { speed } else { 1.0 },
        }
    }

    /// Append transcript text for this utterance.
    pub fn push_text(&self, text: &str) {
        if let Ok(mut state) = self.state.lock() {
            if state.closed {
                return;
            }
            state.text.push_str(text);
        }
    }

    /// Account one synthesized audio frame.
    pub fn push_audio(&self, frame: &AudioFrame) {
        if let Ok(mut state) = self.state.lock() {
            if state.closed {
                return;
            }
            state.pushed_audio += frame.duration();
        }
    }

    /// The transcript source is exhausted.
    pub fn mark_text_segment_end(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.text_done = true;
        }
    }

    /// The audio source is exhausted.
    pub fn mark_audio_segment_end(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.audio_done = true;
        }
    }

    /// Playout of this utterance became audible.
    pub fn segment_playout_started(&self) {
        if let Ok(mut state) = self.state.lock() {
            if state.playout_started_at.is_none() {
                state.playout_started_at = Some(Instant::now());
            }
        }
    }

    /// Playout drained naturally; the full transcript counts as spoken.
    /// Not called on interruption.
    pub fn segment_playout_finished(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.playout_finished = true;
        }
    }

    /// Freeze the pacing clock (e.g. while nested speech plays).
    pub fn pause_playout(&self) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(started) = state.playout_started_at.take() {
                state.played_before_current_run += started.elapsed();
            }
        }
    }

    /// Stop accepting text/audio.
    pub fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.closed = true;
        }
    }

    /// Whether the forwarder has been closed.
    pub fn closed(&self) -> bool {
        self.state.lock().map(|s| s.closed).unwrap_or(true)
    }

    /// Full transcript pushed so far, spoken or not.
    pub fn pushed_text(&self) -> String {
        self.state.lock().map(|s| s.text.clone()).unwrap_or_default()
    }

    /// The prefix of the transcript estimated to have been audible so far.
    pub fn played_text(&self) -> String {
        let (text, budget) = match self.state.lock() {
            Ok(state) => {
                if state.playout_finished {
                    return state.text.clone();
                }
                let mut elapsed = state.played_before_current_run;
                if let Some(started) = state.playout_started_at {
                    elapsed += started.elapsed();
                }
                // can't have played more than was synthesized
                let elapsed = elapsed.min(state.pushed_audio);
                (state.text.clone(), elapsed.mul_f64(self.speed))
            }
            Err(_) => return String::new(),
        };

        let mut spoken = Vec::new();
        let mut cumulative = Duration::ZERO;
        for word in self.word_tokenizer.tokenize(&text) {
            cumulative += self.estimate_word_duration(&word);
            if cumulative > budget {
                break;
            }
            spoken.push(word);
        }
        self.word_tokenizer.format_words(&spoken)
    }

    fn estimate_word_duration(&self, word: &str) -> Duration {
        let parts = (self.hyphenate)(word).len() as u32;
        WORD_BASE_DURATION + PART_DURATION * parts.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenize::basic::{hyphenate_word, BasicWordTokenizer};

    fn forwarder(speed: f64) -> TranscriptionForwarder {
        TranscriptionForwarder::new(
            Arc::new(BasicWordTokenizer::default()),
            hyphenate_word,
            speed,
        )
    }

    fn audio(ms: u64) -> AudioFrame {
        AudioFrame::silence(1_000, 1, ms as u32)
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_played_before_playout_starts() {
        let fwd = forwarder(1.0);
        fwd.push_text("hello world");
        fwd.push_audio(&audio(2_000));
        assert_eq!(fwd.played_text(), "");
    }

    #[tokio::test(start_paused = true)]
    async fn words_accrue_with_playout_time() {
        let fwd = forwarder(1.0);
        fwd.push_text("alpha beta gamma delta");
        fwd.push_audio(&audio(10_000));
        fwd.segment_playout_started();

        tokio::time::advance(Duration::from_millis(400)).await;
        let early = fwd.played_text();

        tokio::time::advance(Duration::from_secs(5)).await;
        let late = fwd.played_text();

        assert!(early.len() < late.len(), "'{early}' vs '{late}'");
        assert!(late.starts_with(&early));
    }

    #[tokio::test(start_paused = true)]
    async fn played_text_is_bounded_by_synthesized_audio() {
        let fwd = forwarder(1.0);
        fwd.push_text("one two three four five six seven eight");
        // only 200ms of audio exists, whatever the clock says
        fwd.push_audio(&audio(200));
        fwd.segment_playout_started();
        tokio::time::advance(Duration::from_secs(60)).await;

        let played = fwd.played_text();
        let full = fwd.pushed_text();
        assert!(played.len() < full.len());
    }

    #[tokio::test(start_paused = true)]
    async fn finished_playout_counts_everything() {
        let fwd = forwarder(1.0);
        fwd.push_text("short answer.");
        fwd.push_audio(&audio(300));
        fwd.segment_playout_started();
        fwd.segment_playout_finished();
        assert_eq!(fwd.played_text(), "short answer.");
    }

    #[tokio::test(start_paused = true)]
    async fn faster_speed_marks_words_sooner() {
        let slow = forwarder(1.0);
        let fast = forwarder(2.0);
        for fwd in [&slow, &fast] {
            fwd.push_text("incrementally paced transcription output");
            fwd.push_audio(&audio(10_000));
            fwd.segment_playout_started();
        }
        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(fast.played_text().len() >= slow.played_text().len());
    }

    #[tokio::test(start_paused = true)]
    async fn closed_forwarder_ignores_pushes() {
        let fwd = forwarder(1.0);
        fwd.push_text("before");
        fwd.close();
        fwd.push_text(" after");
        assert!(fwd.closed());
        assert_eq!(fwd.pushed_text(), "before");
    }
}
