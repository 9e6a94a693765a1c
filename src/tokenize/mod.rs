//! Text tokenization for incremental speech synthesis.
//!
//! TTS engines produce better prosody on whole sentences, but waiting for a
//! full LLM response costs latency. The buffered token streams in this module
//! emit stable sentence/word tokens as soon as enough context has
//! accumulated, with a forced flush on terminal punctuation.

pub mod basic;
mod token_stream;

pub use token_stream::{TokenReceiver, TokenSink, TokenStream};

use std::sync::Arc;

/// A token emitted by a [`TokenStream`], tagged with its segment.
///
/// Segment ids are stable between emissions and rotate on every explicit
/// flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenData {
    /// The token text.
    pub token: String,
    /// Id of the segment this token belongs to.
    pub segment_id: String,
}

/// Splits text into sentences.
pub trait SentenceTokenizer: Send + Sync {
    /// Tokenize a complete text into sentences.
    fn tokenize(&self, text: &str) -> Vec<String>;

    /// Open a buffered streaming tokenizer over this implementation.
    fn stream(&self) -> TokenStream;
}

/// Splits text into words.
pub trait WordTokenizer: Send + Sync {
    /// Tokenize a complete text into words.
    fn tokenize(&self, text: &str) -> Vec<String>;

    /// Join words back into provider-facing text.
    fn format_words(&self, words: &[String]) -> String {
        words.join(" ")
    }

    /// Open a buffered streaming tokenizer over this implementation.
    fn stream(&self) -> TokenStream;
}

/// Splits a word into speakable parts for playback pacing estimates.
pub type HyphenateFn = fn(&str) -> Vec<String>;

/// Shared tokenize closure used by [`TokenStream`].
pub type TokenizeFn = Arc<dyn Fn(&str) -> Vec<String> + Send + Sync>;
