//! Rule-based sentence/word tokenizers.
//!
//! Good enough for latency-shaping TTS input; language-specific
//! normalization belongs to the embedding application.

use std::sync::Arc;

use super::{SentenceTokenizer, TokenStream, WordTokenizer};

/// Characters that terminate a sentence.
const SENTENCE_PUNCTUATION: [char; 4] = ['.', '!', '?', '…'];

/// Streaming defaults tuned for TTS prosody vs. latency.
const SENTENCE_MIN_TOKEN_LEN: usize = 8;
const SENTENCE_MIN_CTX_LEN: usize = 10;
const WORD_MIN_TOKEN_LEN: usize = 1;
const WORD_MIN_CTX_LEN: usize = 1;

/// Sentence tokenizer splitting on terminal punctuation.
///
/// Sentences shorter than `min_sentence_len` are merged with the following
/// one so TTS doesn't receive fragments like "Dr." alone.
#[derive(Debug, Clone)]
pub struct BasicSentenceTokenizer {
    min_sentence_len: usize,
}

impl BasicSentenceTokenizer {
    /// Create a tokenizer with the given minimum sentence length.
    pub fn new(min_sentence_len: usize) -> Self {
        Self { min_sentence_len }
    }
}

impl Default for BasicSentenceTokenizer {
    fn default() -> Self {
        Self::new(20)
    }
}

impl SentenceTokenizer for BasicSentenceTokenizer {
    fn tokenize(&self, text: &str) -> Vec<String> {
        split_sentences(text, self.min_sentence_len)
    }

    fn stream(&self) -> TokenStream {
        let this = self.clone();
        TokenStream::new(
            Arc::new(move |text| this.tokenize(text)),
            SENTENCE_MIN_TOKEN_LEN,
            SENTENCE_MIN_CTX_LEN,
        )
    }
}

/// Whitespace word tokenizer, optionally stripping punctuation.
#[derive(Debug, Clone)]
pub struct BasicWordTokenizer {
    ignore_punctuation: bool,
}

impl BasicWordTokenizer {
    /// Create a tokenizer. With `ignore_punctuation`, surrounding
    /// punctuation is stripped from each word.
    pub fn new(ignore_punctuation: bool) -> Self {
        Self { ignore_punctuation }
    }
}

impl Default for BasicWordTokenizer {
    fn default() -> Self {
        Self::new(false)
    }
}

impl WordTokenizer for BasicWordTokenizer {
    fn tokenize(&self, text: &str) -> Vec<String> {
        text.split_whitespace()
            .filter_map(|word| {
                let word = if self.ignore_punctuation {
                    word.trim_matches(|c: char| c.is_ascii_punctuation())
                } else {
                    word
                };
                if word.is_empty() {
                    None
                } else {
                    Some(word.to_string())
                }
            })
            .collect()
    }

    fn stream(&self) -> TokenStream {
        let this = self.clone();
        TokenStream::new(
            Arc::new(move |text| this.tokenize(text)),
            WORD_MIN_TOKEN_LEN,
            WORD_MIN_CTX_LEN,
        )
    }
}

fn split_sentences(text: &str, min_sentence_len: usize) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        current.push(c);
        if SENTENCE_PUNCTUATION.contains(&c) {
            let at_boundary = match chars.peek() {
                None => true,
                Some(next) => next.is_whitespace(),
            };
            if at_boundary && current.trim().len() >= min_sentence_len {
                sentences.push(current.trim().to_string());
                current.clear();
            }
        }
    }

    let tail = current.trim();
    if !tail.is_empty() {
        sentences.push(tail.to_string());
    }
    sentences
}

/// Split a word into speakable parts.
///
/// A cheap syllable approximation: break after each vowel group. Only used
/// for transcript pacing estimates, never for synthesis.
pub fn hyphenate_word(word: &str) -> Vec<String> {
    let is_vowel = |c: char| "aeiouyAEIOUY".contains(c);
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut seen_vowel = false;

    for c in word.chars() {
        if seen_vowel && !is_vowel(c) && !current.is_empty() {
            parts.push(std::mem::take(&mut current));
            seen_vowel = false;
        }
        current.push(c);
        if is_vowel(c) {
            seen_vowel = true;
        }
    }
    if !current.is_empty() {
        // avoid a trailing part with no vowel ("strength" -> one part)
        if !seen_vowel && !parts.is_empty() {
            let merged = format!("{}{}", parts.pop().unwrap_or_default(), current);
            parts.push(merged);
        } else {
            parts.push(current);
        }
    }
    if parts.is_empty() {
        parts.push(word.to_string());
    }
    parts
}
