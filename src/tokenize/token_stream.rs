//! Buffered token stream shared by the sentence and word tokenizers.

use tokio::sync::mpsc;
use tracing::warn;

use super::{TokenData, TokenizeFn};
use crate::types::short_id;

/// Streaming tokenizer buffer.
///
/// Text is pushed in arbitrary chunks; tokens are emitted once an input
/// context threshold is met, and immediately when a period arrives. Exactly
/// one incomplete trailing token is retained between pushes so tokens never
/// change after emission.
pub struct TokenStream {
    sink: TokenSink,
    rx: mpsc::UnboundedReceiver<TokenData>,
}

impl TokenStream {
    /// Create a stream over a tokenize function.
    ///
    /// `min_token_len` is the smallest emitted token length (periods bypass
    /// it); `min_ctx_len` is how much buffered input is required before
    /// tokenization runs at all.
    pub fn new(tokenize: TokenizeFn, min_token_len: usize, min_ctx_len: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            sink: TokenSink {
                tokenize,
                min_token_len,
                min_ctx_len,
                in_buf: String::new(),
                out_buf: String::new(),
                segment_id: short_id("seg"),
                tx: Some(tx),
            },
            rx,
        }
    }

    /// Push a chunk of input text.
    pub fn push_text(&mut self, text: &str) {
        self.sink.push_text(text);
    }

    /// Emit everything buffered and rotate the segment id.
    pub fn flush(&mut self) {
        self.sink.flush();
    }

    /// Flush and close the stream; no more text may be pushed.
    pub fn end_input(&mut self) {
        self.sink.end_input();
    }

    /// Next emitted token, or `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<TokenData> {
        self.rx.recv().await
    }

    /// Split into independently owned push and receive halves.
    pub fn split(self) -> (TokenSink, TokenReceiver) {
        (self.sink, TokenReceiver { rx: self.rx })
    }
}

/// Receive half of a split [`TokenStream`].
pub struct TokenReceiver {
    rx: mpsc::UnboundedReceiver<TokenData>,
}

impl TokenReceiver {
    /// Next emitted token, or `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<TokenData> {
        self.rx.recv().await
    }
}

/// Push half of a split [`TokenStream`].
pub struct TokenSink {
    tokenize: TokenizeFn,
    min_token_len: usize,
    min_ctx_len: usize,
    in_buf: String,
    out_buf: String,
    segment_id: String,
    tx: Option<mpsc::UnboundedSender<TokenData>>,
}

impl TokenSink {
    /// Push a chunk of input text.
    pub fn push_text(&mut self, text: &str) {
        if self.tx.is_none() {
            warn!("push_text on a closed token stream");
            return;
        }

        // A period is the strongest flush signal: split at the first one,
        // force-process everything up to it, then continue with the rest.
        if let Some(idx) = text.find('.') {
            self.in_buf.push_str(&text[..=idx]);
            self.process_buffer(true);
            if idx + 1 < text.len() {
                self.push_text(&text[idx + 1..]);
            }
            return;
        }

        self.in_buf.push_str(text);
        if self.in_buf.len() < self.min_ctx_len {
            return;
        }
        self.process_buffer(false);
    }

    /// Emit everything buffered and rotate the segment id.
    pub fn flush(&mut self) {
        if self.tx.is_none() {
            warn!("flush on a closed token stream");
            return;
        }

        if !self.in_buf.is_empty() || !self.out_buf.is_empty() {
            let tokens = (self.tokenize)(&self.in_buf);
            if !tokens.is_empty() {
                if !self.out_buf.is_empty() {
                    self.out_buf.push(' ');
                }
                self.out_buf.push_str(&tokens.join(" "));
            }

            self.emit();
            self.segment_id = short_id("seg");
        }

        self.in_buf.clear();
        self.out_buf.clear();
    }

    /// Flush and close the stream.
    pub fn end_input(&mut self) {
        self.flush();
        self.tx = None;
    }

    /// Whether the stream has been closed.
    pub fn closed(&self) -> bool {
        self.tx.is_none()
    }

    fn process_buffer(&mut self, force: bool) {
        if !force && self.in_buf.len() < self.min_ctx_len {
            return;
        }

        loop {
            let tokens = (self.tokenize)(&self.in_buf);
            if tokens.len() <= 1 && !force {
                // keep the trailing incomplete token until more context arrives
                break;
            }
            if tokens.is_empty() {
                break;
            }

            if tokens.len() == 1 {
                // forced: consume the final token and drain the input
                self.push_out(&tokens[0]);
                self.maybe_emit();
                self.in_buf.clear();
                break;
            }

            let tok = tokens.into_iter().next().unwrap_or_default();
            self.push_out(&tok);
            self.maybe_emit();

            let start = self.in_buf.find(tok.as_str()).unwrap_or(0);
            self.in_buf = self.in_buf[start + tok.len()..].trim_start().to_string();
        }
    }

    fn push_out(&mut self, token: &str) {
        if !self.out_buf.is_empty() {
            self.out_buf.push(' ');
        }
        self.out_buf.push_str(token);
    }

    fn maybe_emit(&mut self) {
        if self.out_buf.contains('.') || self.out_buf.len() >= self.min_token_len {
            self.emit();
        }
    }

    fn emit(&mut self) {
        // pathological all-period input can leave the output buffer blank
        if self.out_buf.trim().is_empty() {
            self.out_buf.clear();
            return;
        }
        if let Some(tx) = &self.tx {
            let _ = tx.send(TokenData {
                token: std::mem::take(&mut self.out_buf),
                segment_id: self.segment_id.clone(),
            });
        }
    }
}
