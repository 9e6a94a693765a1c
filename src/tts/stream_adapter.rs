//! Streaming facade over chunked-only TTS providers.
//!
//! Incoming text is shaped by a sentence stream; each produced sentence is
//! synthesized end-to-end. The last frame of each sentence is re-tagged
//! `is_final` so downstream consumers can detect sentence boundaries.

use std::sync::Arc;

use async_trait::async_trait;

use super::{
    ChunkedStream, SynthesizeIo, SynthesizeSession, SynthesizeStream, TextToSpeech,
    TtsCapabilities, TtsInput,
};
use crate::error::Result;
use crate::tokenize::SentenceTokenizer;
use crate::types::ApiConnectOptions;

/// Adapts a non-streaming [`TextToSpeech`] to the streaming interface.
pub struct StreamAdapter {
    inner: Arc<dyn TextToSpeech>,
    sentence_tokenizer: Arc<dyn SentenceTokenizer>,
    label: String,
}

impl StreamAdapter {
    /// Wrap a chunked-only provider.
    pub fn new(inner: Arc<dyn TextToSpeech>, sentence_tokenizer: Arc<dyn SentenceTokenizer>) -> Self {
        let label = format!("stream-adapter({})", inner.label());
        Self {
            inner,
            sentence_tokenizer,
            label,
        }
    }
}

impl TextToSpeech for StreamAdapter {
    fn label(&self) -> &str {
        &self.label
    }

    fn sample_rate(&self) -> u32 {
        self.inner.sample_rate()
    }

    fn num_channels(&self) -> u32 {
        self.inner.num_channels()
    }

    fn capabilities(&self) -> TtsCapabilities {
        TtsCapabilities { streaming: true }
    }

    fn synthesize(&self, text: &str, conn_options: ApiConnectOptions) -> ChunkedStream {
        self.inner.synthesize(text, conn_options)
    }

    fn stream(&self, conn_options: ApiConnectOptions) -> SynthesizeStream {
        SynthesizeStream::spawn(
            &self.label,
            // retries happen inside the wrapped synthesize() calls
            ApiConnectOptions {
                max_retry: 0,
                ..conn_options
            },
            Arc::new(AdapterSession {
                inner: Arc::clone(&self.inner),
                sentence_tokenizer: Arc::clone(&self.sentence_tokenizer),
                conn_options,
            }),
        )
    }
}

struct AdapterSession {
    inner: Arc<dyn TextToSpeech>,
    sentence_tokenizer: Arc<dyn SentenceTokenizer>,
    conn_options: ApiConnectOptions,
}

#[async_trait]
impl SynthesizeSession for AdapterSession {
    async fn attempt(&self, io: &SynthesizeIo) -> Result<()> {
        let (mut sink, mut sentences) = self.sentence_tokenizer.stream().split();

        let forward_input = async {
            while let Some(input) = io.recv().await {
                match input {
                    TtsInput::Text(text) => sink.push_text(&text),
                    TtsInput::Flush => sink.flush(),
                }
            }
            sink.end_input();
            Ok::<(), crate::error::AgentError>(())
        };

        let synthesize = async {
            while let Some(sentence) = sentences.next().await {
                let mut chunked = self.inner.synthesize(&sentence.token, self.conn_options);
                let mut last = None;
                while let Some(audio) = chunked.next().await {
                    let audio = audio?;
                    if let Some(prev) = last.replace(audio) {
                        io.send(prev)?;
                    }
                }
                if let Some(mut audio) = last {
                    audio.is_final = true;
                    io.send(audio)?;
                }
            }
            Ok(())
        };

        tokio::try_join!(forward_input, synthesize)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioFrame;
    use crate::error::AgentError;
    use crate::tokenize::basic::BasicSentenceTokenizer;
    use crate::tts::{ChunkedSession, SynthesizedAudio, TtsIo};
    use crate::types::short_id;

    /// Chunked-only provider emitting two frames per synthesize call.
    struct ChunkedOnly;

    struct ChunkedOnlySession {
        text: String,
    }

    #[async_trait]
    impl ChunkedSession for ChunkedOnlySession {
        async fn attempt(&self, io: &TtsIo) -> Result<()> {
            let request_id = short_id("req");
            let segment_id = short_id("seg");
            for _ in 0..2 {
                io.send(SynthesizedAudio {
                    request_id: request_id.clone(),
                    segment_id: segment_id.clone(),
                    frame: AudioFrame::silence(24_000, 1, 240),
                    is_final: false,
                })?;
            }
            if self.text.is_empty() {
                return Err(AgentError::Tts("empty text".into()));
            }
            Ok(())
        }
    }

    impl TextToSpeech for ChunkedOnly {
        fn label(&self) -> &str {
            "chunked-only"
        }

        fn sample_rate(&self) -> u32 {
            24_000
        }

        fn num_channels(&self) -> u32 {
            1
        }

        fn capabilities(&self) -> TtsCapabilities {
            TtsCapabilities { streaming: false }
        }

        fn synthesize(&self, text: &str, conn_options: ApiConnectOptions) -> ChunkedStream {
            ChunkedStream::spawn(
                self.label(),
                conn_options,
                Arc::new(ChunkedOnlySession { text: text.into() }),
            )
        }

        fn stream(&self, conn_options: ApiConnectOptions) -> SynthesizeStream {
            StreamAdapter::new(Arc::new(Self), Arc::new(BasicSentenceTokenizer::default()))
                .stream(conn_options)
        }
    }

    #[tokio::test]
    async fn sentence_boundaries_mark_final_frames() {
        let adapter = StreamAdapter::new(
            Arc::new(ChunkedOnly),
            Arc::new(BasicSentenceTokenizer::new(5)),
        );
        assert!(adapter.capabilities().streaming);

        let mut stream = adapter.stream(ApiConnectOptions::default());
        stream.push_text("This is sentence one. And this is sentence two.");
        stream.end_input();

        let mut frames = Vec::new();
        while let Some(audio) = stream.next().await {
            match audio {
                Ok(a) => frames.push(a),
                Err(e) => unreachable!("unexpected error: {e}"),
            }
        }
        // two sentences, two frames each, last of each pair re-tagged final
        assert_eq!(frames.len(), 4);
        assert!(!frames[0].is_final);
        assert!(frames[1].is_final);
        assert!(!frames[2].is_final);
        assert!(frames[3].is_final);
    }

    #[tokio::test]
    async fn wrapped_synthesize_passes_through() {
        let adapter = StreamAdapter::new(
            Arc::new(ChunkedOnly),
            Arc::new(BasicSentenceTokenizer::default()),
        );
        let mut chunked = adapter.synthesize("hello there", ApiConnectOptions::default());
        let mut count = 0;
        while let Some(audio) = chunked.next().await {
            assert!(audio.is_ok());
            count += 1;
        }
        assert_eq!(count, 2);
    }
}
