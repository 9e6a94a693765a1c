//! Streaming compressed-audio decoder.
//!
//! Providers that return compressed audio (mp3, aac, wav containers) over the
//! network push raw bytes from their receive task; the decoder runs on a
//! blocking worker and emits PCM [`AudioFrame`]s. Input and decode sides are
//! decoupled by a thread-safe byte buffer with an explicit end-of-input
//! signal.

use std::collections::VecDeque;
use std::io::{Read, Seek, SeekFrom};
use std::sync::{Arc, Condvar, Mutex};

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tokio::sync::mpsc;
use tracing::debug;

use super::AudioFrame;
use crate::error::{AgentError, Result};

/// One decoder per provider stream. Push bytes from the network task, read
/// frames from the decode side, call [`end_input`](Self::end_input) when the
/// provider signals completion.
pub struct StreamDecoder {
    input: Arc<ByteBuffer>,
    frames: mpsc::UnboundedReceiver<Result<AudioFrame>>,
}

impl StreamDecoder {
    /// Start a decoder. `mime_hint` helps container probing when known
    /// (e.g. `"mp3"`).
    pub fn new(mime_hint: Option<&str>) -> Self {
        let input = Arc::new(ByteBuffer::default());
        let (tx, rx) = mpsc::unbounded_channel();

        let reader = ByteBufferReader(Arc::clone(&input));
        let mut hint = Hint::new();
        if let Some(ext) = mime_hint {
            hint.with_extension(ext);
        }

        tokio::task::spawn_blocking(move || decode_loop(reader, hint, &tx));

        Self { input, frames: rx }
    }

    /// Append compressed bytes. Safe to call from any thread.
    pub fn push(&self, data: &[u8]) {
        self.input.push(data);
    }

    /// Signal that no more bytes will be pushed. The decoder drains the
    /// buffer and then finishes.
    pub fn end_input(&self) {
        self.input.end();
    }

    /// Next decoded frame, or `None` once the stream is exhausted.
    pub async fn next(&mut self) -> Option<Result<AudioFrame>> {
        self.frames.recv().await
    }

    /// Abort decoding without waiting for remaining frames.
    pub fn close(&mut self) {
        self.input.end();
        self.frames.close();
    }
}

fn decode_loop(reader: ByteBufferReader, hint: Hint, tx: &mpsc::UnboundedSender<Result<AudioFrame>>) {
    let source = MediaSourceStream::new(Box::new(reader), Default::default());
    let probed = match symphonia::default::get_probe().format(
        &hint,
        source,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    ) {
        Ok(p) => p,
        Err(e) => {
            let _ = tx.send(Err(AgentError::Decode(format!("probe failed: {e}"))));
            return;
        }
    };

    let mut format = probed.format;
    let track = match format.default_track() {
        Some(t) => t,
        None => {
            let _ = tx.send(Err(AgentError::Decode("no audio track in stream".into())));
            return;
        }
    };
    let track_id = track.id;
    let mut decoder = match symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
    {
        Ok(d) => d,
        Err(e) => {
            let _ = tx.send(Err(AgentError::Decode(format!("unsupported codec: {e}"))));
            return;
        }
    };

    let mut sample_buf: Option<SampleBuffer<f32>> = None;
    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                debug!("audio stream decode finished");
                break;
            }
            Err(SymphoniaError::ResetRequired) => {
                // new stream parameters mid-flight, rebuild the decoder
                if let Some(t) = format.default_track() {
                    match symphonia::default::get_codecs()
                        .make(&t.codec_params, &DecoderOptions::default())
                    {
                        Ok(d) => {
                            decoder = d;
                            sample_buf = None;
                            continue;
                        }
                        Err(e) => {
                            let _ = tx
                                .send(Err(AgentError::Decode(format!("decoder reset failed: {e}"))));
                            break;
                        }
                    }
                }
                break;
            }
            Err(e) => {
                let _ = tx.send(Err(AgentError::Decode(format!("read failed: {e}"))));
                break;
            }
        };

        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                let buf = sample_buf.get_or_insert_with(|| {
                    SampleBuffer::<f32>::new(decoded.capacity() as u64, spec)
                });
                buf.copy_interleaved_ref(decoded);
                let frame = AudioFrame::new(
                    buf.samples().to_vec(),
                    spec.rate,
                    spec.channels.count() as u32,
                );
                let stop = match frame {
                    Ok(f) => tx.send(Ok(f)).is_err(),
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        true
                    }
                };
                if stop {
                    break;
                }
            }
            // decode errors on a single packet are recoverable, skip it
            Err(SymphoniaError::DecodeError(e)) => debug!("skipping bad packet: {e}"),
            Err(e) => {
                let _ = tx.send(Err(AgentError::Decode(format!("decode failed: {e}"))));
                break;
            }
        }
    }
}

/// Byte FIFO shared between the network side and the decode thread.
#[derive(Default)]
struct ByteBuffer {
    state: Mutex<ByteBufferState>,
    cond: Condvar,
}

#[derive(Default)]
struct ByteBufferState {
    buf: VecDeque<u8>,
    eof: bool,
}

impl ByteBuffer {
    fn push(&self, data: &[u8]) {
        if let Ok(mut state) = self.state.lock() {
            if state.eof {
                return;
            }
            state.buf.extend(data.iter().copied());
            self.cond.notify_one();
        }
    }

    fn end(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.eof = true;
            self.cond.notify_one();
        }
    }
}

/// Blocking reader over [`ByteBuffer`] for symphonia's probe/format layer.
struct ByteBufferReader(Arc<ByteBuffer>);

impl Read for ByteBufferReader {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        let mut state = self
            .0
            .state
            .lock()
            .map_err(|_| std::io::Error::other("byte buffer poisoned"))?;
        loop {
            if !state.buf.is_empty() {
                let n = out.len().min(state.buf.len());
                for slot in out.iter_mut().take(n) {
                    *slot = match state.buf.pop_front() {
                        Some(b) => b,
                        None => break,
                    };
                }
                return Ok(n);
            }
            if state.eof {
                return Ok(0);
            }
            state = self
                .0
                .cond
                .wait(state)
                .map_err(|_| std::io::Error::other("byte buffer poisoned"))?;
        }
    }
}

impl Seek for ByteBufferReader {
    fn seek(&mut self, _pos: SeekFrom) -> std::io::Result<u64> {
        Err(std::io::Error::other("stream decoder input is not seekable"))
    }
}

impl MediaSource for ByteBufferReader {
    fn is_seekable(&self) -> bool {
        false
    }

    fn byte_len(&self) -> Option<u64> {
        None
    }
}
