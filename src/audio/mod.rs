//! Audio frame types shared by every pipeline stage.

mod decoder;

pub use decoder::StreamDecoder;

use std::sync::Arc;
use std::time::Duration;

/// A chunk of PCM audio moving through the pipeline.
///
/// Samples are interleaved f32 in `[-1, 1]`. Frames are cheap to clone; the
/// sample buffer is shared.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Interleaved samples, `samples_per_channel * num_channels` long.
    pub data: Arc<Vec<f32>>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Number of channels (1 = mono).
    pub num_channels: u32,
    /// Samples per channel in this frame.
    pub samples_per_channel: u32,
}

impl AudioFrame {
    /// Create a frame from interleaved samples.
    ///
    /// # Errors
    ///
    /// Returns an error if the sample count is not a multiple of
    /// `num_channels` or the channel count is zero.
    pub fn new(data: Vec<f32>, sample_rate: u32, num_channels: u32) -> crate::error::Result<Self> {
        if num_channels == 0 {
            return Err(crate::error::AgentError::Audio(
                "frame must have at least one channel".into(),
            ));
        }
        if data.len() % num_channels as usize != 0 {
            return Err(crate::error::AgentError::Audio(format!(
                "sample count {} is not a multiple of {} channels",
                data.len(),
                num_channels
            )));
        }
        let samples_per_channel = (data.len() / num_channels as usize) as u32;
        Ok(Self {
            data: Arc::new(data),
            sample_rate,
            num_channels,
            samples_per_channel,
        })
    }

    /// A frame of silence with the given shape.
    pub fn silence(sample_rate: u32, num_channels: u32, samples_per_channel: u32) -> Self {
        Self {
            data: Arc::new(vec![0.0; (samples_per_channel * num_channels) as usize]),
            sample_rate,
            num_channels,
            samples_per_channel,
        }
    }

    /// Wall-clock duration of this frame.
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(f64::from(self.samples_per_channel) / f64::from(self.sample_rate))
    }

    /// A copy of this frame with every sample scaled by `gain`.
    ///
    /// Used by the playout path for volume ducking.
    pub fn scaled(&self, gain: f32) -> Self {
        if (gain - 1.0).abs() < f32::EPSILON {
            return self.clone();
        }
        Self {
            data: Arc::new(self.data.iter().map(|s| s * gain).collect()),
            sample_rate: self.sample_rate,
            num_channels: self.num_channels,
            samples_per_channel: self.samples_per_channel,
        }
    }
}

/// Total duration of a sequence of frames.
pub fn combined_duration(frames: &[AudioFrame]) -> Duration {
    frames.iter().map(AudioFrame::duration).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_duration() {
        let frame = AudioFrame::silence(16_000, 1, 1600);
        assert_eq!(frame.duration(), Duration::from_millis(100));
    }

    #[test]
    fn new_rejects_ragged_interleave() {
        assert!(AudioFrame::new(vec![0.0; 3], 48_000, 2).is_err());
        assert!(AudioFrame::new(vec![0.0; 4], 48_000, 2).is_ok());
        assert!(AudioFrame::new(vec![0.0; 4], 48_000, 0).is_err());
    }

    #[test]
    fn scaling_applies_gain() {
        let frame = AudioFrame::new(vec![0.5, -0.5], 24_000, 1);
        let frame = match frame {
            Ok(f) => f,
            Err(_) => unreachable!("valid frame"),
        };
        let half = frame.scaled(0.5);
        assert_eq!(half.data.as_slice(), &[0.25, -0.25]);
        // unity gain shares the buffer
        let same = frame.scaled(1.0);
        assert!(Arc::ptr_eq(&frame.data, &same.data));
    }

    #[test]
    fn combined_duration_sums() {
        let frames = vec![
            AudioFrame::silence(16_000, 1, 800),
            AudioFrame::silence(16_000, 1, 800),
        ];
        assert_eq!(combined_duration(&frames), Duration::from_millis(100));
    }
}
