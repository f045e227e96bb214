//! Codec session boundary.
//!
//! An encoder session is an opaque object that accepts raw input
//! buffers and produces encoded output buffers asynchronously. Platform
//! backends (hardware encoders, software fallbacks) implement
//! [`CodecSession`] and are created through a [`CodecFactory`] chosen at
//! setup time.
//!
//! Contract every backend must honour:
//!
//! - `dequeue_output` returns within its timeout (liveness under polling);
//! - exactly one [`CodecOutput::FormatChanged`] precedes steady-state
//!   output buffers;
//! - presentation timestamps of output buffers are monotonic.

pub mod software;

use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use bytes::{Bytes, BytesMut};

use crate::color::ColorFormat;
use crate::config::StreamConfig;
use crate::error::StreamError;
use crate::frame::MediaType;

pub use software::{SoftwareCodecFactory, SoftwareSession};

// ── Configuration records ────────────────────────────────────────

/// Video encoder settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoCodecConfig {
    /// AVC profile indication (66 = baseline).
    pub profile: u8,
    pub width: u32,
    pub height: u32,
    pub color_format: ColorFormat,
    pub bit_rate: u32,
    pub fps: u32,
    /// Seconds between I-frames.
    pub i_frame_interval: u32,
    pub max_input_size: usize,
}

impl VideoCodecConfig {
    pub fn from_stream(config: &StreamConfig) -> Self {
        Self {
            profile: 66,
            width: config.width,
            height: config.height,
            color_format: config.encoder_color_format,
            bit_rate: config.bit_rate,
            fps: config.fps,
            i_frame_interval: config.gop_seconds,
            max_input_size: config
                .encoder_color_format
                .buffer_size(config.width, config.height),
        }
    }
}

/// Audio encoder settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioCodecConfig {
    /// AAC object type.
    pub profile: u8,
    pub sample_rate: u32,
    pub channel_count: u8,
    pub bit_rate: u32,
    pub max_input_size: usize,
}

impl AudioCodecConfig {
    pub fn from_stream(config: &StreamConfig) -> Self {
        let audio = &config.audio;
        Self {
            profile: audio.profile,
            sample_rate: audio.sample_rate,
            channel_count: audio.channel_count,
            bit_rate: audio.bit_rate,
            max_input_size: audio.max_input_size,
        }
    }
}

/// Configuration record used to create a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecConfig {
    Video(VideoCodecConfig),
    Audio(AudioCodecConfig),
}

impl CodecConfig {
    pub fn media(&self) -> MediaType {
        match self {
            Self::Video(_) => MediaType::Video,
            Self::Audio(_) => MediaType::Audio,
        }
    }

    pub fn max_input_size(&self) -> usize {
        match self {
            Self::Video(v) => v.max_input_size,
            Self::Audio(a) => a.max_input_size,
        }
    }
}

// ── Session I/O types ────────────────────────────────────────────

bitflags! {
    /// Flags attached to an output buffer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BufferFlags: u32 {
        const KEY_FRAME     = 0b0001;
        const CODEC_CONFIG  = 0b0010;
        const END_OF_STREAM = 0b0100;
    }
}

/// An input buffer handed out by [`CodecSession::dequeue_input`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputBuffer {
    pub index: usize,
    pub capacity: usize,
}

/// An encoded buffer. Must be returned with
/// [`CodecSession::release_output`] once its bytes have been copied out.
#[derive(Debug, Clone)]
pub struct EncodedBuffer {
    pub index: usize,
    pub data: Bytes,
    pub presentation_time_us: i64,
    pub flags: BufferFlags,
}

/// Output format announced once before steady-state output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodecFormat {
    /// Codec-specific data blocks (`csd-0`, `csd-1`, …).
    pub csd: Vec<Bytes>,
}

impl CodecFormat {
    /// All codec-specific data concatenated, or `None` if there is none.
    pub fn config_data(&self) -> Option<Bytes> {
        match self.csd.as_slice() {
            [] => None,
            [only] => Some(only.clone()),
            blocks => {
                let mut out = BytesMut::with_capacity(blocks.iter().map(Bytes::len).sum());
                for block in blocks {
                    out.extend_from_slice(block);
                }
                Some(out.freeze())
            }
        }
    }
}

/// Result of polling a session for output.
#[derive(Debug, Clone)]
pub enum CodecOutput {
    /// Nothing ready within the timeout. Not an error.
    TryAgainLater,
    FormatChanged(CodecFormat),
    Buffer(EncodedBuffer),
}

// ── Traits ───────────────────────────────────────────────────────

/// A live encoder session.
///
/// Shared between one submitting thread and one output thread, so all
/// methods take `&self`.
pub trait CodecSession: Send + Sync {
    fn start(&self) -> Result<(), StreamError>;

    /// Wait up to `timeout` for a free input buffer.
    fn dequeue_input(&self, timeout: Duration) -> Option<InputBuffer>;

    /// Submit `data` (at most the buffer's capacity) in input buffer `index`.
    fn queue_input(&self, index: usize, data: &[u8], presentation_time_us: i64)
    -> Result<(), StreamError>;

    /// Ask the session to flush and emit an end-of-stream buffer.
    fn signal_end_of_stream(&self);

    /// Wait up to `timeout` for output.
    fn dequeue_output(&self, timeout: Duration) -> CodecOutput;

    fn release_output(&self, index: usize);

    /// Change the target bit rate of a running session.
    fn set_bit_rate(&self, bit_rate: u32);

    fn stop(&self);

    fn release(&self);
}

/// Creates sessions for one backend.
pub trait CodecFactory: Send + Sync {
    fn create(&self, config: &CodecConfig) -> Result<Arc<dyn CodecSession>, StreamError>;
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_data_concatenates_blocks() {
        let format = CodecFormat {
            csd: vec![Bytes::from_static(&[1, 2]), Bytes::from_static(&[3])],
        };
        assert_eq!(format.config_data().unwrap().as_ref(), &[1, 2, 3]);
        assert!(CodecFormat::default().config_data().is_none());
    }

    #[test]
    fn video_config_follows_stream_config() {
        let stream = StreamConfig::default();
        let cfg = VideoCodecConfig::from_stream(&stream);
        assert_eq!(cfg.max_input_size, 640 * 480 * 3 / 2);
        assert_eq!(cfg.i_frame_interval, stream.gop_seconds);
        assert_eq!(CodecConfig::Video(cfg).media(), MediaType::Video);
    }
}
