//! Pipeline configuration.
//!
//! [`StreamConfig`] is supplied once, at
//! [`StreamClient::prepare`](crate::client::StreamClient::prepare) time,
//! and is immutable afterwards except for the runtime knobs the client
//! exposes explicitly (bit rate and fps).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::color::{CameraDirection, CameraFacing, ColorFormat};
use crate::error::StreamError;

/// How the preview sink is expected to draw frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderingMode {
    /// Blit NV21 straight into a native window.
    #[default]
    NativeWindow,
    /// Upload as textures and draw with OpenGL ES.
    OpenGles,
}

// ── StreamConfig ─────────────────────────────────────────────────

/// Everything the pipeline needs to know before it starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub rendering_mode: RenderingMode,
    /// Encoded frame width in pixels (even).
    pub width: u32,
    /// Encoded frame height in pixels (even).
    pub height: u32,
    /// Target video bit rate in bits/second.
    pub bit_rate: u32,
    /// Number of raw-frame slots in the intake ring.
    pub video_buffer_queue_num: usize,
    /// Seconds between key frames.
    pub gop_seconds: u32,
    /// Scheduler tick rate.
    pub fps: u32,
    /// Maximum number of queued writes in the sender.
    pub sender_queue_length: usize,
    /// Layout delivered by the camera.
    pub preview_color_format: ColorFormat,
    /// Layout expected by the video encoder.
    pub encoder_color_format: ColorFormat,
    pub back_camera_direction: CameraDirection,
    pub front_camera_direction: CameraDirection,
    pub audio: AudioConfig,
    /// Longest the scheduler waits for the filter lock, in milliseconds.
    pub filter_lock_timeout_ms: u64,
}

/// Audio encoder settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// AAC object type (2 = LC).
    pub profile: u8,
    pub sample_rate: u32,
    pub channel_count: u8,
    pub bit_rate: u32,
    /// Largest PCM chunk accepted per encoder input buffer.
    pub max_input_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            rendering_mode: RenderingMode::NativeWindow,
            width: 640,
            height: 480,
            bit_rate: 500 * 1024,
            video_buffer_queue_num: 5,
            gop_seconds: 2,
            fps: 30,
            sender_queue_length: 150,
            preview_color_format: ColorFormat::Nv21,
            encoder_color_format: ColorFormat::Yuv420SemiPlanar,
            back_camera_direction: CameraDirection::empty(),
            front_camera_direction: CameraDirection::FLIP_HORIZONTAL,
            audio: AudioConfig::default(),
            filter_lock_timeout_ms: 3,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            profile: 2,
            sample_rate: 44_100,
            channel_count: 1,
            bit_rate: 32 * 1024,
            max_input_size: 8820,
        }
    }
}

impl StreamConfig {
    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), StreamError> {
        if self.width == 0 || self.height == 0 {
            return Err(StreamError::InvalidConfig("video size must be non-zero"));
        }
        if self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(StreamError::InvalidConfig("video size must be even"));
        }
        if self.fps == 0 || self.fps > 1000 {
            return Err(StreamError::InvalidConfig("fps must be within 1..=1000"));
        }
        if self.video_buffer_queue_num == 0 {
            return Err(StreamError::InvalidConfig(
                "video_buffer_queue_num must be at least 1",
            ));
        }
        if self.sender_queue_length == 0 {
            return Err(StreamError::InvalidConfig(
                "sender_queue_length must be at least 1",
            ));
        }
        if self.preview_color_format == ColorFormat::Yuv420Planar {
            return Err(StreamError::InvalidConfig(
                "preview_color_format must be semi-planar",
            ));
        }
        if self.audio.sample_rate == 0 || self.audio.channel_count == 0 {
            return Err(StreamError::InvalidConfig(
                "audio sample rate and channel count must be non-zero",
            ));
        }
        Ok(())
    }

    /// Scheduler tick interval: `1000 / fps` milliseconds.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(1000 / self.fps.max(1) as u64)
    }

    /// Size of one raw NV21 frame.
    pub fn frame_size(&self) -> usize {
        ColorFormat::Nv21.buffer_size(self.width, self.height)
    }

    pub fn filter_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.filter_lock_timeout_ms)
    }

    /// Orientation mask for the given camera.
    pub fn direction_for(&self, facing: CameraFacing) -> CameraDirection {
        match facing {
            CameraFacing::Back => self.back_camera_direction,
            CameraFacing::Front => self.front_camera_direction,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
