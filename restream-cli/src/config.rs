//! Configuration for the streaming agent.

use std::path::Path;

use serde::{Deserialize, Serialize};

use restream_core::{AudioConfig, CameraFacing, ColorFormat, StreamConfig};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Destination and sender settings.
    pub stream: StreamSection,
    /// Video encoder settings.
    pub video: VideoSection,
    /// Audio encoder settings.
    pub audio: AudioSection,
    /// Synthetic capture source.
    pub capture: CaptureSection,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Destination and sender settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSection {
    /// `tcp://host:port`, `rtmp://host:port/app` or `null://`.
    pub url: String,
    /// Maximum queued writes in the sender.
    pub sender_queue_length: usize,
    /// Longest the scheduler waits for the filter lock (ms).
    pub filter_lock_timeout_ms: u64,
}

/// Video encoder settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoSection {
    pub width: u32,
    pub height: u32,
    /// Scheduler tick rate.
    pub fps: u32,
    /// Bits per second.
    pub bit_rate: u32,
    /// Seconds between key frames.
    pub gop_seconds: u32,
    /// Raw-frame slots between capture and scheduler.
    pub buffer_queue_num: usize,
    pub encoder_color_format: ColorFormat,
}

/// Audio encoder settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSection {
    pub sample_rate: u32,
    pub channel_count: u8,
    /// Bits per second.
    pub bit_rate: u32,
    /// Duration of one PCM chunk (ms).
    pub chunk_ms: u32,
}

/// Synthetic capture source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSection {
    /// Camera frames produced per second. May differ from `video.fps`.
    pub fps: u32,
    pub camera: CameraFacing,
    /// Frames between camera switches (0 = never).
    pub switch_every: u64,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Seconds between stats lines (0 = off).
    pub stats_interval_secs: u64,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for StreamSection {
    fn default() -> Self {
        Self {
            url: "null://".into(),
            sender_queue_length: 150,
            filter_lock_timeout_ms: 3,
        }
    }
}

impl Default for VideoSection {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30,
            bit_rate: 500 * 1024,
            gop_seconds: 2,
            buffer_queue_num: 5,
            encoder_color_format: ColorFormat::Yuv420SemiPlanar,
        }
    }
}

impl Default for AudioSection {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            channel_count: 1,
            bit_rate: 32 * 1024,
            chunk_ms: 20,
        }
    }
}

impl Default for CaptureSection {
    fn default() -> Self {
        Self {
            fps: 30,
            camera: CameraFacing::Back,
            switch_every: 0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            stats_interval_secs: 2,
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl AgentConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Bytes of 16-bit PCM in one audio chunk.
    pub fn audio_chunk_bytes(&self) -> usize {
        let samples = self.audio.sample_rate as usize * self.audio.chunk_ms.clamp(5, 200) as usize / 1000;
        samples * self.audio.channel_count.max(1) as usize * 2
    }

    /// Convert into the pipeline's [`StreamConfig`], clamping values the
    /// pipeline would reject.
    pub fn to_stream_config(&self) -> StreamConfig {
        let even = |v: u32| (v.clamp(2, 4096) / 2) * 2;
        StreamConfig {
            width: even(self.video.width),
            height: even(self.video.height),
            fps: self.video.fps.clamp(1, 60),
            bit_rate: self.video.bit_rate.max(16 * 1024),
            gop_seconds: self.video.gop_seconds.clamp(1, 10),
            video_buffer_queue_num: self.video.buffer_queue_num.clamp(2, 16),
            sender_queue_length: self.stream.sender_queue_length.max(3),
            encoder_color_format: self.video.encoder_color_format,
            filter_lock_timeout_ms: self.stream.filter_lock_timeout_ms.min(20),
            audio: AudioConfig {
                sample_rate: self.audio.sample_rate,
                channel_count: self.audio.channel_count.clamp(1, 2),
                bit_rate: self.audio.bit_rate,
                max_input_size: self.audio_chunk_bytes(),
                ..AudioConfig::default()
            },
            ..StreamConfig::default()
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let text = toml::to_string_pretty(&AgentConfig::default()).unwrap();
        assert!(text.contains("[video]"));
        assert!(text.contains("sender_queue_length"));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let cfg: AgentConfig = toml::from_str("[video]\nfps = 15\n").unwrap();
        assert_eq!(cfg.video.fps, 15);
        assert_eq!(cfg.video.width, 640);
        assert_eq!(cfg.stream.url, "null://");
    }

    #[test]
    fn to_stream_config_clamps() {
        let mut cfg = AgentConfig::default();
        cfg.video.fps = 120;
        cfg.video.width = 641;
        cfg.stream.sender_queue_length = 0;
        let stream = cfg.to_stream_config();
        assert_eq!(stream.fps, 60);
        assert_eq!(stream.width, 640);
        assert_eq!(stream.sender_queue_length, 3);
        stream.validate().unwrap();
    }

    #[test]
    fn chunk_size_follows_rate() {
        let cfg = AgentConfig::default();
        // 20 ms of mono 16-bit at 44.1 kHz.
        assert_eq!(cfg.audio_chunk_bytes(), 882 * 2);
        assert_eq!(cfg.to_stream_config().audio.max_input_size, 1764);
    }
}
