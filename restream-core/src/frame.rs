//! Access units: the uniform, timestamped packets that flow from the
//! encoders to the sender.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

// ── MediaType ────────────────────────────────────────────────────

/// Which elementary stream a unit belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaType {
    Audio,
    Video,
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
        }
    }
}

// ── AccessUnit ───────────────────────────────────────────────────

/// One independently transportable chunk of encoded media.
///
/// Immutable once built. Configuration units (codec-specific data such
/// as parameter sets or the AudioSpecificConfig) are never droppable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessUnit {
    /// Encoded bytes.
    pub payload: Bytes,
    /// Milliseconds since the first emitted sample of this stream.
    pub pts_ms: u32,
    pub media: MediaType,
    pub is_config: bool,
    pub is_key_frame: bool,
    /// Whether the sender may shed this unit under backpressure.
    pub droppable: bool,
}

impl AccessUnit {
    /// A codec configuration unit. Always timestamp 0, never droppable.
    pub fn config(media: MediaType, payload: Bytes) -> Self {
        Self {
            payload,
            pts_ms: 0,
            media,
            is_config: true,
            is_key_frame: media == MediaType::Video,
            droppable: false,
        }
    }

    /// A steady-state data unit produced by an encoder.
    pub fn data(media: MediaType, payload: Bytes, pts_ms: u32, is_key_frame: bool) -> Self {
        Self {
            payload,
            pts_ms,
            media,
            is_config: false,
            is_key_frame,
            droppable: true,
        }
    }

    /// Unencoded audio forwarded as-is (e.g. PCM passthrough sinks).
    pub fn raw_audio(payload: Bytes, pts_ms: u32) -> Self {
        Self::data(MediaType::Audio, payload, pts_ms, true)
    }

    /// Payload length in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

// ── FlvDataCollector ─────────────────────────────────────────────

/// Sink that encoders hand their access units to.
///
/// Called from encoder output threads; implementations must not block
/// for long.
pub trait FlvDataCollector: Send + Sync {
    fn collect(&self, unit: AccessUnit, source: MediaType);
}
