//! # restream-core
//!
//! Real-time capture → encode → send pipeline for live streaming.
//!
//! This crate contains:
//! - **Intake**: `FrameSlotPool`, a drop-on-contention ring of raw frames
//! - **Filters**: `Filter` trait behind a bounded-wait `FilterGate`
//! - **Pacing**: `PacedScheduler`, fixed-rate video ticks on its own thread
//! - **Codecs**: `CodecSession` / `CodecFactory` boundary and a zstd
//!   `SoftwareCodecFactory`
//! - **Encoding**: `Encoder`, turning codec output into `AccessUnit`s
//! - **Sending**: `SenderQueue`, a backpressured FIFO in front of a `Muxer`
//! - **Client**: `StreamClient`, wiring all of the above
//! - **Error**: `StreamError`, typed, `thiserror`-based

pub mod audio;
pub mod client;
pub mod codec;
pub mod color;
pub mod config;
pub mod encoder;
pub mod error;
pub mod events;
pub mod filter;
pub mod frame;
pub mod meter;
pub mod scheduler;
pub mod sender;
pub mod slots;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use audio::AudioPipeline;
pub use client::{StreamClient, StreamStats};
pub use codec::{
    BufferFlags, CodecConfig, CodecFactory, CodecOutput, CodecSession, SoftwareCodecFactory,
};
pub use color::{CameraDirection, CameraFacing, ColorFormat};
pub use config::{AudioConfig, RenderingMode, StreamConfig};
pub use encoder::Encoder;
pub use error::{MuxerError, StreamError};
pub use events::{EventReceiver, EventSender, StreamEvent};
pub use filter::{Filter, FilterGate, FilterParams};
pub use frame::{AccessUnit, FlvDataCollector, MediaType};
pub use meter::{ByteSpeedometer, FrameRateMeter};
pub use scheduler::{PacedScheduler, PreviewInfo, PreviewSink, Screenshot};
pub use sender::{ConnectionState, Muxer, SenderQueue};
pub use slots::FrameSlotPool;
