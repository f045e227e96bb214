//! # restream-cli: streaming agent
//!
//! Runs the `restream-core` pipeline end to end without real hardware:
//! a synthetic capture source feeds NV21 frames and PCM chunks, the
//! software codec encodes them, and the sender streams the result to a
//! framed TCP endpoint (or discards it for `null://`).
//!
//! ## Modules
//!
//! - **config**: sectioned TOML configuration with defaults
//! - **capture**: synthetic camera and microphone
//! - **muxer**: `FramedTcpMuxer` and `NullMuxer`
//! - **service**: session supervision, events and stats reporting

pub mod capture;
pub mod config;
pub mod muxer;
pub mod service;
