//! Software fallback codec built on zstd.
//!
//! Produces the same shape of output a hardware encoder does: a format
//! change carrying codec-specific data, a codec-config buffer, then one
//! compressed buffer per input, with periodic key frames and an
//! end-of-stream marker when asked to flush. Useful on hosts without a
//! hardware encoder and as a deterministic backend for tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use super::{
    AudioCodecConfig, BufferFlags, CodecConfig, CodecFactory, CodecFormat, CodecOutput,
    CodecSession, EncodedBuffer, InputBuffer, VideoCodecConfig,
};
use crate::color::ColorFormat;
use crate::error::StreamError;

/// Input buffers per session.
const DEFAULT_INPUT_BUFFERS: usize = 4;

/// AAC sampling-frequency index table (ISO/IEC 14496-3).
const AAC_SAMPLE_RATES: [u32; 13] = [
    96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025,
    8_000, 7_350,
];

// ── Factory ──────────────────────────────────────────────────────

/// Creates [`SoftwareSession`]s.
#[derive(Debug, Clone)]
pub struct SoftwareCodecFactory {
    input_buffers: usize,
}

impl SoftwareCodecFactory {
    pub fn new() -> Self {
        Self {
            input_buffers: DEFAULT_INPUT_BUFFERS,
        }
    }

    pub fn with_input_buffers(input_buffers: usize) -> Self {
        Self {
            input_buffers: input_buffers.max(1),
        }
    }
}

impl Default for SoftwareCodecFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl CodecFactory for SoftwareCodecFactory {
    fn create(&self, config: &CodecConfig) -> Result<Arc<dyn CodecSession>, StreamError> {
        let session = SoftwareSession::new(config.clone(), self.input_buffers)?;
        Ok(Arc::new(session))
    }
}

// ── Session ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Configured,
    Running,
    Stopped,
    Released,
}

struct SessionState {
    phase: Phase,
    free_inputs: VecDeque<usize>,
    outputs: VecDeque<CodecOutput>,
    format_announced: bool,
    eos_queued: bool,
    next_output_index: usize,
    outstanding: usize,
    frames: u64,
    last_pts_us: i64,
    level: i32,
}

/// zstd-backed encoder session.
pub struct SoftwareSession {
    config: CodecConfig,
    csd: Vec<Bytes>,
    key_interval: u64,
    state: Mutex<SessionState>,
    input_ready: Condvar,
    output_ready: Condvar,
}

impl SoftwareSession {
    pub fn new(config: CodecConfig, input_buffers: usize) -> Result<Self, StreamError> {
        let (csd, key_interval, bit_rate) = match &config {
            CodecConfig::Video(v) => {
                if v.width == 0 || v.height == 0 || v.fps == 0 {
                    return Err(StreamError::CodecCreation(
                        "video size and fps must be non-zero".into(),
                    ));
                }
                let gop = (v.i_frame_interval.max(1) as u64) * v.fps as u64;
                (video_parameter_sets(v), gop, v.bit_rate)
            }
            CodecConfig::Audio(a) => {
                let asc = audio_specific_config(a)?;
                // Every AAC frame decodes on its own.
                (vec![asc], 1, a.bit_rate)
            }
        };
        if config.max_input_size() == 0 {
            return Err(StreamError::CodecCreation("max_input_size is zero".into()));
        }

        Ok(Self {
            config,
            csd,
            key_interval,
            state: Mutex::new(SessionState {
                phase: Phase::Configured,
                free_inputs: (0..input_buffers).collect(),
                outputs: VecDeque::new(),
                format_announced: false,
                eos_queued: false,
                next_output_index: 1,
                outstanding: 0,
                frames: 0,
                last_pts_us: 0,
                level: level_for(bit_rate),
            }),
            input_ready: Condvar::new(),
            output_ready: Condvar::new(),
        })
    }

    /// Output buffers handed out but not yet released.
    pub fn outstanding_outputs(&self) -> usize {
        self.state.lock().outstanding
    }

    fn push_buffer(&self, state: &mut SessionState, data: Bytes, pts_us: i64, flags: BufferFlags) {
        let index = state.next_output_index;
        // Index 0 is never used, matching hardware codecs where the
        // first output slot doubles as a status code.
        state.next_output_index = state.next_output_index % 1024 + 1;
        state.outstanding += 1;
        state.outputs.push_back(CodecOutput::Buffer(EncodedBuffer {
            index,
            data,
            presentation_time_us: pts_us,
            flags,
        }));
    }
}

impl CodecSession for SoftwareSession {
    fn start(&self) -> Result<(), StreamError> {
        let mut state = self.state.lock();
        match state.phase {
            Phase::Configured => {
                state.phase = Phase::Running;
                Ok(())
            }
            _ => Err(StreamError::Codec("session is not in configured state".into())),
        }
    }

    fn dequeue_input(&self, timeout: Duration) -> Option<InputBuffer> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.phase != Phase::Running || state.eos_queued {
                return None;
            }
            if let Some(index) = state.free_inputs.pop_front() {
                return Some(InputBuffer {
                    index,
                    capacity: self.config.max_input_size(),
                });
            }
            if self.input_ready.wait_until(&mut state, deadline).timed_out() {
                return None;
            }
        }
    }

    fn queue_input(
        &self,
        index: usize,
        data: &[u8],
        presentation_time_us: i64,
    ) -> Result<(), StreamError> {
        let data = &data[..data.len().min(self.config.max_input_size())];
        let level = {
            let state = self.state.lock();
            if state.phase != Phase::Running {
                return Err(StreamError::Codec("session not running".into()));
            }
            state.level
        };

        let compressed = zstd::encode_all(data, level)
            .map_err(|e| StreamError::Codec(format!("zstd encode failed: {e}")))?;

        let mut state = self.state.lock();
        state.free_inputs.push_back(index);
        self.input_ready.notify_one();
        if state.phase != Phase::Running {
            return Ok(());
        }

        let pts_us = presentation_time_us.max(state.last_pts_us);
        state.last_pts_us = pts_us;

        if !state.format_announced {
            state.format_announced = true;
            state.outputs.push_back(CodecOutput::FormatChanged(CodecFormat {
                csd: self.csd.clone(),
            }));
            let config: Vec<u8> = self.csd.iter().flat_map(|b| b.iter().copied()).collect();
            self.push_buffer(&mut state, Bytes::from(config), pts_us, BufferFlags::CODEC_CONFIG);
        }

        let mut flags = BufferFlags::empty();
        if state.frames % self.key_interval == 0 {
            flags |= BufferFlags::KEY_FRAME;
        }
        state.frames += 1;
        self.push_buffer(&mut state, Bytes::from(compressed), pts_us, flags);
        self.output_ready.notify_all();
        Ok(())
    }

    fn signal_end_of_stream(&self) {
        let mut state = self.state.lock();
        if state.eos_queued || state.phase != Phase::Running {
            return;
        }
        state.eos_queued = true;
        let pts = state.last_pts_us;
        self.push_buffer(&mut state, Bytes::new(), pts, BufferFlags::END_OF_STREAM);
        self.output_ready.notify_all();
        self.input_ready.notify_all();
    }

    fn dequeue_output(&self, timeout: Duration) -> CodecOutput {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.phase != Phase::Running {
                return CodecOutput::TryAgainLater;
            }
            if let Some(out) = state.outputs.pop_front() {
                return out;
            }
            if self.output_ready.wait_until(&mut state, deadline).timed_out() {
                return CodecOutput::TryAgainLater;
            }
        }
    }

    fn release_output(&self, _index: usize) {
        let mut state = self.state.lock();
        state.outstanding = state.outstanding.saturating_sub(1);
    }

    fn set_bit_rate(&self, bit_rate: u32) {
        let mut state = self.state.lock();
        state.level = level_for(bit_rate);
        debug!(bit_rate, level = state.level, "software codec bit rate changed");
    }

    fn stop(&self) {
        let mut state = self.state.lock();
        if state.phase == Phase::Running || state.phase == Phase::Configured {
            state.phase = Phase::Stopped;
        }
        self.output_ready.notify_all();
        self.input_ready.notify_all();
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.phase = Phase::Released;
        state.outputs.clear();
        state.free_inputs.clear();
        state.outstanding = 0;
        self.output_ready.notify_all();
        self.input_ready.notify_all();
    }
}

// ── Codec-specific data ──────────────────────────────────────────

/// Lower bit rates trade speed for a tighter compression level.
fn level_for(bit_rate: u32) -> i32 {
    match bit_rate {
        0..300_000 => 6,
        300_000..1_000_000 => 3,
        _ => 1,
    }
}

/// Annex-B style parameter sets: `csd-0` describes the picture, `csd-1`
/// the input layout and rate.
fn video_parameter_sets(v: &VideoCodecConfig) -> Vec<Bytes> {
    let mut sps = vec![0, 0, 0, 1, 0x67, v.profile, 0x00, 0x1F];
    sps.extend_from_slice(&(v.width as u16).to_be_bytes());
    sps.extend_from_slice(&(v.height as u16).to_be_bytes());

    let layout = match v.color_format {
        ColorFormat::Nv21 => 0,
        ColorFormat::Yuv420SemiPlanar => 1,
        ColorFormat::Yuv420Planar => 2,
    };
    let pps = vec![0, 0, 0, 1, 0x68, layout, v.fps.min(255) as u8];
    vec![Bytes::from(sps), Bytes::from(pps)]
}

/// Two-byte AudioSpecificConfig: object type, frequency index, channels.
fn audio_specific_config(a: &AudioCodecConfig) -> Result<Bytes, StreamError> {
    let freq_index = AAC_SAMPLE_RATES
        .iter()
        .position(|r| *r == a.sample_rate)
        .ok_or_else(|| {
            StreamError::CodecCreation(format!("unsupported sample rate {}", a.sample_rate))
        })?;
    if a.channel_count == 0 || a.channel_count > 7 {
        return Err(StreamError::CodecCreation(format!(
            "unsupported channel count {}",
            a.channel_count
        )));
    }
    let word: u16 =
        ((a.profile as u16 & 0x1F) << 11) | ((freq_index as u16) << 7) | ((a.channel_count as u16) << 3);
    Ok(Bytes::copy_from_slice(&word.to_be_bytes()))
}

// ── Tests ────────────────────────────────────────────────────────
