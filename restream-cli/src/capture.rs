//! Synthetic capture source.
//!
//! Stands in for a camera and a microphone: one thread produces NV21
//! test-pattern frames at the capture rate and 16-bit PCM sine chunks at
//! the audio chunk rate, and pushes both into the [`StreamClient`].

use std::f32::consts::TAU;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use restream_core::{CameraFacing, StreamClient};

/// Frequency of the generated tone.
const TONE_HZ: f32 = 440.0;

/// Counters for what the source produced and what the pipeline took.
#[derive(Debug, Default)]
pub struct CaptureCounters {
    pub frames: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub chunks: AtomicU64,
    pub chunks_dropped: AtomicU64,
}

/// Settings for [`SyntheticSource::spawn`].
#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub sample_rate: u32,
    pub channel_count: u8,
    pub chunk_bytes: usize,
    pub camera: CameraFacing,
    /// Frames between camera switches (0 = never).
    pub switch_every: u64,
}

pub struct SyntheticSource {
    running: Arc<AtomicBool>,
    counters: Arc<CaptureCounters>,
    worker: Option<JoinHandle<()>>,
}

impl SyntheticSource {
    pub fn spawn(client: Arc<StreamClient>, settings: SourceSettings) -> std::io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let counters = Arc::new(CaptureCounters::default());
        let worker = {
            let running = Arc::clone(&running);
            let counters = Arc::clone(&counters);
            thread::Builder::new()
                .name("synthetic-capture".into())
                .spawn(move || produce(&client, &settings, &running, &counters))?
        };
        Ok(Self {
            running,
            counters,
            worker: Some(worker),
        })
    }

    pub fn counters(&self) -> Arc<CaptureCounters> {
        Arc::clone(&self.counters)
    }

    /// Stop producing and wait for the thread.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("capture thread panicked");
            }
        }
    }
}

impl Drop for SyntheticSource {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── Generators ───────────────────────────────────────────────────

/// Diagonal luma ramp that scrolls with `frame`, neutral chroma.
pub fn test_pattern(buf: &mut [u8], width: u32, height: u32, frame: u64) {
    let (w, h) = (width as usize, height as usize);
    let shift = (frame * 4) as usize;
    for y in 0..h {
        for x in 0..w {
            buf[y * w + x] = ((x + y + shift) & 0xFF) as u8;
        }
    }
    buf[w * h..].fill(0x80);
}

/// Mono or interleaved stereo 16-bit little-endian sine chunk.
pub fn sine_chunk(buf: &mut [u8], sample_rate: u32, channels: u8, phase: &mut f32) {
    let step = TAU * TONE_HZ / sample_rate.max(1) as f32;
    let frame_bytes = 2 * channels.max(1) as usize;
    for frame in buf.chunks_exact_mut(frame_bytes) {
        let sample = ((*phase).sin() * i16::MAX as f32 * 0.25) as i16;
        for ch in frame.chunks_exact_mut(2) {
            ch.copy_from_slice(&sample.to_le_bytes());
        }
        *phase = (*phase + step) % TAU;
    }
}

// ── Capture thread ───────────────────────────────────────────────

fn produce(
    client: &StreamClient,
    settings: &SourceSettings,
    running: &AtomicBool,
    counters: &CaptureCounters,
) {
    let frame_len = client.config().frame_size();
    let mut frame = vec![0u8; frame_len];
    let mut pcm = vec![0u8; settings.chunk_bytes];
    let mut phase = 0.0f32;

    let frame_every = Duration::from_secs_f64(1.0 / settings.fps.max(1) as f64);
    let bytes_per_sec = settings.sample_rate as f64 * settings.channel_count.max(1) as f64 * 2.0;
    let chunk_every = Duration::from_secs_f64(settings.chunk_bytes as f64 / bytes_per_sec.max(1.0));

    let start = Instant::now();
    let mut next_frame = start;
    let mut next_chunk = start;
    let mut frame_no = 0u64;
    let mut facing = settings.camera;
    client.switch_camera(facing);

    while running.load(Ordering::SeqCst) {
        let now = Instant::now();

        if now >= next_frame {
            test_pattern(&mut frame, settings.width, settings.height, frame_no);
            match client.queue_video(&frame) {
                Ok(true) => {
                    counters.frames.fetch_add(1, Ordering::Relaxed);
                }
                Ok(false) => {
                    counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!(error = %e, "frame rejected, stopping capture");
                    break;
                }
            }
            frame_no += 1;
            next_frame += frame_every;

            if settings.switch_every > 0 && frame_no % settings.switch_every == 0 {
                facing = match facing {
                    CameraFacing::Back => CameraFacing::Front,
                    CameraFacing::Front => CameraFacing::Back,
                };
                client.switch_camera(facing);
            }
        }

        if now >= next_chunk {
            sine_chunk(&mut pcm, settings.sample_rate, settings.channel_count, &mut phase);
            if client.queue_audio(&pcm) {
                counters.chunks.fetch_add(1, Ordering::Relaxed);
            } else {
                counters.chunks_dropped.fetch_add(1, Ordering::Relaxed);
            }
            next_chunk += chunk_every;
        }

        let wake = next_frame.min(next_chunk);
        if let Some(wait) = wake.checked_duration_since(Instant::now()) {
            thread::sleep(wait.min(Duration::from_millis(50)));
        }
    }
    debug!(frames = frame_no, "capture thread finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_scrolls() {
        let mut a = vec![0u8; 24];
        let mut b = vec![0u8; 24];
        test_pattern(&mut a, 4, 4, 0);
        test_pattern(&mut b, 4, 4, 1);
        assert_ne!(a[..16], b[..16]);
        assert!(a[16..].iter().all(|v| *v == 0x80));
    }

    #[test]
    fn stereo_chunk_duplicates_channels() {
        let mut buf = vec![0u8; 16];
        let mut phase = 1.0;
        sine_chunk(&mut buf, 44_100, 2, &mut phase);
        assert_eq!(buf[0..2], buf[2..4]);
        assert_ne!(buf[0..2], [0, 0]);
    }
}
