//! Streaming client: owns and wires every pipeline component.
//!
//! ```text
//!  camera ──queue_video──► FrameSlotPool ─► PacedScheduler ─► video Encoder ─┐
//!                                                                            ├─► SenderQueue ─► Muxer
//!  mic ────queue_audio──► AudioPipeline ───────────────────► audio Encoder ─┘
//! ```
//!
//! All components are created once in [`StreamClient::prepare`] and torn
//! down in [`StreamClient::destroy`]. Encoders are single-use and are
//! rebuilt for every streaming session.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::audio::{AUDIO_QUEUE_DEPTH, AudioPipeline};
use crate::codec::{AudioCodecConfig, CodecConfig, CodecFactory, VideoCodecConfig};
use crate::color::CameraFacing;
use crate::config::StreamConfig;
use crate::encoder::Encoder;
use crate::error::StreamError;
use crate::events::{self, EventReceiver};
use crate::filter::{Filter, FilterGate, FilterParams};
use crate::frame::FlvDataCollector;
use crate::scheduler::{PacedScheduler, PreviewSink, Screenshot};
use crate::sender::{Muxer, SenderQueue};
use crate::slots::FrameSlotPool;

// ── StreamStats ──────────────────────────────────────────────────

/// Point-in-time view of the pipeline's meters and counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamStats {
    pub streaming: bool,
    pub connection: String,
    pub scheduler: String,
    pub draw_fps: f32,
    pub send_fps: f32,
    /// Bytes/second, all media.
    pub total_speed: u64,
    pub video_speed: u64,
    pub audio_speed: u64,
    pub buffer_free_percent: f32,
    pub pending: usize,
    pub consecutive_errors: u32,
    pub dropped_full: u64,
    pub dropped_crowded: u64,
    pub audio_dropped: u64,
    pub written: u64,
}

struct Session {
    video: Arc<Encoder>,
    audio: Arc<Encoder>,
}

impl Session {
    fn quit(self) {
        self.video.quit();
        self.audio.quit();
    }
}

// ── StreamClient ─────────────────────────────────────────────────

pub struct StreamClient {
    config: StreamConfig,
    factory: Arc<dyn CodecFactory>,
    video_gate: Arc<FilterGate>,
    audio_gate: Arc<FilterGate>,
    scheduler: PacedScheduler,
    audio: AudioPipeline,
    sender: Arc<SenderQueue>,
    events: Mutex<Option<EventReceiver>>,
    session: Mutex<Option<Session>>,
    video_bit_rate: AtomicU32,
    destroyed: AtomicBool,
}

impl StreamClient {
    /// Validate `config` and build the pipeline. Nothing runs until
    /// preview or streaming starts.
    pub fn prepare(
        config: StreamConfig,
        factory: Arc<dyn CodecFactory>,
        muxer: Box<dyn Muxer>,
    ) -> Result<Self, StreamError> {
        config.validate()?;

        let toleration = config.filter_lock_timeout();
        let video_gate = Arc::new(FilterGate::new(
            FilterParams::Video {
                width: config.width,
                height: config.height,
            },
            toleration,
        ));
        let audio_gate = Arc::new(FilterGate::new(
            FilterParams::Audio {
                frame_size: config.audio.max_input_size,
            },
            toleration,
        ));

        let pool = Arc::new(FrameSlotPool::new(
            config.video_buffer_queue_num,
            config.frame_size(),
        ));
        let scheduler = PacedScheduler::spawn(&config, pool, Arc::clone(&video_gate))?;
        let audio = AudioPipeline::spawn(Arc::clone(&audio_gate), AUDIO_QUEUE_DEPTH)?;

        let (tx, rx) = events::channel();
        let sender = Arc::new(SenderQueue::spawn(
            config.sender_queue_length,
            config.width,
            config.height,
            muxer,
            tx,
        )?);

        info!(
            width = config.width,
            height = config.height,
            fps = config.fps,
            "stream client prepared"
        );
        Ok(Self {
            video_bit_rate: AtomicU32::new(config.bit_rate),
            config,
            factory,
            video_gate,
            audio_gate,
            scheduler,
            audio,
            sender,
            events: Mutex::new(Some(rx)),
            session: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    // ── Preview ──────────────────────────────────────────────────

    pub fn start_preview(&self, sink: Box<dyn PreviewSink>) {
        self.scheduler.start_preview(sink);
    }

    pub fn stop_preview(&self) {
        self.scheduler.stop_preview();
    }

    // ── Streaming ────────────────────────────────────────────────

    /// Open `url` and start both encoders.
    ///
    /// Encoder creation failures are returned and leave nothing running.
    /// Connection failures arrive later as
    /// [`StreamEvent::OpenConnectionResult`](crate::events::StreamEvent).
    pub fn start_streaming(&self, url: &str) -> Result<(), StreamError> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(StreamError::Released);
        }
        let mut session = self.session.lock();
        if session.is_some() {
            debug!("already streaming");
            return Ok(());
        }

        // Start is queued first so it flushes nothing the new encoders emit.
        self.sender.start(url);

        let collector: Arc<dyn FlvDataCollector> = self.sender.clone();
        let mut video_config = VideoCodecConfig::from_stream(&self.config);
        video_config.bit_rate = self.video_bit_rate.load(Ordering::Acquire);
        let audio_config = AudioCodecConfig::from_stream(&self.config);

        let built = self.build_encoder(&CodecConfig::Video(video_config), &collector).and_then(|video| {
            self.build_encoder(&CodecConfig::Audio(audio_config), &collector)
                .inspect_err(|_| video.quit())
                .map(|audio| Session { video, audio })
        });
        let new_session = match built {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to start encoders");
                self.sender.stop();
                return Err(e);
            }
        };

        self.scheduler.start_streaming(Arc::clone(&new_session.video));
        self.audio.start_streaming(Arc::clone(&new_session.audio));
        *session = Some(new_session);
        info!(%url, "streaming started");
        Ok(())
    }

    /// Stop both encoders and close the connection. No-op when idle.
    pub fn stop_streaming(&self) {
        let Some(session) = self.session.lock().take() else {
            return;
        };
        self.scheduler.stop_streaming();
        self.audio.stop_streaming();
        session.quit();
        self.sender.stop();
        info!("streaming stopped");
    }

    pub fn is_streaming(&self) -> bool {
        self.session.lock().is_some()
    }

    // ── Capture intake ───────────────────────────────────────────

    /// Offer one camera frame. `Ok(false)` means it was dropped.
    pub fn queue_video(&self, frame: &[u8]) -> Result<bool, StreamError> {
        self.scheduler.queue_video(frame)
    }

    /// Offer one PCM chunk. `false` means it was dropped.
    pub fn queue_audio(&self, samples: &[u8]) -> bool {
        self.audio.queue_audio(samples)
    }

    pub fn switch_camera(&self, facing: CameraFacing) {
        self.scheduler.switch_camera(facing);
    }

    // ── Runtime knobs ────────────────────────────────────────────

    pub fn set_video_filter(&self, filter: Option<Box<dyn Filter>>) {
        self.scheduler.set_filter(filter);
    }

    pub fn set_audio_filter(&self, filter: Option<Box<dyn Filter>>) {
        self.audio.set_filter(filter);
    }

    pub fn take_screenshot(&self) -> oneshot::Receiver<Screenshot> {
        self.scheduler.take_screenshot()
    }

    /// Change the video bit rate now and for later sessions.
    pub fn reset_video_bit_rate(&self, bit_rate: u32) {
        self.video_bit_rate.store(bit_rate, Ordering::Release);
        self.scheduler.reset_bit_rate(bit_rate);
    }

    pub fn reset_video_fps(&self, fps: u32) -> Result<(), StreamError> {
        self.scheduler.reset_fps(fps)
    }

    /// Take the event receiver. Only the first call gets it.
    pub fn take_events(&self) -> Option<EventReceiver> {
        self.events.lock().take()
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            streaming: self.is_streaming(),
            connection: self.sender.connection_state().to_string(),
            scheduler: self.scheduler.state().to_string(),
            draw_fps: self.scheduler.draw_fps(),
            send_fps: self.sender.send_fps(),
            total_speed: self.sender.total_speed(),
            video_speed: self.sender.video_speed(),
            audio_speed: self.sender.audio_speed(),
            buffer_free_percent: self.sender.buffer_free_percent(),
            pending: self.sender.pending(),
            consecutive_errors: self.sender.consecutive_errors(),
            dropped_full: self.sender.dropped_full(),
            dropped_crowded: self.sender.dropped_crowded(),
            audio_dropped: self.audio.dropped(),
            written: self.sender.written(),
        }
    }

    /// Tear everything down. Idempotent.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop_streaming();
        self.scheduler.quit();
        self.audio.quit();
        self.sender.destroy();
        self.video_gate.destroy();
        self.audio_gate.destroy();
        info!("stream client destroyed");
    }

    fn build_encoder(
        &self,
        config: &CodecConfig,
        collector: &Arc<dyn FlvDataCollector>,
    ) -> Result<Arc<Encoder>, StreamError> {
        let encoder = Encoder::new(self.factory.as_ref(), config, Arc::clone(collector))?;
        encoder.start()?;
        Ok(Arc::new(encoder))
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        self.destroy();
    }
}
