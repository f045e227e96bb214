//! Paced video scheduler.
//!
//! One thread owns the working frame buffers and drives every video tick
//! at a fixed rate, independent of how fast the camera delivers frames.
//! The camera side only ever touches the [`FrameSlotPool`]; the
//! scheduler copies the newest committed slot into its private working
//! buffer and releases the slot straight away.
//!
//! ```text
//!  queue_video ─► FrameSlotPool ──Incoming──► [ scheduler thread ]
//!                                                  │ every 1000/fps ms
//!                        FilterGate ◄──────────────┤
//!                        PreviewSink ◄─────────────┤
//!                        screenshot (one-shot) ◄───┤
//!                        convert + Encoder ◄───────┘ (while streaming)
//! ```
//!
//! The scheduler is armed while either preview or streaming is active
//! and idle otherwise.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use crate::color::{self, CameraFacing, ColorFormat};
use crate::config::{RenderingMode, StreamConfig};
use crate::encoder::Encoder;
use crate::error::StreamError;
use crate::filter::{Filter, FilterGate};
use crate::meter::FrameRateMeter;
use crate::slots::FrameSlotPool;

// ── Preview boundary ─────────────────────────────────────────────

/// Geometry handed to a [`PreviewSink`] when preview starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreviewInfo {
    pub rendering_mode: RenderingMode,
    /// Layout of the frames passed to [`PreviewSink::render`].
    pub format: ColorFormat,
    pub width: u32,
    pub height: u32,
}

/// Where preview frames go (a window, a texture, a test recorder).
pub trait PreviewSink: Send {
    fn on_start(&mut self, info: PreviewInfo);

    /// Called once per tick with the filtered NV21 frame.
    fn render(&mut self, frame: &[u8]);

    fn on_stop(&mut self) {}
}

/// ARGB snapshot of one tick's frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Screenshot {
    pub width: u32,
    pub height: u32,
    /// Row-major `0xAARRGGBB` pixels.
    pub argb: Vec<u32>,
}

/// Lifecycle of the scheduler thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulerState {
    /// Neither preview nor streaming is active.
    #[default]
    Stopped,
    /// Active, waiting for the first frame.
    Armed,
    /// Active and producing ticks.
    Ticking,
}

impl std::fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "Stopped"),
            Self::Armed => write!(f, "Armed"),
            Self::Ticking => write!(f, "Ticking"),
        }
    }
}

// ── Pacing ───────────────────────────────────────────────────────

/// Deadline following a tick that was due at `last`.
///
/// `last + interval` if that is still ahead of `now`; otherwise the tick
/// is late and fires immediately, which makes `now` the new baseline.
pub fn next_deadline(last: Instant, interval: Duration, now: Instant) -> Instant {
    let planned = last + interval;
    if planned > now { planned } else { now }
}

fn interval_for(fps: u32) -> Duration {
    Duration::from_millis(1000 / fps.max(1) as u64)
}

// ── Scheduler ────────────────────────────────────────────────────

enum Message {
    Incoming { index: usize, generation: u64 },
    /// Preview or streaming toggled.
    Arm,
    Shutdown,
}

struct Inner {
    pool: Arc<FrameSlotPool>,
    gate: Arc<FilterGate>,
    preview: Mutex<Option<Box<dyn PreviewSink>>>,
    encoder: Mutex<Option<Arc<Encoder>>>,
    screenshot: Mutex<Option<oneshot::Sender<Screenshot>>>,
    draw_fps: Mutex<FrameRateMeter>,
    state: Mutex<SchedulerState>,
    facing: Mutex<CameraFacing>,
    interval_ms: AtomicU64,
    sequence: AtomicU64,
    epoch: Instant,
    config: StreamConfig,
}

/// Handle to the paced scheduler thread.
pub struct PacedScheduler {
    inner: Arc<Inner>,
    tx: Sender<Message>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PacedScheduler {
    /// Spawn the scheduler thread. It stays idle until preview or
    /// streaming starts.
    pub fn spawn(
        config: &StreamConfig,
        pool: Arc<FrameSlotPool>,
        gate: Arc<FilterGate>,
    ) -> Result<Self, StreamError> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let inner = Arc::new(Inner {
            pool,
            gate,
            preview: Mutex::new(None),
            encoder: Mutex::new(None),
            screenshot: Mutex::new(None),
            draw_fps: Mutex::new(FrameRateMeter::new()),
            state: Mutex::new(SchedulerState::Stopped),
            facing: Mutex::new(CameraFacing::Back),
            interval_ms: AtomicU64::new(interval_for(config.fps).as_millis() as u64),
            sequence: AtomicU64::new(0),
            epoch: Instant::now(),
            config: config.clone(),
        });

        let looped = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name("video-scheduler".into())
            .spawn(move || run(&looped, &rx))?;

        Ok(Self {
            inner,
            tx,
            worker: Mutex::new(Some(handle)),
        })
    }

    // ── Preview ──────────────────────────────────────────────────

    pub fn start_preview(&self, mut sink: Box<dyn PreviewSink>) {
        let cfg = &self.inner.config;
        sink.on_start(PreviewInfo {
            rendering_mode: cfg.rendering_mode,
            format: ColorFormat::Nv21,
            width: cfg.width,
            height: cfg.height,
        });
        if let Some(mut old) = self.inner.preview.lock().replace(sink) {
            old.on_stop();
        }
        self.arm();
    }

    pub fn stop_preview(&self) {
        if let Some(mut sink) = self.inner.preview.lock().take() {
            sink.on_stop();
        }
        self.arm();
    }

    // ── Streaming ────────────────────────────────────────────────

    /// Start feeding ticks to `encoder`.
    pub fn start_streaming(&self, encoder: Arc<Encoder>) {
        *self.inner.encoder.lock() = Some(encoder);
        self.arm();
    }

    /// Stop feeding the encoder and hand it back to the caller.
    pub fn stop_streaming(&self) -> Option<Arc<Encoder>> {
        let encoder = self.inner.encoder.lock().take();
        self.arm();
        encoder
    }

    pub fn is_streaming(&self) -> bool {
        self.inner.encoder.lock().is_some()
    }

    // ── Intake ───────────────────────────────────────────────────

    /// Offer one camera frame in the configured preview layout.
    ///
    /// Returns `Ok(false)` when the frame was dropped because the next
    /// slot is still being consumed.
    pub fn queue_video(&self, frame: &[u8]) -> Result<bool, StreamError> {
        let cfg = &self.inner.config;
        let direction = cfg.direction_for(*self.inner.facing.lock());
        let committed = self.inner.pool.offer_tagged(|dst| {
            color::accept_frame(
                frame,
                dst,
                cfg.width,
                cfg.height,
                cfg.preview_color_format,
                direction,
            )
        })?;
        match committed {
            Some((index, generation)) => {
                self.tx.send(Message::Incoming { index, generation })?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Switch cameras. Frames still in flight from the old camera are
    /// discarded.
    pub fn switch_camera(&self, facing: CameraFacing) {
        *self.inner.facing.lock() = facing;
        self.inner.pool.reset();
        info!(?facing, "camera switched");
    }

    pub fn facing(&self) -> CameraFacing {
        *self.inner.facing.lock()
    }

    // ── Runtime knobs ────────────────────────────────────────────

    /// Install or remove the video filter.
    pub fn set_filter(&self, filter: Option<Box<dyn Filter>>) {
        self.inner.gate.set_filter(filter);
    }

    /// ARGB copy of the next tick's frame.
    ///
    /// The receiver resolves on the next tick that has a frame; it is
    /// dropped unresolved if the scheduler shuts down first. A newer
    /// request replaces an unserved one.
    pub fn take_screenshot(&self) -> oneshot::Receiver<Screenshot> {
        let (tx, rx) = oneshot::channel();
        *self.inner.screenshot.lock() = Some(tx);
        rx
    }

    /// Change the tick rate.
    pub fn reset_fps(&self, fps: u32) -> Result<(), StreamError> {
        if fps == 0 || fps > 1000 {
            return Err(StreamError::InvalidConfig("fps must be within 1..=1000"));
        }
        self.inner
            .interval_ms
            .store(interval_for(fps).as_millis() as u64, Ordering::Release);
        debug!(fps, "scheduler fps reset");
        Ok(())
    }

    /// Forward a new bit rate to the live encoder, if any.
    pub fn reset_bit_rate(&self, bit_rate: u32) {
        if let Some(encoder) = self.inner.encoder.lock().as_ref() {
            encoder.reset_bit_rate(bit_rate);
        }
    }

    // ── Observables ──────────────────────────────────────────────

    pub fn draw_fps(&self) -> f32 {
        self.inner.draw_fps.lock().fps()
    }

    pub fn state(&self) -> SchedulerState {
        *self.inner.state.lock()
    }

    /// Ticks processed since spawn.
    pub fn sequence(&self) -> u64 {
        self.inner.sequence.load(Ordering::Acquire)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.inner.interval_ms.load(Ordering::Acquire))
    }

    /// Stop the thread and drop preview and encoder references.
    /// Idempotent.
    pub fn quit(&self) {
        let Some(handle) = self.worker.lock().take() else {
            return;
        };
        let _ = self.tx.send(Message::Shutdown);
        if handle.join().is_err() {
            warn!("scheduler thread panicked");
        }
        if let Some(mut sink) = self.inner.preview.lock().take() {
            sink.on_stop();
        }
        self.inner.encoder.lock().take();
        self.inner.screenshot.lock().take();
        info!("scheduler stopped");
    }

    fn arm(&self) {
        let _ = self.tx.send(Message::Arm);
    }
}

impl Drop for PacedScheduler {
    fn drop(&mut self) {
        self.quit();
    }
}

// ── Scheduler thread ─────────────────────────────────────────────

/// Buffers private to the scheduler thread.
struct Workspace {
    current: Vec<u8>,
    filtered: Vec<u8>,
    converted: Vec<u8>,
    has_frame: bool,
}

impl Inner {
    fn is_armed(&self) -> bool {
        self.preview.lock().is_some() || self.encoder.lock().is_some()
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(Ordering::Acquire))
    }

    fn set_state(&self, state: SchedulerState) {
        let mut current = self.state.lock();
        if *current != state {
            debug!(from = %*current, to = %state, "scheduler state");
            *current = state;
        }
    }

    /// Copy a committed slot into the working buffer and release it.
    fn intake(&self, work: &mut Workspace, index: usize, generation: u64) {
        if generation != self.pool.generation() {
            // Written before a camera switch.
            if let Err(e) = self.pool.release_stale(index, generation) {
                warn!(error = %e, "frame slot release failed");
            }
            trace!(index, "stale frame notification ignored");
            return;
        }
        match self.pool.borrow_for_read(index) {
            Ok(slot) => {
                let n = slot.len().min(work.current.len());
                work.current[..n].copy_from_slice(&slot[..n]);
            }
            Err(e) => {
                warn!(error = %e, "frame slot read failed");
                return;
            }
        }
        if let Err(e) = self.pool.release(index) {
            warn!(error = %e, "frame slot release failed");
        }
        work.has_frame = true;
    }

    fn tick(&self, work: &mut Workspace) {
        let sequence = self.sequence.fetch_add(1, Ordering::AcqRel) + 1;
        let timestamp_ms = self.epoch.elapsed().as_millis() as u64;

        let Workspace {
            current,
            filtered,
            converted,
            ..
        } = work;
        let frame: &[u8] = if self.gate.try_apply(current, filtered, timestamp_ms, sequence) {
            &filtered[..]
        } else {
            &current[..]
        };

        if let Some(sink) = self.preview.lock().as_mut() {
            sink.render(frame);
        }

        if let Some(tx) = self.screenshot.lock().take() {
            let argb = color::nv21_to_argb(frame, self.config.width, self.config.height);
            let _ = tx.send(Screenshot {
                width: self.config.width,
                height: self.config.height,
                argb,
            });
        }

        self.draw_fps.lock().count();

        let encoder = self.encoder.lock().clone();
        if let Some(encoder) = encoder {
            let pixels = (self.config.width * self.config.height) as usize;
            color::convert_nv21(frame, &mut converted[..], pixels, self.config.encoder_color_format);
            if !encoder.queue_data(&converted[..], timestamp_ms) {
                trace!(sequence, "encoder busy, frame dropped");
            }
        }
    }
}

fn run(inner: &Inner, rx: &Receiver<Message>) {
    let frame_size = inner.config.frame_size();
    let converted_size = inner
        .config
        .encoder_color_format
        .buffer_size(inner.config.width, inner.config.height);
    let mut work = Workspace {
        current: vec![0; frame_size],
        filtered: vec![0; frame_size],
        converted: vec![0; converted_size],
        has_frame: false,
    };
    let mut deadline: Option<Instant> = None;

    loop {
        let message = match deadline {
            Some(at) => rx.recv_deadline(at),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match message {
            Ok(Message::Incoming { index, generation }) => {
                inner.intake(&mut work, index, generation);
            }
            Ok(Message::Arm) => {
                if !inner.is_armed() {
                    deadline = None;
                    inner.draw_fps.lock().reset();
                    inner.set_state(SchedulerState::Stopped);
                } else if deadline.is_none() {
                    deadline = Some(Instant::now());
                    inner.set_state(SchedulerState::Armed);
                }
            }
            Ok(Message::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                let due = deadline.unwrap_or_else(Instant::now);
                if work.has_frame {
                    inner.set_state(SchedulerState::Ticking);
                    inner.tick(&mut work);
                }
                deadline = Some(next_deadline(due, inner.interval(), Instant::now()));
            }
        }
    }
    inner.set_state(SchedulerState::Stopped);
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{FILTER_LOCK_TOLERATION, FilterParams};

    #[derive(Default)]
    struct Frames {
        started: Option<PreviewInfo>,
        rendered: Vec<u8>,
    }

    /// Records the first byte of each rendered frame.
    struct Recorder(Arc<Mutex<Frames>>);

    impl PreviewSink for Recorder {
        fn on_start(&mut self, info: PreviewInfo) {
            self.0.lock().started = Some(info);
        }

        fn render(&mut self, frame: &[u8]) {
            self.0.lock().rendered.push(frame[0]);
        }
    }

    struct Invert;

    impl Filter for Invert {
        fn on_init(&mut self, _params: FilterParams) {}

        fn on_frame(&mut self, input: &[u8], output: &mut [u8], _ts: u64, _seq: u64) -> bool {
            for (o, i) in output.iter_mut().zip(input) {
                *o = !*i;
            }
            true
        }
    }

    fn small_config() -> StreamConfig {
        StreamConfig {
            width: 4,
            height: 2,
            fps: 30,
            ..Default::default()
        }
    }

    fn scheduler(cfg: &StreamConfig) -> (PacedScheduler, Arc<FilterGate>) {
        let pool = Arc::new(FrameSlotPool::new(cfg.video_buffer_queue_num, cfg.frame_size()));
        let gate = Arc::new(FilterGate::new(
            FilterParams::Video {
                width: cfg.width,
                height: cfg.height,
            },
            FILTER_LOCK_TOLERATION,
        ));
        (PacedScheduler::spawn(cfg, pool, Arc::clone(&gate)).unwrap(), gate)
    }

    /// Feed frames of `byte` every 5 ms for `span`.
    fn feed_for(sched: &PacedScheduler, byte: u8, span: Duration) {
        let frame = vec![byte; sched.inner.config.frame_size()];
        let end = Instant::now() + span;
        while Instant::now() < end {
            sched.queue_video(&frame).unwrap();
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn deadline_in_future_is_kept() {
        let t0 = Instant::now();
        let next = next_deadline(t0, Duration::from_millis(33), t0 + Duration::from_millis(10));
        assert_eq!(next, t0 + Duration::from_millis(33));
    }

    #[test]
    fn late_deadline_fires_now() {
        let t0 = Instant::now();
        let now = t0 + Duration::from_millis(100);
        let next = next_deadline(t0, Duration::from_millis(33), now);
        assert_eq!(next, now);
        // The following tick is paced from the late one.
        assert_eq!(
            next_deadline(next, Duration::from_millis(33), now),
            now + Duration::from_millis(33)
        );
    }

    #[test]
    fn idle_until_armed() {
        let (sched, _gate) = scheduler(&small_config());
        feed_for(&sched, 1, Duration::from_millis(60));
        assert_eq!(sched.sequence(), 0);
        assert_eq!(sched.state(), SchedulerState::Stopped);
    }

    #[test]
    fn draw_rate_settles_near_target() {
        let (sched, _gate) = scheduler(&small_config());
        let frames = Arc::new(Mutex::new(Frames::default()));
        sched.start_preview(Box::new(Recorder(frames.clone())));
        feed_for(&sched, 9, Duration::from_secs(2));

        let fps = sched.draw_fps();
        assert!((28.0..=32.0).contains(&fps), "draw fps = {fps}");
        assert_eq!(sched.state(), SchedulerState::Ticking);
        assert_eq!(frames.lock().started.map(|i| i.width), Some(4));
    }

    #[test]
    fn filter_applies_to_preview() {
        let (sched, _gate) = scheduler(&small_config());
        sched.set_filter(Some(Box::new(Invert)));
        let frames = Arc::new(Mutex::new(Frames::default()));
        sched.start_preview(Box::new(Recorder(frames.clone())));
        feed_for(&sched, 0x0F, Duration::from_millis(200));
        let rendered = frames.lock().rendered.clone();
        assert!(!rendered.is_empty());
        assert!(rendered.iter().all(|b| *b == 0xF0));
    }

    #[test]
    fn held_filter_lock_passes_frames_through_at_full_rate() {
        let (sched, gate) = scheduler(&small_config());
        sched.set_filter(Some(Box::new(Invert)));
        let frames = Arc::new(Mutex::new(Frames::default()));
        sched.start_preview(Box::new(Recorder(frames.clone())));

        let held = gate.acquire();
        feed_for(&sched, 0x0F, Duration::from_millis(1500));
        let fps = sched.draw_fps();
        drop(held);

        let rendered = frames.lock().rendered.clone();
        assert!(rendered.iter().all(|b| *b == 0x0F));
        assert!((28.0..=32.0).contains(&fps), "draw fps = {fps}");
    }

    #[test]
    fn screenshot_resolves_on_next_tick() {
        let (sched, _gate) = scheduler(&small_config());
        sched.start_preview(Box::new(Recorder(Arc::default())));
        let rx = sched.take_screenshot();
        feed_for(&sched, 128, Duration::from_millis(100));
        let shot = rx.blocking_recv().unwrap();
        assert_eq!((shot.width, shot.height), (4, 2));
        assert_eq!(shot.argb.len(), 8);
    }

    #[test]
    fn stop_preview_disarms() {
        let (sched, _gate) = scheduler(&small_config());
        sched.start_preview(Box::new(Recorder(Arc::default())));
        feed_for(&sched, 1, Duration::from_millis(100));
        sched.stop_preview();
        thread::sleep(Duration::from_millis(20));
        let seq = sched.sequence();
        feed_for(&sched, 1, Duration::from_millis(100));
        assert_eq!(sched.sequence(), seq);
        assert_eq!(sched.state(), SchedulerState::Stopped);
    }

    #[test]
    fn camera_switch_resets_slots() {
        let cfg = small_config();
        let (sched, _gate) = scheduler(&cfg);
        sched.switch_camera(CameraFacing::Front);
        assert_eq!(sched.facing(), CameraFacing::Front);
        assert!(sched.inner.pool.is_ready_to_fill(0));
    }

    #[test]
    fn frame_from_previous_camera_is_never_used() {
        let cfg = small_config();
        let (sched, _gate) = scheduler(&cfg);
        let size = cfg.frame_size();
        let mut work = Workspace {
            current: vec![0; size],
            filtered: vec![0; size],
            converted: vec![0; size],
            has_frame: false,
        };

        let (index, generation) = sched
            .inner
            .pool
            .offer_tagged(|dst| {
                dst.fill(0xAA);
                Ok(())
            })
            .unwrap()
            .unwrap();
        sched.switch_camera(CameraFacing::Front);
        sched.inner.intake(&mut work, index, generation);

        assert!(!work.has_frame);
        assert!(work.current.iter().all(|b| *b == 0));
        assert!(sched.inner.pool.is_ready_to_fill(index));

        // Frames from the new camera still flow.
        let (index, generation) = sched
            .inner
            .pool
            .offer_tagged(|dst| {
                dst.fill(0xBB);
                Ok(())
            })
            .unwrap()
            .unwrap();
        sched.inner.intake(&mut work, index, generation);
        assert!(work.has_frame);
        assert!(work.current.iter().all(|b| *b == 0xBB));
    }

    #[test]
    fn wrong_frame_size_is_rejected() {
        let (sched, _gate) = scheduler(&small_config());
        assert!(matches!(
            sched.queue_video(&[0; 3]),
            Err(StreamError::FrameSize { .. })
        ));
    }

    #[test]
    fn reset_fps_validates() {
        let (sched, _gate) = scheduler(&small_config());
        assert!(sched.reset_fps(0).is_err());
        sched.reset_fps(20).unwrap();
        assert_eq!(sched.frame_interval(), Duration::from_millis(50));
    }
}
