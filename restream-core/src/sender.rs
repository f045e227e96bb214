//! Backpressured sender queue.
//!
//! Every access unit produced by the encoders is fed into a single
//! bounded FIFO drained by one consumer thread that owns the [`Muxer`].
//! Connection lifecycle commands travel through the same FIFO so they
//! are serialised with writes.
//!
//! # Backpressure
//!
//! | Where      | Condition                                  | Action            |
//! |------------|--------------------------------------------|-------------------|
//! | `feed`     | `pending >= max_queue_length` and unit is droppable | drop, count full |
//! | consumer   | `pending >= max_queue_length * 2 / 3` and unit is droppable | discard, count crowded |
//!
//! Configuration units are never droppable: they are admitted past a
//! full queue and always reach the muxer.
//!
//! `start` flushes queued writes and earlier starts, `stop` flushes
//! queued writes and earlier stops. A stop followed by a start keeps
//! both commands, in order.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::error::{MuxerError, StreamError};
use crate::events::{EventSender, StreamEvent};
use crate::frame::{AccessUnit, FlvDataCollector, MediaType};
use crate::meter::{ByteSpeedometer, FrameRateMeter, SPEED_GRANULARITY};

// ── Muxer ────────────────────────────────────────────────────────

/// Opaque container/transport writer (e.g. FLV over RTMP).
///
/// Owned and driven exclusively by the sender's consumer thread.
pub trait Muxer: Send {
    fn open(&mut self, url: &str, width: u32, height: u32) -> Result<(), MuxerError>;

    /// Checked after a successful `open`; `false` reports the open as
    /// failed.
    fn is_connected(&self) -> bool;

    /// Write one video unit. Returns the number of bytes written.
    fn write_video(&mut self, data: &[u8], dts_ms: u32) -> Result<usize, MuxerError>;

    /// Write one audio unit. Returns the number of bytes written.
    fn write_audio(&mut self, data: &[u8], dts_ms: u32) -> Result<usize, MuxerError>;

    fn close(&mut self) -> Result<(), MuxerError>;
}

// ── ConnectionState ──────────────────────────────────────────────

/// Connection lifecycle as seen by the consumer thread.
///
/// ```text
///   Idle ──start──► Running ──stop──► Stopped
///                      ▲                 │
///                      └──────start──────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Never started.
    #[default]
    Idle,
    Running,
    Stopped,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Running => write!(f, "Running"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

impl ConnectionState {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Transition to `Running`.
    ///
    /// Valid from: `Idle`, `Stopped`.
    pub fn begin(&mut self) -> Result<(), StreamError> {
        match self {
            Self::Idle | Self::Stopped => {
                *self = Self::Running;
                Ok(())
            }
            Self::Running => Err(StreamError::InvalidState("cannot start: already running")),
        }
    }

    /// Transition to `Stopped`.
    ///
    /// Valid from: `Running`.
    pub fn end(&mut self) -> Result<(), StreamError> {
        match self {
            Self::Running => {
                *self = Self::Stopped;
                Ok(())
            }
            _ => Err(StreamError::InvalidState("cannot stop: not running")),
        }
    }
}

// ── Internal state ───────────────────────────────────────────────

#[derive(Debug)]
enum WorkItem {
    Start(String),
    Stop,
    Write(AccessUnit),
}

impl WorkItem {
    fn is_write(&self) -> bool {
        matches!(self, Self::Write(_))
    }
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<WorkItem>,
    /// Writes accepted but not yet taken by the consumer.
    pending: usize,
    shutdown: bool,
}

struct Meters {
    send_fps: FrameRateMeter,
    total: ByteSpeedometer,
    video: ByteSpeedometer,
    audio: ByteSpeedometer,
}

impl Meters {
    fn new() -> Self {
        Self {
            send_fps: FrameRateMeter::new(),
            total: ByteSpeedometer::new(SPEED_GRANULARITY),
            video: ByteSpeedometer::new(SPEED_GRANULARITY),
            audio: ByteSpeedometer::new(SPEED_GRANULARITY),
        }
    }

    fn record(&mut self, media: MediaType, bytes: u64, now: Instant) {
        self.total.gain_at(now, bytes);
        match media {
            MediaType::Video => {
                self.send_fps.count_at(now);
                self.video.gain_at(now, bytes);
            }
            MediaType::Audio => self.audio.gain_at(now, bytes),
        }
    }
}

struct Shared {
    queue: Mutex<QueueState>,
    ready: Condvar,
    state: Mutex<ConnectionState>,
    meters: Mutex<Meters>,
    max_queue_length: usize,
    consecutive_errors: AtomicU32,
    dropped_full: AtomicU64,
    dropped_crowded: AtomicU64,
    written: AtomicU64,
    events: EventSender,
}

impl Shared {
    fn reset_send_rate(&self) {
        self.meters.lock().send_fps.reset();
    }

    fn crowded_threshold(&self) -> usize {
        self.max_queue_length * 2 / 3
    }

    fn emit(&self, event: StreamEvent) {
        // Receiver gone means nobody is listening.
        let _ = self.events.send(event);
    }
}

// ── SenderQueue ──────────────────────────────────────────────────

/// Bounded FIFO in front of a [`Muxer`], drained by one thread.
pub struct SenderQueue {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SenderQueue {
    /// Spawn the consumer thread. The muxer moves onto that thread.
    pub fn spawn(
        max_queue_length: usize,
        width: u32,
        height: u32,
        muxer: Box<dyn Muxer>,
        events: EventSender,
    ) -> Result<Self, StreamError> {
        if max_queue_length == 0 {
            return Err(StreamError::InvalidConfig("sender queue length must be at least 1"));
        }
        let shared = Arc::new(Shared {
            queue: Mutex::new(QueueState::default()),
            ready: Condvar::new(),
            state: Mutex::new(ConnectionState::Idle),
            meters: Mutex::new(Meters::new()),
            max_queue_length,
            consecutive_errors: AtomicU32::new(0),
            dropped_full: AtomicU64::new(0),
            dropped_crowded: AtomicU64::new(0),
            written: AtomicU64::new(0),
            events,
        });

        let consumer = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("sender".into())
            .spawn(move || consume(&consumer, muxer, width, height))?;

        Ok(Self {
            shared,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Ask the consumer to open `url`. Flushes queued writes and starts.
    pub fn start(&self, url: &str) {
        self.enqueue_command(WorkItem::Start(url.to_owned()), |item| {
            matches!(item, WorkItem::Start(_))
        });
    }

    /// Ask the consumer to close the muxer. Flushes queued writes and stops.
    pub fn stop(&self) {
        self.enqueue_command(WorkItem::Stop, |item| matches!(item, WorkItem::Stop));
    }

    /// Offer one unit. Returns `false` when it was dropped.
    pub fn feed(&self, unit: AccessUnit) -> bool {
        let mut queue = self.shared.queue.lock();
        if queue.shutdown {
            return false;
        }
        if unit.droppable && queue.pending >= self.shared.max_queue_length {
            drop(queue);
            let n = self.shared.dropped_full.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(media = %unit.media, dropped = n, "sender queue full, dropping unit");
            return false;
        }
        queue.pending += 1;
        queue.items.push_back(WorkItem::Write(unit));
        self.shared.ready.notify_one();
        true
    }

    /// Stop the consumer thread and wait for it. Closes the muxer if a
    /// session is live. Idempotent.
    pub fn destroy(&self) {
        {
            let mut queue = self.shared.queue.lock();
            queue.shutdown = true;
            queue.items.clear();
            queue.pending = 0;
        }
        self.shared.ready.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                warn!("sender thread panicked");
            }
            info!("sender destroyed");
        }
    }

    // ── Observables ──────────────────────────────────────────────

    /// Writes accepted but not yet taken by the consumer.
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().pending
    }

    pub fn max_queue_length(&self) -> usize {
        self.shared.max_queue_length
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }

    /// Video units written per second.
    pub fn send_fps(&self) -> f32 {
        self.shared.meters.lock().send_fps.fps()
    }

    /// Bytes/second over all media.
    pub fn total_speed(&self) -> u64 {
        self.shared.meters.lock().total.speed()
    }

    pub fn video_speed(&self) -> u64 {
        self.shared.meters.lock().video.speed()
    }

    pub fn audio_speed(&self) -> u64 {
        self.shared.meters.lock().audio.speed()
    }

    /// Share of the queue still free, `0.0..=100.0`.
    pub fn buffer_free_percent(&self) -> f32 {
        let max = self.shared.max_queue_length;
        let pending = self.pending().min(max);
        (max - pending) as f32 * 100.0 / max as f32
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.shared.consecutive_errors.load(Ordering::Relaxed)
    }

    /// Units refused by `feed` because the queue was full.
    pub fn dropped_full(&self) -> u64 {
        self.shared.dropped_full.load(Ordering::Relaxed)
    }

    /// Units discarded by the consumer because the queue was crowded.
    pub fn dropped_crowded(&self) -> u64 {
        self.shared.dropped_crowded.load(Ordering::Relaxed)
    }

    /// Units successfully written.
    pub fn written(&self) -> u64 {
        self.shared.written.load(Ordering::Relaxed)
    }

    fn enqueue_command(&self, item: WorkItem, same_kind: impl Fn(&WorkItem) -> bool) {
        let mut queue = self.shared.queue.lock();
        if queue.shutdown {
            return;
        }
        queue.items.retain(|queued| !queued.is_write() && !same_kind(queued));
        queue.pending = 0;
        queue.items.push_back(item);
        self.shared.ready.notify_one();
    }
}

impl FlvDataCollector for SenderQueue {
    fn collect(&self, unit: AccessUnit, _source: MediaType) {
        self.feed(unit);
    }
}

impl Drop for SenderQueue {
    fn drop(&mut self) {
        self.destroy();
    }
}

// ── Consumer thread ──────────────────────────────────────────────

fn next_item(shared: &Shared) -> Option<(WorkItem, usize)> {
    let mut queue = shared.queue.lock();
    loop {
        if queue.shutdown {
            return None;
        }
        if let Some(item) = queue.items.pop_front() {
            if item.is_write() {
                queue.pending = queue.pending.saturating_sub(1);
            }
            return Some((item, queue.pending));
        }
        shared.ready.wait(&mut queue);
    }
}

fn consume(shared: &Shared, mut muxer: Box<dyn Muxer>, width: u32, height: u32) {
    while let Some((item, pending)) = next_item(shared) {
        match item {
            WorkItem::Start(url) => {
                if shared.state.lock().begin().is_err() {
                    debug!("start ignored: already running");
                    continue;
                }
                let code = match muxer.open(&url, width, height) {
                    Ok(()) if muxer.is_connected() => 0,
                    Ok(()) => 1,
                    Err(e) if e.code != 0 => e.code,
                    Err(_) => 1,
                };
                shared.consecutive_errors.store(0, Ordering::Relaxed);
                shared.reset_send_rate();
                if code == 0 {
                    info!(%url, "muxer opened");
                } else {
                    warn!(%url, code, "muxer open failed");
                }
                shared.emit(StreamEvent::OpenConnectionResult { code });
            }
            WorkItem::Stop => {
                if shared.state.lock().end().is_err() {
                    debug!("stop ignored: not running");
                    continue;
                }
                shared.consecutive_errors.store(0, Ordering::Relaxed);
                close(shared, muxer.as_mut());
            }
            WorkItem::Write(unit) => {
                if !shared.state.lock().is_running() {
                    continue;
                }
                if unit.droppable && pending >= shared.crowded_threshold() {
                    shared.dropped_crowded.fetch_add(1, Ordering::Relaxed);
                    debug!(pending, media = %unit.media, "sender crowded, discarding unit");
                    continue;
                }
                write(shared, muxer.as_mut(), &unit);
            }
        }
    }

    // Shutting down with a live session.
    if shared.state.lock().end().is_ok() {
        close(shared, muxer.as_mut());
    }
}

fn write(shared: &Shared, muxer: &mut dyn Muxer, unit: &AccessUnit) {
    let result = match unit.media {
        MediaType::Video => muxer.write_video(&unit.payload, unit.pts_ms),
        MediaType::Audio => muxer.write_audio(&unit.payload, unit.pts_ms),
    };
    match result {
        Ok(_) => {
            shared.consecutive_errors.store(0, Ordering::Relaxed);
            shared.written.fetch_add(1, Ordering::Relaxed);
            shared
                .meters
                .lock()
                .record(unit.media, unit.size() as u64, Instant::now());
        }
        Err(e) => {
            let errors = shared.consecutive_errors.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(code = e.code, consecutive = errors, media = %unit.media, "write failed");
            shared.emit(StreamEvent::WriteError { code: e.code });
        }
    }
}

fn close(shared: &Shared, muxer: &mut dyn Muxer) {
    let code = match muxer.close() {
        Ok(()) => 0,
        Err(e) => e.code,
    };
    info!(code, "muxer closed");
    shared.emit(StreamEvent::CloseConnectionResult { code });
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;

    #[derive(Default)]
    struct Log {
        opens: usize,
        closes: usize,
        urls: Vec<String>,
        writes: Vec<(MediaType, u32)>,
    }

    struct MockMuxer {
        log: Arc<Mutex<Log>>,
        fail_writes: bool,
        connects: bool,
        write_delay: Duration,
    }

    impl MockMuxer {
        fn new(log: Arc<Mutex<Log>>) -> Self {
            Self {
                log,
                fail_writes: false,
                connects: true,
                write_delay: Duration::ZERO,
            }
        }
    }

    impl Muxer for MockMuxer {
        fn open(&mut self, url: &str, _w: u32, _h: u32) -> Result<(), MuxerError> {
            let mut log = self.log.lock();
            log.opens += 1;
            log.urls.push(url.to_owned());
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connects
        }

        fn write_video(&mut self, data: &[u8], dts_ms: u32) -> Result<usize, MuxerError> {
            thread::sleep(self.write_delay);
            if self.fail_writes {
                return Err(MuxerError::new(-5));
            }
            self.log.lock().writes.push((MediaType::Video, dts_ms));
            Ok(data.len())
        }

        fn write_audio(&mut self, data: &[u8], dts_ms: u32) -> Result<usize, MuxerError> {
            if self.fail_writes {
                return Err(MuxerError::new(-5));
            }
            self.log.lock().writes.push((MediaType::Audio, dts_ms));
            Ok(data.len())
        }

        fn close(&mut self) -> Result<(), MuxerError> {
            self.log.lock().closes += 1;
            Ok(())
        }
    }

    fn sender(fail_writes: bool) -> (SenderQueue, Arc<Mutex<Log>>, crate::events::EventReceiver) {
        sender_with(|muxer| muxer.fail_writes = fail_writes)
    }

    fn sender_with(
        tweak: impl FnOnce(&mut MockMuxer),
    ) -> (SenderQueue, Arc<Mutex<Log>>, crate::events::EventReceiver) {
        let log = Arc::new(Mutex::new(Log::default()));
        let (tx, rx) = crate::events::channel();
        let mut muxer = MockMuxer::new(log.clone());
        tweak(&mut muxer);
        let queue = SenderQueue::spawn(30, 4, 2, Box::new(muxer), tx).unwrap();
        (queue, log, rx)
    }

    fn wait_until(cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while !cond() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn settle(queue: &SenderQueue) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while queue.pending() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        thread::sleep(Duration::from_millis(20));
    }

    fn video(pts: u32) -> AccessUnit {
        AccessUnit::data(MediaType::Video, Bytes::from_static(&[0; 10]), pts, false)
    }

    #[test]
    fn state_transitions() {
        let mut state = ConnectionState::default();
        assert!(state.end().is_err());
        assert_eq!(state, ConnectionState::Idle);
        state.begin().unwrap();
        assert!(state.begin().is_err());
        state.end().unwrap();
        assert_eq!(state.to_string(), "Stopped");
        state.begin().unwrap();
        assert!(state.is_running());
    }

    #[test]
    fn writes_before_start_are_discarded() {
        let (queue, log, _rx) = sender(false);
        assert!(queue.feed(video(0)));
        settle(&queue);
        assert!(log.lock().writes.is_empty());
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn writes_in_fifo_order() {
        let (queue, log, _rx) = sender(false);
        queue.start("mock://");
        settle(&queue);
        for pts in [0, 33, 66] {
            assert!(queue.feed(video(pts)));
        }
        settle(&queue);
        let log = log.lock();
        assert_eq!(log.opens, 1);
        let pts: Vec<u32> = log.writes.iter().map(|(_, p)| *p).collect();
        assert_eq!(pts, vec![0, 33, 66]);
        assert_eq!(queue.written(), 3);
    }

    #[test]
    fn write_failures_count_and_reset() {
        let (queue, _log, mut rx) = sender(true);
        queue.start("mock://");
        queue.feed(video(0));
        queue.feed(video(33));
        settle(&queue);
        assert_eq!(queue.consecutive_errors(), 2);
        assert_eq!(rx.try_recv().unwrap(), StreamEvent::OpenConnectionResult { code: 0 });
        assert_eq!(rx.try_recv().unwrap(), StreamEvent::WriteError { code: -5 });
        assert_eq!(rx.try_recv().unwrap(), StreamEvent::WriteError { code: -5 });
    }

    #[test]
    fn stop_then_start_during_a_slow_write_keeps_both() {
        let (queue, log, _rx) = sender_with(|muxer| muxer.write_delay = Duration::from_millis(200));
        queue.start("mock://first");
        wait_until(|| log.lock().opens == 1);
        assert!(queue.feed(video(0)));
        // Consumer is now inside the slow write.
        thread::sleep(Duration::from_millis(50));
        queue.stop();
        queue.start("mock://second");

        wait_until(|| log.lock().opens == 2);
        let log = log.lock();
        assert_eq!(log.closes, 1);
        assert_eq!(log.urls, vec!["mock://first", "mock://second"]);
        assert_eq!(queue.connection_state(), ConnectionState::Running);
    }

    #[test]
    fn start_flushes_queued_writes_but_not_a_queued_stop() {
        let (queue, log, _rx) = sender_with(|muxer| muxer.write_delay = Duration::from_millis(100));
        queue.start("mock://first");
        wait_until(|| log.lock().opens == 1);
        assert!(queue.feed(video(0)));
        thread::sleep(Duration::from_millis(30));
        queue.feed(video(33));
        queue.feed(video(66));
        queue.stop();
        assert_eq!(queue.pending(), 0);
        queue.start("mock://second");

        wait_until(|| log.lock().opens == 2);
        let log = log.lock();
        assert_eq!(log.closes, 1);
        let pts: Vec<u32> = log.writes.iter().map(|(_, p)| *p).collect();
        assert_eq!(pts, vec![0]);
    }

    #[test]
    fn open_without_connection_reports_failure() {
        let (queue, log, mut rx) = sender_with(|muxer| muxer.connects = false);
        queue.start("mock://");
        wait_until(|| log.lock().opens == 1);
        settle(&queue);
        assert_eq!(rx.try_recv().unwrap(), StreamEvent::OpenConnectionResult { code: 1 });
        assert_eq!(queue.connection_state(), ConnectionState::Running);
    }

    #[test]
    fn stop_clears_error_count() {
        let (queue, _log, _rx) = sender(true);
        queue.start("mock://");
        queue.feed(video(0));
        queue.feed(video(33));
        settle(&queue);
        assert_eq!(queue.consecutive_errors(), 2);
        queue.stop();
        settle(&queue);
        assert_eq!(queue.consecutive_errors(), 0);
    }

    #[test]
    fn restart_resets_send_rate() {
        let (queue, _log, _rx) = sender(false);
        queue.start("mock://");
        settle(&queue);
        for pts in [0, 33, 66] {
            queue.feed(video(pts));
            thread::sleep(Duration::from_millis(5));
        }
        settle(&queue);
        assert!(queue.send_fps() > 0.0);

        queue.stop();
        queue.start("mock://");
        settle(&queue);
        assert_eq!(queue.send_fps(), 0.0);
    }

    #[test]
    fn stop_without_start_does_not_close() {
        let (queue, log, mut rx) = sender(false);
        queue.stop();
        settle(&queue);
        assert_eq!(log.lock().closes, 0);
        assert!(rx.try_recv().is_err());
        assert_eq!(queue.connection_state(), ConnectionState::Idle);
    }

    #[test]
    fn destroy_closes_live_session() {
        let (queue, log, _rx) = sender(false);
        queue.start("mock://");
        settle(&queue);
        queue.destroy();
        queue.destroy();
        assert_eq!(log.lock().closes, 1);
        assert!(!queue.feed(video(0)));
    }

    #[test]
    fn free_percent_tracks_pending() {
        let (queue, _log, _rx) = sender(false);
        assert_eq!(queue.buffer_free_percent(), 100.0);
    }
}
