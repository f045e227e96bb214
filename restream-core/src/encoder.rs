//! Encoder: wraps one codec session and turns its output into
//! [`AccessUnit`]s.
//!
//! ```text
//!  queue_data ──► dequeue_input ─► queue_input ──► [ codec session ]
//!                                                        │
//!            collector ◄── AccessUnit ◄── output thread ◄┘
//! ```
//!
//! Submission happens on the caller's thread (the scheduler for video,
//! the audio worker for audio). A dedicated output thread polls the
//! session with a short timeout so it notices `quit` promptly.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::codec::{BufferFlags, CodecConfig, CodecFactory, CodecOutput, CodecSession};
use crate::error::StreamError;
use crate::frame::{AccessUnit, FlvDataCollector, MediaType};

/// Output poll timeout.
pub const OUTPUT_WAIT: Duration = Duration::from_millis(5);

/// Default wait for a free input buffer.
pub const DEFAULT_INPUT_WAIT: Duration = Duration::from_millis(10);

type SharedSession = Arc<Mutex<Option<Arc<dyn CodecSession>>>>;

/// Single-use encoder for one media stream.
pub struct Encoder {
    media: MediaType,
    session: SharedSession,
    collector: Arc<dyn FlvDataCollector>,
    started: AtomicBool,
    quit: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    input_wait: Duration,
}

impl Encoder {
    /// Create the codec session. Fails without leaving anything behind.
    pub fn new(
        factory: &dyn CodecFactory,
        config: &CodecConfig,
        collector: Arc<dyn FlvDataCollector>,
    ) -> Result<Self, StreamError> {
        let session = factory.create(config)?;
        let media = config.media();
        debug!(%media, "codec session created");
        Ok(Self {
            media,
            session: Arc::new(Mutex::new(Some(session))),
            collector,
            started: AtomicBool::new(false),
            quit: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
            input_wait: DEFAULT_INPUT_WAIT,
        })
    }

    /// Override how long [`queue_data`](Self::queue_data) waits for an
    /// input buffer.
    pub fn with_input_wait(mut self, wait: Duration) -> Self {
        self.input_wait = wait;
        self
    }

    pub fn media(&self) -> MediaType {
        self.media
    }

    /// Start the session and the output thread. Encoders are single-use.
    pub fn start(&self) -> Result<(), StreamError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(StreamError::AlreadyStarted);
        }
        let session = self.current_session().ok_or(StreamError::Released)?;
        session.start()?;

        let media = self.media;
        let shared = Arc::clone(&self.session);
        let collector = Arc::clone(&self.collector);
        let quit = Arc::clone(&self.quit);
        let handle = thread::Builder::new()
            .name(format!("{media}-encoder"))
            .spawn(move || {
                drain_output(media, &session, collector.as_ref(), &quit);
                teardown(&shared);
            })?;
        *self.worker.lock() = Some(handle);
        info!(%media, "encoder started");
        Ok(())
    }

    /// Submit one raw frame. Returns `false` when the frame was dropped
    /// because no input buffer became free in time or the encoder is
    /// not running.
    pub fn queue_data(&self, data: &[u8], timestamp_ms: u64) -> bool {
        if self.quit.load(Ordering::Acquire) || !self.started.load(Ordering::Acquire) {
            return false;
        }
        let Some(session) = self.current_session() else {
            return false;
        };
        let Some(input) = session.dequeue_input(self.input_wait) else {
            trace!(media = %self.media, "no free input buffer, dropping frame");
            return false;
        };
        let len = input.capacity.min(data.len());
        let pts_us = (timestamp_ms as i64).saturating_mul(1000);
        match session.queue_input(input.index, &data[..len], pts_us) {
            Ok(()) => true,
            Err(_) if self.quit.load(Ordering::Acquire) => false,
            Err(e) => {
                warn!(media = %self.media, error = %e, "queue_input failed");
                false
            }
        }
    }

    /// Change the target bit rate of the running session.
    pub fn reset_bit_rate(&self, bit_rate: u32) {
        if let Some(session) = self.current_session() {
            session.set_bit_rate(bit_rate);
            debug!(media = %self.media, bit_rate, "bit rate reset");
        }
    }

    /// Stop the output thread and tear the session down. Idempotent.
    pub fn quit(&self) {
        if self.quit.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(session) = self.current_session() {
            session.signal_end_of_stream();
        }
        let handle = self.worker.lock().take();
        match handle {
            Some(handle) if handle.thread().id() != thread::current().id() => {
                if handle.join().is_err() {
                    warn!(media = %self.media, "encoder output thread panicked");
                }
            }
            Some(_) => {}
            // Never started: nothing else will release the session.
            None => teardown(&self.session),
        }
        info!(media = %self.media, "encoder quit");
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.quit.load(Ordering::Acquire)
    }

    fn current_session(&self) -> Option<Arc<dyn CodecSession>> {
        self.session.lock().clone()
    }
}

impl Drop for Encoder {
    fn drop(&mut self) {
        self.quit();
    }
}

// ── Output thread ────────────────────────────────────────────────

fn drain_output(
    media: MediaType,
    session: &Arc<dyn CodecSession>,
    collector: &dyn FlvDataCollector,
    quit: &AtomicBool,
) {
    let mut config_sent = false;
    let mut first_pts_us: Option<i64> = None;

    while !quit.load(Ordering::Acquire) {
        match session.dequeue_output(OUTPUT_WAIT) {
            CodecOutput::TryAgainLater => {}
            CodecOutput::FormatChanged(format) => {
                if config_sent {
                    continue;
                }
                config_sent = true;
                if let Some(csd) = format.config_data() {
                    debug!(%media, bytes = csd.len(), "codec config ready");
                    collector.collect(AccessUnit::config(media, csd), media);
                }
            }
            CodecOutput::Buffer(buffer) => {
                let first = *first_pts_us.get_or_insert(buffer.presentation_time_us);
                let end = buffer.flags.contains(BufferFlags::END_OF_STREAM);
                if !buffer.flags.contains(BufferFlags::CODEC_CONFIG) && !buffer.data.is_empty() {
                    let pts_ms = ((buffer.presentation_time_us - first).max(0) / 1000) as u32;
                    let key = buffer.flags.contains(BufferFlags::KEY_FRAME);
                    collector.collect(AccessUnit::data(media, buffer.data.clone(), pts_ms, key), media);
                }
                session.release_output(buffer.index);
                if end {
                    debug!(%media, "end of stream");
                    break;
                }
            }
        }
    }
}

fn teardown(shared: &SharedSession) {
    if let Some(session) = shared.lock().take() {
        session.stop();
        session.release();
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{AudioCodecConfig, SoftwareCodecFactory};
    use std::time::Instant;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<AccessUnit>>);

    impl FlvDataCollector for Recorder {
        fn collect(&self, unit: AccessUnit, _source: MediaType) {
            self.0.lock().push(unit);
        }
    }

    impl Recorder {
        fn wait_for(&self, n: usize) -> Vec<AccessUnit> {
            let deadline = Instant::now() + Duration::from_secs(2);
            while self.0.lock().len() < n && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(2));
            }
            self.0.lock().clone()
        }
    }

    struct FailingFactory;

    impl CodecFactory for FailingFactory {
        fn create(&self, _config: &CodecConfig) -> Result<Arc<dyn CodecSession>, StreamError> {
            Err(StreamError::CodecCreation("no encoder".into()))
        }
    }

    fn audio() -> CodecConfig {
        CodecConfig::Audio(AudioCodecConfig {
            profile: 2,
            sample_rate: 44_100,
            channel_count: 1,
            bit_rate: 32_768,
            max_input_size: 256,
        })
    }

    fn encoder(collector: Arc<Recorder>) -> Encoder {
        Encoder::new(&SoftwareCodecFactory::new(), &audio(), collector).unwrap()
    }

    #[test]
    fn creation_failure_is_fatal() {
        let result = Encoder::new(&FailingFactory, &audio(), Arc::new(Recorder::default()));
        assert!(matches!(result, Err(StreamError::CodecCreation(_))));
    }

    #[test]
    fn second_start_is_rejected() {
        let enc = encoder(Arc::new(Recorder::default()));
        enc.start().unwrap();
        assert!(matches!(enc.start(), Err(StreamError::AlreadyStarted)));
    }

    #[test]
    fn queue_before_start_is_dropped() {
        let enc = encoder(Arc::new(Recorder::default()));
        assert!(!enc.queue_data(&[0; 16], 0));
    }

    #[test]
    fn config_first_then_relative_timestamps() {
        let rec = Arc::new(Recorder::default());
        let enc = encoder(rec.clone());
        enc.start().unwrap();
        assert!(enc.queue_data(&[1; 64], 1_000));
        assert!(enc.queue_data(&[2; 64], 1_023));
        assert!(enc.queue_data(&[3; 64], 1_046));

        let units = rec.wait_for(4);
        assert_eq!(units.len(), 4);
        assert!(units[0].is_config);
        assert!(!units[0].droppable);
        assert_eq!(units[0].payload.as_ref(), &[0x12, 0x08]);
        let pts: Vec<u32> = units[1..].iter().map(|u| u.pts_ms).collect();
        assert_eq!(pts, vec![0, 23, 46]);
        assert!(units[1..].iter().all(|u| u.droppable && u.media == MediaType::Audio));
    }

    #[test]
    fn quit_is_idempotent_and_stops_submission() {
        let enc = encoder(Arc::new(Recorder::default()));
        enc.start().unwrap();
        enc.quit();
        enc.quit();
        assert!(!enc.is_running());
        assert!(!enc.queue_data(&[0; 8], 5));
        assert!(enc.current_session().is_none());
    }

    #[test]
    fn quit_without_start_releases_session() {
        let enc = encoder(Arc::new(Recorder::default()));
        enc.quit();
        assert!(enc.current_session().is_none());
        assert!(matches!(enc.start(), Err(StreamError::Released)));
    }
}
