//! Audio pipeline.
//!
//! Audio is not paced: every PCM chunk the microphone delivers goes
//! through the filter gate and into the audio encoder on a dedicated
//! worker thread. The intake channel is bounded, so a stalled encoder
//! sheds chunks instead of growing memory.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::encoder::Encoder;
use crate::error::StreamError;
use crate::filter::{Filter, FilterGate};

/// Chunks buffered between the microphone and the worker.
pub const AUDIO_QUEUE_DEPTH: usize = 8;

struct Chunk {
    samples: Vec<u8>,
    timestamp_ms: u64,
}

struct Inner {
    gate: Arc<FilterGate>,
    encoder: Mutex<Option<Arc<Encoder>>>,
    dropped: AtomicU64,
    chunks: AtomicU64,
}

/// Unpaced filter → encode worker for PCM audio.
pub struct AudioPipeline {
    inner: Arc<Inner>,
    tx: Mutex<Option<Sender<Chunk>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    epoch: Instant,
}

impl AudioPipeline {
    pub fn spawn(gate: Arc<FilterGate>, depth: usize) -> Result<Self, StreamError> {
        let (tx, rx) = crossbeam_channel::bounded(depth.max(1));
        let inner = Arc::new(Inner {
            gate,
            encoder: Mutex::new(None),
            dropped: AtomicU64::new(0),
            chunks: AtomicU64::new(0),
        });
        let worker = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name("audio-pipeline".into())
            .spawn(move || run(&worker, &rx))?;
        Ok(Self {
            inner,
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(handle)),
            epoch: Instant::now(),
        })
    }

    /// Hand one PCM chunk to the worker. Returns `false` when it was
    /// dropped because the worker is behind or gone.
    pub fn queue_audio(&self, samples: &[u8]) -> bool {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return false;
        };
        let chunk = Chunk {
            samples: samples.to_vec(),
            timestamp_ms: self.epoch.elapsed().as_millis() as u64,
        };
        match tx.try_send(chunk) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let n = self.inner.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                trace!(dropped = n, "audio queue full, dropping chunk");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    pub fn start_streaming(&self, encoder: Arc<Encoder>) {
        *self.inner.encoder.lock() = Some(encoder);
        debug!("audio streaming started");
    }

    pub fn stop_streaming(&self) -> Option<Arc<Encoder>> {
        self.inner.encoder.lock().take()
    }

    pub fn set_filter(&self, filter: Option<Box<dyn Filter>>) {
        self.inner.gate.set_filter(filter);
    }

    /// Chunks shed because the intake queue was full.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Chunks processed by the worker.
    pub fn processed(&self) -> u64 {
        self.inner.chunks.load(Ordering::Relaxed)
    }

    /// Close the intake and join the worker. Idempotent.
    pub fn quit(&self) {
        self.tx.lock().take();
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                warn!("audio worker panicked");
            }
            self.inner.encoder.lock().take();
            info!("audio pipeline stopped");
        }
    }
}

impl Drop for AudioPipeline {
    fn drop(&mut self) {
        self.quit();
    }
}

fn run(inner: &Inner, rx: &Receiver<Chunk>) {
    let mut filtered = Vec::new();
    let mut sequence = 0u64;
    for chunk in rx.iter() {
        sequence += 1;
        inner.chunks.fetch_add(1, Ordering::Relaxed);
        filtered.resize(chunk.samples.len(), 0);
        let data: &[u8] = if inner
            .gate
            .try_apply(&chunk.samples, &mut filtered, chunk.timestamp_ms, sequence)
        {
            &filtered
        } else {
            &chunk.samples
        };
        let encoder = inner.encoder.lock().clone();
        if let Some(encoder) = encoder {
            if !encoder.queue_data(data, chunk.timestamp_ms) {
                trace!(sequence, "audio encoder busy, chunk dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{AudioCodecConfig, CodecConfig, SoftwareCodecFactory};
    use crate::filter::{FILTER_LOCK_TOLERATION, FilterParams};
    use crate::frame::{AccessUnit, FlvDataCollector, MediaType};
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<AccessUnit>>);

    impl FlvDataCollector for Recorder {
        fn collect(&self, unit: AccessUnit, _source: MediaType) {
            self.0.lock().push(unit);
        }
    }

    struct Silence;

    impl Filter for Silence {
        fn on_init(&mut self, params: FilterParams) {
            assert_eq!(params, FilterParams::Audio { frame_size: 64 });
        }

        fn on_frame(&mut self, _input: &[u8], output: &mut [u8], _ts: u64, _seq: u64) -> bool {
            output.fill(0);
            true
        }
    }

    fn gate() -> Arc<FilterGate> {
        Arc::new(FilterGate::new(
            FilterParams::Audio { frame_size: 64 },
            FILTER_LOCK_TOLERATION,
        ))
    }

    fn wait_until(cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cond() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn chunks_reach_the_encoder_filtered() {
        let pipeline = AudioPipeline::spawn(gate(), AUDIO_QUEUE_DEPTH).unwrap();
        pipeline.set_filter(Some(Box::new(Silence)));

        let recorder = Arc::new(Recorder::default());
        let config = CodecConfig::Audio(AudioCodecConfig {
            profile: 2,
            sample_rate: 44_100,
            channel_count: 1,
            bit_rate: 32_768,
            max_input_size: 64,
        });
        let encoder =
            Arc::new(Encoder::new(&SoftwareCodecFactory::new(), &config, recorder.clone()).unwrap());
        encoder.start().unwrap();
        pipeline.start_streaming(Arc::clone(&encoder));

        assert!(pipeline.queue_audio(&[7; 64]));
        wait_until(|| recorder.0.lock().len() >= 2);

        let units = recorder.0.lock().clone();
        assert!(units[0].is_config);
        let pcm = zstd::decode_all(units[1].payload.as_ref()).unwrap();
        assert_eq!(pcm, vec![0; 64]);
        pipeline.quit();
    }

    #[test]
    fn chunks_without_encoder_are_consumed() {
        let pipeline = AudioPipeline::spawn(gate(), 2).unwrap();
        for _ in 0..2 {
            pipeline.queue_audio(&[1; 16]);
        }
        wait_until(|| pipeline.processed() >= 2);
        assert_eq!(pipeline.processed(), 2);
    }

    #[test]
    fn quit_closes_intake() {
        let pipeline = AudioPipeline::spawn(gate(), 2).unwrap();
        pipeline.quit();
        pipeline.quit();
        assert!(!pipeline.queue_audio(&[0; 4]));
    }
}
