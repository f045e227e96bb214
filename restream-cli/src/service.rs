//! Agent service core logic.
//!
//! Builds the streaming pipeline from an [`AgentConfig`], attaches the
//! synthetic capture source, and supervises the session: listener
//! events are logged, stats are reported periodically, and the session
//! ends on Ctrl-C, after the requested duration, or when the connection
//! cannot be opened.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{error, info, warn};

use restream_core::{SoftwareCodecFactory, StreamClient, StreamEvent, StreamStats};

use crate::capture::{SourceSettings, SyntheticSource};
use crate::config::AgentConfig;
use crate::muxer;

/// How often the supervisor checks its stop conditions.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Per-run options that do not live in the config file.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub url: String,
    pub duration: Option<Duration>,
    pub json_stats: bool,
}

/// Summary printed when the agent exits.
#[derive(Debug, Clone, Serialize)]
pub struct AgentReport {
    pub url: String,
    pub elapsed_secs: f64,
    pub frames_captured: u64,
    pub frames_dropped: u64,
    pub chunks_captured: u64,
    pub chunks_dropped: u64,
    pub write_errors: u64,
    pub stats: StreamStats,
}

// ── AgentService ─────────────────────────────────────────────────

pub struct AgentService {
    config: AgentConfig,
    running: Arc<AtomicBool>,
}

impl AgentService {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle that stops the service when set to `false`.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stream until stopped.
    pub async fn run(&self, options: RunOptions) -> Result<AgentReport, Box<dyn std::error::Error>> {
        self.running.store(true, Ordering::SeqCst);
        let started = Instant::now();

        let stream_config = self.config.to_stream_config();
        let settings = SourceSettings {
            width: stream_config.width,
            height: stream_config.height,
            fps: self.config.capture.fps.clamp(1, 120),
            sample_rate: stream_config.audio.sample_rate,
            channel_count: stream_config.audio.channel_count,
            chunk_bytes: stream_config.audio.max_input_size,
            camera: self.config.capture.camera,
            switch_every: self.config.capture.switch_every,
        };

        let client = Arc::new(StreamClient::prepare(
            stream_config,
            Arc::new(SoftwareCodecFactory::new()),
            muxer::for_url(&options.url),
        )?);
        let mut events = client
            .take_events()
            .ok_or("event channel already taken")?;

        client.start_streaming(&options.url)?;
        let mut source = SyntheticSource::spawn(Arc::clone(&client), settings)?;
        let counters = source.counters();

        let deadline = options.duration.map(|d| started + d);
        let stats_every = Duration::from_secs(self.config.logging.stats_interval_secs.max(1));
        let stats_enabled = self.config.logging.stats_interval_secs > 0;
        let mut stats_tick = tokio::time::interval(stats_every);
        stats_tick.tick().await;

        let mut write_errors = 0u64;
        let mut failure: Option<String> = None;

        while self.running.load(Ordering::SeqCst) {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                info!("requested duration reached");
                break;
            }
            tokio::select! {
                Some(event) = events.recv() => {
                    match event {
                        StreamEvent::OpenConnectionResult { code: 0 } => {
                            info!(url = %options.url, "connection open");
                        }
                        StreamEvent::OpenConnectionResult { code } => {
                            error!(code, "connection failed");
                            failure = Some(format!("connection to {} failed with code {code}", options.url));
                            break;
                        }
                        StreamEvent::CloseConnectionResult { code } => {
                            info!(code, "connection closed");
                        }
                        StreamEvent::WriteError { code } => {
                            write_errors += 1;
                            warn!(code, total = write_errors, "write error");
                        }
                    }
                }
                _ = stats_tick.tick(), if stats_enabled => {
                    report_stats(&client.stats(), options.json_stats);
                }
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }

        // Teardown joins worker threads.
        let teardown_client = Arc::clone(&client);
        let stats = tokio::task::spawn_blocking(move || {
            source.stop();
            let stats = teardown_client.stats();
            teardown_client.stop_streaming();
            teardown_client.destroy();
            stats
        })
        .await?;
        self.running.store(false, Ordering::SeqCst);

        if let Some(reason) = failure {
            return Err(reason.into());
        }

        Ok(AgentReport {
            url: options.url,
            elapsed_secs: started.elapsed().as_secs_f64(),
            frames_captured: counters.frames.load(Ordering::Relaxed),
            frames_dropped: counters.frames_dropped.load(Ordering::Relaxed),
            chunks_captured: counters.chunks.load(Ordering::Relaxed),
            chunks_dropped: counters.chunks_dropped.load(Ordering::Relaxed),
            write_errors,
            stats,
        })
    }
}

fn report_stats(stats: &StreamStats, json: bool) {
    if json {
        match serde_json::to_string(stats) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!("failed to serialise stats: {e}"),
        }
        return;
    }
    info!(
        draw_fps = format_args!("{:.1}", stats.draw_fps),
        send_fps = format_args!("{:.1}", stats.send_fps),
        kbps = stats.total_speed * 8 / 1000,
        free = format_args!("{:.0}%", stats.buffer_free_percent),
        dropped = stats.dropped_full + stats.dropped_crowded,
        "stats"
    );
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_config() -> AgentConfig {
        let mut cfg = AgentConfig::default();
        cfg.video.width = 32;
        cfg.video.height = 16;
        cfg.logging.stats_interval_secs = 0;
        cfg
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn null_stream_runs_for_duration() {
        let service = AgentService::new(tiny_config());
        let report = service
            .run(RunOptions {
                url: "null://".into(),
                duration: Some(Duration::from_millis(700)),
                json_stats: false,
            })
            .await
            .unwrap();
        assert!(report.frames_captured > 0);
        assert!(report.chunks_captured > 0);
        assert!(report.stats.written > 0);
        assert_eq!(report.write_errors, 0);
        assert!(!service.is_running());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unreachable_endpoint_fails() {
        // Bind then drop to get a port with nothing listening.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let service = AgentService::new(tiny_config());
        let result = service
            .run(RunOptions {
                url: format!("tcp://127.0.0.1:{port}"),
                duration: Some(Duration::from_secs(5)),
                json_stats: false,
            })
            .await;
        assert!(result.is_err());
    }
}
