//! restream agent: entry point.
//!
//! ```text
//! restream-cli                       Stream to the configured URL
//! restream-cli --url tcp://h:p       Override the destination
//! restream-cli --duration 30         Stop after 30 seconds
//! restream-cli --config <path>       Load a custom config TOML
//! restream-cli --gen-config          Write default config to stdout
//! restream-cli --json-stats          Emit stats lines as JSON
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use restream_cli::config::AgentConfig;
use restream_cli::service::{AgentService, RunOptions};

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "restream-cli", about = "Live streaming agent with a synthetic capture source")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "restream.toml")]
    config: PathBuf,

    /// Destination URL (overrides `stream.url`).
    #[arg(short, long)]
    url: Option<String>,

    /// Stop after this many seconds.
    #[arg(short, long)]
    duration: Option<u64>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    /// Print periodic stats and the final report as JSON.
    #[arg(long)]
    json_stats: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&AgentConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    // Load config.
    let config = AgentConfig::load(&cli.config);

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let url = cli.url.clone().unwrap_or_else(|| config.stream.url.clone());
    info!("restream-cli v{}", env!("CARGO_PKG_VERSION"));
    info!("destination: {url}");
    info!(
        "video: {}x{} @ {} fps, {} bps",
        config.video.width, config.video.height, config.video.fps, config.video.bit_rate
    );
    info!(
        "audio: {} Hz x{}, {} bps",
        config.audio.sample_rate, config.audio.channel_count, config.audio.bit_rate
    );

    let service = AgentService::new(config);
    let stop = service.stop_handle();

    // Ctrl-C handler.
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop.store(false, std::sync::atomic::Ordering::SeqCst);
    });

    let report = service
        .run(RunOptions {
            url,
            duration: cli.duration.map(Duration::from_secs),
            json_stats: cli.json_stats,
        })
        .await?;

    if cli.json_stats {
        println!("{}", serde_json::to_string(&report)?);
    } else {
        info!(
            "streamed {:.1}s: {} frames ({} dropped), {} audio chunks, {} units written",
            report.elapsed_secs,
            report.frames_captured,
            report.frames_dropped,
            report.chunks_captured,
            report.stats.written
        );
    }

    Ok(())
}
