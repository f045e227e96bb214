//! Muxers the agent can stream into.
//!
//! [`FramedTcpMuxer`] writes length-prefixed records over TCP:
//!
//! ```text
//! ┌──────┬──────────┬──────────┬─────────────┐
//! │ tag  │ dts (BE) │ len (BE) │ payload     │
//! │ u8   │ u32      │ u32      │ len bytes   │
//! └──────┴──────────┴──────────┴─────────────┘
//! ```
//!
//! Tags follow FLV: 8 = audio, 9 = video. Tag 0 is sent once after
//! connecting and carries the frame size as two big-endian `u16`s.
//!
//! [`NullMuxer`] accepts everything and only counts.

use std::io::{BufWriter, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{debug, info};

use restream_core::{Muxer, MuxerError};

pub const TAG_HEADER: u8 = 0;
pub const TAG_AUDIO: u8 = 8;
pub const TAG_VIDEO: u8 = 9;

/// Record header size in bytes.
pub const RECORD_HEADER: usize = 9;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Error codes for failures that carry no OS error number.
const ERR_BAD_URL: i32 = -22;
const ERR_NOT_CONNECTED: i32 = -107;
const ERR_UNKNOWN: i32 = -1;

fn io_code(e: &std::io::Error) -> i32 {
    e.raw_os_error().map(|c| -c.abs()).unwrap_or(ERR_UNKNOWN)
}

/// `host:port` from `tcp://host:port` or `rtmp://host:port/app/key`.
pub fn parse_endpoint(url: &str) -> Option<String> {
    let rest = url
        .strip_prefix("tcp://")
        .or_else(|| url.strip_prefix("rtmp://"))?;
    let authority = rest.split('/').next()?;
    if authority.is_empty() {
        return None;
    }
    if authority.contains(':') {
        Some(authority.to_string())
    } else if url.starts_with("rtmp://") {
        Some(format!("{authority}:1935"))
    } else {
        None
    }
}

/// Pick a muxer for `url`.
pub fn for_url(url: &str) -> Box<dyn Muxer> {
    if url.starts_with("null://") {
        Box::new(NullMuxer::default())
    } else {
        Box::new(FramedTcpMuxer::new())
    }
}

// ── FramedTcpMuxer ───────────────────────────────────────────────

/// Length-prefixed records over a plain TCP connection.
#[derive(Default)]
pub struct FramedTcpMuxer {
    stream: Option<BufWriter<TcpStream>>,
}

impl FramedTcpMuxer {
    pub fn new() -> Self {
        Self::default()
    }

    fn write_record(&mut self, tag: u8, dts_ms: u32, payload: &[u8]) -> Result<usize, MuxerError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or(MuxerError::new(ERR_NOT_CONNECTED))?;
        let mut header = [0u8; RECORD_HEADER];
        header[0] = tag;
        header[1..5].copy_from_slice(&dts_ms.to_be_bytes());
        header[5..9].copy_from_slice(&(payload.len() as u32).to_be_bytes());

        let result = stream
            .write_all(&header)
            .and_then(|()| stream.write_all(payload))
            .and_then(|()| stream.flush());
        match result {
            Ok(()) => Ok(RECORD_HEADER + payload.len()),
            Err(e) => Err(MuxerError::new(io_code(&e))),
        }
    }
}

impl Muxer for FramedTcpMuxer {
    fn open(&mut self, url: &str, width: u32, height: u32) -> Result<(), MuxerError> {
        let endpoint = parse_endpoint(url).ok_or(MuxerError::new(ERR_BAD_URL))?;
        let addr = endpoint
            .to_socket_addrs()
            .map_err(|e| MuxerError::new(io_code(&e)))?
            .next()
            .ok_or(MuxerError::new(ERR_BAD_URL))?;
        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
            .map_err(|e| MuxerError::new(io_code(&e)))?;
        let _ = stream.set_nodelay(true);
        self.stream = Some(BufWriter::new(stream));

        let mut size = [0u8; 4];
        size[..2].copy_from_slice(&(width.min(u16::MAX as u32) as u16).to_be_bytes());
        size[2..].copy_from_slice(&(height.min(u16::MAX as u32) as u16).to_be_bytes());
        self.write_record(TAG_HEADER, 0, &size)?;
        info!(%addr, "framed tcp muxer connected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn write_video(&mut self, data: &[u8], dts_ms: u32) -> Result<usize, MuxerError> {
        self.write_record(TAG_VIDEO, dts_ms, data)
    }

    fn write_audio(&mut self, data: &[u8], dts_ms: u32) -> Result<usize, MuxerError> {
        self.write_record(TAG_AUDIO, dts_ms, data)
    }

    fn close(&mut self) -> Result<(), MuxerError> {
        let Some(mut stream) = self.stream.take() else {
            return Ok(());
        };
        let flushed = stream.flush();
        let shutdown = stream
            .get_ref()
            .shutdown(std::net::Shutdown::Both);
        debug!("framed tcp muxer closed");
        flushed
            .and(shutdown)
            .map_err(|e| MuxerError::new(io_code(&e)))
    }
}

// ── NullMuxer ────────────────────────────────────────────────────

/// Byte counters shared with the agent for reporting.
#[derive(Debug, Default)]
pub struct NullCounters {
    pub video_bytes: AtomicU64,
    pub audio_bytes: AtomicU64,
}

/// Discards everything it is given.
#[derive(Default)]
pub struct NullMuxer {
    open: bool,
    counters: Arc<NullCounters>,
}

impl NullMuxer {
    pub fn counters(&self) -> Arc<NullCounters> {
        Arc::clone(&self.counters)
    }
}

impl Muxer for NullMuxer {
    fn open(&mut self, _url: &str, _width: u32, _height: u32) -> Result<(), MuxerError> {
        self.open = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.open
    }

    fn write_video(&mut self, data: &[u8], _dts_ms: u32) -> Result<usize, MuxerError> {
        self.counters
            .video_bytes
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(data.len())
    }

    fn write_audio(&mut self, data: &[u8], _dts_ms: u32) -> Result<usize, MuxerError> {
        self.counters
            .audio_bytes
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(data.len())
    }

    fn close(&mut self) -> Result<(), MuxerError> {
        self.open = false;
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────
