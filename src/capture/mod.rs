//! Packet capture module for httptap
//!
//! This module handles frame acquisition from network interfaces and defines
//! the fatal error taxonomy the lifecycle controller reports.

pub mod live;

use std::fmt;
use std::sync::atomic::AtomicBool;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    /// Named interface missing, or no default device could be resolved.
    #[error("invalid interface: {0}")]
    InvalidInterface(String),

    /// Handle open, datalink, or filter installation failed.
    #[error("failed to open capture: {0}")]
    OpenFailed(String),

    /// The capture loop failed after a successful start.
    #[error("capture loop failed: {0}")]
    Unrecoverable(String),
}

impl CaptureError {
    /// The wire-level code reported to the embedder for this error.
    pub fn code(&self) -> FatalCode {
        match self {
            CaptureError::InvalidInterface(_) => FatalCode::InvalidInterface,
            CaptureError::OpenFailed(_) => FatalCode::CaptureOpenFailed,
            CaptureError::Unrecoverable(_) => FatalCode::Unrecoverable,
        }
    }
}

/// Fatal error codes surfaced to the embedder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalCode {
    CaptureOpenFailed,
    InvalidInterface,
    Unrecoverable,
}

impl FatalCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FatalCode::CaptureOpenFailed => "CAPTURE_OPEN_FAILED",
            FatalCode::InvalidInterface => "INVALID_INTERFACE",
            FatalCode::Unrecoverable => "UNRECOVERABLE",
        }
    }
}

impl fmt::Display for FatalCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capture interface statistics, read from the handle on stop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    /// Packets received by the capture facility.
    pub packets_received: u64,
    /// Packets dropped by the capture facility.
    pub packets_dropped: u64,
    /// Packets dropped by the network interface.
    pub packets_if_dropped: u64,
}

/// Frame source abstraction for the capture thread.
///
/// `run` blocks pulling frames and hands each raw frame buffer to `handler`
/// until `stop` is set or the source fails. Implementations must check
/// `stop` at least once per read timeout so `stop()` completes in bounded
/// time.
pub trait PacketSource: Send + 'static {
    fn run(
        &mut self,
        stop: &AtomicBool,
        handler: &mut dyn FnMut(&[u8]),
    ) -> Result<(), CaptureError>;

    /// Interface statistics, if the source exposes them. Read after `run`
    /// returns.
    fn stats(&mut self) -> Option<CaptureStats>;
}

/// Build a BPF filter expression from the configured ports, in order.
pub fn bpf_filter(ports: &[u16]) -> String {
    if ports.is_empty() {
        return "tcp".to_string();
    }
    let mut filter = format!("tcp port {}", ports[0]);
    for port in &ports[1..] {
        filter.push_str(&format!(" or tcp port {}", port));
    }
    filter
}
