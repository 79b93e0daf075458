//! Delivery bridge module
//!
//! This module carries completed message records and control events from the
//! capture thread to the embedder's consumer thread.

use crate::capture::{CaptureStats, FatalCode};
use crate::protocols::http::HttpMessage;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use tracing::warn;

/// Default bound on queued events.
pub const EVENT_BUFFER: usize = 1_024;

/// A fatal, asynchronous capture failure.
#[derive(Debug, Clone)]
pub struct FatalError {
    pub code: FatalCode,
    pub message: String,
}

/// Events crossing the capture-thread / embedder boundary.
#[derive(Debug)]
pub enum Event {
    Message(Box<HttpMessage>),
    FatalError(FatalError),
    /// Always the final event of a capture run.
    CaptureStopped { stats: Option<CaptureStats> },
}

/// Producer half of the bridge, held by the capture thread.
///
/// `Message` events are dropped (and counted) when the buffer is full so the
/// capture loop never stalls; control events block until queued and are
/// never lost.
#[derive(Clone)]
pub struct EventSender {
    tx: SyncSender<Event>,
    overflow: Arc<AtomicU64>,
    overflow_logged: Arc<AtomicBool>,
}

impl EventSender {
    pub fn send_message(&self, message: HttpMessage) -> bool {
        match self.tx.try_send(Event::Message(Box::new(message))) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.overflow.fetch_add(1, Ordering::Relaxed);
                if !self.overflow_logged.swap(true, Ordering::Relaxed) {
                    warn!("delivery buffer full, dropping newest message");
                }
                false
            }
        }
    }

    pub fn send_fatal(&self, error: FatalError) {
        let _ = self.tx.send(Event::FatalError(error));
    }

    pub fn send_stopped(&self, stats: Option<CaptureStats>) {
        let _ = self.tx.send(Event::CaptureStopped { stats });
    }

    /// Messages dropped because the buffer was full.
    pub fn overflow_count(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }
}

/// Create a bounded bridge with the given capacity.
pub fn bridge(capacity: usize) -> (EventSender, Receiver<Event>) {
    let (tx, rx) = sync_channel(capacity);
    (
        EventSender {
            tx,
            overflow: Arc::new(AtomicU64::new(0)),
            overflow_logged: Arc::new(AtomicBool::new(false)),
        },
        rx,
    )
}
