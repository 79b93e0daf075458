//! Lifecycle controller module
//!
//! This module owns the capture and delivery threads and exposes the public
//! start/stop surface of the core.

use crate::capture::live::LiveCapture;
use crate::capture::{CaptureError, CaptureStats, PacketSource};
use crate::config::CaptureSettings;
use crate::core::bridge::{bridge, Event, EventSender, FatalError, EVENT_BUFFER};
use crate::core::packet::decode_frame;
use crate::core::reassembly::{ChunkSink, Reassembler, StreamChunk};
use crate::protocols::http::{HttpMessage, HttpStreamParser};
use crate::utils::metrics::PipelineMetrics;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::{error, info};

#[derive(Error, Debug)]
pub enum StartError {
    #[error("capture already running; call stop() first")]
    AlreadyRunning,

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error("failed to spawn capture thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Routes ordered stream chunks to per-(connection, direction) HTTP parsers
/// and completed messages into the bridge.
///
/// Parsers are created lazily on the first chunk of a direction and dropped
/// when the reassembler evicts their connection.
struct HttpDispatcher {
    parsers: HashMap<(String, bool), HttpStreamParser>,
    max_body_size: usize,
    events: EventSender,
    metrics: Arc<PipelineMetrics>,
}

impl ChunkSink for HttpDispatcher {
    fn on_chunk(&mut self, chunk: StreamChunk) {
        let Self {
            parsers,
            max_body_size,
            events,
            metrics,
        } = self;
        metrics.record_chunk();

        let parser = parsers
            .entry((chunk.connection_id.clone(), chunk.client_to_server))
            .or_insert_with(|| {
                HttpStreamParser::new(
                    chunk.connection_id.clone(),
                    chunk.receiver.clone(),
                    chunk.destination.clone(),
                    chunk.client_to_server,
                    *max_body_size,
                )
            });
        parser.feed(&chunk.data, &mut |message| {
            metrics.record_message();
            events.send_message(message);
        });
    }

    fn on_evict(&mut self, connection_id: &str) {
        self.metrics.record_eviction();
        self.parsers.retain(|(id, _), _| id != connection_id);
    }
}

struct Worker {
    stop: Arc<AtomicBool>,
    capture_thread: JoinHandle<()>,
    delivery_thread: JoinHandle<Option<CaptureStats>>,
}

/// Public lifecycle controller.
///
/// At most one capture runs between a successful `start` and the next
/// `stop`. All parser and reassembly state lives on the capture thread; the
/// embedder only ever touches the controller and the delivery callbacks.
pub struct Sniffer {
    worker: Mutex<Option<Worker>>,
    running: Arc<AtomicBool>,
    last_error: Arc<Mutex<Option<FatalError>>>,
    metrics: Arc<PipelineMetrics>,
}

impl Sniffer {
    pub fn new() -> Self {
        Self {
            worker: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            last_error: Arc::new(Mutex::new(None)),
            metrics: Arc::new(PipelineMetrics::new()),
        }
    }

    /// Open the capture handle and launch the pipeline.
    ///
    /// Returns once the handle is open, the filter is installed, and the
    /// capture and delivery threads are spawned. `on_message` receives every
    /// completed message on the delivery thread; `on_error` receives
    /// asynchronous fatal failures.
    pub fn start<M, E>(
        &self,
        settings: CaptureSettings,
        on_message: M,
        on_error: E,
    ) -> Result<(), StartError>
    where
        M: FnMut(HttpMessage) + Send + 'static,
        E: FnMut(FatalError) + Send + 'static,
    {
        let source = LiveCapture::open(&settings).map_err(|e| {
            let fatal = FatalError {
                code: e.code(),
                message: e.to_string(),
            };
            *self.last_error.lock().unwrap() = Some(fatal);
            StartError::Capture(e)
        })?;
        self.start_with_source(Box::new(source), settings, on_message, on_error)
    }

    /// Launch the pipeline over an already-open source. Seam for tests and
    /// alternative capture backends.
    pub(crate) fn start_with_source<M, E>(
        &self,
        source: Box<dyn PacketSource>,
        settings: CaptureSettings,
        on_message: M,
        mut on_error: E,
    ) -> Result<(), StartError>
    where
        M: FnMut(HttpMessage) + Send + 'static,
        E: FnMut(FatalError) + Send + 'static,
    {
        let mut worker_slot = self.worker.lock().unwrap();
        if worker_slot.is_some() {
            return Err(StartError::AlreadyRunning);
        }
        *self.last_error.lock().unwrap() = None;

        let (events, receiver) = bridge(EVENT_BUFFER);
        let stop = Arc::new(AtomicBool::new(false));

        let capture_stop = Arc::clone(&stop);
        let capture_metrics = Arc::clone(&self.metrics);
        let capture_thread = thread::Builder::new()
            .name("httptap-capture".to_string())
            .spawn(move || run_capture(source, settings, capture_stop, events, capture_metrics))?;

        let last_error = Arc::clone(&self.last_error);
        let delivery_thread = thread::Builder::new()
            .name("httptap-delivery".to_string())
            .spawn(move || {
                let mut on_message = on_message;
                let mut stats: Option<CaptureStats> = None;
                for event in receiver.iter() {
                    match event {
                        Event::Message(message) => on_message(*message),
                        Event::FatalError(fatal) => {
                            error!(code = %fatal.code, message = %fatal.message, "capture failed");
                            *last_error.lock().unwrap() = Some(fatal.clone());
                            on_error(fatal);
                        }
                        Event::CaptureStopped { stats: s } => {
                            stats = s;
                            break;
                        }
                    }
                }
                stats
            })?;

        *worker_slot = Some(Worker {
            stop,
            capture_thread,
            delivery_thread,
        });
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Stop the capture, drain queued messages, and release the handle.
    ///
    /// Idempotent; returns interface statistics when the capture facility
    /// exposed them.
    pub fn stop(&self) -> Option<CaptureStats> {
        let worker = self.worker.lock().unwrap().take();
        let Some(worker) = worker else {
            return None;
        };
        self.running.store(false, Ordering::SeqCst);

        worker.stop.store(true, Ordering::SeqCst);
        if worker.capture_thread.join().is_err() {
            error!("capture thread panicked");
        }
        // The delivery thread exits only after observing CaptureStopped, so
        // every message queued before the stop signal reaches the sink.
        let stats = match worker.delivery_thread.join() {
            Ok(stats) => stats,
            Err(_) => {
                error!("delivery thread panicked");
                None
            }
        };

        match &stats {
            Some(s) => info!(
                packets_received = s.packets_received,
                packets_dropped = s.packets_dropped,
                packets_if_dropped = s.packets_if_dropped,
                "capture stopped"
            ),
            None => info!("capture stopped"),
        }
        stats
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The most recent fatal error, from a failed `start` or an
    /// asynchronous capture failure.
    pub fn last_error(&self) -> Option<FatalError> {
        self.last_error.lock().unwrap().clone()
    }

    /// Pipeline counters for the current or most recent capture.
    pub fn metrics(&self) -> Arc<PipelineMetrics> {
        Arc::clone(&self.metrics)
    }
}

impl Default for Sniffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Body of the capture thread: pull frames, decode, reassemble, parse, and
/// enqueue. Always terminates with a `CaptureStopped` event.
fn run_capture(
    mut source: Box<dyn PacketSource>,
    settings: CaptureSettings,
    stop: Arc<AtomicBool>,
    events: EventSender,
    metrics: Arc<PipelineMetrics>,
) {
    let mut reassembler = Reassembler::new(&settings);
    let mut dispatcher = HttpDispatcher {
        parsers: HashMap::new(),
        max_body_size: settings.max_body_size,
        events: events.clone(),
        metrics: Arc::clone(&metrics),
    };
    let idle_sweep_watermark = settings.max_concurrent_connections / 2;

    let result = source.run(&stop, &mut |frame| {
        metrics.record_frame();
        if let Some(segment) = decode_frame(frame) {
            metrics.record_segment();
            reassembler.push_segment(&segment, &mut dispatcher);
            if reassembler.connection_count() > idle_sweep_watermark {
                reassembler.evict_idle(reassembler.now_ms(), &mut dispatcher);
            }
        }
    });

    if let Err(e) = result {
        events.send_fatal(FatalError {
            code: e.code(),
            message: e.to_string(),
        });
    }
    events.send_stopped(source.stats());
}
