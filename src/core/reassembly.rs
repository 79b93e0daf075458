//! TCP stream reassembly module
//!
//! This module tracks connections keyed by a canonical id, orders each
//! direction's payload bytes by sequence number, and enforces the connection
//! cap and idle timeout.

use crate::config::CaptureSettings;
use crate::core::packet::{Endpoint, TcpSegment};
use crate::utils::{is_sampled, MonotonicClock};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Canonical connection id: both endpoints joined with the smaller one
/// first, so both directions of a connection map to the same key.
pub fn connection_key(src: &Endpoint, dst: &Endpoint) -> String {
    let a = src.to_string();
    let b = dst.to_string();
    if a < b {
        format!("{}-{}", a, b)
    } else {
        format!("{}-{}", b, a)
    }
}

/// An ordered chunk of stream data for one direction of one connection.
#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub connection_id: String,
    pub receiver: Endpoint,
    pub destination: Endpoint,
    /// true for client-to-server (request) data.
    pub client_to_server: bool,
    pub data: Vec<u8>,
}

/// Downstream consumer of ordered chunks and eviction notices.
///
/// `on_evict` fires once per removed connection so per-connection parser
/// state can be released with it.
pub trait ChunkSink {
    fn on_chunk(&mut self, chunk: StreamChunk);
    fn on_evict(&mut self, connection_id: &str);
}

/// Per-direction sequencing state.
#[derive(Debug, Default)]
struct StreamState {
    next_seq: u32,
    initial_seq_set: bool,
    /// Out-of-order segments waiting for the stream to catch up, keyed by
    /// sequence number.
    pending: BTreeMap<u32, Vec<u8>>,
    gap_logged: bool,
}

/// Per-connection record owning both directions.
#[derive(Debug)]
struct ConnectionState {
    receiver: Endpoint,
    destination: Endpoint,
    client_to_server: StreamState,
    server_to_client: StreamState,
    created_at_ms: u64,
    last_activity_ms: u64,
    /// Admission counter; breaks `created_at_ms` ties so cap eviction stays
    /// strictly FIFO.
    admission: u64,
}

/// Reassembles TCP segments into ordered per-direction byte streams.
///
/// Single-threaded: only the capture thread touches this.
pub struct Reassembler {
    ports: Vec<u16>,
    sample_rate: f64,
    max_connections: usize,
    idle_timeout_ms: u64,
    connections: HashMap<String, ConnectionState>,
    clock: MonotonicClock,
    next_admission: u64,
}

impl Reassembler {
    pub fn new(settings: &CaptureSettings) -> Self {
        Self {
            ports: settings.ports.clone(),
            sample_rate: settings.sample_rate,
            max_connections: settings.max_concurrent_connections,
            idle_timeout_ms: settings.connection_idle_timeout_ms,
            connections: HashMap::new(),
            clock: MonotonicClock::new(),
            next_admission: 0,
        }
    }

    /// Current time on the reassembly clock, for `evict_idle`.
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Number of currently tracked connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Admit one decoded segment, emitting zero or more ordered chunks.
    pub fn push_segment(&mut self, segment: &TcpSegment, sink: &mut dyn ChunkSink) {
        let key = connection_key(&segment.tuple.src, &segment.tuple.dst);
        if !is_sampled(&key, self.sample_rate) {
            return;
        }

        let now = self.clock.now_ms();
        let receiver_is_src = self.receiver_is_source(segment);
        let admission = &mut self.next_admission;
        let conn = self.connections.entry(key.clone()).or_insert_with(|| {
            let (receiver, destination) = if receiver_is_src {
                (segment.tuple.src.clone(), segment.tuple.dst.clone())
            } else {
                (segment.tuple.dst.clone(), segment.tuple.src.clone())
            };
            *admission += 1;
            ConnectionState {
                receiver,
                destination,
                client_to_server: StreamState::default(),
                server_to_client: StreamState::default(),
                created_at_ms: now,
                last_activity_ms: now,
                admission: *admission,
            }
        });
        conn.last_activity_ms = now;

        // Requests flow from the destination (client) toward the receiver.
        let client_to_server = segment.tuple.src == conn.destination;
        let receiver = conn.receiver.clone();
        let destination = conn.destination.clone();
        let stream = if client_to_server {
            &mut conn.client_to_server
        } else {
            &mut conn.server_to_client
        };

        if segment.payload.is_empty() {
            // SYN consumes one sequence number.
            if segment.syn && !stream.initial_seq_set {
                stream.next_seq = segment.seq.wrapping_add(1);
                stream.initial_seq_set = true;
            }
        } else {
            deliver_ordered(
                stream,
                &key,
                &receiver,
                &destination,
                client_to_server,
                segment,
                sink,
            );
        }

        self.enforce_cap(sink);
    }

    /// Remove connections idle longer than the timeout, then apply the cap.
    pub fn evict_idle(&mut self, now_ms: u64, sink: &mut dyn ChunkSink) {
        let timeout = self.idle_timeout_ms;
        let expired: Vec<String> = self
            .connections
            .iter()
            .filter(|(_, conn)| now_ms.saturating_sub(conn.last_activity_ms) >= timeout)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.connections.remove(&key);
            debug!(connection = %key, "idle connection evicted");
            sink.on_evict(&key);
        }

        self.enforce_cap(sink);
    }

    fn enforce_cap(&mut self, sink: &mut dyn ChunkSink) {
        while self.connections.len() > self.max_connections {
            let oldest = self
                .connections
                .iter()
                .min_by_key(|(_, conn)| (conn.created_at_ms, conn.admission))
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    self.connections.remove(&key);
                    debug!(connection = %key, "connection cap exceeded, evicted oldest");
                    sink.on_evict(&key);
                }
                None => break,
            }
        }
    }

    /// Whichever side has its port among the configured ports is the
    /// receiver. Ports are scanned in configured order with the source side
    /// checked first, so the source wins when both sides match.
    fn receiver_is_source(&self, segment: &TcpSegment) -> bool {
        for &port in &self.ports {
            if segment.tuple.src.port == port {
                return true;
            }
            if segment.tuple.dst.port == port {
                return false;
            }
        }
        false
    }
}

fn deliver_ordered(
    stream: &mut StreamState,
    key: &str,
    receiver: &Endpoint,
    destination: &Endpoint,
    client_to_server: bool,
    segment: &TcpSegment,
    sink: &mut dyn ChunkSink,
) {
    if !stream.initial_seq_set {
        stream.next_seq = segment.seq;
        stream.initial_seq_set = true;
    }

    if segment.seq == stream.next_seq {
        stream.next_seq = segment.seq.wrapping_add(segment.payload.len() as u32);
        sink.on_chunk(StreamChunk {
            connection_id: key.to_string(),
            receiver: receiver.clone(),
            destination: destination.clone(),
            client_to_server,
            data: segment.payload.clone(),
        });

        // Drain any buffered segments the stream has caught up to.
        while let Some((&pending_seq, _)) = stream.pending.iter().next() {
            if pending_seq == stream.next_seq {
                let data = stream
                    .pending
                    .remove(&pending_seq)
                    .unwrap_or_default();
                stream.next_seq = pending_seq.wrapping_add(data.len() as u32);
                sink.on_chunk(StreamChunk {
                    connection_id: key.to_string(),
                    receiver: receiver.clone(),
                    destination: destination.clone(),
                    client_to_server,
                    data,
                });
            } else if pending_seq > stream.next_seq {
                if !stream.gap_logged {
                    stream.gap_logged = true;
                    debug!(
                        connection = %key,
                        direction = direction_name(client_to_server),
                        "reassembly gap, buffering ahead of stream"
                    );
                }
                break;
            } else {
                // Stale retransmit that the stream has already passed.
                stream.pending.remove(&pending_seq);
            }
        }
    } else if segment.seq > stream.next_seq {
        stream
            .pending
            .entry(segment.seq)
            .or_insert_with(|| segment.payload.clone());
    }
    // seq < next_seq: retransmit inside the delivered window, dropped.
}

pub(crate) fn direction_name(client_to_server: bool) -> &'static str {
    if client_to_server {
        "client_to_server"
    } else {
        "server_to_client"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::packet::FourTuple;

    #[derive(Default)]
    struct VecSink {
        chunks: Vec<StreamChunk>,
        evicted: Vec<String>,
    }

    impl ChunkSink for VecSink {
        fn on_chunk(&mut self, chunk: StreamChunk) {
            self.chunks.push(chunk);
        }

        fn on_evict(&mut self, connection_id: &str) {
            self.evicted.push(connection_id.to_string());
        }
    }

    fn settings(ports: Vec<u16>) -> CaptureSettings {
        CaptureSettings {
            ports,
            ..CaptureSettings::default()
        }
    }

    fn segment(
        src_ip: &str,
        src_port: u16,
        dst_ip: &str,
        dst_port: u16,
        seq: u32,
        syn: bool,
        payload: &[u8],
    ) -> TcpSegment {
        TcpSegment {
            tuple: FourTuple {
                src: Endpoint::new(src_ip.to_string(), src_port),
                dst: Endpoint::new(dst_ip.to_string(), dst_port),
            },
            seq,
            ack: 0,
            syn,
            fin: false,
            rst: false,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn test_connection_key_is_direction_independent() {
        let a = Endpoint::new("10.0.0.1".to_string(), 1234);
        let b = Endpoint::new("10.0.0.2".to_string(), 80);
        assert_eq!(connection_key(&a, &b), connection_key(&b, &a));
    }

    #[test]
    fn test_in_order_delivery() {
        let mut reassembler = Reassembler::new(&settings(vec![80]));
        let mut sink = VecSink::default();
        reassembler.push_segment(&segment("1.1.1.1", 9999, "2.2.2.2", 80, 100, false, b"GET "), &mut sink);
        reassembler.push_segment(&segment("1.1.1.1", 9999, "2.2.2.2", 80, 104, false, b"/ "), &mut sink);
        let bytes: Vec<u8> = sink.chunks.iter().flat_map(|c| c.data.clone()).collect();
        assert_eq!(bytes, b"GET / ");
        assert!(sink.chunks.iter().all(|c| c.client_to_server));
    }

    #[test]
    fn test_syn_sets_initial_sequence() {
        let mut reassembler = Reassembler::new(&settings(vec![80]));
        let mut sink = VecSink::default();
        reassembler.push_segment(&segment("1.1.1.1", 9999, "2.2.2.2", 80, 99, true, b""), &mut sink);
        reassembler.push_segment(&segment("1.1.1.1", 9999, "2.2.2.2", 80, 100, false, b"AB"), &mut sink);
        assert_eq!(sink.chunks.len(), 1);
        assert_eq!(sink.chunks[0].data, b"AB");
    }

    #[test]
    fn test_reorder_and_retransmit_dedupe() {
        // SYN establishes next_seq = 1000, then segments arrive as
        // (1002, 1000, 1000, 1002). Exactly "AB" then "CD" must come out.
        let mut reassembler = Reassembler::new(&settings(vec![80]));
        let mut sink = VecSink::default();
        reassembler.push_segment(&segment("1.1.1.1", 9999, "2.2.2.2", 80, 999, true, b""), &mut sink);
        reassembler.push_segment(&segment("1.1.1.1", 9999, "2.2.2.2", 80, 1002, false, b"CD"), &mut sink);
        assert!(sink.chunks.is_empty());
        reassembler.push_segment(&segment("1.1.1.1", 9999, "2.2.2.2", 80, 1000, false, b"AB"), &mut sink);
        reassembler.push_segment(&segment("1.1.1.1", 9999, "2.2.2.2", 80, 1000, false, b"AB"), &mut sink);
        reassembler.push_segment(&segment("1.1.1.1", 9999, "2.2.2.2", 80, 1002, false, b"CD"), &mut sink);
        let data: Vec<&[u8]> = sink.chunks.iter().map(|c| c.data.as_slice()).collect();
        assert_eq!(data, vec![b"AB".as_slice(), b"CD".as_slice()]);
    }

    #[test]
    fn test_reordering_yields_same_bytes_as_in_order() {
        let segments = [
            segment("1.1.1.1", 9999, "2.2.2.2", 80, 10, false, b"aaa"),
            segment("1.1.1.1", 9999, "2.2.2.2", 80, 13, false, b"bb"),
            segment("1.1.1.1", 9999, "2.2.2.2", 80, 15, false, b"cccc"),
        ];

        let mut in_order_sink = VecSink::default();
        let mut reassembler = Reassembler::new(&settings(vec![80]));
        for seg in &segments {
            reassembler.push_segment(seg, &mut in_order_sink);
        }

        let mut reordered_sink = VecSink::default();
        let mut reassembler = Reassembler::new(&settings(vec![80]));
        reassembler.push_segment(&segments[0], &mut reordered_sink);
        reassembler.push_segment(&segments[2], &mut reordered_sink);
        reassembler.push_segment(&segments[1], &mut reordered_sink);

        let flatten = |sink: &VecSink| -> Vec<u8> {
            sink.chunks.iter().flat_map(|c| c.data.clone()).collect()
        };
        assert_eq!(flatten(&in_order_sink), flatten(&reordered_sink));
    }

    #[test]
    fn test_receiver_classification() {
        let mut reassembler = Reassembler::new(&settings(vec![8080]));
        let mut sink = VecSink::default();
        // Server-to-client data: source port is the configured one.
        reassembler.push_segment(&segment("2.2.2.2", 8080, "1.1.1.1", 9999, 1, false, b"HTTP/"), &mut sink);
        assert_eq!(sink.chunks.len(), 1);
        let chunk = &sink.chunks[0];
        assert!(!chunk.client_to_server);
        assert_eq!(chunk.receiver.port, 8080);
        assert_eq!(chunk.destination.port, 9999);
    }

    #[test]
    fn test_cap_evicts_oldest_connection() {
        let mut config = settings(vec![80]);
        config.max_concurrent_connections = 2;
        let mut reassembler = Reassembler::new(&config);
        let mut sink = VecSink::default();

        reassembler.push_segment(&segment("1.1.1.1", 1001, "9.9.9.9", 80, 1, false, b"a"), &mut sink);
        reassembler.push_segment(&segment("1.1.1.2", 1002, "9.9.9.9", 80, 1, false, b"b"), &mut sink);
        reassembler.push_segment(&segment("1.1.1.3", 1003, "9.9.9.9", 80, 1, false, b"c"), &mut sink);

        assert_eq!(reassembler.connection_count(), 2);
        let key_a = connection_key(
            &Endpoint::new("1.1.1.1".to_string(), 1001),
            &Endpoint::new("9.9.9.9".to_string(), 80),
        );
        assert_eq!(sink.evicted, vec![key_a]);

        // A new segment from the evicted tuple starts a fresh record.
        reassembler.push_segment(&segment("1.1.1.1", 1001, "9.9.9.9", 80, 50, false, b"d"), &mut sink);
        assert_eq!(reassembler.connection_count(), 2);
    }

    #[test]
    fn test_idle_eviction() {
        let mut config = settings(vec![80]);
        config.connection_idle_timeout_ms = 1_000;
        let mut reassembler = Reassembler::new(&config);
        let mut sink = VecSink::default();

        reassembler.push_segment(&segment("1.1.1.1", 1001, "9.9.9.9", 80, 1, false, b"a"), &mut sink);
        assert_eq!(reassembler.connection_count(), 1);

        reassembler.evict_idle(reassembler.now_ms() + 999, &mut sink);
        assert_eq!(reassembler.connection_count(), 1);

        reassembler.evict_idle(reassembler.now_ms() + 1_000, &mut sink);
        assert_eq!(reassembler.connection_count(), 0);
        assert_eq!(sink.evicted.len(), 1);
    }

    #[test]
    fn test_sample_rate_zero_tracks_nothing() {
        let mut config = settings(vec![80]);
        config.sample_rate = 0.0;
        let mut reassembler = Reassembler::new(&config);
        let mut sink = VecSink::default();
        reassembler.push_segment(&segment("1.1.1.1", 1001, "9.9.9.9", 80, 1, false, b"a"), &mut sink);
        assert_eq!(reassembler.connection_count(), 0);
        assert!(sink.chunks.is_empty());
    }

    #[test]
    fn test_duplicate_segment_emits_once() {
        let mut reassembler = Reassembler::new(&settings(vec![80]));
        let mut sink = VecSink::default();
        let seg = segment("1.1.1.1", 9999, "2.2.2.2", 80, 500, false, b"only once");
        reassembler.push_segment(&seg, &mut sink);
        reassembler.push_segment(&seg, &mut sink);
        reassembler.push_segment(&seg, &mut sink);
        assert_eq!(sink.chunks.len(), 1);
    }
}
