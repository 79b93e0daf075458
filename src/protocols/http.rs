//! HTTP/1.x stream parsing module
//!
//! This module implements a resumable parser over one direction of a
//! reassembled TCP stream. Bytes are fed in arbitrary slices; each completed
//! request or response is handed to a callback and the parser resets for the
//! next keep-alive message on the same stream.

use crate::core::packet::Endpoint;
use crate::core::reassembly::direction_name;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tracing::debug;

/// Headers larger than this without reaching the blank-line boundary mark
/// the stream as non-HTTP.
const MAX_HEADER_BYTES: usize = 64 * 1024;
/// Cap on an unterminated chunk-size line.
const MAX_CHUNK_LINE_BYTES: usize = 4 * 1024;

/// Message direction relative to the observed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Request,
    Response,
}

/// A completed HTTP/1.x message record, the delivery product of the core.
#[derive(Debug, Clone, Serialize)]
pub struct HttpMessage {
    /// Side whose port is among the configured capture ports.
    pub receiver: Endpoint,
    /// The peer endpoint.
    pub destination: Endpoint,
    pub direction: Direction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// Header names are normalized to lowercase; repeated names overwrite.
    pub headers: HashMap<String, String>,
    /// Body text. Empty when the body was not valid UTF-8.
    pub body: String,
    pub body_truncated: bool,
    /// `"binary"` when the stored body bytes were not well-formed UTF-8.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_encoding: Option<String>,
    /// ISO-8601 UTC, millisecond precision, stamped at parse completion.
    pub timestamp: String,
}

/// Parse phase. `NonHttp` is absorbing: once a stream desynchronizes it is
/// ignored until its connection is evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Headers,
    BodyLength { remaining: usize },
    BodyChunked,
    NonHttp,
}

/// Resumable HTTP/1.x parser for one (connection, direction).
pub struct HttpStreamParser {
    connection_id: String,
    receiver: Endpoint,
    destination: Endpoint,
    client_to_server: bool,
    max_body_size: usize,

    buffer: Vec<u8>,
    phase: Phase,

    // Message under construction.
    method: Option<String>,
    path: Option<String>,
    status_code: Option<u16>,
    headers: HashMap<String, String>,
    body: Vec<u8>,
    body_truncated: bool,
}

impl HttpStreamParser {
    pub fn new(
        connection_id: String,
        receiver: Endpoint,
        destination: Endpoint,
        client_to_server: bool,
        max_body_size: usize,
    ) -> Self {
        Self {
            connection_id,
            receiver,
            destination,
            client_to_server,
            max_body_size,
            buffer: Vec::new(),
            phase: Phase::Headers,
            method: None,
            path: None,
            status_code: None,
            headers: HashMap::new(),
            body: Vec::new(),
            body_truncated: false,
        }
    }

    /// Append stream bytes and advance. A single call may complete zero or
    /// more messages, each handed to `emit`.
    pub fn feed(&mut self, data: &[u8], emit: &mut dyn FnMut(HttpMessage)) {
        if data.is_empty() || self.phase == Phase::NonHttp {
            return;
        }
        self.buffer.extend_from_slice(data);
        loop {
            let progressed = match self.phase {
                Phase::Headers => self.parse_headers(emit),
                Phase::BodyLength { .. } => self.parse_body_length(emit),
                Phase::BodyChunked => self.parse_body_chunked(emit),
                Phase::NonHttp => false,
            };
            if !progressed {
                break;
            }
        }
    }

    fn parse_headers(&mut self, emit: &mut dyn FnMut(HttpMessage)) -> bool {
        // Tolerate blank lines before a start-line (e.g. the final CRLF of a
        // chunked message arriving in a later segment).
        loop {
            if self.buffer.starts_with(b"\r\n") {
                self.buffer.drain(..2);
            } else if self.buffer.starts_with(b"\n") {
                self.buffer.drain(..1);
            } else {
                break;
            }
        }

        // Validate the start-line as soon as one full line is available, so
        // a non-HTTP stream is recognized without waiting for a header
        // boundary that may never come.
        if let Some(lf) = find_byte(&self.buffer, b'\n') {
            let line = trim_cr(&self.buffer[..lf]);
            if !start_line_plausible(line) {
                self.desync();
                return false;
            }
        }

        let Some((header_len, terminator_len)) = find_header_boundary(&self.buffer) else {
            if self.buffer.len() > MAX_HEADER_BYTES {
                self.desync();
            }
            return false;
        };

        let block: Vec<u8> = self.buffer[..header_len].to_vec();
        self.buffer.drain(..header_len + terminator_len);

        let mut first = true;
        for raw_line in block.split(|&b| b == b'\n') {
            let line = trim_cr(raw_line);
            if line.is_empty() {
                continue;
            }
            if first {
                first = false;
                if !self.parse_start_line(line) {
                    self.desync();
                    return false;
                }
                continue;
            }
            let Some(colon) = find_byte(line, b':') else {
                // A non-empty header line without a colon means we are not
                // looking at HTTP after all.
                self.desync();
                return false;
            };
            let name = String::from_utf8_lossy(&line[..colon])
                .trim()
                .to_ascii_lowercase();
            let value_start = line[colon + 1..]
                .iter()
                .position(|&b| b != b' ' && b != b'\t')
                .map(|p| colon + 1 + p)
                .unwrap_or(line.len());
            let value = String::from_utf8_lossy(&line[value_start..]).into_owned();
            self.headers.insert(name, value);
        }

        let chunked = self
            .headers
            .get("transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false);
        if chunked {
            self.phase = Phase::BodyChunked;
        } else {
            let content_length = self
                .headers
                .get("content-length")
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            self.phase = Phase::BodyLength {
                remaining: content_length,
            };
        }
        true
    }

    fn parse_start_line(&mut self, line: &[u8]) -> bool {
        if line.starts_with(b"HTTP/") {
            let Some(sp) = find_byte(line, b' ') else {
                return false;
            };
            let digits: Vec<u8> = line[sp + 1..]
                .iter()
                .copied()
                .take_while(|b| b.is_ascii_digit())
                .collect();
            let Ok(code) = String::from_utf8_lossy(&digits).parse::<u16>() else {
                return false;
            };
            self.status_code = Some(code);
            return true;
        }

        let Some(sp1) = find_byte(line, b' ') else {
            return false;
        };
        let method = &line[..sp1];
        if method.is_empty() || !method.iter().all(|&b| is_token_byte(b)) {
            return false;
        }
        let rest = &line[sp1 + 1..];
        let path_end = find_byte(rest, b' ').unwrap_or(rest.len());
        let path = &rest[..path_end];
        if path.is_empty() {
            return false;
        }
        self.method = Some(String::from_utf8_lossy(method).into_owned());
        self.path = Some(String::from_utf8_lossy(path).into_owned());
        true
    }

    fn parse_body_length(&mut self, emit: &mut dyn FnMut(HttpMessage)) -> bool {
        let Phase::BodyLength { remaining } = self.phase else {
            return false;
        };
        if remaining == 0 {
            self.emit_message(emit);
            return true;
        }
        if self.buffer.is_empty() {
            return false;
        }

        let take = remaining.min(self.buffer.len());
        let room = self.max_body_size.saturating_sub(self.body.len());
        let stored = take.min(room);
        if stored > 0 {
            self.body.extend_from_slice(&self.buffer[..stored]);
        }
        if stored < take {
            self.body_truncated = true;
        }
        // Discarded bytes still count against the declared length so the
        // stream position stays aligned for the next message.
        self.buffer.drain(..take);

        let remaining = remaining - take;
        if remaining == 0 {
            self.emit_message(emit);
            true
        } else {
            self.phase = Phase::BodyLength { remaining };
            false
        }
    }

    fn parse_body_chunked(&mut self, emit: &mut dyn FnMut(HttpMessage)) -> bool {
        loop {
            let Some(lf) = find_byte(&self.buffer, b'\n') else {
                if self.buffer.len() > MAX_CHUNK_LINE_BYTES {
                    self.desync();
                }
                return false;
            };
            let line = trim_cr(&self.buffer[..lf]);
            let hex_len = line
                .iter()
                .position(|b| !b.is_ascii_hexdigit())
                .unwrap_or(line.len());
            if hex_len == 0 {
                self.desync();
                return false;
            }
            let hex = String::from_utf8_lossy(&line[..hex_len]).into_owned();
            let Ok(chunk_size) = usize::from_str_radix(&hex, 16) else {
                self.desync();
                return false;
            };

            if chunk_size == 0 {
                self.buffer.drain(..lf + 1);
                // Trailers are ignored; absorb the final CRLF when it has
                // already arrived.
                if self.buffer.starts_with(b"\r\n") {
                    self.buffer.drain(..2);
                } else if self.buffer.starts_with(b"\n") {
                    self.buffer.drain(..1);
                }
                self.emit_message(emit);
                return true;
            }

            // The size line is only consumed once the whole chunk and its
            // trailing CRLF are buffered, so partial chunks resume cleanly.
            let needed = lf + 1 + chunk_size + 2;
            if self.buffer.len() < needed {
                return false;
            }
            self.buffer.drain(..lf + 1);

            let room = self.max_body_size.saturating_sub(self.body.len());
            let stored = chunk_size.min(room);
            if stored > 0 {
                self.body.extend_from_slice(&self.buffer[..stored]);
            }
            if stored < chunk_size {
                self.body_truncated = true;
            }
            self.buffer.drain(..chunk_size + 2);
        }
    }

    fn emit_message(&mut self, emit: &mut dyn FnMut(HttpMessage)) {
        let body_bytes = std::mem::take(&mut self.body);
        let (body, body_encoding) = match String::from_utf8(body_bytes) {
            Ok(text) => (text, None),
            Err(_) => (String::new(), Some("binary".to_string())),
        };

        let message = HttpMessage {
            receiver: self.receiver.clone(),
            destination: self.destination.clone(),
            direction: if self.client_to_server {
                Direction::Request
            } else {
                Direction::Response
            },
            method: self.method.take(),
            path: self.path.take(),
            status_code: self.status_code.take(),
            headers: std::mem::take(&mut self.headers),
            body,
            body_truncated: self.body_truncated,
            body_encoding,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        };

        self.body_truncated = false;
        self.phase = Phase::Headers;
        emit(message);
    }

    fn desync(&mut self) {
        debug!(
            connection = %self.connection_id,
            direction = direction_name(self.client_to_server),
            "non-http stream, dropping further data"
        );
        self.phase = Phase::NonHttp;
        self.buffer = Vec::new();
        self.body = Vec::new();
        self.headers = HashMap::new();
        self.method = None;
        self.path = None;
        self.status_code = None;
        self.body_truncated = false;
    }
}

fn find_byte(haystack: &[u8], needle: u8) -> Option<usize> {
    haystack.iter().position(|&b| b == needle)
}

fn trim_cr(line: &[u8]) -> &[u8] {
    match line.last() {
        Some(b'\r') => &line[..line.len() - 1],
        _ => line,
    }
}

/// Locate the end of the header block: the first CRLFCRLF or LFLF.
/// Returns (header length, terminator length).
fn find_header_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    for i in 0..buffer.len() {
        if buffer[i..].starts_with(b"\r\n\r\n") {
            return Some((i, 4));
        }
        if buffer[i..].starts_with(b"\n\n") {
            return Some((i, 2));
        }
    }
    None
}

/// RFC 7230 token characters, used to validate request methods.
fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

/// Quick shape check on a complete first line: either an HTTP status line
/// or `METHOD SP target`.
fn start_line_plausible(line: &[u8]) -> bool {
    if line.starts_with(b"HTTP/") {
        return match find_byte(line, b' ') {
            Some(sp) => line.get(sp + 1).is_some_and(|b| b.is_ascii_digit()),
            None => false,
        };
    }
    match find_byte(line, b' ') {
        Some(sp) => sp > 0 && line[..sp].iter().all(|&b| is_token_byte(b)) && line.len() > sp + 1,
        None => false,
    }
}
