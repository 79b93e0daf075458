//! httptap - passive HTTP/1.x traffic observation
//!
//! This crate captures TCP traffic on a Linux host with libpcap, reassembles
//! per-connection byte streams, parses HTTP/1.x messages out of them, and
//! hands completed message records to the embedding application. It never
//! binds the observed port and never modifies traffic.

pub mod capture;
pub mod config;
pub mod core;
pub mod protocols;
pub mod utils;

pub use crate::capture::{CaptureError, CaptureStats, FatalCode};
pub use crate::config::CaptureSettings;
pub use crate::core::bridge::FatalError;
pub use crate::core::engine::{Sniffer, StartError};
pub use crate::protocols::http::{Direction, HttpMessage};

#[cfg(test)]
pub(crate) mod testsupport;
