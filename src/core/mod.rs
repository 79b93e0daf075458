//! Core pipeline module for httptap
//!
//! This module contains the capture-to-message pipeline: frame decoding,
//! stream reassembly, the delivery bridge, and the lifecycle controller.

pub mod bridge;
pub mod engine;
pub mod packet;
pub mod reassembly;
