//! Protocol parsing module for httptap
//!
//! This module contains stream-level protocol parsers. HTTP/1.x is the only
//! protocol in the initial version.

pub mod http;
