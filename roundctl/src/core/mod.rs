//! Deterministic, pure logic shared by the round controller.
//!
//! Core modules must be free of I/O side effects: parameter parsing, status
//! decoding, request construction and templating.

pub mod params;
pub mod request;
pub mod status;
pub mod template;
pub mod types;
