//! Caster session modules.
//!
//! - `client`: transport setup and session entry point.
//! - `negotiate`: version-specific handshake and response classification.
//! - `reader`: byte stream over the negotiated connection.
//! - `session`: lifecycle state machine tying the two together.
//! - `proto`: request rendering and response head parsing.
//! - `chunked`: chunked transfer decoding for NTRIP 2.0 bodies.

/// Chunked transfer decoding.
pub mod chunked;
/// Client entry point.
pub mod client;
/// Handshake strategies.
pub mod negotiate;
/// Wire-level request and response helpers.
pub mod proto;
/// Byte stream reader and close handle.
pub mod reader;
/// Session state machine.
pub mod session;
