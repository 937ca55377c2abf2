//! NTRIP client for streaming RTCM corrections from a caster.
//!
//! The crate is organized by concern:
//! - `config`: validated connection parameters.
//! - `transport`: TCP/TLS connection setup.
//! - `stream`: handshake, session lifecycle and the byte stream reader.
//! - `relay`: fan-out of a live stream to local TCP clients.
//! - `retry`: reconnect and timeout utilities for callers that retry.
//!
//! ```no_run
//! use ntrip_client::{ClientConfig, NtripClient};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ClientConfig::builder("caster.example.org", "RTCM3").build()?;
//! let mut reader = NtripClient::new(config).connect().await?;
//! while let Some(chunk) = reader.next().await? {
//!     println!("{} bytes", chunk.len());
//! }
//! # Ok(())
//! # }
//! ```

/// Connection parameters and defaults.
pub mod config;
/// Error types shared by every phase of a session.
pub mod error;
/// Local TCP fan-out of a correction stream.
pub mod relay;
/// Reconnect and timeout helpers.
pub mod retry;
/// Handshake, session and stream reader.
pub mod stream;
/// Caster transports.
pub mod transport;

pub use config::{ClientConfig, ClientConfigBuilder, ConfigError, NtripDefaults, NtripVersion};
pub use error::{ErrorKind, NtripError};
pub use stream::client::NtripClient;
pub use stream::negotiate::{negotiate, HandshakeResult, RejectReason, Rejection, SessionNegotiator};
pub use stream::reader::{CloseHandle, DataChunk, StreamReader};
pub use stream::session::{Session, SessionState};
