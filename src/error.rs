use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;

/// Longest piece of caster output kept in an error message.
pub(crate) const RESPONSE_SNIPPET_LEN: usize = 220;

/// Errors produced while connecting, negotiating or streaming.
///
/// Every handshake-phase and stream-phase error is terminal for the session
/// that produced it; the client never retries on its own.
#[derive(Debug, Error)]
pub enum NtripError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("could not resolve caster host {host}: {detail}")]
    DnsFailure { host: String, detail: String },

    #[error("connection to {addr} refused: {source}")]
    ConnectionRefused {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("connecting to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },

    #[error("tls setup with {host} failed: {detail}")]
    Tls { host: String, detail: String },

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("caster did not answer within {timeout:?}")]
    HandshakeTimeout { timeout: Duration },

    #[error("caster rejected credentials: {status_line}")]
    AuthenticationFailed { status_line: String },

    #[error("mountpoint {mountpoint:?} not found on caster: {status_line}")]
    MountpointNotFound {
        mountpoint: String,
        status_line: String,
    },

    #[error("malformed caster response ({detail}): {raw}")]
    MalformedResponse { detail: String, raw: String },

    #[error("caster refused the request with status {code}: {status_line}")]
    CasterRejected { code: u16, status_line: String },

    #[error("correction stream interrupted: {0}")]
    StreamInterrupted(#[source] io::Error),
}

/// Flat classification of [`NtripError`] for callers that map errors to
/// exit codes or metrics labels.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    InvalidConfig,
    DnsFailure,
    ConnectionRefused,
    ConnectTimeout,
    Tls,
    Transport,
    HandshakeTimeout,
    AuthenticationFailed,
    MountpointNotFound,
    MalformedResponse,
    CasterRejected,
    StreamInterrupted,
}

impl NtripError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidConfig(_) => ErrorKind::InvalidConfig,
            Self::DnsFailure { .. } => ErrorKind::DnsFailure,
            Self::ConnectionRefused { .. } => ErrorKind::ConnectionRefused,
            Self::ConnectTimeout { .. } => ErrorKind::ConnectTimeout,
            Self::Tls { .. } => ErrorKind::Tls,
            Self::Transport(_) => ErrorKind::Transport,
            Self::HandshakeTimeout { .. } => ErrorKind::HandshakeTimeout,
            Self::AuthenticationFailed { .. } => ErrorKind::AuthenticationFailed,
            Self::MountpointNotFound { .. } => ErrorKind::MountpointNotFound,
            Self::MalformedResponse { .. } => ErrorKind::MalformedResponse,
            Self::CasterRejected { .. } => ErrorKind::CasterRejected,
            Self::StreamInterrupted(_) => ErrorKind::StreamInterrupted,
        }
    }

    /// Whether opening a fresh session has a reasonable chance of succeeding.
    ///
    /// Credential, mountpoint and configuration problems will not go away by
    /// reconnecting.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::DnsFailure { .. }
            | Self::ConnectionRefused { .. }
            | Self::ConnectTimeout { .. }
            | Self::Transport(_)
            | Self::HandshakeTimeout { .. }
            | Self::StreamInterrupted(_) => true,
            Self::CasterRejected { code, .. } => *code >= 500 || *code == 429,
            Self::InvalidConfig(_)
            | Self::Tls { .. }
            | Self::AuthenticationFailed { .. }
            | Self::MountpointNotFound { .. }
            | Self::MalformedResponse { .. } => false,
        }
    }
}

/// Lossy, length-capped rendering of raw caster bytes for diagnostics.
pub(crate) fn summarize_response(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim()
        .chars()
        .take(RESPONSE_SNIPPET_LEN)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::{summarize_response, ErrorKind, NtripError, RESPONSE_SNIPPET_LEN};

    #[test]
    fn auth_and_mountpoint_errors_are_not_retryable() {
        let auth = NtripError::AuthenticationFailed {
            status_line: "HTTP/1.1 401 Unauthorized".to_string(),
        };
        let missing = NtripError::MountpointNotFound {
            mountpoint: "NOPE".to_string(),
            status_line: "SOURCETABLE 200 OK".to_string(),
        };
        assert!(!auth.is_retryable());
        assert!(!missing.is_retryable());
        assert_eq!(auth.kind(), ErrorKind::AuthenticationFailed);
    }

    #[test]
    fn server_side_rejections_are_retryable() {
        let unavailable = NtripError::CasterRejected {
            code: 503,
            status_line: "HTTP/1.1 503 Service Unavailable".to_string(),
        };
        let forbidden = NtripError::CasterRejected {
            code: 403,
            status_line: "HTTP/1.1 403 Forbidden".to_string(),
        };
        assert!(unavailable.is_retryable());
        assert!(!forbidden.is_retryable());
    }

    #[test]
    fn stream_interruption_is_retryable() {
        let err = NtripError::StreamInterrupted(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(err.is_retryable());
        assert_eq!(err.kind(), ErrorKind::StreamInterrupted);
    }

    #[test]
    fn summaries_are_capped() {
        let raw = vec![b'x'; RESPONSE_SNIPPET_LEN * 2];
        assert_eq!(summarize_response(&raw).len(), RESPONSE_SNIPPET_LEN);
        assert_eq!(summarize_response(b"  <html>\r\n"), "<html>");
    }
}
