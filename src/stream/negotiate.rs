//! Version-specific NTRIP handshake.
//!
//! [`negotiate`] writes the request, reads until the strategy's framing is
//! complete and classifies the caster's answer. Both strategies share the
//! read loop and the bounded budget; only framing and classification differ.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::config::{ClientConfig, NtripVersion};
use crate::error::{summarize_response, NtripError};
use crate::retry::with_timeout;
use crate::stream::proto::{find_header_end, find_line_end, render_request, ResponseHead, StatusLine};
use crate::transport::Transport;

const HANDSHAKE_READ_CHUNK: usize = 1024;
const RELEASE_TIMEOUT: Duration = Duration::from_millis(250);

/// Handshake strategy selected by the configured protocol version.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SessionNegotiator {
    /// Bare request; the caster answers with a single greeting line.
    V1 { greetings: Vec<String> },
    /// HTTP/1.1 request; the caster answers with a full header block.
    V2,
}

/// Why a caster did not accept the session.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RejectReason {
    Unauthorized,
    MountpointNotFound,
    Malformed(String),
    Timeout,
    Refused { code: u16 },
}

/// Negative handshake outcome with the caster's raw answer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Rejection {
    pub reason: RejectReason,
    pub raw_header_lines: Vec<String>,
}

impl Rejection {
    pub fn status_line(&self) -> &str {
        self.raw_header_lines
            .first()
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn into_error(self, config: &ClientConfig) -> NtripError {
        let status_line = self.status_line().to_string();
        match self.reason {
            RejectReason::Unauthorized => NtripError::AuthenticationFailed { status_line },
            RejectReason::MountpointNotFound => NtripError::MountpointNotFound {
                mountpoint: config.mountpoint().to_string(),
                status_line,
            },
            RejectReason::Malformed(detail) => NtripError::MalformedResponse {
                detail,
                raw: summarize_response(self.raw_header_lines.join("\n").as_bytes()),
            },
            RejectReason::Timeout => NtripError::HandshakeTimeout {
                timeout: config.handshake_timeout(),
            },
            RejectReason::Refused { code } => NtripError::CasterRejected { code, status_line },
        }
    }
}

/// Accepted session: the transport plus everything read past the header.
#[derive(Debug)]
pub struct Negotiated<T> {
    pub transport: T,
    pub version: NtripVersion,
    pub head: ResponseHead,
    /// Stream bytes that arrived in the same reads as the header.
    pub leftover: Vec<u8>,
    /// The body uses `Transfer-Encoding: chunked`.
    pub chunked: bool,
}

#[derive(Debug)]
pub enum HandshakeResult<T> {
    Ready(Negotiated<T>),
    Rejected(Rejection),
}

enum ReadOutcome {
    Framed { head_len: usize, body_start: usize },
    ClosedEarly,
    Overflow,
}

impl SessionNegotiator {
    pub fn for_config(config: &ClientConfig) -> Self {
        match config.version() {
            NtripVersion::V1 => Self::V1 {
                greetings: config.v1_greetings().to_vec(),
            },
            NtripVersion::V2 => Self::V2,
        }
    }

    pub fn version(&self) -> NtripVersion {
        match self {
            Self::V1 { .. } => NtripVersion::V1,
            Self::V2 => NtripVersion::V2,
        }
    }

    fn framing_end(&self, buf: &[u8]) -> Option<(usize, usize)> {
        match self {
            Self::V1 { .. } => find_line_end(buf),
            Self::V2 => find_header_end(buf),
        }
    }

    /// Decides whether `head` lets streaming begin.
    pub fn classify(&self, head: &ResponseHead) -> Result<(), RejectReason> {
        let line = head
            .status_line()
            .map(str::trim)
            .ok_or_else(|| RejectReason::Malformed("empty response".to_string()))?;

        match self {
            Self::V1 { greetings } => classify_v1(line, greetings),
            Self::V2 => classify_v2(line, head),
        }
    }

    async fn exchange<T: Transport>(
        &self,
        transport: &mut T,
        request: &[u8],
        buf: &mut Vec<u8>,
        limit: usize,
    ) -> io::Result<ReadOutcome> {
        transport.write_all(request).await?;
        transport.flush().await?;

        let mut chunk = [0u8; HANDSHAKE_READ_CHUNK];
        loop {
            if let Some((head_len, body_start)) = self.framing_end(buf) {
                return Ok(ReadOutcome::Framed {
                    head_len,
                    body_start,
                });
            }
            if buf.len() >= limit {
                return Ok(ReadOutcome::Overflow);
            }
            let n = transport.read(&mut chunk).await?;
            if n == 0 {
                return Ok(ReadOutcome::ClosedEarly);
            }
            buf.extend_from_slice(&chunk[..n]);
        }
    }
}

fn classify_v2(line: &str, head: &ResponseHead) -> Result<(), RejectReason> {
    let status = StatusLine::parse(line)
        .ok_or_else(|| RejectReason::Malformed("unparsable status line".to_string()))?;

    if status.is_sourcetable() {
        return Err(RejectReason::MountpointNotFound);
    }
    match status.code {
        401 | 407 => return Err(RejectReason::Unauthorized),
        404 => return Err(RejectReason::MountpointNotFound),
        _ => {}
    }
    if !status.is_success() {
        return Err(RejectReason::Refused { code: status.code });
    }
    if !status.is_http() && !status.is_icy() {
        return Err(RejectReason::Malformed(format!(
            "unexpected protocol {:?}",
            status.protocol
        )));
    }
    if head.is_sourcetable() {
        return Err(RejectReason::MountpointNotFound);
    }
    Ok(())
}

fn classify_v1(line: &str, greetings: &[String]) -> Result<(), RejectReason> {
    if greetings.iter().any(|greeting| greeting == line) {
        return Ok(());
    }
    if line.starts_with("ERROR - Bad Password") {
        return Err(RejectReason::Unauthorized);
    }
    if line.starts_with("ERROR - Bad Mountpoint") {
        return Err(RejectReason::MountpointNotFound);
    }
    if let Some(status) = StatusLine::parse(line) {
        if status.is_sourcetable() {
            return Err(RejectReason::MountpointNotFound);
        }
        match status.code {
            401 | 407 => return Err(RejectReason::Unauthorized),
            404 => return Err(RejectReason::MountpointNotFound),
            code if !status.is_success() => return Err(RejectReason::Refused { code }),
            _ => {}
        }
    }
    Err(RejectReason::Malformed("unrecognized greeting".to_string()))
}

/// Runs the handshake on an open transport.
///
/// On [`HandshakeResult::Ready`] the transport is handed back untouched inside
/// [`Negotiated`]. On rejection or error it is shut down and dropped before
/// this returns.
pub async fn negotiate<T: Transport>(
    mut transport: T,
    config: &ClientConfig,
) -> Result<HandshakeResult<T>, NtripError> {
    let negotiator = SessionNegotiator::for_config(config);
    let request = render_request(config);
    let mut buf = Vec::new();

    debug!(
        event = "ntrip_request_sent",
        version = %negotiator.version(),
        mountpoint = config.mountpoint(),
        authenticated = config.has_credentials()
    );

    let outcome = with_timeout(
        config.handshake_timeout(),
        negotiator.exchange(
            &mut transport,
            request.as_bytes(),
            &mut buf,
            config.max_header_bytes(),
        ),
    )
    .await;

    let outcome = match outcome {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(err)) => {
            debug!(event = "ntrip_handshake_io_error", error = %err);
            release(transport).await;
            return Err(NtripError::Transport(err));
        }
        Err(_) => {
            let head = ResponseHead::parse(&buf);
            return Ok(reject(transport, RejectReason::Timeout, head).await);
        }
    };

    match outcome {
        ReadOutcome::Framed {
            head_len,
            body_start,
        } => {
            let head = ResponseHead::parse(&buf[..head_len]);
            match negotiator.classify(&head) {
                Ok(()) => {
                    let chunked = negotiator.version() == NtripVersion::V2 && head.is_chunked();
                    debug!(
                        event = "ntrip_handshake_ready",
                        status = head.status_line().unwrap_or(""),
                        chunked,
                        leftover = buf.len() - body_start
                    );
                    Ok(HandshakeResult::Ready(Negotiated {
                        transport,
                        version: negotiator.version(),
                        head,
                        leftover: buf.split_off(body_start),
                        chunked,
                    }))
                }
                Err(reason) => Ok(reject(transport, reason, head).await),
            }
        }
        ReadOutcome::ClosedEarly if buf.is_empty() => {
            release(transport).await;
            Err(NtripError::Transport(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "caster closed the connection without answering",
            )))
        }
        ReadOutcome::ClosedEarly => {
            let head = ResponseHead::parse(&buf);
            let reason = match negotiator.classify(&head) {
                Ok(()) => {
                    RejectReason::Malformed("connection closed before header completed".to_string())
                }
                Err(reason) => reason,
            };
            Ok(reject(transport, reason, head).await)
        }
        ReadOutcome::Overflow => {
            let head = ResponseHead::parse(&buf);
            let reason = RejectReason::Malformed(format!(
                "no header terminator within {} bytes",
                config.max_header_bytes()
            ));
            Ok(reject(transport, reason, head).await)
        }
    }
}

async fn reject<T: Transport>(
    transport: T,
    reason: RejectReason,
    head: ResponseHead,
) -> HandshakeResult<T> {
    debug!(
        event = "ntrip_handshake_rejected",
        reason = ?reason,
        status = head.status_line().unwrap_or("")
    );
    release(transport).await;
    HandshakeResult::Rejected(Rejection {
        reason,
        raw_header_lines: head.lines,
    })
}

async fn release<T: Transport>(mut transport: T) {
    let _ = with_timeout(RELEASE_TIMEOUT, transport.shutdown()).await;
}
