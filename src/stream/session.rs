//! Session lifecycle around one caster connection.
//!
//! A [`Session`] owns the transport from the moment the connection opens
//! until the handshake finishes. On success ownership moves into the
//! [`StreamReader`]; on failure the transport is released and the session is
//! gone. Retrying always means building a new session on a new connection.

use std::fmt;

use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::error::NtripError;
use crate::stream::negotiate::{negotiate, HandshakeResult};
use crate::stream::reader::StreamReader;
use crate::transport::Transport;

/// Lifecycle of a caster session.
///
/// `Closed` and `Failed` are terminal.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum SessionState {
    Pending,
    Negotiating,
    Streaming,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;

        matches!(
            (self, next),
            (Pending, Negotiating)
                | (Negotiating, Streaming)
                | (Negotiating, Failed)
                | (Streaming, Closed)
                | (Streaming, Failed)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Negotiating => "negotiating",
            Self::Streaming => "streaming",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One connected, not yet negotiated link to a caster.
pub struct Session<T> {
    transport: T,
    config: ClientConfig,
    state: SessionState,
}

impl<T> fmt::Debug for Session<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("host", &self.config.host())
            .field("mountpoint", &self.config.mountpoint())
            .field("state", &self.state)
            .finish()
    }
}

impl<T: Transport> Session<T> {
    /// Wraps an already open transport. The session starts in
    /// [`SessionState::Pending`].
    pub fn new(transport: T, config: ClientConfig) -> Self {
        Self {
            transport,
            config,
            state: SessionState::Pending,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Performs the handshake and hands the transport to a [`StreamReader`].
    ///
    /// Rejections are converted into the matching [`NtripError`]; in every
    /// error case the transport has already been shut down.
    pub async fn negotiate(mut self) -> Result<StreamReader<T>, NtripError> {
        self.transition(SessionState::Negotiating);

        let Session {
            transport, config, ..
        } = self;

        match negotiate(transport, &config).await {
            Ok(HandshakeResult::Ready(negotiated)) => {
                debug!(
                    event = "session_state",
                    from = %SessionState::Negotiating,
                    to = %SessionState::Streaming,
                    mountpoint = config.mountpoint()
                );
                Ok(StreamReader::new(negotiated, config.read_buffer_size()))
            }
            Ok(HandshakeResult::Rejected(rejection)) => {
                let error = rejection.into_error(&config);
                warn!(
                    event = "session_state",
                    from = %SessionState::Negotiating,
                    to = %SessionState::Failed,
                    mountpoint = config.mountpoint(),
                    error = %error
                );
                Err(error)
            }
            Err(error) => {
                warn!(
                    event = "session_state",
                    from = %SessionState::Negotiating,
                    to = %SessionState::Failed,
                    mountpoint = config.mountpoint(),
                    error = %error
                );
                Err(error)
            }
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug_assert!(self.state.can_transition_to(next));
        debug!(
            event = "session_state",
            from = %self.state,
            to = %next,
            mountpoint = self.config.mountpoint()
        );
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    use super::{Session, SessionState};
    use crate::config::{ClientConfig, NtripVersion};
    use crate::error::NtripError;

    #[test]
    fn state_machine_allows_only_documented_edges() {
        use SessionState::*;

        let all = [Pending, Negotiating, Streaming, Closed, Failed];
        let allowed = [
            (Pending, Negotiating),
            (Negotiating, Streaming),
            (Negotiating, Failed),
            (Streaming, Closed),
            (Streaming, Failed),
        ];
        for from in all {
            for to in all {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
        assert!(Closed.is_terminal() && Failed.is_terminal());
        assert!(!Streaming.is_terminal());
    }

    #[test]
    fn successful_session_streams_exact_payload() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");

        runtime.block_on(async {
            let (client, mut caster) = duplex(1024);
            let config = ClientConfig::builder("caster.example.org", "RTCM3")
                .build()
                .expect("config");

            let caster_task = tokio::spawn(async move {
                let mut request = vec![0u8; 512];
                let n = caster.read(&mut request).await.expect("request");
                assert!(request[..n].starts_with(b"GET /RTCM3 HTTP/1.1\r\n"));
                caster
                    .write_all(b"ICY 200 OK\r\n\r\n\xd3\x00\x13\x3e\xd7")
                    .await
                    .expect("reply");
            });

            let session = Session::new(client, config);
            assert_eq!(session.state(), SessionState::Pending);

            let mut reader = session.negotiate().await.expect("negotiated");
            assert_eq!(reader.state(), SessionState::Streaming);
            assert_eq!(reader.status_line(), "ICY 200 OK");

            let first = reader.next().await.expect("next").expect("chunk");
            assert_eq!(first.as_bytes(), b"\xd3\x00\x13\x3e\xd7");

            caster_task.await.expect("caster");
            assert!(reader.next().await.expect("eof").is_none());
            assert_eq!(reader.state(), SessionState::Closed);
        });
    }

    #[test]
    fn rejected_session_maps_to_error_kind() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");

        runtime.block_on(async {
            let (client, mut caster) = duplex(1024);
            let config = ClientConfig::builder("caster", "MISSING")
                .version(NtripVersion::V1)
                .handshake_timeout(Duration::from_secs(1))
                .build()
                .expect("config");

            let caster_task = tokio::spawn(async move {
                let mut request = vec![0u8; 512];
                let _ = caster.read(&mut request).await.expect("request");
                caster
                    .write_all(b"SOURCETABLE 200 OK\r\nSTR;OTHER;\r\nENDSOURCETABLE\r\n")
                    .await
                    .expect("reply");
            });

            let err = Session::new(client, config)
                .negotiate()
                .await
                .expect_err("missing mountpoint");
            caster_task.await.expect("caster");
            match err {
                NtripError::MountpointNotFound {
                    mountpoint,
                    status_line,
                } => {
                    assert_eq!(mountpoint, "MISSING");
                    assert_eq!(status_line, "SOURCETABLE 200 OK");
                }
                other => panic!("unexpected error: {other:?}"),
            }
        });
    }
}
