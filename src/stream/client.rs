//! Caster client entry point.
//!
//! [`NtripClient`] opens the transport described by its [`ClientConfig`],
//! runs the handshake through a [`Session`] and returns the resulting
//! [`StreamReader`]. Each call to [`NtripClient::connect`] is an independent
//! session; the client keeps no connection state of its own.

use futures_util::Stream;
use tracing::info;

use crate::config::ClientConfig;
use crate::error::NtripError;
use crate::stream::reader::StreamReader;
use crate::stream::session::Session;
use crate::transport::{connect_transport, BoxedTransport};

/// Entry point for opening caster sessions.
#[derive(Clone, Debug)]
pub struct NtripClient {
    config: ClientConfig,
}

impl NtripClient {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Opens a new session and negotiates it.
    ///
    /// Connection failures are returned immediately and never retried here.
    pub async fn connect(&self) -> Result<StreamReader<BoxedTransport>, NtripError> {
        let config = &self.config;
        info!(
            event = "ntrip_connecting",
            host = config.host(),
            port = config.port(),
            mountpoint = config.mountpoint(),
            tls = config.use_tls(),
            version = %config.version()
        );

        let transport = connect_transport(
            config.host(),
            config.port(),
            config.use_tls(),
            config.connect_timeout(),
        )
        .await?;

        let reader = Session::new(transport, config.clone()).negotiate().await?;
        info!(
            event = "ntrip_streaming",
            mountpoint = config.mountpoint(),
            status = reader.status_line()
        );
        Ok(reader)
    }

    /// Connects and returns the session as a stream of owned chunks.
    pub async fn stream(
        &self,
    ) -> Result<impl Stream<Item = Result<Vec<u8>, NtripError>> + Send, NtripError> {
        Ok(self.connect().await?.into_stream())
    }
}
