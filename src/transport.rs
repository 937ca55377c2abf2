//! Byte-stream transports to the caster.
//!
//! The session core only needs something it can read, write and drop.
//! [`connect_transport`] provides the production implementation: resolved
//! TCP with an optional rustls layer.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{self, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::NtripError;
use crate::retry::with_timeout;

/// Bidirectional byte stream owned by a single session.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Type-erased transport returned by [`connect_transport`].
pub type BoxedTransport = Box<dyn Transport>;

/// Opens a TCP connection to `host:port`, wrapped in TLS when `use_tls` is set.
///
/// Resolution failures, refused connections and the connect deadline are
/// reported as distinct [`NtripError`] variants.
pub async fn connect_transport(
    host: &str,
    port: u16,
    use_tls: bool,
    timeout: Duration,
) -> Result<BoxedTransport, NtripError> {
    let tcp = connect_tcp(host, port, timeout).await?;

    if !use_tls {
        return Ok(Box::new(tcp));
    }

    let connector = tls_connector().map_err(|err| NtripError::Tls {
        host: host.to_string(),
        detail: err.to_string(),
    })?;
    let server_name = ServerName::try_from(host.to_string()).map_err(|err| NtripError::Tls {
        host: host.to_string(),
        detail: err.to_string(),
    })?;

    let tls = with_timeout(timeout, connector.connect(server_name, tcp))
        .await
        .map_err(|_| NtripError::ConnectTimeout {
            addr: format!("{host}:{port}"),
            timeout,
        })?
        .map_err(|err| NtripError::Tls {
            host: host.to_string(),
            detail: err.to_string(),
        })?;

    debug!(event = "tls_established", host, port);
    Ok(Box::new(tls))
}

async fn connect_tcp(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, NtripError> {
    let addrs = resolve(host, port, timeout).await?;

    let mut last_error = None;
    for addr in addrs {
        match with_timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                debug!(event = "tcp_connected", host, %addr);
                return Ok(stream);
            }
            Ok(Err(err)) => {
                debug!(event = "tcp_connect_failed", host, %addr, error = %err);
                last_error = Some(connect_error(addr, err));
            }
            Err(_) => {
                debug!(event = "tcp_connect_timeout", host, %addr);
                last_error = Some(NtripError::ConnectTimeout {
                    addr: addr.to_string(),
                    timeout,
                });
            }
        }
    }

    Err(last_error.unwrap_or_else(|| NtripError::DnsFailure {
        host: host.to_string(),
        detail: "no addresses to connect to".to_string(),
    }))
}

async fn resolve(host: &str, port: u16, timeout: Duration) -> Result<Vec<SocketAddr>, NtripError> {
    let lookup = with_timeout(timeout, tokio::net::lookup_host((host, port)))
        .await
        .map_err(|_| NtripError::DnsFailure {
            host: host.to_string(),
            detail: format!("lookup timed out after {timeout:?}"),
        })?;

    let addrs: Vec<SocketAddr> = lookup
        .map_err(|err| NtripError::DnsFailure {
            host: host.to_string(),
            detail: err.to_string(),
        })?
        .collect();

    if addrs.is_empty() {
        return Err(NtripError::DnsFailure {
            host: host.to_string(),
            detail: "lookup returned no addresses".to_string(),
        });
    }
    Ok(addrs)
}

fn connect_error(addr: SocketAddr, err: io::Error) -> NtripError {
    if err.kind() == io::ErrorKind::ConnectionRefused {
        NtripError::ConnectionRefused {
            addr: addr.to_string(),
            source: err,
        }
    } else {
        NtripError::Transport(err)
    }
}

fn tls_connector() -> Result<TlsConnector, rustls::Error> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}
