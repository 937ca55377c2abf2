//! Serves a live correction stream to local TCP clients.
//!
//! Every accepted client gets its own bounded queue and writer task. Chunks
//! are offered to each queue without waiting; a client that cannot keep up,
//! or whose socket failed, is dropped so it never stalls the caster stream.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use crate::error::NtripError;
use crate::stream::reader::StreamReader;
use crate::transport::Transport;

/// Chunks buffered per client before it is considered too slow.
pub const DEFAULT_CLIENT_CAPACITY: usize = 256;

const ACCEPT_BACKOFF_INITIAL: Duration = Duration::from_millis(50);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

type Chunk = Arc<[u8]>;

/// Totals reported when a relay run ends.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RelaySummary {
    pub bytes: u64,
    pub chunks: u64,
    pub clients_served: usize,
}

struct RelayClient {
    addr: SocketAddr,
    tx: mpsc::Sender<Chunk>,
}

/// Local TCP fan-out for one [`StreamReader`].
#[derive(Debug)]
pub struct Relay {
    listener: TcpListener,
    client_capacity: usize,
}

impl Relay {
    pub async fn bind(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            client_capacity: DEFAULT_CLIENT_CAPACITY,
        })
    }

    pub fn with_client_capacity(mut self, capacity: usize) -> Self {
        self.client_capacity = capacity.max(1);
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Forwards every chunk from `reader` to all connected clients until the
    /// stream ends.
    ///
    /// Closing the reader through its [`CloseHandle`](crate::CloseHandle)
    /// stops the relay.
    pub async fn run<T: Transport>(
        self,
        reader: &mut StreamReader<T>,
    ) -> Result<RelaySummary, NtripError> {
        let local_addr = self.listener.local_addr()?;
        info!(event = "relay_listening", addr = %local_addr);

        let (join_tx, mut join_rx) = mpsc::unbounded_channel();
        let capacity = self.client_capacity;
        let listener = self.listener;
        let accept_task = tokio::spawn(async move {
            let mut failures = 0u32;
            loop {
                match listener.accept().await {
                    Ok((socket, addr)) => {
                        failures = 0;
                        let _ = socket.set_nodelay(true);
                        let (tx, rx) = mpsc::channel(capacity);
                        tokio::spawn(client_writer(socket, addr, rx));
                        if join_tx.send(RelayClient { addr, tx }).is_err() {
                            break;
                        }
                        info!(event = "relay_client_connected", %addr);
                    }
                    Err(err) => {
                        failures = failures.saturating_add(1);
                        let delay = accept_backoff(failures);
                        warn!(
                            event = "relay_accept_failed",
                            error = %err,
                            failures,
                            retry_in_ms = delay.as_millis() as u64
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        });

        let mut clients: Vec<RelayClient> = Vec::new();
        let mut summary = RelaySummary::default();
        let result = loop {
            let chunk: Chunk = match reader.next().await {
                Ok(Some(chunk)) => Arc::from(chunk.as_bytes()),
                Ok(None) => break Ok(()),
                Err(err) => break Err(err),
            };

            while let Ok(client) = join_rx.try_recv() {
                summary.clients_served += 1;
                clients.push(client);
            }

            summary.bytes += chunk.len() as u64;
            summary.chunks += 1;
            clients.retain(|client| match client.tx.try_send(Arc::clone(&chunk)) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(event = "relay_client_dropped", addr = %client.addr, reason = "backpressure");
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(event = "relay_client_dropped", addr = %client.addr, reason = "disconnected");
                    false
                }
            });
        };

        accept_task.abort();
        info!(
            event = "relay_stopped",
            bytes = summary.bytes,
            chunks = summary.chunks,
            clients_served = summary.clients_served
        );
        result.map(|()| summary)
    }
}

/// Pause after the `failures`-th consecutive accept error.
fn accept_backoff(failures: u32) -> Duration {
    let shift = failures.saturating_sub(1).min(16);
    ACCEPT_BACKOFF_INITIAL
        .saturating_mul(1 << shift)
        .min(ACCEPT_BACKOFF_MAX)
}

async fn client_writer(mut socket: TcpStream, addr: SocketAddr, mut rx: mpsc::Receiver<Chunk>) {
    while let Some(chunk) = rx.recv().await {
        if let Err(err) = socket.write_all(&chunk).await {
            debug!(event = "relay_client_write_failed", %addr, error = %err);
            return;
        }
    }
    let _ = socket.shutdown().await;
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    use super::{accept_backoff, Relay, ACCEPT_BACKOFF_MAX};
    use crate::config::NtripVersion;
    use crate::stream::negotiate::Negotiated;
    use crate::stream::proto::ResponseHead;
    use crate::stream::reader::StreamReader;

    #[test]
    fn accept_errors_back_off_up_to_cap() {
        assert_eq!(accept_backoff(1), Duration::from_millis(50));
        assert_eq!(accept_backoff(2), Duration::from_millis(100));
        assert!(accept_backoff(3) > accept_backoff(2));
        assert_eq!(accept_backoff(10), ACCEPT_BACKOFF_MAX);
        assert_eq!(accept_backoff(u32::MAX), ACCEPT_BACKOFF_MAX);
    }

    #[tokio::test]
    async fn fans_out_chunks_to_connected_clients() {
        let relay = Relay::bind("127.0.0.1:0").await.expect("bind");
        let addr = relay.local_addr().expect("addr");

        let (client_side, mut caster) = duplex(256);
        let mut reader = StreamReader::new(
            Negotiated {
                transport: client_side,
                version: NtripVersion::V2,
                head: ResponseHead {
                    lines: vec!["ICY 200 OK".to_string()],
                },
                leftover: Vec::new(),
                chunked: false,
            },
            64,
        );

        let relay_task = tokio::spawn(async move { relay.run(&mut reader).await });

        let mut first = TcpStream::connect(addr).await.expect("connect first");
        let mut second = TcpStream::connect(addr).await.expect("connect second");
        tokio::time::sleep(Duration::from_millis(50)).await;

        caster.write_all(b"\xd3\x00\x13").await.expect("write");
        tokio::time::sleep(Duration::from_millis(20)).await;
        caster.write_all(b"\x3e\xd7").await.expect("write");
        drop(caster);

        let summary = relay_task.await.expect("join").expect("relay");
        assert_eq!(summary.bytes, 5);
        assert_eq!(summary.clients_served, 2);

        for socket in [&mut first, &mut second] {
            let mut received = Vec::new();
            tokio::time::timeout(Duration::from_secs(1), socket.read_to_end(&mut received))
                .await
                .expect("client drained")
                .expect("read");
            assert_eq!(received, b"\xd3\x00\x13\x3e\xd7");
        }
    }
}
