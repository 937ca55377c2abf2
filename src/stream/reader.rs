//! Negotiated connection exposed as a lazy sequence of byte chunks.

use std::fmt;
use std::io;
use std::ops::Deref;
use std::sync::Arc;

use futures_util::Stream;
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::config::NtripVersion;
use crate::error::NtripError;
use crate::stream::chunked::ChunkedDecoder;
use crate::stream::negotiate::Negotiated;
use crate::stream::proto::ResponseHead;
use crate::stream::session::SessionState;
use crate::transport::Transport;

/// Borrowed view of bytes received by one [`StreamReader::next`] call.
///
/// Valid until the next call on the reader.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct DataChunk<'a> {
    bytes: &'a [u8],
}

impl<'a> DataChunk<'a> {
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }
}

impl Deref for DataChunk<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.bytes
    }
}

impl AsRef<[u8]> for DataChunk<'_> {
    fn as_ref(&self) -> &[u8] {
        self.bytes
    }
}

impl fmt::Debug for DataChunk<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataChunk")
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Cloneable handle that ends a stream from another task.
///
/// Closing wakes a pending [`StreamReader::next`], which then returns
/// `Ok(None)`. The handle only signals the reader; the transport is released
/// by the reader itself, when its pending or next `next()` call observes the
/// request or when the reader is dropped. Use [`StreamReader::close`] to
/// release it immediately from the owning side.
#[derive(Clone, Debug)]
pub struct CloseHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CloseHandle {
    fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { tx: Arc::new(tx) }, rx)
    }

    /// Requests close. Calling it more than once has no further effect.
    pub fn close(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Sequential reader over a negotiated caster connection.
///
/// Yields raw correction bytes in arrival order without interpreting them.
/// The reader never reconnects; once it reports end-of-stream or an error a
/// new session is needed.
pub struct StreamReader<T> {
    transport: Option<T>,
    state: SessionState,
    version: NtripVersion,
    head: ResponseHead,
    leftover: Vec<u8>,
    chunked: Option<ChunkedDecoder>,
    buf: Vec<u8>,
    bytes_read: u64,
    close_handle: CloseHandle,
    closed: watch::Receiver<bool>,
}

impl<T> fmt::Debug for StreamReader<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamReader")
            .field("state", &self.state)
            .field("version", &self.version)
            .field("status_line", &self.status_line())
            .field("chunked", &self.chunked.is_some())
            .finish()
    }
}

impl<T> StreamReader<T> {
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn version(&self) -> NtripVersion {
        self.version
    }

    pub fn status_line(&self) -> &str {
        self.head.status_line().unwrap_or("")
    }

    pub fn header_lines(&self) -> &[String] {
        &self.head.lines
    }

    /// Payload bytes handed out by [`next`](StreamReader::next) so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn close_handle(&self) -> CloseHandle {
        self.close_handle.clone()
    }

    /// Closes the stream and releases the transport. Idempotent.
    pub fn close(&mut self) {
        self.close_handle.close();
        if !self.state.is_terminal() {
            self.finish(SessionState::Closed);
        }
    }

    fn finish(&mut self, state: SessionState) {
        debug_assert!(self.state.can_transition_to(state) || self.state == state);
        self.state = state;
        self.transport = None;
        self.leftover = Vec::new();
    }
}

impl<T: Transport> StreamReader<T> {
    pub(crate) fn new(negotiated: Negotiated<T>, read_buffer_size: usize) -> Self {
        let (close_handle, closed) = CloseHandle::new();
        Self {
            transport: Some(negotiated.transport),
            state: SessionState::Streaming,
            version: negotiated.version,
            head: negotiated.head,
            leftover: negotiated.leftover,
            chunked: negotiated.chunked.then(ChunkedDecoder::new),
            buf: vec![0; read_buffer_size.max(1)],
            bytes_read: 0,
            close_handle,
            closed,
        }
    }

    /// Waits for the next run of bytes.
    ///
    /// Returns `Ok(None)` once the caster ends the stream or the reader is
    /// closed. A transport failure is reported once as
    /// [`NtripError::StreamInterrupted`]; later calls return `Ok(None)`.
    pub async fn next(&mut self) -> Result<Option<DataChunk<'_>>, NtripError> {
        loop {
            if self.state.is_terminal() {
                return Ok(None);
            }
            let close_requested = *self.closed.borrow();
            if close_requested {
                self.finish(SessionState::Closed);
                return Ok(None);
            }

            let n = if !self.leftover.is_empty() {
                let leftover = std::mem::take(&mut self.leftover);
                if self.buf.len() < leftover.len() {
                    self.buf.resize(leftover.len(), 0);
                }
                self.buf[..leftover.len()].copy_from_slice(&leftover);
                leftover.len()
            } else {
                let Some(transport) = self.transport.as_mut() else {
                    self.finish(SessionState::Closed);
                    return Ok(None);
                };
                let read = tokio::select! {
                    biased;
                    _ = self.closed.wait_for(|closed| *closed) => None,
                    result = transport.read(&mut self.buf) => Some(result),
                };
                match read {
                    None => {
                        debug!(event = "ntrip_stream_closed", reason = "close_requested");
                        self.finish(SessionState::Closed);
                        return Ok(None);
                    }
                    Some(Ok(0)) => return self.end_of_input(),
                    Some(Ok(n)) => n,
                    Some(Err(err)) => return Err(self.interrupt(err)),
                }
            };

            let len = match self.chunked.as_mut() {
                None => n,
                Some(decoder) => match decoder.decode_in_place(&mut self.buf[..n]) {
                    Ok(decoded) => {
                        if decoded.finished {
                            // Payload before the terminal chunk still goes out;
                            // the next call observes the finished decoder.
                            self.transport = None;
                        }
                        decoded.len
                    }
                    Err(err) => return Err(self.interrupt(err)),
                },
            };

            if len == 0 {
                continue;
            }
            self.bytes_read += len as u64;
            return Ok(Some(DataChunk {
                bytes: &self.buf[..len],
            }));
        }
    }

    /// Converts the reader into a [`Stream`] of owned chunks.
    pub fn into_stream(self) -> impl Stream<Item = Result<Vec<u8>, NtripError>> + Send {
        futures_util::stream::unfold(self, |mut reader| async move {
            let item = match reader.next().await {
                Ok(Some(chunk)) => Ok(chunk.to_vec()),
                Ok(None) => return None,
                Err(err) => Err(err),
            };
            Some((item, reader))
        })
    }

    fn end_of_input(&mut self) -> Result<Option<DataChunk<'_>>, NtripError> {
        let truncated = self
            .chunked
            .as_ref()
            .map(ChunkedDecoder::is_mid_chunk)
            .unwrap_or(false);
        if truncated {
            return Err(self.interrupt(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "caster closed the connection inside a chunk",
            )));
        }
        debug!(event = "ntrip_stream_closed", reason = "caster_eof");
        self.finish(SessionState::Closed);
        Ok(None)
    }

    fn interrupt(&mut self, err: io::Error) -> NtripError {
        warn!(event = "ntrip_stream_interrupted", error = %err);
        self.finish(SessionState::Failed);
        NtripError::StreamInterrupted(err)
    }
}
