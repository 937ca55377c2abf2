//! In-place decoder for `Transfer-Encoding: chunked` bodies.
//!
//! NTRIP 2.0 casters usually frame the correction stream in HTTP chunks. The
//! decoder strips that framing from each read buffer without allocating, so
//! the reader can still hand out a borrowed view of the payload.

use std::io;

const MAX_SIZE_DIGITS: usize = 16;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    Size { value: u64, digits: usize, extension: bool },
    SizeLf { value: u64 },
    Data { remaining: u64 },
    DataCr,
    DataLf,
    Trailer { line_len: usize },
    Done,
}

/// Result of decoding one buffer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Decoded {
    /// Number of payload bytes now at the front of the buffer.
    pub len: usize,
    /// The terminating zero-length chunk (and trailers) has been consumed.
    pub finished: bool,
}

#[derive(Clone, Debug)]
pub struct ChunkedDecoder {
    state: State,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self {
            state: State::Size {
                value: 0,
                digits: 0,
                extension: false,
            },
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state == State::Done
    }

    /// Whether the decoder is partway through a chunk or its framing.
    ///
    /// End of input in this state means the body was truncated.
    pub fn is_mid_chunk(&self) -> bool {
        !matches!(
            self.state,
            State::Done
                | State::Size {
                    digits: 0,
                    extension: false,
                    ..
                }
        )
    }

    /// Decodes `buf` in place, compacting payload bytes to its front.
    ///
    /// Input after the terminating chunk is ignored.
    pub fn decode_in_place(&mut self, buf: &mut [u8]) -> io::Result<Decoded> {
        let mut read = 0;
        let mut written = 0;

        while read < buf.len() {
            match self.state {
                State::Done => break,
                State::Data { remaining } => {
                    let available = buf.len() - read;
                    let take = usize::try_from(remaining)
                        .unwrap_or(usize::MAX)
                        .min(available);
                    buf.copy_within(read..read + take, written);
                    read += take;
                    written += take;
                    let remaining = remaining - take as u64;
                    self.state = if remaining == 0 {
                        State::DataCr
                    } else {
                        State::Data { remaining }
                    };
                }
                state => {
                    let byte = buf[read];
                    read += 1;
                    self.state = step(state, byte)?;
                }
            }
        }

        Ok(Decoded {
            len: written,
            finished: self.state == State::Done,
        })
    }
}

fn step(state: State, byte: u8) -> io::Result<State> {
    match state {
        State::Size {
            value,
            digits,
            extension,
        } => match byte {
            b'\r' if digits > 0 => Ok(State::SizeLf { value }),
            b'\n' if digits > 0 => Ok(end_of_size_line(value)),
            _ if extension => Ok(state),
            b';' if digits > 0 => Ok(State::Size {
                value,
                digits,
                extension: true,
            }),
            b' ' | b'\t' if digits > 0 => Ok(State::Size {
                value,
                digits,
                extension: true,
            }),
            _ => {
                let digit = (byte as char)
                    .to_digit(16)
                    .ok_or_else(|| invalid(format!("invalid chunk size byte 0x{byte:02x}")))?;
                if digits == MAX_SIZE_DIGITS {
                    return Err(invalid("chunk size too large".to_string()));
                }
                Ok(State::Size {
                    value: (value << 4) | u64::from(digit),
                    digits: digits + 1,
                    extension: false,
                })
            }
        },
        State::SizeLf { value } => match byte {
            b'\n' => Ok(end_of_size_line(value)),
            _ => Err(invalid("expected LF after chunk size".to_string())),
        },
        State::DataCr => match byte {
            b'\r' => Ok(State::DataLf),
            b'\n' => Ok(State::Size {
                value: 0,
                digits: 0,
                extension: false,
            }),
            _ => Err(invalid("chunk data longer than declared size".to_string())),
        },
        State::DataLf => match byte {
            b'\n' => Ok(State::Size {
                value: 0,
                digits: 0,
                extension: false,
            }),
            _ => Err(invalid("expected LF after chunk data".to_string())),
        },
        State::Trailer { line_len } => match byte {
            b'\n' if line_len == 0 => Ok(State::Done),
            b'\n' => Ok(State::Trailer { line_len: 0 }),
            b'\r' => Ok(state),
            _ => Ok(State::Trailer {
                line_len: line_len + 1,
            }),
        },
        State::Data { .. } | State::Done => Ok(state),
    }
}

fn end_of_size_line(value: u64) -> State {
    if value == 0 {
        State::Trailer { line_len: 0 }
    } else {
        State::Data { remaining: value }
    }
}

fn invalid(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

#[cfg(test)]
mod tests {
    use super::{ChunkedDecoder, Decoded};

    fn decode_split(body: &[u8], split: usize) -> (Vec<u8>, bool) {
        let mut decoder = ChunkedDecoder::new();
        let mut out = Vec::new();
        let mut finished = false;
        for piece in body.chunks(split) {
            let mut buf = piece.to_vec();
            let Decoded { len, finished: done } =
                decoder.decode_in_place(&mut buf).expect("decode");
            out.extend_from_slice(&buf[..len]);
            finished = done;
        }
        (out, finished)
    }

    #[test]
    fn strips_framing_across_any_split() {
        let body = b"3\r\n\xd3\x00\x13\r\nA;ext=1\r\n0123456789\r\n0\r\n\r\n";
        for split in 1..=body.len() {
            let (out, finished) = decode_split(body, split);
            assert_eq!(out, b"\xd3\x00\x130123456789", "split {split}");
            assert!(finished, "split {split}");
        }
    }

    #[test]
    fn accepts_bare_lf_framing() {
        let (out, finished) = decode_split(b"2\nab\n0\n\n", 64);
        assert_eq!(out, b"ab");
        assert!(finished);
    }

    #[test]
    fn skips_trailers_and_ignores_bytes_after_end() {
        let (out, finished) = decode_split(b"1\r\nx\r\n0\r\nX-Trailer: y\r\n\r\ngarbage", 5);
        assert_eq!(out, b"x");
        assert!(finished);
    }

    #[test]
    fn rejects_bad_size_and_overlong_data() {
        let mut decoder = ChunkedDecoder::new();
        assert!(decoder.decode_in_place(&mut b"zz\r\n".to_vec()).is_err());

        let mut decoder = ChunkedDecoder::new();
        assert!(decoder.decode_in_place(&mut b"1\r\nab\r\n".to_vec()).is_err());
    }

    #[test]
    fn tracks_truncation_points() {
        let mut decoder = ChunkedDecoder::new();
        assert!(!decoder.is_mid_chunk());
        decoder
            .decode_in_place(&mut b"4\r\nab".to_vec())
            .expect("decode");
        assert!(decoder.is_mid_chunk());
        decoder
            .decode_in_place(&mut b"cd\r\n".to_vec())
            .expect("decode");
        assert!(!decoder.is_mid_chunk());
        assert!(!decoder.is_finished());
    }
}
