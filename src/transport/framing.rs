//! `Content-Length` frame codec.
//!
//! ```text
//! Content-Length: 52\r\n
//! Content-Type: application/vscode-jsonrpc; charset=utf-8\r\n
//! \r\n
//! {"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}
//! ```
//!
//! Header names are matched case-insensitively and headers other than
//! `Content-Length` are ignored. A frame whose header block cannot be used
//! is logged, counted and dropped, and decoding resumes with the next
//! frame; the decoder never returns an error for bad input. Bodies larger
//! than the configured limit are skipped as they stream past without being
//! buffered.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{DEFAULT_MAX_HEADER_SIZE, DEFAULT_MAX_MESSAGE_SIZE};
use crate::error::FrameError;
use crate::observability::logging::sanitize_for_log;
use crate::observability::metrics;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
const CONTENT_LENGTH: &[u8] = b"content-length";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    /// Waiting for a complete header block.
    Header,
    /// Header parsed; waiting for this many body bytes.
    Body(usize),
    /// Skipping this many bytes of an oversized body.
    Discard(usize),
    /// Skipping an oversized header block up to its terminator.
    SkipHeader,
}

/// Decoder/encoder for `Content-Length` framed payloads.
///
/// Decoded items are raw payload bytes; the header block is consumed.
#[derive(Debug, Clone)]
pub struct ContentLengthCodec {
    max_message_size: usize,
    max_header_size: usize,
    state: DecodeState,
    dropped: u64,
}

impl ContentLengthCodec {
    /// Creates a codec with explicit size limits.
    #[must_use]
    pub const fn new(max_message_size: usize, max_header_size: usize) -> Self {
        Self {
            max_message_size,
            max_header_size,
            state: DecodeState::Header,
            dropped: 0,
        }
    }

    /// Returns the maximum accepted body size in bytes.
    #[must_use]
    pub const fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Number of frames dropped by this decoder so far.
    #[must_use]
    pub const fn dropped_frames(&self) -> u64 {
        self.dropped
    }

    fn reject(&mut self, err: &FrameError) {
        tracing::warn!(reason = err.label(), error = %err, "dropping malformed frame");
        metrics::record_frame_dropped(err.label());
        self.dropped += 1;
    }

    /// Handles one complete header block of `block_len` bytes (terminator
    /// excluded) at the front of `src`.
    fn take_header(&mut self, src: &mut BytesMut, block_len: usize) {
        if block_len > self.max_header_size {
            self.reject(&FrameError::HeaderTooLarge {
                limit: self.max_header_size,
            });
            src.advance(block_len + HEADER_TERMINATOR.len());
            return;
        }

        match parse_header_block(&src[..block_len]) {
            Ok(len) if len > self.max_message_size => {
                src.advance(block_len + HEADER_TERMINATOR.len());
                self.reject(&FrameError::MessageTooLarge {
                    size: len,
                    limit: self.max_message_size,
                });
                self.state = DecodeState::Discard(len);
            }
            Ok(len) => {
                src.advance(block_len + HEADER_TERMINATOR.len());
                self.state = DecodeState::Body(len);
            }
            Err(err) => {
                self.reject(&err);
                // Junk in front of a real header (for example the tail of a
                // previously dropped body) is skipped up to the next
                // `Content-Length` name so that frame is not lost as well.
                // A block that already names `Content-Length` is dropped whole.
                let resync = if names_content_length(&src[..block_len]) {
                    None
                } else {
                    find_ignore_case(&src[1..block_len], CONTENT_LENGTH)
                };
                match resync {
                    Some(pos) => src.advance(pos + 1),
                    None => src.advance(block_len + HEADER_TERMINATOR.len()),
                }
            }
        }
    }
}

impl Default for ContentLengthCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_MAX_HEADER_SIZE)
    }
}

impl Decoder for ContentLengthCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                DecodeState::Header => {
                    let blank = src
                        .iter()
                        .take_while(|b| matches!(b, b'\r' | b'\n'))
                        .count();
                    src.advance(blank);

                    if let Some(block_len) = find(src, HEADER_TERMINATOR) {
                        self.take_header(src, block_len);
                        continue;
                    }
                    if src.len() > self.max_header_size {
                        self.reject(&FrameError::HeaderTooLarge {
                            limit: self.max_header_size,
                        });
                        keep_tail(src);
                        self.state = DecodeState::SkipHeader;
                    }
                    return Ok(None);
                }
                DecodeState::SkipHeader => {
                    let Some(block_len) = find(src, HEADER_TERMINATOR) else {
                        keep_tail(src);
                        return Ok(None);
                    };
                    src.advance(block_len + HEADER_TERMINATOR.len());
                    self.state = DecodeState::Header;
                }
                DecodeState::Discard(remaining) => {
                    let n = remaining.min(src.len());
                    src.advance(n);
                    if n < remaining {
                        self.state = DecodeState::Discard(remaining - n);
                        return Ok(None);
                    }
                    self.state = DecodeState::Header;
                }
                DecodeState::Body(len) => {
                    if src.len() < len {
                        src.reserve(len - src.len());
                        return Ok(None);
                    }
                    self.state = DecodeState::Header;
                    return Ok(Some(src.split_to(len).freeze()));
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        let partial = match self.state {
            DecodeState::Body(_) => true,
            DecodeState::Header => !src.is_empty(),
            DecodeState::Discard(_) | DecodeState::SkipHeader => false,
        };
        if partial {
            self.reject(&FrameError::Truncated { pending: src.len() });
        }
        src.clear();
        self.state = DecodeState::Header;
        Ok(None)
    }
}

impl Encoder<&[u8]> for ContentLengthCodec {
    type Error = io::Error;

    fn encode(&mut self, payload: &[u8], dst: &mut BytesMut) -> Result<(), Self::Error> {
        if payload.len() > self.max_message_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                FrameError::MessageTooLarge {
                    size: payload.len(),
                    limit: self.max_message_size,
                },
            ));
        }
        encode_frame(payload, dst);
        Ok(())
    }
}

/// Appends one framed payload to `dst`.
pub fn encode_frame(payload: &[u8], dst: &mut BytesMut) {
    let header = format!("Content-Length: {}\r\n\r\n", payload.len());
    dst.reserve(header.len() + payload.len());
    dst.put_slice(header.as_bytes());
    dst.put_slice(payload);
}

/// Extracts the body length from a header block (terminator excluded).
fn parse_header_block(block: &[u8]) -> Result<usize, FrameError> {
    let text = std::str::from_utf8(block).map_err(|_| FrameError::HeaderNotUtf8)?;
    let mut content_length = None;

    for line in text.lines() {
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(FrameError::MalformedHeader(sanitize_for_log(line, 80)));
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            let value = value.trim();
            let len = value
                .parse::<usize>()
                .map_err(|_| FrameError::InvalidContentLength(sanitize_for_log(value, 32)))?;
            content_length = Some(len);
        }
    }

    content_length.ok_or(FrameError::MissingContentLength)
}

/// Returns `true` when some line of `block` is a `Content-Length` header.
fn names_content_length(block: &[u8]) -> bool {
    block
        .split(|&b| b == b'\n')
        .filter_map(|line| line.iter().position(|&b| b == b':').map(|i| &line[..i]))
        .any(|name| name.trim_ascii().eq_ignore_ascii_case(CONTENT_LENGTH))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn find_ignore_case(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|w| w.eq_ignore_ascii_case(needle))
}

/// Drops buffered bytes except for a tail that could hold the start of a
/// split terminator.
fn keep_tail(src: &mut BytesMut) {
    let keep = (HEADER_TERMINATOR.len() - 1).min(src.len());
    src.advance(src.len() - keep);
}
