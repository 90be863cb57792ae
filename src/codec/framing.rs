//! Byte-stream framing: separator-delimited lines, binary sub-segments, and
//! the `ZON`/`ZOF` incremental-inflate mode (§4.A).
//!
//! Owned by the buffered socket, one instance per connection. `push` feeds
//! raw bytes in and returns however many complete frames fell out; partial
//! data is retained across calls.

use flate2::{Decompress, FlushDecompress, Status};

use crate::error::ProtocolError;

/// A complete frame produced by the splitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A separator-terminated text line, decoded lossily as UTF-8.
    Line(String),
    /// A fixed-size opaque payload requested via [`FrameSplitter::expect_binary`].
    Binary(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Line,
    Binary(usize),
}

/// Splits an inbound byte stream into [`Frame`]s.
pub struct FrameSplitter {
    separator: u8,
    buf: Vec<u8>,
    mode: Mode,
    inflate: Option<Decompress>,
}

impl FrameSplitter {
    /// `separator` is `b'\n'` for ADC, `b'|'` for NMDC.
    #[must_use]
    pub fn new(separator: u8) -> Self {
        Self {
            separator,
            buf: Vec::new(),
            mode: Mode::Line,
            inflate: None,
        }
    }

    /// Switches to incremental raw-deflate inflate mode (`ZON`).
    pub fn enable_zpipe(&mut self) {
        self.inflate = Some(Decompress::new(false));
    }

    /// Restores raw line mode (`ZOF`), discarding any inflate state.
    pub fn disable_zpipe(&mut self) {
        self.inflate = None;
    }

    #[must_use]
    pub fn zpipe_active(&self) -> bool {
        self.inflate.is_some()
    }

    /// The next `n` bytes (after any pending line/partial data) will be
    /// delivered as a single `Frame::Binary` instead of being line-split.
    pub fn expect_binary(&mut self, n: usize) {
        self.mode = Mode::Binary(n);
    }

    /// Feeds newly-received bytes and drains any complete frames.
    ///
    /// A corrupt deflate stream disables zpipe mode and logs a warning; the
    /// raw bytes received so far are treated as already-inflated, matching
    /// the "downgrade to raw mode with a warning" policy.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>, ProtocolError> {
        if self.inflate.is_some() {
            match self.inflate_chunk(data) {
                Ok(plain) => self.buf.extend_from_slice(&plain),
                Err(e) => {
                    log::warn!("zpipe inflate failed, downgrading to raw mode: {e}");
                    self.inflate = None;
                    self.buf.extend_from_slice(data);
                }
            }
        } else {
            self.buf.extend_from_slice(data);
        }

        let mut frames = Vec::new();
        loop {
            match self.mode {
                Mode::Line => match self.buf.iter().position(|&b| b == self.separator) {
                    Some(pos) => {
                        let raw: Vec<u8> = self.buf.drain(..=pos).collect();
                        let line = &raw[..raw.len() - 1];
                        if !line.is_empty() {
                            frames.push(Frame::Line(String::from_utf8_lossy(line).into_owned()));
                        }
                    }
                    None => break,
                },
                Mode::Binary(n) => {
                    if self.buf.len() >= n {
                        let payload: Vec<u8> = self.buf.drain(..n).collect();
                        frames.push(Frame::Binary(payload));
                        self.mode = Mode::Line;
                    } else {
                        break;
                    }
                }
            }
        }
        Ok(frames)
    }

    fn inflate_chunk(&mut self, data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let inflate = self.inflate.as_mut().expect("checked by caller");
        let mut out = Vec::with_capacity(data.len() * 4);
        let mut scratch = [0u8; 8192];
        let mut remaining = data;
        loop {
            let before_in = inflate.total_in();
            let before_out = inflate.total_out();
            let status = inflate
                .decompress(remaining, &mut scratch, FlushDecompress::None)
                .map_err(|e| ProtocolError::Encoding(format!("zpipe inflate error: {e}")))?;
            let produced = (inflate.total_out() - before_out) as usize;
            out.extend_from_slice(&scratch[..produced]);
            let consumed = (inflate.total_in() - before_in) as usize;
            remaining = &remaining[consumed..];

            match status {
                Status::StreamEnd => break,
                Status::BufError => break,
                Status::Ok if remaining.is_empty() && produced == 0 => break,
                Status::Ok if consumed == 0 && produced == 0 => break,
                Status::Ok => {
                    if remaining.is_empty() {
                        break;
                    }
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_simple_lines() {
        let mut splitter = FrameSplitter::new(b'\n');
        let frames = splitter.push(b"BINF AAAA\nBMSG AAAA hi\n").unwrap();
        assert_eq!(
            frames,
            vec![
                Frame::Line("BINF AAAA".into()),
                Frame::Line("BMSG AAAA hi".into()),
            ]
        );
    }

    #[test]
    fn holds_partial_line_across_calls() {
        let mut splitter = FrameSplitter::new(b'\n');
        assert!(splitter.push(b"BINF AA").unwrap().is_empty());
        let frames = splitter.push(b"AA\n").unwrap();
        assert_eq!(frames, vec![Frame::Line("BINF AAAA".into())]);
    }

    #[test]
    fn pipe_separator_for_nmdc() {
        let mut splitter = FrameSplitter::new(b'|');
        let frames = splitter.push(b"$Lock foo Pk=bar|$Supports A|").unwrap();
        assert_eq!(
            frames,
            vec![
                Frame::Line("$Lock foo Pk=bar".into()),
                Frame::Line("$Supports A".into()),
            ]
        );
    }

    #[test]
    fn binary_mode_collects_exact_byte_count() {
        let mut splitter = FrameSplitter::new(b'\n');
        splitter.expect_binary(4);
        let first = splitter.push(b"\x01\x02").unwrap();
        assert!(first.is_empty());
        let second = splitter.push(b"\x03\x04leftover\n").unwrap();
        assert_eq!(second[0], Frame::Binary(vec![1, 2, 3, 4]));
        assert_eq!(second[1], Frame::Line("leftover".into()));
    }

    #[test]
    fn zpipe_round_trips_deflated_data() {
        use flate2::write::DeflateEncoder;
        use flate2::Compression;
        use std::io::Write;

        let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"BINF AAAA\n").unwrap();
        let compressed = enc.finish().unwrap();

        let mut splitter = FrameSplitter::new(b'\n');
        splitter.enable_zpipe();
        let frames = splitter.push(&compressed).unwrap();
        assert_eq!(frames, vec![Frame::Line("BINF AAAA".into())]);
    }
}
