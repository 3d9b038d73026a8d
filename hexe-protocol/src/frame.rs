// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The pod VT framing: a 5 byte `{u8 frame_type, u32 len}` header with a
//! big-endian length, followed by `len` payload bytes.

use anyhow::anyhow;
use byteorder::{BigEndian, ByteOrder};

use crate::{FRAME_HEADER_LEN, MAX_FRAME_LEN};

/// What a pod frame carries.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameKind {
    /// Pty output, pod -> consumer.
    Output = 1,
    /// Bytes for the pty, consumer -> pod.
    Input = 2,
    /// A `{cols u16 BE, rows u16 BE}` winsize change.
    Resize = 3,
    /// Marks the end of the backlog replay on a fresh attach.
    BacklogEnd = 4,
    /// Out-of-band control, JSON payload.
    Control = 5,
}

impl TryFrom<u8> for FrameKind {
    type Error = anyhow::Error;

    fn try_from(v: u8) -> anyhow::Result<Self> {
        match v {
            1 => Ok(FrameKind::Output),
            2 => Ok(FrameKind::Input),
            3 => Ok(FrameKind::Resize),
            4 => Ok(FrameKind::BacklogEnd),
            5 => Ok(FrameKind::Control),
            _ => Err(anyhow!("unknown frame kind {}", v)),
        }
    }
}

/// A borrowed view of one complete frame.
#[derive(Debug, PartialEq)]
pub struct Frame<'data> {
    pub kind: FrameKind,
    pub data: &'data [u8],
}

pub fn encode_frame_header(kind: FrameKind, len: usize) -> [u8; FRAME_HEADER_LEN] {
    let mut header = [0u8; FRAME_HEADER_LEN];
    header[0] = kind as u8;
    BigEndian::write_u32(&mut header[1..], len as u32);
    header
}

enum ReaderState {
    /// Collecting the 5 header bytes.
    Header,
    /// Collecting `want` payload bytes for a frame we will deliver.
    Payload { kind: FrameKind, want: usize },
    /// Discarding `remaining` bytes of a frame we will not deliver,
    /// either oversized or of unknown kind.
    Skipping { remaining: usize },
}

/// An incremental frame parser safe to feed from non-blocking reads.
///
/// Bytes go in via [`FrameReader::feed`] in arbitrarily sized chunks; a
/// callback fires once per complete frame. Frames declaring more than
/// [`MAX_FRAME_LEN`] bytes are skipped without desynchronising the
/// stream. The payload buffer is retained across frames, so a reader
/// settles into zero allocation on a steady stream.
pub struct FrameReader {
    state: ReaderState,
    header: [u8; FRAME_HEADER_LEN],
    header_fill: usize,
    payload: Vec<u8>,
}

impl Default for FrameReader {
    fn default() -> Self {
        FrameReader::new()
    }
}

impl FrameReader {
    pub fn new() -> FrameReader {
        FrameReader {
            state: ReaderState::Header,
            header: [0; FRAME_HEADER_LEN],
            header_fill: 0,
            payload: Vec::new(),
        }
    }

    /// Drop any partial frame. The reader can then be reused on a
    /// fresh connection.
    pub fn reset(&mut self) {
        self.state = ReaderState::Header;
        self.header_fill = 0;
        self.payload.clear();
    }

    /// Consume `bytes`, invoking `on_frame` for every frame completed.
    pub fn feed<F>(&mut self, mut bytes: &[u8], mut on_frame: F)
    where
        F: FnMut(Frame<'_>),
    {
        while !bytes.is_empty() {
            match self.state {
                ReaderState::Header => {
                    let take = (FRAME_HEADER_LEN - self.header_fill).min(bytes.len());
                    self.header[self.header_fill..self.header_fill + take]
                        .copy_from_slice(&bytes[..take]);
                    self.header_fill += take;
                    bytes = &bytes[take..];
                    if self.header_fill < FRAME_HEADER_LEN {
                        return;
                    }

                    self.header_fill = 0;
                    let len = BigEndian::read_u32(&self.header[1..]) as usize;
                    match FrameKind::try_from(self.header[0]) {
                        Ok(kind) if len <= MAX_FRAME_LEN => {
                            if len == 0 {
                                on_frame(Frame { kind, data: &[] });
                            } else {
                                self.payload.clear();
                                self.state = ReaderState::Payload { kind, want: len };
                            }
                        }
                        // Oversized and unknown-kind frames get the
                        // same treatment: swallow the declared length
                        // and pick back up at the next header.
                        _ => {
                            if len > 0 {
                                self.state = ReaderState::Skipping { remaining: len };
                            }
                        }
                    }
                }
                ReaderState::Payload { kind, want } => {
                    let take = (want - self.payload.len()).min(bytes.len());
                    self.payload.extend_from_slice(&bytes[..take]);
                    bytes = &bytes[take..];
                    if self.payload.len() == want {
                        on_frame(Frame { kind, data: &self.payload });
                        self.state = ReaderState::Header;
                    }
                }
                ReaderState::Skipping { remaining } => {
                    let take = remaining.min(bytes.len());
                    bytes = &bytes[take..];
                    if take == remaining {
                        self.state = ReaderState::Header;
                    } else {
                        self.state = ReaderState::Skipping { remaining: remaining - take };
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn collect(reader: &mut FrameReader, chunks: &[&[u8]]) -> Vec<(FrameKind, Vec<u8>)> {
        let mut out = vec![];
        for chunk in chunks {
            reader.feed(chunk, |frame| out.push((frame.kind, frame.data.to_vec())));
        }
        out
    }

    #[test]
    fn split_across_chunks() {
        // "Hello" as an output frame, then "ab" as an input frame,
        // split at awkward boundaries.
        let mut reader = FrameReader::new();
        let frames = collect(
            &mut reader,
            &[
                &[0x01, 0x00, 0x00, 0x00, 0x05, 0x48, 0x65, 0x6c, 0x6c],
                &[0x6f, 0x02, 0x00, 0x00, 0x00, 0x02, 0x61],
                &[0x62],
            ],
        );
        assert_eq!(
            frames,
            vec![
                (FrameKind::Output, b"Hello".to_vec()),
                (FrameKind::Input, b"ab".to_vec()),
            ]
        );
    }

    #[test]
    fn byte_at_a_time() {
        let mut stream = vec![];
        stream.extend_from_slice(&encode_frame_header(FrameKind::Output, 3));
        stream.extend_from_slice(b"abc");
        stream.extend_from_slice(&encode_frame_header(FrameKind::BacklogEnd, 0));
        stream.extend_from_slice(&encode_frame_header(FrameKind::Resize, 4));
        stream.extend_from_slice(&[0x00, 0x50, 0x00, 0x18]);

        let mut reader = FrameReader::new();
        let mut frames = vec![];
        for b in stream {
            reader.feed(&[b], |frame| frames.push((frame.kind, frame.data.to_vec())));
        }
        assert_eq!(
            frames,
            vec![
                (FrameKind::Output, b"abc".to_vec()),
                (FrameKind::BacklogEnd, vec![]),
                (FrameKind::Resize, vec![0x00, 0x50, 0x00, 0x18]),
            ]
        );
    }

    #[test]
    fn oversized_frame_is_skipped() {
        let mut stream = vec![];
        stream.extend_from_slice(&encode_frame_header(FrameKind::Output, 10 * 1024 * 1024));
        stream.extend_from_slice(&vec![0xaa; 10 * 1024 * 1024]);
        stream.extend_from_slice(&encode_frame_header(FrameKind::Input, 2));
        stream.extend_from_slice(b"ok");

        let mut reader = FrameReader::new();
        let frames = collect(&mut reader, &[&stream]);
        assert_eq!(frames, vec![(FrameKind::Input, b"ok".to_vec())]);
    }

    #[test]
    fn unknown_kind_is_skipped() {
        let mut stream = vec![];
        stream.push(0x7f);
        stream.extend_from_slice(&3u32.to_be_bytes());
        stream.extend_from_slice(b"???");
        stream.extend_from_slice(&encode_frame_header(FrameKind::Output, 1));
        stream.push(b'x');

        let mut reader = FrameReader::new();
        let frames = collect(&mut reader, &[&stream]);
        assert_eq!(frames, vec![(FrameKind::Output, b"x".to_vec())]);
    }

    #[test]
    fn reset_clears_partial_state() {
        let mut reader = FrameReader::new();
        reader.feed(&[0x01, 0x00, 0x00], |_| panic!("no complete frame yet"));
        reader.reset();

        let frames = collect(&mut reader, &[&encode_frame_header(FrameKind::BacklogEnd, 0)]);
        assert_eq!(frames, vec![(FrameKind::BacklogEnd, vec![])]);
    }

    #[test]
    fn max_len_boundary_is_accepted() {
        let mut stream = vec![];
        stream.extend_from_slice(&encode_frame_header(FrameKind::Output, MAX_FRAME_LEN));
        stream.extend_from_slice(&vec![0x11; MAX_FRAME_LEN]);

        let mut reader = FrameReader::new();
        let mut lens = vec![];
        reader.feed(&stream, |frame| lens.push(frame.data.len()));
        assert_eq!(lens, vec![MAX_FRAME_LEN]);
    }
}
