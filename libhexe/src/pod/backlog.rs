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

//! The pty output ring. Replayed in full to every fresh VT consumer,
//! which is what makes detach/reattach byte-identical up to the
//! window size.

use std::collections::VecDeque;

/// A bounded byte ring. Pushing past capacity evicts from the front,
/// so the ring always holds the most recent bytes.
pub struct Backlog {
    buf: VecDeque<u8>,
    capacity: usize,
}

impl Backlog {
    pub fn new(capacity: usize) -> Backlog {
        Backlog { buf: VecDeque::with_capacity(capacity.min(64 * 1024)), capacity }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        // a chunk larger than the ring reduces to its tail
        let bytes = if bytes.len() > self.capacity {
            &bytes[bytes.len() - self.capacity..]
        } else {
            bytes
        };
        let overflow = (self.buf.len() + bytes.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            self.buf.drain(..overflow);
        }
        self.buf.extend(bytes);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The ring contents, oldest first, in at most two slices.
    pub fn as_slices(&self) -> (&[u8], &[u8]) {
        self.buf.as_slices()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn contents(backlog: &Backlog) -> Vec<u8> {
        let (a, b) = backlog.as_slices();
        let mut out = a.to_vec();
        out.extend_from_slice(b);
        out
    }

    #[test]
    fn keeps_everything_under_capacity() {
        let mut backlog = Backlog::new(16);
        backlog.push(b"hello ");
        backlog.push(b"world");
        assert_eq!(contents(&backlog), b"hello world");
    }

    #[test]
    fn evicts_oldest_first() {
        let mut backlog = Backlog::new(8);
        backlog.push(b"abcdefgh");
        backlog.push(b"XY");
        assert_eq!(contents(&backlog), b"cdefghXY");
        assert_eq!(backlog.len(), 8);
    }

    #[test]
    fn giant_push_keeps_the_tail() {
        let mut backlog = Backlog::new(4);
        backlog.push(b"0123456789");
        assert_eq!(contents(&backlog), b"6789");
    }

    #[test]
    fn empty_ring() {
        let backlog = Backlog::new(4);
        assert!(backlog.is_empty());
        assert_eq!(contents(&backlog), b"");
    }
}
