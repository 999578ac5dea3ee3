//-
// Copyright (c) 2024, Jason Lingle
//
// This file is part of Oryx.
//
// Oryx is free software: you can  redistribute it and/or  modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Oryx is distributed  in the hope  that it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Oryx. If not, see <http://www.gnu.org/licenses/>.

//! The byte buffer sitting on either side of a network connection.
//!
//! A `NetBuffer` is a FIFO of bytes with cheap appends at the back and cheap
//! consumption at the front. The contents are kept contiguous so that
//! parsers can inspect the head of the buffer without copying.

use crate::support::error::Error;

/// How far the front of the backing vector may lag before `consume`
/// compacts it.
const COMPACT_THRESHOLD: usize = 16 * 1024;

#[derive(Default)]
pub struct NetBuffer {
    data: Vec<u8>,
    start: usize,
}

impl NetBuffer {
    pub fn new() -> Self {
        NetBuffer::default()
    }

    pub fn len(&self) -> usize {
        self.data.len() - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.data.len()
    }

    /// Appends `bytes` at the back of the buffer.
    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// The entire unconsumed content.
    pub fn contents(&self) -> &[u8] {
        &self.data[self.start..]
    }

    /// Returns the first `n` bytes without consuming them, or `None` if the
    /// buffer does not hold that many yet.
    pub fn string(&self, n: usize) -> Option<&[u8]> {
        if self.len() >= n {
            Some(&self.data[self.start..self.start + n])
        } else {
            None
        }
    }

    /// Discards the first `n` bytes.
    ///
    /// # Panics
    ///
    /// Panics if the buffer holds fewer than `n` bytes.
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.len(), "consume past end of buffer");
        self.start += n;
        if self.start >= COMPACT_THRESHOLD || self.start == self.data.len() {
            self.data.drain(..self.start);
            self.start = 0;
        }
    }

    /// Removes and returns everything currently buffered.
    pub fn take(&mut self) -> Vec<u8> {
        let out = self.data.split_off(self.start);
        self.data.clear();
        self.start = 0;
        out
    }

    /// Removes one CRLF-terminated line (a bare LF is also accepted), not
    /// including the terminator.
    ///
    /// Returns `Ok(None)` if no complete line is buffered yet. Returns
    /// `Err(Error::LineTooLong)` if `limit` bytes are buffered with no line
    /// ending among them; the buffer is left untouched in that case so the
    /// caller can decide how to resynchronise.
    pub fn remove_line(
        &mut self,
        limit: usize,
    ) -> Result<Option<Vec<u8>>, Error> {
        let content = self.contents();
        match content.iter().position(|&b| b == b'\n') {
            Some(ix) if ix < limit => {
                let mut line = content[..ix].to_vec();
                if line.ends_with(b"\r") {
                    line.pop();
                }
                self.consume(ix + 1);
                Ok(Some(line))
            },
            Some(_) => Err(Error::LineTooLong),
            None if content.len() >= limit => Err(Error::LineTooLong),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn append_string_consume() {
        let mut buf = NetBuffer::new();
        assert!(buf.is_empty());
        buf.append(b"hello ");
        buf.append(b"world");
        assert_eq!(11, buf.len());
        assert_eq!(None, buf.string(12));
        assert_eq!(Some(&b"hello"[..]), buf.string(5));
        buf.consume(6);
        assert_eq!(Some(&b"world"[..]), buf.string(5));
        buf.consume(5);
        assert!(buf.is_empty());
    }

    #[test]
    fn line_extraction() {
        let mut buf = NetBuffer::new();
        buf.append(b"a1 NOOP\r\na2 LOG");
        assert_eq!(
            Some(b"a1 NOOP".to_vec()),
            buf.remove_line(1024).unwrap()
        );
        assert_eq!(None, buf.remove_line(1024).unwrap());
        buf.append(b"OUT\r\n");
        assert_eq!(
            Some(b"a2 LOGOUT".to_vec()),
            buf.remove_line(1024).unwrap()
        );
    }

    #[test]
    fn bare_lf_accepted() {
        let mut buf = NetBuffer::new();
        buf.append(b"QUIT\n");
        assert_eq!(Some(b"QUIT".to_vec()), buf.remove_line(1024).unwrap());
    }

    #[test]
    fn overlong_line_rejected() {
        let mut buf = NetBuffer::new();
        buf.append(&[b'x'; 64]);
        assert_matches!(Err(Error::LineTooLong), buf.remove_line(64));
        // Buffer intact; the caller may still resynchronise.
        assert_eq!(64, buf.len());
        buf.append(b"\r\n");
        assert_matches!(Err(Error::LineTooLong), buf.remove_line(64));
        assert_matches!(Ok(Some(_)), buf.remove_line(128));
    }

    #[test]
    fn compaction_preserves_content() {
        let mut buf = NetBuffer::new();
        for _ in 0..1024 {
            buf.append(&[b'a'; 64]);
            buf.consume(32);
        }
        assert_eq!(1024 * 32, buf.len());
        assert!(buf.contents().iter().all(|&b| b == b'a'));
    }
}
