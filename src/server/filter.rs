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

//! Byte-stream transformers applied between a socket and its buffers.
//!
//! Inbound filters run in order from the socket to the read buffer;
//! outbound filters run from the write buffer to the socket. The only
//! transformer implemented in-process is RFC 4978 DEFLATE; TLS is handled
//! by handing the socket pair to the external helper (see
//! `server::forwarder`), so it never appears in a filter chain.
//!
//! The deflate direction sync-flushes on every pass so that a short
//! response is never stranded inside the compressor while the client
//! waits for it.

use flate2::{
    Compress, Compression, Decompress, FlushCompress, FlushDecompress,
    Status,
};

use crate::support::error::Error;

pub trait Filter {
    /// Transforms `src`, appending output to `dst`.
    ///
    /// `src` is consumed completely in one call; filters buffer internally
    /// if the transformation cannot make progress.
    fn transform(&mut self, src: &[u8], dst: &mut Vec<u8>)
        -> Result<(), Error>;
}

/// The inbound half of COMPRESS=DEFLATE.
pub struct Inflater {
    stream: Decompress,
}

impl Inflater {
    pub fn new() -> Self {
        // false: raw deflate, no zlib header
        Inflater {
            stream: Decompress::new(false),
        }
    }
}

impl Filter for Inflater {
    fn transform(
        &mut self,
        src: &[u8],
        dst: &mut Vec<u8>,
    ) -> Result<(), Error> {
        let mut consumed = 0usize;
        let mut chunk = [0u8; 8192];
        while consumed < src.len() {
            let before_in = self.stream.total_in();
            let before_out = self.stream.total_out();
            let status = self
                .stream
                .decompress(
                    &src[consumed..],
                    &mut chunk,
                    FlushDecompress::Sync,
                )
                .map_err(|e| {
                    Error::ProtocolViolation(format!(
                        "bad deflate data: {}",
                        e
                    ))
                })?;

            consumed += (self.stream.total_in() - before_in) as usize;
            let produced = (self.stream.total_out() - before_out) as usize;
            dst.extend_from_slice(&chunk[..produced]);

            match status {
                Status::Ok | Status::BufError if 0 == produced => break,
                Status::StreamEnd => break,
                _ => (),
            }
        }

        Ok(())
    }
}

/// The outbound half of COMPRESS=DEFLATE.
pub struct Deflater {
    stream: Compress,
}

impl Deflater {
    pub fn new() -> Self {
        Deflater {
            stream: Compress::new(Compression::new(3), false),
        }
    }
}

impl Filter for Deflater {
    fn transform(
        &mut self,
        src: &[u8],
        dst: &mut Vec<u8>,
    ) -> Result<(), Error> {
        let mut consumed = 0usize;
        let mut chunk = [0u8; 8192];
        loop {
            let before_in = self.stream.total_in();
            let before_out = self.stream.total_out();
            let status = self
                .stream
                .compress(
                    &src[consumed..],
                    &mut chunk,
                    FlushCompress::Sync,
                )
                .map_err(|e| Error::Disaster(format!("deflate: {}", e)))?;

            consumed += (self.stream.total_in() - before_in) as usize;
            let produced = (self.stream.total_out() - before_out) as usize;
            dst.extend_from_slice(&chunk[..produced]);

            match status {
                Status::StreamEnd => break,
                _ if consumed >= src.len() && produced < chunk.len() => {
                    break
                },
                _ => (),
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn deflate_round_trip() {
        let mut deflater = Deflater::new();
        let mut inflater = Inflater::new();

        let mut compressed = Vec::new();
        deflater
            .transform(b"a4 NOOP\r\n", &mut compressed)
            .unwrap();
        assert!(!compressed.is_empty());

        let mut plain = Vec::new();
        inflater.transform(&compressed, &mut plain).unwrap();
        assert_eq!(b"a4 NOOP\r\n", &plain[..]);
    }

    #[test]
    fn sync_flush_keeps_interactivity() {
        // Each write must be decodable on its own, without waiting for
        // more compressed data.
        let mut deflater = Deflater::new();
        let mut inflater = Inflater::new();

        for i in 0..10 {
            let line = format!("a{} NOOP\r\n", i);
            let mut compressed = Vec::new();
            deflater.transform(line.as_bytes(), &mut compressed).unwrap();
            let mut plain = Vec::new();
            inflater.transform(&compressed, &mut plain).unwrap();
            assert_eq!(line.as_bytes(), &plain[..]);
        }
    }

    #[test]
    fn inflater_rejects_garbage() {
        let mut inflater = Inflater::new();
        let mut out = Vec::new();
        assert_matches!(
            Err(Error::ProtocolViolation(_)),
            inflater.transform(&[0xff, 0xfe, 0x01, 0x02], &mut out)
        );
    }
}
