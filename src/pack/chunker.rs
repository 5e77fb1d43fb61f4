//! Fixed-size leaf chunker.
//!
//! Splits a range stream into `chunk_size` leaves; only the final chunk
//! may be short. Chunk boundaries never depend on content, so two packs
//! of the same bytes produce the same leaves and the same CIDs.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Default UnixFS leaf size (1 MiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 1_048_576;

pub struct Chunker<R> {
    reader: R,
    chunk_size: usize,
    offset: u64,
    eof: bool,
}

impl<R: AsyncRead + Unpin> Chunker<R> {
    pub fn new(reader: R, chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "chunk size must be positive");
        Self {
            reader,
            chunk_size,
            offset: 0,
            eof: false,
        }
    }

    /// Next chunk and its offset within the range, or `None` at EOF.
    pub async fn next_chunk(&mut self) -> std::io::Result<Option<(Bytes, u64)>> {
        if self.eof {
            return Ok(None);
        }

        let mut buf = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < self.chunk_size {
            let n = self.reader.read(&mut buf[filled..]).await?;
            if n == 0 {
                self.eof = true;
                break;
            }
            filled += n;
        }

        if filled == 0 {
            return Ok(None);
        }

        buf.truncate(filled);
        let offset = self.offset;
        self.offset += filled as u64;
        Ok(Some((Bytes::from(buf), offset)))
    }

    /// Total bytes produced so far.
    pub fn bytes_read(&self) -> u64 {
        self.offset
    }
}
