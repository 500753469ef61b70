// crates/verifetch-painter/src/reader.rs

//! Byte-addressable reads over a painter.
//!
//! `read` suspends until every covering chunk is verified, then copies from
//! the local sparse file, so a resolved read only ever returns bytes that
//! matched the reference hash at verification time.

use crate::{PaintError, Painter};

/// Thin read API over `(Painter, data file)`.
#[derive(Clone, Debug)]
pub struct ChunkedReader {
    painter: Painter,
}

impl ChunkedReader {
    /// Wrap an open painter.
    #[must_use]
    pub const fn new(painter: Painter) -> Self {
        Self { painter }
    }

    /// Artifact length in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.painter.shape().content_length()
    }

    /// The underlying painter.
    #[must_use]
    pub const fn painter(&self) -> &Painter {
        &self.painter
    }

    /// Fill `buf` from `offset`, fetching and verifying any missing chunks
    /// first. Reads past EOF clip; a read at or beyond EOF returns 0.
    ///
    /// # Errors
    ///
    /// Any chunk-fetch failure for the covering leaves.
    pub async fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize, PaintError> {
        let content_length = self.size();
        if buf.is_empty() || offset >= content_length {
            return Ok(0);
        }
        let n = usize::try_from((buf.len() as u64).min(content_length - offset))
            .unwrap_or(buf.len());

        self.painter.ensure_range(offset, n as u64).await?;
        let bytes = self.painter.read_local(offset, n).await?;
        buf[..n].copy_from_slice(&bytes);
        Ok(n)
    }

    /// Fetch and verify `[offset, offset + len)` ahead of future reads.
    ///
    /// # Errors
    ///
    /// Any chunk-fetch failure for the covering leaves.
    pub async fn prebuffer(&self, offset: u64, len: u64) -> Result<(), PaintError> {
        self.painter.ensure_range(offset, len).await
    }

    /// Flush verification state and close the painter.
    ///
    /// # Errors
    ///
    /// [`PaintError::Merkle`] on a failed flush.
    pub async fn close(&self) -> Result<(), PaintError> {
        self.painter.close().await
    }
}
