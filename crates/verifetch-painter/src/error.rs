// crates/verifetch-painter/src/error.rs

//! Painter-side error kinds. Transport and protocol failures are retried by
//! the painter within a per-chunk budget; verification failures never are.

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use verifetch_core::MerkleError;

/// Errors surfaced by [`crate::Painter`] and [`crate::ChunkedReader`].
#[derive(Debug, Error)]
pub enum PaintError {
    /// Geometry, sidecar, or verification failure from the Merkle layer.
    #[error(transparent)]
    Merkle(#[from] MerkleError),

    /// HTTP transport failure (connect, timeout, status, body).
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered a ranged GET without honoring the range.
    #[error("server does not honor range requests: {0}")]
    RangeNotSupported(String),

    /// The remote speaks HTTP but violates the expected protocol surface
    /// (missing `Content-Length`, malformed `Content-Range`, odd status).
    #[error("remote protocol violation: {0}")]
    Protocol(String),

    /// The response body carried fewer bytes than the requested range.
    #[error("short body for leaf {leaf}: got {got} of {expected} bytes")]
    ShortBody {
        /// Leaf being fetched.
        leaf: u64,
        /// Bytes actually received.
        got: usize,
        /// Bytes the range spans.
        expected: usize,
    },

    /// Another painter already holds the state file for this artifact.
    #[error("state file already open: {}", .0.display())]
    AlreadyOpen(PathBuf),

    /// The per-chunk retry budget ran out of time.
    #[error("chunk {leaf} deadline exceeded")]
    DeadlineExceeded {
        /// Leaf whose deadline lapsed.
        leaf: u64,
    },

    /// The operation was cooperatively cancelled (painter closing, waiter
    /// dropped). Not a failure of the artifact or the network.
    #[error("fetch cancelled")]
    Cancelled,

    /// A coalesced chunk fetch failed; the original error is shared by
    /// every waiter that joined the fetch.
    #[error("chunk {leaf}: {cause}")]
    Chunk {
        /// Leaf whose fetch failed.
        leaf: u64,
        /// The underlying failure, shared across waiters.
        cause: Arc<PaintError>,
    },
}

impl PaintError {
    /// Whether the root cause is a per-leaf checksum mismatch (the CLI maps
    /// this to exit code 2).
    #[must_use]
    pub fn is_checksum_failure(&self) -> bool {
        match self {
            Self::Merkle(e) => e.is_checksum_failure(),
            Self::Chunk { cause, .. } => cause.is_checksum_failure(),
            _ => false,
        }
    }

    /// Whether the painter may retry this failure within the chunk budget.
    pub(crate) fn is_transient(&self) -> bool {
        match self {
            Self::Http(_) | Self::ShortBody { .. } | Self::Protocol(_) => true,
            Self::Merkle(MerkleError::Io(_)) => true,
            _ => false,
        }
    }
}
