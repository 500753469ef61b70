// crates/verifetch-core/src/error.rs

//! Error kinds shared by the shape, sidecar, and state layers.
//!
//! These are deliberately *kinds*, not a deep hierarchy: callers match on the
//! variant to decide retry-vs-surface, and every variant renders to a single
//! actionable line.

use crate::Digest;
use thiserror::Error;

/// Errors produced by shape derivation, sidecar I/O, and state transitions.
#[derive(Debug, Error)]
pub enum MerkleError {
    /// Filesystem failure while reading or writing an artifact or sidecar.
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    /// A sidecar file failed structural validation (magic, digest, layout).
    #[error("corrupt sidecar: {0}")]
    CorruptSidecar(String),

    /// A sidecar declares a format version this build does not understand.
    #[error("unsupported sidecar version {found} (expected {expected})")]
    UnsupportedVersion {
        /// Version found in the sidecar header.
        found: u16,
        /// Version this build reads and writes.
        expected: u16,
    },

    /// Chunk size was zero or not a power of two.
    #[error("invalid chunk size {0}: must be a positive power of two")]
    InvalidChunkSize(u64),

    /// Content length was zero; empty artifacts have no shape.
    #[error("content is empty; refusing to derive a shape")]
    EmptyContent,

    /// A leaf index or byte offset lies beyond the shape.
    #[error("{what} {value} out of range (limit {limit})")]
    OutOfRange {
        /// What kind of argument was out of range (`"leaf"`, `"offset"`, ...).
        what: &'static str,
        /// The offending value.
        value: u64,
        /// The exclusive upper bound it violated.
        limit: u64,
    },

    /// Two collaborators disagree on geometry (`.mref` vs `.mrkl`, or the
    /// remote content length vs the reference header).
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Bytes presented for a leaf do not hash to the reference value.
    ///
    /// The expected and observed digests ride along for verbose reporting.
    #[error("checksum mismatch for leaf {leaf}")]
    ChecksumFailed {
        /// Leaf index whose bytes were rejected.
        leaf: u64,
        /// Hash recorded in the reference tree.
        expected: Digest,
        /// Hash of the bytes actually observed.
        observed: Digest,
    },
}

impl MerkleError {
    /// Convenience constructor for [`MerkleError::OutOfRange`].
    #[must_use]
    pub const fn out_of_range(what: &'static str, value: u64, limit: u64) -> Self {
        Self::OutOfRange { what, value, limit }
    }

    /// Whether this error is a per-leaf verification failure.
    #[must_use]
    pub const fn is_checksum_failure(&self) -> bool {
        matches!(self, Self::ChecksumFailed { .. })
    }
}
