// crates/verifetch-core/src/lib.rs

//! Core geometry and error taxonomy for verifetch.
//!
//! - [`Shape`]: pure tree geometry derived from `(content_length, chunk_size)`
//!   — leaf/byte-range maps and heap-style node index algebra. No I/O.
//! - [`MerkleError`]: the error kinds shared across the workspace.
//! - [`Digest`]: 32-byte SHA-256 output used for every tree node.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(
    missing_docs,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::unwrap_used,
    clippy::expect_used
)]

pub mod error;
pub mod shape;

pub use error::MerkleError;
pub use shape::Shape;

/// 32-byte node hash (SHA-256 output).
pub type Digest = [u8; 32];

/// Length of a [`Digest`] in bytes.
pub const DIGEST_LEN: usize = 32;

/// Placeholder digest for pad leaves in `[leaf_count, cap_leaf)`.
///
/// Builder and verifier must agree on this value; it is part of the sidecar
/// format contract.
pub const PAD_DIGEST: Digest = [0u8; 32];
