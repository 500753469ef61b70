// crates/verifetch-merkle/src/lib.rs

//! Merkle sidecars for chunked artifacts.
//!
//! - [`MerkleRef`]: immutable reference tree over an artifact's chunks,
//!   persisted as a `.mref` sidecar. Built once, shared by many readers.
//! - [`MerkleState`]: mutable per-consumer verification state pairing the
//!   reference hashes with a per-leaf validity bitset, persisted as a
//!   `.mrkl` sidecar with in-place bitset updates.
//! - [`create_merkle_file`]: produce an up-to-date `.mref` next to a local
//!   file, with `force` and `dry_run` switches.
//!
//! Every node hash is SHA-256; internal nodes hash the concatenation of
//! their children. Pad leaves between `leaf_count` and `cap_leaf` carry the
//! all-zero placeholder digest so builder and verifier always agree.

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

mod format;

pub mod create;
pub mod reference;
pub mod state;

pub use create::{create_merkle_file, CreateOptions, CreateOutcome};
pub use format::FORMAT_VERSION;
pub use reference::{BuildProgress, MerkleRef};
pub use state::MerkleState;

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use sha2::{Digest as _, Sha256};
use verifetch_core::Digest;

/// Reference sidecar path for a data file: `<path>.mref`.
#[must_use]
pub fn reference_sidecar_path(data_path: &Path) -> PathBuf {
    append_suffix(data_path, ".mref")
}

/// State sidecar path for a data file: `<path>.mrkl`.
#[must_use]
pub fn state_sidecar_path(data_path: &Path) -> PathBuf {
    append_suffix(data_path, ".mrkl")
}

fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os: OsString = path.as_os_str().to_owned();
    os.push(suffix);
    PathBuf::from(os)
}

/// SHA-256 of a byte slice.
pub(crate) fn sha256(bytes: &[u8]) -> Digest {
    let mut h = Sha256::new();
    h.update(bytes);
    h.finalize().into()
}

/// Internal-node hash: SHA-256 of `left ‖ right`.
pub(crate) fn parent_digest(left: &Digest, right: &Digest) -> Digest {
    let mut h = Sha256::new();
    h.update(left);
    h.update(right);
    h.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sidecar_paths_append_rather_than_replace() {
        let p = Path::new("/data/vectors.bin");
        assert_eq!(
            reference_sidecar_path(p),
            Path::new("/data/vectors.bin.mref")
        );
        assert_eq!(state_sidecar_path(p), Path::new("/data/vectors.bin.mrkl"));
    }
}
