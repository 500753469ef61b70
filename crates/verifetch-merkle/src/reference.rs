// crates/verifetch-merkle/src/reference.rs

//! Immutable Merkle reference tree (`.mref`).
//!
//! Built by scanning a complete local file once in chunk-sized windows, then
//! folding internal hashes bottom-up. Never mutated after construction; a
//! single [`MerkleRef`] may be shared by many readers.

use crate::{format, parent_digest, sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use verifetch_core::{Digest, MerkleError, Shape, PAD_DIGEST};

/// Observable progress of a reference build.
///
/// Cloneable and cheap; hand a clone to another thread to watch a build.
#[derive(Clone, Debug, Default)]
pub struct BuildProgress {
    inner: Arc<ProgressInner>,
}

#[derive(Debug, Default)]
struct ProgressInner {
    hashed: AtomicU64,
    total: AtomicU64,
}

impl BuildProgress {
    /// Fresh handle with no work recorded yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Leaves hashed so far.
    #[must_use]
    pub fn leaves_hashed(&self) -> u64 {
        self.inner.hashed.load(Ordering::Relaxed)
    }

    /// Total leaves the build will hash (0 until the build starts).
    #[must_use]
    pub fn total_leaves(&self) -> u64 {
        self.inner.total.load(Ordering::Relaxed)
    }

    fn start(&self, total: u64) {
        self.inner.total.store(total, Ordering::Relaxed);
        self.inner.hashed.store(0, Ordering::Relaxed);
    }

    fn bump(&self) {
        self.inner.hashed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Immutable reference tree: shape plus all node hashes, heap-ordered with
/// the root at index 0.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MerkleRef {
    shape: Shape,
    hashes: Vec<Digest>,
}

impl MerkleRef {
    /// Build a reference tree by hashing `path` in `chunk_size` windows.
    ///
    /// # Errors
    ///
    /// [`MerkleError::Io`] on read failure, [`MerkleError::EmptyContent`] /
    /// [`MerkleError::InvalidChunkSize`] on degenerate geometry.
    pub fn build(path: &Path, chunk_size: u64) -> Result<Self, MerkleError> {
        Self::build_with_progress(path, chunk_size, &BuildProgress::new())
    }

    /// [`MerkleRef::build`] reporting per-leaf progress through `progress`.
    pub fn build_with_progress(
        path: &Path,
        chunk_size: u64,
        progress: &BuildProgress,
    ) -> Result<Self, MerkleError> {
        let content_length = std::fs::metadata(path)?.len();
        let shape = Shape::new(content_length, chunk_size)?;
        progress.start(shape.leaf_count());
        info!(
            path = %path.display(),
            content_length,
            chunk_size,
            leaves = shape.leaf_count(),
            "building merkle reference"
        );

        let node_count = usize::try_from(shape.node_count())
            .map_err(|_| MerkleError::ShapeMismatch("node count exceeds address space".into()))?;
        let first_leaf = usize::try_from(shape.offset_to_first_leaf()).unwrap_or(usize::MAX);
        let mut hashes = vec![PAD_DIGEST; node_count];

        let file = File::open(path)?;
        let mut reader = BufReader::with_capacity(1 << 20, file);
        let window_len = usize::try_from(chunk_size.min(content_length))
            .map_err(|_| MerkleError::ShapeMismatch("chunk size exceeds address space".into()))?;
        let mut window = vec![0u8; window_len];
        for leaf in 0..shape.leaf_count() {
            let len = usize::try_from(shape.leaf_len(leaf)?).unwrap_or(usize::MAX);
            let buf = &mut window[..len];
            reader.read_exact(buf)?;
            hashes[first_leaf + usize::try_from(leaf).unwrap_or(usize::MAX)] = sha256(buf);
            progress.bump();
        }

        fold_internal(&shape, &mut hashes);
        debug!(root = %hex::encode(hashes[0]), "reference build complete");
        Ok(Self { shape, hashes })
    }

    /// Load a reference from its `.mref` sidecar.
    ///
    /// # Errors
    ///
    /// [`MerkleError::CorruptSidecar`], [`MerkleError::UnsupportedVersion`],
    /// or [`MerkleError::Io`].
    pub fn load(sidecar_path: &Path) -> Result<Self, MerkleError> {
        let parsed = format::read_sidecar(sidecar_path, format::MAGIC_REF)?;
        Ok(Self {
            shape: parsed.shape,
            hashes: parsed.hashes,
        })
    }

    /// Persist as a `.mref` sidecar (atomic: temp file + rename).
    ///
    /// # Errors
    ///
    /// [`MerkleError::Io`] on write failure.
    pub fn save(&self, sidecar_path: &Path) -> Result<(), MerkleError> {
        format::write_sidecar(
            sidecar_path,
            format::MAGIC_REF,
            &self.shape,
            &self.hashes,
            &[],
        )
    }

    /// Tree geometry.
    #[inline]
    #[must_use]
    pub const fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Root hash (uniquely identifies the artifact content).
    #[inline]
    #[must_use]
    pub fn root_hash(&self) -> &Digest {
        &self.hashes[0]
    }

    /// Hash of real leaf `i`.
    ///
    /// # Errors
    ///
    /// [`MerkleError::OutOfRange`] when `i >= leaf_count`.
    pub fn leaf_hash(&self, leaf: u64) -> Result<&Digest, MerkleError> {
        if leaf >= self.shape.leaf_count() {
            return Err(MerkleError::out_of_range(
                "leaf",
                leaf,
                self.shape.leaf_count(),
            ));
        }
        let idx = usize::try_from(self.shape.node_for_leaf(leaf)).unwrap_or(usize::MAX);
        Ok(&self.hashes[idx])
    }

    /// Hash of an arbitrary heap node (root = 0, pad leaves included).
    ///
    /// # Errors
    ///
    /// [`MerkleError::OutOfRange`] when `node >= node_count`.
    pub fn node_hash(&self, node: u64) -> Result<&Digest, MerkleError> {
        if node >= self.shape.node_count() {
            return Err(MerkleError::out_of_range(
                "node",
                node,
                self.shape.node_count(),
            ));
        }
        Ok(&self.hashes[usize::try_from(node).unwrap_or(usize::MAX)])
    }

    /// Re-hash a local file chunk by chunk against this reference.
    ///
    /// Stops at the first disagreeing leaf.
    ///
    /// # Errors
    ///
    /// [`MerkleError::ShapeMismatch`] when the file length disagrees with
    /// the reference, [`MerkleError::ChecksumFailed`] carrying the first
    /// mismatching leaf with both digests, [`MerkleError::Io`] on read
    /// failure.
    pub fn verify_file(&self, path: &Path) -> Result<(), MerkleError> {
        let actual_len = std::fs::metadata(path)?.len();
        if actual_len != self.shape.content_length() {
            return Err(MerkleError::ShapeMismatch(format!(
                "{} is {actual_len} bytes but reference records {}",
                path.display(),
                self.shape.content_length()
            )));
        }

        let file = File::open(path)?;
        let mut reader = BufReader::with_capacity(1 << 20, file);
        let window_len = usize::try_from(self.shape.chunk_size().min(actual_len))
            .map_err(|_| MerkleError::ShapeMismatch("chunk size exceeds address space".into()))?;
        let mut window = vec![0u8; window_len];
        for leaf in 0..self.shape.leaf_count() {
            let len = usize::try_from(self.shape.leaf_len(leaf)?).unwrap_or(usize::MAX);
            let buf = &mut window[..len];
            reader.read_exact(buf)?;
            let observed = sha256(buf);
            let expected = self.leaf_hash(leaf)?;
            if &observed != expected {
                return Err(MerkleError::ChecksumFailed {
                    leaf,
                    expected: *expected,
                    observed,
                });
            }
        }
        Ok(())
    }

    /// Full heap-ordered hash array (for the paired state).
    pub(crate) fn hashes(&self) -> &[Digest] {
        &self.hashes
    }
}

/// Fold internal nodes bottom-up: `h[i] = SHA-256(h[2i+1] ‖ h[2i+2])`.
fn fold_internal(shape: &Shape, hashes: &mut [Digest]) {
    for i in (0..usize::try_from(shape.internal_node_count()).unwrap_or(0)).rev() {
        hashes[i] = parent_digest(&hashes[2 * i + 1], &hashes[2 * i + 2]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// Patterned fixture: byte k = k mod 256.
    fn patterned_file(dir: &Path, len: usize) -> std::path::PathBuf {
        let path = dir.join("artifact.bin");
        let mut f = File::create(&path).unwrap();
        let data: Vec<u8> = (0..len).map(|k| (k % 256) as u8).collect();
        f.write_all(&data).unwrap();
        path
    }

    #[test]
    fn single_chunk_root_equals_leaf_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = patterned_file(dir.path(), 4096);
        let r = MerkleRef::build(&path, 4096).unwrap();
        assert_eq!(r.shape().node_count(), 1);
        assert_eq!(r.root_hash(), r.leaf_hash(0).unwrap());
    }

    #[test]
    fn fold_matches_independent_recomputation() {
        let dir = tempfile::tempdir().unwrap();
        let path = patterned_file(dir.path(), 1000);
        let r = MerkleRef::build(&path, 256).unwrap(); // 4 leaves

        let l: Vec<Digest> = (0..4).map(|i| *r.leaf_hash(i).unwrap()).collect();
        let n1 = parent_digest(&l[0], &l[1]);
        let n2 = parent_digest(&l[2], &l[3]);
        assert_eq!(r.node_hash(1).unwrap(), &n1);
        assert_eq!(r.node_hash(2).unwrap(), &n2);
        assert_eq!(r.root_hash(), &parent_digest(&n1, &n2));
    }

    #[test]
    fn pad_leaves_use_the_placeholder_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = patterned_file(dir.path(), 3 * 128);
        let r = MerkleRef::build(&path, 128).unwrap(); // 3 leaves, cap 4
        assert_eq!(r.shape().cap_leaf(), 4);
        // Pad slot sits at heap index first_leaf + 3.
        let pad = r.node_hash(r.shape().offset_to_first_leaf() + 3).unwrap();
        assert_eq!(pad, &PAD_DIGEST);
        assert!(r.leaf_hash(3).is_err());
    }

    #[test]
    fn two_builds_agree() {
        let dir = tempfile::tempdir().unwrap();
        let path = patterned_file(dir.path(), 10_000);
        let a = MerkleRef::build(&path, 1024).unwrap();
        let b = MerkleRef::build(&path, 1024).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn progress_reports_leaf_counts() {
        let dir = tempfile::tempdir().unwrap();
        let path = patterned_file(dir.path(), 1024);
        let progress = BuildProgress::new();
        let _ = MerkleRef::build_with_progress(&path, 256, &progress).unwrap();
        assert_eq!(progress.total_leaves(), 4);
        assert_eq!(progress.leaves_hashed(), 4);
    }

    #[test]
    fn sidecar_roundtrip_is_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = patterned_file(dir.path(), 5000);
        let built = MerkleRef::build(&path, 512).unwrap();
        let sidecar = dir.path().join("artifact.bin.mref");
        built.save(&sidecar).unwrap();
        let loaded = MerkleRef::load(&sidecar).unwrap();
        assert_eq!(built, loaded);
    }

    #[test]
    fn verify_file_accepts_matching_and_pinpoints_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = patterned_file(dir.path(), 1000);
        let r = MerkleRef::build(&path, 256).unwrap();
        r.verify_file(&path).unwrap();

        // Corrupt one byte in chunk 2.
        let mut data = std::fs::read(&path).unwrap();
        data[600] ^= 0xFF;
        std::fs::write(&path, &data).unwrap();
        match r.verify_file(&path) {
            Err(MerkleError::ChecksumFailed { leaf: 2, .. }) => {}
            other => panic!("expected leaf-2 checksum failure, got {other:?}"),
        }
    }

    #[test]
    fn empty_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.bin");
        File::create(&path).unwrap();
        assert!(matches!(
            MerkleRef::build(&path, 1024),
            Err(MerkleError::EmptyContent)
        ));
    }
}
