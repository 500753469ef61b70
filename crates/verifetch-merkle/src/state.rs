// crates/verifetch-merkle/src/state.rs

//! Mutable verification state (`.mrkl`).
//!
//! A [`MerkleState`] pairs the reference hash array with a per-leaf validity
//! bitset for one local copy of the artifact. Bits only ever flip 0 → 1, and
//! a bit is flipped only after the candidate bytes hashed equal to the
//! reference leaf hash *and* the acceptance callback has written them.
//!
//! Ordering contract of [`MerkleState::save_if_valid`]:
//! data-file write (callback) happens-before the in-memory bit flip
//! happens-before the state-file word write. A crash can therefore leave
//! `data present ∧ bit unset` (safe: re-verification re-accepts) but never
//! `bit set ∧ data absent`.

use crate::{format, sha256, MerkleRef};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{debug, trace};
use verifetch_core::{Digest, MerkleError, Shape};

const BITS_PER_WORD: u64 = 64;
const WORD_BYTES: u64 = 8;

/// Mutable per-consumer verification state over a chunked artifact.
#[derive(Debug)]
pub struct MerkleState {
    shape: Shape,
    hashes: Vec<Digest>,
    words: Vec<AtomicU64>,
    valid: AtomicU64,
    /// `.mrkl` handle for in-place bitset word writes; the mutex also
    /// serializes word reads against concurrent flips so a later writer
    /// always persists a superset of earlier bits.
    io: Mutex<File>,
    bitset_offset: u64,
    bitset_len: u64,
}

impl MerkleState {
    /// Create a fresh state from a reference: same shape, same hashes, all
    /// bits zero. Writes the `.mrkl` sidecar; does not touch the data file.
    ///
    /// # Errors
    ///
    /// [`MerkleError::Io`] on write failure.
    pub fn from_ref(reference: &MerkleRef, state_path: &Path) -> Result<Self, MerkleError> {
        let shape = *reference.shape();
        let bitset = vec![0u8; format::bitset_len_bytes(shape.leaf_count())];
        format::write_sidecar(
            state_path,
            format::MAGIC_STATE,
            &shape,
            reference.hashes(),
            &bitset,
        )?;
        debug!(path = %state_path.display(), leaves = shape.leaf_count(), "created state sidecar");
        Self::assemble(shape, reference.hashes().to_vec(), &bitset, state_path)
    }

    /// Load an existing `.mrkl` sidecar.
    ///
    /// # Errors
    ///
    /// [`MerkleError::CorruptSidecar`], [`MerkleError::UnsupportedVersion`],
    /// or [`MerkleError::Io`].
    pub fn load(state_path: &Path) -> Result<Self, MerkleError> {
        let parsed = format::read_sidecar(state_path, format::MAGIC_STATE)?;
        Self::assemble(parsed.shape, parsed.hashes, &parsed.bitset, state_path)
    }

    fn assemble(
        shape: Shape,
        hashes: Vec<Digest>,
        bitset: &[u8],
        state_path: &Path,
    ) -> Result<Self, MerkleError> {
        let word_count = usize::try_from(shape.leaf_count().div_ceil(BITS_PER_WORD))
            .map_err(|_| MerkleError::ShapeMismatch("leaf count exceeds address space".into()))?;
        let words: Vec<AtomicU64> = (0..word_count).map(|_| AtomicU64::new(0)).collect();
        for (i, byte) in bitset.iter().enumerate() {
            let word = &words[i / 8];
            word.fetch_or(u64::from(*byte) << ((i % 8) * 8), Ordering::Relaxed);
        }

        // Count only real leaf bits; tail bits past leaf_count are ignored.
        let mut valid = 0u64;
        for leaf in 0..shape.leaf_count() {
            let w = usize::try_from(leaf / BITS_PER_WORD).unwrap_or(usize::MAX);
            if words[w].load(Ordering::Relaxed) & (1u64 << (leaf % BITS_PER_WORD)) != 0 {
                valid += 1;
            }
        }

        let file = OpenOptions::new().read(true).write(true).open(state_path)?;
        Ok(Self {
            shape,
            hashes,
            words,
            valid: AtomicU64::new(valid),
            io: Mutex::new(file),
            bitset_offset: format::bitset_file_offset(&shape),
            bitset_len: shape.leaf_count().div_ceil(8),
        })
    }

    /// Tree geometry.
    #[inline]
    #[must_use]
    pub const fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Root hash copied from the paired reference.
    #[inline]
    #[must_use]
    pub fn root_hash(&self) -> &Digest {
        &self.hashes[0]
    }

    /// Whether leaf `i` has been verified against the reference.
    ///
    /// Out-of-range indices are simply not valid.
    #[must_use]
    pub fn is_valid(&self, leaf: u64) -> bool {
        if leaf >= self.shape.leaf_count() {
            return false;
        }
        let w = usize::try_from(leaf / BITS_PER_WORD).unwrap_or(usize::MAX);
        self.words[w].load(Ordering::Acquire) & (1u64 << (leaf % BITS_PER_WORD)) != 0
    }

    /// Number of verified leaves.
    #[must_use]
    pub fn valid_leaf_count(&self) -> u64 {
        self.valid.load(Ordering::Acquire)
    }

    /// Reference hash recorded for leaf `i`.
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

    /// Check that this state was derived from `reference`: same shape and a
    /// byte-identical hash array.
    ///
    /// # Errors
    ///
    /// [`MerkleError::ShapeMismatch`] on any disagreement.
    pub fn verify_against(&self, reference: &MerkleRef) -> Result<(), MerkleError> {
        if &self.shape != reference.shape() {
            return Err(MerkleError::ShapeMismatch(format!(
                "state is ({}, {}) but reference is ({}, {})",
                self.shape.content_length(),
                self.shape.chunk_size(),
                reference.shape().content_length(),
                reference.shape().chunk_size(),
            )));
        }
        if self.hashes != reference.hashes() {
            return Err(MerkleError::ShapeMismatch(
                "state hash array disagrees with reference".into(),
            ));
        }
        Ok(())
    }

    /// Verify `bytes` as the content of leaf `i` and, on success, accept
    /// them: invoke `on_accepted(bytes)` exactly once, flip the validity
    /// bit, and persist the containing bitset word.
    ///
    /// Returns `Ok(false)` on hash mismatch — nothing is invoked or
    /// persisted. Already-valid leaves return `Ok(true)` without invoking
    /// the callback again.
    ///
    /// # Errors
    ///
    /// [`MerkleError::OutOfRange`] for a bad leaf index,
    /// [`MerkleError::ShapeMismatch`] when `bytes` has the wrong length for
    /// the leaf, and [`MerkleError::Io`] from the callback or the state
    /// write.
    pub fn save_if_valid<F>(
        &self,
        leaf: u64,
        bytes: &[u8],
        on_accepted: F,
    ) -> Result<bool, MerkleError>
    where
        F: FnOnce(&[u8]) -> std::io::Result<()>,
    {
        let range = self.shape.range_for_leaf(leaf)?;
        let expected_len = usize::try_from(range.end - range.start).unwrap_or(usize::MAX);
        if bytes.len() != expected_len {
            return Err(MerkleError::ShapeMismatch(format!(
                "leaf {leaf} payload is {} bytes (leaf spans {expected_len})",
                bytes.len()
            )));
        }
        if self.is_valid(leaf) {
            return Ok(true);
        }

        let observed = sha256(bytes);
        let node = usize::try_from(self.shape.node_for_leaf(leaf)).unwrap_or(usize::MAX);
        if observed != self.hashes[node] {
            trace!(leaf, "candidate bytes rejected");
            return Ok(false);
        }

        // Bytes reach the data file before the bit exists anywhere.
        on_accepted(bytes)?;

        let w = usize::try_from(leaf / BITS_PER_WORD).unwrap_or(usize::MAX);
        let bit = 1u64 << (leaf % BITS_PER_WORD);
        let prev = self.words[w].fetch_or(bit, Ordering::AcqRel);
        if prev & bit == 0 {
            self.valid.fetch_add(1, Ordering::AcqRel);
            self.persist_word(w)?;
            trace!(leaf, "leaf verified");
        }
        Ok(true)
    }

    /// Write the current value of bitset word `w` to the sidecar, clipped to
    /// the bitset extent.
    fn persist_word(&self, w: usize) -> Result<(), MerkleError> {
        let mut file = self
            .io
            .lock()
            .map_err(|_| {
                MerkleError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "state file lock poisoned",
                ))
            })?;
        // Load under the lock so a later writer persists a superset of
        // earlier flips even when two leaves share a word.
        let value = self.words[w].load(Ordering::Acquire).to_le_bytes();
        let word_start = w as u64 * WORD_BYTES;
        let len = usize::try_from(WORD_BYTES.min(self.bitset_len - word_start))
            .unwrap_or(WORD_BYTES as usize);
        file.seek(SeekFrom::Start(self.bitset_offset + word_start))?;
        file.write_all(&value[..len])?;
        Ok(())
    }

    /// Force durability of the bitset region.
    ///
    /// # Errors
    ///
    /// [`MerkleError::Io`] on sync failure.
    pub fn flush(&self) -> Result<(), MerkleError> {
        let file = self
            .io
            .lock()
            .map_err(|_| {
                MerkleError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "state file lock poisoned",
                ))
            })?;
        file.sync_data()?;
        Ok(())
    }

    /// Flush and release the sidecar handle.
    ///
    /// # Errors
    ///
    /// [`MerkleError::Io`] on sync failure.
    pub fn close(self) -> Result<(), MerkleError> {
        self.flush()
    }
}
