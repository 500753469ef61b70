// crates/verifetch-merkle/src/format.rs

//! Little-endian wire layout shared by the `.mref` and `.mrkl` sidecars.
//!
//! ```text
//! header  (40 B): magic[4], version u16, flags u16,
//!                 chunk_size u64, content_length u64,
//!                 leaf_count u64, node_count u64
//! hashes  : node_count × 32 B
//! bitset  : ceil(leaf_count / 8) B          (.mrkl only, bit i LSB-first)
//! footer  (34 B): structural_digest[32] = SHA-256(header ‖ hashes),
//!                 footer_length u16 (last field, locatable from EOF)
//! ```
//!
//! The bitset is excluded from the structural digest because it mutates in
//! place; everything else is immutable after creation.

use crate::sha256;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use verifetch_core::{Digest, MerkleError, Shape, DIGEST_LEN};

pub(crate) const MAGIC_REF: [u8; 4] = *b"MREF";
pub(crate) const MAGIC_STATE: [u8; 4] = *b"MRKL";

/// Sidecar format version read and written by this build.
pub const FORMAT_VERSION: u16 = 1;

pub(crate) const HEADER_LEN: usize = 40;
pub(crate) const FOOTER_LEN: usize = 34;

/// On-disk bitset length in bytes for `leaf_count` leaves.
pub(crate) fn bitset_len_bytes(leaf_count: u64) -> usize {
    usize::try_from(leaf_count.div_ceil(8)).unwrap_or(usize::MAX)
}

/// Byte offset of the bitset region within a `.mrkl` file.
pub(crate) fn bitset_file_offset(shape: &Shape) -> u64 {
    HEADER_LEN as u64 + shape.node_count() * DIGEST_LEN as u64
}

pub(crate) fn encode_header(magic: [u8; 4], shape: &Shape) -> [u8; HEADER_LEN] {
    let mut out = [0u8; HEADER_LEN];
    out[0..4].copy_from_slice(&magic);
    out[4..6].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
    // flags (reserved) stay zero
    out[8..16].copy_from_slice(&shape.chunk_size().to_le_bytes());
    out[16..24].copy_from_slice(&shape.content_length().to_le_bytes());
    out[24..32].copy_from_slice(&shape.leaf_count().to_le_bytes());
    out[32..40].copy_from_slice(&shape.node_count().to_le_bytes());
    out
}

fn le_u16(bytes: &[u8]) -> u16 {
    let mut b = [0u8; 2];
    b.copy_from_slice(bytes);
    u16::from_le_bytes(b)
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(bytes);
    u64::from_le_bytes(b)
}

fn corrupt(path: &Path, what: impl std::fmt::Display) -> MerkleError {
    MerkleError::CorruptSidecar(format!("{}: {what}", path.display()))
}

/// Fully-validated sidecar contents.
pub(crate) struct ParsedSidecar {
    pub shape: Shape,
    pub hashes: Vec<Digest>,
    /// Empty for `.mref`; `ceil(leaf_count / 8)` bytes for `.mrkl`.
    pub bitset: Vec<u8>,
}

/// Read and validate a sidecar: magic, version, footer digest, and layout
/// consistency against the shape recomputed from the header fields.
pub(crate) fn read_sidecar(path: &Path, magic: [u8; 4]) -> Result<ParsedSidecar, MerkleError> {
    let bytes = fs::read(path)?;
    if bytes.len() < HEADER_LEN + FOOTER_LEN {
        return Err(corrupt(path, "file shorter than header + footer"));
    }

    // The footer's final field is its own length, so it can be located from
    // EOF without trusting anything else first.
    let footer_len = le_u16(&bytes[bytes.len() - 2..]);
    if footer_len as usize != FOOTER_LEN {
        return Err(corrupt(path, format!("unrecognized footer length {footer_len}")));
    }

    if bytes[0..4] != magic {
        return Err(corrupt(
            path,
            format!(
                "bad magic {:?} (expected {:?})",
                &bytes[0..4],
                std::str::from_utf8(&magic).unwrap_or("?")
            ),
        ));
    }
    let version = le_u16(&bytes[4..6]);
    if version != FORMAT_VERSION {
        return Err(MerkleError::UnsupportedVersion {
            found: version,
            expected: FORMAT_VERSION,
        });
    }

    let chunk_size = le_u64(&bytes[8..16]);
    let content_length = le_u64(&bytes[16..24]);
    let leaf_count = le_u64(&bytes[24..32]);
    let node_count = le_u64(&bytes[32..40]);

    let shape = match Shape::new(content_length, chunk_size) {
        Ok(s) => s,
        Err(e) => return Err(corrupt(path, format!("bad geometry in header ({e})"))),
    };
    if leaf_count != shape.leaf_count() || node_count != shape.node_count() {
        return Err(corrupt(path, "header counts disagree with derived shape"));
    }

    let hashes_len = usize::try_from(node_count)
        .ok()
        .and_then(|n| n.checked_mul(DIGEST_LEN))
        .ok_or_else(|| corrupt(path, "node count overflows"))?;
    let bitset_len = if magic == MAGIC_STATE {
        bitset_len_bytes(leaf_count)
    } else {
        0
    };
    let expected_total = HEADER_LEN + hashes_len + bitset_len + FOOTER_LEN;
    if bytes.len() != expected_total {
        return Err(corrupt(
            path,
            format!("file is {} bytes, layout requires {expected_total}", bytes.len()),
        ));
    }

    let digest_start = bytes.len() - FOOTER_LEN;
    let recorded = &bytes[digest_start..digest_start + DIGEST_LEN];
    let computed = sha256(&bytes[..HEADER_LEN + hashes_len]);
    if recorded != computed.as_slice() {
        return Err(corrupt(path, "structural digest mismatch"));
    }

    let mut hashes = Vec::with_capacity(usize::try_from(node_count).unwrap_or(0));
    for node in bytes[HEADER_LEN..HEADER_LEN + hashes_len].chunks_exact(DIGEST_LEN) {
        let mut d = [0u8; DIGEST_LEN];
        d.copy_from_slice(node);
        hashes.push(d);
    }
    let bitset = bytes[HEADER_LEN + hashes_len..HEADER_LEN + hashes_len + bitset_len].to_vec();

    Ok(ParsedSidecar {
        shape,
        hashes,
        bitset,
    })
}

/// Write a complete sidecar atomically: temp file in the same directory,
/// flushed, then renamed over the destination.
pub(crate) fn write_sidecar(
    path: &Path,
    magic: [u8; 4],
    shape: &Shape,
    hashes: &[Digest],
    bitset: &[u8],
) -> Result<(), MerkleError> {
    debug_assert_eq!(hashes.len() as u64, shape.node_count());

    let header = encode_header(magic, shape);
    let mut body = Vec::with_capacity(hashes.len() * DIGEST_LEN);
    for h in hashes {
        body.extend_from_slice(h);
    }
    let digest = {
        let mut pre = Vec::with_capacity(HEADER_LEN + body.len());
        pre.extend_from_slice(&header);
        pre.extend_from_slice(&body);
        sha256(&pre)
    };

    let tmp = tmp_sibling(path);
    {
        let f = File::create(&tmp)?;
        let mut w = BufWriter::new(f);
        w.write_all(&header)?;
        w.write_all(&body)?;
        w.write_all(bitset)?;
        w.write_all(&digest)?;
        w.write_all(&(FOOTER_LEN as u16).to_le_bytes())?;
        w.flush()?;
        w.get_ref().sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn tmp_sibling(path: &Path) -> std::path::PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    std::path::PathBuf::from(os)
}
