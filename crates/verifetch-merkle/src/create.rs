// crates/verifetch-merkle/src/create.rs

//! `.mref` creation utility: build a reference sidecar next to a local file,
//! skipping work when the sidecar is already newer than its source.

use crate::{reference_sidecar_path, BuildProgress, MerkleRef};
use std::path::{Path, PathBuf};
use tracing::info;
use verifetch_core::{Digest, MerkleError};

/// Switches for [`create_merkle_file`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CreateOptions {
    /// Rebuild even when an up-to-date sidecar exists.
    pub force: bool,
    /// Report what would happen without writing anything.
    pub dry_run: bool,
}

/// What [`create_merkle_file`] did (or would do, under `dry_run`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    /// A sidecar was written.
    Created {
        /// Path of the new sidecar.
        sidecar: PathBuf,
        /// Root hash of the built reference.
        root: Digest,
    },
    /// The existing sidecar is at least as new as the source; nothing done.
    UpToDate {
        /// Path of the existing sidecar.
        sidecar: PathBuf,
    },
    /// Dry run: a sidecar would have been written.
    WouldCreate {
        /// Path the sidecar would occupy.
        sidecar: PathBuf,
    },
}

/// Build `<path>.mref` for a local file.
///
/// Skips the build when the sidecar exists and its mtime is at least the
/// source's, unless `force` is set. `dry_run` reports the decision without
/// touching the filesystem.
///
/// # Errors
///
/// [`MerkleError::Io`] on filesystem failures and the [`MerkleRef::build`]
/// error set for degenerate inputs.
pub fn create_merkle_file(
    path: &Path,
    chunk_size: u64,
    options: CreateOptions,
) -> Result<CreateOutcome, MerkleError> {
    create_merkle_file_with_progress(path, chunk_size, options, &BuildProgress::new())
}

/// [`create_merkle_file`] reporting per-leaf progress through `progress`.
pub fn create_merkle_file_with_progress(
    path: &Path,
    chunk_size: u64,
    options: CreateOptions,
    progress: &BuildProgress,
) -> Result<CreateOutcome, MerkleError> {
    let sidecar = reference_sidecar_path(path);

    if !options.force && is_up_to_date(path, &sidecar)? {
        info!(sidecar = %sidecar.display(), "reference sidecar up to date");
        return Ok(CreateOutcome::UpToDate { sidecar });
    }
    if options.dry_run {
        return Ok(CreateOutcome::WouldCreate { sidecar });
    }

    let reference = MerkleRef::build_with_progress(path, chunk_size, progress)?;
    reference.save(&sidecar)?;
    info!(
        sidecar = %sidecar.display(),
        root = %hex::encode(reference.root_hash()),
        "wrote reference sidecar"
    );
    Ok(CreateOutcome::Created {
        sidecar,
        root: *reference.root_hash(),
    })
}

/// Source mtime ≤ sidecar mtime, with a missing sidecar never up to date.
fn is_up_to_date(source: &Path, sidecar: &Path) -> Result<bool, MerkleError> {
    let sidecar_meta = match std::fs::metadata(sidecar) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    let source_meta = std::fs::metadata(source)?;
    match (source_meta.modified(), sidecar_meta.modified()) {
        (Ok(src), Ok(side)) => Ok(src <= side),
        // No mtime support: always rebuild.
        _ => Ok(false),
    }
}
