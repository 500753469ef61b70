// crates/verifetch-painter/src/painter.rs

//! The painter: converts "please have chunk *i*" into verified local bytes.
//!
//! Coalescing: the in-flight map holds a *weak* handle to each chunk's
//! shared fetch future. Waiters hold the strong handles, so when the last
//! waiter drops, the fetch is cancelled; while any waiter remains, the fetch
//! keeps running and every waiter observes the same outcome. A validity bit,
//! once flipped, is never rolled back.

use crate::fs_util::DataFile;
use crate::http::RangeClient;
use crate::{PaintError, PainterOptions};
use futures::future::{BoxFuture, Shared, WeakShared};
use futures::FutureExt;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Semaphore;
use tokio::task;
use tracing::{debug, info, warn};
use verifetch_core::{MerkleError, Shape};
use verifetch_merkle::{reference_sidecar_path, state_sidecar_path, MerkleRef, MerkleState};

type SharedFetch = Shared<BoxFuture<'static, Result<(), Arc<PaintError>>>>;
type WeakFetch = WeakShared<BoxFuture<'static, Result<(), Arc<PaintError>>>>;

/// On-demand fetcher for one `(local data path, remote url)` pair.
///
/// Cheap to clone; clones share the same state, data file, and in-flight
/// map. At most one painter may hold a given state file at a time.
#[derive(Clone, Debug)]
pub struct Painter {
    inner: Arc<PainterInner>,
}

struct PainterInner {
    shape: Shape,
    reference: MerkleRef,
    state: Arc<MerkleState>,
    data: Arc<DataFile>,
    client: RangeClient,
    url: String,
    opts: PainterOptions,
    in_flight: Mutex<HashMap<u64, WeakFetch>>,
    permits: Arc<Semaphore>,
    closed: AtomicBool,
    /// Exclusive advisory lock on the `.mrkl`; held for the painter's life.
    _state_lock: std::fs::File,
}

impl std::fmt::Debug for PainterInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PainterInner")
            .field("url", &self.url)
            .field("shape", &self.shape)
            .finish_non_exhaustive()
    }
}

impl Painter {
    /// Open a painter over `data_path` backed by `remote_url`.
    ///
    /// Bootstraps the sidecars: a missing `.mref` is fetched from
    /// `<remote_url>.mref` and persisted; a missing `.mrkl` is created from
    /// the reference; an existing one must match the reference's shape and
    /// hashes. The data file is created or resized (sparse) to the content
    /// length, and the remote's `Content-Length` must agree with the
    /// reference.
    ///
    /// # Errors
    ///
    /// [`PaintError::AlreadyOpen`] when another painter holds the state
    /// file; the sidecar, shape, and transport error sets otherwise.
    pub async fn open(
        data_path: impl Into<PathBuf>,
        remote_url: impl Into<String>,
        opts: PainterOptions,
    ) -> Result<Self, PaintError> {
        let data_path = data_path.into();
        let url = remote_url.into();
        let client = RangeClient::new(&opts)?;

        let mref_path = reference_sidecar_path(&data_path);
        if !mref_path.exists() {
            let sidecar_url = format!("{url}.mref");
            let bytes = client.fetch_sidecar(&sidecar_url).await?;
            let target = mref_path.clone();
            run_blocking(move || persist_bytes_atomically(&target, &bytes)).await??;
            info!(path = %mref_path.display(), "fetched reference sidecar from remote");
        }

        let mrkl_path = state_sidecar_path(&data_path);
        let data_path_for_open = data_path.clone();
        let (reference, state, data, state_lock) = run_blocking(move || {
            let reference = MerkleRef::load(&mref_path)?;
            let state = if mrkl_path.exists() {
                let st = MerkleState::load(&mrkl_path)?;
                st.verify_against(&reference)?;
                st
            } else {
                MerkleState::from_ref(&reference, &mrkl_path)?
            };
            let state_lock = acquire_state_lock(&mrkl_path)?;
            let data = DataFile::open_rw(
                &data_path_for_open,
                reference.shape().content_length(),
            )
            .map_err(MerkleError::from)?;
            Ok::<_, PaintError>((reference, state, data, state_lock))
        })
        .await??;

        let remote_len = client.content_length(&url).await?;
        if remote_len != reference.shape().content_length() {
            return Err(MerkleError::ShapeMismatch(format!(
                "remote {url} is {remote_len} bytes but reference records {}",
                reference.shape().content_length()
            ))
            .into());
        }

        info!(
            url = %url,
            data = %data_path.display(),
            leaves = reference.shape().leaf_count(),
            valid = state.valid_leaf_count(),
            "painter open"
        );
        let shape = *reference.shape();
        let max_in_flight = opts.max_in_flight.max(1);
        Ok(Self {
            inner: Arc::new(PainterInner {
                shape,
                reference,
                state: Arc::new(state),
                data: Arc::new(data),
                client,
                url,
                opts,
                in_flight: Mutex::new(HashMap::new()),
                permits: Arc::new(Semaphore::new(max_in_flight)),
                closed: AtomicBool::new(false),
                _state_lock: state_lock,
            }),
        })
    }

    /// Tree geometry of the artifact.
    #[must_use]
    pub fn shape(&self) -> &Shape {
        &self.inner.shape
    }

    /// The loaded Merkle reference.
    #[must_use]
    pub fn reference(&self) -> &MerkleRef {
        &self.inner.reference
    }

    /// Whether leaf `i` is verified locally.
    #[must_use]
    pub fn is_valid(&self, leaf: u64) -> bool {
        self.inner.state.is_valid(leaf)
    }

    /// Number of verified leaves.
    #[must_use]
    pub fn valid_leaf_count(&self) -> u64 {
        self.inner.state.valid_leaf_count()
    }

    /// Ensure leaf `i` is fetched, verified, and persisted locally.
    ///
    /// Concurrent calls for the same leaf share one fetch. Dropping the
    /// returned future abandons this waiter; the fetch itself is cancelled
    /// only when no other waiter remains.
    ///
    /// # Errors
    ///
    /// [`PaintError::Chunk`] wrapping the shared failure, or the out-of-range
    /// / cancelled sets for bad input and a closing painter.
    pub async fn ensure_chunk(&self, leaf: u64) -> Result<(), PaintError> {
        if leaf >= self.inner.shape.leaf_count() {
            return Err(
                MerkleError::out_of_range("leaf", leaf, self.inner.shape.leaf_count()).into(),
            );
        }
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(PaintError::Cancelled);
        }
        if self.inner.state.is_valid(leaf) {
            return Ok(());
        }
        let fetch = self.join_or_start(leaf);
        fetch.await.map_err(|cause| PaintError::Chunk { leaf, cause })
    }

    /// Ensure every chunk covering `[offset, offset + len)`, in parallel
    /// bounded by `max_in_flight`.
    ///
    /// # Errors
    ///
    /// The first chunk failure; remaining waiters are abandoned.
    pub async fn ensure_range(&self, offset: u64, len: u64) -> Result<(), PaintError> {
        let leaves = self.inner.shape.leaves_for_range(offset, len);
        futures::future::try_join_all(leaves.map(|leaf| self.ensure_chunk(leaf)))
            .await
            .map(|_| ())
    }

    /// Flush verification state and refuse new work. In-flight fetches held
    /// by other waiters run to completion; resources release when the last
    /// clone drops.
    ///
    /// # Errors
    ///
    /// [`PaintError::Merkle`] on a failed state or data flush.
    pub async fn close(&self) -> Result<(), PaintError> {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.permits.close();
        let state = Arc::clone(&self.inner.state);
        let data = Arc::clone(&self.inner.data);
        run_blocking(move || {
            state.flush()?;
            data.sync().map_err(MerkleError::from)?;
            Ok::<_, PaintError>(())
        })
        .await??;
        debug!(url = %self.inner.url, "painter closed");
        Ok(())
    }

    /// Read verified bytes from the local data file. Callers must have
    /// ensured the covering chunks first.
    pub(crate) async fn read_local(&self, offset: u64, len: usize) -> Result<Vec<u8>, PaintError> {
        let data = Arc::clone(&self.inner.data);
        let bytes = run_blocking(move || data.read_at(offset, len).map_err(MerkleError::from))
            .await??;
        Ok(bytes)
    }

    /// Join the in-flight fetch for `leaf`, or start one.
    fn join_or_start(&self, leaf: u64) -> SharedFetch {
        let mut map = self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(weak) = map.get(&leaf) {
            if let Some(strong) = weak.upgrade() {
                return strong;
            }
        }
        let fetch = fetch_chunk(Arc::clone(&self.inner), leaf).boxed().shared();
        if let Some(weak) = fetch.downgrade() {
            map.insert(leaf, weak);
        }
        fetch
    }
}

/// Drive one chunk to verified-on-disk, then clear its in-flight slot.
async fn fetch_chunk(inner: Arc<PainterInner>, leaf: u64) -> Result<(), Arc<PaintError>> {
    let result = fetch_chunk_inner(&inner, leaf).await;
    inner
        .in_flight
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&leaf);
    result.map_err(Arc::new)
}

async fn fetch_chunk_inner(inner: &Arc<PainterInner>, leaf: u64) -> Result<(), PaintError> {
    let _permit = Arc::clone(&inner.permits)
        .acquire_owned()
        .await
        .map_err(|_| PaintError::Cancelled)?;
    if inner.state.is_valid(leaf) {
        return Ok(());
    }

    let range = inner.shape.range_for_leaf(leaf)?;
    let deadline = inner.opts.chunk_deadline;
    let work = retry_loop(inner, leaf, &range);
    match tokio::time::timeout(deadline, work).await {
        Ok(result) => result,
        Err(_) => {
            warn!(leaf, ?deadline, "chunk deadline exceeded");
            Err(PaintError::DeadlineExceeded { leaf })
        }
    }
}

/// Bounded exponential backoff around single fetch attempts. The budget is
/// per chunk: `retry_limit` retries regardless of how each attempt failed.
async fn retry_loop(
    inner: &Arc<PainterInner>,
    leaf: u64,
    range: &Range<u64>,
) -> Result<(), PaintError> {
    let mut backoff = inner.opts.initial_backoff;
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match attempt_fetch(inner, leaf, range).await {
            Ok(()) => return Ok(()),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) => {
                if attempt > inner.opts.retry_limit {
                    warn!(leaf, attempts = attempt, error = %e, "chunk retries exhausted");
                    return Err(e);
                }
                debug!(leaf, attempt, error = %e, "transient failure; backing off");
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            }
        }
    }
}

/// One fetch attempt: ranged GET (with a single bounded full-GET fallback),
/// then hash-verify and persist via the state's acceptance callback.
async fn attempt_fetch(
    inner: &Arc<PainterInner>,
    leaf: u64,
    range: &Range<u64>,
) -> Result<(), PaintError> {
    let expected_len = usize::try_from(range.end - range.start).unwrap_or(usize::MAX);
    let body = match inner
        .client
        .fetch_range(&inner.url, range.start, range.end - 1)
        .await
    {
        Ok(body) => body,
        Err(PaintError::RangeNotSupported(why)) => {
            debug!(leaf, %why, "retrying as bounded full GET");
            inner
                .client
                .fetch_range_via_full_get(&inner.url, range.start, expected_len)
                .await?
        }
        Err(e) => return Err(e),
    };
    if body.len() != expected_len {
        return Err(PaintError::ShortBody {
            leaf,
            got: body.len(),
            expected: expected_len,
        });
    }

    // Verification and the data-file write stay off the async runtime. The
    // acceptance callback runs before the validity bit flips.
    let state = Arc::clone(&inner.state);
    let data = Arc::clone(&inner.data);
    let expected_digest = *inner.reference.leaf_hash(leaf)?;
    let offset = range.start;
    let accepted = run_blocking(move || {
        let accepted = state.save_if_valid(leaf, &body, |bytes| data.write_at(bytes, offset))?;
        if accepted {
            Ok::<_, MerkleError>(None)
        } else {
            Ok(Some(sha256(&body)))
        }
    })
    .await??;

    match accepted {
        None => {
            debug!(leaf, "chunk verified and persisted");
            Ok(())
        }
        Some(observed) => Err(MerkleError::ChecksumFailed {
            leaf,
            expected: expected_digest,
            observed,
        }
        .into()),
    }
}

fn sha256(bytes: &[u8]) -> verifetch_core::Digest {
    use sha2::{Digest as _, Sha256};
    let mut h = Sha256::new();
    h.update(bytes);
    h.finalize().into()
}

/// `spawn_blocking` with join errors folded into [`PaintError`].
async fn run_blocking<T, F>(f: F) -> Result<T, PaintError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    task::spawn_blocking(f).await.map_err(|e| {
        if e.is_cancelled() {
            PaintError::Cancelled
        } else {
            PaintError::Merkle(MerkleError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("blocking task failed: {e}"),
            )))
        }
    })
}

/// Take the exclusive advisory lock that enforces one painter per state.
fn acquire_state_lock(mrkl_path: &Path) -> Result<std::fs::File, PaintError> {
    use fs2::FileExt;
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(mrkl_path)
        .map_err(MerkleError::from)?;
    file.try_lock_exclusive().map_err(|e| {
        if e.kind() == io::ErrorKind::WouldBlock {
            PaintError::AlreadyOpen(mrkl_path.to_path_buf())
        } else {
            PaintError::Merkle(MerkleError::Io(e))
        }
    })?;
    Ok(file)
}

/// Write `bytes` to `path` atomically (temp sibling + rename).
fn persist_bytes_atomically(path: &Path, bytes: &[u8]) -> Result<(), PaintError> {
    use std::io::Write;
    let mut tmp_os = path.as_os_str().to_owned();
    tmp_os.push(".tmp");
    let tmp = PathBuf::from(tmp_os);
    {
        let mut f = std::fs::File::create(&tmp).map_err(MerkleError::from)?;
        f.write_all(bytes).map_err(MerkleError::from)?;
        f.sync_all().map_err(MerkleError::from)?;
    }
    std::fs::rename(&tmp, path).map_err(MerkleError::from)?;
    Ok(())
}
