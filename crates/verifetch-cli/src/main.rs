// crates/verifetch-cli/src/main.rs

#![forbid(unsafe_code)]
#![deny(
    rust_2018_idioms,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo
)]

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use verifetch_core::{Digest, MerkleError};
use verifetch_merkle::{
    create_merkle_file, CreateOptions, CreateOutcome, MerkleRef, MerkleState,
};
use verifetch_painter::{ChunkedReader, PaintError, Painter, PainterOptions};

#[derive(Parser, Debug)]
#[command(
    name = "verifetch",
    about = "Verified chunked artifact tooling",
    long_about = "Verified chunked artifact tooling.\n\nBuild and inspect Merkle sidecars for large files, verify local copies against them, and prefetch remote artifacts chunk by chunk with per-chunk SHA-256 verification.",
    version = env!("CARGO_PKG_VERSION"),
    disable_help_subcommand = true
)]
struct Cli {
    /// Add expected/observed digests to verification failures.
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Build a `.mref` reference sidecar next to a local file.
    /// Skips the build when the sidecar is newer than its source.
    Create {
        /// Local artifact to hash
        #[arg(long)]
        file: PathBuf,

        /// Chunk size in bytes (power of two)
        #[arg(long, default_value_t = 1 << 20)]
        chunk_size: u64,

        /// Rebuild even when an up-to-date sidecar exists
        #[arg(long)]
        force: bool,

        /// Report the decision without writing anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Describe a `.mref` or `.mrkl` sidecar
    Summary {
        /// Sidecar path (`.mref` or `.mrkl`)
        #[arg(long)]
        file: PathBuf,

        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Re-hash a local file chunk by chunk against a reference sidecar
    Verify {
        /// Local artifact to check
        #[arg(long)]
        file: PathBuf,

        /// Reference sidecar (`.mref`)
        #[arg(long)]
        reference: PathBuf,
    },

    /// Open a painter over a remote artifact and prefetch a byte range
    /// (the whole artifact by default)
    Prefetch {
        /// Local data file (sidecars live next to it)
        #[arg(long)]
        data: PathBuf,

        /// Remote artifact URL (must serve ranges; `<url>.mref` is fetched
        /// when no local reference exists)
        #[arg(long)]
        url: String,

        /// First byte to prefetch
        #[arg(long, default_value_t = 0)]
        offset: u64,

        /// Bytes to prefetch (defaults to the rest of the artifact)
        #[arg(long)]
        length: Option<u64>,

        /// Maximum concurrent chunk fetches
        #[arg(long, default_value_t = 8)]
        max_in_flight: usize,
    },
}

fn main() -> ExitCode {
    init_tracing();

    let cli = Cli::parse();
    let verbose = cli.verbose;
    match run(cli.cmd) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => report_failure(&err, verbose),
    }
}

fn run(cmd: Cmd) -> Result<()> {
    match cmd {
        Cmd::Create {
            file,
            chunk_size,
            force,
            dry_run,
        } => create(&file, chunk_size, force, dry_run),
        Cmd::Summary { file, json } => summary(&file, json),
        Cmd::Verify { file, reference } => verify(&file, &reference),
        Cmd::Prefetch {
            data,
            url,
            offset,
            length,
            max_in_flight,
        } => prefetch(data, &url, offset, length, max_in_flight),
    }
}

/// Initialize tracing with an env-driven filter (default INFO).
fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = fmt::layer().with_target(false).with_level(true).compact();

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();
}

/// Exit 2 for verification mismatches, 1 for everything else.
fn report_failure(err: &anyhow::Error, verbose: bool) -> ExitCode {
    eprintln!("error: {err:#}");
    if let Some((leaf, expected, observed)) = find_checksum_failure(err) {
        if verbose {
            eprintln!("  leaf {leaf} expected sha256 {}", hex::encode(expected));
            eprintln!("  leaf {leaf} observed sha256 {}", hex::encode(observed));
        }
        return ExitCode::from(2);
    }
    ExitCode::FAILURE
}

fn find_checksum_failure(err: &anyhow::Error) -> Option<(u64, Digest, Digest)> {
    for cause in err.chain() {
        if let Some(m) = cause.downcast_ref::<MerkleError>() {
            if let Some(found) = checksum_of_merkle(m) {
                return Some(found);
            }
        }
        if let Some(p) = cause.downcast_ref::<PaintError>() {
            if let Some(found) = checksum_of_paint(p) {
                return Some(found);
            }
        }
    }
    None
}

fn checksum_of_merkle(err: &MerkleError) -> Option<(u64, Digest, Digest)> {
    match err {
        MerkleError::ChecksumFailed {
            leaf,
            expected,
            observed,
        } => Some((*leaf, *expected, *observed)),
        _ => None,
    }
}

fn checksum_of_paint(err: &PaintError) -> Option<(u64, Digest, Digest)> {
    match err {
        PaintError::Merkle(m) => checksum_of_merkle(m),
        PaintError::Chunk { cause, .. } => checksum_of_paint(cause),
        _ => None,
    }
}

fn create(file: &Path, chunk_size: u64, force: bool, dry_run: bool) -> Result<()> {
    info!(file = %file.display(), chunk_size, force, dry_run, "creating reference sidecar");
    let outcome = create_merkle_file(file, chunk_size, CreateOptions { force, dry_run })
        .with_context(|| format!("creating reference for {}", file.display()))?;

    match outcome {
        CreateOutcome::Created { sidecar, root } => {
            println!("Created {} (root {})", sidecar.display(), hex::encode(root));
        }
        CreateOutcome::UpToDate { sidecar } => {
            println!("Up to date: {} (use --force to rebuild)", sidecar.display());
        }
        CreateOutcome::WouldCreate { sidecar } => {
            println!("Would create {}", sidecar.display());
        }
    }
    Ok(())
}

fn summary(file: &Path, json: bool) -> Result<()> {
    let ext = file
        .extension()
        .and_then(|e| e.to_str())
        .map(|s| s.to_ascii_lowercase());

    match ext.as_deref() {
        Some("mref") => {
            let r = MerkleRef::load(file)
                .with_context(|| format!("loading reference {}", file.display()))?;
            print_summary(file, "reference", r.shape(), r.root_hash(), None, json);
        }
        Some("mrkl") => {
            let s = MerkleState::load(file)
                .with_context(|| format!("loading state {}", file.display()))?;
            let valid = s.valid_leaf_count();
            print_summary(file, "state", s.shape(), s.root_hash(), Some(valid), json);
        }
        _ => bail!(
            "unsupported sidecar extension for {} (expected .mref or .mrkl)",
            file.display()
        ),
    }
    Ok(())
}

fn print_summary(
    file: &Path,
    kind: &str,
    shape: &verifetch_core::Shape,
    root: &Digest,
    valid: Option<u64>,
    json: bool,
) {
    if json {
        let mut value = serde_json::json!({
            "kind": kind,
            "path": file.display().to_string(),
            "content_length": shape.content_length(),
            "chunk_size": shape.chunk_size(),
            "leaf_count": shape.leaf_count(),
            "cap_leaf": shape.cap_leaf(),
            "node_count": shape.node_count(),
            "root": hex::encode(root),
        });
        if let (Some(valid), Some(obj)) = (valid, value.as_object_mut()) {
            obj.insert("valid_leaves".into(), valid.into());
        }
        println!("{value}");
    } else {
        println!(
            "{kind} {}: {} bytes in {} chunks of {}",
            file.display(),
            shape.content_length(),
            shape.leaf_count(),
            shape.chunk_size()
        );
        println!("  root {}", hex::encode(root));
        if let Some(valid) = valid {
            println!("  verified {valid}/{} chunks", shape.leaf_count());
        }
    }
}

fn verify(file: &Path, reference: &Path) -> Result<()> {
    info!(file = %file.display(), reference = %reference.display(), "verifying local file");
    let r = MerkleRef::load(reference)
        .with_context(|| format!("loading reference {}", reference.display()))?;
    r.verify_file(file).with_context(|| {
        format!(
            "verifying {} against {}",
            file.display(),
            reference.display()
        )
    })?;

    println!("OK: {} matches {}", file.display(), reference.display());
    Ok(())
}

fn prefetch(
    data: PathBuf,
    url: &str,
    offset: u64,
    length: Option<u64>,
    max_in_flight: usize,
) -> Result<()> {
    info!(data = %data.display(), url, offset, ?length, "prefetching");
    let runtime = tokio::runtime::Runtime::new().context("starting async runtime")?;

    runtime.block_on(async move {
        let opts = PainterOptions {
            max_in_flight,
            ..Default::default()
        };
        let painter = Painter::open(data, url, opts)
            .await
            .with_context(|| format!("opening painter for {url}"))?;
        let reader = ChunkedReader::new(painter.clone());

        let length = length.unwrap_or_else(|| reader.size().saturating_sub(offset));
        reader
            .prebuffer(offset, length)
            .await
            .context("prefetching range")?;

        println!(
            "Prefetched [{offset}, {}) → {}/{} chunks verified",
            offset.saturating_add(length),
            painter.valid_leaf_count(),
            painter.shape().leaf_count()
        );
        reader.close().await.context("closing painter")?;
        Ok(())
    })
}
