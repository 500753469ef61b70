// crates/verifetch-painter/src/lib.rs

//! On-demand verified fetching over ranged HTTP.
//!
//! The [`Painter`] bridges a remote artifact URL and a local
//! (data file + [`verifetch_merkle::MerkleState`]) pair: every requested
//! chunk is fetched with a ranged GET, hashed against the Merkle reference,
//! written to the sparse data file, and only then marked valid. Concurrent
//! requests for the same chunk coalesce into a single fetch.
//!
//! [`ChunkedReader`] layers a byte-addressable read API on top: reads
//! suspend until the covering chunks are verified, so every byte a caller
//! sees matched the reference hash at verification time.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::unwrap_used,
    clippy::expect_used
)]

mod fs_util;
mod http;

pub mod error;
pub mod options;
pub mod painter;
pub mod reader;

pub use error::PaintError;
pub use options::PainterOptions;
pub use painter::Painter;
pub use reader::ChunkedReader;
