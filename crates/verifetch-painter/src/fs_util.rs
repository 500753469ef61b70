// crates/verifetch-painter/src/fs_util.rs

//! Positional I/O over a single shared data-file handle.
//!
//! Writes to disjoint chunk offsets proceed in parallel on the blocking
//! pool; positional reads/writes mean one handle suffices for all of them.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

/// The local sparse data file backing a painter.
#[derive(Debug)]
pub(crate) struct DataFile {
    file: File,
}

impl DataFile {
    /// Open (creating if needed) and size the file to exactly `len` bytes.
    /// Extension is sparse: unwritten regions read as zeros.
    pub fn open_rw(path: &Path, len: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        if file.metadata()?.len() != len {
            file.set_len(len)?;
        }
        Ok(Self { file })
    }

    #[cfg(unix)]
    pub fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.write_all_at(buf, offset)
    }

    #[cfg(unix)]
    pub fn read_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        use std::os::unix::fs::FileExt;
        let mut out = vec![0u8; len];
        self.file.read_exact_at(&mut out, offset)?;
        Ok(out)
    }

    #[cfg(windows)]
    pub fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        use std::os::windows::fs::FileExt;
        let mut written = 0usize;
        while written < buf.len() {
            let n = self
                .file
                .seek_write(&buf[written..], offset + written as u64)?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "failed to write whole chunk",
                ));
            }
            written += n;
        }
        Ok(())
    }

    #[cfg(windows)]
    pub fn read_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        use std::os::windows::fs::FileExt;
        let mut out = vec![0u8; len];
        let mut read = 0usize;
        while read < len {
            let n = self.file.seek_read(&mut out[read..], offset + read as u64)?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "data file shorter than expected",
                ));
            }
            read += n;
        }
        Ok(out)
    }

    /// Force file contents to stable storage.
    pub fn sync(&self) -> io::Result<()> {
        self.file.sync_data()
    }
}
