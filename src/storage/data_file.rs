//! # Memory-Mapped Data File
//!
//! `DataFile` is the building block under every collection and hash table
//! file: a flat byte buffer mapped from disk, an in-use watermark `used`, and
//! a fixed growth increment.
//!
//! ## Watermark Reconstruction
//!
//! The file carries no header; `used` is recovered on open by bisecting the
//! buffer for the frontier between written bytes and the zeroed tail. This
//! works because growth always zero-fills through the file handle before
//! remapping, writes only ever advance the frontier, and no record format in
//! this crate writes long runs of zero bytes. The probe treats a position as
//! "empty" when the first `min(1024, len - 1)` bytes after it are zero, which
//! leaves a one-byte ambiguity at the frontier; the bisection resolves it by
//! stepping back one byte when the preceding position also looks empty.
//!
//! ## Remap Safety
//!
//! Growing unmaps and remaps the buffer, invalidating every outstanding
//! slice. Both [`DataFile::ensure_size`] and the slice accessors borrow
//! `self` accordingly, so the borrow checker rejects any caller that holds a
//! buffer slice across a grow.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};
use memmap2::MmapMut;
use tracing::debug;

/// Zero-fill happens through the file handle in chunks of this size.
const ZERO_CHUNK: usize = 8 * 1_048_576;

/// How many bytes [`looks_empty`] probes before declaring a region zeroed.
const EMPTY_PROBE: usize = 1024;

/// An mmap-backed byte buffer that tracks total and in-use space.
#[derive(Debug)]
pub struct DataFile {
    path: PathBuf,
    file: File,
    mmap: MmapMut,
    pub(crate) used: usize,
    pub(crate) size: usize,
    growth: usize,
}

/// True when the buffer begins with a long run of zero bytes.
fn looks_empty(buf: &[u8]) -> bool {
    let up_to = EMPTY_PROBE.min(buf.len().saturating_sub(1));
    buf[..up_to].iter().all(|&b| b == 0)
}

/// Write `len` zero bytes at `from` through the file handle and sync, so the
/// zeroed tail is durable before it is ever mapped.
fn overwrite_with_zero(file: &File, from: u64, len: usize) -> Result<()> {
    let mut handle = file;
    handle
        .seek(SeekFrom::Start(from))
        .wrap_err("failed to seek before zero-fill")?;
    let zero = vec![0u8; ZERO_CHUNK.min(len)];
    let mut remaining = len;
    while remaining > 0 {
        let chunk = remaining.min(zero.len());
        handle
            .write_all(&zero[..chunk])
            .wrap_err("failed to zero-fill file region")?;
        remaining -= chunk;
    }
    file.sync_all().wrap_err("failed to sync after zero-fill")
}

impl DataFile {
    /// Open (creating if absent) a data file that grows by `growth` bytes at
    /// a time, and reconstruct its in-use watermark.
    pub fn open<P: AsRef<Path>>(path: P, growth: usize) -> Result<DataFile> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .wrap_err_with(|| format!("failed to open data file '{}'", path.display()))?;

        let mut size = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len() as usize;

        if size < growth {
            overwrite_with_zero(&file, size as u64, growth)?;
            size += growth;
        }

        // SAFETY: MmapMut::map_mut is unsafe because the file could be
        // modified externally. The file is opened read-write by this process
        // alone, the mapping's lifetime is tied to this DataFile, and every
        // access goes through the bounds-checked buffer accessors.
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        let mut data_file = DataFile {
            path,
            file,
            mmap,
            used: 0,
            size,
            growth,
        };
        data_file.used = data_file.reconstruct_used();

        debug!(
            path = %data_file.path.display(),
            used = data_file.used,
            size = data_file.size,
            "data file opened"
        );
        Ok(data_file)
    }

    /// Bisect the buffer for the frontier between in-use bytes and the
    /// zeroed tail.
    fn reconstruct_used(&self) -> usize {
        let buf = &self.mmap[..];
        let (mut low, mut mid, mut high) = (0usize, self.size / 2, self.size);
        loop {
            if high - mid == 1 {
                if looks_empty(&buf[mid..]) {
                    if mid > 0 && looks_empty(&buf[mid - 1..]) {
                        return mid - 1;
                    }
                    return mid;
                }
                return high;
            }
            if looks_empty(&buf[mid..]) {
                high = mid;
                mid = low + (mid - low) / 2;
            } else {
                low = mid;
                mid += (high - mid) / 2;
            }
        }
    }

    /// Ensure there is room for `more` bytes past the watermark, growing the
    /// file by whole growth increments as needed. Invalidates outstanding
    /// buffer slices when it grows.
    pub fn ensure_size(&mut self, more: usize) -> Result<()> {
        while self.used + more > self.size {
            self.mmap
                .flush()
                .wrap_err("failed to flush mmap before grow")?;
            overwrite_with_zero(&self.file, self.size as u64, self.growth)?;

            // SAFETY: the old mapping is replaced below; no slice of it can
            // be live because this method holds &mut self. The file was
            // extended and synced above.
            self.mmap = unsafe {
                MmapMut::map_mut(&self.file)
                    .wrap_err_with(|| format!("failed to remap '{}' after grow", self.path.display()))?
            };
            self.size += self.growth;
            debug!(
                path = %self.path.display(),
                size = self.size,
                used = self.used,
                "data file grown"
            );
        }
        Ok(())
    }

    /// Truncate the file to zero and re-extend it to one growth increment.
    pub fn clear(&mut self) -> Result<()> {
        self.mmap
            .flush()
            .wrap_err("failed to flush mmap before clear")?;
        self.file
            .set_len(0)
            .wrap_err_with(|| format!("failed to truncate '{}'", self.path.display()))?;
        overwrite_with_zero(&self.file, 0, self.growth)?;

        // SAFETY: same argument as in ensure_size; the stale mapping over the
        // truncated region is never read between the truncate above and this
        // replacement, because we hold &mut self throughout.
        self.mmap = unsafe {
            MmapMut::map_mut(&self.file)
                .wrap_err_with(|| format!("failed to remap '{}' after clear", self.path.display()))?
        };
        self.used = 0;
        self.size = self.growth;
        debug!(path = %self.path.display(), "data file cleared");
        Ok(())
    }

    /// Flush dirty pages to disk.
    pub fn sync(&self) -> Result<()> {
        self.mmap
            .flush()
            .wrap_err_with(|| format!("failed to sync '{}'", self.path.display()))
    }

    /// Flush and release the mapping and the file handle.
    pub fn close(self) -> Result<()> {
        self.sync()
    }

    /// Advise the kernel that `[from, from + len)` is about to be read.
    pub fn prefetch(&self, from: usize, len: usize) {
        if from >= self.size {
            return;
        }
        let len = len.min(self.size - from);

        #[cfg(unix)]
        // SAFETY: the range is clamped to the mapping above; madvise with
        // MADV_WILLNEED is a hint and does not fault the region by itself.
        unsafe {
            libc::madvise(
                self.mmap.as_ptr().add(from) as *mut libc::c_void,
                len,
                libc::MADV_WILLNEED,
            );
        }
        #[cfg(not(unix))]
        let _ = len;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes considered in-use from offset 0.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Total mapped size of the file.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn buf(&self) -> &[u8] {
        &self.mmap[..]
    }

    pub fn buf_mut(&mut self) -> &mut [u8] {
        &mut self.mmap[..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const GROWTH: usize = 4096;

    #[test]
    fn open_extends_fresh_file_to_one_growth() {
        let dir = tempdir().unwrap();
        let file = DataFile::open(dir.path().join("dat"), GROWTH).unwrap();
        assert_eq!(file.size(), GROWTH);
        assert_eq!(file.used(), 0);
        assert!(file.buf().iter().all(|&b| b == 0));
    }

    #[test]
    fn reopen_reconstructs_watermark_by_bisection() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dat");

        let mut file = DataFile::open(&path, GROWTH).unwrap();
        file.buf_mut()[..10].fill(0xAA);
        file.used = 10;
        file.close().unwrap();

        let file = DataFile::open(&path, GROWTH).unwrap();
        assert_eq!(file.used(), 10);
        assert_eq!(file.size(), GROWTH);
    }

    #[test]
    fn reopen_of_untouched_file_reports_zero_used() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dat");
        DataFile::open(&path, GROWTH).unwrap().close().unwrap();

        let file = DataFile::open(&path, GROWTH).unwrap();
        assert_eq!(file.used(), 0);
    }

    #[test]
    fn ensure_size_grows_by_whole_increments() {
        let dir = tempdir().unwrap();
        let mut file = DataFile::open(dir.path().join("dat"), GROWTH).unwrap();

        file.ensure_size(GROWTH).unwrap();
        assert_eq!(file.size(), GROWTH);

        file.used = GROWTH - 1;
        file.ensure_size(2).unwrap();
        assert_eq!(file.size(), 2 * GROWTH);

        file.ensure_size(3 * GROWTH).unwrap();
        assert_eq!(file.size(), 4 * GROWTH);
        assert!(file.buf()[GROWTH..].iter().all(|&b| b == 0));
    }

    #[test]
    fn clear_resets_to_one_growth() {
        let dir = tempdir().unwrap();
        let mut file = DataFile::open(dir.path().join("dat"), GROWTH).unwrap();
        file.buf_mut()[..100].fill(0xBB);
        file.used = 100;
        file.ensure_size(2 * GROWTH).unwrap();

        file.clear().unwrap();
        assert_eq!(file.used(), 0);
        assert_eq!(file.size(), GROWTH);
        assert!(file.buf().iter().all(|&b| b == 0));
    }

    #[test]
    fn watermark_survives_growth_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dat");

        let mut file = DataFile::open(&path, GROWTH).unwrap();
        file.used = GROWTH;
        file.buf_mut()[..GROWTH].fill(0x77);
        file.ensure_size(10).unwrap();
        let (start, end) = (file.used, file.used + 10);
        file.buf_mut()[start..end].fill(0x77);
        file.used = end;
        file.close().unwrap();

        let file = DataFile::open(&path, GROWTH).unwrap();
        assert_eq!(file.used(), GROWTH + 10);
        assert_eq!(file.size(), 2 * GROWTH);
    }
}
