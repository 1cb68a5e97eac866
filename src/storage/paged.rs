//! # Page-Cache Backend
//!
//! `ShardedPageStorage` is the performance variant of the storage layer:
//! instead of one lock around a memory mapping, it keeps resident pages in
//! the sharded SIEVE cache and talks to the backing file with positioned
//! reads and writes.
//!
//! ## Read Path
//!
//! A cache hit costs one shared shard lock: no global mutex, no syscall.
//! A miss loads the page with a positioned read under the shard's write
//! lock; pages past the end of the file read back as zeros, matching the
//! mapped backend's freshly-grown pages.
//!
//! ## Write Path
//!
//! Writes land in cached pages and mark them dirty. The backing file is
//! touched on `flush()` (every dirty page written back, then `sync_data`)
//! and on eviction of a dirty victim (written back before the slot is
//! reused). A failed write-back leaves the page dirty, so nothing is lost
//! on I/O errors; the next flush retries.
//!
//! ## Growth
//!
//! Logical growth is bookkeeping only: the physical high-water mark advances
//! when a write dirties pages past it, and the file itself extends lazily as
//! dirty pages are written back. The file length stays a whole number of
//! pages, as with the mapped backend.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use eyre::{ensure, Result};
use parking_lot::RwLock;
use tracing::debug;

use super::cache::PageCache;
use super::ByteStorage;
use crate::error::StorageError;

pub struct ShardedPageStorage {
    path: PathBuf,
    page_size: usize,
    file: RwLock<Option<File>>,
    cache: PageCache,
    // Page-rounded high-water mark of written bytes, including pages that
    // are still dirty in cache.
    physical_len: AtomicU64,
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let written = file.seek_write(buf, offset)?;
        buf = &buf[written..];
        offset += written as u64;
    }
    Ok(())
}

/// Fills `data` with the page's on-disk content; bytes past EOF stay zero.
fn load_page(file: &File, page_no: u64, page_size: usize, data: &mut [u8]) -> Result<()> {
    let base = page_no * page_size as u64;
    let mut filled = 0;

    while filled < data.len() {
        match read_at(file, &mut data[filled..], base + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(StorageError::io(format!("loading page {}", page_no), e).into());
            }
        }
    }
    Ok(())
}

fn store_page(file: &File, page_no: u64, page_size: usize, data: &[u8]) -> Result<()> {
    write_all_at(file, data, page_no * page_size as u64)
        .map_err(|e| StorageError::io(format!("writing back page {}", page_no), e))?;
    Ok(())
}

impl ShardedPageStorage {
    /// Opens the backing file at `path`, creating it with `initial_pages`
    /// pages if it does not exist or is empty. The cache holds up to
    /// `cache_pages` resident pages.
    pub fn open(
        path: &Path,
        page_size: usize,
        initial_pages: u64,
        cache_pages: usize,
    ) -> Result<Self> {
        ensure!(
            page_size.is_power_of_two(),
            "page size {} must be a power of two",
            page_size
        );
        ensure!(initial_pages >= 1, "initial page count must be at least 1");

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| StorageError::io(format!("opening '{}'", path.display()), e))?;

        let file_size = file
            .metadata()
            .map_err(|e| StorageError::io(format!("reading metadata of '{}'", path.display()), e))?
            .len();

        let physical_len = if file_size == 0 {
            let len = initial_pages * page_size as u64;
            file.set_len(len).map_err(|e| {
                StorageError::io(format!("sizing new file '{}'", path.display()), e)
            })?;
            len
        } else {
            ensure!(
                file_size % page_size as u64 == 0,
                "file '{}' size {} is not a multiple of page size {}",
                path.display(),
                file_size,
                page_size
            );
            file_size
        };

        let cache = PageCache::new(cache_pages, page_size)?;

        debug!(
            path = %path.display(),
            page_size,
            cache_pages,
            physical_len,
            "opened sharded page storage"
        );

        Ok(Self {
            path: path.to_path_buf(),
            page_size,
            file: RwLock::new(Some(file)),
            cache,
            physical_len: AtomicU64::new(physical_len),
        })
    }

    fn round_up_to_page(&self, bytes: u64) -> u64 {
        bytes.div_ceil(self.page_size as u64) * self.page_size as u64
    }
}

impl ByteStorage for ShardedPageStorage {
    fn read_into(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let guard = self.file.read();
        let file = guard.as_ref().ok_or(StorageError::Closed)?;

        let end = offset + buf.len() as u64;
        let physical = self.physical_len.load(Ordering::Acquire);
        ensure!(
            end <= physical,
            "read of {} bytes at offset {} exceeds physical length {}",
            buf.len(),
            offset,
            physical
        );

        let page_size = self.page_size as u64;
        let mut cursor = offset;
        let mut filled = 0usize;

        while filled < buf.len() {
            let page_no = cursor / page_size;
            let in_page = (cursor % page_size) as usize;
            let chunk = (self.page_size - in_page).min(buf.len() - filled);

            let page = self.cache.get_or_load(
                page_no,
                |data| load_page(file, page_no, self.page_size, data),
                |victim_no, data| store_page(file, victim_no, self.page_size, data),
            )?;
            buf[filled..filled + chunk].copy_from_slice(&page.data()[in_page..in_page + chunk]);

            cursor += chunk as u64;
            filled += chunk;
        }

        Ok(())
    }

    fn write_bytes(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        let guard = self.file.read();
        let file = guard.as_ref().ok_or(StorageError::Closed)?;

        let end = offset + bytes.len() as u64;
        self.physical_len
            .fetch_max(self.round_up_to_page(end), Ordering::AcqRel);

        let page_size = self.page_size as u64;
        let mut cursor = offset;
        let mut written = 0usize;

        while written < bytes.len() {
            let page_no = cursor / page_size;
            let in_page = (cursor % page_size) as usize;
            let chunk = (self.page_size - in_page).min(bytes.len() - written);

            let mut page = self.cache.get_or_load(
                page_no,
                |data| load_page(file, page_no, self.page_size, data),
                |victim_no, data| store_page(file, victim_no, self.page_size, data),
            )?;
            page.data_mut()[in_page..in_page + chunk]
                .copy_from_slice(&bytes[written..written + chunk]);

            cursor += chunk as u64;
            written += chunk;
        }

        Ok(())
    }

    fn len(&self) -> u64 {
        self.physical_len.load(Ordering::Acquire)
    }

    fn flush(&self) -> Result<()> {
        let guard = self.file.read();
        let file = guard.as_ref().ok_or(StorageError::Closed)?;

        let flushed = self
            .cache
            .flush_dirty(|page_no, data| store_page(file, page_no, self.page_size, data))?;

        file.sync_data()
            .map_err(|e| StorageError::io(format!("syncing '{}'", self.path.display()), e))?;

        debug!(path = %self.path.display(), flushed, "flushed page storage");
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut guard = self.file.write();
        let Some(file) = guard.as_ref() else {
            return Ok(());
        };

        self.cache
            .flush_dirty(|page_no, data| store_page(file, page_no, self.page_size, data))?;
        file.sync_data()
            .map_err(|e| StorageError::io(format!("syncing '{}'", self.path.display()), e))?;

        self.cache.clear();
        *guard = None;
        debug!(path = %self.path.display(), "closed sharded page storage");
        Ok(())
    }

    fn page_size(&self) -> usize {
        self.page_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CACHE_SHARD_COUNT;
    use tempfile::tempdir;

    const PAGE: usize = 256;

    fn open(path: &Path, cache_pages: usize) -> ShardedPageStorage {
        ShardedPageStorage::open(path, PAGE, 1, cache_pages).unwrap()
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let storage = open(&dir.path().join("data.bin"), 64);

        storage.write_bytes(17, b"cached bytes").unwrap();

        let mut buf = vec![0u8; 12];
        storage.read_into(17, &mut buf).unwrap();
        assert_eq!(&buf, b"cached bytes");
    }

    #[test]
    fn write_spanning_several_pages() {
        let dir = tempdir().unwrap();
        let storage = open(&dir.path().join("data.bin"), 64);

        let data: Vec<u8> = (0..(3 * PAGE) as u32).map(|i| (i % 251) as u8).collect();
        let offset = PAGE as u64 / 2;
        storage.write_bytes(offset, &data).unwrap();

        let mut buf = vec![0u8; data.len()];
        storage.read_into(offset, &mut buf).unwrap();
        assert_eq!(buf, data);
    }

    #[test]
    fn growth_is_page_rounded() {
        let dir = tempdir().unwrap();
        let storage = open(&dir.path().join("data.bin"), 64);

        storage.write_bytes(10 * PAGE as u64 + 3, b"x").unwrap();

        assert_eq!(storage.len(), 11 * PAGE as u64);
    }

    #[test]
    fn unwritten_pages_read_as_zeros() {
        let dir = tempdir().unwrap();
        let storage = open(&dir.path().join("data.bin"), 64);

        storage.write_bytes(3 * PAGE as u64, b"end").unwrap();

        let mut buf = vec![0xFFu8; 16];
        storage.read_into(PAGE as u64, &mut buf).unwrap();
        assert_eq!(buf, vec![0u8; 16]);
    }

    #[test]
    fn flush_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");

        {
            let storage = open(&path, 64);
            storage.write_bytes(100, b"durable").unwrap();
            storage.flush().unwrap();
            storage.close().unwrap();
        }

        let storage = open(&path, 64);
        let mut buf = vec![0u8; 7];
        storage.read_into(100, &mut buf).unwrap();
        assert_eq!(&buf, b"durable");
    }

    #[test]
    fn eviction_pressure_loses_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        // Minimum cache: one page per shard, so writing many pages keeps
        // evicting dirty victims through the write-back path.
        let storage = open(&path, CACHE_SHARD_COUNT);

        let pages = CACHE_SHARD_COUNT as u64 * 8;
        for page_no in 0..pages {
            let payload = vec![(page_no % 251) as u8; PAGE];
            storage.write_bytes(page_no * PAGE as u64, &payload).unwrap();
        }

        for page_no in 0..pages {
            let mut buf = vec![0u8; PAGE];
            storage.read_into(page_no * PAGE as u64, &mut buf).unwrap();
            assert_eq!(buf, vec![(page_no % 251) as u8; PAGE], "page {}", page_no);
        }
    }

    #[test]
    fn read_past_physical_end_is_an_error() {
        let dir = tempdir().unwrap();
        let storage = open(&dir.path().join("data.bin"), 64);

        let mut buf = vec![0u8; 8];
        assert!(storage.read_into(PAGE as u64 - 4, &mut buf).is_err());
    }

    #[test]
    fn operations_after_close_fail_closed() {
        let dir = tempdir().unwrap();
        let storage = open(&dir.path().join("data.bin"), 64);

        storage.close().unwrap();
        storage.close().unwrap(); // idempotent

        let err = storage.write_bytes(0, b"x").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::Closed)
        ));
    }

    #[test]
    fn close_flushes_dirty_pages() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");

        {
            let storage = open(&path, 64);
            storage.write_bytes(0, b"no explicit flush").unwrap();
            storage.close().unwrap();
        }

        let storage = open(&path, 64);
        let mut buf = vec![0u8; 17];
        storage.read_into(0, &mut buf).unwrap();
        assert_eq!(&buf, b"no explicit flush");
    }
}
