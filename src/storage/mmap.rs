//! # Memory-Mapped Backend
//!
//! `MappedStorage` maps the backing file directly into the process address
//! space and serves byte-range reads and writes straight from the mapping.
//! The OS handles paging transparently, leveraging its existing page cache
//! infrastructure instead of duplicating it in user space.
//!
//! ## Safety Model
//!
//! A memory-mapped region becomes invalid when the file is grown and
//! remapped. All access goes through one `parking_lot::RwLock`: readers copy
//! out of the mapping under the shared lock, growth swaps the mapping under
//! the exclusive lock. No reference into the old mapping can survive a remap
//! because references never escape the guard.
//!
//! This is the "simple" backend of the storage layer: one lock serializes
//! physical writers and blocks physical readers during writes. The sharded
//! page-cache backend exists as the performance variant; both present the
//! same [`ByteStorage`](super::ByteStorage) contract.
//!
//! ## Sizing
//!
//! The file is always sized in whole pages. Writes past the mapped length
//! grow the file geometrically (doubling, at minimum to cover the write),
//! flushing the old mapping before the remap so no modification is lost if
//! the remap fails.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;
use parking_lot::RwLock;
use tracing::debug;

use super::ByteStorage;
use crate::error::StorageError;

pub struct MappedStorage {
    path: PathBuf,
    page_size: usize,
    inner: RwLock<Option<MappedInner>>,
}

struct MappedInner {
    file: File,
    mmap: MmapMut,
    page_count: u64,
}

impl MappedInner {
    fn len(&self, page_size: usize) -> u64 {
        self.page_count * page_size as u64
    }
}

impl MappedStorage {
    /// Opens the backing file at `path`, creating it with `initial_pages`
    /// pages if it does not exist or is empty.
    ///
    /// An existing file must be sized in whole pages; both backends maintain
    /// that invariant, so anything else means the file is not ours.
    pub fn open(path: &Path, page_size: usize, initial_pages: u64) -> Result<Self> {
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

        let page_count = if file_size == 0 {
            file.set_len(initial_pages * page_size as u64).map_err(|e| {
                StorageError::io(format!("sizing new file '{}'", path.display()), e)
            })?;
            initial_pages
        } else {
            ensure!(
                file_size % page_size as u64 == 0,
                "file '{}' size {} is not a multiple of page size {}",
                path.display(),
                file_size,
                page_size
            );
            file_size / page_size as u64
        };

        // SAFETY: MmapMut::map_mut is unsafe because memory-mapped files can
        // be modified externally, leading to undefined behavior. This is safe
        // because:
        // 1. The file is opened read+write and owned by this store instance;
        //    opening the same path twice concurrently is unsupported
        // 2. The mmap lifetime is tied to MappedInner, preventing
        //    use-after-unmap
        // 3. All access copies in or out under the RwLock, so no reference
        //    into the mapping outlives a remap
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        debug!(
            path = %path.display(),
            page_size,
            page_count,
            "opened mapped storage"
        );

        Ok(Self {
            path: path.to_path_buf(),
            page_size,
            inner: RwLock::new(Some(MappedInner {
                file,
                mmap,
                page_count,
            })),
        })
    }

    fn grow(&self, inner: &mut MappedInner, required_bytes: u64) -> Result<()> {
        let required_pages = required_bytes.div_ceil(self.page_size as u64);
        let new_page_count = required_pages.max(inner.page_count * 2);
        let new_size = new_page_count * self.page_size as u64;

        // Flush before the remap so nothing is lost if the remap fails.
        inner
            .mmap
            .flush()
            .map_err(|e| StorageError::io("flushing mapping before grow".to_string(), e))?;

        inner.file.set_len(new_size).map_err(|e| {
            StorageError::io(
                format!("extending '{}' to {} bytes", self.path.display(), new_size),
                e,
            )
        })?;

        // SAFETY: MmapMut::map_mut is unsafe because the old mapping becomes
        // invalid. This is safe because:
        // 1. We hold the exclusive lock, so no reader holds a reference into
        //    the old mapping
        // 2. The old mapping was flushed above
        // 3. The file was extended to new_size before remapping
        // 4. The old mapping is dropped when the new one is assigned
        inner.mmap = unsafe {
            MmapMut::map_mut(&inner.file).wrap_err_with(|| {
                format!("failed to remap '{}' after grow", self.path.display())
            })?
        };
        inner.page_count = new_page_count;

        debug!(
            path = %self.path.display(),
            new_page_count,
            "grew mapped storage"
        );

        Ok(())
    }
}

impl ByteStorage for MappedStorage {
    fn read_into(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let guard = self.inner.read();
        let inner = guard.as_ref().ok_or(StorageError::Closed)?;

        let end = offset + buf.len() as u64;
        ensure!(
            end <= inner.len(self.page_size),
            "read of {} bytes at offset {} exceeds mapped length {}",
            buf.len(),
            offset,
            inner.len(self.page_size)
        );

        buf.copy_from_slice(&inner.mmap[offset as usize..end as usize]);
        Ok(())
    }

    fn write_bytes(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        let mut guard = self.inner.write();
        let inner = guard.as_mut().ok_or(StorageError::Closed)?;

        let end = offset + bytes.len() as u64;
        if end > inner.len(self.page_size) {
            self.grow(inner, end)?;
        }

        inner.mmap[offset as usize..end as usize].copy_from_slice(bytes);
        Ok(())
    }

    fn len(&self) -> u64 {
        self.inner
            .read()
            .as_ref()
            .map(|inner| inner.len(self.page_size))
            .unwrap_or(0)
    }

    fn flush(&self) -> Result<()> {
        let guard = self.inner.read();
        let inner = guard.as_ref().ok_or(StorageError::Closed)?;

        inner
            .mmap
            .flush()
            .map_err(|e| StorageError::io(format!("flushing '{}'", self.path.display()), e))?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut guard = self.inner.write();
        let Some(inner) = guard.as_ref() else {
            return Ok(());
        };

        inner
            .mmap
            .flush()
            .map_err(|e| StorageError::io(format!("flushing '{}'", self.path.display()), e))?;

        // Dropping the inner unmaps the region and releases the file handle.
        *guard = None;
        debug!(path = %self.path.display(), "closed mapped storage");
        Ok(())
    }

    fn page_size(&self) -> usize {
        self.page_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const PAGE: usize = 1024;

    #[test]
    fn create_sizes_file_in_whole_pages() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");

        let storage = MappedStorage::open(&path, PAGE, 4).unwrap();

        assert_eq!(storage.len(), 4 * PAGE as u64);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4 * PAGE as u64);
    }

    #[test]
    fn rejects_non_power_of_two_page_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");

        assert!(MappedStorage::open(&path, 1000, 4).is_err());
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let storage = MappedStorage::open(&path, PAGE, 1).unwrap();

        storage.write_bytes(10, b"hello pages").unwrap();

        let mut buf = vec![0u8; 11];
        storage.read_into(10, &mut buf).unwrap();
        assert_eq!(&buf, b"hello pages");
    }

    #[test]
    fn write_spanning_page_boundary() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let storage = MappedStorage::open(&path, PAGE, 2).unwrap();

        let data: Vec<u8> = (0..100).collect();
        let offset = PAGE as u64 - 50;
        storage.write_bytes(offset, &data).unwrap();

        let mut buf = vec![0u8; 100];
        storage.read_into(offset, &mut buf).unwrap();
        assert_eq!(buf, data);
    }

    #[test]
    fn write_past_end_grows_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let storage = MappedStorage::open(&path, PAGE, 1).unwrap();

        let offset = 5 * PAGE as u64;
        storage.write_bytes(offset, b"tail").unwrap();

        assert!(storage.len() >= offset + 4);
        assert_eq!(storage.len() % PAGE as u64, 0);

        let mut buf = vec![0u8; 4];
        storage.read_into(offset, &mut buf).unwrap();
        assert_eq!(&buf, b"tail");
    }

    #[test]
    fn grow_preserves_existing_data() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let storage = MappedStorage::open(&path, PAGE, 1).unwrap();

        storage.write_bytes(100, b"keep me").unwrap();
        storage.write_bytes(20 * PAGE as u64, b"far away").unwrap();

        let mut buf = vec![0u8; 7];
        storage.read_into(100, &mut buf).unwrap();
        assert_eq!(&buf, b"keep me");
    }

    #[test]
    fn read_past_end_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let storage = MappedStorage::open(&path, PAGE, 1).unwrap();

        let mut buf = vec![0u8; 8];
        assert!(storage.read_into(PAGE as u64 - 4, &mut buf).is_err());
    }

    #[test]
    fn flush_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");

        {
            let storage = MappedStorage::open(&path, PAGE, 1).unwrap();
            storage.write_bytes(0, b"durable").unwrap();
            storage.flush().unwrap();
            storage.close().unwrap();
        }

        let storage = MappedStorage::open(&path, PAGE, 1).unwrap();
        let mut buf = vec![0u8; 7];
        storage.read_into(0, &mut buf).unwrap();
        assert_eq!(&buf, b"durable");
    }

    #[test]
    fn operations_after_close_fail_closed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let storage = MappedStorage::open(&path, PAGE, 1).unwrap();

        storage.close().unwrap();
        storage.close().unwrap(); // idempotent

        let mut buf = [0u8; 1];
        let err = storage.read_into(0, &mut buf).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::Closed)
        ));

        let err = storage.write_bytes(0, b"x").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::Closed)
        ));
    }

    #[test]
    fn reopen_rejects_foreign_file_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, vec![0u8; 777]).unwrap();

        assert!(MappedStorage::open(&path, PAGE, 1).is_err());
    }
}
