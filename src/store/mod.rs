//! # Appendable Object Store
//!
//! The public contract consumed by enumerator/index callers: append a value,
//! get back the offset where its encoding begins, and use that offset as the
//! record's permanent identity for reads, byte-level comparisons, and ordered
//! full scans.
//!
//! ## Contract
//!
//! ```text
//! append(v) -> offset        write lock   offset strictly increases, never reused
//! read(offset, skip_cache)   read lock    returns the value appended at offset
//! check_bytes_are_the_same   read lock    byte-level compare, no decode needed
//! force()                    write lock   flush dirty pages, clear the dirty flag
//! is_dirty()                 -            any append since the last successful force?
//! process_all(visitor)       write lock   every record, ascending offset order
//! close()                    -            flush and release; idempotent
//! ```
//!
//! The store is logically append-only: previously-written bytes are never
//! rewritten, records are never deleted or overwritten, and the end offset
//! only grows, across process restarts too, as long as the backing file is
//! kept. Callers needing deletion build a tombstone/rewrite layer on top.
//!
//! ## Locking Discipline
//!
//! The store acquires no lock of its own. Callers hold the shared
//! [`LockContext`] around each logical operation, which keeps multiple
//! related stores lockable as one unit. Every operation verifies the
//! discipline and fails with a lock-discipline error (distinct from any
//! data error) when the required lock is not held. `process_all` requires
//! the *write* lock even though it only reads: a scan must observe a fixed
//! end offset, and the read lock alone does not prevent a writer from
//! advancing it mid-scan.
//!
//! ## Dirty State and Durability
//!
//! `is_dirty()` turns true on the first append and back to false only after
//! a `force()` that observed no intervening append. A failed flush leaves
//! the flag (and the affected pages) dirty, so callers get a clear retry
//! signal. `force()` also persists the logical end offset to a sidecar file
//! (`<path>.len`, 8 bytes LE): the backing file itself is sized in whole
//! pages, so the logical end lives outside it. On reopen the sidecar
//! restores the end offset; a missing sidecar next to a non-empty file is an
//! unclean-shutdown signal, logged and answered by falling back to the
//! physical length.
//!
//! ## State Machine
//!
//! `Created -> Open -> (Open <-> Dirty via append/force) -> Closed`, with
//! `Closed` terminal: every operation after `close()` fails with a
//! closed-storage error except a second, idempotent `close()`.

mod value_cache;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use eyre::{ensure, eyre, Result};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::codec::{Codec, Decoded};
use crate::config::{
    DEFAULT_CACHE_PAGES, DEFAULT_INITIAL_PAGES, DEFAULT_PAGE_SIZE, DEFAULT_VALUE_CACHE_CAPACITY,
    LENGTH_SIDECAR_EXTENSION,
};
use crate::error::StorageError;
use crate::lock::LockContext;
use crate::storage::{ByteStorage, MappedStorage, ShardedPageStorage};
use value_cache::ValueCache;

/// Append-only, offset-addressed object store over a [`ByteStorage`]
/// backend.
///
/// Parametrized over the value type `V`, its [`Codec`], and the storage
/// backend `S`, all resolved at construction, so call sites swap backends
/// without changing shape.
pub struct AppendStore<V, C, S>
where
    C: Codec<V>,
    S: ByteStorage,
{
    storage: S,
    codec: C,
    lock: Arc<LockContext>,
    path: PathBuf,
    sidecar_path: PathBuf,
    end_offset: AtomicU64,
    dirty: AtomicBool,
    closed: AtomicBool,
    page_aligned_values: bool,
    value_cache: Option<Mutex<ValueCache<V>>>,
}

/// Store opened over the memory-mapped backend.
pub type MappedAppendStore<V, C> = AppendStore<V, C, MappedStorage>;
/// Store opened over the sharded page-cache backend.
pub type PagedAppendStore<V, C> = AppendStore<V, C, ShardedPageStorage>;

impl<V, C, S> AppendStore<V, C, S>
where
    C: Codec<V>,
    S: ByteStorage,
{
    /// Encodes `value` and writes it at the current end offset.
    ///
    /// Returns the offset of the record's first byte, which is the record's
    /// permanent identity. Offsets strictly increase across successive
    /// appends and are never reused. Requires the write lock.
    pub fn append(&self, value: &V) -> Result<u64> {
        self.ensure_open()?;
        self.ensure_write_locked("append")?;

        let mut buf = Vec::with_capacity(64);
        self.codec.encode(value, &mut buf)?;

        let offset = self.end_offset.load(Ordering::Acquire);
        if self.page_aligned_values {
            self.check_page_alignment(offset, buf.len())?;
        }

        self.storage.write_bytes(offset, &buf)?;
        self.end_offset
            .store(offset + buf.len() as u64, Ordering::Release);
        self.dirty.store(true, Ordering::Release);

        trace!(offset, len = buf.len(), "appended record");
        Ok(offset)
    }

    fn check_page_alignment(&self, offset: u64, encoded_len: usize) -> Result<()> {
        let page_size = self.storage.page_size() as u64;
        ensure!(
            encoded_len as u64 <= page_size,
            "record of {} bytes cannot fit in one {}-byte page; page-aligned mode requires \
             records that never cross a page boundary",
            encoded_len,
            page_size
        );
        let room = page_size - offset % page_size;
        ensure!(
            encoded_len as u64 <= room,
            "record of {} bytes at offset {} would cross a page boundary ({} bytes left in the \
             page); page-aligned mode requires callers to size records so pages tile exactly",
            encoded_len,
            offset,
            room
        );
        Ok(())
    }

    /// Decodes and returns the record appended at `offset`.
    ///
    /// `skip_cache` bypasses the decoded-value cache for this call (both
    /// lookup and population); it never affects which bytes are read or the
    /// value returned. Requires the read or write lock.
    pub fn read(&self, offset: u64, skip_cache: bool) -> Result<V>
    where
        V: Clone,
    {
        self.ensure_open()?;
        self.ensure_read_locked("read")?;

        let consult_cache = !skip_cache && self.value_cache.is_some();
        if consult_cache {
            if let Some(cache) = &self.value_cache {
                if let Some(value) = cache.lock().get(offset) {
                    return Ok(value.clone());
                }
            }
        }

        let (value, _consumed) = self.decode_at(offset)?;

        if consult_cache {
            if let Some(cache) = &self.value_cache {
                cache.lock().insert(offset, value.clone());
            }
        }

        Ok(value)
    }

    /// Compares the record at `offset` with the encoding of `value`,
    /// byte for byte, without decoding.
    ///
    /// Agrees with `read(offset) == value` for every valid offset; an
    /// encoding that would run past the end offset compares unequal.
    /// Requires the read or write lock.
    pub fn check_bytes_are_the_same(&self, offset: u64, value: &V) -> Result<bool> {
        self.ensure_open()?;
        self.ensure_read_locked("check_bytes_are_the_same")?;

        let mut expected = Vec::with_capacity(64);
        self.codec.encode(value, &mut expected)?;

        let end = self.end_offset.load(Ordering::Acquire);
        match offset.checked_add(expected.len() as u64) {
            Some(record_end) if record_end <= end => {}
            _ => return Ok(false),
        }

        let mut actual = vec![0u8; expected.len()];
        self.storage.read_into(offset, &mut actual)?;
        Ok(actual == expected)
    }

    /// Flushes all dirty pages and the length sidecar, then clears the dirty
    /// flag.
    ///
    /// The flag is cleared only on success: a failed force leaves the store
    /// dirty so the caller can retry. Requires the write lock.
    pub fn force(&self) -> Result<()> {
        self.ensure_open()?;
        self.ensure_write_locked("force")?;
        self.flush_internal()
    }

    /// Whether any append happened since the last successful [`force`](Self::force).
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Offset at which the next append will write; grows monotonically.
    pub fn end_offset(&self) -> u64 {
        self.end_offset.load(Ordering::Acquire)
    }

    /// Visits every record in ascending offset (= append) order, stopping
    /// early when `visitor` returns `false`.
    ///
    /// Requires the *write* lock: the scan must observe a fixed end offset,
    /// which the read lock alone does not guarantee. Calling this with only
    /// the read lock held is a usage error reported as a lock-discipline
    /// violation, never as data corruption.
    pub fn process_all<F>(&self, mut visitor: F) -> Result<()>
    where
        F: FnMut(u64, V) -> bool,
    {
        self.ensure_open()?;
        if !self.lock.holds_write() {
            return Err(StorageError::LockDiscipline(
                "process_all requires the write lock: a scan must observe a fixed end offset, \
                 which the read lock alone does not guarantee"
                    .to_string(),
            )
            .into());
        }

        let end = self.end_offset.load(Ordering::Acquire);
        let mut offset = 0u64;

        while offset < end {
            // Scans bypass the value cache so a full pass cannot wash hot
            // entries out.
            let (value, consumed) = self.decode_at(offset)?;
            if !visitor(offset, value) {
                break;
            }
            offset += consumed as u64;
        }

        Ok(())
    }

    /// Flushes remaining dirty state and releases the backing file.
    ///
    /// A second `close()` is an idempotent no-op; every other operation
    /// afterwards fails with a closed-storage error. A failed flush leaves
    /// the store open (and dirty) so the close can be retried.
    pub fn close(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }

        self.flush_internal()?;
        self.storage.close()?;
        self.closed.store(true, Ordering::Release);

        debug!(path = %self.path.display(), "closed append store");
        Ok(())
    }

    // ---------------- lock pass-throughs ----------------

    /// Acquires the shared read lock on the store's lock context.
    pub fn lock_read(&self) {
        self.lock.lock_read();
    }

    /// Releases the shared read lock.
    pub fn unlock_read(&self) {
        self.lock.unlock_read();
    }

    /// Acquires the exclusive write lock on the store's lock context.
    pub fn lock_write(&self) {
        self.lock.lock_write();
    }

    /// Releases the exclusive write lock.
    pub fn unlock_write(&self) {
        self.lock.unlock_write();
    }

    /// The lock context shared by this store, for callers that coordinate
    /// several stores under one lock.
    pub fn lock_context(&self) -> &Arc<LockContext> {
        &self.lock
    }

    // ---------------- internal helpers ----------------

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed.into());
        }
        Ok(())
    }

    fn ensure_write_locked(&self, operation: &str) -> Result<()> {
        if self.lock.holds_write() {
            return Ok(());
        }
        Err(StorageError::LockDiscipline(format!("{} requires the write lock", operation)).into())
    }

    fn ensure_read_locked(&self, operation: &str) -> Result<()> {
        if self.lock.holds_read() {
            return Ok(());
        }
        Err(StorageError::LockDiscipline(format!(
            "{} requires the read or write lock",
            operation
        ))
        .into())
    }

    /// Decodes the record starting at `offset`, widening the read window
    /// when the codec signals it under-read.
    fn decode_at(&self, offset: u64) -> Result<(V, usize)> {
        let end = self.end_offset.load(Ordering::Acquire);
        if offset >= end {
            return Err(
                StorageError::corrupt(offset, format!("offset is at or past the end offset {}", end))
                    .into(),
            );
        }

        let remaining = end - offset;
        let mut window = remaining.min(self.storage.page_size() as u64) as usize;

        loop {
            let mut buf = vec![0u8; window];
            self.storage.read_into(offset, &mut buf)?;

            let outcome = self
                .codec
                .decode(&buf, offset)
                .map_err(|e| StorageError::corrupt(offset, e.to_string()))?;

            match outcome {
                Decoded::Value { value, consumed } => {
                    if consumed == 0 || consumed as u64 > remaining {
                        return Err(StorageError::corrupt(
                            offset,
                            format!(
                                "codec reported {} consumed bytes with {} available",
                                consumed, remaining
                            ),
                        )
                        .into());
                    }
                    return Ok((value, consumed));
                }
                Decoded::NeedBytes(needed) => {
                    if needed as u64 > remaining {
                        return Err(StorageError::corrupt(
                            offset,
                            format!(
                                "truncated record: codec needs {} bytes, {} remain before the end \
                                 offset",
                                needed, remaining
                            ),
                        )
                        .into());
                    }
                    if needed <= window {
                        return Err(StorageError::corrupt(
                            offset,
                            format!(
                                "codec made no progress: requested a {}-byte window inside the \
                                 {}-byte window it was given",
                                needed, window
                            ),
                        )
                        .into());
                    }
                    window = needed;
                }
            }
        }
    }

    fn flush_internal(&self) -> Result<()> {
        self.storage.flush()?;
        self.write_sidecar()?;
        self.dirty.store(false, Ordering::Release);
        Ok(())
    }

    fn write_sidecar(&self) -> Result<()> {
        let end = self.end_offset.load(Ordering::Acquire);
        std::fs::write(&self.sidecar_path, end.to_le_bytes()).map_err(|e| {
            StorageError::io(
                format!("writing length sidecar '{}'", self.sidecar_path.display()),
                e,
            )
        })?;
        Ok(())
    }
}

impl<V, C, S> Drop for AppendStore<V, C, S>
where
    C: Codec<V>,
    S: ByteStorage,
{
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) && self.is_dirty() {
            if let Err(e) = self.flush_internal() {
                warn!(path = %self.path.display(), error = %e, "flush on drop failed");
            }
        }
    }
}

fn sidecar_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(LENGTH_SIDECAR_EXTENSION);
    PathBuf::from(name)
}

fn read_sidecar(sidecar: &Path) -> Result<Option<u64>> {
    match std::fs::read(sidecar) {
        Ok(bytes) => match <[u8; 8]>::try_from(bytes.as_slice()) {
            Ok(raw) => Ok(Some(u64::from_le_bytes(raw))),
            Err(_) => {
                warn!(
                    path = %sidecar.display(),
                    len = bytes.len(),
                    "length sidecar has unexpected size, ignoring it"
                );
                Ok(None)
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StorageError::io(
            format!("reading length sidecar '{}'", sidecar.display()),
            e,
        )
        .into()),
    }
}

/// Builder for configuring and opening an [`AppendStore`].
///
/// ```ignore
/// let lock = Arc::new(LockContext::new());
/// let store = StoreBuilder::new()
///     .path("./names.bin")
///     .page_size(1024)
///     .lock_context(Arc::clone(&lock))
///     .open_mapped(StringCodec)?;
/// ```
pub struct StoreBuilder {
    path: Option<PathBuf>,
    page_size: usize,
    initial_pages: u64,
    cache_pages: usize,
    value_cache_capacity: usize,
    page_aligned_values: bool,
    lock: Option<Arc<LockContext>>,
}

impl Default for StoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreBuilder {
    pub fn new() -> Self {
        Self {
            path: None,
            page_size: DEFAULT_PAGE_SIZE,
            initial_pages: DEFAULT_INITIAL_PAGES,
            cache_pages: DEFAULT_CACHE_PAGES,
            value_cache_capacity: DEFAULT_VALUE_CACHE_CAPACITY,
            page_aligned_values: false,
            lock: None,
        }
    }

    /// Path of the backing file. Required. An existing file is reused; a
    /// missing or empty one starts a fresh store.
    pub fn path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Page size in bytes; must be a power of two.
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Number of pages a fresh backing file is created with.
    pub fn initial_pages(mut self, pages: u64) -> Self {
        self.initial_pages = pages;
        self
    }

    /// Page-cache capacity for the paged backend, in pages. Ignored by the
    /// mapped backend, which leans on the OS page cache instead.
    pub fn cache_pages(mut self, pages: usize) -> Self {
        self.cache_pages = pages;
        self
    }

    /// Capacity of the decoded-value read cache; 0 disables it.
    pub fn value_cache_capacity(mut self, capacity: usize) -> Self {
        self.value_cache_capacity = capacity;
        self
    }

    /// Requires every encoded record to fit inside one page (appends whose
    /// encoding would cross a page boundary are rejected). Off by default.
    pub fn page_aligned_values(mut self, aligned: bool) -> Self {
        self.page_aligned_values = aligned;
        self
    }

    /// Lock context shared with related stores. A private context is created
    /// when none is supplied.
    pub fn lock_context(mut self, lock: Arc<LockContext>) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Opens the store over the memory-mapped backend.
    pub fn open_mapped<V, C: Codec<V>>(self, codec: C) -> Result<MappedAppendStore<V, C>> {
        let (path, existed) = self.preflight()?;
        let storage = MappedStorage::open(&path, self.page_size, self.initial_pages)?;
        self.finish(path, existed, codec, storage)
    }

    /// Opens the store over the sharded page-cache backend.
    pub fn open_paged<V, C: Codec<V>>(self, codec: C) -> Result<PagedAppendStore<V, C>> {
        let (path, existed) = self.preflight()?;
        let storage =
            ShardedPageStorage::open(&path, self.page_size, self.initial_pages, self.cache_pages)?;
        self.finish(path, existed, codec, storage)
    }

    fn preflight(&self) -> Result<(PathBuf, bool)> {
        let path = self
            .path
            .clone()
            .ok_or_else(|| eyre!("a backing file path is required to open a store"))?;
        let existed = std::fs::metadata(&path).map(|m| m.len() > 0).unwrap_or(false);
        Ok((path, existed))
    }

    fn finish<V, C: Codec<V>, S: ByteStorage>(
        self,
        path: PathBuf,
        existed: bool,
        codec: C,
        storage: S,
    ) -> Result<AppendStore<V, C, S>> {
        let sidecar = sidecar_path(&path);

        let persisted_end = read_sidecar(&sidecar)?;
        let end_offset = match persisted_end {
            Some(end) => {
                let physical = storage.len();
                if end > physical {
                    warn!(
                        path = %path.display(),
                        end,
                        physical,
                        "length sidecar exceeds the backing file, clamping to physical length"
                    );
                    physical
                } else {
                    end
                }
            }
            None if existed => {
                let physical = storage.len();
                warn!(
                    path = %path.display(),
                    physical,
                    "no length sidecar next to a non-empty backing file (unclean shutdown?), \
                     falling back to the physical length"
                );
                physical
            }
            None => 0,
        };

        // Seed the sidecar right away when it was absent: a store that is
        // later reopened without ever forcing must not mistake its own
        // zero-filled pages for records.
        if persisted_end.is_none() {
            std::fs::write(&sidecar, end_offset.to_le_bytes()).map_err(|e| {
                StorageError::io(format!("writing length sidecar '{}'", sidecar.display()), e)
            })?;
        }

        let value_cache = if self.value_cache_capacity > 0 {
            Some(Mutex::new(ValueCache::new(self.value_cache_capacity)))
        } else {
            None
        };

        debug!(
            path = %path.display(),
            end_offset,
            page_aligned = self.page_aligned_values,
            "opened append store"
        );

        Ok(AppendStore {
            storage,
            codec,
            lock: self.lock.unwrap_or_default(),
            path,
            sidecar_path: sidecar,
            end_offset: AtomicU64::new(end_offset),
            dirty: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            page_aligned_values: self.page_aligned_values,
            value_cache,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{StringCodec, U64Codec};
    use tempfile::tempdir;

    #[test]
    fn builder_requires_a_path() {
        let result = StoreBuilder::new().open_mapped::<String, _>(StringCodec);
        assert!(result.is_err());
    }

    #[test]
    fn sidecar_path_appends_extension() {
        let path = sidecar_path(Path::new("/tmp/store.bin"));
        assert_eq!(path, Path::new("/tmp/store.bin.len"));
    }

    #[test]
    fn append_requires_write_lock() {
        let dir = tempdir().unwrap();
        let store = StoreBuilder::new()
            .path(dir.path().join("s.bin"))
            .open_mapped(StringCodec)
            .unwrap();

        let err = store.append(&"nope".to_string()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::LockDiscipline(_))
        ));
    }

    #[test]
    fn page_aligned_mode_rejects_crossing_records() {
        let dir = tempdir().unwrap();
        let store = StoreBuilder::new()
            .path(dir.path().join("s.bin"))
            .page_size(64)
            .page_aligned_values(true)
            .open_mapped(StringCodec)
            .unwrap();

        store.lock_write();

        // 4-byte prefix + 28 bytes payload = 32 bytes per record. Three of
        // them end at offset 96, mid-page; a 44-byte record there would
        // cross into the next page and must be rejected.
        let half_page = "x".repeat(28);
        for _ in 0..3 {
            store.append(&half_page).unwrap();
        }
        assert_eq!(store.end_offset(), 96);

        let crossing = "y".repeat(40);
        let err = store.append(&crossing).unwrap_err();
        assert!(err.to_string().contains("page boundary"));

        // The store is still usable for records that fit the remainder.
        store.append(&half_page).unwrap();
        store.unlock_write();
    }

    #[test]
    fn page_aligned_mode_accepts_tiling_records() {
        let dir = tempdir().unwrap();
        let store = StoreBuilder::new()
            .path(dir.path().join("s.bin"))
            .page_size(64)
            .page_aligned_values(true)
            .open_mapped(U64Codec)
            .unwrap();

        store.lock_write();
        for i in 0..100u64 {
            let offset = store.append(&i).unwrap();
            assert_eq!(offset, i * 8);
        }
        store.unlock_write();
    }

    #[test]
    fn decode_at_rejects_offset_past_end() {
        let dir = tempdir().unwrap();
        let store = StoreBuilder::new()
            .path(dir.path().join("s.bin"))
            .open_mapped(StringCodec)
            .unwrap();

        store.lock_write();
        store.append(&"only".to_string()).unwrap();
        let err = store.read(1_000_000, false).unwrap_err();
        store.unlock_write();

        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::CorruptRecord { .. })
        ));
    }
}
