//! # Sharded SIEVE Page Cache
//!
//! Bounded cache of file pages, keyed by page number within one backing file.
//! One cache belongs to exactly one storage instance; caches are never shared
//! across stores.
//!
//! ## Why SIEVE Instead of LRU?
//!
//! Strict LRU has a critical flaw for this workload: a full sequential scan
//! (`process_all`) would evict the entire cache, because every scanned page
//! becomes the most recently used. SIEVE keeps a `visited` flag instead of a
//! recency ordering:
//!
//! - On access: set the visited flag
//! - On eviction: advance a "hand" over the entries
//!   - visited: clear the flag, move on (second chance)
//!   - not visited: evict this entry
//!
//! Frequently-touched pages survive; scan pages (touched once) go quickly.
//!
//! ## Lock Sharding
//!
//! Pages are distributed over independent shards, each behind its own
//! `RwLock`, so concurrent readers of different pages rarely contend. This is
//! what makes the page-cache backend's common read path effectively
//! lock-free: a cache hit takes one shared shard lock, never a global mutex.
//!
//! ## Dirty Pages Are Never Dropped
//!
//! Every eviction path writes a dirty victim back through the caller-supplied
//! write-back closure *before* removing it. If the write-back fails, the
//! victim stays resident and dirty and the error propagates; the cache does
//! not silently lose data. `flush_dirty` likewise clears a page's dirty bit
//! only after its write-back succeeds, so a failed flush can be retried.
//!
//! ## Pin/Unpin Protocol
//!
//! A resident page is pinned while a [`PageRef`] to it exists and cannot be
//! evicted. The RAII guard unpins on drop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use eyre::{bail, ensure, Result};
use parking_lot::RwLock;

use crate::config::CACHE_SHARD_COUNT;

struct CacheEntry {
    page_no: u64,
    visited: AtomicBool,
    dirty: AtomicBool,
    pin_count: AtomicU32,
    data: Box<[u8]>,
}

impl CacheEntry {
    fn new(page_no: u64, page_size: usize) -> Self {
        Self {
            page_no,
            visited: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            pin_count: AtomicU32::new(0),
            data: vec![0u8; page_size].into_boxed_slice(),
        }
    }

    fn is_pinned(&self) -> bool {
        self.pin_count.load(Ordering::Acquire) > 0
    }

    fn pin(&self) {
        self.pin_count.fetch_add(1, Ordering::AcqRel);
    }

    fn unpin(&self) {
        let prev = self.pin_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unpin called on unpinned page");
    }

    fn mark_visited(&self) {
        self.visited.store(true, Ordering::Release);
    }

    fn clear_visited(&self) -> bool {
        self.visited.swap(false, Ordering::AcqRel)
    }

    fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }
}

struct CacheShard {
    entries: Vec<CacheEntry>,
    index: HashMap<u64, usize>,
    hand: usize,
    capacity: usize,
}

impl CacheShard {
    fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
            hand: 0,
            capacity,
        }
    }

    fn get(&self, page_no: u64) -> Option<usize> {
        self.index.get(&page_no).copied()
    }

    /// Picks the SIEVE victim: the first unpinned entry whose visited flag is
    /// already clear, clearing flags along the way. Returns `None` when every
    /// entry is pinned.
    fn evict_candidate(&mut self) -> Option<usize> {
        if self.entries.is_empty() {
            return None;
        }

        // Two sweeps: the first may clear visited flags everywhere, the
        // second then finds a victim unless every entry is pinned.
        let mut steps = 0;
        let max_steps = self.entries.len() * 2;

        while steps < max_steps {
            let idx = self.hand;
            self.hand = (self.hand + 1) % self.entries.len();
            steps += 1;

            let entry = &self.entries[idx];
            if entry.is_pinned() {
                continue;
            }
            if entry.clear_visited() {
                continue;
            }
            return Some(idx);
        }

        None
    }

    fn remove(&mut self, idx: usize) -> CacheEntry {
        let entry = self.entries.swap_remove(idx);
        self.index.remove(&entry.page_no);

        if idx < self.entries.len() {
            let moved = self.entries[idx].page_no;
            self.index.insert(moved, idx);
        }

        if self.hand >= self.entries.len() {
            self.hand = 0;
        }

        entry
    }

    fn insert(&mut self, entry: CacheEntry) -> usize {
        let page_no = entry.page_no;
        let idx = self.entries.len();
        self.entries.push(entry);
        self.index.insert(page_no, idx);
        idx
    }

    fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

pub struct PageCache {
    shards: Vec<RwLock<CacheShard>>,
    page_size: usize,
}

impl PageCache {
    /// Creates a cache holding up to `capacity_pages` pages of `page_size`
    /// bytes each, spread over [`CACHE_SHARD_COUNT`] shards.
    pub fn new(capacity_pages: usize, page_size: usize) -> Result<Self> {
        ensure!(
            capacity_pages >= CACHE_SHARD_COUNT,
            "cache capacity {} must be at least {} (one page per shard)",
            capacity_pages,
            CACHE_SHARD_COUNT
        );

        let per_shard = capacity_pages / CACHE_SHARD_COUNT;
        let remainder = capacity_pages % CACHE_SHARD_COUNT;

        let shards: Vec<_> = (0..CACHE_SHARD_COUNT)
            .map(|i| {
                let cap = if i < remainder { per_shard + 1 } else { per_shard };
                RwLock::new(CacheShard::new(cap))
            })
            .collect();

        Ok(Self { shards, page_size })
    }

    fn shard(&self, page_no: u64) -> &RwLock<CacheShard> {
        &self.shards[(page_no as usize) % CACHE_SHARD_COUNT]
    }

    /// Returns a pinned reference to the page if it is resident.
    pub fn get(&self, page_no: u64) -> Option<PageRef<'_>> {
        let shard = self.shard(page_no);
        let guard = shard.read();

        let idx = guard.get(page_no)?;
        guard.entries[idx].pin();
        guard.entries[idx].mark_visited();
        Some(PageRef {
            cache: self,
            page_no,
        })
    }

    /// Returns a pinned reference to the page, loading it through `load` if
    /// absent. Evicting a dirty victim first writes it back through
    /// `write_back`; a write-back failure aborts the load and leaves the
    /// victim resident and dirty.
    pub fn get_or_load<L, W>(&self, page_no: u64, load: L, mut write_back: W) -> Result<PageRef<'_>>
    where
        L: FnOnce(&mut [u8]) -> Result<()>,
        W: FnMut(u64, &[u8]) -> Result<()>,
    {
        if let Some(page) = self.get(page_no) {
            return Ok(page);
        }

        let shard = self.shard(page_no);
        let mut guard = shard.write();

        // Raced with another loader between the read and write lock.
        if let Some(idx) = guard.get(page_no) {
            guard.entries[idx].pin();
            guard.entries[idx].mark_visited();
            return Ok(PageRef {
                cache: self,
                page_no,
            });
        }

        if guard.is_full() {
            let Some(victim_idx) = guard.evict_candidate() else {
                bail!(
                    "cache shard full and all pages pinned (capacity={})",
                    guard.capacity
                );
            };
            let victim = &guard.entries[victim_idx];
            if victim.is_dirty() {
                write_back(victim.page_no, &victim.data)?;
                victim.clear_dirty();
            }
            guard.remove(victim_idx);
        }

        let mut entry = CacheEntry::new(page_no, self.page_size);
        load(&mut entry.data)?;
        entry.pin();
        entry.mark_visited();
        guard.insert(entry);

        Ok(PageRef {
            cache: self,
            page_no,
        })
    }

    /// Writes every dirty page back and clears its dirty bit, stopping at the
    /// first failure (which leaves that page and all later ones dirty).
    /// Returns the number of pages written.
    pub fn flush_dirty<W>(&self, mut write_back: W) -> Result<usize>
    where
        W: FnMut(u64, &[u8]) -> Result<()>,
    {
        let mut flushed = 0;

        for shard in &self.shards {
            let guard = shard.read();
            for entry in &guard.entries {
                if entry.is_dirty() {
                    write_back(entry.page_no, &entry.data)?;
                    entry.clear_dirty();
                    flushed += 1;
                }
            }
        }

        Ok(flushed)
    }

    /// Whether any resident page is dirty.
    pub fn has_dirty(&self) -> bool {
        self.shards
            .iter()
            .any(|shard| shard.read().entries.iter().any(|e| e.is_dirty()))
    }

    /// Drops every resident page. Callers must flush first; any dirty
    /// content still resident is discarded.
    pub fn clear(&self) {
        for shard in &self.shards {
            let mut guard = shard.write();
            guard.entries.clear();
            guard.index.clear();
            guard.hand = 0;
        }
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn data(&self, page_no: u64) -> Option<&[u8]> {
        let shard = self.shard(page_no);
        let guard = shard.read();

        guard.get(page_no).map(|idx| {
            let entry = &guard.entries[idx];
            let ptr = entry.data.as_ptr();
            let len = entry.data.len();
            // SAFETY: entry.data is a boxed slice whose heap allocation never
            // moves, even when the entry itself is moved by swap_remove or a
            // Vec reallocation. The caller holds a PageRef, so the entry is
            // pinned and cannot be evicted while the returned slice is alive.
            unsafe { std::slice::from_raw_parts(ptr, len) }
        })
    }

    // SAFETY: returns a mutable reference to page data while only holding a
    // read lock on the shard. The caller must guarantee exclusive access; the
    // function is private and reached only via PageRef::data_mut, which takes
    // &mut self, so two mutable references through one guard are impossible.
    // Cross-guard exclusivity is the store's lock discipline: a writer is
    // exclusive with all readers.
    #[allow(clippy::mut_from_ref)]
    unsafe fn data_mut_unchecked(&self, page_no: u64) -> Option<&mut [u8]> {
        let shard = self.shard(page_no);
        let guard = shard.read();

        guard.get(page_no).map(|idx| {
            let entry = &guard.entries[idx];
            entry.mark_dirty();
            let ptr = entry.data.as_ptr() as *mut u8;
            let len = entry.data.len();
            // SAFETY: same stability argument as data(); exclusivity is the
            // caller's obligation per this function's contract.
            std::slice::from_raw_parts_mut(ptr, len)
        })
    }

    fn unpin(&self, page_no: u64) {
        let shard = self.shard(page_no);
        let guard = shard.read();

        if let Some(idx) = guard.get(page_no) {
            guard.entries[idx].unpin();
        }
    }
}

/// Pinned reference to a resident page; unpins on drop.
pub struct PageRef<'a> {
    cache: &'a PageCache,
    page_no: u64,
}

impl PageRef<'_> {
    pub fn page_no(&self) -> u64 {
        self.page_no
    }

    pub fn data(&self) -> &[u8] {
        self.cache.data(self.page_no).expect("pinned page evicted")
    }

    /// Mutable view of the page; marks it dirty.
    pub fn data_mut(&mut self) -> &mut [u8] {
        // SAFETY: &mut self guarantees this PageRef produces no aliasing
        // references; the page is pinned for the guard's lifetime, so the
        // buffer cannot be evicted from under the slice.
        unsafe {
            self.cache
                .data_mut_unchecked(self.page_no)
                .expect("pinned page evicted")
        }
    }
}

impl Drop for PageRef<'_> {
    fn drop(&mut self) {
        self.cache.unpin(self.page_no);
    }
}
