//! # Shared Lock Context
//!
//! The store does not acquire its own lock inside `append`/`read`/`force`/
//! `process_all`. Locking is the caller's responsibility: a [`LockContext`]
//! is created once, shared by `Arc` across every store that must be lockable
//! as one unit (e.g. a string table plus its value table), and held around
//! each logical operation.
//!
//! ## Locking Protocol
//!
//! ```text
//! lock_write() ─> append()* ─> force() ─> unlock_write()
//! lock_read()  ─> read() / check_bytes_are_the_same()* ─> unlock_read()
//! lock_write() ─> process_all() ─> unlock_write()
//! ```
//!
//! Multiple readers may run concurrently; exactly one writer runs at a time.
//! `process_all` requires the write lock even though it only reads, because it
//! must observe a fixed end offset throughout the scan.
//!
//! ## Discipline Checking
//!
//! The context tracks the active reader count and the identity of the writing
//! thread. Stores consult [`LockContext::holds_write`] and
//! [`LockContext::holds_read`] before touching data and fail loudly with a
//! lock-discipline error instead of racing. The checks are advisory: they
//! catch protocol violations, they do not replace the lock itself.
//!
//! ## Raw API and Guards
//!
//! The explicit `lock_read`/`unlock_read`/`lock_write`/`unlock_write` calls
//! mirror the store's public contract. The RAII [`ReadGuard`]/[`WriteGuard`]
//! wrappers are a convenience over the same lock; both styles interoperate.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::lock_api::RawRwLock as RawRwLockApi;
use parking_lot::RawRwLock;

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

fn current_thread_id() -> u64 {
    THREAD_ID.with(|id| *id)
}

/// Reader/writer lock shared by every store that participates in one locking
/// unit.
///
/// Not reentrant: acquiring the write lock twice from one thread deadlocks,
/// as does upgrading a held read lock to a write lock.
pub struct LockContext {
    raw: RawRwLock,
    readers: AtomicUsize,
    // Thread id of the current writer, 0 when no writer is active.
    writer: AtomicU64,
}

impl LockContext {
    pub fn new() -> Self {
        Self {
            raw: RawRwLock::INIT,
            readers: AtomicUsize::new(0),
            writer: AtomicU64::new(0),
        }
    }

    /// Acquires the shared (read) lock, blocking while a writer is active.
    pub fn lock_read(&self) {
        self.raw.lock_shared();
        self.readers.fetch_add(1, Ordering::AcqRel);
    }

    /// Releases one shared (read) hold.
    ///
    /// Must pair with a prior [`lock_read`](Self::lock_read) on the same
    /// thread; the guard API avoids getting this wrong.
    pub fn unlock_read(&self) {
        let prev = self.readers.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unlock_read without a matching lock_read");
        // SAFETY: the caller pairs this with a lock_read() that acquired the
        // shared lock on this thread, per this method's contract. The reader
        // count above is decremented first so discipline checks never observe
        // a reader that has already released the underlying lock.
        unsafe { self.raw.unlock_shared() };
    }

    /// Acquires the exclusive (write) lock, blocking until all readers and
    /// any other writer release.
    pub fn lock_write(&self) {
        self.raw.lock_exclusive();
        self.writer.store(current_thread_id(), Ordering::Release);
    }

    /// Releases the exclusive (write) lock.
    pub fn unlock_write(&self) {
        debug_assert!(
            self.holds_write(),
            "unlock_write from a thread that does not hold the write lock"
        );
        self.writer.store(0, Ordering::Release);
        // SAFETY: the caller pairs this with a lock_write() that acquired the
        // exclusive lock on this thread, per this method's contract. The
        // writer id is cleared first, while exclusivity still holds, so no
        // other thread's id can be overwritten.
        unsafe { self.raw.unlock_exclusive() };
    }

    /// Whether the calling thread currently holds the write lock.
    pub fn holds_write(&self) -> bool {
        self.writer.load(Ordering::Acquire) == current_thread_id()
    }

    /// Whether read access is currently granted: the calling thread holds the
    /// write lock, or at least one reader is active.
    ///
    /// Reader holds are not tracked per thread, so this is an advisory check:
    /// it catches "no lock at all", not a reader on thread A fronting for
    /// thread B.
    pub fn holds_read(&self) -> bool {
        self.holds_write() || self.readers.load(Ordering::Acquire) > 0
    }

    /// RAII read lock.
    pub fn read(&self) -> ReadGuard<'_> {
        self.lock_read();
        ReadGuard { lock: self }
    }

    /// RAII write lock.
    pub fn write(&self) -> WriteGuard<'_> {
        self.lock_write();
        WriteGuard { lock: self }
    }
}

impl Default for LockContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LockContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockContext")
            .field("readers", &self.readers.load(Ordering::Relaxed))
            .field("writer", &self.writer.load(Ordering::Relaxed))
            .finish()
    }
}

pub struct ReadGuard<'a> {
    lock: &'a LockContext,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock_read();
    }
}

pub struct WriteGuard<'a> {
    lock: &'a LockContext,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock_write();
    }
}
