//! # Storage Layer
//!
//! The storage layer presents a flat, growable, byte-addressable space over a
//! single backing file. Two interchangeable backends implement the same
//! [`ByteStorage`] contract:
//!
//! - [`MappedStorage`]: a resizable memory-mapped file guarded by one
//!   reader/writer lock. Straightforward; serializes all physical writers and
//!   blocks physical readers during growth.
//! - [`ShardedPageStorage`]: a page cache over positioned file I/O. Pages load
//!   on demand, mutate in cache, and write back on flush or eviction. The
//!   common read path takes only a per-shard lock, so readers touching
//!   different pages do not contend.
//!
//! The two must be behaviorally indistinguishable from the caller's
//! perspective; the store's shared test suite runs every property against
//! both.
//!
//! ## Division of Responsibility
//!
//! The storage layer owns bytes, not records. It has no notion of "the next
//! append position"; that invariant belongs to the store built on top. Reads
//! and writes may span page boundaries; writes beyond the current physical
//! size grow the file in whole pages.
//!
//! ## Physical vs Logical Size
//!
//! Backing files are sized in whole pages, so [`ByteStorage::len`] (the
//! physical size) usually exceeds the store's logical end offset. The store
//! persists the logical end separately; the storage layer never interprets
//! the bytes it holds.
//!
//! ## Module Organization
//!
//! - `mmap`: memory-mapped backend (`MappedStorage`)
//! - `cache`: sharded SIEVE page cache with dirty tracking (`PageCache`)
//! - `paged`: page-cache backend (`ShardedPageStorage`)

mod cache;
mod mmap;
mod paged;

pub use cache::{PageCache, PageRef};
pub use mmap::MappedStorage;
pub use paged::ShardedPageStorage;

use eyre::Result;

/// Byte-level collaborator interface both backends expose to the store.
///
/// All operations are synchronous and internally synchronized: `&self`
/// methods may be called from any thread. The *logical* reader/writer
/// protocol (who may append, who may scan) is enforced above this trait by
/// the store's lock discipline, not here.
pub trait ByteStorage: Send + Sync {
    /// Fills `buf` with the bytes at `offset..offset + buf.len()`.
    ///
    /// The range may span page boundaries. Reading beyond the physical length
    /// is an error.
    fn read_into(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Writes `bytes` at `offset`, growing the file if the range extends past
    /// the current physical length.
    fn write_bytes(&self, offset: u64, bytes: &[u8]) -> Result<()>;

    /// Current physical length in bytes; always a whole number of pages.
    fn len(&self) -> u64;

    /// Writes all buffered modifications back to the backing file.
    ///
    /// A failed flush leaves the affected pages dirty so a retry loses
    /// nothing.
    fn flush(&self) -> Result<()>;

    /// Flushes, then releases the mapping and file handle. Every later
    /// operation fails with a closed-storage error.
    fn close(&self) -> Result<()>;

    /// The page size this storage was opened with.
    fn page_size(&self) -> usize;
}
