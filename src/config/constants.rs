//! # Configuration Constants
//!
//! This module centralizes all configuration constants, grouping interdependent
//! values together and documenting their relationships. Constants that depend
//! on each other are co-located to prevent mismatch bugs.
//!
//! ## Dependency Graph
//!
//! ```text
//! DEFAULT_PAGE_SIZE (1024 bytes)
//!       │
//!       ├─> must be a power of two: page addressing uses offset / page_size
//!       │   and offset % page_size on every read and write
//!       │
//!       └─> DEFAULT_INITIAL_PAGES (4)
//!             Fresh backing files are sized to this many pages; growth
//!             doubles from there, so a too-small value only costs remaps.
//!
//! CACHE_SHARD_COUNT (16)
//!       │
//!       └─> DEFAULT_CACHE_PAGES (256) and any caller-supplied cache capacity
//!             must be >= CACHE_SHARD_COUNT, or some shards get zero slots
//!             and every page load on them fails.
//!
//! LENGTH_PREFIX_SIZE (4 bytes)
//!       │
//!       └─> Shared by StringCodec and BytesCodec: u32-LE payload length.
//!           A record's maximum payload is u32::MAX bytes.
//! ```
//!
//! ## Critical Invariants
//!
//! These invariants are enforced by compile-time assertions below:
//!
//! 1. `DEFAULT_PAGE_SIZE` is a power of two (page index arithmetic)
//! 2. `DEFAULT_CACHE_PAGES >= CACHE_SHARD_COUNT` (no zero-capacity shards)
//! 3. `DEFAULT_INITIAL_PAGES >= 1` (mapping a zero-length file is invalid)

/// Default size of one page, in bytes.
///
/// Callers can override this per store; the override must be a power of two.
/// 1 KiB suits the variable-length record workloads this store is built for:
/// typical records span a handful of bytes up to a few pages.
pub const DEFAULT_PAGE_SIZE: usize = 1024;

/// Number of independent shards in the page cache.
///
/// Each shard has its own `RwLock`, so concurrent readers touching different
/// pages rarely contend.
pub const CACHE_SHARD_COUNT: usize = 16;

/// Default page-cache capacity, in pages.
///
/// 256 pages at the default page size is 256 KiB of cached data per store.
pub const DEFAULT_CACHE_PAGES: usize = 256;

/// Smallest admissible page-cache capacity: one slot per shard.
pub const MIN_CACHE_PAGES: usize = CACHE_SHARD_COUNT;

/// Number of pages a fresh backing file is created with.
pub const DEFAULT_INITIAL_PAGES: u64 = 4;

/// Default capacity of the decoded-value read cache, in entries.
///
/// Zero disables the cache entirely.
pub const DEFAULT_VALUE_CACHE_CAPACITY: usize = 128;

/// Extension of the sidecar file holding the store's logical length.
///
/// The backing file is sized in whole pages, so the logical end of the last
/// record usually sits inside the last page. The sidecar (`<path>.len`,
/// 8 bytes LE) records it across restarts.
pub const LENGTH_SIDECAR_EXTENSION: &str = "len";

/// Size of the u32-LE length prefix used by the length-prefixed codecs.
pub const LENGTH_PREFIX_SIZE: usize = 4;

const _: () = assert!(
    DEFAULT_PAGE_SIZE.is_power_of_two(),
    "DEFAULT_PAGE_SIZE must be a power of two"
);
const _: () = assert!(
    DEFAULT_CACHE_PAGES >= CACHE_SHARD_COUNT,
    "DEFAULT_CACHE_PAGES must provide at least one slot per cache shard"
);
const _: () = assert!(
    DEFAULT_INITIAL_PAGES >= 1,
    "DEFAULT_INITIAL_PAGES must be at least 1"
);
