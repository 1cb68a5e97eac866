//! # appendstore - Append-Only, Offset-Addressed Object Store
//!
//! A durable building block for on-disk enumerators and indexes: append a
//! variable-length encoded value, get back the byte offset where it was
//! written, and use that offset as the record's permanent identity for reads,
//! byte-level comparisons, and ordered full scans.
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use appendstore::{LockContext, StoreBuilder, StringCodec};
//!
//! let lock = Arc::new(LockContext::new());
//! let store = StoreBuilder::new()
//!     .path("./names.bin")
//!     .lock_context(Arc::clone(&lock))
//!     .open_mapped(StringCodec)?;
//!
//! store.lock_write();
//! let offset = store.append(&"alice".to_string())?;
//! store.force()?;
//! store.unlock_write();
//!
//! store.lock_read();
//! assert_eq!(store.read(offset, false)?, "alice");
//! store.unlock_read();
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │         AppendStore (public contract)       │
//! │  append / read / check / force / scan       │
//! ├──────────────────────┬─────────────────────┤
//! │  Codec (per value    │  LockContext        │
//! │  type, pluggable)    │  (caller-held RW)   │
//! ├──────────────────────┴─────────────────────┤
//! │        ByteStorage (backend trait)          │
//! ├──────────────────────┬─────────────────────┤
//! │  MappedStorage       │  ShardedPageStorage │
//! │  (resizable mmap,    │  (SIEVE page cache, │
//! │   one RwLock)        │   positioned I/O)   │
//! └──────────────────────┴─────────────────────┘
//! ```
//!
//! The two storage backends are interchangeable: same contract, same test
//! suite, different physical strategies. The mapped backend is the simple
//! one, a single reader/writer lock around a growable memory mapping. The
//! sharded backend serves cache hits under per-shard locks, so the common
//! read path never touches a global mutex.
//!
//! ## Locking Discipline
//!
//! The store never locks internally. Callers hold the shared [`LockContext`]
//! around each logical operation (write lock for `append`/`force`/
//! `process_all`, read lock for `read`/`check_bytes_are_the_same`), which
//! keeps several related stores (a string table plus its value table, say)
//! lockable as one atomic unit. Discipline violations fail loudly with a
//! dedicated error class instead of racing.
//!
//! ## What This Is Not
//!
//! No transactions, no write-ahead log, no compaction, no replication, no
//! record deletion. The store is a single-file, single-process (but
//! multi-thread) durable append log with random-access read-back; anything
//! richer belongs in a layer above.
//!
//! ## Module Overview
//!
//! - [`store`]: the append store and its builder
//! - [`storage`]: byte-level backends and the page cache
//! - [`codec`]: value codec trait and built-in codecs
//! - [`lock`]: the shared lock context
//! - [`error`]: error taxonomy
//! - [`config`]: centralized constants

pub mod codec;
pub mod config;
pub mod error;
pub mod lock;
pub mod storage;
pub mod store;

pub use codec::{BytesCodec, Codec, Decoded, StringCodec, U64Codec};
pub use error::StorageError;
pub use lock::LockContext;
pub use storage::{ByteStorage, MappedStorage, ShardedPageStorage};
pub use store::{AppendStore, MappedAppendStore, PagedAppendStore, StoreBuilder};
