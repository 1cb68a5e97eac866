//! # Configuration Module
//!
//! This module centralizes all configuration constants for the store. Constants
//! are grouped by their functional area and interdependencies are documented
//! and enforced through compile-time assertions.
//!
//! ## Why Centralization?
//!
//! Scattered constants across multiple files lead to bugs where interdependent
//! values become mismatched. For example, the default page-cache capacity must
//! never drop below the cache shard count or some shards end up with zero
//! capacity and every load on them fails. By co-locating these constants and
//! adding compile-time checks, such mismatches are caught at build time.
//!
//! ## Module Organization
//!
//! - [`constants`]: All numeric configuration values with dependency documentation

pub mod constants;
pub use constants::*;
