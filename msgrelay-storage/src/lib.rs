//! # msgrelay-storage
//!
//! Storage layer for msgrelay.
//!
//! This crate provides:
//! - The [`RelayStore`] interface used by request handlers
//! - Client records with unique names
//! - Per-target message queues with monotonically increasing message ids
//! - Optional on-disk persistence: a checksummed mutation journal folded
//!   into periodic snapshots

pub mod error;
mod journal;
pub mod record;
pub mod store;

pub use error::StorageError;
pub use record::{ClientRecord, NewMessage, QueuedMessage};
pub use store::{RelayStore, Storage, StoreStats, DEFAULT_COMPACT_THRESHOLD};
