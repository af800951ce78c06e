//! Ordered key-value façade over an embedded LSM-tree engine.
//!
//! This crate wraps a [fjall](https://docs.rs/fjall) keyspace behind the small
//! surface the pivot layer needs: point reads, ordered forward iteration from
//! a seek position, and atomic write batches. Keys and values are arbitrary
//! byte sequences; ordering is plain byte comparison.

mod store;

pub use store::{StoreBatch, StoreConnection, StoreError, StoreIterator, StoreOptions};
