//! # chatterlink-store
//!
//! Persistence collaborators for a Chatterlink node: a namespaced key-value
//! store (in memory or SQLite) and a content-addressed blob store (in memory
//! or on disk). The core only ever hands these already-encrypted values or
//! public data.

pub mod blobs;
pub mod database;
pub mod kv;
pub mod migrations;

mod error;

pub use blobs::{content_id, BlobStore, ContentId, FsBlobStore, MemoryBlobStore};
pub use database::SqliteStore;
pub use error::{Result, StoreError};
pub use kv::{KeyValueStore, MemoryStore, DEFAULT_NAMESPACE};
