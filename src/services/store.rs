//! The object store contract the gateway is written against.
//!
//! Implementations must be safe to share across concurrently running request
//! tasks; the gateway holds a single `Arc<dyn ObjectStore>` for the lifetime
//! of the process and never serializes access to it.

use crate::models::object::{ByteStream, ListingEntry, ObjectBody, PutMetadata, Written};
use async_trait::async_trait;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("stored object `{key}` is inconsistent: {reason}")]
    Corrupt { key: String, reason: String },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Key to blob mapping with streaming reads and writes.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Write `body` under `key`, replacing any existing object.
    ///
    /// The body is pulled chunk by chunk; an error from the stream aborts the
    /// write and leaves the previous object (if any) in place.
    async fn put(&self, key: &str, body: ByteStream, metadata: PutMetadata)
    -> StoreResult<Written>;

    /// Open `key` for reading. `Ok(None)` when no such object exists.
    async fn get(&self, key: &str) -> StoreResult<Option<ObjectBody>>;

    /// Return at most `limit` entries, in store-defined order.
    async fn list(&self, limit: usize) -> StoreResult<Vec<ListingEntry>>;
}
