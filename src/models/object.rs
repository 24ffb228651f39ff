//! Represents an object (file) held by the backing store and the views the
//! gateway exposes of it.

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::stream::BoxStream;
use serde::Serialize;
use sqlx::FromRow;
use std::{fmt, io};

/// Content type recorded when the uploader does not supply one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// A body flowing between the HTTP layer and the store, one chunk at a time.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Metadata row for a stored object, as persisted by the disk store.
///
/// The row describes the object; the payload bytes live in a separate file
/// named by `payload_id`.
#[derive(Clone, FromRow, Debug)]
pub struct ObjectRecord {
    /// Caller-supplied key, unique across the store.
    pub key: String,

    /// MIME type captured at upload time.
    pub content_type: String,

    /// Size in bytes, as counted while streaming the payload in.
    pub size_bytes: i64,

    /// Hex MD5 of the payload.
    pub etag: String,

    /// Random identifier of the payload file on disk.
    pub payload_id: String,

    /// Timestamp assigned by the store at write time.
    pub uploaded_at: DateTime<Utc>,
}

/// Metadata attached to an object on write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PutMetadata {
    pub content_type: String,
}

impl Default for PutMetadata {
    fn default() -> Self {
        Self {
            content_type: DEFAULT_CONTENT_TYPE.into(),
        }
    }
}

/// Store confirmation of a completed write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Written {
    pub key: String,
    pub size: u64,
    pub etag: String,
    pub uploaded_at: DateTime<Utc>,
}

/// A readable object: metadata plus a lazily consumed body.
pub struct ObjectBody {
    pub body: ByteStream,
    pub content_type: String,
    pub etag: String,
    pub size: u64,
    pub uploaded_at: DateTime<Utc>,
}

impl fmt::Debug for ObjectBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectBody")
            .field("content_type", &self.content_type)
            .field("etag", &self.etag)
            .field("size", &self.size)
            .field("uploaded_at", &self.uploaded_at)
            .finish_non_exhaustive()
    }
}

/// Metadata-only projection of an object returned by listings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListingEntry {
    pub key: String,
    pub size: u64,
    pub uploaded_at: DateTime<Utc>,
}

/// JSON shape of one entry in `GET /files`.
#[derive(Serialize, Debug, PartialEq, Eq)]
pub struct FileSummary {
    pub key: String,
    pub size: u64,
    /// ISO-8601 with millisecond precision, e.g. `2025-01-31T09:30:00.000Z`.
    pub uploaded: String,
}

impl From<ListingEntry> for FileSummary {
    fn from(entry: ListingEntry) -> Self {
        Self {
            key: entry.key,
            size: entry.size,
            uploaded: entry
                .uploaded_at
                .to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}

/// JSON body returned by a successful `POST /upload`.
#[derive(Serialize, Debug, PartialEq, Eq)]
pub struct UploadReceipt {
    pub key: String,
    pub url: String,
    /// Echo of the client's `Content-Length` hint. Display only.
    pub size: u64,
}
