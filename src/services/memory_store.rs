//! In-process object store. Objects live in a `BTreeMap`, so listings come
//! back in key order.

use crate::{
    models::object::{ByteStream, ListingEntry, ObjectBody, PutMetadata, Written},
    services::store::{ObjectStore, StoreResult},
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::{StreamExt, stream};
use md5::Context;
use std::{collections::BTreeMap, io, sync::Arc};
use tokio::sync::RwLock;

/// Size of the chunks a stored object is read back in.
const READ_CHUNK: usize = 64 * 1024;

#[derive(Clone, Debug)]
struct StoredBlob {
    data: Bytes,
    content_type: String,
    etag: String,
    uploaded_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    objects: Arc<RwLock<BTreeMap<String, StoredBlob>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put(
        &self,
        key: &str,
        mut body: ByteStream,
        metadata: PutMetadata,
    ) -> StoreResult<Written> {
        let mut data = BytesMut::new();
        let mut digest = Context::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            digest.consume(&chunk);
            data.extend_from_slice(&chunk);
        }

        // The map is only touched once the body is complete, so a failed
        // stream never replaces the current object.
        let blob = StoredBlob {
            data: data.freeze(),
            content_type: metadata.content_type,
            etag: format!("{:x}", digest.compute()),
            uploaded_at: Utc::now(),
        };
        let written = Written {
            key: key.to_string(),
            size: blob.data.len() as u64,
            etag: blob.etag.clone(),
            uploaded_at: blob.uploaded_at,
        };
        self.objects.write().await.insert(key.to_string(), blob);
        Ok(written)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<ObjectBody>> {
        let Some(blob) = self.objects.read().await.get(key).cloned() else {
            return Ok(None);
        };

        let data = blob.data;
        let size = data.len() as u64;
        let chunks = (0..data.len()).step_by(READ_CHUNK).map(move |start| {
            let end = (start + READ_CHUNK).min(data.len());
            Ok::<_, io::Error>(data.slice(start..end))
        });

        Ok(Some(ObjectBody {
            body: stream::iter(chunks).boxed(),
            content_type: blob.content_type,
            etag: blob.etag,
            size,
            uploaded_at: blob.uploaded_at,
        }))
    }

    async fn list(&self, limit: usize) -> StoreResult<Vec<ListingEntry>> {
        let objects = self.objects.read().await;
        Ok(objects
            .iter()
            .take(limit)
            .map(|(key, blob)| ListingEntry {
                key: key.clone(),
                size: blob.data.len() as u64,
                uploaded_at: blob.uploaded_at,
            })
            .collect())
    }
}
