//! src/services/disk_store.rs
//!
//! DiskStore, an object store backed by SQLite for metadata and local disk for
//! payloads. Payload files are named by a random id and sharded beneath
//! `base_path/{shard}/{shard}/{id}`, so object keys never become paths.
//!
//! A put runs in two phases. The body is streamed into a `.tmp-{id}` file in
//! the caller's future, so dropping the future abandons the upload. Once the
//! body is complete, the rename, metadata swap, and removal of the replaced
//! payload run in a tracked task that a dropped caller cannot interrupt.

use crate::{
    models::object::{ByteStream, ListingEntry, ObjectBody, ObjectRecord, PutMetadata, Written},
    services::store::{ObjectStore, StoreError, StoreResult},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use md5::Context;
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::{
    collections::HashSet,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::{io::ReaderStream, task::TaskTracker};
use tracing::{debug, info, warn};
use uuid::Uuid;

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

/// Prefix of payload files that are still being written.
const TEMP_PREFIX: &str = ".tmp-";

#[derive(Clone, Debug)]
pub struct DiskStore {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where payloads are stored.
    pub base_path: PathBuf,

    /// Commit tasks that outlive the request that started them.
    finalizers: TaskTracker,
}

/// Everything the commit phase of a put needs, owned so it can move into a
/// spawned task.
struct Finalize {
    key: String,
    payload: PendingPayload,
    payload_id: String,
    content_type: String,
    size_bytes: i64,
    etag: String,
    uploaded_at: DateTime<Utc>,
}

impl DiskStore {
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
            finalizers: TaskTracker::new(),
        }
    }

    /// Open (creating if needed) the metadata database and payload directory,
    /// apply the schema, and clear out payload files no row refers to.
    pub async fn connect(database_url: &str, base_path: impl Into<PathBuf>) -> StoreResult<Self> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path).await?;

        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        if let Some(parent) = options.get_filename().parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).await?;
                debug!("created metadata directory {}", parent.display());
            }
        }

        let db = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self::new(Arc::new(db), base_path);
        store.migrate().await?;
        store.sweep_orphans().await?;
        Ok(store)
    }

    /// Apply the embedded schema. Every statement is idempotent.
    pub async fn migrate(&self) -> StoreResult<()> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        debug!("running {} migration statements", statements.len());
        for stmt in statements {
            debug!("executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    /// Wait for every commit task that is still running.
    pub async fn close(&self) {
        self.finalizers.close();
        self.finalizers.wait().await;
    }

    /// Remove leftover `.tmp-*` files and payloads that no metadata row
    /// references. Both are left behind when the process dies mid-upload.
    async fn sweep_orphans(&self) -> StoreResult<()> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT payload_id FROM objects")
            .fetch_all(&*self.db)
            .await?;
        let referenced: HashSet<String> = ids.into_iter().collect();

        let mut removed = 0usize;
        let mut pending = vec![self.base_path.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                let name = entry.file_name();
                let name = name.to_string_lossy();
                // Only uuid-named files are payloads; anything else sharing the
                // directory (such as the metadata database) is left alone.
                let (temp, id) = match name.strip_prefix(TEMP_PREFIX) {
                    Some(id) => (true, id),
                    None => (false, &*name),
                };
                if Uuid::parse_str(id).is_err() {
                    continue;
                }
                if temp || !referenced.contains(id) {
                    match fs::remove_file(&path).await {
                        Ok(()) => removed += 1,
                        Err(err) if err.kind() == ErrorKind::NotFound => {}
                        Err(err) => warn!("failed to sweep {}: {}", path.display(), err),
                    }
                }
            }
        }

        if removed > 0 {
            info!("swept {} orphaned payload files", removed);
        }
        Ok(())
    }

    /// Two-level shard for a payload id: the first two bytes of MD5(id) as hex.
    fn payload_shards(payload_id: &str) -> (String, String) {
        let digest = md5::compute(payload_id);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn payload_path(&self, payload_id: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::payload_shards(payload_id);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(payload_id);
        path
    }

    async fn fetch_record(&self, key: &str) -> StoreResult<Option<ObjectRecord>> {
        let record = sqlx::query_as::<_, ObjectRecord>(
            "SELECT key, content_type, size_bytes, etag, payload_id, uploaded_at
             FROM objects WHERE key = ?",
        )
        .bind(key)
        .fetch_optional(&*self.db)
        .await?;
        Ok(record)
    }

    /// Stream `body` into the pending temp file, counting bytes and hashing
    /// as it goes, then fsync.
    async fn write_payload(
        &self,
        payload: &PendingPayload,
        mut body: ByteStream,
    ) -> StoreResult<(u64, String)> {
        // Created synchronously: a create still queued on the blocking pool
        // when the future is dropped would land after the guard has run.
        let file = std::fs::File::create(&payload.temp_path)?;
        let mut file = File::from_std(file);
        let mut size: u64 = 0;
        let mut digest = Context::new();

        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            size += chunk.len() as u64;
            digest.consume(&chunk);
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;

        Ok((size, format!("{:x}", digest.compute())))
    }

    /// Move the payload into place and swap the metadata row. Runs to
    /// completion even if the request that started the put has gone away.
    async fn finalize(&self, job: Finalize) -> StoreResult<()> {
        let Finalize {
            key,
            mut payload,
            payload_id,
            content_type,
            size_bytes,
            etag,
            uploaded_at,
        } = job;

        fs::rename(&payload.temp_path, &payload.final_path).await?;

        // DELETE first so the transaction takes the write lock up front.
        let mut tx = self.db.begin().await?;
        let previous: Option<String> =
            sqlx::query_scalar("DELETE FROM objects WHERE key = ? RETURNING payload_id")
                .bind(&key)
                .fetch_optional(&mut *tx)
                .await?;
        sqlx::query(
            "INSERT INTO objects (key, content_type, size_bytes, etag, payload_id, uploaded_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&key)
        .bind(&content_type)
        .bind(size_bytes)
        .bind(&etag)
        .bind(&payload_id)
        .bind(uploaded_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        payload.keep();

        if let Some(previous) = previous {
            self.remove_payload(&previous).await;
        }
        Ok(())
    }

    async fn remove_payload(&self, payload_id: &str) {
        let path = self.payload_path(payload_id);
        match fs::remove_file(&path).await {
            Ok(()) => debug!("removed replaced payload {}", path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("replaced payload {} already missing", path.display());
            }
            Err(err) => debug!("failed to remove payload {}: {}", path.display(), err),
        }
    }

    /// `Ok(None)` when the payload file does not exist.
    async fn open_payload(&self, payload_id: &str) -> StoreResult<Option<File>> {
        let path = self.payload_path(payload_id);
        match File::open(&path).await {
            Ok(file) => Ok(Some(file)),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("payload {} is gone", path.display());
                Ok(None)
            }
            Err(err) => Err(StoreError::Io(err)),
        }
    }

    /// Open the payload `record` points at. A replace can remove that payload
    /// between the lookup and the open; the row is then read again once and
    /// the current payload opened instead.
    async fn open_object(
        &self,
        key: &str,
        record: ObjectRecord,
    ) -> StoreResult<Option<ObjectBody>> {
        let (record, file) = match self.open_payload(&record.payload_id).await? {
            Some(file) => (record, file),
            None => {
                let Some(fresh) = self.fetch_record(key).await? else {
                    return Ok(None);
                };
                if fresh.payload_id == record.payload_id {
                    warn!("object `{}` has no payload on disk", key);
                    return Ok(None);
                }
                match self.open_payload(&fresh.payload_id).await? {
                    Some(file) => (fresh, file),
                    None => return Ok(None),
                }
            }
        };

        let size = u64::try_from(record.size_bytes).map_err(|_| StoreError::Corrupt {
            key: key.to_string(),
            reason: format!("negative size {}", record.size_bytes),
        })?;

        Ok(Some(ObjectBody {
            body: ReaderStream::new(file).boxed(),
            content_type: record.content_type,
            etag: record.etag,
            size,
            uploaded_at: record.uploaded_at,
        }))
    }
}

#[async_trait]
impl ObjectStore for DiskStore {
    /// Upsert semantics: the metadata row for `key` is swapped inside one
    /// transaction, and the replaced payload file is removed after commit.
    async fn put(
        &self,
        key: &str,
        body: ByteStream,
        metadata: PutMetadata,
    ) -> StoreResult<Written> {
        let payload_id = Uuid::new_v4().to_string();
        let final_path = self.payload_path(&payload_id);
        let parent = final_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StoreError::Io(io::Error::other("payload path missing parent directory"))
        })?;
        fs::create_dir_all(&parent).await?;

        let payload = PendingPayload::new(
            parent.join(format!("{TEMP_PREFIX}{payload_id}")),
            final_path,
        );
        let (size, etag) = self.write_payload(&payload, body).await?;
        let size_bytes = i64::try_from(size).map_err(|_| StoreError::Corrupt {
            key: key.to_string(),
            reason: format!("size {size} exceeds the metadata column range"),
        })?;
        let uploaded_at = Utc::now();

        let job = Finalize {
            key: key.to_string(),
            payload,
            payload_id,
            content_type: metadata.content_type,
            size_bytes,
            etag: etag.clone(),
            uploaded_at,
        };
        let store = self.clone();
        self.finalizers
            .spawn(async move { store.finalize(job).await })
            .await
            .map_err(|err| StoreError::Io(io::Error::other(err)))??;

        Ok(Written {
            key: key.to_string(),
            size,
            etag,
            uploaded_at,
        })
    }

    async fn get(&self, key: &str) -> StoreResult<Option<ObjectBody>> {
        match self.fetch_record(key).await? {
            Some(record) => self.open_object(key, record).await,
            None => Ok(None),
        }
    }

    async fn list(&self, limit: usize) -> StoreResult<Vec<ListingEntry>> {
        let rows = sqlx::query_as::<_, ObjectRecord>(
            "SELECT key, content_type, size_bytes, etag, payload_id, uploaded_at
             FROM objects ORDER BY key ASC LIMIT ?",
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.db)
        .await?;

        rows.into_iter()
            .map(|row| {
                let size = u64::try_from(row.size_bytes).map_err(|_| StoreError::Corrupt {
                    key: row.key.clone(),
                    reason: format!("negative size {}", row.size_bytes),
                })?;
                Ok(ListingEntry {
                    key: row.key,
                    size,
                    uploaded_at: row.uploaded_at,
                })
            })
            .collect()
    }
}

/// Payload file that has not been committed yet.
///
/// Until `keep` is called, dropping the guard removes both the temp file and
/// the renamed file, whichever exists. An upload that fails, or whose request
/// future is dropped before the commit phase starts, leaves nothing behind.
struct PendingPayload {
    temp_path: PathBuf,
    final_path: PathBuf,
    committed: bool,
}

impl PendingPayload {
    fn new(temp_path: PathBuf, final_path: PathBuf) -> Self {
        Self {
            temp_path,
            final_path,
            committed: false,
        }
    }

    fn keep(&mut self) {
        self.committed = true;
    }
}

impl Drop for PendingPayload {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        for path in [&self.temp_path, &self.final_path] {
            match std::fs::remove_file(path) {
                Ok(()) => debug!("discarded uncommitted payload {}", path.display()),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => debug!(
                    "failed to discard uncommitted payload {}: {}",
                    path.display(),
                    err
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::{TryStreamExt, stream};
    use std::{
        sync::atomic::{AtomicBool, Ordering},
        task::Poll,
    };
    use tempfile::TempDir;

    async fn open_store() -> (DiskStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}", dir.path().join("meta/gateway.db").display());
        let store = DiskStore::connect(&url, dir.path().join("objects"))
            .await
            .unwrap();
        (store, dir)
    }

    fn chunks(parts: &[&'static [u8]]) -> ByteStream {
        let items: Vec<io::Result<Bytes>> =
            parts.iter().map(|p| Ok(Bytes::from_static(p))).collect();
        stream::iter(items).boxed()
    }

    async fn read_all(body: ObjectBody) -> Vec<u8> {
        body.body
            .try_fold(Vec::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok(acc)
            })
            .await
            .unwrap()
    }

    fn payload_files(root: &Path) -> Vec<PathBuf> {
        let mut found = Vec::new();
        let mut pending = vec![root.to_path_buf()];
        while let Some(dir) = pending.pop() {
            for entry in std::fs::read_dir(&dir).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    pending.push(path);
                } else {
                    found.push(path);
                }
            }
        }
        found
    }

    /// Wait for commit tasks left running by dropped puts.
    async fn settle(store: &DiskStore) {
        store.finalizers.close();
        store.finalizers.wait().await;
        store.finalizers.reopen();
    }

    /// Every payload file on disk belongs to a row, and every row can be read.
    async fn assert_rows_match_payloads(store: &DiskStore) {
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT key, payload_id FROM objects")
            .fetch_all(&*store.db)
            .await
            .unwrap();
        let expected: HashSet<PathBuf> = rows
            .iter()
            .map(|(_, payload_id)| store.payload_path(payload_id))
            .collect();
        let on_disk: HashSet<PathBuf> = payload_files(&store.base_path).into_iter().collect();
        assert_eq!(on_disk, expected);

        for (key, _) in &rows {
            assert!(
                store.get(key).await.unwrap().is_some(),
                "row `{key}` has no payload"
            );
        }
    }

    /// `hello` in two chunks; `exhausted` flips once the stream has ended.
    fn tracked_body(exhausted: Arc<AtomicBool>) -> ByteStream {
        chunks(&[b"hel", b"lo"])
            .chain(stream::poll_fn(move |_| {
                exhausted.store(true, Ordering::SeqCst);
                Poll::Ready(None)
            }))
            .boxed()
    }

    #[tokio::test]
    async fn put_then_get_streams_payload_back() {
        let (store, _dir) = open_store().await;
        let written = store
            .put(
                "notes/a.txt",
                chunks(&[b"hel", b"lo"]),
                PutMetadata {
                    content_type: "text/plain".into(),
                },
            )
            .await
            .unwrap();

        assert_eq!(written.size, 5);
        assert_eq!(written.etag, format!("{:x}", md5::compute(b"hello")));

        let object = store.get("notes/a.txt").await.unwrap().unwrap();
        assert_eq!(object.content_type, "text/plain");
        assert_eq!(object.size, 5);
        assert_eq!(object.etag, written.etag);
        assert_eq!(read_all(object).await, b"hello");
    }

    #[tokio::test]
    async fn replacing_a_key_removes_the_old_payload() {
        let (store, dir) = open_store().await;
        store
            .put("k", chunks(&[b"first"]), PutMetadata::default())
            .await
            .unwrap();
        store
            .put("k", chunks(&[b"second!"]), PutMetadata::default())
            .await
            .unwrap();

        let object = store.get("k").await.unwrap().unwrap();
        assert_eq!(object.size, 7);
        assert_eq!(read_all(object).await, b"second!");
        assert_eq!(payload_files(&dir.path().join("objects")).len(), 1);
    }

    #[tokio::test]
    async fn failed_stream_leaves_no_payload_and_keeps_previous_object() {
        let (store, dir) = open_store().await;
        store
            .put("k", chunks(&[b"kept"]), PutMetadata::default())
            .await
            .unwrap();

        let broken: ByteStream = stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::new(ErrorKind::ConnectionReset, "client went away")),
        ])
        .boxed();
        let err = store
            .put("k", broken, PutMetadata::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));

        let object = store.get("k").await.unwrap().unwrap();
        assert_eq!(read_all(object).await, b"kept");
        assert_eq!(payload_files(&dir.path().join("objects")).len(), 1);
    }

    #[tokio::test]
    async fn missing_key_is_none() {
        let (store, _dir) = open_store().await;
        assert!(store.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_respects_limit() {
        let (store, _dir) = open_store().await;
        for key in ["c", "a", "b"] {
            store
                .put(key, chunks(&[b"xy"]), PutMetadata::default())
                .await
                .unwrap();
        }

        let entries = store.list(2).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.size == 2));

        let all = store.list(1000).await.unwrap();
        let mut keys: Vec<_> = all.into_iter().map(|e| e.key).collect();
        keys.sort();
        assert_eq!(keys, ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn dropping_a_put_at_any_point_keeps_rows_and_payloads_in_step() {
        let (store, _dir) = open_store().await;
        store
            .put("k", chunks(&[b"original"]), PutMetadata::default())
            .await
            .unwrap();

        let mut dropped_after_body = 0;
        let mut completed = false;
        for polls in 0..10_000 {
            let exhausted = Arc::new(AtomicBool::new(false));
            let mut put = store.put("k", tracked_body(exhausted.clone()), PutMetadata::default());
            let mut finished = false;
            for _ in 0..polls {
                if let Poll::Ready(result) = futures::poll!(&mut put) {
                    result.unwrap();
                    finished = true;
                    break;
                }
                tokio::task::yield_now().await;
            }
            drop(put);
            if !finished && exhausted.load(Ordering::SeqCst) {
                dropped_after_body += 1;
            }

            settle(&store).await;
            assert_rows_match_payloads(&store).await;

            if finished {
                completed = true;
                break;
            }
        }

        assert!(completed, "put never completed");
        assert!(dropped_after_body > 0, "no drop landed after the body ended");
        let object = store.get("k").await.unwrap().unwrap();
        assert_eq!(read_all(object).await, b"hello");
    }

    #[tokio::test]
    async fn read_racing_a_replace_opens_the_current_payload() {
        let (store, _dir) = open_store().await;
        store
            .put("k", chunks(&[b"v1"]), PutMetadata::default())
            .await
            .unwrap();
        let stale = store.fetch_record("k").await.unwrap().unwrap();
        store
            .put("k", chunks(&[b"v2!"]), PutMetadata::default())
            .await
            .unwrap();

        let object = store.open_object("k", stale).await.unwrap().unwrap();
        assert_eq!(object.size, 3);
        assert_eq!(read_all(object).await, b"v2!");
    }

    #[tokio::test]
    async fn row_whose_payload_vanished_reads_as_missing() {
        let (store, _dir) = open_store().await;
        store
            .put("k", chunks(&[b"data"]), PutMetadata::default())
            .await
            .unwrap();
        let record = store.fetch_record("k").await.unwrap().unwrap();
        std::fs::remove_file(store.payload_path(&record.payload_id)).unwrap();

        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn connect_sweeps_payload_files_no_row_references() {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}", dir.path().join("meta/gateway.db").display());
        let objects = dir.path().join("objects");

        let store = DiskStore::connect(&url, &objects).await.unwrap();
        store
            .put("kept", chunks(&[b"data"]), PutMetadata::default())
            .await
            .unwrap();

        let stray = store.payload_path(&Uuid::new_v4().to_string());
        std::fs::create_dir_all(stray.parent().unwrap()).unwrap();
        std::fs::write(&stray, b"orphan").unwrap();
        let temp = stray.with_file_name(format!("{TEMP_PREFIX}{}", Uuid::new_v4()));
        std::fs::write(&temp, b"partial").unwrap();
        let unrelated = objects.join("README");
        std::fs::write(&unrelated, b"not a payload").unwrap();

        store.close().await;
        store.db.close().await;
        drop(store);

        let store = DiskStore::connect(&url, &objects).await.unwrap();
        assert!(!stray.exists());
        assert!(!temp.exists());
        assert!(unrelated.exists());
        let object = store.get("kept").await.unwrap().unwrap();
        assert_eq!(read_all(object).await, b"data");
    }
}
