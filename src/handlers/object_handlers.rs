//! HTTP handlers for object operations.
//! Streams object bodies in both directions to avoid buffering them in
//! memory and delegates storage concerns to the shared `ObjectStore`.

use crate::{
    errors::GatewayError,
    models::object::{DEFAULT_CONTENT_TYPE, FileSummary, ObjectBody, PutMetadata, UploadReceipt},
    routes::route::file_path,
    state::AppState,
};
use axum::{
    Json,
    body::{Body, HttpBody as _},
    http::{HeaderMap, HeaderValue, StatusCode, header, request::Parts},
    response::Response,
};
use futures::{StreamExt, TryStreamExt};
use std::io;
use tracing::{debug, info, warn};

/// Header carrying the object key for uploads.
pub const FILENAME_HEADER: &str = "x-filename";

const NO_FILE_PROVIDED: &str = "No file provided";

/// `POST /upload`: stream the request body into the store under `X-Filename`.
///
/// Preconditions are checked before the store is touched. The `size` in the
/// receipt is the client's `Content-Length` hint, not the stored byte count.
pub async fn upload_object(
    state: &AppState,
    parts: &Parts,
    body: Body,
) -> Result<Json<UploadReceipt>, GatewayError> {
    let key = filename(&parts.headers)?.ok_or_else(|| GatewayError::invalid(NO_FILE_PROVIDED))?;
    if body.is_end_stream() {
        return Err(GatewayError::invalid(NO_FILE_PROVIDED));
    }

    let content_type = parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_CONTENT_TYPE)
        .to_string();
    let size_hint = parts
        .headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(0);

    let stream = body.into_data_stream().map_err(io::Error::other).boxed();
    let written = state
        .store
        .put(&key, stream, PutMetadata { content_type })
        .await?;

    if size_hint != 0 && size_hint != written.size {
        warn!(
            "upload `{}` declared {} bytes but {} were stored",
            key, size_hint, written.size
        );
    }
    info!(key = %key, size = written.size, etag = %written.etag, "stored object");

    let url = format!("{}{}", state.origin_for(parts), file_path(&key));
    Ok(Json(UploadReceipt {
        key,
        url,
        size: size_hint,
    }))
}

/// `GET /files`: one page of listing entries, no pagination.
pub async fn list_objects(state: &AppState) -> Result<Json<Vec<FileSummary>>, GatewayError> {
    let entries = state.store.list(state.list_limit).await?;
    debug!("listed {} objects (limit {})", entries.len(), state.list_limit);
    Ok(Json(entries.into_iter().map(FileSummary::from).collect()))
}

/// `GET /files/{key}`: stream the stored body back unmodified.
pub async fn read_object(state: &AppState, key: &str) -> Result<Response, GatewayError> {
    let object = state.store.get(key).await?.ok_or(GatewayError::NotFound)?;
    debug!("serving `{}` ({} bytes)", key, object.size);

    let mut headers = HeaderMap::new();
    set_object_headers(&mut headers, &object);

    let mut response = Response::new(Body::from_stream(object.body));
    *response.status_mut() = StatusCode::OK;
    *response.headers_mut() = headers;
    Ok(response)
}

/// `X-Filename`, if present and non-empty. Non-UTF-8 bytes are rejected.
fn filename(headers: &HeaderMap) -> Result<Option<String>, GatewayError> {
    let Some(value) = headers.get(FILENAME_HEADER) else {
        return Ok(None);
    };
    let name = std::str::from_utf8(value.as_bytes())
        .map_err(|_| GatewayError::invalid("X-Filename is not valid UTF-8"))?;
    Ok(Some(name.to_string()).filter(|n| !n.is_empty()))
}

fn set_object_headers(headers: &mut HeaderMap, object: &ObjectBody) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&object.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static(DEFAULT_CONTENT_TYPE)),
    );

    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(object.size));

    let quoted = format!("\"{}\"", object.etag);
    if let Ok(value) = HeaderValue::from_str(&quoted) {
        headers.insert(header::ETAG, value);
    }

    let last_modified = object
        .uploaded_at
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string();
    if let Ok(value) = HeaderValue::from_str(&last_modified) {
        headers.insert(header::LAST_MODIFIED, value);
    }
}
