//! Process-wide handle shared by every request task.

use crate::services::store::ObjectStore;
use axum::http::{header, request::Parts};
use std::{fmt, sync::Arc};

/// Upper bound on entries returned by a single listing.
pub const MAX_LIST_LIMIT: usize = 1000;

/// Built once at startup and cloned into each request; never mutated.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ObjectStore>,

    /// Origin used for retrieval URLs instead of the request's own.
    pub public_origin: Option<String>,

    /// `host:port` the server is bound to, used when a request names no host.
    pub bind_addr: String,

    /// Entries requested from the store per listing.
    pub list_limit: usize,
}

impl AppState {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            public_origin: None,
            bind_addr: "127.0.0.1:8787".into(),
            list_limit: MAX_LIST_LIMIT,
        }
    }

    pub fn with_public_origin(mut self, origin: Option<String>) -> Self {
        self.public_origin = origin
            .map(|o| o.trim_end_matches('/').to_string())
            .filter(|o| !o.is_empty());
        self
    }

    pub fn with_bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = addr.into();
        self
    }

    pub fn with_list_limit(mut self, limit: usize) -> Self {
        self.list_limit = limit.clamp(1, MAX_LIST_LIMIT);
        self
    }

    /// Scheme and authority that retrieval URLs are built on.
    ///
    /// Configured public origin, then the `Host` header, then the request URI
    /// authority, then the bind address.
    pub fn origin_for(&self, parts: &Parts) -> String {
        if let Some(origin) = &self.public_origin {
            return origin.clone();
        }

        let host = parts
            .headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty());
        if let Some(host) = host {
            return format!("http://{host}");
        }

        if let Some(authority) = parts.uri.authority() {
            let scheme = parts.uri.scheme_str().unwrap_or("http");
            return format!("{scheme}://{authority}");
        }

        format!("http://{}", self.bind_addr)
    }
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState")
            .field("public_origin", &self.public_origin)
            .field("bind_addr", &self.bind_addr)
            .field("list_limit", &self.list_limit)
            .finish_non_exhaustive()
    }
}
