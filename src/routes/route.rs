//! Request classification. A request is resolved to exactly one [`Route`]
//! before any handler runs.

use crate::errors::GatewayError;
use axum::http::Method;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};

/// Prefix under which stored objects are served.
pub const FILES_PREFIX: &str = "/files/";

/// Characters left alone when a key is embedded in a URL: ASCII
/// alphanumerics plus `- _ . ! ~ * ' ( )`.
const KEY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Route {
    /// `GET /`
    Index,
    /// `POST /upload`
    Upload,
    /// `GET /files`
    List,
    /// `GET /files/{key}`, key already percent-decoded.
    Read { key: String },
    /// Anything else.
    NotFound,
}

impl Route {
    /// Match on method and raw (still percent-encoded) path.
    ///
    /// Fails only when a `/files/` tail does not decode to UTF-8.
    pub fn resolve(method: &Method, path: &str) -> Result<Self, GatewayError> {
        let route = match (method, path) {
            (&Method::GET, "/") => Self::Index,
            (&Method::POST, "/upload") => Self::Upload,
            (&Method::GET, "/files") => Self::List,
            (&Method::GET, _) => match path.strip_prefix(FILES_PREFIX) {
                Some(tail) => Self::Read {
                    key: decode_key(tail)?,
                },
                None => Self::NotFound,
            },
            _ => Self::NotFound,
        };
        Ok(route)
    }
}

/// Percent-encode `key` for use as a single URL path segment.
pub fn encode_key(key: &str) -> String {
    utf8_percent_encode(key, KEY_ENCODE_SET).to_string()
}

/// Path to the retrieval endpoint for `key`.
pub fn file_path(key: &str) -> String {
    format!("{}{}", FILES_PREFIX, encode_key(key))
}

fn decode_key(raw: &str) -> Result<String, GatewayError> {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|key| key.into_owned())
        .map_err(|_| GatewayError::invalid("key is not valid UTF-8 after percent-decoding"))
}
