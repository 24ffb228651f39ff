//! Core data models for the gateway.
//!
//! Objects are owned by the backing store; the gateway only reads these
//! projections and serializes them as JSON via `serde`.

pub mod object;
