//! A small HTTP gateway in front of an object store.
//!
//! Clients stream a file in with `POST /upload`, list what is stored with
//! `GET /files` and fetch it back with `GET /files/{key}`. Bodies are passed
//! through chunk by chunk in both directions.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;

use axum::Router;
use state::AppState;

/// Router with `state` attached, ready to serve.
pub fn app(state: AppState) -> Router {
    routes::routes::routes().with_state(state)
}
