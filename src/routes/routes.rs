//! Defines the gateway's HTTP surface.
//!
//! ## Structure
//! - `GET  /`            : upload page
//! - `POST /upload`      : stream the body into the store under `X-Filename`
//! - `GET  /files`       : list stored objects
//! - `GET  /files/{key}` : stream an object back (`key` percent-encoded)
//!
//! Anything else is a plain-text 404. Every request goes through [`dispatch`],
//! which resolves a [`Route`] once and matches on it exhaustively.

use crate::{
    errors::GatewayError,
    handlers::{
        index_handlers::index,
        object_handlers::{list_objects, read_object, upload_object},
    },
    routes::route::Route,
    state::AppState,
};
use axum::{
    Router,
    extract::{Request, State},
    response::{IntoResponse, Response},
};
use tracing::debug;

/// Build the router. Carries `AppState` to the dispatcher.
pub fn routes() -> Router<AppState> {
    Router::new().fallback(dispatch)
}

/// Resolve the request to a [`Route`] and run its handler.
pub async fn dispatch(State(state): State<AppState>, request: Request) -> Response {
    let route = Route::resolve(request.method(), request.uri().path());
    debug!(method = %request.method(), path = %request.uri().path(), ?route, "dispatching");

    let result = match route {
        Ok(Route::Index) => Ok(index().await.into_response()),
        Ok(Route::Upload) => {
            let (parts, body) = request.into_parts();
            upload_object(&state, &parts, body)
                .await
                .map(IntoResponse::into_response)
        }
        Ok(Route::List) => list_objects(&state).await.map(IntoResponse::into_response),
        Ok(Route::Read { key }) => read_object(&state, &key).await,
        Ok(Route::NotFound) => Err(GatewayError::RouteNotFound),
        Err(err) => Err(err),
    };

    result.unwrap_or_else(IntoResponse::into_response)
}
