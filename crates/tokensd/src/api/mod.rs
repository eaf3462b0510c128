//! HTTP surface of the daemon.

use std::sync::Arc;

use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tokens_core::{Error, coordinator::Coordinator, database, resolver::Erc20Metadata};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::warn;

pub mod status;
pub mod tokens;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub db: database::Handle,
    /// Chain node reached for ERC-20 metadata, checked by `/status`
    pub chain: Erc20Metadata,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/token", tokens::routes())
        .nest("/status", status::routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Maps resolution failures onto HTTP statuses.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Resolution { .. } | Error::BatchResolution { .. } => StatusCode::BAD_GATEWAY,
            Error::Persistence(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self.0, %status, "request failed");
        }

        let body = ErrorBody {
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
