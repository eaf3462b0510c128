use axum::{
    Json, Router,
    extract::{Path, State},
    routing::get,
};
use tokens_core::TokenRecord;
use tracing::info;

use super::{ApiError, AppState};

pub async fn get_token(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<Json<TokenRecord>, ApiError> {
    info!(%address, "Fetching token");

    let record = state.coordinator.resolve(&address).await?;
    Ok(Json(record))
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/{address}", get(get_token))
}
