use std::time::Duration;

use axum::{Json, Router, extract::State, routing::get};
use serde::{Deserialize, Serialize};

use super::AppState;

pub const SERVICE_NAME: &str = "Tokens";

const CHAIN_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Up,
    Down,
}

impl From<bool> for ComponentStatus {
    fn from(up: bool) -> Self {
        if up { Self::Up } else { Self::Down }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub name: String,
    pub database: ComponentStatus,
    pub chain: ComponentStatus,
}

pub async fn get_status(State(state): State<AppState>) -> Json<Status> {
    let (database, chain) = tokio::join!(state.db.ping(), state.chain.is_reachable(CHAIN_TIMEOUT));

    Json(Status {
        name: SERVICE_NAME.to_string(),
        database: database.into(),
        chain: chain.into(),
    })
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/", get(get_status))
}
