use std::time::SystemTime;

use axum::{extract::State, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::http::state::HttpState;

#[derive(Serialize, Deserialize, ToSchema)]
pub struct InfoResponse {
    pub sid: String,
    pub uptime_s: u64,
    pub num_requests: usize,
    pub prevented_inconsistencies: i64,
}

#[utoipa::path(get, path = "/info", responses((status = 200, body = InfoResponse)))]
#[axum::debug_handler]
pub async fn handle_info(State(state): State<HttpState>) -> impl IntoResponse {
    let uptime_s = SystemTime::now()
        .duration_since(state.server.started_at())
        .map(|age| age.as_secs())
        .unwrap_or(0);
    Json(InfoResponse {
        sid: state.server.sid().to_string(),
        uptime_s,
        num_requests: state.server.num_requests(),
        prevented_inconsistencies: state.server.num_prevented_inconsistencies(),
    })
}
