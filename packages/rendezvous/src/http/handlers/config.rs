use axum::{extract::State, response::IntoResponse, Json};

use crate::http::state::HttpState;

#[utoipa::path(get, path = "/config", responses((status = 200)))]
#[axum::debug_handler]
pub async fn handle_config(State(state): State<HttpState>) -> impl IntoResponse {
    Json(state.config.clone())
}
