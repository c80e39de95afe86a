use axum::{extract::State, response::IntoResponse, Json};

use crate::http::{error::HttpResult, state::HttpState};
use rendezvous_types::{CheckStatusRequest, CheckStatusResponse};

#[utoipa::path(
    post,
    path = "/status",
    request_body = CheckStatusRequest,
    responses((status = 200, body = CheckStatusResponse))
)]
#[axum::debug_handler]
pub async fn handle_check_status(
    State(state): State<HttpState>,
    Json(req): Json<CheckStatusRequest>,
) -> impl IntoResponse {
    match check_status_inner(state, req).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn check_status_inner(
    state: HttpState,
    req: CheckStatusRequest,
) -> HttpResult<CheckStatusResponse> {
    Ok(state.client_service.check_status(req).await?)
}
