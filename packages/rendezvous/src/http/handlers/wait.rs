use axum::{extract::State, response::IntoResponse, Json};

use crate::http::{error::HttpResult, state::HttpState};
use rendezvous_types::{WaitRequest, WaitResponse};

#[utoipa::path(
    post,
    path = "/wait",
    request_body = WaitRequest,
    responses((status = 200, body = WaitResponse))
)]
#[axum::debug_handler]
pub async fn handle_wait(
    State(state): State<HttpState>,
    Json(req): Json<WaitRequest>,
) -> impl IntoResponse {
    match wait_inner(state, req).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn wait_inner(state: HttpState, req: WaitRequest) -> HttpResult<WaitResponse> {
    Ok(state.client_service.wait_request(req).await?)
}
