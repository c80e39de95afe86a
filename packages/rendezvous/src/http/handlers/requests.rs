use axum::{extract::State, response::IntoResponse, Json};

use crate::http::{error::HttpResult, state::HttpState};
use rendezvous_types::{RegisterRequest, RegisterRequestResponse};

#[utoipa::path(
    post,
    path = "/requests",
    request_body = RegisterRequest,
    responses((status = 200, body = RegisterRequestResponse))
)]
#[axum::debug_handler]
pub async fn handle_register_request(
    State(state): State<HttpState>,
    Json(req): Json<RegisterRequest>,
) -> impl IntoResponse {
    match register_request_inner(state, req).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn register_request_inner(
    state: HttpState,
    req: RegisterRequest,
) -> HttpResult<RegisterRequestResponse> {
    Ok(state.client_service.register_request(req).await?)
}
