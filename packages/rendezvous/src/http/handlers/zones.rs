use axum::{extract::State, response::IntoResponse, Json};

use crate::http::{error::HttpResult, state::HttpState};
use rendezvous_types::{AddAsyncZoneRequest, AddAsyncZoneResponse};

#[utoipa::path(
    post,
    path = "/async-zones",
    request_body = AddAsyncZoneRequest,
    responses((status = 200, body = AddAsyncZoneResponse))
)]
#[axum::debug_handler]
pub async fn handle_add_async_zone(
    State(state): State<HttpState>,
    Json(req): Json<AddAsyncZoneRequest>,
) -> impl IntoResponse {
    match add_async_zone_inner(state, req).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn add_async_zone_inner(
    state: HttpState,
    req: AddAsyncZoneRequest,
) -> HttpResult<AddAsyncZoneResponse> {
    Ok(state.client_service.add_async_zone(req).await?)
}
