use axum::{extract::State, response::IntoResponse, Json};

use crate::http::{error::HttpResult, state::HttpState};
use rendezvous_types::{FetchDependenciesRequest, FetchDependenciesResponse};

#[utoipa::path(
    post,
    path = "/dependencies",
    request_body = FetchDependenciesRequest,
    responses((status = 200, body = FetchDependenciesResponse))
)]
#[axum::debug_handler]
pub async fn handle_fetch_dependencies(
    State(state): State<HttpState>,
    Json(req): Json<FetchDependenciesRequest>,
) -> impl IntoResponse {
    match fetch_dependencies_inner(state, req).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn fetch_dependencies_inner(
    state: HttpState,
    req: FetchDependenciesRequest,
) -> HttpResult<FetchDependenciesResponse> {
    Ok(state.client_service.fetch_dependencies(req).await?)
}
