use axum::http::StatusCode;
use axum::{extract::State, response::IntoResponse, Json};

use crate::http::{error::HttpResult, state::HttpState};
use rendezvous_types::{
    CloseBranchRequest, RegisterBranchRequest, RegisterBranchResponse, RegisterBranchesRequest,
    RegisterBranchesResponse,
};

#[utoipa::path(
    post,
    path = "/branches",
    request_body = RegisterBranchRequest,
    responses((status = 200, body = RegisterBranchResponse))
)]
#[axum::debug_handler]
pub async fn handle_register_branch(
    State(state): State<HttpState>,
    Json(req): Json<RegisterBranchRequest>,
) -> impl IntoResponse {
    match register_branch_inner(state, req).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn register_branch_inner(
    state: HttpState,
    req: RegisterBranchRequest,
) -> HttpResult<RegisterBranchResponse> {
    Ok(state.client_service.register_branch(req).await?)
}

#[utoipa::path(
    post,
    path = "/branches/bulk",
    request_body = RegisterBranchesRequest,
    responses((status = 200, body = RegisterBranchesResponse))
)]
#[axum::debug_handler]
pub async fn handle_register_branches(
    State(state): State<HttpState>,
    Json(req): Json<RegisterBranchesRequest>,
) -> impl IntoResponse {
    match register_branches_inner(state, req).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn register_branches_inner(
    state: HttpState,
    req: RegisterBranchesRequest,
) -> HttpResult<RegisterBranchesResponse> {
    Ok(state.client_service.register_branches(req).await?)
}

#[utoipa::path(
    post,
    path = "/branches/close",
    request_body = CloseBranchRequest,
    responses((status = 204))
)]
#[axum::debug_handler]
pub async fn handle_close_branch(
    State(state): State<HttpState>,
    Json(req): Json<CloseBranchRequest>,
) -> impl IntoResponse {
    match close_branch_inner(state, req).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => err.into_response(),
    }
}

async fn close_branch_inner(state: HttpState, req: CloseBranchRequest) -> HttpResult<()> {
    Ok(state.client_service.close_branch(req).await?)
}
