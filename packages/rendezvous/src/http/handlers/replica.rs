//! Peer-facing handlers. These are not part of the public OpenAPI surface;
//! only other replicas of the fleet call them. The replica service blocks
//! on version barriers, so every apply runs on the blocking pool.

use axum::http::StatusCode;
use axum::{extract::State, response::IntoResponse, Json};
use rendezvous_types::{
    ApiError, ReplicaCloseBranch, ReplicaRegisterBranch, ReplicaRegisterRequest, ReplicaWaitLog,
};

use crate::http::error::HttpError;
use crate::http::state::HttpState;

async fn run_blocking<F>(state: HttpState, apply: F) -> impl IntoResponse
where
    F: FnOnce(HttpState) -> Result<(), ApiError> + Send + 'static,
{
    let result = tokio::task::spawn_blocking(move || apply(state))
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))
        .and_then(|inner| inner);
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => HttpError(err).into_response(),
    }
}

#[axum::debug_handler]
pub async fn handle_register_request(
    State(state): State<HttpState>,
    Json(req): Json<ReplicaRegisterRequest>,
) -> impl IntoResponse {
    run_blocking(state, move |state| {
        state.replica_service.register_request(req);
        Ok(())
    })
    .await
}

#[axum::debug_handler]
pub async fn handle_register_branch(
    State(state): State<HttpState>,
    Json(req): Json<ReplicaRegisterBranch>,
) -> impl IntoResponse {
    run_blocking(state, move |state| state.replica_service.register_branch(req)).await
}

#[axum::debug_handler]
pub async fn handle_close_branch(
    State(state): State<HttpState>,
    Json(req): Json<ReplicaCloseBranch>,
) -> impl IntoResponse {
    run_blocking(state, move |state| state.replica_service.close_branch(req)).await
}

#[axum::debug_handler]
pub async fn handle_add_wait_log(
    State(state): State<HttpState>,
    Json(req): Json<ReplicaWaitLog>,
) -> impl IntoResponse {
    run_blocking(state, move |state| state.replica_service.add_wait_log(req)).await
}

#[axum::debug_handler]
pub async fn handle_remove_wait_log(
    State(state): State<HttpState>,
    Json(req): Json<ReplicaWaitLog>,
) -> impl IntoResponse {
    run_blocking(state, move |state| state.replica_service.remove_wait_log(req)).await
}
