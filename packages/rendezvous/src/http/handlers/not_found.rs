use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use rendezvous_types::ErrorResponse;

pub async fn handle_not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: "no such route".to_string(),
        }),
    )
}
