use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use futures::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use utils::telemetry::HttpMetrics;

use crate::http::state::HttpState;
use rendezvous_types::SubscribeParams;

/// Cancels the blocking reader and settles the gauge when the client
/// drops the stream.
struct SubscriptionGuard {
    cancel: CancellationToken,
    metrics: HttpMetrics,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.metrics.decrement_active_subscribers();
    }
}

/// Long-poll stream of newly opened monitored branches for a
/// (service, region) pair, as newline-delimited JSON.
#[utoipa::path(
    get,
    path = "/subscribe",
    params(
        ("service" = String, Query, description = "service to subscribe to"),
        ("region" = String, Query, description = "region filter")
    ),
    responses((status = 200, description = "NDJSON stream of {bid, tag}"))
)]
#[axum::debug_handler]
pub async fn handle_subscribe(
    State(state): State<HttpState>,
    Query(params): Query<SubscribeParams>,
) -> impl IntoResponse {
    tracing::info!(
        "loading subscriber for service '{}' and region '{}'",
        params.service,
        params.region
    );
    let subscriber = state.server.get_subscriber(&params.service, &params.region);
    state.metrics.increment_active_subscribers();

    let cancel = CancellationToken::new();
    let guard = SubscriptionGuard {
        cancel: cancel.clone(),
        metrics: state.metrics.clone(),
    };

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::convert::Infallible>>(16);
    tokio::task::spawn_blocking(move || {
        while let Some(event) = subscriber.pop(&cancel) {
            let mut line = match serde_json::to_vec(&event) {
                Ok(line) => line,
                Err(err) => {
                    tracing::error!("could not encode subscription event: {}", err);
                    continue;
                }
            };
            line.push(b'\n');
            if tx.blocking_send(Ok(line.into())).is_err() {
                break;
            }
        }
        tracing::info!("subscriber stream finished");
    });

    // the guard rides along with the stream so a client disconnect stops
    // the blocking reader at its next wake
    let stream = ReceiverStream::new(rx).map(move |item| {
        let _ = &guard;
        item
    });

    (
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(stream),
    )
}
