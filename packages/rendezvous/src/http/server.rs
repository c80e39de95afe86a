use std::sync::Arc;

use axum::routing::{get, post};
use axum_tracing_opentelemetry::middleware::OtelAxumLayer;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utils::{context::AppContext, telemetry::HttpMetrics};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;
use wildmatch::WildMatch;

use crate::config::Config;
use crate::replicas::replica_client::{
    ADD_WAIT_LOG_PATH, CLOSE_BRANCH_PATH, REGISTER_BRANCH_PATH, REGISTER_REQUEST_PATH,
    REMOVE_WAIT_LOG_PATH,
};
use crate::server::Server;
use crate::services::{ClientService, ReplicaService};

use super::handlers::{
    handle_add_async_zone, handle_check_status, handle_close_branch, handle_config,
    handle_fetch_dependencies, handle_info, handle_not_found, handle_register_branch,
    handle_register_branches, handle_register_request, handle_subscribe, handle_wait,
    openapi::ApiDoc, replica,
};
use super::state::HttpState;

/// Bind and serve until the kill signal fires. Called from main.
pub fn start(
    ctx: AppContext,
    config: Config,
    server: Arc<Server>,
    client_service: Arc<ClientService>,
    replica_service: Arc<ReplicaService>,
    metrics: HttpMetrics,
) -> anyhow::Result<()> {
    ctx.rt.clone().block_on(async move {
        let (host, port) = config.listen_addr()?;

        let shutdown = ctx.wait_kill();

        let router = make_router(config, server, client_service, replica_service, metrics);

        let listener = tokio::net::TcpListener::bind(&format!("{}:{}", host, port)).await?;

        tracing::info!("Http server starting on: {}", listener.local_addr()?);

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown.await;

                tracing::debug!("Http server shutting down");
            })
            .await?;

        anyhow::Ok(())
    })?;

    Ok(())
}

/// Build the router; shared between main and the integration tests.
pub fn make_router(
    config: Config,
    server: Arc<Server>,
    client_service: Arc<ClientService>,
    replica_service: Arc<ReplicaService>,
    metrics: HttpMetrics,
) -> axum::Router {
    let cors = cors_layer(&config);
    let state = HttpState::new(config, server, client_service, replica_service, metrics);

    let mut router = axum::Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(OtelAxumLayer::default())
        .route("/config", get(handle_config))
        .route("/info", get(handle_info))
        .route("/requests", post(handle_register_request))
        .route("/branches", post(handle_register_branch))
        .route("/branches/bulk", post(handle_register_branches))
        .route("/branches/close", post(handle_close_branch))
        .route("/async-zones", post(handle_add_async_zone))
        .route("/wait", post(handle_wait))
        .route("/status", post(handle_check_status))
        .route("/dependencies", post(handle_fetch_dependencies))
        .route("/subscribe", get(handle_subscribe))
        // peer-facing surface
        .route(REGISTER_REQUEST_PATH, post(replica::handle_register_request))
        .route(REGISTER_BRANCH_PATH, post(replica::handle_register_branch))
        .route(CLOSE_BRANCH_PATH, post(replica::handle_close_branch))
        .route(ADD_WAIT_LOG_PATH, post(replica::handle_add_wait_log))
        .route(REMOVE_WAIT_LOG_PATH, post(replica::handle_remove_wait_log))
        .fallback(handle_not_found)
        .with_state(state);

    if let Some(cors) = cors {
        router = router.layer(cors);
    }

    router
}

fn cors_layer(config: &Config) -> Option<CorsLayer> {
    if config.cors_allowed_origins.is_empty() {
        None
    } else {
        let allowed_origins: Vec<WildMatch> = config
            .cors_allowed_origins
            .iter()
            .map(|s| WildMatch::new(s))
            .collect();

        Some(
            CorsLayer::new()
                // using a predicate so we have more flexibility over wildcard patterns
                .allow_origin(tower_http::cors::AllowOrigin::predicate(
                    move |origin, _parts| {
                        origin
                            .to_str()
                            .map(|origin| {
                                allowed_origins
                                    .iter()
                                    .any(|allowed_origin| allowed_origin.matches(origin))
                            })
                            .unwrap_or(false)
                    },
                ))
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
    }
}
