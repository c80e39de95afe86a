use super::*;
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        requests::handle_register_request,
        branches::handle_register_branch,
        branches::handle_register_branches,
        branches::handle_close_branch,
        zones::handle_add_async_zone,
        wait::handle_wait,
        status::handle_check_status,
        dependencies::handle_fetch_dependencies,
        subscribe::handle_subscribe,
        info::handle_info,
        config::handle_config
    ),
    info(
        title = "Rendezvous API",
        description = "API documentation for the rendezvous metadata service"
    )
)]
pub struct ApiDoc;
