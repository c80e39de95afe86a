#![allow(clippy::uninlined_format_args)]
#![allow(clippy::type_complexity)]

pub mod args;
pub mod config;
pub mod http;
pub mod metadata; // the per-request engine: branches, requests, subscribers
pub mod replicas; // versioning and peer fan-out
pub mod server;
pub mod services; // client- and peer-facing operation adapters

use std::sync::Arc;

use config::Config;
use utils::context::AppContext;
use utils::telemetry::Metrics;

use crate::replicas::ReplicaClient;
use crate::server::Server;
use crate::services::{ClientService, ReplicaService};

/// Entry point to start up the whole server.
/// Called from main and end-to-end tests.
pub fn run_server(ctx: AppContext, config: Config, metrics: Metrics) {
    let _ = ctrlc::set_handler({
        let ctx = ctx.clone();
        move || {
            ctx.kill();
        }
    });

    let server = Arc::new(Server::new(&config, metrics.server));
    server.start_reapers(&ctx);

    let replica_client = ReplicaClient::new(
        config.peer_urls(),
        config.async_replication,
        metrics.replication,
    );
    let client_service = Arc::new(ClientService::new(server.clone(), replica_client, &config));
    let replica_service = Arc::new(ReplicaService::new(server.clone(), &config));

    http::server::start(
        ctx,
        config,
        server,
        client_service,
        replica_service,
        metrics.http,
    )
    .unwrap();
}

// the test version of tracing init does not take a config
// since config itself is tested and modified from different parallel tests
// therefore, this only uses the default tracing settings
// it's not gated out because it is used in integration tests as well
pub fn init_tracing_tests() {
    use std::sync::LazyLock;

    // ensure we only initialize once globally across parallel tests
    static INIT: LazyLock<std::sync::Mutex<bool>> = LazyLock::new(|| std::sync::Mutex::new(false));

    let mut init = INIT.lock().unwrap();

    if !*init {
        *init = true;

        tracing_subscriber::fmt::init();
        tracing::debug!("Tracing initialized for tests");
    }
}
