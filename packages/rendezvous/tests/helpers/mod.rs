// not every integration-test crate uses every helper
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use opentelemetry::global;
use rendezvous::config::{Config, Connection};
use rendezvous::replicas::ReplicaClient;
use rendezvous::server::Server;
use rendezvous::services::{ClientService, ReplicaService};
use utils::telemetry::Metrics;

pub const SID: &str = "eu";

pub struct TestApp {
    pub config: Config,
    pub server: Arc<Server>,
    pub client: Arc<ClientService>,
    pub replica: Arc<ReplicaService>,
}

/// A single-replica app wired exactly like `run_server`, minus the
/// listener.
pub fn standalone(sid: &str) -> TestApp {
    with_peers(sid, Vec::new(), false)
}

/// A single-replica app with CONSISTENCY_CHECKS disabled: every operation
/// is a no-op.
pub fn gated(sid: &str) -> TestApp {
    let mut app = standalone(sid);
    let mut config = app.config.clone();
    config.consistency_checks = false;
    let metrics = Metrics::init(&global::meter("rendezvous-tests"));
    let replica_client = ReplicaClient::new(Vec::new(), false, metrics.replication);
    app.client = Arc::new(ClientService::new(
        app.server.clone(),
        replica_client,
        &config,
    ));
    app.replica = Arc::new(ReplicaService::new(app.server.clone(), &config));
    app.config = config;
    app
}

/// A single-replica app whose replica service runs with async replication
/// enabled, for exercising the apply barrier without a live peer.
pub fn replicated_standalone(sid: &str) -> TestApp {
    with_peers(sid, Vec::new(), true)
}

/// An app that fans out to the given peer base URLs.
pub fn with_peers(sid: &str, peers: Vec<String>, async_replication: bool) -> TestApp {
    let config = Config {
        replica_id: sid.to_string(),
        async_replication,
        context_versioning: async_replication,
        connections: BTreeMap::from([(
            sid.to_string(),
            Connection {
                host: "127.0.0.1".to_string(),
                port: 0,
            },
        )]),
        ..Default::default()
    };

    let metrics = Metrics::init(&global::meter("rendezvous-tests"));
    let server = Arc::new(Server::new(&config, metrics.server));
    let replica_client = ReplicaClient::new(peers, async_replication, metrics.replication);
    let client = Arc::new(ClientService::new(server.clone(), replica_client, &config));
    let replica = Arc::new(ReplicaService::new(server.clone(), &config));

    TestApp {
        config,
        server,
        client,
        replica,
    }
}
