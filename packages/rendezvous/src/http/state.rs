use std::sync::Arc;

use utils::telemetry::HttpMetrics;

use crate::config::Config;
use crate::server::Server;
use crate::services::{ClientService, ReplicaService};

#[derive(Clone)]
pub struct HttpState {
    pub config: Config,
    pub server: Arc<Server>,
    pub client_service: Arc<ClientService>,
    pub replica_service: Arc<ReplicaService>,
    pub metrics: HttpMetrics,
}

impl HttpState {
    pub fn new(
        config: Config,
        server: Arc<Server>,
        client_service: Arc<ClientService>,
        replica_service: Arc<ReplicaService>,
        metrics: HttpMetrics,
    ) -> Self {
        Self {
            config,
            server,
            client_service,
            replica_service,
            metrics,
        }
    }
}
