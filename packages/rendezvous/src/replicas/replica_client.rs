//! Fan-out of replicated operations to the peer fleet.
//!
//! The peer list is static for the lifetime of the process (it comes from
//! the connections document). Failures are logged and counted but never
//! rolled back: the local commit is authoritative, peers are best-effort
//! convergent.

use rendezvous_types::{
    ReplicaCloseBranch, ReplicaRegisterBranch, ReplicaRegisterRequest, ReplicaWaitLog,
};
use serde::Serialize;
use tokio::task::JoinHandle;
use utils::telemetry::ReplicationMetrics;

pub const REGISTER_REQUEST_PATH: &str = "/replica/requests";
pub const REGISTER_BRANCH_PATH: &str = "/replica/branches";
pub const CLOSE_BRANCH_PATH: &str = "/replica/branches/close";
pub const ADD_WAIT_LOG_PATH: &str = "/replica/wait-logs";
pub const REMOVE_WAIT_LOG_PATH: &str = "/replica/wait-logs/remove";

/// Pairs an add-wait-log dispatch with its remove so a peer never sees the
/// remove before the add it belongs to. In synchronous mode the add has
/// already completed by the time the handle exists.
pub struct WaitLogHandle {
    inflight: Option<JoinHandle<()>>,
}

#[derive(Clone)]
pub struct ReplicaClient {
    /// Peer base URLs; the current replica is not part of the list.
    peers: Vec<String>,
    http: reqwest::Client,
    async_replication: bool,
    metrics: ReplicationMetrics,
}

impl ReplicaClient {
    pub fn new(peers: Vec<String>, async_replication: bool, metrics: ReplicationMetrics) -> Self {
        Self {
            peers,
            http: reqwest::Client::new(),
            async_replication,
            metrics,
        }
    }

    pub fn num_peers(&self) -> usize {
        self.peers.len()
    }

    pub fn has_peers(&self) -> bool {
        !self.peers.is_empty()
    }

    async fn fan_out<T: Serialize + Sync>(
        http: reqwest::Client,
        peers: Vec<String>,
        metrics: ReplicationMetrics,
        path: &'static str,
        op: &'static str,
        body: T,
    ) {
        let calls = peers.iter().map(|base| {
            let url = format!("{base}{path}");
            let http = http.clone();
            let body = &body;
            let metrics = metrics.clone();
            async move {
                match http.post(&url).json(body).send().await {
                    Ok(response) if response.status().is_success() => {}
                    Ok(response) => {
                        metrics.increment_total_errors();
                        tracing::error!(
                            "replica {} returned {} for {}",
                            url,
                            response.status(),
                            op
                        );
                    }
                    Err(err) => {
                        metrics.increment_total_errors();
                        tracing::error!("replica {} unreachable for {}: {}", url, op, err);
                    }
                }
            }
        });
        futures::future::join_all(calls).await;
    }

    /// Issue to every peer. Synchronous mode joins all completions before
    /// returning; asynchronous mode detaches and returns the task handle.
    async fn dispatch<T: Serialize + Send + Sync + 'static>(
        &self,
        path: &'static str,
        op: &'static str,
        body: T,
    ) -> Option<JoinHandle<()>> {
        if self.peers.is_empty() {
            return None;
        }
        let http = self.http.clone();
        let peers = self.peers.clone();
        let metrics = self.metrics.clone();
        if self.async_replication {
            Some(tokio::spawn(Self::fan_out(
                http, peers, metrics, path, op, body,
            )))
        } else {
            Self::fan_out(http, peers, metrics, path, op, body).await;
            None
        }
    }

    pub async fn register_request(&self, rid: String) {
        self.dispatch(
            REGISTER_REQUEST_PATH,
            "register request",
            ReplicaRegisterRequest { rid },
        )
        .await;
    }

    pub async fn register_branch(&self, message: ReplicaRegisterBranch) {
        self.dispatch(REGISTER_BRANCH_PATH, "register branch", message)
            .await;
    }

    pub async fn close_branch(&self, message: ReplicaCloseBranch) {
        self.dispatch(CLOSE_BRANCH_PATH, "close branch", message)
            .await;
    }

    pub async fn add_wait_log(&self, message: ReplicaWaitLog) -> WaitLogHandle {
        let inflight = self
            .dispatch(ADD_WAIT_LOG_PATH, "add wait log", message)
            .await;
        WaitLogHandle { inflight }
    }

    pub async fn remove_wait_log(&self, handle: WaitLogHandle, message: ReplicaWaitLog) {
        if let Some(inflight) = handle.inflight {
            // the add must land before any peer sees the remove
            let _ = inflight.await;
        }
        self.dispatch(REMOVE_WAIT_LOG_PATH, "remove wait log", message)
            .await;
    }
}
