//! Adapts client-facing messages into core calls and forwards the
//! replicated equivalents to the peer fleet.

use std::sync::Arc;

use rendezvous_types::{
    compose_full_id, errmsg, parse_full_id, AddAsyncZoneRequest, AddAsyncZoneResponse, ApiError,
    CheckStatusRequest, CheckStatusResponse, CloseBranchRequest, FetchDependenciesRequest,
    FetchDependenciesResponse, RegisterBranchRequest, RegisterBranchResponse,
    RegisterBranchesRequest, RegisterBranchesResponse, RegisterRequest, RegisterRequestResponse,
    ReplicaCloseBranch, ReplicaContext, ReplicaRegisterBranch, ReplicaWaitLog, RequestStatus,
    WaitRequest, WaitResponse, ROOT_ASYNC_ZONE_ID,
};
use tracing::instrument;

use crate::config::Config;
use crate::metadata::request::{CloseOutcome, RegisterError, Request, WaitOutcome};
use crate::replicas::ReplicaClient;
use crate::server::Server;

pub struct ClientService {
    server: Arc<Server>,
    replica_client: ReplicaClient,
    async_replication: bool,
    context_versioning: bool,
    /// CONSISTENCY_CHECKS=0 turns every operation into an immediate no-op.
    consistency_checks: bool,
    /// Peers plus the local replica.
    num_replicas: usize,
}

fn default_zone(async_zone: &str) -> &str {
    if async_zone.is_empty() {
        ROOT_ASYNC_ZONE_ID
    } else {
        async_zone
    }
}

impl ClientService {
    pub fn new(server: Arc<Server>, replica_client: ReplicaClient, config: &Config) -> Self {
        let num_replicas = replica_client.num_peers() + 1;
        Self {
            server,
            replica_client,
            async_replication: config.async_replication,
            context_versioning: config.context_versioning,
            consistency_checks: config.consistency_checks,
            num_replicas,
        }
    }

    /// With a single replica an unknown rid is a client error; with a
    /// fleet the registration may still be in flight from a peer, so the
    /// request is created on demand.
    fn get_request(&self, rid: &str) -> Result<Arc<Request>, ApiError> {
        let request = if self.num_replicas == 1 {
            self.server.get_request(rid)
        } else {
            Some(self.server.get_or_register_request(rid))
        };
        request.ok_or_else(|| ApiError::not_found(errmsg::INVALID_REQUEST))
    }

    #[instrument(level = "debug", skip_all, fields(subsys = "ClientService", rid = %message.rid))]
    pub async fn register_request(
        &self,
        message: RegisterRequest,
    ) -> Result<RegisterRequestResponse, ApiError> {
        if !self.consistency_checks {
            return Ok(RegisterRequestResponse { rid: message.rid });
        }

        let request = self.server.get_or_register_request(&message.rid);
        let rid = request.rid().to_string();

        if self.replica_client.has_peers() {
            self.replica_client.register_request(rid.clone()).await;
        }
        Ok(RegisterRequestResponse { rid })
    }

    #[instrument(level = "debug", skip_all, fields(subsys = "ClientService", rid = %message.rid, service = %message.service))]
    pub async fn register_branch(
        &self,
        message: RegisterBranchRequest,
    ) -> Result<RegisterBranchResponse, ApiError> {
        if !self.consistency_checks {
            return Ok(RegisterBranchResponse {
                rid: message.rid,
                bid: String::new(),
            });
        }

        if message.service.is_empty() {
            return Err(ApiError::invalid_argument(errmsg::SERVICE_EMPTY));
        }
        let request = self.get_request(&message.rid)?;

        let core_bid = if message.bid.is_empty() {
            self.server.gen_bid(&request)
        } else {
            parse_full_id(&message.bid).0.to_string()
        };

        let async_zone = default_zone(&message.async_zone).to_string();
        self.register_one(
            &request,
            &async_zone,
            &core_bid,
            &message.service,
            &message.tag,
            &message.regions,
            &message.parent_service,
            message.monitor,
        )
        .await?;

        Ok(RegisterBranchResponse {
            rid: request.rid().to_string(),
            bid: compose_full_id(&core_bid, request.rid()),
        })
    }

    #[instrument(level = "debug", skip_all, fields(subsys = "ClientService", rid = %message.rid))]
    pub async fn register_branches(
        &self,
        message: RegisterBranchesRequest,
    ) -> Result<RegisterBranchesResponse, ApiError> {
        if !self.consistency_checks {
            return Ok(RegisterBranchesResponse {
                rid: message.rid,
                bids: Vec::new(),
            });
        }

        let request = self.get_request(&message.rid)?;
        let mut bids = Vec::with_capacity(message.branches.len());

        for branch in &message.branches {
            if branch.service.is_empty() {
                return Err(ApiError::invalid_argument(errmsg::SERVICE_EMPTY));
            }
            let core_bid = self.server.gen_bid(&request);
            let async_zone = default_zone(&branch.async_zone).to_string();
            self.register_one(
                &request,
                &async_zone,
                &core_bid,
                &branch.service,
                &branch.tag,
                &branch.regions,
                &message.parent_service,
                branch.monitor,
            )
            .await?;
            bids.push(compose_full_id(&core_bid, request.rid()));
        }

        Ok(RegisterBranchesResponse {
            rid: request.rid().to_string(),
            bids,
        })
    }

    /// Register one branch locally and fan the registration out to peers,
    /// stamping a version under async replication.
    #[allow(clippy::too_many_arguments)]
    async fn register_one(
        &self,
        request: &Arc<Request>,
        async_zone: &str,
        core_bid: &str,
        service: &str,
        tag: &str,
        regions: &[String],
        parent_service: &str,
        monitor: bool,
    ) -> Result<(), ApiError> {
        self.server
            .register_branch(
                request,
                async_zone,
                service,
                regions,
                tag,
                parent_service,
                core_bid,
                monitor,
            )
            .map_err(|err| match err {
                RegisterError::BranchAlreadyExists => {
                    ApiError::AlreadyExists(errmsg::BRANCH_ALREADY_EXISTS.to_string())
                }
                RegisterError::UnknownParentService(_) => {
                    ApiError::invalid_argument(err.to_string())
                }
                RegisterError::UnknownAsyncZone(_) => {
                    ApiError::invalid_argument(errmsg::INVALID_ASYNC_ZONE)
                }
            })?;

        if self.replica_client.has_peers() {
            let mut context = ReplicaContext::default();
            if self.async_replication {
                let sid = self.server.sid();
                context = ReplicaContext {
                    sid: sid.to_string(),
                    version: request.versions().update_local_version(sid),
                };
                request.mark_branch_replication_ready(core_bid);
            }
            self.replica_client
                .register_branch(ReplicaRegisterBranch {
                    rid: request.rid().to_string(),
                    async_zone: async_zone.to_string(),
                    core_bid: core_bid.to_string(),
                    service: service.to_string(),
                    tag: tag.to_string(),
                    regions: regions.to_vec(),
                    parent_service: parent_service.to_string(),
                    monitor,
                    context,
                })
                .await;
        }
        Ok(())
    }

    #[instrument(level = "debug", skip_all, fields(subsys = "ClientService", bid = %message.bid, region = %message.region))]
    pub async fn close_branch(&self, message: CloseBranchRequest) -> Result<(), ApiError> {
        if !self.consistency_checks {
            return Ok(());
        }

        let (core_bid, rid) = parse_full_id(&message.bid);
        if core_bid.is_empty() || rid.is_empty() {
            return Err(ApiError::Internal(errmsg::PARSING_BID.to_string()));
        }
        let (core_bid, rid) = (core_bid.to_string(), rid.to_string());

        let request = self.get_request(&rid)?;
        if request.is_closed() {
            return Ok(());
        }

        // the client wants all of these previously registered bids to be
        // visible here before the close applies (async replication may
        // still be delivering them from a peer)
        if self.async_replication && self.context_versioning && !message.visible_bids.is_empty() {
            let bids: Vec<String> = message
                .visible_bids
                .iter()
                .map(|bid| parse_full_id(bid).0.to_string())
                .collect();
            let timeout = self.server.wait_replica_timeout();
            let waited = {
                let request = request.clone();
                tokio::task::spawn_blocking(move || request.wait_branches_visible(&bids, timeout))
                    .await
                    .map_err(|err| ApiError::Internal(err.to_string()))?
            };
            if !waited {
                return Err(ApiError::DeadlineExceeded(
                    errmsg::VISIBLE_BIDS_TIMEOUT.to_string(),
                ));
            }
        }

        match self.server.close_branch(&request, &core_bid, &message.region) {
            CloseOutcome::Closed | CloseOutcome::AlreadyClosed => {}
            CloseOutcome::BranchNotFound => {
                return Err(ApiError::not_found(errmsg::BRANCH_NOT_FOUND));
            }
            CloseOutcome::RegionNotFound => {
                return Err(ApiError::not_found(errmsg::INVALID_REGION));
            }
        }

        if self.replica_client.has_peers() {
            let mut context = ReplicaContext::default();
            if self.async_replication {
                let sid = self.server.sid();
                context = ReplicaContext {
                    sid: sid.to_string(),
                    // the close rides on the version of the registration it
                    // follows; peers wait for that write to land first
                    version: request.versions().get_local_version(sid),
                };
            }
            self.replica_client
                .close_branch(ReplicaCloseBranch {
                    rid,
                    core_bid,
                    region: message.region.clone(),
                    context,
                })
                .await;
        }
        Ok(())
    }

    #[instrument(level = "debug", skip_all, fields(subsys = "ClientService", rid = %message.rid, service = %message.service, region = %message.region))]
    pub async fn wait_request(&self, message: WaitRequest) -> Result<WaitResponse, ApiError> {
        if !self.consistency_checks {
            return Ok(WaitResponse::default());
        }

        if message.timeout < 0 {
            return Err(ApiError::invalid_argument(errmsg::INVALID_TIMEOUT));
        }
        if !message.service.is_empty() && !message.services.is_empty() {
            return Err(ApiError::invalid_argument(errmsg::SERVICES_EXCLUSIVE));
        }
        if !message.tag.is_empty() && message.service.is_empty() {
            return Err(ApiError::invalid_argument(errmsg::TAG_USAGE));
        }

        let request = self.get_request(&message.rid)?;
        if request.is_closed() {
            return Ok(WaitResponse::default());
        }

        let async_zone = default_zone(&message.async_zone).to_string();
        let handle = self
            .replica_client
            .add_wait_log(ReplicaWaitLog {
                rid: message.rid.clone(),
                async_zone: async_zone.clone(),
                target_service: message.service.clone(),
            })
            .await;

        let outcome = {
            let server = self.server.clone();
            let request = request.clone();
            let message = message.clone();
            let async_zone = async_zone.clone();
            let async_mode = self.async_replication;
            tokio::task::spawn_blocking(move || {
                if message.services.is_empty() {
                    server.wait(
                        &request,
                        &async_zone,
                        &message.service,
                        &message.region,
                        &message.tag,
                        async_mode,
                        message.timeout,
                        &message.current_service,
                        message.wait_deps,
                    )
                } else {
                    let mut outcome = WaitOutcome::fulfilled(false);
                    for service in &message.services {
                        outcome = server.wait(
                            &request,
                            &async_zone,
                            service,
                            &message.region,
                            &message.tag,
                            async_mode,
                            message.timeout,
                            &message.current_service,
                            message.wait_deps,
                        );
                        if !matches!(outcome, WaitOutcome::Fulfilled { .. }) {
                            break;
                        }
                    }
                    outcome
                }
            })
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?
        };

        self.replica_client
            .remove_wait_log(
                handle,
                ReplicaWaitLog {
                    rid: message.rid.clone(),
                    async_zone,
                    target_service: message.service.clone(),
                },
            )
            .await;

        match outcome {
            WaitOutcome::Fulfilled {
                prevented_inconsistency,
            } => Ok(WaitResponse {
                prevented_inconsistency,
                timed_out: false,
            }),
            WaitOutcome::TimedOut => Ok(WaitResponse {
                prevented_inconsistency: false,
                timed_out: true,
            }),
            WaitOutcome::MissingContext => {
                Err(ApiError::invalid_argument(errmsg::INVALID_SERVICE_REGION))
            }
            WaitOutcome::MissingParent => {
                Err(ApiError::invalid_argument(errmsg::NO_CURRENT_SERVICE))
            }
            WaitOutcome::UnknownTagOrZone => Err(ApiError::invalid_argument(errmsg::INVALID_TAG)),
        }
    }

    #[instrument(level = "debug", skip_all, fields(subsys = "ClientService", rid = %message.rid, service = %message.service))]
    pub async fn check_status(
        &self,
        message: CheckStatusRequest,
    ) -> Result<CheckStatusResponse, ApiError> {
        if !self.consistency_checks {
            return Ok(CheckStatusResponse {
                status: RequestStatus::Unknown,
                tagged: Default::default(),
                regions: Default::default(),
            });
        }

        let request = self.get_request(&message.rid)?;
        if request.is_closed() {
            return Ok(CheckStatusResponse {
                status: RequestStatus::Closed,
                tagged: Default::default(),
                regions: Default::default(),
            });
        }

        let async_zone = default_zone(&message.async_zone);
        let result = self
            .server
            .check_status(
                &request,
                async_zone,
                &message.service,
                &message.region,
                message.detailed,
            )
            .ok_or_else(|| ApiError::invalid_argument(errmsg::INVALID_ASYNC_ZONE))?;

        Ok(CheckStatusResponse {
            status: result.status,
            tagged: result.tagged,
            regions: result.regions,
        })
    }

    #[instrument(level = "debug", skip_all, fields(subsys = "ClientService", rid = %message.rid, service = %message.service))]
    pub async fn fetch_dependencies(
        &self,
        message: FetchDependenciesRequest,
    ) -> Result<FetchDependenciesResponse, ApiError> {
        if !self.consistency_checks {
            return Ok(FetchDependenciesResponse::default());
        }

        let request = self.get_request(&message.rid)?;
        if request.is_closed() {
            return Ok(FetchDependenciesResponse::default());
        }

        let result = self
            .server
            .fetch_dependencies(&request, &message.service)
            .ok_or_else(|| ApiError::invalid_argument(errmsg::INVALID_SERVICE))?;

        Ok(FetchDependenciesResponse {
            deps: result.deps.into_iter().collect(),
            indirect_deps: result.indirect_deps.into_iter().collect(),
        })
    }

    #[instrument(level = "debug", skip_all, fields(subsys = "ClientService", rid = %message.rid))]
    pub async fn add_async_zone(
        &self,
        message: AddAsyncZoneRequest,
    ) -> Result<AddAsyncZoneResponse, ApiError> {
        if !self.consistency_checks {
            return Ok(AddAsyncZoneResponse {
                async_zone: default_zone(&message.async_zone).to_string(),
            });
        }

        let request = self.get_request(&message.rid)?;
        let async_zone = self
            .server
            .add_next_async_zone(&request, default_zone(&message.async_zone), true)
            .ok_or_else(|| ApiError::invalid_argument(errmsg::INVALID_ASYNC_ZONE))?;
        Ok(AddAsyncZoneResponse { async_zone })
    }
}
