//! Applies operations replicated from peer servers. Under async
//! replication, registrations from one origin apply in strict version
//! order and closes wait for the registration they ride on; under sync
//! replication everything applies directly.

use std::sync::Arc;

use rendezvous_types::{
    errmsg, ApiError, ReplicaCloseBranch, ReplicaRegisterBranch, ReplicaRegisterRequest,
    ReplicaWaitLog, ROOT_ASYNC_ZONE_ID,
};
use tracing::instrument;

use crate::config::Config;
use crate::metadata::request::{CloseOutcome, RegisterError, Request};
use crate::server::Server;

pub struct ReplicaService {
    server: Arc<Server>,
    async_replication: bool,
    consistency_checks: bool,
}

impl ReplicaService {
    pub fn new(server: Arc<Server>, config: &Config) -> Self {
        Self {
            server,
            async_replication: config.async_replication,
            consistency_checks: config.consistency_checks,
        }
    }

    /// Every replicated operation registers the request on demand: the
    /// client-facing registration may still be in flight.
    fn get_request(&self, rid: &str) -> Arc<Request> {
        self.server.get_or_register_request(rid)
    }

    #[instrument(level = "debug", skip_all, fields(subsys = "ReplicaService", rid = %message.rid))]
    pub fn register_request(&self, message: ReplicaRegisterRequest) {
        if !self.consistency_checks {
            return;
        }
        self.get_request(&message.rid);
    }

    #[instrument(level = "debug", skip_all, fields(subsys = "ReplicaService", rid = %message.rid, service = %message.service))]
    pub fn register_branch(&self, message: ReplicaRegisterBranch) -> Result<(), ApiError> {
        if !self.consistency_checks {
            return Ok(());
        }

        let request = self.get_request(&message.rid);

        // adopt the async zone minted by the origin before tracking in it
        if message.async_zone != ROOT_ASYNC_ZONE_ID
            && request.validate_zone(&message.async_zone).is_none()
        {
            self.server
                .add_next_async_zone(&request, &message.async_zone, false);
        }

        let versioned = self.async_replication && message.context.version > 0;
        if versioned {
            // FIFO apply barrier per origin
            request
                .versions()
                .wait_remote_version(&message.context.sid, message.context.version - 1);
        }

        let result = self.server.register_branch(
            &request,
            &message.async_zone,
            &message.service,
            &message.regions,
            &message.tag,
            &message.parent_service,
            &message.core_bid,
            message.monitor,
        );
        match result {
            Ok(_) => request.mark_branch_replication_ready(&message.core_bid),
            // a redelivered registration is not an error worth failing the
            // peer over
            Err(RegisterError::BranchAlreadyExists) => {
                tracing::warn!(
                    "replicated branch {} already registered on {}",
                    message.core_bid,
                    message.rid
                );
            }
            Err(err) => {
                tracing::error!(
                    "could not apply replicated branch {} on {}: {}",
                    message.core_bid,
                    message.rid,
                    err
                );
                return Err(ApiError::invalid_argument(err.to_string()));
            }
        }

        if versioned {
            request
                .versions()
                .update_remote_version(&message.context.sid, message.context.version);
        }
        Ok(())
    }

    #[instrument(level = "debug", skip_all, fields(subsys = "ReplicaService", rid = %message.rid, region = %message.region))]
    pub fn close_branch(&self, message: ReplicaCloseBranch) -> Result<(), ApiError> {
        if !self.consistency_checks {
            return Ok(());
        }

        let request = self.get_request(&message.rid);

        if self.async_replication && message.context.version > 0 {
            // observe the registration this close rides on
            request
                .versions()
                .wait_remote_version(&message.context.sid, message.context.version);
        }

        match self
            .server
            .close_branch(&request, &message.core_bid, &message.region)
        {
            CloseOutcome::Closed | CloseOutcome::AlreadyClosed => Ok(()),
            CloseOutcome::BranchNotFound => {
                tracing::error!(
                    "replicated close: branch {} not found on {}",
                    message.core_bid,
                    message.rid
                );
                Err(ApiError::not_found(errmsg::BRANCH_NOT_FOUND))
            }
            CloseOutcome::RegionNotFound => {
                tracing::error!(
                    "replicated close: region '{}' not found on branch {} of {}",
                    message.region,
                    message.core_bid,
                    message.rid
                );
                Err(ApiError::not_found(errmsg::INVALID_REGION))
            }
        }
    }

    #[instrument(level = "debug", skip_all, fields(subsys = "ReplicaService", rid = %message.rid))]
    pub fn add_wait_log(&self, message: ReplicaWaitLog) -> Result<(), ApiError> {
        if !self.consistency_checks {
            return Ok(());
        }

        let request = self.get_request(&message.rid);
        if message.target_service.is_empty() {
            if !request.add_remote_wait_log(&message.async_zone) {
                return Err(ApiError::invalid_argument(errmsg::INVALID_ASYNC_ZONE));
            }
        } else if !request.add_service_wait_marker(&message.target_service) {
            // the service context may not have replicated yet; the marker
            // is a best-effort hint, so skip rather than fail
            tracing::debug!(
                "skipping wait marker for unreplicated service '{}'",
                message.target_service
            );
        }
        Ok(())
    }

    #[instrument(level = "debug", skip_all, fields(subsys = "ReplicaService", rid = %message.rid))]
    pub fn remove_wait_log(&self, message: ReplicaWaitLog) -> Result<(), ApiError> {
        if !self.consistency_checks {
            return Ok(());
        }

        let request = self.get_request(&message.rid);
        if message.target_service.is_empty() {
            if !request.remove_remote_wait_log(&message.async_zone) {
                return Err(ApiError::invalid_argument(errmsg::INVALID_ASYNC_ZONE));
            }
        } else if !request.remove_service_wait_marker(&message.target_service) {
            tracing::debug!(
                "skipping wait marker removal for unreplicated service '{}'",
                message.target_service
            );
        }
        Ok(())
    }
}
