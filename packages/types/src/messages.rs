//! Client-facing request/response shapes.
//!
//! Optional string fields default to empty rather than `Option` — an empty
//! service, tag, region or zone means "not specified", mirroring how the
//! identifiers themselves use the empty string for the global region and
//! the root service.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::RequestStatus;

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct RegisterRequest {
    /// Empty rid asks the server to generate one.
    #[serde(default)]
    pub rid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RegisterRequestResponse {
    pub rid: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct RegisterBranchRequest {
    pub rid: String,
    /// Pre-composed bid; empty asks the server to generate one.
    #[serde(default)]
    pub bid: String,
    pub service: String,
    #[serde(default)]
    pub tag: String,
    /// Async zone the branch belongs to; empty means the root zone.
    #[serde(default)]
    pub async_zone: String,
    /// Regions fanned out by this branch; empty means the global region.
    #[serde(default)]
    pub regions: Vec<String>,
    /// Service that issued the registration, for the dependency graph.
    #[serde(default)]
    pub parent_service: String,
    /// Publish the new branch to matching subscribers.
    #[serde(default)]
    pub monitor: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RegisterBranchResponse {
    pub rid: String,
    /// Composed `<core bid>:<rid>`.
    pub bid: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct BranchSpec {
    pub service: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub regions: Vec<String>,
    #[serde(default)]
    pub async_zone: String,
    #[serde(default)]
    pub monitor: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct RegisterBranchesRequest {
    pub rid: String,
    #[serde(default)]
    pub parent_service: String,
    pub branches: Vec<BranchSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RegisterBranchesResponse {
    pub rid: String,
    pub bids: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct CloseBranchRequest {
    /// Composed `<core bid>:<rid>`.
    pub bid: String,
    #[serde(default)]
    pub region: String,
    /// Bids whose registration must be visible on this replica before the
    /// close is applied (async replication only).
    #[serde(default)]
    pub visible_bids: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct WaitRequest {
    pub rid: String,
    #[serde(default)]
    pub service: String,
    /// Multiple service contexts; mutually exclusive with `service`.
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub async_zone: String,
    /// Service issuing the wait, for cycle bookkeeping.
    #[serde(default)]
    pub current_service: String,
    /// Also wait on the target service's dependency subtree.
    #[serde(default)]
    pub wait_deps: bool,
    /// Seconds; 0 means no overall deadline.
    #[serde(default)]
    pub timeout: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct WaitResponse {
    pub prevented_inconsistency: bool,
    pub timed_out: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct CheckStatusRequest {
    pub rid: String,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub async_zone: String,
    /// Also report per-tag and per-region status from the service node.
    #[serde(default)]
    pub detailed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CheckStatusResponse {
    pub status: RequestStatus,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tagged: BTreeMap<String, RequestStatus>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub regions: BTreeMap<String, RequestStatus>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct FetchDependenciesRequest {
    pub rid: String,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub async_zone: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct FetchDependenciesResponse {
    pub deps: Vec<String>,
    pub indirect_deps: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct AddAsyncZoneRequest {
    pub rid: String,
    /// Zone the new sub-zone hangs off; empty means the root zone.
    #[serde(default)]
    pub async_zone: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AddAsyncZoneResponse {
    pub async_zone: String,
}

/// Query parameters of the subscribe stream.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct SubscribeParams {
    pub service: String,
    #[serde(default)]
    pub region: String,
}

/// One element of the subscribe stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct SubscriptionEvent {
    pub bid: String,
    #[serde(default)]
    pub tag: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_request_defaults() {
        let req: WaitRequest = serde_json::from_str(r#"{"rid": "abc"}"#).unwrap();
        assert_eq!(req.rid, "abc");
        assert!(req.service.is_empty());
        assert!(req.services.is_empty());
        assert_eq!(req.timeout, 0);
        assert!(!req.wait_deps);
    }

    #[test]
    fn check_status_response_skips_empty_maps() {
        let resp = CheckStatusResponse {
            status: RequestStatus::Closed,
            tagged: BTreeMap::new(),
            regions: BTreeMap::new(),
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert_eq!(json, r#"{"status":"closed"}"#);
    }
}
