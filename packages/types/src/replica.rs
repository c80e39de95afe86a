//! Peer-facing replication shapes.
//!
//! These mirror the client messages but carry the identifiers already
//! assigned by the origin replica (`core_bid`), plus a `ReplicaContext`
//! stamping origin and version for FIFO apply under async replication.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct ReplicaContext {
    #[serde(default)]
    pub sid: String,
    #[serde(default)]
    pub version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ReplicaRegisterRequest {
    pub rid: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct ReplicaRegisterBranch {
    pub rid: String,
    #[serde(default)]
    pub async_zone: String,
    /// The bid the origin committed to; every replica stores the same one.
    pub core_bid: String,
    pub service: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub regions: Vec<String>,
    #[serde(default)]
    pub parent_service: String,
    #[serde(default)]
    pub monitor: bool,
    #[serde(default)]
    pub context: ReplicaContext,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct ReplicaCloseBranch {
    pub rid: String,
    pub core_bid: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub context: ReplicaContext,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct ReplicaWaitLog {
    pub rid: String,
    #[serde(default)]
    pub async_zone: String,
    /// When set the marker targets a service node instead of the zone log.
    #[serde(default)]
    pub target_service: String,
}
