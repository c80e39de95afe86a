use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Open/closed state of a request, a branch, or a scoped view of either.
///
/// `Unknown` is reserved for probes against a context that was never
/// registered (a region or service with no branches).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Open,
    Closed,
    Unknown,
}

impl RequestStatus {
    pub fn is_closed(&self) -> bool {
        matches!(self, RequestStatus::Closed)
    }
}
