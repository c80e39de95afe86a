use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// Status kinds surfaced at the API boundary. The HTTP layer maps these to
/// response codes; replica peers receive the same taxonomy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    AlreadyExists(String),

    #[error("{0}")]
    DeadlineExceeded(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }
}

/// Error body returned by every endpoint on failure.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
}

/// Canonical error messages, kept stable for clients that match on them.
pub mod errmsg {
    pub const SERVICE_EMPTY: &str = "service cannot be empty";
    pub const INVALID_REQUEST: &str = "invalid request identifier";
    pub const BRANCH_NOT_FOUND: &str = "no branch was found with the provided bid";
    pub const INVALID_REGION: &str = "branch does not exist in the given region";
    pub const INVALID_TIMEOUT: &str = "invalid timeout, value must be greater than 0";
    pub const SERVICES_EXCLUSIVE: &str =
        "cannot provide 'service' and 'services' simultaneously";
    pub const TAG_USAGE: &str = "tag can only be specified when service is specified";
    pub const INVALID_SERVICE_REGION: &str = "invalid service or region provided";
    pub const NO_CURRENT_SERVICE: &str =
        "current service branch needs to be registered before any wait call";
    pub const INVALID_TAG: &str = "invalid service tag";
    pub const INVALID_SERVICE: &str = "invalid service";
    pub const INVALID_ASYNC_ZONE: &str = "invalid async zone identifier";
    pub const BRANCH_ALREADY_EXISTS: &str =
        "a branch was already registered with the provided identifier";
    pub const PARSING_BID: &str = "unexpected error parsing composed bid";
    pub const VISIBLE_BIDS_TIMEOUT: &str =
        "timed out waiting for visible bids to be replicated";
}
