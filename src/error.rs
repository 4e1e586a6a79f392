use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Classification of a failed remote call, used to drive retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    /// HTTP 429
    RateLimited,
    /// HTTP 5xx
    ServerError,
    /// HTTP 423: the project has a conflicting operation running
    Busy,
    /// Connect failure or timeout before a response arrived
    Network,
    /// HTTP 401 / 403
    Unauthorized,
    /// HTTP 404
    NotFound,
    /// Any other non-success status
    Rejected,
    /// The response body could not be decoded
    Malformed,
}

impl RemoteErrorKind {
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            200..=299 => None,
            429 => Some(Self::RateLimited),
            423 => Some(Self::Busy),
            401 | 403 => Some(Self::Unauthorized),
            404 => Some(Self::NotFound),
            500 | 502 | 503 | 504 => Some(Self::ServerError),
            _ => Some(Self::Rejected),
        }
    }
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RateLimited => "RateLimited",
            Self::ServerError => "ServerError",
            Self::Busy => "Busy",
            Self::Network => "Network",
            Self::Unauthorized => "Unauthorized",
            Self::NotFound => "NotFound",
            Self::Rejected => "Rejected",
            Self::Malformed => "Malformed",
        };
        f.write_str(name)
    }
}

/// A single failed attempt against the remote API.
#[derive(Debug, Clone)]
pub struct RemoteFailure {
    pub kind: RemoteErrorKind,
    pub status: Option<u16>,
    pub message: String,
    /// Server-provided `Retry-After`, when present
    pub retry_after: Option<Duration>,
}

impl RemoteFailure {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BranchError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("{operation} failed ({kind}): {message}")]
    Remote {
        operation: String,
        kind: RemoteErrorKind,
        status: Option<u16>,
        message: String,
    },

    #[error("{operation} gave up after {attempts} attempts, last error kind {kind}: {message}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        kind: RemoteErrorKind,
        message: String,
    },

    #[error("timed out after {waited:?} waiting for {what}")]
    CoordinationTimeout { what: String, waited: Duration },

    #[error("signal '{signal}' reported failure: {message}")]
    SignalFailed { signal: String, message: String },

    #[error("the process creating '{key}' failed: {message}")]
    CreatorFailed { key: String, message: String },

    #[error("refusing to {action} branch {branch_id}: it is the project's default branch")]
    UnsafeTarget { action: String, branch_id: String },

    #[error("branch {branch_id} has no parent, cannot reset")]
    MissingParent { branch_id: String },

    #[error("migrations failed on branch {branch_id}: {message}")]
    Migration { branch_id: String, message: String },

    #[error("endpoint {endpoint_id} did not become active within {waited:?} (last state: {state})")]
    EndpointTimeout {
        endpoint_id: String,
        state: String,
        waited: Duration,
    },

    #[error("operation {operation_id} on branch {branch_id} did not finish within {waited:?} (last status: {status})")]
    OperationTimeout {
        operation_id: String,
        branch_id: String,
        status: String,
        waited: Duration,
    },

    #[error("operation {operation_id} on branch {branch_id} ended with status '{status}'")]
    OperationFailed {
        operation_id: String,
        branch_id: String,
        status: String,
    },

    #[error("{helper} requires a database driver. {guidance}")]
    DriverMissing { helper: String, guidance: String },

    #[error("scope for {name} deactivated out of order (stack depth {depth}, scope depth {position})")]
    ScopeOrder {
        name: String,
        depth: usize,
        position: usize,
    },

    #[error("{name} is already scoped by another thread; tests needing different values of it cannot run in parallel within one process")]
    EnvConflict { name: String },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid coordination record {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl BranchError {
    pub fn remote(operation: &str, failure: RemoteFailure) -> Self {
        BranchError::Remote {
            operation: operation.to_string(),
            kind: failure.kind,
            status: failure.status,
            message: failure.message,
        }
    }

    pub fn io(path: impl fmt::Display, source: std::io::Error) -> Self {
        BranchError::Io {
            path: path.to_string(),
            source,
        }
    }

    pub fn json(path: impl fmt::Display, source: serde_json::Error) -> Self {
        BranchError::Json {
            path: path.to_string(),
            source,
        }
    }

    /// The remote error kind behind this error, if it came from the remote API.
    pub fn remote_kind(&self) -> Option<RemoteErrorKind> {
        match self {
            BranchError::Remote { kind, .. } | BranchError::RetriesExhausted { kind, .. } => {
                Some(*kind)
            }
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.remote_kind() == Some(RemoteErrorKind::NotFound)
    }
}

pub type Result<T, E = BranchError> = std::result::Result<T, E>;
