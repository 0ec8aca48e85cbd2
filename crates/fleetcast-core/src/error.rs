//! Error types for fleetcast with stable, caller-visible error kinds.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A specialized `Result` type for fleetcast operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Stable error kinds surfaced to callers.
///
/// Every failure that crosses a component boundary is classified as one of
/// these kinds. The kinds are part of the wire contract: the cluster API
/// serializes them into error payloads and the forwarder maps them back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// A mutation was submitted to a node that is not the raft leader.
    NotLeader,
    /// The cluster has no leader or the local state machine is restoring.
    Degraded,
    /// A process, identity, node or file is absent.
    NotFound,
    /// A process id/domain pair or identity name collides.
    AlreadyExists,
    /// Authorization denied the request.
    Forbidden,
    /// Validation failed: bad name, unknown command verb, unknown node state.
    InvalidArgument,
    /// An apply, forward or dial exceeded its budget.
    Timeout,
    /// A peer returned a non-2xx response.
    Upstream,
    /// Serialization or storage fault.
    Internal,
}

impl ErrorKind {
    /// Returns the stable string form used in wire payloads.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NotLeader => "NotLeader",
            Self::Degraded => "Degraded",
            Self::NotFound => "NotFound",
            Self::AlreadyExists => "AlreadyExists",
            Self::Forbidden => "Forbidden",
            Self::InvalidArgument => "InvalidArgument",
            Self::Timeout => "Timeout",
            Self::Upstream => "Upstream",
            Self::Internal => "Internal",
        }
    }

    /// Parses the stable string form. Unknown strings map to `Internal`.
    #[must_use]
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "NotLeader" => Self::NotLeader,
            "Degraded" => Self::Degraded,
            "NotFound" => Self::NotFound,
            "AlreadyExists" => Self::AlreadyExists,
            "Forbidden" => Self::Forbidden,
            "InvalidArgument" => Self::InvalidArgument,
            "Timeout" => Self::Timeout,
            "Upstream" => Self::Upstream,
            _ => Self::Internal,
        }
    }

    /// Returns the HTTP status code for this kind.
    #[must_use]
    pub const fn http_status(&self) -> u16 {
        match self {
            Self::NotFound => 404,
            Self::AlreadyExists => 409,
            Self::Forbidden => 403,
            Self::InvalidArgument => 400,
            Self::NotLeader => 421,
            Self::Degraded => 503,
            Self::Timeout => 504,
            Self::Upstream => 502,
            Self::Internal => 500,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The fleetcast error type: a kind plus a human-readable message.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct Error {
    /// The stable kind.
    pub kind: ErrorKind,
    /// Human-readable context.
    pub message: String,
}

impl Error {
    /// Creates an error of the given kind.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    /// A `NotLeader` error, optionally with a leader hint.
    #[must_use]
    pub fn not_leader(hint: Option<&str>) -> Self {
        match hint {
            Some(addr) => Self::new(ErrorKind::NotLeader, format!("not leader, try {addr}")),
            None => Self::new(ErrorKind::NotLeader, "not leader"),
        }
    }

    /// A `Degraded` error.
    #[must_use]
    pub fn degraded() -> Self {
        Self::new(ErrorKind::Degraded, "cluster cannot accept writes")
    }

    /// A `NotFound` error.
    #[must_use]
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, what)
    }

    /// An `AlreadyExists` error.
    #[must_use]
    pub fn already_exists(what: impl Into<String>) -> Self {
        Self::new(ErrorKind::AlreadyExists, what)
    }

    /// An `InvalidArgument` error.
    #[must_use]
    pub fn invalid_argument(what: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, what)
    }

    /// A `Timeout` error.
    #[must_use]
    pub fn timeout(what: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, what)
    }

    /// An `Internal` error.
    #[must_use]
    pub fn internal(what: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, what)
    }

    /// Returns the kind of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::new(ErrorKind::Internal, e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::new(ErrorKind::Internal, e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip() {
        for kind in [
            ErrorKind::NotLeader,
            ErrorKind::Degraded,
            ErrorKind::NotFound,
            ErrorKind::AlreadyExists,
            ErrorKind::Forbidden,
            ErrorKind::InvalidArgument,
            ErrorKind::Timeout,
            ErrorKind::Upstream,
            ErrorKind::Internal,
        ] {
            assert_eq!(ErrorKind::from_str_lossy(kind.as_str()), kind);
        }
    }

    #[test]
    fn test_unknown_kind_maps_to_internal() {
        assert_eq!(ErrorKind::from_str_lossy("NoSuchKind"), ErrorKind::Internal);
    }

    #[test]
    fn test_error_display() {
        let err = Error::not_found("process p1@d");
        assert_eq!(err.to_string(), "NotFound: process p1@d");
    }

    #[test]
    fn test_not_leader_hint() {
        let err = Error::not_leader(Some("127.0.0.1:7001"));
        assert!(err.message.contains("127.0.0.1:7001"));
        assert_eq!(err.kind(), ErrorKind::NotLeader);
    }
}
