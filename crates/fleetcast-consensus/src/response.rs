//! Responses from applying commands to the state machine.

use fleetcast_core::{Error, ErrorKind};
use serde::{Deserialize, Serialize};

/// Response from applying a [`crate::Command`].
///
/// Apply errors are values, not failures: an `Error` response is returned
/// to the proposer after the command is committed, and replication is never
/// aborted by a rejected command. Every node applying the same rejected
/// command computes the same rejection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub enum CommandResponse {
    /// The command was applied.
    #[default]
    Ok,

    /// The command was rejected by the state machine.
    Error {
        /// Stable error kind.
        kind: ErrorKind,
        /// Human-readable message.
        message: String,
    },
}

impl CommandResponse {
    /// Creates an error response from a core error.
    #[must_use]
    pub fn from_error(err: &Error) -> Self {
        Self::Error { kind: err.kind(), message: err.message.clone() }
    }

    /// Returns `true` if the command was applied.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    /// Converts this response into a `Result`.
    ///
    /// # Errors
    ///
    /// Returns the carried error if this is an `Error` response.
    pub fn into_result(self) -> fleetcast_core::Result<()> {
        match self {
            Self::Ok => Ok(()),
            Self::Error { kind, message } => Err(Error::new(kind, message)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_error_round_trip() {
        let response = CommandResponse::from_error(&Error::already_exists("process p1@d"));
        assert!(!response.is_ok());

        let err = response.into_result().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert!(err.message.contains("p1@d"));
    }

    #[test]
    fn test_serialization() {
        let response = CommandResponse::Error {
            kind: ErrorKind::NotFound,
            message: "nope".to_string(),
        };
        let bytes = bincode::serialize(&response).unwrap();
        let back: CommandResponse = bincode::deserialize(&bytes).unwrap();
        assert!(matches!(back, CommandResponse::Error { kind: ErrorKind::NotFound, .. }));
    }
}
