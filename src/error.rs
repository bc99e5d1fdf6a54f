// src/error.rs
//
// Controller error classification and its mapping onto gRPC status codes

use std::path::PathBuf;
use thiserror::Error;
use tonic::Status;

use crate::controller::State;

#[derive(Debug, Error)]
pub enum ControllerError {
    /// Rejected before any side effect: bad index, missing binary, bad directory
    #[error("configuration error: {0:#}")]
    Configuration(anyhow::Error),

    #[error("failed to start {program:?}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to signal PID {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: nix::Error,
    },

    #[error("{operation} is not allowed in state {state:?}: {reason}")]
    InvalidState {
        operation: &'static str,
        state: State,
        reason: &'static str,
    },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<ControllerError> for Status {
    fn from(e: ControllerError) -> Self {
        let msg = e.to_string();
        match e {
            ControllerError::Configuration(_) => Status::invalid_argument(msg),
            ControllerError::InvalidState { .. } => Status::failed_precondition(msg),
            ControllerError::Spawn { .. }
            | ControllerError::Signal { .. }
            | ControllerError::Internal(_) => Status::internal(msg),
        }
    }
}
