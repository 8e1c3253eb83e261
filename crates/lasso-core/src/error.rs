use lasso_proto::protocol::{ErrorKind, SessionState};
use thiserror::Error;

use crate::client::SourceError;

/// Why a session command was refused.  State is never changed by a failed
/// command.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    #[error("invalid username {username:?}: {reason}")]
    InvalidUsername {
        username: String,
        reason: &'static str,
    },
    #[error("the username {0} doesn't exist")]
    UnknownUser(String),
    #[error("cannot {op} a session that is {from}")]
    InvalidTransition { from: SessionState, op: &'static str },
    #[error("could not look up user: {0}")]
    Lookup(SourceError),
    #[error("user lookup timed out")]
    LookupTimeout,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidUsername { .. } => ErrorKind::InvalidUsername,
            EngineError::UnknownUser(_) => ErrorKind::UnknownUser,
            EngineError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            EngineError::Lookup(e) => e.kind(),
            EngineError::LookupTimeout => ErrorKind::Timeout,
        }
    }
}

impl From<SourceError> for EngineError {
    fn from(e: SourceError) -> Self {
        match e {
            SourceError::UnknownUser(name) => EngineError::UnknownUser(name),
            other => EngineError::Lookup(other),
        }
    }
}
