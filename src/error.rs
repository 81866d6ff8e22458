use crate::lifecycle::{CancelCause, LifecycleState};
use std::sync::Arc;
use thiserror::Error;

/// Crate-wide error type.
///
/// Errors are `Clone` because the lifecycle controller keeps the failure cause
/// as `last_error` and also delivers it over the async error channel. Sources
/// that are not `Clone` themselves are held behind an `Arc`.
#[derive(Error, Debug, Clone)]
pub enum ServerError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error("failed to listen on {address}: {source}")]
    Listen {
        address: String,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("failed to create transport: {details}")]
    Transport { details: String },

    #[error("serve error: {details}")]
    Serve { details: String },

    #[error("server is not running (state: {state})")]
    NotRunning { state: LifecycleState },

    #[error("Configuration error: {0}")]
    Config(Arc<config::ConfigError>),

    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("System error: {message}")]
    System { message: String },
}

/// Errors raised by the lifecycle state machine itself.
#[derive(Error, Debug, Clone)]
pub enum LifecycleError {
    #[error("cannot {operation} server in state {state}")]
    InvalidTransition {
        operation: &'static str,
        state: LifecycleState,
    },

    #[error("context cancelled before start: {cause}")]
    CancelledBeforeStart { cause: CancelCause },

    #[error("startup timeout: {cause}")]
    StartupTimeout { cause: CancelCause },

    #[error("waiting for server ready: {cause}")]
    ReadyWait { cause: CancelCause },

    #[error("server failed before becoming ready")]
    FailedBeforeReady,

    #[error(transparent)]
    InvalidState(#[from] InvalidStateError),
}

/// A raw state value outside the six defined lifecycle states.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("invalid lifecycle state {value}: must be 0 (created) through 5 (failed)")]
pub struct InvalidStateError {
    pub value: u8,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("failed to generate token: {details}")]
    Generation { details: String },

    #[error("invalid token value {value:?}: must be non-empty")]
    InvalidValue { value: String },
}

impl ServerError {
    pub fn system<S: Into<String>>(message: S) -> Self {
        Self::System {
            message: message.into(),
        }
    }

    pub fn transport<S: Into<String>>(details: S) -> Self {
        Self::Transport {
            details: details.into(),
        }
    }

    pub fn serve<S: Into<String>>(details: S) -> Self {
        Self::Serve {
            details: details.into(),
        }
    }

    /// True when this error (at any depth) is an out-of-range state value.
    pub fn is_invalid_state(&self) -> bool {
        matches!(
            self,
            ServerError::Lifecycle(LifecycleError::InvalidState(_))
        )
    }

    /// True for startup failures caused by the startup deadline or the
    /// caller's signal firing before the server became ready.
    pub fn is_startup_timeout(&self) -> bool {
        matches!(
            self,
            ServerError::Lifecycle(LifecycleError::StartupTimeout { .. })
        )
    }
}

impl From<InvalidStateError> for ServerError {
    fn from(err: InvalidStateError) -> Self {
        ServerError::Lifecycle(LifecycleError::InvalidState(err))
    }
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        ServerError::Io(Arc::new(err))
    }
}

impl From<config::ConfigError> for ServerError {
    fn from(err: config::ConfigError) -> Self {
        ServerError::Config(Arc::new(err))
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;
