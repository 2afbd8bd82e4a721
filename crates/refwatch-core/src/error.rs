use std::fmt;

use refwatch_api::{ApiError, TransportError};
use refwatch_store::StoreError;
use thiserror::Error;

/// Steps of the interactive sign-in, carried by auth failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStep {
    OpenSession,
    NavigateToLogin,
    WaitForField,
    SubmitCredentials,
    WaitForRedirect,
    ReadSessionStorage,
    /// Upstream kept answering 401 even with a freshly acquired token
    RepeatedUnauthorized,
}

impl fmt::Display for AuthStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthStep::OpenSession => write!(f, "open browser session"),
            AuthStep::NavigateToLogin => write!(f, "navigate to sign-in"),
            AuthStep::WaitForField => write!(f, "wait for sign-in form"),
            AuthStep::SubmitCredentials => write!(f, "submit credentials"),
            AuthStep::WaitForRedirect => write!(f, "wait for authenticated redirect"),
            AuthStep::ReadSessionStorage => write!(f, "read session tokens"),
            AuthStep::RepeatedUnauthorized => write!(f, "repeated unauthorized response"),
        }
    }
}

/// All the ways a poll cycle can go wrong
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Authentication failed at step '{step}': {message}")]
    Auth { step: AuthStep, message: String },

    #[error("Malformed upstream payload: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Upstream answered with status {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("Notification via {channel} failed: {message}")]
    Notification { channel: String, message: String },

    #[error("Store operation failed: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn auth(step: AuthStep, message: impl Into<String>) -> Self {
        Error::Auth {
            step,
            message: message.into(),
        }
    }

    pub fn notification(channel: impl Into<String>, message: impl fmt::Display) -> Self {
        Error::Notification {
            channel: channel.into(),
            message: message.to_string(),
        }
    }

    /// Step name for auth failures, used in log lines
    pub fn auth_step(&self) -> Option<AuthStep> {
        match self {
            Error::Auth { step, .. } => Some(*step),
            _ => None,
        }
    }
}

impl From<ApiError> for Error {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Transport(e) => Error::Transport(e),
            ApiError::Parse(e) => Error::Parse(e),
            ApiError::UnexpectedStatus { status, body } => Error::Upstream { status, body },
            ApiError::Body(e) => Error::Upstream {
                status: e.status().map(|s| s.as_u16()).unwrap_or_default(),
                body: e.to_string(),
            },
        }
    }
}
