use std::io;
use thiserror::Error;

use super::state::InvalidTransition;

/// Failures surfaced by the upload client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("unsupported media type `{0}`")]
    UnsupportedMediaType(String),

    #[error("payload is empty")]
    EmptyPayload,

    #[error("part {part_number} failed: {cause}")]
    PartUploadFailed {
        part_number: u32,
        #[source]
        cause: Box<ClientError>,
    },

    /// The server answered with an error status.
    #[error("request rejected with {status} {code}: {message}")]
    Rejected {
        status: u16,
        code: String,
        message: String,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("upload cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    State(#[from] InvalidTransition),
}

impl ClientError {
    /// Whether retrying the same request may succeed. 4xx answers are final,
    /// except request timeout and throttling.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Transport(_) => true,
            ClientError::Rejected { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            _ => false,
        }
    }

    /// The error code the server attached, if this is a rejection.
    pub fn code(&self) -> Option<&str> {
        match self {
            ClientError::Rejected { code, .. } => Some(code),
            ClientError::PartUploadFailed { cause, .. } => cause.code(),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        ClientError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejected(status: u16) -> ClientError {
        ClientError::Rejected {
            status,
            code: "X".into(),
            message: String::new(),
        }
    }

    #[test]
    fn classifies_transient_failures() {
        assert!(ClientError::Transport("reset".into()).is_transient());
        assert!(rejected(503).is_transient());
        assert!(rejected(429).is_transient());
        assert!(!rejected(403).is_transient());
        assert!(!rejected(410).is_transient());
        assert!(!ClientError::Cancelled.is_transient());
    }

    #[test]
    fn part_failure_exposes_inner_code() {
        let err = ClientError::PartUploadFailed {
            part_number: 3,
            cause: Box::new(rejected(410)),
        };
        assert_eq!(err.code(), Some("X"));
        assert!(err.to_string().contains("part 3"));
    }
}
