use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::proto::{Code, Status};

/// Failures talking to the signaling service itself.
#[derive(Debug, Clone, Error)]
pub enum SignalingError {
    #[error("signaling service returned {0}")]
    Status(Status),
    #[error("signaling transport failed: {0}")]
    Transport(String),
    #[error("signaling connection closed")]
    Closed,
}

impl SignalingError {
    pub fn status(&self) -> Option<&Status> {
        match self {
            SignalingError::Status(status) => Some(status),
            _ => None,
        }
    }

    pub fn is_unimplemented(&self) -> bool {
        self.status()
            .is_some_and(|status| status.code == Code::Unimplemented)
    }
}

#[derive(Debug, Clone, Error)]
pub enum DialError {
    /// The signaling service has no WebRTC signaling capability. Callers are
    /// expected to fall back to another dial strategy.
    #[error("no signaler present")]
    NoSignaler,
    #[error("signaling protocol violation: {0}")]
    Protocol(String),
    #[error("webrtc negotiation failed: {0}")]
    Negotiation(String),
    #[error("session description codec failed: {0}")]
    Codec(String),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error("dial canceled")]
    Canceled,
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("background task panicked: {0}")]
    TaskPanicked(String),
    #[error("remote peer reported error: {0}")]
    Remote(Status),
    #[error("{}", JoinedErrors(.0))]
    Multiple(Vec<DialError>),
}

impl DialError {
    pub fn protocol(message: impl Into<String>) -> Self {
        DialError::Protocol(message.into())
    }

    pub fn negotiation(err: impl fmt::Display) -> Self {
        DialError::Negotiation(err.to_string())
    }

    /// Appends the error of a cleanup step, if any. The original error stays
    /// first and nothing is dropped.
    pub fn combine(self, other: Result<(), DialError>) -> DialError {
        match other {
            Ok(()) => self,
            Err(other) => {
                let mut errors = self.into_errors();
                errors.extend(other.into_errors());
                DialError::Multiple(errors)
            }
        }
    }

    /// The errors this value stands for, flattened.
    #[cfg(test)]
    fn errors(&self) -> Vec<&DialError> {
        match self {
            DialError::Multiple(errors) => errors.iter().flat_map(DialError::errors).collect(),
            other => vec![other],
        }
    }

    fn into_errors(self) -> Vec<DialError> {
        match self {
            DialError::Multiple(errors) => errors
                .into_iter()
                .flat_map(DialError::into_errors)
                .collect(),
            other => vec![other],
        }
    }

    /// The first, triggering error.
    pub fn primary(&self) -> &DialError {
        match self {
            DialError::Multiple(errors) => errors.first().map_or(self, DialError::primary),
            other => other,
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self.primary(), DialError::Canceled)
    }

    pub fn is_no_signaler(&self) -> bool {
        matches!(self.primary(), DialError::NoSignaler)
    }

    pub fn is_protocol_violation(&self) -> bool {
        matches!(self.primary(), DialError::Protocol(_))
    }

    /// Status reported to the signaling service when an exchange fails.
    pub fn to_status(&self) -> Status {
        match self.primary() {
            DialError::Canceled => Status::new(Code::Canceled, self.to_string()),
            DialError::Timeout(_) => Status::new(Code::DeadlineExceeded, self.to_string()),
            DialError::NoSignaler => Status::new(Code::Unimplemented, self.to_string()),
            DialError::Protocol(_) => Status::new(Code::InvalidArgument, self.to_string()),
            DialError::Signaling(SignalingError::Status(status)) | DialError::Remote(status) => {
                status.clone()
            }
            _ => Status::new(Code::Unknown, self.to_string()),
        }
    }
}

/// Merges the result of a cleanup step into a result, keeping both errors.
pub fn combine<T>(
    result: Result<T, DialError>,
    cleanup: Result<(), DialError>,
) -> Result<T, DialError> {
    match (result, cleanup) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(err)) => Err(err),
        (Err(err), cleanup) => Err(err.combine(cleanup)),
    }
}

struct JoinedErrors<'a>(&'a [DialError]);

impl fmt::Display for JoinedErrors<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, err) in self.0.iter().enumerate() {
            if idx > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}
