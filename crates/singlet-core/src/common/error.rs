//! Error types for the streaming inference service.
//!
//! This module defines the central `Error` enum, which captures every way a
//! request can be refused or end early. It implements
//! [`IntoResponse`](axum::response::IntoResponse) so handlers can return it
//! directly; the body is always plain text.
//!
//! ## Error Cases
//! - `RejectedAdmission`: Capacity is exhausted. Nothing was registered.
//! - `InvalidPrompt`: The prompt failed validation. Nothing was registered.
//! - `CanceledByClient`: The client disconnected mid-stream.
//! - `CanceledByTimeout`: The request outlived its wall-clock deadline.
//! - `CanceledExternally`: An operator, the eviction policy or shutdown
//!   stopped the request.
//! - `GenerationFailure`: The engine failed for a reason unrelated to
//!   cancellation.
//! - `DuplicateRequest`: A registry insert collided with a live id.
//! - `ServiceShutdown`: A request arrived while the service was shutting down.
//! - `NotFound`: An administrative lookup named an id that is not registered.

use crate::types::{CancelReason, RequestId};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the inference service.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// The admission gate refused the request.
    #[error("Request rejected: {reason}")]
    RejectedAdmission { reason: String },

    /// The prompt was missing or too short.
    #[error("Invalid prompt: {reason}")]
    InvalidPrompt { reason: String },

    /// The client closed the connection before generation finished.
    #[error("Request cancelled by client")]
    CanceledByClient,

    /// The request ran past its deadline.
    #[error("Request cancelled after timeout")]
    CanceledByTimeout,

    /// The request was stopped by something other than its client or timer.
    #[error("Request cancelled: {reason}")]
    CanceledExternally { reason: CancelReason },

    /// The engine failed for a reason unrelated to cancellation.
    #[error("Generation failed: {context}")]
    GenerationFailure { context: String },

    /// A request id was registered twice.
    #[error("Request {id} is already registered")]
    DuplicateRequest { id: RequestId },

    /// The service is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,

    /// No registered request carries this id.
    #[error("Request {id} is not registered")]
    NotFound { id: String },
}

impl Error {
    /// Returns `true` for the three cooperative-cancellation outcomes.
    pub const fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Self::CanceledByClient | Self::CanceledByTimeout | Self::CanceledExternally { .. }
        )
    }

    pub const fn status(&self) -> StatusCode {
        match self {
            Self::InvalidPrompt { .. } => StatusCode::BAD_REQUEST,
            Self::RejectedAdmission { .. } | Self::ServiceShutdown => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::CanceledByClient
            | Self::CanceledByTimeout
            | Self::CanceledExternally { .. }
            | Self::GenerationFailure { .. }
            | Self::DuplicateRequest { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<CancelReason> for Error {
    fn from(reason: CancelReason) -> Self {
        match reason {
            CancelReason::Client => Self::CanceledByClient,
            CancelReason::Timeout => Self::CanceledByTimeout,
            reason => Self::CanceledExternally { reason },
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_reasons_map_onto_the_taxonomy() {
        assert_eq!(Error::from(CancelReason::Client), Error::CanceledByClient);
        assert_eq!(Error::from(CancelReason::Timeout), Error::CanceledByTimeout);
        assert_eq!(
            Error::from(CancelReason::Evicted),
            Error::CanceledExternally {
                reason: CancelReason::Evicted
            }
        );
        assert!(Error::from(CancelReason::Shutdown).is_cancellation());
        assert!(!Error::ServiceShutdown.is_cancellation());
    }

    #[test]
    fn refusals_render_as_plain_text_with_status() {
        let resp = Error::RejectedAdmission {
            reason: "capacity exhausted".to_string(),
        }
        .into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let content_type = resp
            .headers()
            .get(axum::http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        assert!(content_type.starts_with("text/plain"));

        let resp = Error::InvalidPrompt {
            reason: "too short".to_string(),
        }
        .into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
