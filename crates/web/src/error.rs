//! API errors as RFC 7807 problem details.
//!
//! Controller failures keep their taxonomy: the problem body carries the
//! error kind as an extension member, and the status separates caller
//! mistakes (4xx) from an unreachable source or cluster (502) and a
//! controller that cannot take work (503).

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use keel_events::ErrorKind;
use serde::Serialize;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    /// The source or a cluster failed the request.
    #[error("{message}")]
    Upstream { kind: ErrorKind, message: String },

    /// The source rejected the request's content.
    #[error("{message}")]
    Unprocessable { kind: ErrorKind, message: String },

    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Internal(String),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Upstream { .. } => StatusCode::BAD_GATEWAY,
            Self::Unprocessable { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Error kind reported to clients, when the failure has one.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Upstream { kind, .. } | Self::Unprocessable { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

impl From<keel_reconciler::Error> for AppError {
    fn from(err: keel_reconciler::Error) -> Self {
        use keel_reconciler::Error;

        let message = err.to_string();
        match err.root_cause() {
            Error::ApplicationNotFound { .. } => Self::NotFound(message),
            Error::ApplicationExists { .. } => Self::Conflict(message),
            Error::InvalidConfig { .. } => Self::BadRequest(message),
            Error::Stopped => Self::Unavailable(message),
            Error::RevisionNotFound { .. } | Error::MalformedManifest { .. } => {
                Self::Unprocessable {
                    kind: err.kind(),
                    message,
                }
            }
            Error::SourceUnreachable { .. }
            | Error::ClusterUnreachable { .. }
            | Error::Unauthorized { .. }
            | Error::RateLimited { .. }
            | Error::ValidationRejected { .. } => Self::Upstream {
                kind: err.kind(),
                message,
            },
            _ => Self::Internal(message),
        }
    }
}

/// RFC 7807 problem details body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    #[serde(rename = "type")]
    problem_type: &'static str,
    title: String,
    status: u16,
    detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<ErrorKind>,
}

impl ErrorResponse {
    pub fn from_error(err: &AppError) -> Self {
        let status = err.status_code();
        Self {
            problem_type: "about:blank",
            title: status.canonical_reason().unwrap_or("Error").to_string(),
            status: status.as_u16(),
            detail: err.to_string(),
            kind: err.kind(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorResponse::from_error(&self);
        (
            self.status_code(),
            [(header::CONTENT_TYPE, "application/problem+json")],
            Json(body),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_reconciler::Error;

    #[test]
    fn test_registry_errors_are_client_errors() {
        let not_found: AppError = Error::application_not_found("shop").into();
        assert_eq!(not_found.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(not_found.kind(), None);

        let exists: AppError = Error::application_exists("shop").into();
        assert_eq!(exists.status_code(), StatusCode::CONFLICT);

        let stopped: AppError = Error::Stopped.into();
        assert_eq!(stopped.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_source_and_cluster_errors_keep_their_kind() {
        let unreachable: AppError = Error::source_unreachable("shop.git", "timeout").into();
        assert_eq!(unreachable.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(unreachable.kind(), Some(ErrorKind::SourceUnreachable));

        let missing: AppError = Error::revision_not_found("shop.git", "v9").into();
        assert_eq!(missing.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(missing.kind(), Some(ErrorKind::RevisionNotFound));

        let cluster: AppError = Error::cluster_unreachable("timeout").into();
        assert_eq!(cluster.kind(), Some(ErrorKind::ClusterUnreachable));
    }

    #[test]
    fn test_problem_details_body() {
        let body = ErrorResponse::from_error(&AppError::BadRequest("repo_url is empty".into()));
        assert_eq!(body.status, 400);
        assert_eq!(body.title, "Bad Request");
        assert_eq!(body.detail, "repo_url is empty");
        assert!(body.kind.is_none());
    }
}
