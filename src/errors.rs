use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

use crate::services::StorageError;

/// Client-visible error: a status, a message, a stable kind tag and, when
/// known, the identifier of the record involved.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
    pub kind: &'static str,
    pub id: Option<String>,
}

impl AppError {
    pub fn new(status: StatusCode, kind: &'static str, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
            kind,
            id: None,
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", msg)
    }

    /// Shortcut for 401 when no actor header was sent
    pub fn unauthenticated(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthenticated", msg)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "kind": self.kind,
            "id": self.id,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        let status = match &err {
            StorageError::DataFileNotFound(_)
            | StorageError::DatasetNotFound(_)
            | StorageError::ReplicaNotFound(_)
            | StorageError::StorageBoxNotFound(_) => StatusCode::NOT_FOUND,
            StorageError::ReplicaNotVerified(_)
            | StorageError::NoVerifiedReplica(_)
            | StorageError::ReplicaNotWritten(_)
            | StorageError::DuplicateReplica { .. }
            | StorageError::DuplicateDataFile(_)
            | StorageError::DuplicateStorageBox(_)
            | StorageError::LocationInUse { .. } => StatusCode::CONFLICT,
            StorageError::UnsupportedBackend { .. }
            | StorageError::MissingChecksum(_)
            | StorageError::MissingSize(_)
            | StorageError::NegativeSize { .. }
            | StorageError::InvalidUri(_) => StatusCode::BAD_REQUEST,
            StorageError::Forbidden { .. } => StatusCode::FORBIDDEN,
            StorageError::NoUsableStorage { .. }
            | StorageError::BackendMisconfigured { .. }
            | StorageError::QueueClosed => StatusCode::SERVICE_UNAVAILABLE,
            StorageError::StreamRead(_) | StorageError::Sqlx(_) | StorageError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            tracing::error!(kind = err.kind(), error = %err, "request failed");
        }
        Self {
            status,
            message: err.to_string(),
            kind: err.kind(),
            id: err.subject_id(),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn storage_errors_map_to_status_and_kind() {
        let id = Uuid::new_v4();
        let err = AppError::from(StorageError::ReplicaNotVerified(id));
        assert_eq!(err.status, StatusCode::CONFLICT);
        assert_eq!(err.kind, "replica_not_verified");
        assert_eq!(err.id, Some(id.to_string()));

        let err = AppError::from(StorageError::UnsupportedBackend {
            storage_box: "disk".into(),
            backend: "filesystem".into(),
        });
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.id.as_deref(), Some("disk"));

        let err = AppError::from(StorageError::DataFileNotFound(id));
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }
}
