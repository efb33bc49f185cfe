use std::io;
use thiserror::Error;
use uuid::Uuid;

use crate::services::checksum::StreamReadError;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("replica {0} is not verified")]
    ReplicaNotVerified(Uuid),
    #[error("datafile {0} has no verified replica")]
    NoVerifiedReplica(Uuid),
    #[error("storage box `{storage_box}` uses unsupported backend `{backend}`")]
    UnsupportedBackend { storage_box: String, backend: String },
    #[error(transparent)]
    StreamRead(#[from] StreamReadError),
    #[error("no usable storage at `{path}`: {reason}")]
    NoUsableStorage { path: String, reason: String },
    #[error("datafile {0} not found")]
    DataFileNotFound(Uuid),
    #[error("dataset {0} not found")]
    DatasetNotFound(Uuid),
    #[error("replica {0} not found")]
    ReplicaNotFound(Uuid),
    #[error("storage box `{0}` not found")]
    StorageBoxNotFound(String),
    #[error("storage box `{0}` already exists")]
    DuplicateStorageBox(String),
    #[error("location `{location}` is already used by storage box `{storage_box}`")]
    LocationInUse { location: String, storage_box: String },
    #[error("storage box `{storage_box}` is misconfigured: {reason}")]
    BackendMisconfigured { storage_box: String, reason: String },
    #[error("replica {0} has not been written yet")]
    ReplicaNotWritten(Uuid),
    #[error("datafile {datafile} already has a replica in storage box {storage_box}")]
    DuplicateReplica { datafile: Uuid, storage_box: Uuid },
    #[error("a datafile named `{0}` already exists at this version")]
    DuplicateDataFile(String),
    #[error("datafile `{0}` has no checksum")]
    MissingChecksum(String),
    #[error("datafile `{0}` has no size")]
    MissingSize(String),
    #[error("datafile `{filename}` has negative size {size}")]
    NegativeSize { filename: String, size: i64 },
    #[error("invalid uri `{0}`")]
    InvalidUri(String),
    #[error("task queue is closed")]
    QueueClosed,
    #[error("actor `{actor}` may not {action} {target}")]
    Forbidden {
        actor: String,
        action: String,
        target: String,
    },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

impl StorageError {
    /// Stable tag used in client-visible error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ReplicaNotVerified(_) => "replica_not_verified",
            Self::NoVerifiedReplica(_) => "no_verified_replica",
            Self::UnsupportedBackend { .. } => "unsupported_backend",
            Self::StreamRead(_) => "stream_read_error",
            Self::NoUsableStorage { .. } => "no_usable_storage",
            Self::DataFileNotFound(_) => "datafile_not_found",
            Self::DatasetNotFound(_) => "dataset_not_found",
            Self::ReplicaNotFound(_) => "replica_not_found",
            Self::StorageBoxNotFound(_) => "storage_box_not_found",
            Self::DuplicateStorageBox(_) => "duplicate_storage_box",
            Self::LocationInUse { .. } => "location_in_use",
            Self::BackendMisconfigured { .. } => "backend_misconfigured",
            Self::ReplicaNotWritten(_) => "replica_not_written",
            Self::DuplicateReplica { .. } => "duplicate_replica",
            Self::DuplicateDataFile(_) => "duplicate_datafile",
            Self::MissingChecksum(_) => "missing_checksum",
            Self::MissingSize(_) => "missing_size",
            Self::NegativeSize { .. } => "negative_size",
            Self::InvalidUri(_) => "invalid_uri",
            Self::QueueClosed => "queue_closed",
            Self::Forbidden { .. } => "forbidden",
            Self::Sqlx(_) => "database_error",
            Self::Io(_) => "io_error",
        }
    }

    /// Identifier of the record the error is about, when there is one.
    pub fn subject_id(&self) -> Option<String> {
        match self {
            Self::ReplicaNotVerified(id)
            | Self::NoVerifiedReplica(id)
            | Self::DataFileNotFound(id)
            | Self::DatasetNotFound(id)
            | Self::ReplicaNotFound(id)
            | Self::ReplicaNotWritten(id) => Some(id.to_string()),
            Self::DuplicateReplica { datafile, .. } => Some(datafile.to_string()),
            Self::UnsupportedBackend { storage_box, .. }
            | Self::BackendMisconfigured { storage_box, .. }
            | Self::LocationInUse { storage_box, .. } => Some(storage_box.clone()),
            Self::StorageBoxNotFound(name) | Self::DuplicateStorageBox(name) => Some(name.clone()),
            _ => None,
        }
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}
