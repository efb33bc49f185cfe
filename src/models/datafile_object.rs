//! Represents one physical copy (replica) of a DataFile inside a StorageBox.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A replica row. At most one exists per (datafile, storage box).
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct DataFileObject {
    pub id: Uuid,

    /// Logical file this replica stores.
    pub datafile_id: Uuid,

    /// Box the bytes live in.
    pub storage_box_id: Uuid,

    /// Backend-relative path or key. `None` until the first write.
    pub uri: Option<String>,

    pub created_time: DateTime<Utc>,

    /// Whether the stored bytes matched the DataFile at `last_verified_time`.
    pub verified: bool,

    pub last_verified_time: Option<DateTime<Utc>>,
}

impl DataFileObject {
    pub fn new(datafile_id: Uuid, storage_box_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            datafile_id,
            storage_box_id,
            uri: None,
            created_time: Utc::now(),
            verified: false,
            last_verified_time: None,
        }
    }
}
