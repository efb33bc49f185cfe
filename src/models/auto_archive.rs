//! Auto-archive policy records.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

/// Archive state for a single DataFile.
///
/// Offsets are in days after the DataFile's creation time. When an offset is
/// unset here it is inherited from the dataset's experiment, then project.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct DataFileAutoArchive {
    pub id: Uuid,
    pub datafile_id: Uuid,
    pub offset_days: Option<i64>,
    pub delete_offset_days: Option<i64>,
    pub archived: bool,
    pub archived_time: Option<DateTime<Utc>>,
    pub deleted: bool,
    pub deleted_time: Option<DateTime<Utc>>,
}

/// Default offsets configured for an experiment or a project.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct AutoArchiveOffset {
    pub id: Uuid,
    pub scope: String,
    pub scope_id: Uuid,
    pub offset_days: i64,
    pub delete_offset_days: Option<i64>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OffsetScope {
    Experiment,
    Project,
}

impl OffsetScope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Experiment => "experiment",
            Self::Project => "project",
        }
    }
}

impl fmt::Display for OffsetScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Offsets after inheritance has been applied.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EffectiveOffsets {
    pub offset_days: Option<i64>,
    pub delete_offset_days: Option<i64>,
}

impl EffectiveOffsets {
    /// A file is due for archiving once `offset_days` have passed since creation.
    pub fn archive_due(&self, created: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.offset_days
            .is_some_and(|days| created + Duration::days(days) <= now)
    }

    pub fn delete_due(&self, created: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.delete_offset_days
            .is_some_and(|days| created + Duration::days(days) <= now)
    }
}
