//! Represents a dataset, the catalogue container DataFiles belong to.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A dataset row. Only the fields the storage layer needs are kept here;
/// the rest of the catalogue lives in the surrounding application.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Dataset {
    pub id: Uuid,

    /// Free-text description, used when naming on-disk directories.
    pub description: String,

    /// Experiment this dataset is filed under, if any.
    pub experiment_id: Option<Uuid>,

    /// Project this dataset is filed under, if any.
    pub project_id: Option<Uuid>,

    pub created_time: DateTime<Utc>,
}

impl Dataset {
    /// Directory name for this dataset's files: the sanitized description
    /// followed by the dataset id.
    pub fn dir_name(&self) -> String {
        format!("{}-{}", sanitize_component(&self.description), self.id)
    }
}

/// Reduce a free-form string to a safe single path component.
///
/// Whitespace becomes `_`; anything other than ASCII alphanumerics, `-`,
/// `_` and `.` is dropped. Leading dots are stripped so the result can never
/// be `.` or `..`.
pub fn sanitize_component(value: &str) -> String {
    let cleaned: String = value
        .trim()
        .chars()
        .filter_map(|c| {
            if c.is_whitespace() {
                Some('_')
            } else if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                Some(c)
            } else {
                None
            }
        })
        .collect();
    cleaned.trim_start_matches('.').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_spaces_and_drops_symbols() {
        assert_eq!(sanitize_component("  My data/set #1 "), "My_dataset_1");
        assert_eq!(sanitize_component("../etc"), "etc");
        assert_eq!(sanitize_component("beam-time_2024.v2"), "beam-time_2024.v2");
    }

    #[test]
    fn dir_name_appends_id() {
        let ds = Dataset {
            id: Uuid::nil(),
            description: "Scan run".into(),
            experiment_id: None,
            project_id: None,
            created_time: Utc::now(),
        };
        assert_eq!(
            ds.dir_name(),
            "Scan_run-00000000-0000-0000-0000-000000000000"
        );
    }
}
