//! Represents a logical DataFile: the catalogued identity of one file,
//! independent of where (or how many times) its bytes are stored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A catalogued file.
///
/// Size and checksums may be unknown at registration time; verification of a
/// replica backfills them. `verified` is not stored here, it is derived from
/// the replicas (see `StorageService::datafile_verified`).
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct DataFile {
    pub id: Uuid,

    /// Dataset this file belongs to.
    pub dataset_id: Uuid,

    /// Base file name (no directory components).
    pub filename: String,

    /// Optional sub-directory inside the dataset.
    pub directory: Option<String>,

    /// Recorded size in bytes.
    pub size: Option<i64>,

    pub created_time: DateTime<Utc>,
    pub modification_time: Option<DateTime<Utc>>,

    /// MIME type, detected from the filename when unset.
    pub mimetype: Option<String>,

    pub md5sum: Option<String>,
    pub sha512sum: Option<String>,

    /// Soft-delete flag and timestamp.
    pub deleted: bool,
    pub deleted_time: Option<DateTime<Utc>>,

    pub version: i64,
}

impl DataFile {
    /// True when at least one checksum has been recorded.
    pub fn has_checksum(&self) -> bool {
        non_empty(&self.md5sum) || non_empty(&self.sha512sum)
    }

    /// Path of the file relative to its dataset directory.
    pub fn relative_path(&self) -> String {
        match self.directory.as_deref().map(|d| d.trim_matches('/')) {
            Some(dir) if !dir.is_empty() => format!("{}/{}", dir, self.filename),
            _ => self.filename.clone(),
        }
    }
}

/// Fields supplied when a file is registered by upload or ingest.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewDataFile {
    pub dataset_id: Uuid,
    pub filename: String,
    pub directory: Option<String>,
    pub size: Option<i64>,
    pub mimetype: Option<String>,
    pub md5sum: Option<String>,
    pub sha512sum: Option<String>,
    pub modification_time: Option<DateTime<Utc>>,
    /// Defaults to 1.
    pub version: Option<i64>,
}

pub(crate) fn non_empty(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.is_empty())
}

/// Best-effort MIME type guess from a file extension.
pub fn guess_mimetype(filename: &str) -> &'static str {
    let ext = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "txt" | "log" => "text/plain",
        "csv" => "text/csv",
        "htm" | "html" => "text/html",
        "json" => "application/json",
        "xml" => "application/xml",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" | "tgz" => "application/gzip",
        "tar" => "application/x-tar",
        "h5" | "hdf5" | "nxs" => "application/x-hdf5",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "tif" | "tiff" => "image/tiff",
        "mp4" => "video/mp4",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_path_skips_empty_directory() {
        let mut df = DataFile {
            id: Uuid::new_v4(),
            dataset_id: Uuid::new_v4(),
            filename: "a.txt".into(),
            directory: Some("".into()),
            size: None,
            created_time: Utc::now(),
            modification_time: None,
            mimetype: None,
            md5sum: None,
            sha512sum: None,
            deleted: false,
            deleted_time: None,
            version: 1,
        };
        assert_eq!(df.relative_path(), "a.txt");
        df.directory = Some("/raw/run1/".into());
        assert_eq!(df.relative_path(), "raw/run1/a.txt");
        assert!(!df.has_checksum());
        df.md5sum = Some(String::new());
        assert!(!df.has_checksum());
    }

    #[test]
    fn mimetype_guess_is_case_insensitive() {
        assert_eq!(guess_mimetype("IMG_01.TIF"), "image/tiff");
        assert_eq!(guess_mimetype("noext"), "application/octet-stream");
    }
}
