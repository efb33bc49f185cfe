//! Represents a StorageBox, a named backing store, and its key/value
//! Options (connection settings) and Attributes (behavioural flags).

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

/// Attribute naming the storage type (`disk`, `tape`, `cache`, ...).
pub const ATTR_TYPE: &str = "type";
/// Attribute that, when `false`, forbids deleting bytes from the box.
pub const ATTR_CAN_DELETE: &str = "can_delete";
/// Attribute marking a box as an auto-archive destination.
pub const ATTR_ARCHIVE: &str = "archive";
/// Option holding a filesystem root.
pub const OPT_LOCATION: &str = "location";

#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct StorageBox {
    pub id: Uuid,

    /// Backend identifier, e.g. `filesystem`, `object-store`, `hsm-filesystem`.
    pub backend_class: String,

    /// Unique human-readable name.
    pub name: String,

    pub description: String,

    /// Free-form status such as `online` or `dirty`.
    pub status: String,

    /// Capacity ceiling in bytes.
    pub max_size: i64,

    /// Parent box this one feeds, e.g. a cache in front of tape.
    pub master_box_id: Option<Uuid>,
}

/// Connection setting passed to the backend when it is instantiated.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct StorageBoxOption {
    pub id: Uuid,
    pub storage_box_id: Uuid,
    pub key: String,
    pub value: String,
}

/// Behavioural flag on a box.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct StorageBoxAttribute {
    pub id: Uuid,
    pub storage_box_id: Uuid,
    pub key: String,
    pub value: String,
}

/// Storage tier derived from the `type` attribute.
///
/// Declaration order is the read-preference order: earlier variants are
/// faster to read from and are picked first.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Cache,
    Bundle,
    Disk,
    Tape,
    Temporary,
    Unknown,
}

impl StorageType {
    /// Map a `type` attribute value onto a storage type.
    pub fn from_attribute(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("cache") => Self::Cache,
            Some("bundle") => Self::Bundle,
            Some("disk") | Some("permanent") => Self::Disk,
            Some("tape") => Self::Tape,
            Some("receiving") | Some("temporary") => Self::Temporary,
            _ => Self::Unknown,
        }
    }

    /// Position in the read-preference order, lower is preferred.
    pub fn read_rank(self) -> u8 {
        self as u8
    }

    /// Types whose bytes may not be resident without a recall.
    pub fn is_offline(self) -> bool {
        matches!(self, Self::Tape)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Bundle => "bundle",
            Self::Disk => "disk",
            Self::Tape => "tape",
            Self::Temporary => "temporary",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Interpret an attribute value as a boolean flag.
pub fn attribute_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_preference_order() {
        let mut types = vec![
            StorageType::Unknown,
            StorageType::Tape,
            StorageType::Temporary,
            StorageType::Disk,
            StorageType::Cache,
            StorageType::Bundle,
        ];
        types.sort_by_key(|t| t.read_rank());
        assert_eq!(
            types,
            vec![
                StorageType::Cache,
                StorageType::Bundle,
                StorageType::Disk,
                StorageType::Tape,
                StorageType::Temporary,
                StorageType::Unknown,
            ]
        );
    }

    #[test]
    fn type_attribute_mapping() {
        assert_eq!(StorageType::from_attribute(Some("receiving")), StorageType::Temporary);
        assert_eq!(StorageType::from_attribute(Some("TAPE")), StorageType::Tape);
        assert_eq!(StorageType::from_attribute(Some("weird")), StorageType::Unknown);
        assert_eq!(StorageType::from_attribute(None), StorageType::Unknown);
        assert!(StorageType::Tape.is_offline());
        assert!(!StorageType::Cache.is_offline());
    }

    #[test]
    fn flag_values() {
        assert!(attribute_flag("True"));
        assert!(!attribute_flag("false"));
        assert!(!attribute_flag(""));
    }
}
