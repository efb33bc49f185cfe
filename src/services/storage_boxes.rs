//! StorageBox registry: lookup, creation, hierarchy and backend resolution.

use rand::seq::SliceRandom;
use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{info, warn};
use uuid::Uuid;

use super::{StorageError, StorageResult, StorageService, error::is_unique_violation};
use crate::backends::{self, BackendConfigError, BackendKind, StorageBackend};
use crate::models::storage_box::{
    ATTR_ARCHIVE, ATTR_CAN_DELETE, ATTR_TYPE, OPT_LOCATION, StorageBox, StorageType,
    attribute_flag,
};

/// Attribute marking the box returned by `get_default_storage_box`.
pub const ATTR_DEFAULT: &str = "default";

const BOX_COLUMNS: &str =
    "id, backend_class, name, description, status, max_size, master_box_id";

#[derive(sqlx::FromRow)]
struct FlaggedBox {
    #[sqlx(flatten)]
    storage_box: StorageBox,
    flag: String,
}

/// Fields for registering a new box.
#[derive(Debug, Clone, Default)]
pub struct NewStorageBox {
    pub name: String,
    pub backend_class: String,
    pub description: String,
    pub max_size: i64,
    pub master_box_id: Option<Uuid>,
    pub options: Vec<(String, String)>,
    pub attributes: Vec<(String, String)>,
}

impl NewStorageBox {
    pub fn new(name: impl Into<String>, backend: BackendKind) -> Self {
        Self {
            name: name.into(),
            backend_class: backend.identifier().to_string(),
            ..Default::default()
        }
    }

    pub fn option(mut self, key: &str, value: impl Into<String>) -> Self {
        self.options.push((key.to_string(), value.into()));
        self
    }

    pub fn attribute(mut self, key: &str, value: impl Into<String>) -> Self {
        self.attributes.push((key.to_string(), value.into()));
        self
    }

    pub fn master(mut self, master_box_id: Uuid) -> Self {
        self.master_box_id = Some(master_box_id);
        self
    }
}

impl StorageService {
    /// Register a box with its options and attributes in one transaction.
    ///
    /// A `location` already used by another box is refused: two boxes over
    /// the same directory would delete each other's bytes.
    pub async fn create_storage_box(&self, new: NewStorageBox) -> StorageResult<StorageBox> {
        if BackendKind::from_identifier(&new.backend_class).is_none() {
            return Err(StorageError::UnsupportedBackend {
                storage_box: new.name,
                backend: new.backend_class,
            });
        }
        for (key, value) in &new.options {
            if key == OPT_LOCATION {
                self.ensure_location_free(value, None).await?;
            }
        }

        let storage_box = StorageBox {
            id: Uuid::new_v4(),
            backend_class: new.backend_class,
            name: new.name,
            description: new.description,
            status: "online".into(),
            max_size: new.max_size,
            master_box_id: new.master_box_id,
        };

        let mut tx = self.db.begin().await?;
        let inserted = sqlx::query(
            "INSERT INTO storage_boxes (id, backend_class, name, description, status, max_size, master_box_id)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(storage_box.id)
        .bind(&storage_box.backend_class)
        .bind(&storage_box.name)
        .bind(&storage_box.description)
        .bind(&storage_box.status)
        .bind(storage_box.max_size)
        .bind(storage_box.master_box_id)
        .execute(&mut *tx)
        .await;
        match inserted {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                return Err(StorageError::DuplicateStorageBox(storage_box.name));
            }
            Err(err) => return Err(err.into()),
        }

        for (key, value) in &new.options {
            sqlx::query(
                "INSERT INTO storage_box_options (id, storage_box_id, key, value) VALUES (?, ?, ?, ?)",
            )
            .bind(Uuid::new_v4())
            .bind(storage_box.id)
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }
        for (key, value) in &new.attributes {
            sqlx::query(
                "INSERT INTO storage_box_attributes (id, storage_box_id, key, value) VALUES (?, ?, ?, ?)",
            )
            .bind(Uuid::new_v4())
            .bind(storage_box.id)
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        info!(storage_box = %storage_box.name, backend = %storage_box.backend_class, "created storage box");
        Ok(storage_box)
    }

    pub async fn find_storage_box(&self, id: Uuid) -> StorageResult<StorageBox> {
        sqlx::query_as::<_, StorageBox>(&format!(
            "SELECT {} FROM storage_boxes WHERE id = ?",
            BOX_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| StorageError::StorageBoxNotFound(id.to_string()))
    }

    pub async fn find_storage_box_by_name(&self, name: &str) -> StorageResult<StorageBox> {
        sqlx::query_as::<_, StorageBox>(&format!(
            "SELECT {} FROM storage_boxes WHERE name = ?",
            BOX_COLUMNS
        ))
        .bind(name)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| StorageError::StorageBoxNotFound(name.to_string()))
    }

    pub async fn list_storage_boxes(&self) -> StorageResult<Vec<StorageBox>> {
        Ok(sqlx::query_as::<_, StorageBox>(&format!(
            "SELECT {} FROM storage_boxes ORDER BY name",
            BOX_COLUMNS
        ))
        .fetch_all(&*self.db)
        .await?)
    }

    pub async fn box_options(&self, box_id: Uuid) -> StorageResult<HashMap<String, String>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT key, value FROM storage_box_options WHERE storage_box_id = ?")
                .bind(box_id)
                .fetch_all(&*self.db)
                .await?;
        Ok(rows.into_iter().collect())
    }

    pub async fn box_attributes(&self, box_id: Uuid) -> StorageResult<HashMap<String, String>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT key, value FROM storage_box_attributes WHERE storage_box_id = ?",
        )
        .bind(box_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows.into_iter().collect())
    }

    async fn box_attribute(&self, box_id: Uuid, key: &str) -> StorageResult<Option<String>> {
        Ok(sqlx::query_scalar(
            "SELECT value FROM storage_box_attributes WHERE storage_box_id = ? AND key = ?",
        )
        .bind(box_id)
        .bind(key)
        .fetch_optional(&*self.db)
        .await?)
    }

    pub async fn set_box_option(&self, box_id: Uuid, key: &str, value: &str) -> StorageResult<()> {
        if key == OPT_LOCATION {
            self.ensure_location_free(value, Some(box_id)).await?;
        }
        sqlx::query(
            "INSERT INTO storage_box_options (id, storage_box_id, key, value) VALUES (?, ?, ?, ?)
             ON CONFLICT(storage_box_id, key) DO UPDATE SET value = excluded.value",
        )
        .bind(Uuid::new_v4())
        .bind(box_id)
        .bind(key)
        .bind(value)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    async fn ensure_location_free(&self, location: &str, owner: Option<Uuid>) -> StorageResult<()> {
        let location = location.trim();
        if location.is_empty() {
            return Ok(());
        }
        let wanted = backends::resolve_path(PathBuf::from(location)).await;
        let used: Vec<(Uuid, String, String)> = sqlx::query_as(
            "SELECT b.id, b.name, o.value
             FROM storage_box_options o
             JOIN storage_boxes b ON b.id = o.storage_box_id
             WHERE o.key = ?",
        )
        .bind(OPT_LOCATION)
        .fetch_all(&*self.db)
        .await?;
        for (id, name, value) in used {
            if Some(id) == owner {
                continue;
            }
            if backends::resolve_path(PathBuf::from(value.trim())).await == wanted {
                return Err(StorageError::LocationInUse {
                    location: location.to_string(),
                    storage_box: name,
                });
            }
        }
        Ok(())
    }

    pub async fn set_box_attribute(
        &self,
        box_id: Uuid,
        key: &str,
        value: &str,
    ) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO storage_box_attributes (id, storage_box_id, key, value) VALUES (?, ?, ?, ?)
             ON CONFLICT(storage_box_id, key) DO UPDATE SET value = excluded.value",
        )
        .bind(Uuid::new_v4())
        .bind(box_id)
        .bind(key)
        .bind(value)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    /// Storage type from the `type` attribute, `unknown` when unset.
    pub async fn storage_type(&self, storage_box: &StorageBox) -> StorageResult<StorageType> {
        let value = self.box_attribute(storage_box.id, ATTR_TYPE).await?;
        Ok(StorageType::from_attribute(value.as_deref()))
    }

    /// Bytes may be deleted unless the box says `can_delete=false`.
    pub async fn can_delete(&self, storage_box: &StorageBox) -> StorageResult<bool> {
        Ok(self
            .box_attribute(storage_box.id, ATTR_CAN_DELETE)
            .await?
            .is_none_or(|v| attribute_flag(&v)))
    }

    pub async fn is_archive_box(&self, storage_box: &StorageBox) -> StorageResult<bool> {
        Ok(self
            .box_attribute(storage_box.id, ATTR_ARCHIVE)
            .await?
            .is_some_and(|v| attribute_flag(&v)))
    }

    /// Boxes whose attribute `key` is set to a true value.
    pub(crate) async fn boxes_flagged(&self, key: &str) -> StorageResult<Vec<StorageBox>> {
        let rows = sqlx::query_as::<_, FlaggedBox>(
            "SELECT b.id, b.backend_class, b.name, b.description, b.status, b.max_size, b.master_box_id,
                    a.value AS flag
             FROM storage_boxes b
             JOIN storage_box_attributes a ON a.storage_box_id = b.id
             WHERE a.key = ?
             ORDER BY b.name",
        )
        .bind(key)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows
            .into_iter()
            .filter(|row| attribute_flag(&row.flag))
            .map(|row| row.storage_box)
            .collect())
    }

    async fn boxes_of_type(&self, wanted: StorageType) -> StorageResult<Vec<StorageBox>> {
        let mut out = Vec::new();
        for b in self.list_storage_boxes().await? {
            if self.storage_type(&b).await? == wanted {
                out.push(b);
            }
        }
        Ok(out)
    }

    pub async fn children(&self, storage_box: &StorageBox) -> StorageResult<Vec<StorageBox>> {
        Ok(sqlx::query_as::<_, StorageBox>(&format!(
            "SELECT {} FROM storage_boxes WHERE master_box_id = ? ORDER BY name",
            BOX_COLUMNS
        ))
        .bind(storage_box.id)
        .fetch_all(&*self.db)
        .await?)
    }

    pub async fn master(&self, storage_box: &StorageBox) -> StorageResult<Option<StorageBox>> {
        match storage_box.master_box_id {
            Some(id) => Ok(Some(self.find_storage_box(id).await?)),
            None => Ok(None),
        }
    }

    /// A child box of type `cache`, chosen at random when there are several.
    pub async fn cache_child(&self, storage_box: &StorageBox) -> StorageResult<Option<StorageBox>> {
        let mut caches = Vec::new();
        for child in self.children(storage_box).await? {
            if self.storage_type(&child).await? == StorageType::Cache {
                caches.push(child);
            }
        }
        Ok(caches.choose(&mut rand::thread_rng()).cloned())
    }

    /// Instantiate the backend a box names, configured from its options.
    pub async fn resolve_backend(
        &self,
        storage_box: &StorageBox,
    ) -> StorageResult<Arc<dyn StorageBackend>> {
        let options = self.box_options(storage_box.id).await?;
        backends::build_backend(&storage_box.backend_class, &options).map_err(|err| match err {
            BackendConfigError::Unsupported(backend) => StorageError::UnsupportedBackend {
                storage_box: storage_box.name.clone(),
                backend,
            },
            other => StorageError::BackendMisconfigured {
                storage_box: storage_box.name.clone(),
                reason: other.to_string(),
            },
        })
    }

    /// Check every registered box can be instantiated. Returns the number of
    /// boxes checked or the first failure.
    pub async fn validate_backends(&self) -> StorageResult<usize> {
        let boxes = self.list_storage_boxes().await?;
        for b in &boxes {
            self.resolve_backend(b).await?;
        }
        Ok(boxes.len())
    }

    /// Box that new files go to when the caller has no preference.
    ///
    /// A box flagged `default=true`, otherwise the local box at the configured
    /// default directory, created on first use.
    pub async fn get_default_storage_box(&self) -> StorageResult<StorageBox> {
        if let Some(flagged) = self.boxes_flagged(ATTR_DEFAULT).await?.into_iter().next() {
            return Ok(flagged);
        }
        let location = self.settings.default_storage_dir.clone();
        self.get_or_create_local(&location).await
    }

    /// Box that uploads land in before being moved to permanent storage.
    pub async fn get_receiving_storage_box(&self) -> StorageResult<StorageBox> {
        if let Some(existing) = self.boxes_of_type(StorageType::Temporary).await?.into_iter().next() {
            return Ok(existing);
        }
        let location = self.settings.receiving_dir.clone();
        let storage_box = self.get_or_create_local(&location).await?;
        self.set_box_attribute(storage_box.id, ATTR_TYPE, "receiving")
            .await?;
        Ok(storage_box)
    }

    /// Find the local filesystem box rooted at `location`, creating it (and
    /// the directory) when missing. New boxes are sized to 90% of the free
    /// space on the filesystem.
    pub async fn get_or_create_local(&self, location: &Path) -> StorageResult<StorageBox> {
        let no_storage = |reason: String| StorageError::NoUsableStorage {
            path: location.display().to_string(),
            reason,
        };
        tokio::fs::create_dir_all(location)
            .await
            .map_err(|err| no_storage(err.to_string()))?;
        let location: PathBuf = tokio::fs::canonicalize(location)
            .await
            .map_err(|err| no_storage(err.to_string()))?;
        let location_str = location.display().to_string();

        let existing = sqlx::query_as::<_, StorageBox>(
            "SELECT b.id, b.backend_class, b.name, b.description, b.status, b.max_size, b.master_box_id
             FROM storage_boxes b
             JOIN storage_box_options o ON o.storage_box_id = b.id
             WHERE o.key = ? AND o.value = ?
             LIMIT 1",
        )
        .bind(OPT_LOCATION)
        .bind(&location_str)
        .fetch_optional(&*self.db)
        .await?;
        if let Some(existing) = existing {
            return Ok(existing);
        }

        let free = available_space(&location).map_err(|err| no_storage(err.to_string()))?;
        let max_size = i64::try_from(free / 10 * 9).unwrap_or(i64::MAX);
        let new = NewStorageBox {
            name: location_str.clone(),
            backend_class: BackendKind::LocalFilesystem.identifier().to_string(),
            description: format!("Local storage at {}", location_str),
            max_size,
            ..Default::default()
        }
        .option(OPT_LOCATION, location_str.clone());

        match self.create_storage_box(new).await {
            Ok(created) => Ok(created),
            // lost a race with another creator, or an alias of this path is registered
            Err(StorageError::DuplicateStorageBox(name))
            | Err(StorageError::LocationInUse {
                storage_box: name, ..
            }) => {
                warn!(storage_box = %name, location = %location_str, "reusing registered storage box");
                self.find_storage_box_by_name(&name).await
            }
            Err(err) => Err(err),
        }
    }
}

/// Free bytes available to unprivileged users on the filesystem at `path`.
#[cfg(unix)]
pub fn available_space(path: &Path) -> io::Result<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "embedded NUL byte"))?;
    let mut stat = std::mem::MaybeUninit::<libc::statvfs>::uninit();
    // SAFETY: `c_path` is NUL terminated and `stat` is a valid out pointer.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: statvfs returned success, so the struct is initialised.
    let stat = unsafe { stat.assume_init() };
    #[allow(clippy::unnecessary_cast)]
    Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
}

#[cfg(not(unix))]
pub fn available_space(_path: &Path) -> io::Result<u64> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "free space is not available on this platform",
    ))
}
