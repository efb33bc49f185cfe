use std::{path::Path, sync::Arc};
use tempfile::TempDir;

use crate::backends::BackendKind;
use crate::config::StorageSettings;
use crate::db;
use crate::models::storage_box::{ATTR_TYPE, OPT_LOCATION, StorageBox};
use crate::services::{AllowAll, ManualQueue, StorageService, storage_boxes::NewStorageBox};

/// Service over an in-memory database with storage directories in a temp dir.
pub(crate) async fn service() -> (StorageService, Arc<ManualQueue>, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let pool = db::memory_pool().await.unwrap();
    let settings = StorageSettings {
        default_storage_dir: dir.path().join("store"),
        receiving_dir: dir.path().join("receiving"),
        ..StorageSettings::default()
    };
    let queue = Arc::new(ManualQueue::new());
    let svc = StorageService::new(Arc::new(pool), settings, queue.clone())
        .with_authorizer(Arc::new(AllowAll));
    (svc, queue, dir)
}

/// Register a filesystem box rooted at `root` with the given `type` attribute.
pub(crate) async fn local_box(
    svc: &StorageService,
    name: &str,
    storage_type: &str,
    root: &Path,
) -> StorageBox {
    svc.create_storage_box(
        NewStorageBox::new(name, BackendKind::LocalFilesystem)
            .option(OPT_LOCATION, root.display().to_string())
            .attribute(ATTR_TYPE, storage_type),
    )
    .await
    .unwrap()
}
