//! Routes for the storage core's HTTP surface.
//!
//! ## Structure
//! - `GET  /healthz`, `GET /readyz` — liveness and readiness
//! - `GET  /datafiles/{id}/online` — `{"online": bool}`
//! - `GET  /datafiles/{id}/download` — stream the preferred replica
//! - `GET  /datasets/{id}/online` — `{"online_files", "total_files"}`
//! - `POST /datafile-objects/{id}/verify` — verification report
//! - `POST /datafile-objects/{id}/recall` — queue an HSM recall
//! - `POST /datafile-objects/{id}/copy` — copy into a named box
//! - `POST /datafile-objects/{id}/move` — move into a named box

use crate::{
    handlers::{
        datafile_handlers::{
            copy_replica, datafile_online, dataset_online, download_datafile, move_replica,
            recall_replica, verify_replica,
        },
        health_handlers::{healthz, readyz},
    },
    services::StorageService,
};
use axum::{
    Router,
    routing::{get, post},
};

/// Build the router. Handlers share the `StorageService` state.
pub fn routes() -> Router<StorageService> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/datafiles/{id}/online", get(datafile_online))
        .route("/datafiles/{id}/download", get(download_datafile))
        .route("/datasets/{id}/online", get(dataset_online))
        .route("/datafile-objects/{id}/verify", post(verify_replica))
        .route("/datafile-objects/{id}/recall", post(recall_replica))
        .route("/datafile-objects/{id}/copy", post(copy_replica))
        .route("/datafile-objects/{id}/move", post(move_replica))
}
