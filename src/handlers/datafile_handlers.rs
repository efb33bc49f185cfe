//! HTTP wrappers over the storage core for DataFiles, datasets and replicas.
//!
//! Every request names its actor in the `x-mytardis-actor` header; the
//! actor is checked against the service's authorizer before anything runs.

use axum::{
    Json,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use crate::{
    errors::AppError,
    models::datafile_object::DataFileObject,
    services::{Action, Actor, StorageService, Target},
};

pub const ACTOR_HEADER: &str = "x-mytardis-actor";
pub const ACTOR_EMAIL_HEADER: &str = "x-mytardis-actor-email";

/// Request body naming the destination of a copy or move.
#[derive(Debug, Deserialize)]
pub struct TransferReq {
    pub storage_box: String,
}

#[derive(Serialize)]
struct CopyResponse {
    replica: DataFileObject,
    created: bool,
}

#[derive(Serialize)]
struct MoveResponse {
    replica: DataFileObject,
    source_deleted: bool,
}

fn actor_from(headers: &HeaderMap) -> Result<Actor, AppError> {
    let id = headers
        .get(ACTOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::unauthenticated(format!("missing {} header", ACTOR_HEADER)))?;
    let actor = Actor::new(id);
    Ok(
        match headers
            .get(ACTOR_EMAIL_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            Some(email) if !email.trim().is_empty() => actor.with_email(email.trim()),
            _ => actor,
        },
    )
}

/// GET `/datafiles/{id}/online`
pub async fn datafile_online(
    State(service): State<StorageService>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let actor = actor_from(&headers)?;
    service.authorize(&actor, Action::Read, Target::DataFile(id))?;
    let online = service.is_online(id).await?;
    Ok(Json(json!({ "online": online })))
}

/// GET `/datafiles/{id}/download`: streams the preferred verified replica.
pub async fn download_datafile(
    State(service): State<StorageService>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let actor = actor_from(&headers)?;
    service.authorize(&actor, Action::Download, Target::DataFile(id))?;

    let datafile = service.find_datafile(id).await?;
    let reader = service.read_datafile(id).await?;
    let mut response = Response::new(Body::from_stream(ReaderStream::new(reader)));
    *response.status_mut() = StatusCode::OK;

    let headers = response.headers_mut();
    let content_type = datafile
        .mimetype
        .as_deref()
        .unwrap_or("application/octet-stream");
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    if let Some(size) = datafile.size.filter(|s| *s >= 0) {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    }
    let disposition = format!(
        "attachment; filename=\"{}\"",
        datafile.filename.replace(['"', '\\'], "_")
    );
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    Ok(response)
}

/// GET `/datasets/{id}/online`
pub async fn dataset_online(
    State(service): State<StorageService>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let actor = actor_from(&headers)?;
    service.authorize(&actor, Action::Read, Target::Dataset(id))?;
    Ok(Json(service.count_online_in_dataset(id).await?))
}

/// POST `/datafile-objects/{id}/verify`
pub async fn verify_replica(
    State(service): State<StorageService>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let actor = actor_from(&headers)?;
    service.authorize(&actor, Action::Write, Target::Replica(id))?;
    let mut handle = service.replica(id).await?;
    let report = service.verify_replica(&mut handle, true, true).await?;
    Ok(Json(report))
}

/// POST `/datafile-objects/{id}/recall`: queues the recall and returns 202.
pub async fn recall_replica(
    State(service): State<StorageService>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let actor = actor_from(&headers)?;
    service.authorize(&actor, Action::Recall, Target::Replica(id))?;
    let handle = service.replica(id).await?;
    service.request_recall(&handle, &actor).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "status": "queued", "replica_id": id })),
    ))
}

/// POST `/datafile-objects/{id}/copy` with `{"storage_box": "<name>"}`
pub async fn copy_replica(
    State(service): State<StorageService>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(req): Json<TransferReq>,
) -> Result<impl IntoResponse, AppError> {
    let actor = actor_from(&headers)?;
    service.authorize(&actor, Action::Copy, Target::Replica(id))?;
    let source = service.replica(id).await?;
    let dest = service.find_storage_box_by_name(&req.storage_box).await?;
    let outcome = service.copy_replica(&source, &dest, true).await?;
    let created = outcome.is_new();
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(CopyResponse {
            replica: outcome.into_replica().record,
            created,
        }),
    ))
}

/// POST `/datafile-objects/{id}/move` with `{"storage_box": "<name>"}`
pub async fn move_replica(
    State(service): State<StorageService>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(req): Json<TransferReq>,
) -> Result<impl IntoResponse, AppError> {
    let actor = actor_from(&headers)?;
    service.authorize(&actor, Action::Move, Target::Replica(id))?;
    let source = service.replica(id).await?;
    let dest = service.find_storage_box_by_name(&req.storage_box).await?;
    let outcome = service.move_replica(source, &dest).await?;
    Ok(Json(MoveResponse {
        replica: outcome.replica.record,
        source_deleted: outcome.source_deleted,
    }))
}
