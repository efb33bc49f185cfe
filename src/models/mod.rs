//! Core data models for the DataFile storage layer.
//!
//! These entities describe logical files, their physical replicas and the
//! storage boxes holding those replicas. They map to database tables via
//! `sqlx::FromRow` and serialize as JSON via `serde`.

pub mod auto_archive;
pub mod datafile;
pub mod datafile_object;
pub mod dataset;
pub mod storage_box;
