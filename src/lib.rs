//! Multi-replica DataFile storage: StorageBoxes over local disk, S3-style
//! object stores and HSM filesystems, with replica verification, safe
//! copy/move, HSM recall and auto-archive.

pub mod backends;
pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;

#[cfg(test)]
pub(crate) mod test_support;
