//! Storage backends.
//!
//! Every StorageBox names a backend class. The class is parsed into a closed
//! [`BackendKind`] and instantiated with the box's Options as configuration.
//! All backends share the capability set of [`StorageBackend`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fmt, io,
    path::{Component, Path, PathBuf},
    pin::Pin,
    sync::Arc,
};
use tokio::io::AsyncRead;

use crate::services::checksum::Checksums;

pub mod hsm;
pub mod local;
pub mod object_store;

pub use hsm::HsmFilesystemBackend;
pub use local::LocalFilesystemBackend;
pub use object_store::ObjectStoreBackend;

/// A readable byte stream handed out by a backend.
pub type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;

const MAX_URI_LEN: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    LocalFilesystem,
    ObjectStore,
    TapeAware,
}

impl BackendKind {
    /// Parse a storage box backend-class identifier.
    pub fn from_identifier(id: &str) -> Option<Self> {
        match id.trim().to_ascii_lowercase().as_str() {
            "filesystem" | "local" => Some(Self::LocalFilesystem),
            "object-store" | "s3" => Some(Self::ObjectStore),
            "hsm-filesystem" | "hsm" => Some(Self::TapeAware),
            _ => None,
        }
    }

    pub fn identifier(self) -> &'static str {
        match self {
            Self::LocalFilesystem => "filesystem",
            Self::ObjectStore => "object-store",
            Self::TapeAware => "hsm-filesystem",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.identifier())
    }
}

/// Inputs to URI naming: `{dataset_dir}/{directory}/{filename}`.
#[derive(Clone, Debug)]
pub struct UriParts<'a> {
    pub dataset_dir: &'a str,
    pub directory: Option<&'a str>,
    pub filename: &'a str,
}

impl UriParts<'_> {
    /// The default naming scheme shared by all backends.
    pub fn default_uri(&self) -> String {
        let mut parts = vec![self.dataset_dir.trim_matches('/')];
        if let Some(dir) = self.directory.map(|d| d.trim_matches('/')) {
            if !dir.is_empty() {
                parts.push(dir);
            }
        }
        parts.push(self.filename);
        parts.join("/")
    }
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Backend-specific URI naming. `None` falls back to [`UriParts::default_uri`].
    fn build_uri(&self, _parts: &UriParts<'_>) -> Option<String> {
        None
    }

    async fn open_read(&self, uri: &str) -> io::Result<BoxedReader>;

    /// Store the full contents of `reader` at `uri`, returning bytes written.
    async fn write(&self, uri: &str, reader: BoxedReader) -> io::Result<u64>;

    async fn size(&self, uri: &str) -> io::Result<u64>;

    async fn delete(&self, uri: &str) -> io::Result<()>;

    /// Checksums the backend can report without streaming the content.
    async fn native_checksums(&self, _uri: &str) -> io::Result<Option<Checksums>> {
        Ok(None)
    }

    /// Local filesystem path of `uri`, for backends that have one.
    fn local_path(&self, _uri: &str) -> Option<PathBuf> {
        None
    }

    /// Where `uri` lives on a remote service, for backends without a local path.
    fn remote_locator(&self, _uri: &str) -> Option<String> {
        None
    }
}

/// Whether two backend URIs resolve to the same stored bytes.
///
/// Local paths are compared after resolving symlinks; remote objects by
/// locator. Anything that cannot be located compares unequal.
pub async fn same_location(
    a: &dyn StorageBackend,
    a_uri: &str,
    b: &dyn StorageBackend,
    b_uri: &str,
) -> bool {
    if let (Some(pa), Some(pb)) = (a.local_path(a_uri), b.local_path(b_uri)) {
        return resolve_path(pa).await == resolve_path(pb).await;
    }
    match (a.remote_locator(a_uri), b.remote_locator(b_uri)) {
        (Some(la), Some(lb)) => la == lb,
        _ => false,
    }
}

/// Canonical form of `path`, or its lexical normal form when it does not exist.
pub(crate) async fn resolve_path(path: PathBuf) -> PathBuf {
    match tokio::fs::canonicalize(&path).await {
        Ok(resolved) => resolved,
        Err(_) => path.components().collect(),
    }
}

/// Why a backend could not be built from a box's options.
#[derive(Debug)]
pub enum BackendConfigError {
    Unsupported(String),
    MissingOption(&'static str),
    Invalid(String),
}

impl fmt::Display for BackendConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsupported(id) => write!(f, "unsupported backend `{}`", id),
            Self::MissingOption(key) => write!(f, "missing option `{}`", key),
            Self::Invalid(msg) => f.write_str(msg),
        }
    }
}

/// Instantiate a backend from its class identifier and option map.
pub fn build_backend(
    backend_class: &str,
    options: &HashMap<String, String>,
) -> Result<Arc<dyn StorageBackend>, BackendConfigError> {
    let kind = BackendKind::from_identifier(backend_class)
        .ok_or_else(|| BackendConfigError::Unsupported(backend_class.to_string()))?;
    Ok(match kind {
        BackendKind::LocalFilesystem => Arc::new(LocalFilesystemBackend::from_options(options)?),
        BackendKind::ObjectStore => Arc::new(ObjectStoreBackend::from_options(options)?),
        BackendKind::TapeAware => Arc::new(HsmFilesystemBackend::from_options(options)?),
    })
}

/// Reject URIs that could escape the backend root.
pub(crate) fn ensure_uri_safe(uri: &str) -> io::Result<()> {
    let invalid = || io::Error::new(io::ErrorKind::InvalidInput, format!("invalid uri `{}`", uri));
    if uri.is_empty() || uri.len() > MAX_URI_LEN {
        return Err(invalid());
    }
    if uri
        .bytes()
        .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
    {
        return Err(invalid());
    }
    let all_normal = Path::new(uri)
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if !all_normal {
        return Err(invalid());
    }
    Ok(())
}
