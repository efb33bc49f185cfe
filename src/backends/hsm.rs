//! Filesystem backend fronting an HSM (tape) system.
//!
//! Bytes are read and written exactly like the local filesystem backend, but
//! the backend also exposes the on-disk path so residency can be checked via
//! the DOS attribute extended attribute or the file's allocated block count.

use async_trait::async_trait;
use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
};

use super::{
    BackendConfigError, BackendKind, BoxedReader, LocalFilesystemBackend, StorageBackend,
};

/// Extended attribute Samba-style HSM gateways use for DOS file attributes.
pub const DOS_ATTRIB_XATTR: &str = "user.DOSATTRIB";
/// DOS attribute bit set while file content lives only on tape.
pub const FILE_ATTRIBUTE_OFFLINE: u32 = 0x1000;

const MAX_XATTR_LEN: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct HsmFilesystemBackend {
    inner: LocalFilesystemBackend,
}

impl HsmFilesystemBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            inner: LocalFilesystemBackend::new(root),
        }
    }

    pub fn from_options(options: &HashMap<String, String>) -> Result<Self, BackendConfigError> {
        Ok(Self {
            inner: LocalFilesystemBackend::from_options(options)?,
        })
    }
}

#[async_trait]
impl StorageBackend for HsmFilesystemBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::TapeAware
    }

    async fn open_read(&self, uri: &str) -> io::Result<BoxedReader> {
        self.inner.open_read(uri).await
    }

    async fn write(&self, uri: &str, reader: BoxedReader) -> io::Result<u64> {
        self.inner.write_file(uri, reader).await
    }

    async fn size(&self, uri: &str) -> io::Result<u64> {
        self.inner.size(uri).await
    }

    async fn delete(&self, uri: &str) -> io::Result<()> {
        self.inner.delete_file(uri).await
    }

    fn local_path(&self, uri: &str) -> Option<PathBuf> {
        self.inner.path_for(uri).ok()
    }
}

/// Parse the leading `0x...` hex string of a DOSATTRIB value.
///
/// Both the plain text form and the NDR blob form start with a NUL
/// terminated hex string, so only that prefix is read.
pub fn parse_dos_attrib(raw: &[u8]) -> Option<u32> {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    let text = std::str::from_utf8(&raw[..end]).ok()?.trim();
    let hex = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))?;
    u32::from_str_radix(hex, 16).ok()
}

/// A file looks like a stub when it is too big to be inlined in its inode
/// yet has fewer allocated bytes than its apparent size.
pub fn looks_offline(size: u64, blocks: u64, max_inode_file_size: u64) -> bool {
    size > max_inode_file_size && blocks.saturating_mul(512) < size
}

/// Apparent size and allocated 512-byte blocks of `path`.
#[cfg(unix)]
pub async fn stat_blocks(path: &Path) -> io::Result<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;
    let meta = tokio::fs::metadata(path).await?;
    Ok((meta.size(), meta.blocks()))
}

#[cfg(not(unix))]
pub async fn stat_blocks(_path: &Path) -> io::Result<(u64, u64)> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "block counts are not available on this platform",
    ))
}

/// Read an extended attribute. `Ok(None)` when the attribute is absent.
pub async fn read_xattr(path: &Path, name: &str) -> io::Result<Option<Vec<u8>>> {
    let path = path.to_path_buf();
    let name = name.to_string();
    tokio::task::spawn_blocking(move || read_xattr_blocking(&path, &name))
        .await
        .map_err(io::Error::other)?
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
fn read_xattr_blocking(path: &Path, name: &str) -> io::Result<Option<Vec<u8>>> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let nul = |_| io::Error::new(io::ErrorKind::InvalidInput, "embedded NUL byte");
    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(nul)?;
    let c_name = CString::new(name).map_err(nul)?;

    let mut buf = vec![0u8; 256];
    loop {
        let n = sys_getxattr(&c_path, &c_name, &mut buf);
        if n >= 0 {
            buf.truncate(n as usize);
            return Ok(Some(buf));
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(code) if code == NO_ATTR => return Ok(None),
            Some(libc::ERANGE) if buf.len() < MAX_XATTR_LEN => {
                let len = buf.len() * 4;
                buf.resize(len, 0);
            }
            Some(libc::ENOTSUP) => {
                return Err(io::Error::new(io::ErrorKind::Unsupported, err));
            }
            _ => return Err(err),
        }
    }
}

#[cfg(target_os = "linux")]
const NO_ATTR: i32 = libc::ENODATA;
#[cfg(target_os = "macos")]
const NO_ATTR: i32 = libc::ENOATTR;

#[cfg(target_os = "linux")]
fn sys_getxattr(path: &std::ffi::CStr, name: &std::ffi::CStr, buf: &mut [u8]) -> isize {
    // SAFETY: both strings are NUL terminated and `buf` is valid for `buf.len()` bytes.
    unsafe {
        libc::getxattr(
            path.as_ptr(),
            name.as_ptr(),
            buf.as_mut_ptr().cast::<libc::c_void>(),
            buf.len(),
        )
    }
}

#[cfg(target_os = "macos")]
fn sys_getxattr(path: &std::ffi::CStr, name: &std::ffi::CStr, buf: &mut [u8]) -> isize {
    // SAFETY: both strings are NUL terminated and `buf` is valid for `buf.len()` bytes.
    unsafe {
        libc::getxattr(
            path.as_ptr(),
            name.as_ptr(),
            buf.as_mut_ptr().cast::<libc::c_void>(),
            buf.len(),
            0,
            0,
        )
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn read_xattr_blocking(_path: &Path, _name: &str) -> io::Result<Option<Vec<u8>>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "extended attributes are not available on this platform",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dos_attrib_text_and_blob_forms() {
        assert_eq!(parse_dos_attrib(b"0x1020"), Some(0x1020));
        assert_eq!(parse_dos_attrib(b"0x20\0\x03\0\x03\0\0\0"), Some(0x20));
        assert_eq!(parse_dos_attrib(b"garbage"), None);
        assert_eq!(parse_dos_attrib(b""), None);
        let offline = parse_dos_attrib(b"0x1000").unwrap();
        assert_ne!(offline & FILE_ATTRIBUTE_OFFLINE, 0);
    }

    #[test]
    fn stub_detection() {
        // tiny files may live in the inode with zero blocks
        assert!(!looks_offline(100, 0, 384));
        // a 1 MiB file with no allocated blocks is a stub
        assert!(looks_offline(1 << 20, 0, 384));
        // fully allocated
        assert!(!looks_offline(4096, 8, 384));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn resident_file_is_not_a_stub() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, vec![7u8; 64 * 1024]).unwrap();
        let (size, blocks) = stat_blocks(&path).await.unwrap();
        assert_eq!(size, 64 * 1024);
        assert!(!looks_offline(size, blocks, 384));
    }

    #[tokio::test]
    async fn missing_xattr_is_none_or_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain");
        std::fs::write(&path, b"x").unwrap();
        match read_xattr(&path, DOS_ATTRIB_XATTR).await {
            Ok(value) => assert!(value.is_none()),
            Err(err) => assert_eq!(err.kind(), io::ErrorKind::Unsupported),
        }
    }
}
