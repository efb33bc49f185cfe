//! Streaming MD5 / SHA-512 computation.
//!
//! Input is read in fixed chunks sized as a multiple of the digest block size,
//! so memory use does not grow with the file.

use serde::Serialize;
use sha2::{Digest, Sha512};
use std::io::{self, SeekFrom};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};

#[derive(Debug, Error)]
#[error("failed to read stream: {0}")]
pub struct StreamReadError(#[from] pub io::Error);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    Md5,
    Sha512,
}

impl Algorithm {
    /// Internal block size of the digest in bytes.
    pub fn block_size(self) -> usize {
        match self {
            Self::Md5 => 64,
            Self::Sha512 => 128,
        }
    }
}

/// Digests and byte count of one pass over a stream.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Checksums {
    pub md5: Option<String>,
    pub sha512: Option<String>,
    pub size: u64,
}

/// Read size used for the given algorithms and block multiplier.
pub fn chunk_size(algorithms: &[Algorithm], chunk_blocks: usize) -> usize {
    let block = algorithms
        .iter()
        .map(|a| a.block_size())
        .max()
        .unwrap_or(Algorithm::Md5.block_size());
    block * chunk_blocks.max(1)
}

/// Compute the requested digests over `reader` from its current position to EOF.
///
/// The reader is borrowed; dropping it afterwards is up to the caller.
pub async fn compute_checksums<R>(
    reader: &mut R,
    algorithms: &[Algorithm],
    chunk_blocks: usize,
) -> Result<Checksums, StreamReadError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut md5 = algorithms
        .contains(&Algorithm::Md5)
        .then(md5::Context::new);
    let mut sha512 = algorithms.contains(&Algorithm::Sha512).then(Sha512::new);

    let mut buf = vec![0u8; chunk_size(algorithms, chunk_blocks)];
    let mut size = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        size += n as u64;
        if let Some(ctx) = md5.as_mut() {
            ctx.consume(&buf[..n]);
        }
        if let Some(hasher) = sha512.as_mut() {
            hasher.update(&buf[..n]);
        }
    }

    Ok(Checksums {
        md5: md5.map(|ctx| format!("{:x}", ctx.compute())),
        sha512: sha512.map(|hasher| hex::encode(hasher.finalize())),
        size,
    })
}

/// Like [`compute_checksums`] but rewinds to the start first and consumes the
/// reader, closing it when done.
pub async fn compute_checksums_from_start<R>(
    mut reader: R,
    algorithms: &[Algorithm],
    chunk_blocks: usize,
) -> Result<Checksums, StreamReadError>
where
    R: AsyncRead + AsyncSeek + Unpin,
{
    reader.seek(SeekFrom::Start(0)).await?;
    compute_checksums(&mut reader, algorithms, chunk_blocks).await
}
