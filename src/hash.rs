//! Partial content fingerprint: SHA-256 over the first megabyte of a file,
//! followed by the last megabyte when the file is larger than two. Cheap
//! change detection, not collision resistance.

use std::io::SeekFrom;
use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::Result;

const CHUNK: u64 = 1024 * 1024;

/// Compute the partial hash of `path` as a 64-char hex string.
///
/// Files of 2 MiB or less hash only the head (the tail window would
/// overlap it). The digest is order-dependent: head bytes, then tail.
pub async fn partial_hash(path: &Path) -> Result<String> {
    let mut file = File::open(path).await?;
    let size = file.metadata().await?.len();

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK as usize];

    let n = read_full(&mut file, &mut buf).await?;
    hasher.update(&buf[..n]);

    if size > 2 * CHUNK {
        file.seek(SeekFrom::Start(size - CHUNK)).await?;
        let n = read_full(&mut file, &mut buf).await?;
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Fill `buf` from the file's current position, stopping early only at EOF.
async fn read_full(file: &mut File, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
