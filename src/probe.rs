//! Single-stat metadata probe used to enrich emitted file events.

use std::fs::Metadata;
use std::path::Path;

use chrono::{DateTime, Utc};

use crate::error::Result;

/// Metadata snapshot for one path. `mod_time` is UTC.
#[derive(Debug, Clone, Copy)]
pub struct FileMeta {
    pub size: u64,
    pub mod_time: DateTime<Utc>,
    pub inode: u64,
    pub device_id: u64,
    pub hardlink_count: u64,
}

impl FileMeta {
    pub fn from_metadata(md: &Metadata) -> Self {
        let mod_time = md
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        #[cfg(unix)]
        let (inode, device_id, hardlink_count) = {
            use std::os::unix::fs::MetadataExt;
            (md.ino(), md.dev(), md.nlink())
        };
        #[cfg(not(unix))]
        let (inode, device_id, hardlink_count) = (0, 0, 1);

        Self {
            size: md.len(),
            mod_time,
            inode,
            device_id,
            // Zero can surface from exotic filesystems; a file always has
            // at least one link.
            hardlink_count: hardlink_count.max(1),
        }
    }
}

/// Stat `path` without following symlinks.
pub async fn probe(path: &Path) -> Result<FileMeta> {
    let md = tokio::fs::symlink_metadata(path).await?;
    Ok(FileMeta::from_metadata(&md))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn probe_reports_size_and_links() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.mkv");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"hello").unwrap();

        let meta = probe(&path).await.unwrap();
        assert_eq!(meta.size, 5);
        assert_eq!(meta.hardlink_count, 1);
        assert_ne!(meta.inode, 0);
    }

    #[tokio::test]
    async fn probe_missing_path_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(probe(&dir.path().join("missing")).await.is_err());
    }

    #[tokio::test]
    async fn hardlinked_files_share_inode() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.mkv");
        let b = dir.path().join("b.mkv");
        std::fs::write(&a, b"data").unwrap();
        std::fs::hard_link(&a, &b).unwrap();

        let ma = probe(&a).await.unwrap();
        let mb = probe(&b).await.unwrap();
        assert_eq!(ma.inode, mb.inode);
        assert_eq!(ma.device_id, mb.device_id);
        assert_eq!(ma.hardlink_count, 2);
    }
}
