//! Filesystem-folder object store.
//!
//! Used when no hosted store is configured: deliverables too large for the
//! messenger are copied into a shared folder and referenced by `file://`
//! URL. The copy is content-addressed to keep repeated uploads idempotent.

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};

use crate::caps::{ObjectStore, UploadResult};
use crate::error::CapError;

pub struct FolderStore {
    root: Utf8PathBuf,
}

impl FolderStore {
    #[must_use]
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl ObjectStore for FolderStore {
    async fn upload(&self, path: &Utf8Path, folder: &str) -> Result<UploadResult, CapError> {
        let bytes = tokio::fs::read(path.as_std_path())
            .await
            .map_err(|e| CapError::fatal("store", format!("cannot read deliverable: {e}")))?;
        let digest = crate::artifact::content_hash(&bytes);
        let file_name = path.file_name().unwrap_or("deliverable.bin");
        let dest_dir = self.root.join(folder);
        let dest = dest_dir.join(format!("{}-{file_name}", &digest[..12]));

        tokio::fs::create_dir_all(dest_dir.as_std_path())
            .await
            .map_err(|e| CapError::fatal("store", format!("cannot create folder: {e}")))?;
        if !dest.exists() {
            tokio::fs::write(dest.as_std_path(), &bytes)
                .await
                .map_err(|e| CapError::transient("store", format!("upload write failed: {e}")))?;
        }

        Ok(UploadResult {
            url: format!("file://{dest}"),
            size_bytes: bytes.len() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn upload_is_idempotent_by_content() {
        let dir = TempDir::new().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let source = root.join("final-reel.mp4");
        tokio::fs::write(source.as_std_path(), b"fake reel bytes")
            .await
            .unwrap();

        let store = FolderStore::new(root.join("store"));
        let first = store.upload(&source, "reels").await.unwrap();
        let second = store.upload(&source, "reels").await.unwrap();
        assert_eq!(first.url, second.url);
        assert_eq!(first.size_bytes, 15);

        let entries: Vec<_> = std::fs::read_dir(root.join("store/reels").as_std_path())
            .unwrap()
            .collect();
        assert_eq!(entries.len(), 1);
    }
}
