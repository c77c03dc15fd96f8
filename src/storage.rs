//! Photo and archive storage port, with a local filesystem implementation.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::{AppError, Result};
use crate::models::Order;

#[derive(Debug, Clone)]
pub struct StoredFile {
    pub filename: String,
    pub content_type: &'static str,
    pub bytes: Vec<u8>,
}

#[async_trait]
pub trait PhotoStore: Send + Sync {
    /// Original file for a purchased photo, or None if it is missing.
    async fn read_photo(&self, photo_id: i64, filename: &str) -> Result<Option<StoredFile>>;

    /// Finished archive for an order, or None if it has not been generated yet.
    async fn read_archive(&self, order_id: i64) -> Result<Option<StoredFile>>;

    /// Ask for the order's archive to be generated. Repeated requests are harmless.
    async fn request_archive(&self, order: &Order, photo_ids: &[i64]) -> Result<()>;
}

/// Files under `{root}/photos/{photo_id}/{filename}`, archives under
/// `{root}/archives/order-{order_id}.zip`. Archive requests drop a `.pending`
/// marker for an external worker to pick up.
#[derive(Debug, Clone)]
pub struct LocalPhotoStore {
    root: PathBuf,
}

impl LocalPhotoStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn archive_path(&self, order_id: i64) -> PathBuf {
        self.root
            .join("archives")
            .join(format!("order-{}.zip", order_id))
    }

    async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AppError::Internal(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

#[async_trait]
impl PhotoStore for LocalPhotoStore {
    async fn read_photo(&self, photo_id: i64, filename: &str) -> Result<Option<StoredFile>> {
        let Some(safe_name) = sanitize_filename(filename) else {
            tracing::warn!(photo_id, "Refusing to read photo with unsafe filename");
            return Ok(None);
        };
        let path = self
            .root
            .join("photos")
            .join(photo_id.to_string())
            .join(&safe_name);
        Ok(Self::read_optional(&path).await?.map(|bytes| StoredFile {
            content_type: content_type_for(&safe_name),
            filename: safe_name,
            bytes,
        }))
    }

    async fn read_archive(&self, order_id: i64) -> Result<Option<StoredFile>> {
        let path = self.archive_path(order_id);
        Ok(Self::read_optional(&path).await?.map(|bytes| StoredFile {
            filename: format!("order-{}.zip", order_id),
            content_type: "application/zip",
            bytes,
        }))
    }

    async fn request_archive(&self, order: &Order, photo_ids: &[i64]) -> Result<()> {
        let marker = self.archive_path(order.id).with_extension("pending");
        if let Some(dir) = marker.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| AppError::Internal(format!("Failed to create archive dir: {}", e)))?;
        }
        let ids: Vec<String> = photo_ids.iter().map(|id| id.to_string()).collect();
        tokio::fs::write(&marker, ids.join("\n"))
            .await
            .map_err(|e| AppError::Internal(format!("Failed to request archive: {}", e)))?;
        tracing::info!(order_id = order.id, photos = photo_ids.len(), "Archive generation requested");
        Ok(())
    }
}

/// Strip any path components. Returns None for names that are empty or only dots.
pub fn sanitize_filename(filename: &str) -> Option<String> {
    let name = filename.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    if name.is_empty() || name.chars().all(|c| c == '.') {
        return None;
    }
    Some(name.to_string())
}

pub fn content_type_for(filename: &str) -> &'static str {
    let ext = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "tif" | "tiff" => "image/tiff",
        "heic" => "image/heic",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename_strips_directories() {
        assert_eq!(sanitize_filename("../../etc/passwd").as_deref(), Some("passwd"));
        assert_eq!(sanitize_filename("a\\b\\c.jpg").as_deref(), Some("c.jpg"));
        assert_eq!(sanitize_filename(".."), None);
        assert_eq!(sanitize_filename("dir/"), None);
    }

    #[test]
    fn test_content_type_by_extension() {
        assert_eq!(content_type_for("IMG_001.JPG"), "image/jpeg");
        assert_eq!(content_type_for("scan.tiff"), "image/tiff");
        assert_eq!(content_type_for("raw"), "application/octet-stream");
    }

    #[tokio::test]
    async fn test_missing_photo_reads_as_none() {
        let store = LocalPhotoStore::new(std::env::temp_dir().join("shutterpay-missing-store"));
        assert!(store.read_photo(1, "nope.jpg").await.unwrap().is_none());
        assert!(store.read_archive(1).await.unwrap().is_none());
    }
}
