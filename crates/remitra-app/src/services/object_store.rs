//! Object storage abstraction for page objects.
//!
//! Keys are caller-chosen (`{document_id}/page-{NNN}.png`), unlike a
//! content-addressed blob store: the orchestrator must be able to probe for a
//! page object it may already have written on a previous, interrupted run.

use std::path::{Component, Path, PathBuf};

use bytes::Bytes;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Which of the two configured stores a page source points at.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::EnumString,
    strum::AsRefStr,
    serde::Serialize,
    serde::Deserialize,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum StoreKind {
    Primary,
    Secondary,
}

impl StoreKind {
    pub fn slug(self) -> &'static str {
        match self {
            StoreKind::Primary => "primary",
            StoreKind::Secondary => "secondary",
        }
    }
}

/// Minimal metadata returned by `head`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size_bytes: u64,
}

/// Errors emitted by object storage operations.
#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    #[error("invalid object key `{0}`")]
    InvalidKey(String),

    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ObjectStoreError {
    fn from(e: std::io::Error) -> Self {
        ObjectStoreError::Io(e.to_string())
    }
}

/// Storage key for one page object.
pub fn page_key(document_id: &str, page_number: u32) -> String {
    format!("{document_id}/page-{page_number:03}.png")
}

/// Trait abstracting over object storage backends.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch the full object or `ObjectStoreError::NotFound`.
    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes, ObjectStoreError>;

    /// Write the object. Existing objects are overwritten; the write is
    /// atomic (temp file + rename) so readers never observe partial content.
    async fn put(&self, bucket: &str, key: &str, bytes: Bytes) -> Result<(), ObjectStoreError>;

    /// Metadata for the object if present.
    async fn head(&self, bucket: &str, key: &str) -> Result<Option<ObjectMeta>, ObjectStoreError>;

    /// Keys under a prefix, sorted.
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, ObjectStoreError>;
}

/// Reject keys that would escape the store root.
fn validate_key(key: &str) -> Result<(), ObjectStoreError> {
    if key.is_empty() || key.starts_with('/') {
        return Err(ObjectStoreError::InvalidKey(key.to_string()));
    }
    let path = Path::new(key);
    let safe = path
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if !safe {
        return Err(ObjectStoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Filesystem object store rooted at a directory, one subtree per bucket.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, ObjectStoreError> {
        validate_key(key)?;
        if bucket.is_empty() || bucket.contains('/') {
            return Err(ObjectStoreError::InvalidKey(bucket.to_string()));
        }
        let mut path = self.root.clone();
        path.push(bucket);
        path.push(key);
        Ok(path)
    }
}

#[async_trait::async_trait]
impl ObjectStore for FsObjectStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes, ObjectStoreError> {
        let path = self.object_path(bucket, key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Bytes::from(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ObjectStoreError::NotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                })
            }
            Err(e) => Err(ObjectStoreError::Io(format!("read object: {e}"))),
        }
    }

    async fn put(&self, bucket: &str, key: &str, bytes: Bytes) -> Result<(), ObjectStoreError> {
        let path = self.object_path(bucket, key)?;
        let parent = path
            .parent()
            .ok_or_else(|| ObjectStoreError::InvalidKey(key.to_string()))?;
        fs::create_dir_all(parent)
            .await
            .map_err(|e| ObjectStoreError::Io(format!("create object dir: {e}")))?;

        // Write to a sibling temp file, then rename into place.
        let temp = parent.join(format!(".tmp-{}", uuid::Uuid::new_v4()));
        let mut file = fs::File::create(&temp)
            .await
            .map_err(|e| ObjectStoreError::Io(format!("create temp object: {e}")))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| ObjectStoreError::Io(format!("write object: {e}")))?;
        file.flush()
            .await
            .map_err(|e| ObjectStoreError::Io(format!("flush object: {e}")))?;
        drop(file);

        if let Err(e) = fs::rename(&temp, &path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(ObjectStoreError::Io(format!("finalize object: {e}")));
        }
        Ok(())
    }

    async fn head(&self, bucket: &str, key: &str) -> Result<Option<ObjectMeta>, ObjectStoreError> {
        let path = self.object_path(bucket, key)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(Some(ObjectMeta {
                key: key.to_string(),
                size_bytes: meta.len(),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ObjectStoreError::Io(format!("stat object: {e}"))),
        }
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
        let mut bucket_root = self.root.clone();
        bucket_root.push(bucket);
        if !bucket_root.exists() {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        let mut stack = vec![bucket_root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = fs::read_dir(&dir)
                .await
                .map_err(|e| ObjectStoreError::Io(format!("list objects: {e}")))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| ObjectStoreError::Io(format!("list objects: {e}")))?
            {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&bucket_root) else {
                    continue;
                };
                let is_temp = path
                    .file_name()
                    .map_or(false, |n| n.to_string_lossy().starts_with(".tmp-"));
                let key = relative.to_string_lossy().replace('\\', "/");
                if key.starts_with(prefix) && !is_temp {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, FsObjectStore) {
        let temp = TempDir::new().expect("temp dir");
        let store = FsObjectStore::new(temp.path());
        (temp, store)
    }

    #[tokio::test]
    async fn put_get_head_roundtrip() {
        let (_temp, store) = store();
        let key = page_key("doc-1", 1);
        assert_eq!(key, "doc-1/page-001.png");

        store
            .put("pages", &key, Bytes::from_static(b"png-bytes"))
            .await
            .expect("put");

        let meta = store
            .head("pages", &key)
            .await
            .expect("head")
            .expect("object exists");
        assert_eq!(meta.size_bytes, 9);

        let bytes = store.get("pages", &key).await.expect("get");
        assert_eq!(&bytes[..], b"png-bytes");
    }

    #[tokio::test]
    async fn get_missing_object_is_not_found() {
        let (_temp, store) = store();
        let err = store.get("pages", "doc-9/page-001.png").await.unwrap_err();
        assert!(matches!(err, ObjectStoreError::NotFound { .. }));
        let head = store.head("pages", "doc-9/page-001.png").await.expect("head");
        assert!(head.is_none());
    }

    #[tokio::test]
    async fn put_overwrites_existing_object() {
        let (_temp, store) = store();
        let key = page_key("doc-1", 2);
        store
            .put("pages", &key, Bytes::from_static(b"first"))
            .await
            .expect("put");
        store
            .put("pages", &key, Bytes::from_static(b"second"))
            .await
            .expect("put");
        let bytes = store.get("pages", &key).await.expect("get");
        assert_eq!(&bytes[..], b"second");
    }

    #[tokio::test]
    async fn list_filters_by_prefix_and_sorts() {
        let (_temp, store) = store();
        for (doc, page) in [("doc-2", 1), ("doc-1", 2), ("doc-1", 1)] {
            store
                .put("pages", &page_key(doc, page), Bytes::from_static(b"x"))
                .await
                .expect("put");
        }
        let keys = store.list("pages", "doc-1/").await.expect("list");
        assert_eq!(keys, vec!["doc-1/page-001.png", "doc-1/page-002.png"]);
    }

    #[tokio::test]
    async fn traversal_keys_are_rejected() {
        let (_temp, store) = store();
        let err = store
            .put("pages", "../escape.png", Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ObjectStoreError::InvalidKey(_)));
        let err = store.get("pages", "/absolute.png").await.unwrap_err();
        assert!(matches!(err, ObjectStoreError::InvalidKey(_)));
    }
}
