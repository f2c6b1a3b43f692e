//! Access to uploaded media
//!
//! Upload and storage happen elsewhere; the pipeline only needs to open a file
//! by its opaque `media_ref`.

use std::collections::HashMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::error::PlatformError;
use crate::types::MediaType;

/// An opened media file
#[derive(Clone)]
pub struct MediaFile {
    pub bytes: Arc<Vec<u8>>,
    pub file_name: String,
    pub media_type: MediaType,
}

impl std::fmt::Debug for MediaFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaFile")
            .field("file_name", &self.file_name)
            .field("media_type", &self.media_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl MediaFile {
    pub fn new(file_name: impl Into<String>, bytes: Vec<u8>) -> Result<Self, PlatformError> {
        let file_name = file_name.into();
        let media_type = media_type_for(&file_name)?;
        Ok(Self {
            bytes: Arc::new(bytes),
            file_name,
            media_type,
        })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

fn media_type_for(file_name: &str) -> Result<MediaType, PlatformError> {
    Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .and_then(MediaType::from_extension)
        .ok_or_else(|| {
            PlatformError::InvalidMedia(format!("Unsupported media type: {}", file_name))
        })
}

/// Read-only view of the media store.
///
/// Missing media and bad references are reported as `InvalidMedia`, which
/// fails the target permanently. Other read errors are `Unavailable` and get
/// retried.
#[async_trait]
pub trait MediaStore: Send + Sync {
    async fn open(&self, media_ref: &str) -> Result<MediaFile, PlatformError>;
}

/// Media files under a root directory; `media_ref` is a relative path
#[derive(Debug, Clone)]
pub struct FsMediaStore {
    root: PathBuf,
}

impl FsMediaStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, media_ref: &str) -> Result<PathBuf, PlatformError> {
        let relative = Path::new(media_ref);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if media_ref.is_empty() || escapes {
            return Err(PlatformError::InvalidMedia(format!(
                "Media reference '{}' is outside the media store",
                media_ref
            )));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl MediaStore for FsMediaStore {
    async fn open(&self, media_ref: &str) -> Result<MediaFile, PlatformError> {
        let path = self.resolve(media_ref)?;
        let bytes = tokio::fs::read(&path).await.map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => {
                PlatformError::InvalidMedia(format!("Media '{}' not found: {}", media_ref, e))
            }
            _ => PlatformError::Unavailable(format!("Cannot read media '{}': {}", media_ref, e)),
        })?;
        if bytes.is_empty() {
            return Err(PlatformError::InvalidMedia(format!(
                "Media '{}' is empty",
                media_ref
            )));
        }

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(media_ref)
            .to_string();
        MediaFile::new(file_name, bytes)
    }
}

/// In-memory media store for tests and dry runs
#[derive(Debug, Clone, Default)]
pub struct InMemoryMediaStore {
    files: Arc<RwLock<HashMap<String, MediaFile>>>,
}

impl InMemoryMediaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `bytes` under `media_ref`; the media type comes from its extension
    pub fn insert(&self, media_ref: &str, bytes: Vec<u8>) -> Result<(), PlatformError> {
        let file = MediaFile::new(media_ref, bytes)?;
        if let Ok(mut files) = self.files.write() {
            files.insert(media_ref.to_string(), file);
        }
        Ok(())
    }
}

#[async_trait]
impl MediaStore for InMemoryMediaStore {
    async fn open(&self, media_ref: &str) -> Result<MediaFile, PlatformError> {
        self.files
            .read()
            .ok()
            .and_then(|files| files.get(media_ref).cloned())
            .ok_or_else(|| PlatformError::InvalidMedia(format!("Media '{}' not found", media_ref)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_fs_store_opens_files() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("alice")).unwrap();
        std::fs::write(dir.path().join("alice/clip.mp4"), b"video").unwrap();

        let store = FsMediaStore::new(dir.path());
        let file = store.open("alice/clip.mp4").await.unwrap();
        assert_eq!(file.file_name, "clip.mp4");
        assert_eq!(file.media_type, MediaType::Mp4);
        assert_eq!(file.bytes.as_slice(), b"video");
    }

    #[tokio::test]
    async fn test_fs_store_missing_file_is_invalid_media() {
        let dir = TempDir::new().unwrap();
        let store = FsMediaStore::new(dir.path());

        match store.open("nope.jpg").await {
            Err(PlatformError::InvalidMedia(msg)) => assert!(msg.contains("nope.jpg")),
            other => panic!("expected InvalidMedia, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fs_store_read_error_is_retryable() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("folder.png")).unwrap();
        let store = FsMediaStore::new(dir.path());

        // Exists but cannot be read as a file
        match store.open("folder.png").await {
            Err(PlatformError::Unavailable(msg)) => assert!(msg.contains("folder.png")),
            other => panic!("expected Unavailable, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fs_store_rejects_path_escape() {
        let dir = TempDir::new().unwrap();
        let store = FsMediaStore::new(dir.path().join("media"));

        assert!(matches!(
            store.open("../secrets.png").await,
            Err(PlatformError::InvalidMedia(_))
        ));
        assert!(matches!(
            store.open("/etc/passwd.png").await,
            Err(PlatformError::InvalidMedia(_))
        ));
    }

    #[tokio::test]
    async fn test_fs_store_rejects_unknown_extension() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"hello").unwrap();
        let store = FsMediaStore::new(dir.path());

        assert!(matches!(
            store.open("notes.txt").await,
            Err(PlatformError::InvalidMedia(_))
        ));
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryMediaStore::new();
        store.insert("photo.png", vec![1, 2, 3]).unwrap();

        let file = store.open("photo.png").await.unwrap();
        assert_eq!(file.len(), 3);
        assert!(!file.media_type.is_video());
        assert!(store.open("other.png").await.is_err());
    }
}
