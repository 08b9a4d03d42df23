//! Blob storage for built wheels.
//!
//! Wheels live under a path that installers can reason about
//! (`<index>/<platform>/<package>/<version>/<filename>`); external builds
//! are keyed by a hash of their source URL. Filenames are preserved
//! verbatim so wheel compatibility tags survive.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;
use url::Url;

use wheelsmith_normalize::PackageSlug;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("`{dsn}` is not a valid storage DSN: {message}")]
    InvalidDsn { dsn: String, message: String },

    #[error("storage scheme `{scheme}` has no driver in this build")]
    UnsupportedScheme { scheme: String },

    #[error("blob path `{0}` escapes the storage root")]
    PathEscapes(String),
}

/// Where a built wheel lives.
pub fn build_path(
    index_slug: &str,
    platform_slug: &str,
    package_slug: &PackageSlug,
    version: &str,
    filename: &str,
) -> String {
    format!("{index_slug}/{platform_slug}/{package_slug}/{version}/{filename}")
}

/// Where an external build lives: keyed by a digest of its source URL so
/// arbitrary URLs cannot walk the tree.
pub fn external_build_path(platform_slug: &str, external_url: &str, filename: &str) -> String {
    let digest = hex::encode(Sha256::digest(external_url.as_bytes()));
    format!("__external__/{platform_slug}/{digest}/{filename}")
}

/// A parsed `BUILDS_STORAGE_DSN`.
///
/// `file:///var/blobs?url=/builds/` stores under `/var/blobs` and serves
/// under `/builds/`. `s3://` is a recognized scheme whose driver is an
/// external collaborator; this build refuses to open it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageDsn {
    pub scheme: String,
    pub root: PathBuf,
    pub base_url: Option<String>,
}

impl FromStr for StorageDsn {
    type Err = StorageError;

    fn from_str(dsn: &str) -> Result<Self, Self::Err> {
        let url = Url::parse(dsn).map_err(|err| StorageError::InvalidDsn {
            dsn: dsn.to_string(),
            message: err.to_string(),
        })?;
        let base_url = url
            .query_pairs()
            .find(|(key, _)| key == "url")
            .map(|(_, value)| value.into_owned());
        Ok(Self {
            scheme: url.scheme().to_string(),
            root: PathBuf::from(url.path()),
            base_url,
        })
    }
}

/// The blob store contract: overwriting writes, URL issuance, deletion.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store a blob, replacing any previous one at the same path.
    async fn save(&self, path: &str, contents: &[u8]) -> Result<(), StorageError>;

    async fn open(&self, path: &str) -> Result<Vec<u8>, StorageError>;

    async fn delete(&self, path: &str) -> Result<(), StorageError>;

    /// The URL installers download this blob from, if the store has a
    /// public face.
    fn url(&self, path: &str) -> Option<String>;
}

/// Construct the store named by a DSN.
pub fn open_store(dsn: &StorageDsn) -> Result<std::sync::Arc<dyn ArtifactStore>, StorageError> {
    match dsn.scheme.as_str() {
        "file" => Ok(std::sync::Arc::new(FilesystemStore::new(
            dsn.root.clone(),
            dsn.base_url.clone(),
        ))),
        other => Err(StorageError::UnsupportedScheme {
            scheme: other.to_string(),
        }),
    }
}

/// Local-disk blobs under a root directory.
#[derive(Debug, Clone)]
pub struct FilesystemStore {
    root: PathBuf,
    base_url: Option<String>,
}

impl FilesystemStore {
    pub fn new(root: PathBuf, base_url: Option<String>) -> Self {
        Self { root, base_url }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(path);
        if relative.is_absolute()
            || relative
                .components()
                .any(|component| matches!(component, std::path::Component::ParentDir))
        {
            return Err(StorageError::PathEscapes(path.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ArtifactStore for FilesystemStore {
    async fn save(&self, path: &str, contents: &[u8]) -> Result<(), StorageError> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, contents).await?;
        debug!(path, bytes = contents.len(), "stored blob");
        Ok(())
    }

    async fn open(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        Ok(tokio::fs::read(self.resolve(path)?).await?)
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.resolve(path)?).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn url(&self, path: &str) -> Option<String> {
        let base = self.base_url.as_ref()?;
        Some(format!("{}{}", base, path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_paths_preserve_the_filename() {
        let slug = PackageSlug::new("My_Package");
        let path = build_path("pypi", "linux", &slug, "1.0", "my_package-1.0-cp311-none-any.whl");
        assert_eq!(path, "pypi/linux/my-package/1.0/my_package-1.0-cp311-none-any.whl");
        assert!(path.ends_with("my_package-1.0-cp311-none-any.whl"));
    }

    #[test]
    fn external_paths_hash_the_source_url() {
        let path = external_build_path("linux", "https://ex/pkg-1.2.tar.gz", "pkg-1.2-py3-none-any.whl");
        assert!(path.starts_with("__external__/linux/"));
        assert!(path.ends_with("/pkg-1.2-py3-none-any.whl"));
        let again = external_build_path("linux", "https://ex/pkg-1.2.tar.gz", "pkg-1.2-py3-none-any.whl");
        assert_eq!(path, again);
        let other = external_build_path("linux", "https://other/pkg-1.2.tar.gz", "pkg-1.2-py3-none-any.whl");
        assert_ne!(path, other);
    }

    #[test]
    fn dsn_parsing_extracts_root_and_public_url() {
        let dsn: StorageDsn = "file:///var/blobs?url=/builds/".parse().unwrap();
        assert_eq!(dsn.scheme, "file");
        assert_eq!(dsn.root, PathBuf::from("/var/blobs"));
        assert_eq!(dsn.base_url.as_deref(), Some("/builds/"));

        let s3: StorageDsn = "s3://key:secret@bucket.s3.example/prefix".parse().unwrap();
        assert_eq!(s3.scheme, "s3");
        assert!(matches!(
            open_store(&s3),
            Err(StorageError::UnsupportedScheme { .. })
        ));
    }

    #[tokio::test]
    async fn save_overwrites_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemStore::new(dir.path().to_path_buf(), Some("/builds/".to_string()));

        store.save("pypi/linux/a/1.0/a.whl", b"one").await.unwrap();
        store.save("pypi/linux/a/1.0/a.whl", b"two").await.unwrap();
        assert_eq!(store.open("pypi/linux/a/1.0/a.whl").await.unwrap(), b"two");
        assert_eq!(store.url("pypi/linux/a/1.0/a.whl").unwrap(), "/builds/pypi/linux/a/1.0/a.whl");

        store.delete("pypi/linux/a/1.0/a.whl").await.unwrap();
        assert!(store.open("pypi/linux/a/1.0/a.whl").await.is_err());
        // Deleting a missing blob is fine.
        store.delete("pypi/linux/a/1.0/a.whl").await.unwrap();
    }

    #[tokio::test]
    async fn traversal_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemStore::new(dir.path().to_path_buf(), None);
        assert!(matches!(
            store.save("../escape.whl", b"x").await,
            Err(StorageError::PathEscapes(_))
        ));
    }
}
