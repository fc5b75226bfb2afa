//! Source getters: resolve a locator URL into a byte stream.
//!
//! Packaging code picks the first getter whose `detect` accepts a locator,
//! names the content with `name`, and reads it through `open`. The store
//! itself never resolves locators.

use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::artifact::{BoxReader, StaticArtifact};
use crate::descriptor::MEDIA_TYPE_FILE_LOCAL_CONFIG;

#[async_trait]
pub trait Getter: Send + Sync {
    /// Whether this getter can handle the locator.
    async fn detect(&self, locator: &Url) -> bool;

    /// Display name for the content behind the locator.
    fn name(&self, locator: &Url) -> String;

    async fn open(&self, locator: &Url) -> anyhow::Result<BoxReader>;
}

/// Reads regular files. The path is the locator's host joined with its path,
/// so both `file:///abs/path` and `file://relative/path` work.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileGetter;

impl FileGetter {
    pub fn new() -> Self {
        Self
    }

    /// Config for an artifact packaged from `locator`; records where the
    /// content came from.
    pub fn config(&self, locator: &Url) -> FileConfig {
        FileConfig {
            reference: locator.to_string(),
        }
    }

    fn path(&self, locator: &Url) -> PathBuf {
        let host = locator.host_str().unwrap_or_default();
        let path = locator.path();
        if host.is_empty() {
            PathBuf::from(path)
        } else {
            PathBuf::from(host).join(path.trim_start_matches('/'))
        }
    }
}

/// Config blob of a file artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileConfig {
    pub reference: String,
}

impl FileConfig {
    pub fn media_type(&self) -> &'static str {
        MEDIA_TYPE_FILE_LOCAL_CONFIG
    }

    pub fn to_bytes(&self) -> serde_json::Result<Bytes> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    /// Start an artifact whose config is this one; layers are added by the caller.
    pub fn artifact(&self) -> serde_json::Result<StaticArtifact> {
        Ok(StaticArtifact::new(self.media_type(), self.to_bytes()?))
    }
}

#[async_trait]
impl Getter for FileGetter {
    async fn detect(&self, locator: &Url) -> bool {
        let path = self.path(locator);
        if path.as_os_str().is_empty() {
            return false;
        }
        match tokio::fs::metadata(&path).await {
            Ok(meta) => !meta.is_dir(),
            Err(_) => false,
        }
    }

    fn name(&self, locator: &Url) -> String {
        self.path(locator)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    async fn open(&self, locator: &Url) -> anyhow::Result<BoxReader> {
        let path = self.path(locator);
        let file = tokio::fs::File::open(&path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;
        Ok(Box::new(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    fn file_url(path: &std::path::Path) -> Url {
        Url::from_file_path(path).unwrap()
    }

    #[tokio::test]
    async fn test_detects_files_not_directories() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("chart.tgz");
        std::fs::write(&file, b"chart").unwrap();

        let getter = FileGetter::new();
        assert!(getter.detect(&file_url(&file)).await);
        assert!(!getter.detect(&file_url(temp_dir.path())).await);
        assert!(!getter.detect(&file_url(&temp_dir.path().join("missing"))).await);
    }

    #[tokio::test]
    async fn test_name_is_basename() {
        let getter = FileGetter::new();
        let url = Url::parse("file:///opt/artifacts/app.tar.gz").unwrap();
        assert_eq!(getter.name(&url), "app.tar.gz");
    }

    #[test]
    fn test_host_is_joined_with_path() {
        let getter = FileGetter::new();
        let url = Url::parse("file://testdata/config.yaml").unwrap();
        assert_eq!(getter.path(&url), PathBuf::from("testdata/config.yaml"));
    }

    #[tokio::test]
    async fn test_config_records_locator() -> anyhow::Result<()> {
        use crate::artifact::Artifact;

        let url = Url::parse("file:///opt/artifacts/app.tar.gz")?;
        let config = FileGetter::new().config(&url);
        assert_eq!(config.reference, "file:///opt/artifacts/app.tar.gz");

        let value: serde_json::Value = serde_json::from_slice(&config.to_bytes()?)?;
        assert_eq!(value["reference"], "file:///opt/artifacts/app.tar.gz");

        let manifest = config.artifact()?.manifest().await?;
        assert_eq!(manifest.config.media_type, MEDIA_TYPE_FILE_LOCAL_CONFIG);
        assert_eq!(manifest.config.size, config.to_bytes()?.len() as i64);
        Ok(())
    }

    #[tokio::test]
    async fn test_open_reads_contents() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let file = temp_dir.path().join("data.txt");
        std::fs::write(&file, b"file contents")?;

        let mut buf = Vec::new();
        FileGetter::new()
            .open(&file_url(&file))
            .await?
            .read_to_end(&mut buf)
            .await?;
        assert_eq!(buf, b"file contents");
        Ok(())
    }
}
