//! Layout configuration with environment variable and file-based loading.
//!
//! Environment variables:
//! - `OCISTORE_ROOT`: Root directory of the image layout
//! - `OCISTORE_DIGEST_ALGORITHM`: `sha256` (default), `sha512` or `blake3`
//! - `OCISTORE_LAYER_CONCURRENCY`: Max parallel layer writes (0 = unbounded)
//!
//! Default root: `~/.ocistore/layout`

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

use crate::digest::Algorithm;

/// Configuration for a [`LayoutStore`](crate::LayoutStore).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayoutConfig {
    /// Root of the image layout.
    /// Blobs live in `{root}/blobs/`, references in `{root}/index.json`.
    pub root: PathBuf,

    /// Algorithm used to address newly written blobs.
    #[serde(default)]
    pub digest_algorithm: Algorithm,

    /// Upper bound on concurrent layer writes within one add.
    /// Zero means every layer is written at once.
    #[serde(default)]
    pub layer_concurrency: usize,

    /// Remove `.partial-*` leftovers from interrupted writes when opening.
    #[serde(default = "default_true")]
    pub sweep_partials: bool,
}

fn default_true() -> bool {
    true
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self::at(default_root())
    }
}

/// Get the default layout root (~/.ocistore/layout).
fn default_root() -> PathBuf {
    directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().join(".ocistore").join("layout"))
        .unwrap_or_else(|| PathBuf::from(".ocistore/layout"))
}

impl LayoutConfig {
    /// Create a config rooted at a specific directory.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            digest_algorithm: Algorithm::default(),
            layer_concurrency: 0,
            sweep_partials: true,
        }
    }

    /// Builder: choose the digest algorithm.
    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.digest_algorithm = algorithm;
        self
    }

    /// Builder: cap concurrent layer writes.
    pub fn with_layer_concurrency(mut self, limit: usize) -> Self {
        self.layer_concurrency = limit;
        self
    }

    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let root = env::var("OCISTORE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_root());

        let digest_algorithm = match env::var("OCISTORE_DIGEST_ALGORITHM") {
            Ok(v) => v
                .to_lowercase()
                .parse()
                .context("invalid OCISTORE_DIGEST_ALGORITHM")?,
            Err(_) => Algorithm::default(),
        };

        let layer_concurrency = match env::var("OCISTORE_LAYER_CONCURRENCY") {
            Ok(v) => v.parse().context("invalid OCISTORE_LAYER_CONCURRENCY")?,
            Err(_) => 0,
        };

        Ok(Self {
            root,
            digest_algorithm,
            layer_concurrency,
            sweep_partials: true,
        })
    }

    /// Load configuration from a TOML file, falling back to environment.
    ///
    /// The file should contain a `[store]` section:
    /// ```toml
    /// [store]
    /// root = "/var/lib/ocistore"
    /// digest_algorithm = "sha256"
    /// layer_concurrency = 8
    /// ```
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        let table: toml::Table = contents
            .parse()
            .with_context(|| format!("failed to parse TOML: {}", path.display()))?;

        match table.get("store") {
            Some(section) => section
                .clone()
                .try_into::<LayoutConfig>()
                .context("failed to parse [store] section"),
            None => Self::from_env(),
        }
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs")
    }

    pub fn index_path(&self) -> PathBuf {
        self.root.join("index.json")
    }

    pub fn layout_marker_path(&self) -> PathBuf {
        self.root.join("oci-layout")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = LayoutConfig::default();
        assert!(config.root.to_string_lossy().contains(".ocistore"));
        assert_eq!(config.digest_algorithm, Algorithm::Sha256);
        assert_eq!(config.layer_concurrency, 0);
        assert!(config.sweep_partials);
    }

    #[test]
    fn test_layout_paths() {
        let config = LayoutConfig::at("/srv/layout");
        assert_eq!(config.blobs_dir(), PathBuf::from("/srv/layout/blobs"));
        assert_eq!(config.index_path(), PathBuf::from("/srv/layout/index.json"));
        assert_eq!(
            config.layout_marker_path(),
            PathBuf::from("/srv/layout/oci-layout")
        );
    }

    #[test]
    fn test_builders() {
        let config = LayoutConfig::at("/x")
            .with_algorithm(Algorithm::Blake3)
            .with_layer_concurrency(4);
        assert_eq!(config.digest_algorithm, Algorithm::Blake3);
        assert_eq!(config.layer_concurrency, 4);
    }

    #[test]
    fn test_from_file_store_section() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("ocistore.toml");
        std::fs::write(
            &path,
            r#"
[store]
root = "/tank/layout"
digest_algorithm = "sha512"
layer_concurrency = 3
"#,
        )?;

        let config = LayoutConfig::from_file(&path)?;
        assert_eq!(config.root, PathBuf::from("/tank/layout"));
        assert_eq!(config.digest_algorithm, Algorithm::Sha512);
        assert_eq!(config.layer_concurrency, 3);
        assert!(config.sweep_partials);
        Ok(())
    }

    #[test]
    fn test_from_file_rejects_bad_toml() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("broken.toml");
        std::fs::write(&path, "[store\nroot = ")?;

        let err = LayoutConfig::from_file(&path).unwrap_err();
        assert!(err.to_string().contains("failed to parse TOML"));
        Ok(())
    }

    #[test]
    fn test_serde_roundtrip() {
        let config = LayoutConfig::at("/custom").with_algorithm(Algorithm::Blake3);
        let json = serde_json::to_string(&config).unwrap();
        let restored: LayoutConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config.root, restored.root);
        assert_eq!(config.digest_algorithm, restored.digest_algorithm);
    }
}
