//! Common test utilities for layout store tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::TempDir;

use ocistore::descriptor::{Manifest, MEDIA_TYPE_OCI_LAYER};
use ocistore::{
    Artifact, BoxReader, Digest, Layer, LayoutConfig, LayoutStore, StaticArtifact, StaticLayer,
};

pub const CONFIG_MEDIA_TYPE: &str = "application/vnd.example.config.v1+json";

static TRACING: Once = Once::new();

/// Install a test subscriber once; honors `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A store in a fresh temporary directory (removed on drop).
pub struct TestLayout {
    pub store: LayoutStore,
    pub dir: TempDir,
}

impl TestLayout {
    pub async fn new() -> Self {
        Self::with_config(|config| config).await
    }

    pub async fn with_config(tweak: impl FnOnce(LayoutConfig) -> LayoutConfig) -> Self {
        init_tracing();
        let dir = TempDir::new().expect("create temp dir");
        let config = tweak(LayoutConfig::at(dir.path()));
        let store = LayoutStore::open(config).await.expect("open layout");
        Self { store, dir }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root()
            .join("blobs")
            .join(digest.algorithm().as_str())
            .join(digest.hex())
    }

    /// Sorted blob filenames for one algorithm directory.
    pub fn blob_files(&self, algorithm: &str) -> Vec<String> {
        let dir = self.root().join("blobs").join(algorithm);
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }
}

/// An artifact with `layers` distinct layers, tagged by `seed`.
pub fn sample_artifact(seed: &str, layers: usize) -> StaticArtifact {
    let config = format!(r#"{{"seed":"{}"}}"#, seed);
    (0..layers).fold(StaticArtifact::new(CONFIG_MEDIA_TYPE, config), |artifact, i| {
        artifact.with_layer(StaticLayer::new(
            format!("{}-layer-{}", seed, i),
            MEDIA_TYPE_OCI_LAYER,
        ))
    })
}

/// Wraps an artifact and swaps in a layer whose stream cannot be opened.
pub struct BrokenLayerArtifact {
    pub inner: StaticArtifact,
    pub broken: StaticLayer,
}

#[async_trait]
impl Artifact for BrokenLayerArtifact {
    async fn manifest(&self) -> anyhow::Result<Manifest> {
        let mut manifest = self.inner.manifest().await?;
        manifest.layers.push(self.broken.descriptor());
        Ok(manifest)
    }

    async fn raw_config(&self) -> anyhow::Result<Bytes> {
        self.inner.raw_config().await
    }

    async fn layers(&self) -> anyhow::Result<Vec<Arc<dyn Layer>>> {
        let mut layers = self.inner.layers().await?;
        layers.push(Arc::new(FailingLayer {
            digest: self.broken.digest().await?,
        }));
        Ok(layers)
    }
}

/// Layer whose compressed stream always fails.
pub struct FailingLayer {
    pub digest: Digest,
}

#[async_trait]
impl Layer for FailingLayer {
    async fn digest(&self) -> anyhow::Result<Digest> {
        Ok(self.digest.clone())
    }

    async fn compressed(&self) -> anyhow::Result<BoxReader> {
        anyhow::bail!("upstream went away")
    }
}

/// Artifact whose manifest cannot be produced.
pub struct FailingArtifact;

#[async_trait]
impl Artifact for FailingArtifact {
    async fn manifest(&self) -> anyhow::Result<Manifest> {
        anyhow::bail!("packaging failed")
    }

    async fn raw_config(&self) -> anyhow::Result<Bytes> {
        Ok(Bytes::new())
    }

    async fn layers(&self) -> anyhow::Result<Vec<Arc<dyn Layer>>> {
        Ok(Vec::new())
    }
}
