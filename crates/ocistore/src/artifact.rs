//! Artifact collaborators: the things a [`LayoutStore`](crate::LayoutStore) persists.
//!
//! Packaging (turning files, charts or images into a manifest, a config and
//! layers) happens elsewhere. The store only sees these traits, and every
//! method may do I/O, so nothing is assumed to be materialized up front.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncRead;

use crate::descriptor::{Descriptor, Manifest, MEDIA_TYPE_OCI_LAYER};
use crate::digest::{Algorithm, Digest};

/// Boxed byte stream handed out by layers and getters.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// One unit of payload referenced by a manifest.
#[async_trait]
pub trait Layer: Send + Sync {
    /// Digest of the compressed bytes, as the producer declares it.
    async fn digest(&self) -> anyhow::Result<Digest>;

    fn media_type(&self) -> String {
        MEDIA_TYPE_OCI_LAYER.to_string()
    }

    /// The compressed byte stream. May be called more than once.
    async fn compressed(&self) -> anyhow::Result<BoxReader>;
}

/// A single packaged artifact.
#[async_trait]
pub trait Artifact: Send + Sync {
    async fn manifest(&self) -> anyhow::Result<Manifest>;

    async fn raw_config(&self) -> anyhow::Result<Bytes>;

    async fn layers(&self) -> anyhow::Result<Vec<Arc<dyn Layer>>>;
}

/// A set of artifacts, each with the reference it should be indexed under.
#[async_trait]
pub trait Collection: Send + Sync {
    async fn contents(&self) -> anyhow::Result<Vec<(String, Arc<dyn Artifact>)>>;
}

/// A layer backed by bytes already in memory.
#[derive(Debug, Clone)]
pub struct StaticLayer {
    data: Bytes,
    media_type: String,
    digest: Digest,
}

impl StaticLayer {
    pub fn new(data: impl Into<Bytes>, media_type: impl Into<String>) -> Self {
        Self::with_algorithm(data, media_type, Algorithm::Sha256)
    }

    pub fn with_algorithm(
        data: impl Into<Bytes>,
        media_type: impl Into<String>,
        algorithm: Algorithm,
    ) -> Self {
        let data = data.into();
        let digest = algorithm.digest(&data);
        Self {
            data,
            media_type: media_type.into(),
            digest,
        }
    }

    pub fn descriptor(&self) -> Descriptor {
        Descriptor::new(
            self.media_type.clone(),
            self.digest.clone(),
            self.data.len() as i64,
        )
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

#[async_trait]
impl Layer for StaticLayer {
    async fn digest(&self) -> anyhow::Result<Digest> {
        Ok(self.digest.clone())
    }

    fn media_type(&self) -> String {
        self.media_type.clone()
    }

    async fn compressed(&self) -> anyhow::Result<BoxReader> {
        Ok(Box::new(Cursor::new(self.data.clone())))
    }
}

/// An artifact assembled from an in-memory config and static layers.
#[derive(Debug, Clone)]
pub struct StaticArtifact {
    config: Bytes,
    config_media_type: String,
    algorithm: Algorithm,
    layers: Vec<StaticLayer>,
    annotations: BTreeMap<String, String>,
}

impl StaticArtifact {
    pub fn new(config_media_type: impl Into<String>, config: impl Into<Bytes>) -> Self {
        Self {
            config: config.into(),
            config_media_type: config_media_type.into(),
            algorithm: Algorithm::Sha256,
            layers: Vec::new(),
            annotations: BTreeMap::new(),
        }
    }

    /// Builder: hash the config with a different algorithm.
    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_layer(mut self, layer: StaticLayer) -> Self {
        self.layers.push(layer);
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    pub fn layer_data(&self) -> impl Iterator<Item = &Bytes> {
        self.layers.iter().map(StaticLayer::data)
    }
}

#[async_trait]
impl Artifact for StaticArtifact {
    async fn manifest(&self) -> anyhow::Result<Manifest> {
        let config = Descriptor::for_bytes(self.config_media_type.clone(), self.algorithm, &self.config);
        let layers = self.layers.iter().map(StaticLayer::descriptor).collect();
        let mut manifest = Manifest::new(config, layers);
        manifest.annotations = self.annotations.clone();
        Ok(manifest)
    }

    async fn raw_config(&self) -> anyhow::Result<Bytes> {
        Ok(self.config.clone())
    }

    async fn layers(&self) -> anyhow::Result<Vec<Arc<dyn Layer>>> {
        Ok(self
            .layers
            .iter()
            .cloned()
            .map(|layer| Arc::new(layer) as Arc<dyn Layer>)
            .collect())
    }
}

/// An ordered collection of `(reference, artifact)` pairs.
#[derive(Default, Clone)]
pub struct StaticCollection {
    items: Vec<(String, Arc<dyn Artifact>)>,
}

impl StaticCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, reference: impl Into<String>, artifact: Arc<dyn Artifact>) -> Self {
        self.items.push((reference.into(), artifact));
        self
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[async_trait]
impl Collection for StaticCollection {
    async fn contents(&self) -> anyhow::Result<Vec<(String, Arc<dyn Artifact>)>> {
        Ok(self.items.clone())
    }
}
