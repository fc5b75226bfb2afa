//! Layer cache: reuse previously materialized layer bytes.
//!
//! [`CachedArtifact`] wraps any [`Artifact`] and hands out [`CachedLayer`]s
//! whose `compressed()` consults a [`LayerCache`] first. The cache is keyed by
//! the layer's declared digest, and a hit is only served if the cached bytes
//! still hash to that digest, so caching can never change what gets stored.

use std::io::{Cursor, ErrorKind};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::artifact::{Artifact, BoxReader, Layer};
use crate::descriptor::Manifest;
use crate::digest::Digest;

/// Storage for materialized layer bytes.
#[async_trait]
pub trait LayerCache: Send + Sync {
    async fn get(&self, key: &Digest) -> anyhow::Result<Option<Bytes>>;

    async fn put(&self, key: &Digest, data: Bytes) -> anyhow::Result<()>;
}

/// Process-local cache.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<Digest, Bytes>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl LayerCache for MemoryCache {
    async fn get(&self, key: &Digest) -> anyhow::Result<Option<Bytes>> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn put(&self, key: &Digest, data: Bytes) -> anyhow::Result<()> {
        self.entries.insert(key.clone(), data);
        Ok(())
    }
}

/// On-disk cache laid out as `{dir}/<algorithm>/<hex>`, write-once like blobs.
#[derive(Debug, Clone)]
pub struct DirCache {
    dir: PathBuf,
}

impl DirCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn entry_path(&self, key: &Digest) -> PathBuf {
        self.dir.join(key.algorithm().as_str()).join(key.hex())
    }
}

#[async_trait]
impl LayerCache for DirCache {
    async fn get(&self, key: &Digest) -> anyhow::Result<Option<Bytes>> {
        match fs::read(self.entry_path(key)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &Digest, data: Bytes) -> anyhow::Result<()> {
        let path = self.entry_path(key);
        if fs::metadata(&path).await.is_ok() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
            let tmp = parent.join(format!(".partial-{}", Uuid::new_v4().simple()));
            fs::write(&tmp, &data).await?;
            if let Err(e) = fs::rename(&tmp, &path).await {
                let _ = fs::remove_file(&tmp).await;
                return Err(e.into());
            }
        }
        Ok(())
    }
}

/// Decorates an artifact so its layers go through a cache.
pub struct CachedArtifact {
    inner: Arc<dyn Artifact>,
    cache: Arc<dyn LayerCache>,
}

impl CachedArtifact {
    pub fn new(inner: Arc<dyn Artifact>, cache: Arc<dyn LayerCache>) -> Self {
        Self { inner, cache }
    }
}

#[async_trait]
impl Artifact for CachedArtifact {
    async fn manifest(&self) -> anyhow::Result<Manifest> {
        self.inner.manifest().await
    }

    async fn raw_config(&self) -> anyhow::Result<Bytes> {
        self.inner.raw_config().await
    }

    async fn layers(&self) -> anyhow::Result<Vec<Arc<dyn Layer>>> {
        Ok(self
            .inner
            .layers()
            .await?
            .into_iter()
            .map(|layer| {
                Arc::new(CachedLayer {
                    inner: layer,
                    cache: self.cache.clone(),
                }) as Arc<dyn Layer>
            })
            .collect())
    }
}

/// A layer whose compressed bytes are served from cache when possible.
pub struct CachedLayer {
    inner: Arc<dyn Layer>,
    cache: Arc<dyn LayerCache>,
}

#[async_trait]
impl Layer for CachedLayer {
    async fn digest(&self) -> anyhow::Result<Digest> {
        self.inner.digest().await
    }

    fn media_type(&self) -> String {
        self.inner.media_type()
    }

    async fn compressed(&self) -> anyhow::Result<BoxReader> {
        let key = self.inner.digest().await?;

        match self.cache.get(&key).await {
            Ok(Some(data)) if key.algorithm().digest(&data) == key => {
                debug!(digest = %key, "layer cache hit");
                return Ok(Box::new(Cursor::new(data)));
            }
            Ok(Some(_)) => warn!(digest = %key, "cached layer failed verification, recomputing"),
            Ok(None) => debug!(digest = %key, "layer cache miss"),
            Err(e) => warn!(digest = %key, error = %e, "layer cache read failed, recomputing"),
        }

        let mut data = Vec::new();
        self.inner.compressed().await?.read_to_end(&mut data).await?;
        let data = Bytes::from(data);

        if key.algorithm().digest(&data) == key {
            if let Err(e) = self.cache.put(&key, data.clone()).await {
                warn!(digest = %key, error = %e, "layer cache write failed");
            }
        }
        Ok(Box::new(Cursor::new(data)))
    }
}
