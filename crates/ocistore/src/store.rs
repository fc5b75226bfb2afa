//! LayoutStore: an OCI image layout on local disk.
//!
//! Layout:
//! ```text
//! {root}/
//! ├── oci-layout                 # {"imageLayoutVersion":"1.0.0"}
//! ├── index.json                 # reference -> manifest descriptor records
//! └── blobs/
//!     └── sha256/
//!         └── 2c26b46b68ff...    # manifests, configs and layers alike
//! ```
//!
//! Adding an artifact writes its manifest, config and layers as blobs
//! (layers concurrently) and then appends one index entry. Nothing is rolled
//! back on failure: orphaned blobs are inert, and entries indexed before a
//! failure in a collection add stay indexed.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use tokio::fs;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::artifact::{Artifact, Collection, Layer};
use crate::blob::{BlobStore, WrittenBlob};
use crate::cache::{CachedArtifact, LayerCache};
use crate::config::LayoutConfig;
use crate::descriptor::{Descriptor, ANNOTATION_REF_NAME};
use crate::error::{Result, StoreError};
use crate::index::{validate_reference, Index, IndexEntry};
use crate::target::Target;
use crate::transfer;

/// Maps a local reference to the reference used at the copy target.
pub type ReferenceMapper = dyn Fn(&str) -> anyhow::Result<String> + Send + Sync;

/// Content store backed by an OCI image layout directory.
pub struct LayoutStore {
    config: LayoutConfig,
    blobs: BlobStore,
    index: RwLock<Index>,
    cache: Option<Arc<dyn LayerCache>>,
}

impl std::fmt::Debug for LayoutStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayoutStore")
            .field("root", &self.config.root)
            .field("cached", &self.cache.is_some())
            .finish()
    }
}

impl LayoutStore {
    /// Open (or initialize) the layout described by `config`.
    ///
    /// A missing `index.json` is an empty store. An unreadable or corrupt one
    /// fails the open; there is no partially usable store.
    pub async fn open(config: LayoutConfig) -> Result<Self> {
        let blobs = BlobStore::new(config.blobs_dir(), config.digest_algorithm);
        let mut index = Index::new(config.index_path(), config.layout_marker_path());
        index.load().await.map_err(|e| e.context("load index"))?;
        index
            .ensure_layout()
            .await
            .map_err(|e| e.context("initialize layout"))?;

        if config.sweep_partials {
            let removed = blobs.sweep_partials().await?
                + index
                    .sweep_temp_files()
                    .await
                    .map_err(|e| e.context("sweep index temp files"))?;
            if removed > 0 {
                warn!(removed, "swept partial files left by an earlier run");
            }
        }

        debug!(root = %config.root.display(), entries = index.len(), "layout opened");
        Ok(Self {
            config,
            blobs,
            index: RwLock::new(index),
            cache: None,
        })
    }

    /// Open a layout at a specific root with default settings.
    pub async fn at_path(root: impl Into<PathBuf>) -> Result<Self> {
        Self::open(LayoutConfig::at(root)).await
    }

    /// Builder: route layer materialization through `cache`.
    pub fn with_cache(mut self, cache: Arc<dyn LayerCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    pub fn config(&self) -> &LayoutConfig {
        &self.config
    }

    /// Persist an artifact and index its manifest under `reference`.
    #[instrument(skip_all, fields(reference = %reference))]
    pub async fn add_oci(
        &self,
        artifact: Arc<dyn Artifact>,
        reference: &str,
        cancel: &CancellationToken,
    ) -> Result<Descriptor> {
        validate_reference(reference)?;
        check_cancelled(cancel)?;

        let artifact: Arc<dyn Artifact> = match &self.cache {
            Some(cache) => Arc::new(CachedArtifact::new(artifact, cache.clone())),
            None => artifact,
        };

        // Manifest
        let manifest = artifact
            .manifest()
            .await
            .map_err(|e| StoreError::step("manifest", e))?;
        let mdata = manifest
            .to_bytes()
            .map_err(|e| StoreError::step("marshal manifest", e.into()))?;
        let written = self
            .blobs
            .write(&mdata)
            .await
            .map_err(|e| e.context("write manifest blob"))?;
        check_cancelled(cancel)?;

        // Config
        let cdata = artifact
            .raw_config()
            .await
            .map_err(|e| StoreError::step("raw config", e))?;
        let config_alg = manifest.config.digest.algorithm();
        let actual = config_alg.digest(&cdata);
        if actual != manifest.config.digest {
            return Err(StoreError::DigestMismatch {
                expected: manifest.config.digest.clone(),
                actual,
            }
            .context("write config blob"));
        }
        self.blobs
            .write_with(&cdata, config_alg)
            .await
            .map_err(|e| e.context("write config blob"))?;
        check_cancelled(cancel)?;

        // Layers
        let layers = artifact
            .layers()
            .await
            .map_err(|e| StoreError::step("layers", e))?;
        let layer_count = layers.len();
        self.write_layers(layers, cancel)
            .await
            .map_err(|e| e.context("write layers"))?;

        let descriptor = Descriptor::new(
            manifest.media_type.clone(),
            written.digest,
            mdata.len() as i64,
        )
        .with_annotation(ANNOTATION_REF_NAME, reference);

        self.index
            .write()
            .await
            .append(reference, descriptor.clone())
            .await
            .map_err(|e| e.context("add index"))?;

        info!(digest = %descriptor.digest, layers = layer_count, "artifact added");
        Ok(descriptor)
    }

    /// Add every artifact of a collection, in order, stopping at the first
    /// failure. Artifacts added before the failure stay indexed.
    pub async fn add_oci_collection(
        &self,
        collection: &dyn Collection,
        cancel: &CancellationToken,
    ) -> Result<Vec<Descriptor>> {
        let contents = collection
            .contents()
            .await
            .map_err(|e| StoreError::Input(format!("expand collection: {:#}", e)))?;

        let mut descs = Vec::with_capacity(contents.len());
        for (reference, artifact) in contents {
            match self.add_oci(artifact, &reference, cancel).await {
                Ok(desc) => descs.push(desc),
                Err(e) => {
                    return Err(StoreError::Collection {
                        completed: descs,
                        source: Box::new(e.context(format!("add {}", reference))),
                    })
                }
            }
        }
        Ok(descs)
    }

    /// Delete every blob, the index and the layout marker.
    ///
    /// Only layout-owned paths are removed, so a root shared with other
    /// files keeps those files. Missing paths are not an error.
    #[instrument(skip_all, fields(root = %self.config.root.display()))]
    pub async fn flush(&self, cancel: &CancellationToken) -> Result<()> {
        check_cancelled(cancel)?;
        let mut index = self.index.write().await;

        self.blobs.remove_all().await?;
        remove_file_if_present(&self.config.index_path()).await?;
        remove_file_if_present(&self.config.layout_marker_path()).await?;
        index.clear();

        info!("layout flushed");
        Ok(())
    }

    /// Copy the graph under `reference` into `target`, tagging it there as
    /// `target_reference` (or `reference` when that is empty).
    #[instrument(skip_all, fields(reference = %reference, target_reference = %target_reference))]
    pub async fn copy(
        &self,
        reference: &str,
        target: &dyn Target,
        target_reference: &str,
        cancel: &CancellationToken,
    ) -> Result<Descriptor> {
        let desc = self
            .resolve(reference)
            .await
            .ok_or_else(|| StoreError::NotFound(reference.to_string()))?;

        self.copy_descriptor(reference, &desc, target, target_reference, cancel)
            .await
            .map_err(|e| e.context(format!("copy {} to {}", reference, target_reference)))
    }

    /// Copy every index entry, in index order, to `target`.
    ///
    /// `mapper` renames references on the way out. The first mapper or copy
    /// failure aborts the whole walk.
    pub async fn copy_all(
        &self,
        target: &dyn Target,
        mapper: Option<&ReferenceMapper>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Descriptor>> {
        let entries = self.entries().await;
        let mut descs = Vec::with_capacity(entries.len());

        for IndexEntry {
            reference,
            descriptor,
        } in entries
        {
            check_cancelled(cancel)?;
            let target_reference = match mapper {
                Some(map) => map(&reference).map_err(|source| StoreError::Mapper {
                    reference: reference.clone(),
                    source,
                })?,
                None => reference.clone(),
            };

            let desc = self
                .copy_descriptor(&reference, &descriptor, target, &target_reference, cancel)
                .await
                .map_err(|e| e.context(format!("layout copy {}", reference)))?;
            descs.push(desc);
        }

        info!(copied = descs.len(), "copied all references");
        Ok(descs)
    }

    /// Best-effort probe of the config media type inside a manifest.
    ///
    /// Returns an empty string when the blob is missing or is not a
    /// manifest; failures are logged, never returned.
    pub async fn identify(&self, desc: &Descriptor) -> String {
        #[derive(Deserialize)]
        struct Probe {
            config: ProbeConfig,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct ProbeConfig {
            #[serde(default)]
            media_type: String,
        }

        let data = match self.blobs.read(&desc.digest).await {
            Ok(data) => data,
            Err(e) => {
                warn!(digest = %desc.digest, error = %e, "identify: cannot read blob");
                return String::new();
            }
        };
        match serde_json::from_slice::<Probe>(&data) {
            Ok(probe) => probe.config.media_type,
            Err(e) => {
                debug!(digest = %desc.digest, error = %e, "identify: not a manifest");
                String::new()
            }
        }
    }

    /// Last descriptor indexed under `reference`.
    pub async fn resolve(&self, reference: &str) -> Option<Descriptor> {
        self.index.read().await.resolve(reference).cloned()
    }

    /// All index entries in append order.
    pub async fn entries(&self) -> Vec<IndexEntry> {
        self.index.read().await.entries()
    }

    /// Visit index entries in append order, stopping at the first error.
    pub async fn walk<F>(&self, visit: F) -> Result<()>
    where
        F: FnMut(&str, &Descriptor) -> Result<()>,
    {
        self.index.read().await.walk(visit)
    }

    /// Read the blob a descriptor points at.
    pub async fn fetch(&self, desc: &Descriptor) -> Result<Bytes> {
        self.blobs.read(&desc.digest).await
    }

    /// Open the blob a descriptor points at for streaming.
    pub async fn fetch_reader(&self, desc: &Descriptor) -> Result<fs::File> {
        self.blobs.open(&desc.digest).await
    }

    async fn copy_descriptor(
        &self,
        reference: &str,
        desc: &Descriptor,
        target: &dyn Target,
        target_reference: &str,
        cancel: &CancellationToken,
    ) -> Result<Descriptor> {
        let target_reference = if target_reference.is_empty() {
            reference
        } else {
            target_reference
        };

        let pushed = transfer::copy_graph(&self.blobs, desc, target, cancel).await?;
        target
            .tag(desc, target_reference)
            .await
            .map_err(|e| StoreError::target("tag", e))?;

        info!(
            reference,
            target_reference,
            digest = %desc.digest,
            pushed,
            "reference copied"
        );
        Ok(desc.clone())
    }

    async fn write_layers(
        &self,
        layers: Vec<Arc<dyn Layer>>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        // Never more permits than layers; also keeps huge settings under
        // the semaphore's permit ceiling.
        let limit = match self.config.layer_concurrency {
            0 => layers.len(),
            n => n.min(layers.len()),
        }
        .max(1);
        let permits = Arc::new(Semaphore::new(limit));

        let mut tasks = JoinSet::new();
        for layer in layers {
            let blobs = self.blobs.clone();
            let permits = permits.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|_| StoreError::Cancelled)?;
                write_layer(&blobs, layer.as_ref(), &cancel).await
            });
        }

        // Every write runs to completion; the first failure is reported.
        let mut first_err = None;
        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => Err(StoreError::step("layer task", e.into())),
            };
            if let Err(e) = outcome {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

async fn write_layer(
    blobs: &BlobStore,
    layer: &dyn Layer,
    cancel: &CancellationToken,
) -> Result<WrittenBlob> {
    check_cancelled(cancel)?;
    let declared = layer
        .digest()
        .await
        .map_err(|e| StoreError::step("layer digest", e))?;
    let named = |source: StoreError| StoreError::Layer {
        digest: declared.to_string(),
        source: Box::new(source),
    };

    if let Some(size) = blobs.size_of(&declared).await.map_err(named)? {
        debug!(digest = %declared, "layer already present");
        return Ok(WrittenBlob {
            digest: declared.clone(),
            size,
            existed: true,
        });
    }

    let reader = layer
        .compressed()
        .await
        .map_err(|e| named(StoreError::step("compressed", e)))?;
    blobs
        .write_stream(reader, Some(&declared))
        .await
        .map_err(named)
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(StoreError::Cancelled);
    }
    Ok(())
}

async fn remove_file_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::io("remove", path, e)),
    }
}

/// A store can be the destination of another store's copy.
#[async_trait]
impl Target for LayoutStore {
    async fn exists(&self, descriptor: &Descriptor) -> anyhow::Result<bool> {
        Ok(self.blobs.exists(&descriptor.digest).await?)
    }

    async fn push(&self, descriptor: &Descriptor, data: Bytes) -> anyhow::Result<()> {
        let actual = descriptor.digest.algorithm().digest(&data);
        if actual != descriptor.digest {
            return Err(StoreError::DigestMismatch {
                expected: descriptor.digest.clone(),
                actual,
            }
            .into());
        }
        self.blobs
            .write_with(&data, descriptor.digest.algorithm())
            .await?;
        Ok(())
    }

    async fn tag(&self, descriptor: &Descriptor, reference: &str) -> anyhow::Result<()> {
        self.index
            .write()
            .await
            .append(reference, descriptor.clone())
            .await?;
        Ok(())
    }
}
