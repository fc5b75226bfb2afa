//! Index: the append-only ledger behind `index.json`.
//!
//! Each entry is a manifest descriptor whose `org.opencontainers.image.ref.name`
//! annotation carries the reference it was added under. Appending a reference
//! that already exists adds a second record; both stay on disk and are
//! walked in order, and name lookups resolve to the last one appended.
//!
//! The whole index is held in memory and rewritten atomically on every
//! append, so a crash never loses an entry that `append` reported as stored.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::debug;
use uuid::Uuid;

use crate::descriptor::{Descriptor, ImageIndex, OciLayout, ANNOTATION_REF_NAME};
use crate::error::{Result, StoreError};

const TEMP_PREFIX: &str = ".index-";

/// A reference paired with the descriptor it names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub reference: String,
    pub descriptor: Descriptor,
}

/// In-memory mirror of `index.json`.
#[derive(Debug)]
pub struct Index {
    path: PathBuf,
    marker_path: PathBuf,
    manifests: Vec<Descriptor>,
}

impl Index {
    pub fn new(path: impl Into<PathBuf>, marker_path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            marker_path: marker_path.into(),
            manifests: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load `index.json`. A missing file is an empty index; anything else
    /// that prevents reading or parsing it is an error.
    pub async fn load(&mut self) -> Result<()> {
        let data = match fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.manifests.clear();
                return Ok(());
            }
            Err(e) => return Err(StoreError::io("read index", &self.path, e)),
        };

        let index: ImageIndex =
            serde_json::from_slice(&data).map_err(|source| StoreError::Consistency {
                path: self.path.clone(),
                source,
            })?;
        self.manifests = index.manifests;
        debug!(entries = self.manifests.len(), "index loaded");
        Ok(())
    }

    /// Record `descriptor` under `reference` and persist.
    ///
    /// If persisting fails the in-memory entry is dropped again, so memory
    /// never claims more than disk holds.
    pub async fn append(&mut self, reference: &str, descriptor: Descriptor) -> Result<()> {
        validate_reference(reference)?;
        let descriptor = descriptor.with_annotation(ANNOTATION_REF_NAME, reference);
        self.manifests.push(descriptor);

        if let Err(e) = self.persist().await {
            self.manifests.pop();
            return Err(e);
        }
        Ok(())
    }

    /// Visit every entry in append order, stopping at the first error.
    pub fn walk<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(&str, &Descriptor) -> Result<()>,
    {
        for desc in &self.manifests {
            visit(&reference_of(desc), desc)?;
        }
        Ok(())
    }

    /// Last-appended descriptor recorded under `reference`.
    pub fn resolve(&self, reference: &str) -> Option<&Descriptor> {
        self.manifests
            .iter()
            .rev()
            .find(|desc| desc.ref_name() == Some(reference))
    }

    /// Snapshot of all entries in append order.
    pub fn entries(&self) -> Vec<IndexEntry> {
        self.manifests
            .iter()
            .map(|desc| IndexEntry {
                reference: reference_of(desc),
                descriptor: desc.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.manifests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.manifests.is_empty()
    }

    /// Forget everything held in memory. Disk is untouched.
    pub fn clear(&mut self) {
        self.manifests.clear();
    }

    /// Write `index.json` (via temp file + rename) and ensure the
    /// `oci-layout` marker exists.
    pub async fn persist(&self) -> Result<()> {
        self.ensure_layout().await?;
        let root = self.root();

        let doc = ImageIndex::new(self.manifests.clone());
        let data = serde_json::to_vec_pretty(&doc).map_err(|source| StoreError::Consistency {
            path: self.path.clone(),
            source,
        })?;

        let tmp = root.join(format!("{}{}.json", TEMP_PREFIX, Uuid::new_v4().simple()));
        fs::write(&tmp, &data)
            .await
            .map_err(|e| StoreError::io("write index", &tmp, e))?;
        if let Err(e) = fs::rename(&tmp, &self.path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(StoreError::io("replace index", &self.path, e));
        }
        Ok(())
    }

    /// Create the layout root and the `oci-layout` marker if either is missing.
    pub async fn ensure_layout(&self) -> Result<()> {
        let root = self.root();
        fs::create_dir_all(root)
            .await
            .map_err(|e| StoreError::io("create layout root", root, e))?;

        if fs::metadata(&self.marker_path).await.is_err() {
            let marker = serde_json::to_vec(&OciLayout::default()).map_err(|source| {
                StoreError::Consistency {
                    path: self.marker_path.clone(),
                    source,
                }
            })?;
            fs::write(&self.marker_path, marker)
                .await
                .map_err(|e| StoreError::io("write layout marker", &self.marker_path, e))?;
        }
        Ok(())
    }

    /// Remove temp files left by a persist that never reached its rename.
    pub async fn sweep_temp_files(&self) -> Result<usize> {
        let root = self.root();
        let mut entries = match fs::read_dir(root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(StoreError::io("list layout root", root, e)),
        };

        let mut removed = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io("list layout root", root, e))?
        {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(TEMP_PREFIX) && name.ends_with(".json") {
                let path = entry.path();
                fs::remove_file(&path)
                    .await
                    .map_err(|e| StoreError::io("remove index temp file", &path, e))?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn root(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }
}

/// References must be non-empty and free of whitespace and control characters.
pub fn validate_reference(reference: &str) -> Result<()> {
    if reference.is_empty() {
        return Err(StoreError::Input("reference must not be empty".to_string()));
    }
    if reference.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(StoreError::Input(format!(
            "reference contains whitespace or control characters: {:?}",
            reference
        )));
    }
    Ok(())
}

fn reference_of(desc: &Descriptor) -> String {
    desc.ref_name()
        .map(str::to_string)
        .unwrap_or_else(|| desc.digest.to_string())
}
