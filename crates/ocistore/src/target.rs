//! Copy targets: anything that can receive blobs and tag a manifest.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use crate::descriptor::Descriptor;
use crate::digest::Digest;

/// Destination for [`LayoutStore::copy`](crate::LayoutStore::copy).
#[async_trait]
pub trait Target: Send + Sync {
    /// Whether the target already holds this blob. Copy uses it to skip
    /// pushes; returning `false` is always safe.
    async fn exists(&self, _descriptor: &Descriptor) -> anyhow::Result<bool> {
        Ok(false)
    }

    /// Store a blob. The bytes match `descriptor` exactly.
    async fn push(&self, descriptor: &Descriptor, data: Bytes) -> anyhow::Result<()>;

    /// Point `reference` at a manifest that has already been pushed.
    async fn tag(&self, descriptor: &Descriptor, reference: &str) -> anyhow::Result<()>;
}

/// Target that keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemoryTarget {
    blobs: RwLock<HashMap<Digest, Bytes>>,
    tags: RwLock<HashMap<String, Descriptor>>,
    pushes: RwLock<Vec<Digest>>,
}

impl MemoryTarget {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn blob(&self, digest: &Digest) -> Option<Bytes> {
        self.blobs.read().await.get(digest).cloned()
    }

    pub async fn resolve(&self, reference: &str) -> Option<Descriptor> {
        self.tags.read().await.get(reference).cloned()
    }

    pub async fn blob_count(&self) -> usize {
        self.blobs.read().await.len()
    }

    /// Digests in the order they were pushed, including repeats.
    pub async fn push_log(&self) -> Vec<Digest> {
        self.pushes.read().await.clone()
    }
}

#[async_trait]
impl Target for MemoryTarget {
    async fn exists(&self, descriptor: &Descriptor) -> anyhow::Result<bool> {
        Ok(self.blobs.read().await.contains_key(&descriptor.digest))
    }

    async fn push(&self, descriptor: &Descriptor, data: Bytes) -> anyhow::Result<()> {
        if data.len() as i64 != descriptor.size {
            anyhow::bail!(
                "size mismatch for {}: descriptor says {}, got {}",
                descriptor.digest,
                descriptor.size,
                data.len()
            );
        }
        self.pushes.write().await.push(descriptor.digest.clone());
        self.blobs
            .write()
            .await
            .insert(descriptor.digest.clone(), data);
        Ok(())
    }

    async fn tag(&self, descriptor: &Descriptor, reference: &str) -> anyhow::Result<()> {
        if !self.blobs.read().await.contains_key(&descriptor.digest) {
            anyhow::bail!("cannot tag {}: manifest {} not pushed", reference, descriptor.digest);
        }
        self.tags
            .write()
            .await
            .insert(reference.to_string(), descriptor.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::MEDIA_TYPE_OCI_MANIFEST;
    use crate::digest::Algorithm;

    #[tokio::test]
    async fn test_push_then_tag() -> anyhow::Result<()> {
        let target = MemoryTarget::new();
        let desc = Descriptor::for_bytes(MEDIA_TYPE_OCI_MANIFEST, Algorithm::Sha256, b"manifest");

        assert!(!target.exists(&desc).await?);
        target.push(&desc, Bytes::from_static(b"manifest")).await?;
        target.tag(&desc, "app:v1").await?;

        assert!(target.exists(&desc).await?);
        assert_eq!(target.resolve("app:v1").await, Some(desc.clone()));
        assert_eq!(target.blob(&desc.digest).await, Some(Bytes::from_static(b"manifest")));
        Ok(())
    }

    #[tokio::test]
    async fn test_tag_requires_pushed_manifest() {
        let target = MemoryTarget::new();
        let desc = Descriptor::for_bytes(MEDIA_TYPE_OCI_MANIFEST, Algorithm::Sha256, b"ghost");
        assert!(target.tag(&desc, "ghost").await.is_err());
    }

    #[tokio::test]
    async fn test_push_rejects_size_mismatch() {
        let target = MemoryTarget::new();
        let desc = Descriptor::for_bytes(MEDIA_TYPE_OCI_MANIFEST, Algorithm::Sha256, b"four");
        assert!(target.push(&desc, Bytes::from_static(b"five!")).await.is_err());
        assert_eq!(target.blob_count().await, 0);
    }
}
