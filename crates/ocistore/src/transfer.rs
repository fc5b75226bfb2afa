//! Transfer: push the content graph under one manifest into a [`Target`].
//!
//! The graph is walked depth first and children are always pushed before
//! the document that references them, so a target never holds a manifest
//! whose config or layers are missing. Every blob is re-hashed as it is read
//! back from disk; a blob that no longer matches its descriptor stops the
//! copy instead of spreading corruption.

use std::collections::HashSet;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::blob::BlobStore;
use crate::descriptor::{
    Descriptor, ImageIndex, Manifest, MEDIA_TYPE_DOCKER_MANIFEST, MEDIA_TYPE_OCI_MANIFEST,
};
use crate::digest::Digest;
use crate::error::{Result, StoreError};
use crate::target::Target;

enum Step {
    Visit { desc: Descriptor, root: bool },
    Push { desc: Descriptor, data: Bytes },
}

/// Copy `root` and everything it references from `blobs` into `target`.
///
/// Returns the number of blobs pushed; blobs the target already reports as
/// present are skipped.
pub(crate) async fn copy_graph(
    blobs: &BlobStore,
    root: &Descriptor,
    target: &dyn Target,
    cancel: &CancellationToken,
) -> Result<usize> {
    let mut stack = vec![Step::Visit {
        desc: root.clone(),
        root: true,
    }];
    let mut seen: HashSet<Digest> = HashSet::new();
    let mut pushed = 0;

    while let Some(step) = stack.pop() {
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }

        match step {
            Step::Visit { desc, root } => {
                if !seen.insert(desc.digest.clone()) {
                    continue;
                }
                let present = target
                    .exists(&desc)
                    .await
                    .map_err(|e| StoreError::target("exists", e))?;
                if present {
                    debug!(digest = %desc.digest, "target already has blob");
                    continue;
                }

                let data = fetch_verified(blobs, &desc).await?;
                let children = children_of(&desc, &data, root)?;
                if children.is_empty() {
                    push(target, &desc, data).await?;
                    pushed += 1;
                } else {
                    stack.push(Step::Push { desc, data });
                    for child in children.into_iter().rev() {
                        stack.push(Step::Visit {
                            desc: child,
                            root: false,
                        });
                    }
                }
            }
            Step::Push { desc, data } => {
                push(target, &desc, data).await?;
                pushed += 1;
            }
        }
    }

    Ok(pushed)
}

/// Read a blob and check it against its descriptor.
pub(crate) async fn fetch_verified(blobs: &BlobStore, desc: &Descriptor) -> Result<Bytes> {
    let data = blobs.read(&desc.digest).await?;
    let actual = desc.digest.algorithm().digest(&data);
    if actual != desc.digest {
        return Err(StoreError::DigestMismatch {
            expected: desc.digest.clone(),
            actual,
        });
    }
    if data.len() as i64 != desc.size {
        return Err(StoreError::Input(format!(
            "size mismatch for {}: descriptor says {}, blob has {}",
            desc.digest,
            desc.size,
            data.len()
        )));
    }
    Ok(data)
}

/// Descriptors referenced by a manifest or index. Anything else is a leaf.
///
/// The root of a copy is always an index entry, so it is decoded as a
/// manifest even when its media type is one we do not recognize.
fn children_of(desc: &Descriptor, data: &[u8], root: bool) -> Result<Vec<Descriptor>> {
    if desc.is_index() {
        let index: ImageIndex = serde_json::from_slice(data)
            .map_err(|e| StoreError::step("decode image index", e.into()))?;
        return Ok(index.manifests);
    }

    let is_manifest = matches!(
        desc.media_type.as_str(),
        MEDIA_TYPE_OCI_MANIFEST | MEDIA_TYPE_DOCKER_MANIFEST
    );
    if is_manifest || root {
        let manifest: Manifest = serde_json::from_slice(data)
            .map_err(|e| StoreError::step("decode manifest", e.into()))?;
        let mut children = Vec::with_capacity(manifest.layers.len() + 1);
        children.push(manifest.config);
        children.extend(manifest.layers);
        return Ok(children);
    }

    Ok(Vec::new())
}

async fn push(target: &dyn Target, desc: &Descriptor, data: Bytes) -> Result<()> {
    target
        .push(desc, data)
        .await
        .map_err(|e| StoreError::target("push", e).context(format!("push {}", desc.digest)))?;
    debug!(digest = %desc.digest, media_type = %desc.media_type, "pushed blob");
    Ok(())
}
