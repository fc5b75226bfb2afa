//! Content-addressed artifact storage in the OCI image-layout format.
//!
//! A [`LayoutStore`] persists packaged artifacts (a manifest, a config and
//! a set of layers) as digest-named blobs under a single root directory,
//! records each artifact under a human-readable reference in `index.json`,
//! and can copy any reference, or all of them, to a remote [`Target`].
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ocistore::{LayoutStore, MemoryTarget, StaticArtifact, StaticLayer};
//! use ocistore::descriptor::MEDIA_TYPE_OCI_LAYER;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> ocistore::Result<()> {
//! let cancel = CancellationToken::new();
//! let store = LayoutStore::at_path("/var/lib/ocistore").await?;
//!
//! // Persist an artifact under a reference
//! let artifact = StaticArtifact::new("application/vnd.example.config.v1+json", "{}")
//!     .with_layer(StaticLayer::new("hello", MEDIA_TYPE_OCI_LAYER));
//! let desc = store.add_oci(Arc::new(artifact), "example:v1", &cancel).await?;
//! println!("Stored manifest {}", desc.digest);
//!
//! // Ship it somewhere else
//! let target = MemoryTarget::new();
//! store.copy("example:v1", &target, "mirror/example:v1", &cancel).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! Environment variables (see [`LayoutConfig::from_env`]):
//! - `OCISTORE_ROOT`: Root directory of the layout (default: `~/.ocistore/layout`)
//! - `OCISTORE_DIGEST_ALGORITHM`: `sha256`, `sha512` or `blake3`
//! - `OCISTORE_LAYER_CONCURRENCY`: Cap on parallel layer writes
//!
//! # Concurrency
//!
//! - Blobs are write-once; concurrent writers of the same digest are harmless
//! - Layers of one artifact are written in parallel
//! - Index appends are serialized by the store; the index is rewritten on
//!   every append

pub mod artifact;
pub mod blob;
pub mod cache;
pub mod config;
pub mod descriptor;
pub mod digest;
pub mod error;
pub mod getter;
pub mod index;
pub mod store;
pub mod target;
mod transfer;

pub use artifact::{Artifact, BoxReader, Collection, Layer, StaticArtifact, StaticCollection, StaticLayer};
pub use cache::{CachedArtifact, DirCache, LayerCache, MemoryCache};
pub use config::LayoutConfig;
pub use descriptor::{Descriptor, Manifest};
pub use digest::{Algorithm, Digest, DigestError};
pub use error::{Result, StoreError};
pub use getter::{FileConfig, FileGetter, Getter};
pub use index::IndexEntry;
pub use store::{LayoutStore, ReferenceMapper};
pub use target::{MemoryTarget, Target};
