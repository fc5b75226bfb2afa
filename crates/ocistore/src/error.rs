//! Store error type.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::descriptor::Descriptor;
use crate::digest::{Digest, DigestError};

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// Errors surfaced by [`LayoutStore`](crate::LayoutStore) operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Malformed caller input: a bad reference, a bad digest string.
    #[error("invalid input: {0}")]
    Input(String),

    #[error(transparent)]
    Digest(#[from] DigestError),

    #[error("{op} {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A collaborator failed during a named step (e.g. `manifest`, `raw config`).
    #[error("{step}: {source:#}")]
    Step {
        step: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("write layer {digest}: {source}")]
    Layer {
        digest: String,
        #[source]
        source: Box<StoreError>,
    },

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: Digest, actual: Digest },

    /// The on-disk index could not be read or parsed.
    #[error("corrupt index {}: {source}", path.display())]
    Consistency {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("reference not found: {0}")]
    NotFound(String),

    #[error("blob not found: {0}")]
    BlobMissing(Digest),

    #[error("target {op}: {source:#}")]
    Target {
        op: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("mapper failed for {reference}: {source:#}")]
    Mapper {
        reference: String,
        #[source]
        source: anyhow::Error,
    },

    /// A collection add stopped part way; `completed` holds what was indexed.
    #[error("add collection stopped after {} artifacts: {source}", completed.len())]
    Collection {
        completed: Vec<Descriptor>,
        #[source]
        source: Box<StoreError>,
    },

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<StoreError>,
    },

    #[error("operation cancelled")]
    Cancelled,
}

impl StoreError {
    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        StoreError::Io {
            op,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn step(step: &'static str, source: anyhow::Error) -> Self {
        StoreError::Step { step, source }
    }

    pub(crate) fn target(op: &'static str, source: anyhow::Error) -> Self {
        StoreError::Target { op, source }
    }

    /// Wrap with a message naming the operation and reference involved.
    pub(crate) fn context(self, context: impl Into<String>) -> Self {
        StoreError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, looking through context and layer wrappers.
    pub fn root(&self) -> &StoreError {
        match self {
            StoreError::Context { source, .. }
            | StoreError::Layer { source, .. }
            | StoreError::Collection { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), StoreError::Cancelled)
    }
}
