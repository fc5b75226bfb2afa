//! BlobStore: the write-once blob tree of an image layout.
//!
//! Layout:
//! ```text
//! {root}/blobs/
//! ├── sha256/
//! │   ├── 2c26b46b68ff...   # one file per unique blob, named by hex digest
//! │   └── .partial-9f1c...  # in-flight write, renamed into place when sealed
//! └── blake3/
//!     └── ...
//! ```
//!
//! Writes stage into a `.partial-<uuid>` file next to the destination and
//! are renamed into place once the digest is known. If the destination
//! already exists the blob is assumed present and is neither rewritten nor
//! re-verified. That skips a large amount of redundant I/O at the cost of
//! never noticing a blob that was corrupted after it was sealed.
//!
//! There is no locking. Two writers of the same digest produce identical
//! files and the later rename simply replaces identical bytes; writers of
//! different digests never touch the same path.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::digest::{Algorithm, Digest};
use crate::error::{Result, StoreError};

const PARTIAL_PREFIX: &str = ".partial-";
const COPY_BUF_SIZE: usize = 64 * 1024;

/// Result of writing a blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenBlob {
    pub digest: Digest,
    pub size: u64,
    /// True when the blob was already present and nothing was written.
    pub existed: bool,
}

/// Content-addressed blob tree rooted at `{root}/blobs`.
#[derive(Debug, Clone)]
pub struct BlobStore {
    dir: PathBuf,
    algorithm: Algorithm,
}

impl BlobStore {
    pub fn new(dir: impl Into<PathBuf>, algorithm: Algorithm) -> Self {
        Self {
            dir: dir.into(),
            algorithm,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Path a blob with this digest lives at.
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.dir.join(digest.algorithm().as_str()).join(digest.hex())
    }

    pub async fn exists(&self, digest: &Digest) -> Result<bool> {
        Ok(self.size_of(digest).await?.is_some())
    }

    /// Size of a stored blob, or `None` if it is not present.
    pub async fn size_of(&self, digest: &Digest) -> Result<Option<u64>> {
        let path = self.blob_path(digest);
        match fs::metadata(&path).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io("stat blob", path, e)),
        }
    }

    /// Write an in-memory payload, hashing it with the store's algorithm.
    pub async fn write(&self, data: &[u8]) -> Result<WrittenBlob> {
        self.write_with(data, self.algorithm).await
    }

    /// Write an in-memory payload, hashing it with `algorithm`.
    pub async fn write_with(&self, data: &[u8], algorithm: Algorithm) -> Result<WrittenBlob> {
        let digest = algorithm.digest(data);
        let size = data.len() as u64;

        if self.exists(&digest).await? {
            debug!(%digest, "blob already present");
            return Ok(WrittenBlob {
                digest,
                size,
                existed: true,
            });
        }

        let dir = self.ensure_algorithm_dir(algorithm).await?;
        let staging = staging_path(&dir);
        let mut file = fs::File::create(&staging)
            .await
            .map_err(|e| StoreError::io("create staging file", &staging, e))?;
        file.write_all(data)
            .await
            .map_err(|e| StoreError::io("write staging file", &staging, e))?;
        file.flush()
            .await
            .map_err(|e| StoreError::io("flush staging file", &staging, e))?;
        drop(file);

        let existed = self.seal(&staging, &digest).await?;
        debug!(%digest, size, "blob written");
        Ok(WrittenBlob {
            digest,
            size,
            existed,
        })
    }

    /// Stream a payload to disk while hashing it.
    ///
    /// `declared` is the digest the producer claims. It is only used to skip
    /// the write when that blob already exists and to check the bytes once
    /// they have been hashed; the stored digest is always the computed one.
    pub async fn write_stream<R>(&self, mut reader: R, declared: Option<&Digest>) -> Result<WrittenBlob>
    where
        R: AsyncRead + Unpin,
    {
        if let Some(declared) = declared {
            if let Some(size) = self.size_of(declared).await? {
                debug!(digest = %declared, "blob already present");
                return Ok(WrittenBlob {
                    digest: declared.clone(),
                    size,
                    existed: true,
                });
            }
        }

        let algorithm = declared.map(Digest::algorithm).unwrap_or(self.algorithm);
        let dir = self.ensure_algorithm_dir(algorithm).await?;
        let staging = staging_path(&dir);
        let mut file = fs::File::create(&staging)
            .await
            .map_err(|e| StoreError::io("create staging file", &staging, e))?;

        let mut digester = algorithm.digester();
        let mut buf = vec![0u8; COPY_BUF_SIZE];
        loop {
            let n = reader
                .read(&mut buf)
                .await
                .map_err(|e| StoreError::io("read blob stream", &staging, e))?;
            if n == 0 {
                break;
            }
            digester.update(&buf[..n]);
            file.write_all(&buf[..n])
                .await
                .map_err(|e| StoreError::io("write staging file", &staging, e))?;
        }
        file.flush()
            .await
            .map_err(|e| StoreError::io("flush staging file", &staging, e))?;
        drop(file);

        let size = digester.bytes();
        let digest = digester.finish();

        if let Some(declared) = declared {
            if declared != &digest {
                discard(&staging).await;
                return Err(StoreError::DigestMismatch {
                    expected: declared.clone(),
                    actual: digest,
                });
            }
        }

        let existed = self.seal(&staging, &digest).await?;
        debug!(%digest, size, "blob streamed");
        Ok(WrittenBlob {
            digest,
            size,
            existed,
        })
    }

    /// Read a whole blob.
    pub async fn read(&self, digest: &Digest) -> Result<Bytes> {
        let path = self.blob_path(digest);
        match fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::BlobMissing(digest.clone())),
            Err(e) => Err(StoreError::io("read blob", path, e)),
        }
    }

    /// Open a blob for streaming reads.
    pub async fn open(&self, digest: &Digest) -> Result<fs::File> {
        let path = self.blob_path(digest);
        match fs::File::open(&path).await {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::BlobMissing(digest.clone())),
            Err(e) => Err(StoreError::io("open blob", path, e)),
        }
    }

    /// Remove staging files left behind by interrupted writes.
    ///
    /// Returns the number of files removed.
    pub async fn sweep_partials(&self) -> Result<usize> {
        let mut algorithms = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(StoreError::io("list blobs", &self.dir, e)),
        };

        let mut removed = 0;
        while let Some(alg_entry) = algorithms
            .next_entry()
            .await
            .map_err(|e| StoreError::io("list blobs", &self.dir, e))?
        {
            let alg_dir = alg_entry.path();
            match alg_entry.file_type().await {
                Ok(ft) if ft.is_dir() => {}
                _ => continue,
            }
            let mut entries = fs::read_dir(&alg_dir)
                .await
                .map_err(|e| StoreError::io("list blobs", &alg_dir, e))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| StoreError::io("list blobs", &alg_dir, e))?
            {
                if entry.file_name().to_string_lossy().starts_with(PARTIAL_PREFIX) {
                    let path = entry.path();
                    fs::remove_file(&path)
                        .await
                        .map_err(|e| StoreError::io("remove partial blob", &path, e))?;
                    warn!(path = %path.display(), "removed partial blob from interrupted write");
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// Delete the entire blob tree. Missing trees are fine.
    pub async fn remove_all(&self) -> Result<()> {
        match fs::remove_dir_all(&self.dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io("remove blobs", &self.dir, e)),
        }
    }

    async fn ensure_algorithm_dir(&self, algorithm: Algorithm) -> Result<PathBuf> {
        let dir = self.dir.join(algorithm.as_str());
        match fs::create_dir_all(&dir).await {
            Ok(()) => Ok(dir),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(dir),
            Err(e) => Err(StoreError::io("create blob directory", dir, e)),
        }
    }

    /// Move a staging file into place. Returns true if the blob beat us there.
    async fn seal(&self, staging: &Path, digest: &Digest) -> Result<bool> {
        let dest = self.blob_path(digest);
        if fs::metadata(&dest).await.is_ok() {
            discard(staging).await;
            return Ok(true);
        }
        if let Err(e) = fs::rename(staging, &dest).await {
            discard(staging).await;
            return Err(StoreError::io("seal blob", dest, e));
        }
        Ok(false)
    }
}

fn staging_path(dir: &Path) -> PathBuf {
    dir.join(format!("{}{}", PARTIAL_PREFIX, Uuid::new_v4().simple()))
}

async fn discard(staging: &Path) {
    if let Err(e) = fs::remove_file(staging).await {
        warn!(path = %staging.display(), error = %e, "failed to remove staging file");
    }
}
