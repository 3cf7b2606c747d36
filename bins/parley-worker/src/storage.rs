//! Content-addressed blob store.
//!
//! Every artifact the worker touches (sources, manager binaries, testcase
//! inputs, compiled executables, captured outputs) lives here, keyed by the
//! SHA-256 of its content. Blobs are laid out as `root/ab/cdef...` and are
//! immutable once written.

use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};

use parley_common::error::SystemError;
use parley_common::types::Digest;
use sha2::{Digest as _, Sha256};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, SystemError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(SystemError::Storage)?;
        Ok(Self { root })
    }

    pub fn digest_bytes(bytes: &[u8]) -> Digest {
        let hash = Sha256::digest(bytes);
        let mut hex = String::with_capacity(64);
        for byte in hash {
            let _ = write!(hex, "{byte:02x}");
        }
        Digest(hex)
    }

    fn locate(&self, digest: &Digest) -> Result<PathBuf, SystemError> {
        let hex = digest.as_str();
        if hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(SystemError::MissingBlob(hex.to_string()));
        }
        Ok(self.root.join(&hex[..2]).join(&hex[2..]))
    }

    /// Store bytes under their content address. `description` is a human
    /// label carried in logs only; blob metadata persistence belongs to the
    /// database layer, not here.
    pub async fn put_bytes(&self, bytes: &[u8], description: &str) -> Result<Digest, SystemError> {
        let digest = Self::digest_bytes(bytes);
        let dest = self.locate(&digest)?;
        if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
            debug!(%digest, description, "blob already stored");
            return Ok(digest);
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(SystemError::Storage)?;
        }
        // Write under a unique name and rename, so a concurrent reader never
        // observes a partial blob.
        let tmp = dest.with_file_name(format!(".{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(SystemError::Storage)?;
        tokio::fs::rename(&tmp, &dest)
            .await
            .map_err(SystemError::Storage)?;
        debug!(%digest, description, size = bytes.len(), "stored blob");
        Ok(digest)
    }

    pub async fn put_file(&self, path: &Path, description: &str) -> Result<Digest, SystemError> {
        let bytes = tokio::fs::read(path).await.map_err(SystemError::Storage)?;
        self.put_bytes(&bytes, description).await
    }

    pub async fn read(&self, digest: &Digest) -> Result<Vec<u8>, SystemError> {
        let path = self.locate(digest)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(SystemError::MissingBlob(digest.to_string()))
            }
            Err(err) => Err(SystemError::Storage(err)),
        }
    }

    /// Materialize a blob at `dest`.
    pub async fn fetch_to(&self, digest: &Digest, dest: &Path) -> Result<(), SystemError> {
        let src = self.locate(digest)?;
        match tokio::fs::copy(&src, dest).await {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(SystemError::MissingBlob(digest.to_string()))
            }
            Err(err) => Err(SystemError::Storage(err)),
        }
    }
}
