//! Artifact storage boundary. The gateway only depends on the trait; remote
//! object stores are external collaborators plugged in at the app root.

use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::FaxError;

pub trait ArtifactStore: Send + Sync {
    /// Stores a local file under `object_name` and returns the storage URI.
    fn put(&self, local_path: &Path, object_name: &str) -> Result<String, FaxError>;
    fn get(&self, uri: &str) -> Result<Vec<u8>, FaxError>;
    fn delete(&self, uri: &str) -> Result<(), FaxError>;
}

/// Filesystem-backed store used by the self-hosted deployment and tests.
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, FaxError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }
}

impl ArtifactStore for LocalArtifactStore {
    fn put(&self, local_path: &Path, object_name: &str) -> Result<String, FaxError> {
        let target = self.root.join(object_name);
        if local_path != target {
            fs::copy(local_path, &target)?;
        }
        Ok(target.to_string_lossy().into_owned())
    }

    fn get(&self, uri: &str) -> Result<Vec<u8>, FaxError> {
        fs::read(uri).map_err(|_| FaxError::NotFound(format!("artifact {uri}")))
    }

    fn delete(&self, uri: &str) -> Result<(), FaxError> {
        fs::remove_file(uri)?;
        Ok(())
    }
}

/// SHA-256 of a byte buffer, hex encoded. Used for inbound artifact checksums.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
