//! Directory-backed remote.
//!
//! Objects are kept in the same content-addressed layout as the local LFS
//! store, which makes a shared or mounted directory usable as a remote.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use url::Url;

use super::{AccessUrl, ObjectDescriptor, ProgressUpload, RemoteClient};
use crate::store::ObjectStore;
use crate::{Error, Oid, Result};

/// Remote that stores objects under a directory.
#[derive(Debug, Clone)]
pub struct FsClient {
    store: ObjectStore,
}

impl FsClient {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        FsClient {
            store: ObjectStore::new(root),
        }
    }

    /// Path an object occupies in this remote.
    pub fn object_path(&self, oid: &Oid) -> PathBuf {
        self.store.object_path(oid)
    }
}

impl RemoteClient for FsClient {
    fn download_url(&self, oid: &str) -> Result<AccessUrl> {
        let oid = Oid::from_hex(oid)?;
        let path = self.store.object_path(&oid);
        if !path.is_file() {
            return Err(Error::NotFound(oid.to_hex()));
        }
        let absolute = fs::canonicalize(&path)?;
        let url = Url::from_file_path(&absolute)
            .map_err(|_| Error::InvalidUrl(format!("cannot express {} as a URL", absolute.display())))?;
        Ok(AccessUrl::new(url))
    }

    fn register_file(&self, oid: &str, path: &Path) -> Result<ObjectDescriptor> {
        self.register_file_with_progress(oid, path, &mut |_| {})
    }

    fn progress_upload(&self) -> Option<&dyn ProgressUpload> {
        Some(self)
    }
}

impl ProgressUpload for FsClient {
    fn register_file_with_progress(
        &self,
        oid: &str,
        path: &Path,
        on_chunk: &mut dyn FnMut(u64),
    ) -> Result<ObjectDescriptor> {
        let parsed = Oid::from_hex(oid)?;
        let size = fs::metadata(path)?.len();

        let stored = if self.store.contains_valid(&parsed, size) {
            tracing::debug!(oid, "object already present in remote store");
            on_chunk(size);
            self.store.object_path(&parsed)
        } else {
            self.store.import(&parsed, File::open(path)?, on_chunk)?
        };

        Ok(ObjectDescriptor {
            id: parsed.to_hex(),
            name: stored.to_string_lossy().into_owned(),
            size,
        })
    }
}
