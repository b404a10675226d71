//! Remote object stores the agent transfers to and from.
//!
//! The transfer workers are written once against [`RemoteClient`]; each
//! backend is a separate implementation:
//!
//! - [`DrsClient`] talks to a GA4GH DRS server over HTTP
//! - [`FsClient`] keeps objects in a local (or mounted) directory

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use crate::Result;

mod drs;
mod fs;

pub use drs::{AccessMethod, Authorizations, Checksum, DrsClient, DrsObject};
pub use fs::FsClient;

/// A URL from which an object's bytes can be fetched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessUrl {
    pub url: String,
    /// Extra request headers, each formatted as `Name: value`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<String>,
}

impl AccessUrl {
    pub fn new(url: impl Into<String>) -> Self {
        AccessUrl {
            url: url.into(),
            headers: Vec::new(),
        }
    }

    /// Header name/value pairs; malformed entries are skipped.
    pub fn header_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers
            .iter()
            .filter_map(|h| h.split_once(':'))
            .map(|(k, v)| (k.trim(), v.trim()))
            .filter(|(k, _)| !k.is_empty())
    }
}

/// What the remote knows about an object after registering it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectDescriptor {
    pub id: String,
    /// Display name reported back to Git LFS.
    pub name: String,
    pub size: u64,
}

/// The operations a transfer needs from a remote store.
///
/// One instance is shared by every worker, so implementations must be safe
/// to call concurrently.
pub trait RemoteClient: Send + Sync {
    /// Resolve a URL the object with this OID can be downloaded from.
    fn download_url(&self, oid: &str) -> Result<AccessUrl>;

    /// Register the local file holding `oid` with the remote, transferring
    /// its bytes if the backend needs to.
    fn register_file(&self, oid: &str, path: &Path) -> Result<ObjectDescriptor>;

    /// Backends that can report upload progress expose it here.
    fn progress_upload(&self) -> Option<&dyn ProgressUpload> {
        None
    }
}

/// Optional capability: registration with per-chunk progress callbacks.
pub trait ProgressUpload {
    fn register_file_with_progress(
        &self,
        oid: &str,
        path: &Path,
        on_chunk: &mut dyn FnMut(u64),
    ) -> Result<ObjectDescriptor>;
}

/// Maps the remote named in the init message to a client.
pub trait RemoteResolver {
    fn resolve(&self, remote: &str) -> Result<Arc<dyn RemoteClient>>;
}

impl<F> RemoteResolver for F
where
    F: Fn(&str) -> Result<Arc<dyn RemoteClient>>,
{
    fn resolve(&self, remote: &str) -> Result<Arc<dyn RemoteClient>> {
        self(remote)
    }
}
