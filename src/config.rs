//! Agent configuration.
//!
//! Configuration is stored as TOML in `.git/drs/config.toml` of the
//! repository the agent runs in. A missing file means defaults with no
//! remotes, so init fails until one is configured.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::progress::ProgressGate;
use crate::remote::{DrsClient, FsClient, RemoteClient, RemoteResolver};
use crate::{Error, Result};

/// Default location of the config file, relative to the repository root.
pub const DEFAULT_PATH: &str = ".git/drs/config.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Remote used when init names one that is not configured.
    #[serde(default)]
    pub default_remote: Option<String>,

    /// Local LFS object directory downloads are written to.
    #[serde(default = "default_objects_dir")]
    pub lfs_objects_dir: PathBuf,

    #[serde(default)]
    pub remotes: BTreeMap<String, RemoteConfig>,

    #[serde(default)]
    pub transfer: TransferSettings,

    #[serde(default)]
    pub log: LogConfig,
}

/// One configured remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RemoteConfig {
    /// GA4GH DRS server.
    Drs {
        endpoint: String,
        /// `<program>-<project>`.
        project_id: String,
        #[serde(default)]
        organization: Option<String>,
        #[serde(default)]
        token: Option<String>,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
    },
    /// Directory laid out like an LFS object store.
    Fs { root: PathBuf },
}

/// Tunables for the transfer loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    /// Worker count when Git LFS does not send a positive
    /// `concurrenttransfers`.
    pub concurrency: usize,
    /// Upper bound on workers, whatever Git LFS asks for.
    pub max_workers: usize,
    /// Longest protocol line accepted, in bytes.
    pub max_line_bytes: usize,
    pub progress_interval_ms: u64,
    pub progress_min_bytes: u64,
    /// Per-request deadline for remote calls; 0 disables it.
    pub timeout_secs: u64,
}

impl Default for TransferSettings {
    fn default() -> Self {
        let gate = ProgressGate::default();
        Self {
            concurrency: 4,
            max_workers: 64,
            max_line_bytes: crate::codec::DEFAULT_MAX_LINE_BYTES,
            progress_interval_ms: gate.min_interval.as_millis() as u64,
            progress_min_bytes: gate.min_bytes,
            timeout_secs: 0,
        }
    }
}

impl TransferSettings {
    pub fn gate(&self) -> ProgressGate {
        ProgressGate {
            min_interval: Duration::from_millis(self.progress_interval_ms),
            min_bytes: self.progress_min_bytes,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

/// Where and how much to log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `tracing` filter directive, e.g. `info` or `git_drs=debug`.
    pub level: String,
    /// Log file, appended to. `None` disables file logging.
    pub file: Option<PathBuf>,
    /// Also log to stderr.
    pub stderr: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            file: Some(PathBuf::from(".git/drs/git-drs.log")),
            stderr: false,
        }
    }
}

fn default_objects_dir() -> PathBuf {
    PathBuf::from(".git/lfs/objects")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_remote: None,
            lfs_objects_dir: default_objects_dir(),
            remotes: BTreeMap::new(),
            transfer: TransferSettings::default(),
            log: LogConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from `path`, or defaults if it does not exist.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Config::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Pick the configured remote to use for the remote Git LFS named.
    ///
    /// The requested name wins if it is configured, then `default_remote`,
    /// then the only remote if there is exactly one.
    pub fn remote_name<'a>(&'a self, requested: &'a str) -> Result<&'a str> {
        if self.remotes.contains_key(requested) {
            return Ok(requested);
        }
        if let Some(default) = &self.default_remote {
            if self.remotes.contains_key(default) {
                return Ok(default.as_str());
            }
            return Err(Error::Config(format!(
                "default remote '{}' is not configured",
                default
            )));
        }
        let mut names = self.remotes.keys();
        match (names.next(), names.next()) {
            (Some(only), None) => Ok(only.as_str()),
            (None, _) => Err(Error::Config("no remotes configured".into())),
            (Some(_), Some(_)) => Err(Error::Config(format!(
                "remote '{}' is not configured and no default_remote is set",
                requested
            ))),
        }
    }

    /// Build a client for the named remote.
    pub fn client(&self, name: &str) -> Result<Arc<dyn RemoteClient>> {
        let remote = self
            .remotes
            .get(name)
            .ok_or_else(|| Error::Config(format!("remote '{}' is not configured", name)))?;

        match remote {
            RemoteConfig::Drs {
                endpoint,
                project_id,
                organization,
                token,
                username,
                password,
            } => {
                let mut client = DrsClient::new(endpoint, project_id)?;
                if let Some(org) = organization {
                    client = client.with_organization(org);
                }
                if let Some(token) = token {
                    client = client.with_token(token);
                } else if let (Some(user), Some(pass)) = (username, password) {
                    client = client.with_auth(user, pass);
                }
                if let Some(timeout) = self.transfer.timeout() {
                    client = client.with_timeout(timeout);
                }
                Ok(Arc::new(client))
            }
            RemoteConfig::Fs { root } => Ok(Arc::new(FsClient::new(root))),
        }
    }
}

impl RemoteResolver for Config {
    fn resolve(&self, remote: &str) -> Result<Arc<dyn RemoteClient>> {
        let name = self.remote_name(remote)?;
        tracing::debug!(requested = remote, remote = name, "resolved remote");
        self.client(name)
    }
}
