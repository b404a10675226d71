//! # git-drs
//!
//! A Git LFS custom transfer agent that moves objects to and from DRS
//! (GA4GH Data Repository Service) object stores instead of an LFS server.
//!
//! This crate provides:
//! - the custom transfer protocol: NDJSON framing and message types
//! - a protocol state machine feeding a bounded pool of transfer workers
//! - rate-limited progress reporting through a single output writer
//! - remote backends for DRS servers and plain directories
//! - a content-addressed local object store with checksum verification
//!
//! ## Example
//!
//! ```no_run
//! use git_drs::config::Config;
//! use git_drs::{ObjectStore, TransferAgent};
//!
//! let config = Config::load(".git/drs/config.toml").unwrap();
//! let store = ObjectStore::new(&config.lfs_objects_dir);
//! let settings = config.transfer.clone();
//!
//! let agent = TransferAgent::new(config, store, settings);
//! let summary = agent.run(std::io::stdin().lock(), std::io::stdout()).unwrap();
//! println!("{} objects transferred", summary.writer.completed);
//! ```

mod error;
mod oid;
mod store;

pub mod agent;
pub mod codec;
pub mod config;
pub mod fetch;
pub mod logging;
pub mod messages;
pub mod progress;
pub mod remote;
pub mod worker;
pub mod writer;

pub use agent::{RunSummary, State, TransferAgent};
pub use error::{Error, Result};
pub use messages::Operation;
pub use oid::{Oid, OidHasher};
pub use store::{ObjectStore, ObjectWriter};
