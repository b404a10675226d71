//! Custom transfer protocol messages.
//!
//! Git LFS talks to a custom transfer agent with one JSON object per line on
//! stdin/stdout. See:
//! https://github.com/git-lfs/git-lfs/blob/main/docs/custom-transfers.md

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::{Error, Result};

/// Direction of a transfer session, fixed by the init message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Push objects to the remote.
    Upload,
    /// Fetch objects from the remote.
    Download,
}

impl FromStr for Operation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "upload" => Ok(Operation::Upload),
            "download" => Ok(Operation::Download),
            other => Err(Error::Protocol(format!(
                "invalid or missing operation in init message: {:?}",
                other
            ))),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Upload => f.write_str("upload"),
            Operation::Download => f.write_str("download"),
        }
    }
}

/// The event names the agent understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Init,
    Upload,
    Download,
    Terminate,
    /// Anything else, including a missing `event` key.
    Other(Option<String>),
}

impl Event {
    fn from_name(name: Option<&str>) -> Self {
        match name {
            Some("init") => Event::Init,
            Some("upload") => Event::Upload,
            Some("download") => Event::Download,
            Some("terminate") => Event::Terminate,
            other => Event::Other(other.map(str::to_string)),
        }
    }
}

/// The generic shape of any inbound line, just enough to classify it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    oid: Option<serde_json::Value>,
}

impl Envelope {
    pub fn event(&self) -> Event {
        Event::from_name(self.event.as_deref())
    }

    /// The object id if the line carried one as a string.
    pub fn oid(&self) -> Option<&str> {
        self.oid.as_ref().and_then(|v| v.as_str())
    }
}

/// The first message of every session.
#[derive(Debug, Clone, Deserialize)]
pub struct InitMessage {
    pub event: String,
    /// Kept as a string so an unknown operation is reported as a protocol
    /// error rather than a JSON error.
    #[serde(default)]
    pub operation: String,
    /// Git remote name or URL.
    #[serde(default)]
    pub remote: String,
    /// Reflects `lfs.customtransfer.<name>.concurrent`.
    #[serde(default)]
    pub concurrent: bool,
    /// Reflects `lfs.concurrenttransfers`.
    #[serde(default, rename = "concurrenttransfers")]
    pub concurrent_transfers: i64,
}

impl InitMessage {
    /// Validated transfer direction.
    pub fn operation(&self) -> Result<Operation> {
        self.operation.parse()
    }

    /// Number of workers to start, within `1..=max`; `fallback` applies
    /// when Git LFS sent no positive value.
    pub fn worker_count(&self, fallback: usize, max: usize) -> usize {
        let requested = if self.concurrent_transfers > 0 {
            usize::try_from(self.concurrent_transfers).unwrap_or(usize::MAX)
        } else {
            fallback
        };
        requested.clamp(1, max.max(1))
    }
}

/// A request to upload one object.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadRequest {
    pub oid: String,
    pub size: u64,
    /// Local file holding the object content.
    pub path: PathBuf,
}

/// A request to download one object.
#[derive(Debug, Clone, Deserialize)]
pub struct DownloadRequest {
    pub oid: String,
    #[serde(default)]
    pub size: u64,
}

/// Empty object acknowledging a successful init.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct InitAck {}

/// Error details carried by error responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectError {
    pub code: u16,
    pub message: String,
}

/// Successful transfer of one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompleteMessage {
    event: &'static str,
    pub oid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl CompleteMessage {
    pub fn new(oid: impl Into<String>, path: impl Into<String>) -> Self {
        CompleteMessage {
            event: "complete",
            oid: oid.into(),
            path: Some(path.into()),
        }
    }
}

/// Failure report.
///
/// Per-object failures use the `complete` event with an `error` member, as
/// Git LFS expects. Failures not tied to an object (a broken init) use a
/// distinct `error` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorMessage {
    event: &'static str,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub oid: String,
    pub error: ObjectError,
}

impl ErrorMessage {
    /// Failure of a single object transfer.
    pub fn object(oid: impl Into<String>, code: u16, message: impl Into<String>) -> Self {
        ErrorMessage {
            event: "complete",
            oid: oid.into(),
            error: ObjectError {
                code,
                message: message.into(),
            },
        }
    }

    /// Failure of the session itself.
    pub fn fatal(code: u16, message: impl Into<String>) -> Self {
        ErrorMessage {
            event: "error",
            oid: String::new(),
            error: ObjectError {
                code,
                message: message.into(),
            },
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.event == "error"
    }
}

/// Progress update for an in-flight object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressMessage {
    event: &'static str,
    pub oid: String,
    pub bytes_so_far: u64,
    pub bytes_since_last: u64,
}

impl ProgressMessage {
    pub fn new(oid: impl Into<String>, bytes_so_far: u64, bytes_since_last: u64) -> Self {
        ProgressMessage {
            event: "progress",
            oid: oid.into(),
            bytes_so_far,
            bytes_since_last,
        }
    }
}
