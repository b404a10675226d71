//! Error types for git-drs operations.

use thiserror::Error;

/// Result type for git-drs operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running the transfer agent.
#[derive(Error, Debug)]
pub enum Error {
    /// OID parsing error
    #[error("invalid OID: {0}")]
    InvalidOid(String),

    /// The peer broke the custom transfer protocol (e.g. no init message)
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A protocol line could not be decoded into the expected message
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(String),

    /// Server returned an error
    #[error("remote server error: {message} (code: {code})")]
    ServerError { code: u16, message: String },

    /// Object not found on the remote
    #[error("object not found: {0}")]
    NotFound(String),

    /// Authentication required
    #[error("authentication required")]
    AuthRequired,

    /// The remote resolved an object but handed back no usable access URL
    #[error("no access URL for object {0}")]
    EmptyAccessUrl(String),

    /// Invalid URL
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// Downloaded content does not hash to the requested OID
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Configuration could not be loaded or does not name a usable remote
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML configuration parse error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// URL parsing error
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),
}

impl Error {
    /// Error code reported to Git LFS for this failure.
    ///
    /// Local and validation failures are 400, a missing object is 404, and
    /// anything that went wrong talking to (or trusting) the remote is 502.
    pub fn protocol_code(&self) -> u16 {
        match self {
            Error::InvalidOid(_)
            | Error::Protocol(_)
            | Error::MalformedMessage(_)
            | Error::Config(_)
            | Error::Io(_)
            | Error::Json(_)
            | Error::Toml(_) => 400,
            Error::NotFound(_) => 404,
            Error::Http(_)
            | Error::ServerError { .. }
            | Error::AuthRequired
            | Error::EmptyAccessUrl(_)
            | Error::InvalidUrl(_)
            | Error::UrlParse(_)
            | Error::ChecksumMismatch { .. } => 502,
        }
    }
}

impl From<ureq::Error> for Error {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::Status(401, _) | ureq::Error::Status(403, _) => Error::AuthRequired,
            ureq::Error::Status(404, _) => Error::NotFound("object not found".into()),
            ureq::Error::Status(code, response) => {
                let message = response
                    .into_string()
                    .unwrap_or_else(|_| "unknown error".into());
                Error::ServerError { code, message }
            }
            other => Error::Http(other.to_string()),
        }
    }
}
