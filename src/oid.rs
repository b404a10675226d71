//! LFS Object ID (OID) - SHA256 content hash.

use sha2::{Digest, Sha256};
use std::fmt;

use crate::{Error, Result};

/// LFS Object ID - a SHA256 hash of the file content.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Oid {
    bytes: [u8; 32],
}

impl Oid {
    /// Parse an OID from a hex string.
    pub fn from_hex(hex: &str) -> Result<Self> {
        let hex = hex.trim();
        if hex.len() != 64 {
            return Err(Error::InvalidOid(format!(
                "expected 64 hex chars, got {}",
                hex.len()
            )));
        }

        let bytes = hex::decode(hex).map_err(|e| Error::InvalidOid(e.to_string()))?;

        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Oid { bytes: arr })
    }

    /// Compute the OID (SHA256 hash) of content.
    pub fn from_content(content: &[u8]) -> Self {
        let mut hasher = OidHasher::new();
        hasher.update(content);
        hasher.finish()
    }

    /// Get the OID as a lowercase hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Oid({})", self.to_hex())
    }
}

/// Incremental SHA256 over streamed content.
#[derive(Default)]
pub struct OidHasher {
    hasher: Sha256,
}

impl OidHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
    }

    pub fn finish(self) -> Oid {
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&self.hasher.finalize());
        Oid { bytes }
    }
}
