//! Peer identity: timestamp-derived id plus the address the peer listens on.

use std::fmt;

use chrono::Local;
use serde::{Deserialize, Serialize};

/// Format of generated ids: `yymmdd_HHMMSS` followed by sub-second digits.
pub const ID_FORMAT: &str = "%y%m%d_%H%M%S%f";

/// Largest identity the handshake will accept.
pub const MAX_ID_LEN: usize = 4096;

/// Peer id. Generated once per node from the current time; keys connection maps and log streams.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    /// New id from the local clock.
    pub fn generate() -> Self {
        PeerId(Local::now().format(ID_FORMAT).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse an id received over the handshake.
    pub fn from_wire(bytes: &[u8]) -> Result<Self, IdentityError> {
        if bytes.is_empty() {
            return Err(IdentityError::Empty);
        }
        if bytes.len() > MAX_ID_LEN {
            return Err(IdentityError::TooLong(bytes.len()));
        }
        let s = std::str::from_utf8(bytes).map_err(|_| IdentityError::NotUtf8)?;
        Ok(PeerId(s.to_string()))
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId(s.to_string())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a node: id plus listen address. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub id: PeerId,
    pub host: String,
    pub port: u16,
}

impl PeerIdentity {
    pub fn new(id: PeerId, host: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            host: host.into(),
            port,
        }
    }

    /// `host:port`, used as the prefix of every log line for this node.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("empty peer id")]
    Empty,
    #[error("peer id of {0} bytes is too long")]
    TooLong(usize),
    #[error("peer id is not valid UTF-8")]
    NotUtf8,
}
