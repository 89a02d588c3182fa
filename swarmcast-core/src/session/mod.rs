//! Peer-to-peer download sessions: the native backend seam and the registry
//! that keeps exactly one transfer per source descriptor.

pub mod backend;
pub mod registry;
pub mod rqbit;

use std::fmt;

use sha1::{Digest, Sha1};

pub use backend::{
    NativeSession, SwarmDiagnostics, SwarmStatus, TorrentBackend, TransferFile, TransferMetadata,
};
pub use registry::{DownloadSessionHandle, SessionRegistry};
pub use rqbit::RqbitBackend;

/// Stable registry key of a source descriptor: hex SHA-1 of its bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey(String);

impl SessionKey {
    /// Derives the key for a source descriptor.
    pub fn for_source(source: &str) -> Self {
        let digest = Sha1::digest(source.as_bytes());
        Self(hex::encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors from session management and native backends.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Torrent backend error: {reason}")]
    Backend { reason: String },

    #[error("No session registered for key {key}")]
    NotFound { key: SessionKey },
}
