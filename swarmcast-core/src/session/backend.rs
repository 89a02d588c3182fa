//! Native transfer abstraction.
//!
//! `TorrentBackend` attaches transfers; `NativeSession` is the handle the rest
//! of the pipeline polls. Production uses librqbit, tests and dev mode use the
//! simulated backend.

use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::SessionError;

/// One file inside a transfer, relative to the save path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferFile {
    pub relative_path: PathBuf,
    pub length: u64,
}

/// Metadata of a transfer once the swarm delivered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferMetadata {
    pub name: String,
    pub files: Vec<TransferFile>,
    /// Piece length when the backend exposes it
    pub piece_length: Option<u64>,
}

impl TransferMetadata {
    /// The single largest file, taken as the media source.
    pub fn largest_file(&self) -> Option<&TransferFile> {
        self.files.iter().max_by_key(|file| file.length)
    }

    pub fn total_length(&self) -> u64 {
        self.files.iter().map(|file| file.length).sum()
    }
}

/// Point-in-time transfer progress and swarm health.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SwarmStatus {
    pub has_metadata: bool,
    pub progress_bytes: u64,
    pub total_bytes: u64,
    /// Transfer is complete and only uploading
    pub seeding: bool,
    pub seeds: u32,
    pub peers: u32,
    pub download_kbps: f64,
}

impl SwarmStatus {
    /// Completion in percent, `0.0` until the total size is known.
    pub fn progress_percent(&self) -> f64 {
        if self.seeding {
            return 100.0;
        }
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.progress_bytes as f64 / self.total_bytes as f64 * 100.0).clamp(0.0, 100.0)
    }

    pub fn is_complete(&self) -> bool {
        self.seeding || (self.total_bytes > 0 && self.progress_bytes >= self.total_bytes)
    }

    pub fn diagnostics(&self) -> SwarmDiagnostics {
        SwarmDiagnostics {
            has_metadata: self.has_metadata,
            seeds: self.seeds,
            peers: self.peers,
            down_kbps: self.download_kbps,
            progress: self.progress_percent(),
            seeding: self.seeding,
        }
    }
}

/// Serializable swarm snapshot attached to logs and failure records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SwarmDiagnostics {
    pub has_metadata: bool,
    pub seeds: u32,
    pub peers: u32,
    pub down_kbps: f64,
    pub progress: f64,
    pub seeding: bool,
}

/// Live handle to one native transfer.
///
/// Control calls are synchronous and cheap; callers serialize them through
/// the owning registry handle.
#[async_trait]
pub trait NativeSession: Send + Sync {
    /// Transfer metadata, `None` until the swarm delivered it.
    fn metadata(&self) -> Option<TransferMetadata>;

    fn status(&self) -> SwarmStatus;

    /// Reason the backend gave up attaching the transfer, if it did.
    fn attach_error(&self) -> Option<String>;

    /// Requests in-order piece acquisition.
    fn set_sequential(&self, enabled: bool);

    /// Raises the given piece range to the highest priority.
    fn prioritize_pieces(&self, pieces: Range<u32>);

    /// Stops the transfer and frees native resources. Files stay on disk.
    ///
    /// # Errors
    ///
    /// - `SessionError::Backend` - Native session refused to stop
    async fn release(&self) -> Result<(), SessionError>;
}

/// Factory of native transfers.
#[async_trait]
pub trait TorrentBackend: Send + Sync {
    /// Starts a transfer for `source` saving into `save_path`.
    ///
    /// Returns as soon as the transfer is registered; metadata resolution
    /// continues in the background.
    ///
    /// # Errors
    ///
    /// - `SessionError::Backend` - Source rejected or backend unavailable
    async fn attach(
        &self,
        source: &str,
        save_path: &Path,
    ) -> Result<Arc<dyn NativeSession>, SessionError>;
}
