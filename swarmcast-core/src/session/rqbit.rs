//! librqbit-backed torrent backend.

use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use librqbit::api::TorrentIdOrHash;
use librqbit::{AddTorrent, AddTorrentOptions, ManagedTorrent, Session};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::SessionError;
use super::backend::{NativeSession, SwarmStatus, TorrentBackend, TransferFile, TransferMetadata};

/// Production backend: one shared librqbit session, one managed torrent per attach.
pub struct RqbitBackend {
    session: Arc<Session>,
}

impl RqbitBackend {
    /// Starts the librqbit session rooted at `default_folder`.
    ///
    /// # Errors
    ///
    /// - `SessionError::Backend` - librqbit failed to start (port bind, DHT state, ...)
    pub async fn new(default_folder: &Path) -> Result<Self, SessionError> {
        tokio::fs::create_dir_all(default_folder)
            .await
            .map_err(|e| SessionError::Backend {
                reason: format!("create {}: {e}", default_folder.display()),
            })?;

        let session = Session::new(default_folder.to_path_buf())
            .await
            .map_err(|e| SessionError::Backend {
                reason: format!("start librqbit session: {e:#}"),
            })?;

        info!(root = %default_folder.display(), "librqbit session started");
        Ok(Self { session })
    }
}

#[async_trait]
impl TorrentBackend for RqbitBackend {
    async fn attach(
        &self,
        source: &str,
        save_path: &Path,
    ) -> Result<Arc<dyn NativeSession>, SessionError> {
        tokio::fs::create_dir_all(save_path)
            .await
            .map_err(|e| SessionError::Backend {
                reason: format!("create {}: {e}", save_path.display()),
            })?;

        let transfer = Arc::new(RqbitTransfer {
            session: Arc::clone(&self.session),
            state: Mutex::new(AttachState::Adding),
            cancel: Notify::new(),
        });

        // Adding a magnet blocks until metadata arrives, so it runs detached.
        let options = AddTorrentOptions {
            output_folder: Some(save_path.to_string_lossy().into_owned()),
            overwrite: true,
            ..Default::default()
        };
        let pending = Arc::clone(&transfer);
        let source = source.to_string();
        tokio::spawn(async move {
            let added = tokio::select! {
                added = pending
                    .session
                    .add_torrent(AddTorrent::from_url(source.as_str()), Some(options)) => added,
                () = pending.cancel.notified() => {
                    debug!("Transfer released before librqbit finished adding it");
                    return;
                }
            };
            let outcome = match added.map(|response| response.into_handle()) {
                Ok(Some(handle)) => Ok(handle),
                Ok(None) => Err("listed only, no handle".to_string()),
                Err(e) => {
                    warn!(error = %e, "librqbit failed to add torrent");
                    Err(format!("{e:#}"))
                }
            };
            pending.settle(outcome).await;
        });

        Ok(transfer)
    }
}

/// Lifecycle of one librqbit transfer.
enum AttachState {
    Adding,
    Attached(Arc<ManagedTorrent>),
    Failed(String),
    Released,
}

struct RqbitTransfer {
    session: Arc<Session>,
    state: Mutex<AttachState>,
    /// Wakes the add task when the transfer is released first
    cancel: Notify,
}

impl RqbitTransfer {
    fn torrent(&self) -> Option<Arc<ManagedTorrent>> {
        match &*self.state.lock() {
            AttachState::Attached(torrent) => Some(Arc::clone(torrent)),
            _ => None,
        }
    }

    /// Records the add result. A transfer released in the meantime is deleted
    /// from the librqbit session right away.
    async fn settle(&self, outcome: Result<Arc<ManagedTorrent>, String>) {
        let orphan = {
            let mut state = self.state.lock();
            let released = matches!(*state, AttachState::Released);
            match (released, outcome) {
                (true, Ok(torrent)) => Some(torrent),
                (true, Err(_)) => None,
                (false, Ok(torrent)) => {
                    debug!(id = torrent.id(), "librqbit torrent added");
                    *state = AttachState::Attached(torrent);
                    None
                }
                (false, Err(reason)) => {
                    *state = AttachState::Failed(reason);
                    None
                }
            }
        };

        if let Some(torrent) = orphan {
            info!(id = torrent.id(), "Deleting torrent released while it was being added");
            if let Err(e) = delete_torrent(&self.session, &torrent).await {
                warn!(error = %e, "Could not delete orphaned torrent");
            }
        }
    }
}

async fn delete_torrent(session: &Session, torrent: &ManagedTorrent) -> Result<(), SessionError> {
    session
        .delete(TorrentIdOrHash::Id(torrent.id()), false)
        .await
        .map_err(|e| SessionError::Backend {
            reason: format!("delete torrent {}: {e:#}", torrent.id()),
        })
}

#[async_trait]
impl NativeSession for RqbitTransfer {
    fn metadata(&self) -> Option<TransferMetadata> {
        let torrent = self.torrent()?;
        let name = torrent.name().unwrap_or_default();
        torrent
            .with_metadata(|metadata| TransferMetadata {
                name: name.clone(),
                files: metadata
                    .file_infos
                    .iter()
                    .map(|file| TransferFile {
                        relative_path: file.relative_filename.clone(),
                        length: file.len,
                    })
                    .collect(),
                piece_length: None,
            })
            .ok()
    }

    fn status(&self) -> SwarmStatus {
        let Some(torrent) = self.torrent() else {
            return SwarmStatus::default();
        };

        let stats = torrent.stats();
        let (peers, download_kbps) = stats
            .live
            .as_ref()
            .map(|live| {
                (
                    live.snapshot.peer_stats.live as u32,
                    live.download_speed.mbps * 1024.0,
                )
            })
            .unwrap_or((0, 0.0));

        SwarmStatus {
            has_metadata: true,
            progress_bytes: stats.progress_bytes,
            total_bytes: stats.total_bytes,
            seeding: stats.finished,
            // librqbit does not split live peers into seeds and leechers.
            seeds: 0,
            peers,
            download_kbps,
        }
    }

    fn set_sequential(&self, enabled: bool) {
        // librqbit streams pieces in order on its own.
        debug!(enabled, "Sequential request ignored by librqbit backend");
    }

    fn prioritize_pieces(&self, pieces: Range<u32>) {
        debug!(
            start = pieces.start,
            end = pieces.end,
            "Piece priority request ignored by librqbit backend"
        );
    }

    fn attach_error(&self) -> Option<String> {
        match &*self.state.lock() {
            AttachState::Failed(reason) => Some(reason.clone()),
            _ => None,
        }
    }

    async fn release(&self) -> Result<(), SessionError> {
        let previous = std::mem::replace(&mut *self.state.lock(), AttachState::Released);
        match previous {
            AttachState::Attached(torrent) => delete_torrent(&self.session, &torrent).await,
            AttachState::Adding => {
                // notify_one keeps a permit, so an add task not yet waiting still sees it.
                self.cancel.notify_one();
                Ok(())
            }
            AttachState::Failed(reason) => {
                debug!(reason = %reason, "Releasing transfer that never attached");
                Ok(())
            }
            AttachState::Released => Ok(()),
        }
    }
}
