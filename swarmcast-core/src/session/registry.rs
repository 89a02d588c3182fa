//! Registry of live download sessions, one per source descriptor.

use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::backend::{NativeSession, SwarmDiagnostics, SwarmStatus, TorrentBackend, TransferMetadata};
use super::{SessionError, SessionKey};
use crate::config::SessionConfig;
use crate::jobs::JobId;

/// One registered transfer.
///
/// Native control calls go through a per-handle lock that is never held
/// across an await point.
pub struct DownloadSessionHandle {
    key: SessionKey,
    native: Arc<dyn NativeSession>,
    save_path: PathBuf,
    control: parking_lot::Mutex<()>,
    /// Jobs currently driving a pipeline on this transfer
    holders: parking_lot::Mutex<HashSet<JobId>>,
    seeding_since: parking_lot::Mutex<Option<Instant>>,
}

impl DownloadSessionHandle {
    fn new(key: SessionKey, native: Arc<dyn NativeSession>, save_path: PathBuf) -> Self {
        Self {
            key,
            native,
            save_path,
            control: parking_lot::Mutex::new(()),
            holders: parking_lot::Mutex::new(HashSet::new()),
            seeding_since: parking_lot::Mutex::new(None),
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn save_path(&self) -> &Path {
        &self.save_path
    }

    /// Registers `job_id` as a user of this transfer.
    pub fn hold(&self, job_id: JobId) {
        self.holders.lock().insert(job_id);
    }

    /// Drops `job_id` as a user without releasing the transfer.
    pub fn unhold(&self, job_id: JobId) {
        self.holders.lock().remove(&job_id);
    }

    pub fn holder_count(&self) -> usize {
        self.holders.lock().len()
    }

    /// Instant the idle sweep first saw this transfer seeding, if it still is.
    pub fn seeding_since(&self) -> Option<Instant> {
        *self.seeding_since.lock()
    }

    pub fn metadata(&self) -> Option<TransferMetadata> {
        self.native.metadata()
    }

    pub fn status(&self) -> SwarmStatus {
        self.native.status()
    }

    pub fn attach_error(&self) -> Option<String> {
        self.native.attach_error()
    }

    pub fn diagnostics(&self) -> SwarmDiagnostics {
        self.native.status().diagnostics()
    }

    pub fn set_sequential(&self, enabled: bool) {
        let _guard = self.control.lock();
        self.native.set_sequential(enabled);
    }

    pub fn prioritize_pieces(&self, pieces: Range<u32>) {
        let _guard = self.control.lock();
        self.native.prioritize_pieces(pieces);
    }

    /// Starts the seeding clock if unset and returns its start.
    fn observe_seeding(&self, now: Instant) -> Instant {
        *self.seeding_since.lock().get_or_insert(now)
    }

    fn clear_seeding(&self) {
        *self.seeding_since.lock() = None;
    }
}

impl std::fmt::Debug for DownloadSessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadSessionHandle")
            .field("key", &self.key)
            .field("save_path", &self.save_path)
            .field("seeding_since", &self.seeding_since())
            .finish()
    }
}

/// Owns every active transfer. Shared as `Arc<SessionRegistry>`.
pub struct SessionRegistry {
    backend: Arc<dyn TorrentBackend>,
    config: SessionConfig,
    sessions: Mutex<HashMap<SessionKey, Arc<DownloadSessionHandle>>>,
}

impl SessionRegistry {
    pub fn new(backend: Arc<dyn TorrentBackend>, config: SessionConfig) -> Self {
        Self {
            backend,
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the handle for `source`, attaching a new transfer on first use.
    ///
    /// The membership lock is held across lookup, attach and insert, so
    /// concurrent opens for one source end up sharing a single transfer.
    ///
    /// # Errors
    ///
    /// - `SessionError::Backend` - Backend failed to attach the transfer
    pub async fn open(
        &self,
        source: &str,
        save_path: &Path,
    ) -> Result<Arc<DownloadSessionHandle>, SessionError> {
        let key = SessionKey::for_source(source);
        let mut sessions = self.sessions.lock().await;

        if let Some(existing) = sessions.get(&key) {
            debug!(key = %key, "Reusing download session");
            return Ok(Arc::clone(existing));
        }

        let native = self.backend.attach(source, save_path).await?;
        let handle = Arc::new(DownloadSessionHandle::new(
            key.clone(),
            native,
            save_path.to_path_buf(),
        ));
        sessions.insert(key.clone(), Arc::clone(&handle));

        info!(key = %key, save_path = %save_path.display(), "Opened download session");
        Ok(handle)
    }

    pub async fn lookup(&self, key: &SessionKey) -> Option<Arc<DownloadSessionHandle>> {
        self.sessions.lock().await.get(key).cloned()
    }

    pub async fn lookup_source(&self, source: &str) -> Option<Arc<DownloadSessionHandle>> {
        self.lookup(&SessionKey::for_source(source)).await
    }

    /// Drops the handle and releases its native transfer.
    ///
    /// Returns `Ok(false)` when nothing was registered under `key`.
    ///
    /// # Errors
    ///
    /// - `SessionError::Backend` - Native release failed; the entry is gone regardless
    pub async fn remove(&self, key: &SessionKey) -> Result<bool, SessionError> {
        let removed = self.sessions.lock().await.remove(key);
        match removed {
            Some(handle) => {
                handle.native.release().await?;
                info!(key = %key, "Released download session");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Drops `job_id` as a holder of `key` and releases the transfer unless
    /// another job still holds it.
    ///
    /// Returns `Ok(true)` when the transfer was released.
    ///
    /// # Errors
    ///
    /// - `SessionError::Backend` - Native release failed; the entry is gone regardless
    pub async fn release_for(&self, key: &SessionKey, job_id: JobId) -> Result<bool, SessionError> {
        let removed = {
            let mut sessions = self.sessions.lock().await;
            let Some(handle) = sessions.get(key) else {
                return Ok(false);
            };
            handle.unhold(job_id);
            let others = handle.holder_count();
            if others > 0 {
                info!(key = %key, job_id = %job_id, others, "Download session kept for other jobs");
                return Ok(false);
            }
            sessions.remove(key)
        };

        match removed {
            Some(handle) => {
                handle.native.release().await?;
                info!(key = %key, job_id = %job_id, "Released download session");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    /// One idle-sweep pass. Returns the number of sessions released.
    ///
    /// A session is released once it has been observed seeding without
    /// interruption for at least the configured threshold. Any non-seeding
    /// observation restarts the clock.
    pub async fn sweep_idle(&self, now: Instant) -> usize {
        let handles: Vec<Arc<DownloadSessionHandle>> =
            self.sessions.lock().await.values().cloned().collect();

        let mut released = 0;
        for handle in handles {
            if !handle.status().seeding {
                handle.clear_seeding();
                continue;
            }

            let since = handle.observe_seeding(now);
            let seeded_for = now.saturating_duration_since(since);
            if seeded_for < self.config.seeding_idle_threshold {
                continue;
            }

            match self.remove(handle.key()).await {
                Ok(true) => {
                    info!(
                        key = %handle.key(),
                        seeded_secs = seeded_for.as_secs(),
                        "Idle sweep released seeding session"
                    );
                    released += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    error!(key = %handle.key(), error = %e, "Idle sweep failed to release session");
                }
            }
        }
        released
    }

    /// Runs `sweep_idle` every `sweep_interval` until the registry is dropped.
    pub fn spawn_idle_sweep(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        let period = self.config.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    warn!("Session registry dropped, stopping idle sweep");
                    break;
                };
                let released = registry.sweep_idle(Instant::now()).await;
                if released > 0 {
                    debug!(released, "Idle sweep pass finished");
                }
            }
        })
    }
}
