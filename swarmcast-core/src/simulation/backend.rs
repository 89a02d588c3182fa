//! Simulated torrent backend.

use std::collections::HashMap;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::session::{
    NativeSession, SessionError, SwarmStatus, TorrentBackend, TransferFile, TransferMetadata,
};

/// Streams a local file into the save path as if it arrived from peers.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub source: PathBuf,
    pub bytes_per_tick: u64,
    pub tick: Duration,
    /// Delay before metadata "arrives"
    pub metadata_delay: Duration,
    pub seeds: u32,
    pub peers: u32,
}

impl FeedConfig {
    /// Feed `source` at roughly `bytes_per_second`, in 100 ms ticks.
    pub fn at_rate(source: impl Into<PathBuf>, bytes_per_second: u64) -> Self {
        Self {
            source: source.into(),
            bytes_per_tick: (bytes_per_second / 10).max(1),
            tick: Duration::from_millis(100),
            metadata_delay: Duration::from_millis(200),
            seeds: 4,
            peers: 12,
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    metadata: Option<TransferMetadata>,
    progress_bytes: u64,
    total_bytes: u64,
    seeding: bool,
    seeds: u32,
    peers: u32,
    download_kbps: f64,
    sequential: bool,
    prioritized: Vec<Range<u32>>,
    released: bool,
    fail_release: bool,
    attach_error: Option<String>,
}

/// Manually or feed-driven transfer.
#[derive(Debug)]
pub struct SimulatedSession {
    save_path: PathBuf,
    state: Mutex<SimState>,
}

impl SimulatedSession {
    pub fn new(save_path: impl Into<PathBuf>) -> Self {
        Self {
            save_path: save_path.into(),
            state: Mutex::new(SimState::default()),
        }
    }

    pub fn save_path(&self) -> &Path {
        &self.save_path
    }

    /// Delivers metadata; the total size becomes the sum of all files.
    pub fn resolve_metadata(&self, metadata: TransferMetadata) {
        let mut state = self.state.lock();
        state.total_bytes = metadata.total_length();
        state.metadata = Some(metadata);
    }

    pub fn set_progress(&self, bytes: u64) {
        let mut state = self.state.lock();
        state.progress_bytes = bytes.min(state.total_bytes);
    }

    /// Seeding implies the whole transfer is on disk.
    pub fn set_seeding(&self, seeding: bool) {
        let mut state = self.state.lock();
        state.seeding = seeding;
        if seeding {
            state.progress_bytes = state.total_bytes;
        }
    }

    pub fn set_swarm(&self, seeds: u32, peers: u32, download_kbps: f64) {
        let mut state = self.state.lock();
        state.seeds = seeds;
        state.peers = peers;
        state.download_kbps = download_kbps;
    }

    /// Makes the transfer report that it could not be attached.
    pub fn fail_attach(&self, reason: impl Into<String>) {
        self.state.lock().attach_error = Some(reason.into());
    }

    /// Makes the next `release` calls fail.
    pub fn fail_release(&self, fail: bool) {
        self.state.lock().fail_release = fail;
    }

    pub fn is_released(&self) -> bool {
        self.state.lock().released
    }

    pub fn sequential_enabled(&self) -> bool {
        self.state.lock().sequential
    }

    pub fn prioritized_ranges(&self) -> Vec<Range<u32>> {
        self.state.lock().prioritized.clone()
    }

    /// Spawns the feed task copying `config.source` into the save path.
    pub fn start_feed(self: &Arc<Self>, config: FeedConfig) -> tokio::task::JoinHandle<()> {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = session.run_feed(&config).await {
                warn!(source = %config.source.display(), error = %e, "Simulated feed stopped");
            }
        })
    }

    async fn run_feed(&self, config: &FeedConfig) -> std::io::Result<()> {
        let length = tokio::fs::metadata(&config.source).await?.len();
        let file_name = config
            .source
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("source.bin"));

        tokio::time::sleep(config.metadata_delay).await;
        self.resolve_metadata(TransferMetadata {
            name: file_name.to_string_lossy().into_owned(),
            files: vec![TransferFile {
                relative_path: file_name.clone(),
                length,
            }],
            piece_length: Some(config.bytes_per_tick),
        });
        let kbps = config.bytes_per_tick as f64 / config.tick.as_secs_f64().max(0.001) / 1024.0;
        self.set_swarm(config.seeds, config.peers, kbps);
        debug!(length, "Simulated metadata resolved");

        tokio::fs::create_dir_all(&self.save_path).await?;
        let mut reader = tokio::fs::File::open(&config.source).await?;
        let mut writer = tokio::fs::File::create(self.save_path.join(&file_name)).await?;
        let mut buffer = vec![0u8; config.bytes_per_tick as usize];
        let mut written = 0u64;

        loop {
            if self.is_released() {
                return Ok(());
            }
            let read = reader.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            writer.write_all(&buffer[..read]).await?;
            writer.flush().await?;
            written += read as u64;
            self.set_progress(written);
            tokio::time::sleep(config.tick).await;
        }

        writer.sync_all().await?;
        self.set_seeding(true);
        info!(bytes = written, "Simulated transfer complete, seeding");
        Ok(())
    }
}

#[async_trait]
impl NativeSession for SimulatedSession {
    fn metadata(&self) -> Option<TransferMetadata> {
        self.state.lock().metadata.clone()
    }

    fn status(&self) -> SwarmStatus {
        let state = self.state.lock();
        SwarmStatus {
            has_metadata: state.metadata.is_some(),
            progress_bytes: state.progress_bytes,
            total_bytes: state.total_bytes,
            seeding: state.seeding,
            seeds: state.seeds,
            peers: state.peers,
            download_kbps: if state.seeding { 0.0 } else { state.download_kbps },
        }
    }

    fn attach_error(&self) -> Option<String> {
        self.state.lock().attach_error.clone()
    }

    fn set_sequential(&self, enabled: bool) {
        self.state.lock().sequential = enabled;
    }

    fn prioritize_pieces(&self, pieces: Range<u32>) {
        self.state.lock().prioritized.push(pieces);
    }

    async fn release(&self) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        if state.fail_release {
            return Err(SessionError::Backend {
                reason: "simulated release failure".to_string(),
            });
        }
        state.released = true;
        Ok(())
    }
}

/// Backend handing out [`SimulatedSession`]s, optionally feed-driven.
#[derive(Debug, Default)]
pub struct SimulatedBackend {
    sessions: Mutex<HashMap<String, Arc<SimulatedSession>>>,
    attach_count: AtomicUsize,
    feed: Option<FeedConfig>,
}

impl SimulatedBackend {
    /// Manually driven sessions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every attached session is fed from the same local file.
    pub fn with_feed(feed: FeedConfig) -> Self {
        Self {
            feed: Some(feed),
            ..Self::default()
        }
    }

    /// Number of native transfers attached so far.
    pub fn attach_count(&self) -> usize {
        self.attach_count.load(Ordering::SeqCst)
    }

    /// Most recent session attached for `source`.
    pub fn session(&self, source: &str) -> Option<Arc<SimulatedSession>> {
        self.sessions.lock().get(source).cloned()
    }

    /// Waits until `source` has been attached, polling every few milliseconds.
    pub async fn wait_for_session(
        &self,
        source: &str,
        timeout: Duration,
    ) -> Option<Arc<SimulatedSession>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(session) = self.session(source) {
                return Some(session);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }
}

#[async_trait]
impl TorrentBackend for SimulatedBackend {
    async fn attach(
        &self,
        source: &str,
        save_path: &Path,
    ) -> Result<Arc<dyn NativeSession>, SessionError> {
        let session = Arc::new(SimulatedSession::new(save_path));
        if let Some(feed) = &self.feed {
            session.start_feed(feed.clone());
        }

        self.attach_count.fetch_add(1, Ordering::SeqCst);
        self.sessions
            .lock()
            .insert(source.to_string(), Arc::clone(&session));
        debug!(source, save_path = %save_path.display(), "Simulated session attached");
        Ok(session)
    }
}
