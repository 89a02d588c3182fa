//! Finalization pass: canonical VOD package per rendition.
//!
//! Each rendition is encoded into `{rendition}/.package`, the `vod_NNN.ts`
//! files are moved next to the progressive segments without replacing any of
//! them, and `index.m3u8` is moved last, so its presence means the package is
//! complete.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::encoder::Encoder;
use super::segment_state::{CANONICAL_PLAYLIST, FsSegmentStore, SegmentStore};
use super::{Rendition, TranscodeError};

const STAGING_DIR: &str = ".package";

/// What the finalization pass did per rendition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PackageReport {
    pub packaged: Vec<String>,
    /// Renditions that already had a canonical package
    pub skipped: Vec<String>,
    /// Rendition name and failure reason
    pub failed: Vec<(String, String)>,
}

impl PackageReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Runs the finalization pass for one job directory.
pub struct Packager {
    encoder: Arc<dyn Encoder>,
    store: FsSegmentStore,
    segment_duration: Duration,
}

impl Packager {
    pub fn new(
        encoder: Arc<dyn Encoder>,
        output_root: impl Into<PathBuf>,
        segment_duration: Duration,
    ) -> Self {
        Self {
            encoder,
            store: FsSegmentStore::new(output_root),
            segment_duration,
        }
    }

    /// Packages every rendition; a failing rendition does not stop the others.
    pub async fn package_all(&self, source: &Path, ladder: &[Rendition]) -> PackageReport {
        let mut report = PackageReport::default();

        for rendition in ladder {
            if self.store.has_canonical(&rendition.name) {
                report.skipped.push(rendition.name.clone());
                continue;
            }

            match self.package(source, rendition).await {
                Ok(()) => report.packaged.push(rendition.name.clone()),
                Err(e) => {
                    warn!(rendition = %rendition.name, error = %e, "Finalization failed for rendition");
                    report.failed.push((rendition.name.clone(), e.to_string()));
                }
            }
        }

        info!(
            packaged = report.packaged.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "Finalization pass finished"
        );
        report
    }

    /// Packages a single rendition.
    ///
    /// # Errors
    /// - `TranscodeError::Packaging` - Encoder failed or produced no manifest
    /// - `TranscodeError::Io` - Staging directory could not be prepared or moved
    pub async fn package(&self, source: &Path, rendition: &Rendition) -> Result<(), TranscodeError> {
        let rendition_dir = self.store.rendition_dir(&rendition.name);
        let staging = rendition_dir.join(STAGING_DIR);

        match tokio::fs::remove_dir_all(&staging).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(io_error(&staging, source)),
        }
        tokio::fs::create_dir_all(&staging)
            .await
            .map_err(|e| io_error(&staging, e))?;

        let encoded = self
            .encoder
            .package_rendition(source, rendition, &staging, self.segment_duration)
            .await;
        if let Err(e) = encoded {
            let _ = tokio::fs::remove_dir_all(&staging).await;
            return Err(TranscodeError::Packaging {
                rendition: rendition.name.clone(),
                reason: e.to_string(),
            });
        }

        let playlist = staging.join(CANONICAL_PLAYLIST);
        if tokio::fs::metadata(&playlist).await.is_err() {
            let _ = tokio::fs::remove_dir_all(&staging).await;
            return Err(TranscodeError::Packaging {
                rendition: rendition.name.clone(),
                reason: format!("encoder produced no {CANONICAL_PLAYLIST}"),
            });
        }

        let mut entries = tokio::fs::read_dir(&staging)
            .await
            .map_err(|e| io_error(&staging, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error(&staging, e))?
        {
            if entry.file_name() == CANONICAL_PLAYLIST {
                continue;
            }
            let target = rendition_dir.join(entry.file_name());
            tokio::fs::rename(entry.path(), &target)
                .await
                .map_err(|e| io_error(&target, e))?;
        }

        let target = self.store.canonical_path(&rendition.name);
        tokio::fs::rename(&playlist, &target)
            .await
            .map_err(|e| io_error(&target, e))?;
        let _ = tokio::fs::remove_dir_all(&staging).await;

        info!(rendition = %rendition.name, "Canonical package in place");
        Ok(())
    }
}

fn io_error(path: &Path, source: std::io::Error) -> TranscodeError {
    TranscodeError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::SimulatedEncoder;

    #[tokio::test]
    async fn test_package_moves_manifest_last_and_skips_existing() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = Arc::new(SimulatedEncoder::new().with_duration(Some(25.0)));
        let packager = Packager::new(
            Arc::clone(&encoder) as Arc<dyn Encoder>,
            dir.path(),
            Duration::from_secs(10),
        );
        let ladder = Rendition::default_ladder();
        let source = dir.path().join("movie.mkv");

        let report = packager.package_all(&source, &ladder[..2]).await;
        assert_eq!(report.packaged, vec!["1080p".to_string(), "720p".to_string()]);
        assert!(report.is_complete());

        let store = FsSegmentStore::new(dir.path());
        let playlist = store.canonical_playlist("720p").unwrap();
        assert!(playlist.contains("#EXT-X-ENDLIST"));
        assert!(playlist.contains("vod_002.ts"));
        for index in 0..3 {
            assert!(store.rendition_dir("720p").join(format!("vod_{index:03}.ts")).is_file());
        }
        assert!(!store.rendition_dir("720p").join(STAGING_DIR).exists());

        let again = packager.package_all(&source, &ladder[..2]).await;
        assert_eq!(again.skipped.len(), 2);
        assert_eq!(encoder.package_invocations(), 2);
    }

    #[tokio::test]
    async fn test_package_leaves_progressive_segments_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = Arc::new(SimulatedEncoder::new().with_duration(Some(25.0)));
        let packager = Packager::new(encoder, dir.path(), Duration::from_secs(10));
        let ladder = Rendition::default_ladder();

        let store = FsSegmentStore::new(dir.path());
        std::fs::create_dir_all(store.rendition_dir("1080p")).unwrap();
        for index in [0, 1] {
            std::fs::write(store.segment_path("1080p", index), b"progressive").unwrap();
        }

        packager
            .package(&dir.path().join("movie.mkv"), &ladder[0])
            .await
            .unwrap();

        assert_eq!(store.segment_indices("1080p"), vec![0, 1]);
        for index in [0, 1] {
            assert_eq!(
                std::fs::read(store.segment_path("1080p", index)).unwrap(),
                b"progressive"
            );
        }
        assert!(store.has_canonical("1080p"));
    }

    #[tokio::test]
    async fn test_failed_rendition_leaves_no_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = Arc::new(SimulatedEncoder::new().with_duration(Some(25.0)));
        encoder.fail_packaging(true);
        let packager = Packager::new(encoder, dir.path(), Duration::from_secs(10));
        let ladder = Rendition::default_ladder();

        let report = packager
            .package_all(&dir.path().join("movie.mkv"), &ladder[..1])
            .await;

        assert_eq!(report.failed.len(), 1);
        let store = FsSegmentStore::new(dir.path());
        assert!(!store.has_canonical("1080p"));
        assert!(!store.rendition_dir("1080p").join(STAGING_DIR).exists());
    }
}
