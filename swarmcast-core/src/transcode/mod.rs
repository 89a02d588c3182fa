//! Segment transcoding: partial source bytes in, fixed-duration transport
//! segments for every rendition out.

pub mod encoder;
pub mod package;
pub mod rendition;
pub mod retry;
pub mod segment_state;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

pub use encoder::{Encoder, EncoderError, FfmpegEncoder, SegmentEncodeRequest};
pub use package::{PackageReport, Packager};
pub use rendition::{Rendition, find_rendition};
pub use retry::RetryLedger;
pub use segment_state::{
    CANONICAL_PLAYLIST, CANONICAL_SEGMENT_PATTERN, FsSegmentStore, InMemorySegmentStore,
    SegmentStore, canonical_segment_file_name, is_segment_file, parse_segment_index,
    segment_file_name,
};

use crate::pipeline::gating::{SegmentPlan, SegmentSlice};

/// Errors from producing one segment index.
#[derive(Debug, thiserror::Error)]
pub enum TranscodeError {
    #[error("Segment {index} needs more source data: {reason}")]
    Retryable { index: u32, reason: String },

    #[error("Segment {index} failed: {reason}")]
    Failed { index: u32, reason: String },

    #[error("Packaging {rendition} failed: {reason}")]
    Packaging { rendition: String, reason: String },

    #[error("I/O error on {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Source media of known duration.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceMedia {
    pub path: PathBuf,
    /// Seconds
    pub duration: f64,
}

/// Result of a successful `produce` call.
#[derive(Debug, Clone, PartialEq)]
pub enum SegmentOutcome {
    /// The encoder ran and every listed rendition was renamed into place
    Produced {
        slice: SegmentSlice,
        renditions: Vec<String>,
    },
    /// All outputs were already on disk; the encoder was not invoked
    AlreadyPresent,
}

/// Produces segments of one job into its output directory.
pub struct SegmentTranscoder {
    encoder: Arc<dyn Encoder>,
    store: FsSegmentStore,
    segment_duration: Duration,
    safety_margin_percent: f64,
    ladder: Vec<Rendition>,
}

impl SegmentTranscoder {
    pub fn new(
        encoder: Arc<dyn Encoder>,
        output_root: impl Into<PathBuf>,
        segment_duration: Duration,
        ladder: Vec<Rendition>,
    ) -> Self {
        Self {
            encoder,
            store: FsSegmentStore::new(output_root),
            segment_duration,
            safety_margin_percent: 0.0,
            ladder,
        }
    }

    /// Safety margin recorded on plans built by [`SegmentTranscoder::plan`].
    pub fn with_safety_margin(mut self, percent: f64) -> Self {
        self.safety_margin_percent = percent;
        self
    }

    pub fn store(&self) -> &FsSegmentStore {
        &self.store
    }

    pub fn ladder(&self) -> &[Rendition] {
        &self.ladder
    }

    pub fn plan(&self, duration: f64) -> SegmentPlan {
        SegmentPlan::new(self.segment_duration, duration, self.safety_margin_percent)
    }

    /// Produces `index` for the configured ladder.
    ///
    /// # Errors
    /// See [`SegmentTranscoder::produce`].
    pub async fn produce_all(
        &self,
        source: &SourceMedia,
        index: u32,
    ) -> Result<SegmentOutcome, TranscodeError> {
        self.produce(source, index, &self.ladder).await
    }

    /// Produces every rendition of `index` in one encoder invocation.
    ///
    /// Outputs are staged as `.part` files and renamed only when the whole
    /// invocation succeeded. Renditions already on disk are not re-encoded.
    ///
    /// # Errors
    /// - `TranscodeError::Retryable` - Encoder read past the downloaded bytes
    /// - `TranscodeError::Failed` - Any other encoder failure, or an index past the end
    /// - `TranscodeError::Io` - Output directory or rename failure
    pub async fn produce(
        &self,
        source: &SourceMedia,
        index: u32,
        renditions: &[Rendition],
    ) -> Result<SegmentOutcome, TranscodeError> {
        let plan = self.plan(source.duration);
        let slice = plan.slice(index).ok_or_else(|| TranscodeError::Failed {
            index,
            reason: format!(
                "index beyond end of {:.1}s source ({} segments)",
                source.duration,
                plan.segment_count()
            ),
        })?;

        let missing: Vec<&Rendition> = renditions
            .iter()
            .filter(|rendition| !self.store.has_segment(&rendition.name, index))
            .collect();
        if missing.is_empty() {
            debug!(index, "Segment already present for every rendition");
            return Ok(SegmentOutcome::AlreadyPresent);
        }

        let mut outputs = Vec::with_capacity(missing.len());
        for rendition in &missing {
            let dir = self.store.rendition_dir(&rendition.name);
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|source| TranscodeError::Io { path: dir, source })?;
            outputs.push((
                (*rendition).clone(),
                self.store.staging_path(&rendition.name, index),
            ));
        }

        let request = SegmentEncodeRequest {
            index,
            source: source.path.clone(),
            start: slice.start,
            duration: slice.duration,
            keyframe_interval: plan.segment_duration(),
            outputs,
        };

        if let Err(e) = self.encoder.encode_segment(&request).await {
            discard_staging(&request).await;
            return Err(match e {
                EncoderError::InsufficientData { .. } => TranscodeError::Retryable {
                    index,
                    reason: e.to_string(),
                },
                other => TranscodeError::Failed {
                    index,
                    reason: other.to_string(),
                },
            });
        }

        for (rendition, staging) in &request.outputs {
            if !is_non_empty(staging).await {
                discard_staging(&request).await;
                return Err(TranscodeError::Failed {
                    index,
                    reason: format!("encoder produced no output for {}", rendition.name),
                });
            }
        }

        for (rendition, staging) in &request.outputs {
            let target = self.store.segment_path(&rendition.name, index);
            if let Err(source) = tokio::fs::rename(staging, &target).await {
                discard_staging(&request).await;
                return Err(TranscodeError::Io {
                    path: target,
                    source,
                });
            }
        }

        let names: Vec<String> = request.outputs.iter().map(|(r, _)| r.name.clone()).collect();
        info!(
            index,
            start = slice.start,
            duration = slice.duration,
            renditions = ?names,
            "Segment produced"
        );
        Ok(SegmentOutcome::Produced {
            slice,
            renditions: names,
        })
    }
}

async fn is_non_empty(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.is_file() && meta.len() > 0)
        .unwrap_or(false)
}

async fn discard_staging(request: &SegmentEncodeRequest) {
    for (_, staging) in &request.outputs {
        match tokio::fs::remove_file(staging).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %staging.display(), error = %e, "Failed to remove staging file"),
        }
    }
}
