//! Simulated encoder with scripted failures.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::pipeline::gating::SegmentPlan;
use crate::transcode::{
    Encoder, EncoderError, Rendition, SegmentEncodeRequest, canonical_segment_file_name,
};

/// Failure class to inject for an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedFailure {
    /// Looks like ffmpeg reading past the downloaded bytes
    InsufficientData,
    /// Any other encoder failure
    Fatal,
}

/// Record of one `encode_segment` invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeCall {
    pub index: u32,
    pub start: f64,
    pub duration: f64,
    pub renditions: Vec<String>,
    /// Source file size at invocation time
    pub source_len: Option<u64>,
    pub started_at: Instant,
}

/// Encoder that writes small placeholder files instead of running ffmpeg.
#[derive(Debug, Default)]
pub struct SimulatedEncoder {
    duration: Mutex<Option<f64>>,
    encode_delay: Duration,
    failures: Mutex<HashMap<u32, VecDeque<ScriptedFailure>>>,
    calls: Mutex<Vec<EncodeCall>>,
    probes: AtomicUsize,
    package_calls: AtomicUsize,
    fail_packaging: AtomicBool,
}

impl SimulatedEncoder {
    /// Encoder that succeeds at everything and probes no duration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Duration reported by `probe_duration` once the source file exists.
    pub fn with_duration(self, duration: Option<f64>) -> Self {
        *self.duration.lock() = duration;
        self
    }

    /// Artificial time spent in each segment encode.
    pub fn with_encode_delay(mut self, delay: Duration) -> Self {
        self.encode_delay = delay;
        self
    }

    pub fn set_duration(&self, duration: Option<f64>) {
        *self.duration.lock() = duration;
    }

    /// Makes the next `times` encodes of `index` fail with `kind`.
    pub fn fail_index(&self, index: u32, times: usize, kind: ScriptedFailure) {
        let mut failures = self.failures.lock();
        let queue = failures.entry(index).or_default();
        queue.extend(std::iter::repeat_n(kind, times));
    }

    pub fn fail_packaging(&self, fail: bool) {
        self.fail_packaging.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<EncodeCall> {
        self.calls.lock().clone()
    }

    pub fn segment_invocations(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn invocations_for(&self, index: u32) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.index == index)
            .count()
    }

    pub fn probe_invocations(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn package_invocations(&self) -> usize {
        self.package_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Encoder for SimulatedEncoder {
    async fn encode_segment(&self, request: &SegmentEncodeRequest) -> Result<(), EncoderError> {
        let started_at = Instant::now();
        let source_len = tokio::fs::metadata(&request.source)
            .await
            .ok()
            .map(|meta| meta.len());
        self.calls.lock().push(EncodeCall {
            index: request.index,
            start: request.start,
            duration: request.duration,
            renditions: request.outputs.iter().map(|(r, _)| r.name.clone()).collect(),
            source_len,
            started_at,
        });

        if !self.encode_delay.is_zero() {
            tokio::time::sleep(self.encode_delay).await;
        }

        let scripted = self
            .failures
            .lock()
            .get_mut(&request.index)
            .and_then(VecDeque::pop_front);

        if let Some(failure) = scripted {
            // Leave a torn output behind, as a crashed ffmpeg would.
            if let Some((_, first)) = request.outputs.first() {
                tokio::fs::write(first, b"\x47partial").await?;
            }
            return Err(match failure {
                ScriptedFailure::InsufficientData => EncoderError::InsufficientData {
                    stderr: "Invalid data found when processing input".to_string(),
                },
                ScriptedFailure::Fatal => EncoderError::ProcessFailed {
                    reason: format!("simulated failure for segment {}", request.index),
                },
            });
        }

        for (rendition, output) in &request.outputs {
            let body = format!(
                "SIMTS index={} rendition={} start={} duration={}\n",
                request.index, rendition.name, request.start, request.duration
            );
            tokio::fs::write(output, body).await?;
        }
        Ok(())
    }

    async fn probe_duration(&self, source: &Path) -> Option<f64> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let exists = tokio::fs::metadata(source)
            .await
            .map(|meta| meta.len() > 0)
            .unwrap_or(false);
        if !exists {
            return None;
        }
        *self.duration.lock()
    }

    async fn package_rendition(
        &self,
        _source: &Path,
        rendition: &Rendition,
        out_dir: &Path,
        segment_duration: Duration,
    ) -> Result<(), EncoderError> {
        self.package_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_packaging.load(Ordering::SeqCst) {
            return Err(EncoderError::ProcessFailed {
                reason: format!("simulated packaging failure for {}", rendition.name),
            });
        }

        let Some(duration) = *self.duration.lock() else {
            return Err(EncoderError::ProcessFailed {
                reason: "source duration unknown".to_string(),
            });
        };

        let plan = SegmentPlan::new(segment_duration, duration, 0.0);
        let target = segment_duration.as_secs().max(1);
        let mut playlist = format!(
            "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:{target}\n#EXT-X-MEDIA-SEQUENCE:0\n#EXT-X-PLAYLIST-TYPE:VOD\n#EXT-X-INDEPENDENT-SEGMENTS\n"
        );
        for index in 0..plan.segment_count() {
            let Some(slice) = plan.slice(index) else {
                break;
            };
            let name = canonical_segment_file_name(index);
            tokio::fs::write(
                out_dir.join(&name),
                format!("SIMTS canonical index={index} rendition={}\n", rendition.name),
            )
            .await?;
            playlist.push_str(&format!("#EXTINF:{:.6},\n{name}\n", slice.duration));
        }
        playlist.push_str("#EXT-X-ENDLIST\n");
        tokio::fs::write(out_dir.join("index.m3u8"), playlist).await?;
        Ok(())
    }
}
