//! Encoder abstraction for both production and simulation modes.
//!
//! Production shells out to `ffmpeg`/`ffprobe` through `tokio::process`.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::Rendition;
use super::segment_state::CANONICAL_SEGMENT_PATTERN;
use crate::config::TranscodeConfig;

/// Stderr fragments that mean the encoder ran out of downloaded bytes.
const INSUFFICIENT_DATA_MARKERS: [&str; 2] = ["Invalid data found", "invalid as first byte"];

/// Errors from encoder invocations.
#[derive(Debug, thiserror::Error)]
pub enum EncoderError {
    #[error("Encoder hit data that has not been downloaded yet")]
    InsufficientData { stderr: String },

    #[error("Encoder process failed: {reason}")]
    ProcessFailed { reason: String },

    #[error("Failed to start encoder: {reason}")]
    SpawnFailed { reason: String },

    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

/// One encoder invocation producing every requested rendition of a slice.
#[derive(Debug, Clone)]
pub struct SegmentEncodeRequest {
    pub index: u32,
    pub source: PathBuf,
    /// Slice start in seconds
    pub start: f64,
    /// Slice length in seconds
    pub duration: f64,
    /// Keyframe interval in seconds
    pub keyframe_interval: f64,
    /// Rendition and the file its output goes to
    pub outputs: Vec<(Rendition, PathBuf)>,
}

/// Abstraction over the external encoder.
#[async_trait]
pub trait Encoder: Send + Sync {
    /// Encodes one slice into every requested output in a single invocation.
    ///
    /// # Errors
    /// - `EncoderError::InsufficientData` - Source bytes for the slice are not on disk yet
    /// - `EncoderError::ProcessFailed` - Encoder exited unsuccessfully
    /// - `EncoderError::SpawnFailed` - Encoder binary could not be started
    async fn encode_segment(&self, request: &SegmentEncodeRequest) -> Result<(), EncoderError>;

    /// Duration of the media in seconds, `None` if it cannot be determined yet.
    async fn probe_duration(&self, source: &Path) -> Option<f64>;

    /// Produces a canonical VOD package (`index.m3u8` plus `vod_NNN.ts`)
    /// for one rendition into `out_dir`.
    ///
    /// # Errors
    /// - `EncoderError::ProcessFailed` - Encoder exited unsuccessfully
    /// - `EncoderError::SpawnFailed` - Encoder binary could not be started
    async fn package_rendition(
        &self,
        source: &Path,
        rendition: &Rendition,
        out_dir: &Path,
        segment_duration: Duration,
    ) -> Result<(), EncoderError>;
}

/// Maps a failed run's stderr onto an error class.
pub fn classify_failure(stderr: &str, status: impl std::fmt::Display) -> EncoderError {
    if INSUFFICIENT_DATA_MARKERS
        .iter()
        .any(|marker| stderr.contains(marker))
    {
        EncoderError::InsufficientData {
            stderr: tail(stderr, 2000),
        }
    } else {
        EncoderError::ProcessFailed {
            reason: format!("exit {status}: {}", tail(stderr, 2000)),
        }
    }
}

fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    text.chars().skip(count.saturating_sub(max_chars)).collect()
}

/// Production encoder driving the `ffmpeg` and `ffprobe` binaries.
pub struct FfmpegEncoder {
    config: TranscodeConfig,
}

impl FfmpegEncoder {
    pub fn new(config: TranscodeConfig) -> Self {
        Self { config }
    }

    /// Checks that the ffmpeg binary starts.
    pub async fn is_available(&self) -> bool {
        tokio::process::Command::new(&self.config.ffmpeg_path)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }

    /// Arguments of a single-pass, multi-output segment encode.
    pub fn segment_args(&self, request: &SegmentEncodeRequest) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::new();
        let mut push = |value: &str| args.push(OsString::from(value));

        push("-hide_banner");
        push("-loglevel");
        push("error");
        push("-y");
        push("-ss");
        push(&format_seconds(request.start));
        push("-t");
        push(&format_seconds(request.duration));
        push("-i");
        args.push(request.source.clone().into_os_string());

        let count = request.outputs.len();
        let mut graph = format!("[0:v:0]split={count}");
        for slot in 0..count {
            graph.push_str(&format!("[v{slot}]"));
        }
        for (slot, (rendition, _)) in request.outputs.iter().enumerate() {
            graph.push_str(&format!(
                ";[v{slot}]scale=-2:{}:flags=bicubic,format=yuv420p[out{slot}]",
                rendition.height
            ));
        }
        args.push("-filter_complex".into());
        args.push(graph.into());

        for (slot, (rendition, output)) in request.outputs.iter().enumerate() {
            let bitrate = format!("{}k", rendition.video_bitrate_kbps);
            let bufsize = format!("{}k", rendition.bufsize_kbps());
            let keyframes = format!("expr:gte(t,n_forced*{})", request.keyframe_interval);
            let settings: [&str; 36] = [
                "-map",
                &format!("[out{slot}]"),
                "-c:v",
                "libx264",
                "-b:v",
                &bitrate,
                "-maxrate",
                &bitrate,
                "-bufsize",
                &bufsize,
                "-preset",
                &self.config.preset,
                "-threads",
                &self.config.threads.to_string(),
                "-profile:v",
                "high",
                "-level",
                "4.1",
                "-crf",
                "23",
                "-map",
                "0:a:0?",
                "-c:a",
                "aac",
                "-b:a",
                "128k",
                "-ac",
                "2",
                "-ar",
                "44100",
                "-force_key_frames",
                &keyframes,
                "-output_ts_offset",
                &format_seconds(request.start),
                "-muxdelay",
                "0",
            ];
            args.extend(settings.into_iter().map(OsString::from));
            args.push("-f".into());
            args.push("mpegts".into());
            args.push(output.clone().into_os_string());
        }

        args
    }

    /// Arguments of a full-length HLS VOD package for one rendition.
    pub fn package_args(
        &self,
        source: &Path,
        rendition: &Rendition,
        out_dir: &Path,
        segment_duration: Duration,
    ) -> Vec<OsString> {
        let seconds = segment_duration.as_secs_f64();
        let bitrate = format!("{}k", rendition.video_bitrate_kbps);
        let mut args: Vec<OsString> = vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-y".into(),
            "-i".into(),
            source.as_os_str().to_owned(),
        ];
        let settings = [
            "-map".to_string(),
            "0:v:0".to_string(),
            "-vf".to_string(),
            format!("scale=-2:{}:flags=bicubic,format=yuv420p", rendition.height),
            "-c:v".to_string(),
            "libx264".to_string(),
            "-b:v".to_string(),
            bitrate.clone(),
            "-maxrate".to_string(),
            bitrate,
            "-bufsize".to_string(),
            format!("{}k", rendition.bufsize_kbps()),
            "-preset".to_string(),
            self.config.preset.clone(),
            "-threads".to_string(),
            self.config.threads.to_string(),
            "-profile:v".to_string(),
            "high".to_string(),
            "-level".to_string(),
            "4.1".to_string(),
            "-crf".to_string(),
            "23".to_string(),
            "-map".to_string(),
            "0:a:0?".to_string(),
            "-c:a".to_string(),
            "aac".to_string(),
            "-b:a".to_string(),
            "128k".to_string(),
            "-ac".to_string(),
            "2".to_string(),
            "-ar".to_string(),
            "44100".to_string(),
            "-force_key_frames".to_string(),
            format!("expr:gte(t,n_forced*{seconds})"),
            "-f".to_string(),
            "hls".to_string(),
            "-hls_time".to_string(),
            format_seconds(seconds),
            "-hls_playlist_type".to_string(),
            "vod".to_string(),
            "-hls_flags".to_string(),
            "independent_segments".to_string(),
            "-hls_segment_filename".to_string(),
        ];
        args.extend(settings.into_iter().map(OsString::from));
        args.push(out_dir.join(CANONICAL_SEGMENT_PATTERN).into_os_string());
        args.push(out_dir.join("index.m3u8").into_os_string());
        args
    }

    async fn run_ffmpeg(&self, args: Vec<OsString>) -> Result<(), EncoderError> {
        let mut cmd = tokio::process::Command::new(&self.config.ffmpeg_path);
        cmd.args(&args).stdin(Stdio::null()).kill_on_drop(true);
        debug!(command = ?cmd, "Executing ffmpeg");

        let output = cmd.output().await.map_err(|e| EncoderError::SpawnFailed {
            reason: format!("{}: {e}", self.config.ffmpeg_path.display()),
        })?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if output.status.success() {
            if !stderr.trim().is_empty() {
                debug!(stderr = %stderr.trim(), "ffmpeg finished with diagnostics");
            }
            return Ok(());
        }

        warn!(status = %output.status, stderr = %tail(&stderr, 500), "ffmpeg failed");
        Err(classify_failure(&stderr, output.status))
    }
}

#[async_trait]
impl Encoder for FfmpegEncoder {
    async fn encode_segment(&self, request: &SegmentEncodeRequest) -> Result<(), EncoderError> {
        let started = Instant::now();
        let args = self.segment_args(request);
        self.run_ffmpeg(args).await?;
        info!(
            index = request.index,
            renditions = request.outputs.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Encoded segment"
        );
        Ok(())
    }

    async fn probe_duration(&self, source: &Path) -> Option<f64> {
        let mut cmd = tokio::process::Command::new(&self.config.ffprobe_path);
        cmd.args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(source)
        .stdin(Stdio::null())
        .kill_on_drop(true);

        let output = match tokio::time::timeout(self.config.probe_timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to start ffprobe");
                return None;
            }
            Err(_) => {
                debug!(source = %source.display(), "ffprobe timed out");
                return None;
            }
        };

        if !output.status.success() {
            debug!(source = %source.display(), "ffprobe could not read duration yet");
            return None;
        }
        parse_probe_duration(&String::from_utf8_lossy(&output.stdout))
    }

    async fn package_rendition(
        &self,
        source: &Path,
        rendition: &Rendition,
        out_dir: &Path,
        segment_duration: Duration,
    ) -> Result<(), EncoderError> {
        let started = Instant::now();
        let args = self.package_args(source, rendition, out_dir, segment_duration);
        self.run_ffmpeg(args).await?;
        info!(
            rendition = %rendition.name,
            elapsed_secs = started.elapsed().as_secs(),
            "Packaged rendition"
        );
        Ok(())
    }
}

/// Parses ffprobe's `format=duration` output; rejects non-positive values.
pub fn parse_probe_duration(stdout: &str) -> Option<f64> {
    stdout
        .lines()
        .map(|line| line.trim().trim_start_matches("duration="))
        .find_map(|value| value.parse::<f64>().ok())
        .filter(|duration| duration.is_finite() && *duration > 0.0)
}

fn format_seconds(seconds: f64) -> String {
    let text = format!("{seconds:.3}");
    text.trim_end_matches('0').trim_end_matches('.').to_string()
}
