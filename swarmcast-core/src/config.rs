//! Centralized configuration for Swarmcast.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::transcode::Rendition;

/// Central configuration for all Swarmcast components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct SwarmcastConfig {
    pub session: SessionConfig,
    pub pipeline: PipelineConfig,
    pub transcode: TranscodeConfig,
    pub storage: StorageConfig,
    pub server: ServerConfig,
}

/// Download session lifecycle configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How often the idle sweep inspects registered sessions
    pub sweep_interval: Duration,
    /// Continuous seeding time after which a session is released
    pub seeding_idle_threshold: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(300),
            seeding_idle_threshold: Duration::from_secs(3600),
        }
    }
}

/// Per-job pipeline cadence, gating and bounded waits.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Fixed duration of every progressive segment
    pub segment_duration: Duration,
    /// Extra progress, in percentage points, required before a segment is encoded
    pub safety_margin_percent: f64,
    /// Upper bound for transfer metadata resolution
    pub metadata_timeout: Duration,
    /// Upper bound for the source header to land on disk
    pub header_timeout: Duration,
    /// Swarm progress poll cadence
    pub poll_interval: Duration,
    /// Cadence of swarm diagnostics log lines
    pub diagnostics_interval: Duration,
    /// Cadence of progress persistence to the job store
    pub persist_interval: Duration,
    /// Number of leading pieces raised to top priority
    pub header_priority_pieces: u32,
    /// Concurrent workers for the post-download catch-up batch
    pub catchup_workers: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            segment_duration: Duration::from_secs(10),
            safety_margin_percent: 5.0,
            metadata_timeout: Duration::from_secs(120),
            header_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            diagnostics_interval: Duration::from_secs(2),
            persist_interval: Duration::from_secs(5),
            header_priority_pieces: 20,
            catchup_workers: 4,
        }
    }
}

/// Encoder invocation settings and the rendition ladder.
#[derive(Debug, Clone)]
pub struct TranscodeConfig {
    /// Path or name of the ffmpeg binary
    pub ffmpeg_path: PathBuf,
    /// Path or name of the ffprobe binary
    pub ffprobe_path: PathBuf,
    /// Encoder thread count passed to ffmpeg
    pub threads: u32,
    /// x264 preset
    pub preset: String,
    /// Counted failures before a segment index is given up
    pub max_retries: u32,
    /// Minimum wait between attempts on the same index
    pub retry_cooldown: Duration,
    /// Upper bound for a duration probe
    pub probe_timeout: Duration,
    /// Renditions produced for every segment, highest first
    pub renditions: Vec<Rendition>,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            threads: 2,
            preset: "superfast".to_string(),
            max_retries: 3,
            retry_cooldown: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(10),
            renditions: Rendition::default_ladder(),
        }
    }
}

/// On-disk layout configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Root under which every job gets `movies/{job_id}`
    pub media_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            media_root: PathBuf::from("media"),
        }
    }
}

impl StorageConfig {
    /// Directory holding both the transfer and the encoded output of a job.
    pub fn job_dir(&self, job_id: impl std::fmt::Display) -> PathBuf {
        self.media_root.join("movies").join(job_id.to_string())
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: SocketAddr,
    /// Path prefix under which job endpoints are mounted
    pub api_prefix: &'static str,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 3000)),
            api_prefix: "/api/jobs",
        }
    }
}

impl SwarmcastConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(root) = std::env::var("SWARMCAST_MEDIA_ROOT") {
            config.storage.media_root = PathBuf::from(root);
        }

        if let Ok(seconds) = std::env::var("SWARMCAST_SEGMENT_DURATION") {
            if let Ok(seconds) = seconds.parse::<u64>() {
                if seconds > 0 {
                    config.pipeline.segment_duration = Duration::from_secs(seconds);
                }
            }
        }

        if let Ok(margin) = std::env::var("SWARMCAST_SAFETY_MARGIN") {
            if let Ok(margin) = margin.parse::<f64>() {
                config.pipeline.safety_margin_percent = margin.clamp(0.0, 100.0);
            }
        }

        if let Ok(retries) = std::env::var("SWARMCAST_MAX_RETRIES") {
            if let Ok(retries) = retries.parse::<u32>() {
                config.transcode.max_retries = retries.max(1);
            }
        }

        if let Ok(workers) = std::env::var("SWARMCAST_CATCHUP_WORKERS") {
            if let Ok(workers) = workers.parse::<usize>() {
                config.pipeline.catchup_workers = workers.max(1);
            }
        }

        if let Ok(threads) = std::env::var("FFMPEG_THREADS") {
            if let Ok(threads) = threads.parse::<u32>() {
                config.transcode.threads = threads;
            }
        }

        if let Ok(preset) = std::env::var("FFMPEG_PRESET") {
            if !preset.is_empty() {
                config.transcode.preset = preset;
            }
        }

        if let Ok(path) = std::env::var("SWARMCAST_FFMPEG_PATH") {
            config.transcode.ffmpeg_path = PathBuf::from(path);
        }

        if let Ok(path) = std::env::var("SWARMCAST_FFPROBE_PATH") {
            config.transcode.ffprobe_path = PathBuf::from(path);
        }

        if let Ok(bind) = std::env::var("SWARMCAST_BIND") {
            if let Ok(address) = bind.parse::<SocketAddr>() {
                config.server.bind_address = address;
            }
        }

        config
    }

    /// Creates a configuration optimized for testing.
    ///
    /// Cadences and bounded waits shrink to milliseconds so pipeline tests
    /// finish quickly; gating and retry semantics stay the same.
    pub fn for_testing() -> Self {
        Self {
            session: SessionConfig {
                sweep_interval: Duration::from_millis(20),
                seeding_idle_threshold: Duration::from_millis(200),
            },
            pipeline: PipelineConfig {
                metadata_timeout: Duration::from_millis(500),
                header_timeout: Duration::from_millis(500),
                poll_interval: Duration::from_millis(5),
                diagnostics_interval: Duration::from_millis(50),
                persist_interval: Duration::from_millis(20),
                ..Default::default()
            },
            transcode: TranscodeConfig {
                retry_cooldown: Duration::from_millis(10),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = SwarmcastConfig::default();

        assert_eq!(config.pipeline.segment_duration, Duration::from_secs(10));
        assert_eq!(config.pipeline.safety_margin_percent, 5.0);
        assert_eq!(config.pipeline.metadata_timeout, Duration::from_secs(120));
        assert_eq!(config.pipeline.header_timeout, Duration::from_secs(60));
        assert_eq!(config.pipeline.catchup_workers, 4);
        assert_eq!(config.transcode.max_retries, 3);
        assert_eq!(config.transcode.retry_cooldown, Duration::from_secs(30));
        assert_eq!(config.transcode.renditions.len(), 4);
        assert_eq!(config.session.sweep_interval, Duration::from_secs(300));
        assert_eq!(
            config.session.seeding_idle_threshold,
            Duration::from_secs(3600)
        );
    }

    #[test]
    fn test_job_dir_layout() {
        let storage = StorageConfig {
            media_root: PathBuf::from("/srv/media"),
        };
        assert_eq!(
            storage.job_dir("abc"),
            PathBuf::from("/srv/media/movies/abc")
        );
    }

    #[test]
    fn test_testing_preset_keeps_semantics() {
        let config = SwarmcastConfig::for_testing();
        assert!(config.pipeline.poll_interval < Duration::from_secs(1));
        assert_eq!(config.transcode.max_retries, 3);
        assert_eq!(config.pipeline.segment_duration, Duration::from_secs(10));
    }

    #[test]
    fn test_env_override() {
        unsafe {
            std::env::set_var("SWARMCAST_SEGMENT_DURATION", "6");
            std::env::set_var("SWARMCAST_SAFETY_MARGIN", "2");
            std::env::set_var("SWARMCAST_MAX_RETRIES", "2");
            std::env::set_var("FFMPEG_PRESET", "ultrafast");
        }

        let config = SwarmcastConfig::from_env();

        assert_eq!(config.pipeline.segment_duration, Duration::from_secs(6));
        assert_eq!(config.pipeline.safety_margin_percent, 2.0);
        assert_eq!(config.transcode.max_retries, 2);
        assert_eq!(config.transcode.preset, "ultrafast");

        unsafe {
            std::env::remove_var("SWARMCAST_SEGMENT_DURATION");
            std::env::remove_var("SWARMCAST_SAFETY_MARGIN");
            std::env::remove_var("SWARMCAST_MAX_RETRIES");
            std::env::remove_var("FFMPEG_PRESET");
        }
    }
}
