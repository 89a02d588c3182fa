//! CLI command implementations

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Subcommand;
use swarmcast_core::config::SwarmcastConfig;
use swarmcast_core::jobs::InMemoryJobStore;
use swarmcast_core::pipeline::{PipelineContext, SegmentPlan};
use swarmcast_core::session::{RqbitBackend, SessionRegistry, TorrentBackend};
use swarmcast_core::simulation::{FeedConfig, SimulatedBackend, SimulatedEncoder};
use swarmcast_core::transcode::{Encoder, FfmpegEncoder, Packager};
use swarmcast_core::StreamService;
use tracing::{info, warn};

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Start the streaming server
    Server {
        /// Address to bind to
        #[arg(long)]
        bind: Option<SocketAddr>,
        /// Root directory for downloads and HLS output
        #[arg(long)]
        media_root: Option<PathBuf>,
        /// Feed this local file through a simulated swarm instead of BitTorrent
        #[arg(long)]
        simulate: Option<PathBuf>,
        /// Simulated download rate in bytes per second
        #[arg(long, default_value = "2000000")]
        rate: u64,
        /// Duration reported for the simulated file when ffmpeg is unavailable
        #[arg(long, default_value = "600")]
        sim_duration: f64,
    },
    /// Package a local file into canonical HLS renditions
    Package {
        /// Source media file
        source: PathBuf,
        /// Output directory, one subdirectory per rendition
        out_dir: PathBuf,
    },
    /// Print the probed duration and segment count of a media file
    Probe {
        /// Media file to probe
        file: PathBuf,
    },
}

/// Handle the CLI command
///
/// # Errors
/// Returns the error of the command that fails
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Server {
            bind,
            media_root,
            simulate,
            rate,
            sim_duration,
        } => start_server(bind, media_root, simulate, rate, sim_duration).await,
        Commands::Package { source, out_dir } => package_file(source, out_dir).await,
        Commands::Probe { file } => probe_file(file).await,
    }
}

/// Start the API server with the BitTorrent backend, or a simulated swarm
/// when `simulate` names a local file.
///
/// # Errors
/// - Backend session could not be created
/// - Server failed to bind or stopped
pub async fn start_server(
    bind: Option<SocketAddr>,
    media_root: Option<PathBuf>,
    simulate: Option<PathBuf>,
    rate: u64,
    sim_duration: f64,
) -> anyhow::Result<()> {
    let mut config = SwarmcastConfig::from_env();
    if let Some(bind) = bind {
        config.server.bind_address = bind;
    }
    if let Some(root) = media_root {
        config.storage.media_root = root;
    }
    tokio::fs::create_dir_all(&config.storage.media_root)
        .await
        .with_context(|| format!("creating {}", config.storage.media_root.display()))?;

    let ffmpeg = FfmpegEncoder::new(config.transcode.clone());
    let ffmpeg_available = ffmpeg.is_available().await;

    let (backend, encoder): (Arc<dyn TorrentBackend>, Arc<dyn Encoder>) = match simulate {
        Some(file) => {
            if !file.is_file() {
                bail!("simulation source {} is not a file", file.display());
            }
            info!(source = %file.display(), rate, "Development mode: simulated swarm");
            let backend: Arc<dyn TorrentBackend> =
                Arc::new(SimulatedBackend::with_feed(FeedConfig::at_rate(file, rate)));
            let encoder: Arc<dyn Encoder> = if ffmpeg_available {
                Arc::new(ffmpeg)
            } else {
                warn!(duration = sim_duration, "ffmpeg not found, using simulated encoder");
                Arc::new(SimulatedEncoder::new().with_duration(Some(sim_duration)))
            };
            (backend, encoder)
        }
        None => {
            if !ffmpeg_available {
                warn!(
                    ffmpeg = %config.transcode.ffmpeg_path.display(),
                    "ffmpeg not found, transcoding will fail"
                );
            }
            let backend = RqbitBackend::new(&config.storage.media_root)
                .await
                .context("starting BitTorrent session")?;
            let backend: Arc<dyn TorrentBackend> = Arc::new(backend);
            let encoder: Arc<dyn Encoder> = Arc::new(ffmpeg);
            (backend, encoder)
        }
    };

    let registry = Arc::new(SessionRegistry::new(backend, config.session.clone()));
    let _sweep = registry.spawn_idle_sweep();

    let bind_address = config.server.bind_address;
    let ctx = Arc::new(PipelineContext::new(
        config,
        Arc::new(InMemoryJobStore::new()),
        registry,
        encoder,
    ));
    let service = Arc::new(StreamService::new(ctx));

    println!("Swarmcast running on http://{bind_address}");
    swarmcast_web::run_server(service, bind_address).await?;
    Ok(())
}

/// Run the finalization pass on a local file.
///
/// # Errors
/// - Any rendition failed to package
pub async fn package_file(source: PathBuf, out_dir: PathBuf) -> anyhow::Result<()> {
    let config = SwarmcastConfig::from_env();
    if !source.is_file() {
        bail!("{} is not a file", source.display());
    }
    tokio::fs::create_dir_all(&out_dir)
        .await
        .with_context(|| format!("creating {}", out_dir.display()))?;

    let encoder = Arc::new(FfmpegEncoder::new(config.transcode.clone()));
    let packager = Packager::new(encoder, &out_dir, config.pipeline.segment_duration);

    println!("Packaging {} into {}", source.display(), out_dir.display());
    let report = packager
        .package_all(&source, &config.transcode.renditions)
        .await;

    for name in &report.packaged {
        println!("  packaged {name}");
    }
    for name in &report.skipped {
        println!("  skipped  {name} (already packaged)");
    }
    for (name, reason) in &report.failed {
        println!("  failed   {name}: {reason}");
    }

    if !report.is_complete() {
        bail!("{} rendition(s) failed to package", report.failed.len());
    }
    Ok(())
}

/// Print the duration and segment count of a media file.
///
/// # Errors
/// - Duration could not be probed
pub async fn probe_file(file: PathBuf) -> anyhow::Result<()> {
    let config = SwarmcastConfig::from_env();
    let encoder = FfmpegEncoder::new(config.transcode.clone());

    let Some(duration) = encoder.probe_duration(&file).await else {
        bail!("could not probe duration of {}", file.display());
    };
    let plan = SegmentPlan::new(
        config.pipeline.segment_duration,
        duration,
        config.pipeline.safety_margin_percent,
    );

    println!("File:     {}", file.display());
    println!("Duration: {duration:.3}s");
    println!(
        "Segments: {} x {}s",
        plan.segment_count(),
        plan.segment_duration()
    );
    Ok(())
}
