//! Integration tests for the progressive pipeline.
//!
//! These drive `PipelineController` and `StreamService` end to end against the
//! simulated swarm and encoder, checking job state, on-disk output and the
//! gating contract observed by the encoder.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use swarmcast_core::config::SwarmcastConfig;
use swarmcast_core::jobs::{InMemoryJobStore, JobId, JobStatus, JobStore};
use swarmcast_core::manifest::ManifestBuilder;
use swarmcast_core::pipeline::{
    PipelineContext, PipelineController, PipelineError, PipelineReport, SegmentPlan,
};
use swarmcast_core::service::StreamService;
use swarmcast_core::session::{SessionRegistry, TransferFile, TransferMetadata};
use swarmcast_core::simulation::{
    FeedConfig, ScriptedFailure, SimulatedBackend, SimulatedEncoder, SimulatedSession,
};
use swarmcast_core::transcode::{InMemorySegmentStore, Rendition};
use tokio::time::timeout;

const SOURCE_BYTES: u64 = 95_000;
const SOURCE_SECONDS: f64 = 95.0;

/// Test fixture wiring the pipeline to simulated collaborators.
struct PipelineFixture {
    ctx: Arc<PipelineContext>,
    store: Arc<InMemoryJobStore>,
    backend: Arc<SimulatedBackend>,
    encoder: Arc<SimulatedEncoder>,
    source_file: PathBuf,
    _dir: tempfile::TempDir,
}

impl PipelineFixture {
    /// Sessions driven by the test through `SimulatedSession` setters.
    fn manual(encoder: SimulatedEncoder) -> Self {
        Self::manual_with_config(encoder, SwarmcastConfig::for_testing())
    }

    fn manual_with_config(encoder: SimulatedEncoder, config: SwarmcastConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let source_file = write_source(dir.path());
        Self::build(dir, source_file, SimulatedBackend::new(), encoder, config)
    }

    /// Sessions fed from a local file at a fixed rate.
    fn fed(encoder: SimulatedEncoder) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let source_file = write_source(dir.path());
        let feed = FeedConfig {
            source: source_file.clone(),
            bytes_per_tick: 5_000,
            tick: Duration::from_millis(5),
            metadata_delay: Duration::from_millis(10),
            seeds: 2,
            peers: 6,
        };
        Self::build(
            dir,
            source_file,
            SimulatedBackend::with_feed(feed),
            encoder,
            SwarmcastConfig::for_testing(),
        )
    }

    fn build(
        dir: tempfile::TempDir,
        source_file: PathBuf,
        backend: SimulatedBackend,
        encoder: SimulatedEncoder,
        mut config: SwarmcastConfig,
    ) -> Self {
        config.storage.media_root = dir.path().join("media");

        let backend = Arc::new(backend);
        let encoder = Arc::new(encoder);
        let store = Arc::new(InMemoryJobStore::new());
        let registry = Arc::new(SessionRegistry::new(
            backend.clone(),
            config.session.clone(),
        ));
        let ctx = Arc::new(PipelineContext::new(
            config,
            store.clone(),
            registry,
            encoder.clone(),
        ));

        Self {
            ctx,
            store,
            backend,
            encoder,
            source_file,
            _dir: dir,
        }
    }

    async fn create_job(&self, source: &str) -> JobId {
        self.store.get_or_create("tt0133093", source).await.unwrap().id
    }

    async fn run(&self, job_id: JobId) -> Result<PipelineReport, PipelineError> {
        let controller = PipelineController::new(Arc::clone(&self.ctx));
        timeout(Duration::from_secs(20), controller.run(job_id))
            .await
            .expect("pipeline run timed out")
    }

    fn spawn_run(
        &self,
        job_id: JobId,
    ) -> tokio::task::JoinHandle<Result<PipelineReport, PipelineError>> {
        let controller = PipelineController::new(Arc::clone(&self.ctx));
        tokio::spawn(async move { controller.run(job_id).await })
    }

    async fn session(&self, source: &str) -> Arc<SimulatedSession> {
        self.backend
            .wait_for_session(source, Duration::from_secs(5))
            .await
            .expect("session attached")
    }

    /// Delivers metadata for a single `movie.mkv` of `SOURCE_BYTES`.
    fn resolve(&self, session: &SimulatedSession) {
        session.resolve_metadata(TransferMetadata {
            name: "movie".to_string(),
            files: vec![
                TransferFile {
                    relative_path: PathBuf::from("movie.nfo"),
                    length: 512,
                },
                TransferFile {
                    relative_path: PathBuf::from("movie.mkv"),
                    length: SOURCE_BYTES,
                },
            ],
            piece_length: Some(1_000),
        });
        session.set_swarm(1, 3, 800.0);
    }

    /// Puts the first `bytes` of the source on disk and reports them.
    fn deliver(&self, session: &SimulatedSession, bytes: u64) {
        let data = std::fs::read(&self.source_file).unwrap();
        std::fs::create_dir_all(session.save_path()).unwrap();
        std::fs::write(
            session.save_path().join("movie.mkv"),
            &data[..bytes as usize],
        )
        .unwrap();
        session.set_progress(bytes);
    }

    fn job_dir(&self, job_id: JobId) -> PathBuf {
        self.ctx.job_dir(job_id)
    }
}

fn write_source(dir: &Path) -> PathBuf {
    let path = dir.join("movie.mkv");
    let body: Vec<u8> = (0..SOURCE_BYTES).map(|i| (i % 251) as u8 | 1).collect();
    std::fs::write(&path, body).unwrap();
    path
}

async fn wait_until<F>(mut condition: F)
where
    F: AsyncFnMut() -> bool,
{
    timeout(Duration::from_secs(10), async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_fed_transfer_reaches_ready() {
    let fixture = PipelineFixture::fed(SimulatedEncoder::new().with_duration(Some(SOURCE_SECONDS)));
    let job_id = fixture.create_job("magnet:?xt=urn:btih:ready").await;

    let report = fixture.run(job_id).await.unwrap();
    assert_eq!(report.segment_count, 10);
    assert!(report.failed_indices.is_empty());
    assert!(report.package.is_complete());
    assert_eq!(report.package.packaged.len(), 4);

    let job = fixture.store.get(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Ready);
    assert!(job.playable);
    assert_eq!(job.progress, 100.0);
    assert_eq!(job.duration, Some(SOURCE_SECONDS));
    assert_eq!(
        job.resolved_path,
        Some(fixture.job_dir(job_id).join("movie.mkv"))
    );

    for rendition in Rendition::default_ladder() {
        let dir = fixture.job_dir(job_id).join(&rendition.name);
        assert!(dir.join("index.m3u8").is_file());
        assert!(dir.join("segment_009.ts").is_file());
        assert!(!dir.join(".package").exists());
    }

    // Each index encoded once, all renditions in one invocation.
    for index in 0..10 {
        assert_eq!(fixture.encoder.invocations_for(index), 1);
    }
}

#[tokio::test]
async fn test_encoder_never_reads_ahead_of_download() {
    let fixture = PipelineFixture::fed(SimulatedEncoder::new().with_duration(Some(SOURCE_SECONDS)));
    let job_id = fixture.create_job("magnet:?xt=urn:btih:gating").await;
    fixture.run(job_id).await.unwrap();

    let plan = SegmentPlan::new(
        fixture.ctx.config.pipeline.segment_duration,
        SOURCE_SECONDS,
        fixture.ctx.config.pipeline.safety_margin_percent,
    );
    let calls = fixture.encoder.calls();
    assert!(!calls.is_empty());
    for call in calls {
        let len = call.source_len.unwrap();
        let pct = len as f64 / SOURCE_BYTES as f64 * 100.0;
        assert!(
            len == SOURCE_BYTES || plan.is_ready(call.index, pct, false),
            "segment {} encoded with only {pct:.1}% on disk",
            call.index
        );
    }
}

#[tokio::test]
async fn test_playable_before_transfer_completes() {
    let fixture =
        PipelineFixture::manual(SimulatedEncoder::new().with_duration(Some(SOURCE_SECONDS)));
    let source = "magnet:?xt=urn:btih:early";
    let job_id = fixture.create_job(source).await;
    let run = fixture.spawn_run(job_id);

    let session = fixture.session(source).await;
    fixture.resolve(&session);
    // Index 0 needs 10/95 plus the 5 % margin, roughly 15.6 %.
    fixture.deliver(&session, 16_000);

    wait_until(async || fixture.store.get(job_id).await.unwrap().playable).await;
    let job = fixture.store.get(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::DownloadingAndTranscoding);
    assert!(job.progress < 20.0);
    assert!(session.sequential_enabled());
    assert_eq!(fixture.encoder.invocations_for(0), 1);
    assert_eq!(fixture.encoder.invocations_for(1), 0);

    // Progressive manifest is live while the transfer continues.
    let service = StreamService::new(Arc::clone(&fixture.ctx));
    let media = service.media_manifest(job_id, "720p").await.unwrap();
    assert!(media.contains("#EXT-X-PLAYLIST-TYPE:EVENT"));
    assert!(!media.contains("#EXT-X-ENDLIST"));

    fixture.deliver(&session, SOURCE_BYTES);
    session.set_seeding(true);

    let report = timeout(Duration::from_secs(20), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(report.failed_indices.is_empty());
    assert_eq!(
        fixture.store.get(job_id).await.unwrap().status,
        JobStatus::Ready
    );
}

#[tokio::test]
async fn test_failing_segment_leaves_gap_but_job_ready() {
    let encoder = SimulatedEncoder::new().with_duration(Some(SOURCE_SECONDS));
    encoder.fail_index(4, 3, ScriptedFailure::Fatal);
    let fixture = PipelineFixture::fed(encoder);
    let job_id = fixture.create_job("magnet:?xt=urn:btih:gap").await;

    let report = fixture.run(job_id).await.unwrap();
    assert_eq!(report.failed_indices, vec![4]);
    assert_eq!(fixture.encoder.invocations_for(4), 3);

    let job = fixture.store.get(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Ready);
    assert!(job.playable);

    // The torn output of the failed attempts never became a segment.
    let progressive = fixture.job_dir(job_id).join("1080p");
    assert!(!progressive.join("segment_004.ts.part").exists());
}

#[tokio::test]
async fn test_invalid_data_after_completion_exhausts_budget_with_cooldowns() {
    let encoder = SimulatedEncoder::new().with_duration(Some(SOURCE_SECONDS));
    encoder.fail_index(4, 3, ScriptedFailure::InsufficientData);
    let mut config = SwarmcastConfig::for_testing();
    config.transcode.retry_cooldown = Duration::from_millis(40);
    let cooldown = config.transcode.retry_cooldown;
    let fixture = PipelineFixture::manual_with_config(encoder, config);

    let source = "magnet:?xt=urn:btih:invalid-data";
    let job_id = fixture.create_job(source).await;
    let run = fixture.spawn_run(job_id);

    // The whole file lands at once, so every index goes through catch-up
    // where invalid data counts against the budget.
    let session = fixture.session(source).await;
    fixture.resolve(&session);
    fixture.deliver(&session, SOURCE_BYTES);
    session.set_seeding(true);

    let report = timeout(Duration::from_secs(20), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(report.failed_indices, vec![4]);

    let job = fixture.store.get(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Ready);
    assert!(job.playable);

    let attempts: Vec<_> = fixture
        .encoder
        .calls()
        .into_iter()
        .filter(|call| call.index == 4)
        .map(|call| call.started_at)
        .collect();
    assert_eq!(attempts.len(), 3);
    for pair in attempts.windows(2) {
        assert!(
            pair[1].duration_since(pair[0]) >= cooldown,
            "retry started {:?} after the previous attempt",
            pair[1].duration_since(pair[0])
        );
    }
    assert!(
        !fixture
            .job_dir(job_id)
            .join("720p")
            .join("segment_004.ts")
            .exists()
    );
}

#[tokio::test]
async fn test_first_segment_failure_is_fatal() {
    let encoder = SimulatedEncoder::new().with_duration(Some(SOURCE_SECONDS));
    encoder.fail_index(0, 3, ScriptedFailure::Fatal);
    let fixture = PipelineFixture::fed(encoder);
    let job_id = fixture.create_job("magnet:?xt=urn:btih:fatal").await;

    let err = fixture.run(job_id).await.unwrap_err();
    assert!(matches!(err, PipelineError::EncoderFatal { index: 0, .. }));

    let job = fixture.store.get(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Error);
    assert!(!job.playable);
    assert_eq!(job.failure.unwrap().kind, "encoder_fatal");
    assert!(fixture.ctx.registry.is_empty().await);
}

#[tokio::test]
async fn test_metadata_timeout_releases_session() {
    let fixture = PipelineFixture::manual(SimulatedEncoder::new());
    let source = "magnet:?xt=urn:btih:silent";
    let job_id = fixture.create_job(source).await;
    let run = fixture.spawn_run(job_id);

    let session = fixture.session(source).await;
    session.set_swarm(0, 2, 0.0);

    let err = timeout(Duration::from_secs(10), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, PipelineError::MetadataTimeout { .. }));

    let job = fixture.store.get(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Error);
    let failure = job.failure.unwrap();
    assert_eq!(failure.kind, "metadata_timeout");
    assert_eq!(failure.diagnostics.unwrap().peers, 2);

    assert!(fixture.ctx.registry.is_empty().await);
    assert!(session.is_released());
}

#[tokio::test]
async fn test_unknown_duration_fails_job() {
    let fixture = PipelineFixture::fed(SimulatedEncoder::new().with_duration(None));
    let job_id = fixture.create_job("magnet:?xt=urn:btih:noduration").await;

    let err = fixture.run(job_id).await.unwrap_err();
    assert!(matches!(err, PipelineError::DurationUnavailable { .. }));
    assert_eq!(fixture.encoder.segment_invocations(), 0);

    let job = fixture.store.get(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Error);
    assert_eq!(job.failure.unwrap().kind, "duration_unavailable");
}

#[tokio::test]
async fn test_retryable_errors_wait_for_data() {
    let encoder = SimulatedEncoder::new().with_duration(Some(SOURCE_SECONDS));
    encoder.fail_index(2, 5, ScriptedFailure::InsufficientData);
    let fixture = PipelineFixture::manual(encoder);
    let source = "magnet:?xt=urn:btih:retry";
    let job_id = fixture.create_job(source).await;
    let run = fixture.spawn_run(job_id);

    let session = fixture.session(source).await;
    fixture.resolve(&session);
    fixture.deliver(&session, 40_000);

    // Five misses while downloading exceed max_retries, yet index 2 is not
    // given up: live retries for missing data are not counted.
    wait_until(async || fixture.encoder.invocations_for(2) >= 5).await;
    assert_eq!(fixture.encoder.invocations_for(3), 0);

    fixture.deliver(&session, SOURCE_BYTES);
    session.set_seeding(true);

    let report = timeout(Duration::from_secs(20), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(report.failed_indices.is_empty());
    assert!(fixture.job_dir(job_id).join("720p/segment_002.ts").is_file());
}

#[tokio::test]
async fn test_service_streams_to_ready() {
    let fixture = PipelineFixture::fed(SimulatedEncoder::new().with_duration(Some(SOURCE_SECONDS)));
    let service = StreamService::new(Arc::clone(&fixture.ctx));

    let outcome = service
        .start("tt0133093", "magnet:?xt=urn:btih:service")
        .await
        .unwrap();
    assert!(outcome.spawned);
    let job_id = outcome.job.id;

    wait_until(async || {
        service.status(job_id, false).await.unwrap().status == JobStatus::Ready
            && !service.is_active(job_id)
    })
    .await;

    let report = service.status(job_id, false).await.unwrap();
    assert!(report.playable);
    assert_eq!(report.problem, None);
    assert!(report.variants.values().all(|v| v.static_playlist));

    let master = service.master_manifest(job_id).await.unwrap();
    assert_eq!(master.matches("#EXT-X-STREAM-INF").count(), 4);

    let media = service.media_manifest(job_id, "360p").await.unwrap();
    assert!(media.ends_with("#EXT-X-ENDLIST\n"));
    assert!(media.contains(&format!(
        "{}/segments/360p/vod_009.ts",
        service.base_url(job_id)
    )));

    // A finished job is not restarted.
    let again = service
        .start("tt0133093", "magnet:?xt=urn:btih:service")
        .await
        .unwrap();
    assert!(!again.spawned);
    assert_eq!(fixture.backend.attach_count(), 1);
}

proptest! {
    #[test]
    fn prop_gating_is_monotonic(
        duration in 1.0f64..10_000.0,
        segment in 1u64..30,
        margin in 0.0f64..10.0,
        progress in 0.0f64..100.0,
    ) {
        let plan = SegmentPlan::new(Duration::from_secs(segment), duration, margin);
        let mut previous_ready = true;
        for index in 0..plan.segment_count() {
            let ready = plan.is_ready(index, progress, false);
            if ready {
                prop_assert!(progress >= plan.required_progress(index) + margin);
            }
            // Once an index is gated, every later index is too.
            prop_assert!(previous_ready || !ready);
            previous_ready = ready;
            prop_assert!(plan.is_ready(index, progress, true));
        }
    }

    #[test]
    fn prop_media_manifest_is_sorted(indices in prop::collection::hash_set(0u32..500, 1..40)) {
        let store = InMemorySegmentStore::new();
        for index in &indices {
            store.insert("720p", *index);
        }
        let builder = ManifestBuilder::new(Rendition::default_ladder(), Duration::from_secs(10));
        let media = builder
            .media(&store, "720p", JobStatus::DownloadingAndTranscoding, "/j")
            .unwrap();

        let listed: Vec<u32> = media
            .lines()
            .filter_map(|line| line.strip_prefix("/j/segments/720p/segment_"))
            .filter_map(|rest| rest.strip_suffix(".ts"))
            .map(|n| n.parse().unwrap())
            .collect();
        let mut expected: Vec<u32> = indices.into_iter().collect();
        expected.sort_unstable();
        prop_assert_eq!(listed, expected);
    }
}
