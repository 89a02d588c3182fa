//! Router tests driven through `tower::ServiceExt::oneshot`.

use std::sync::Arc;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, StatusCode, header};
use serde_json::Value;
use swarmcast_core::config::SwarmcastConfig;
use swarmcast_core::jobs::{InMemoryJobStore, JobId, JobStatus, JobStore, JobUpdate};
use swarmcast_core::pipeline::PipelineContext;
use swarmcast_core::session::SessionRegistry;
use swarmcast_core::simulation::{SimulatedBackend, SimulatedEncoder};
use swarmcast_core::StreamService;
use swarmcast_web::{AppState, router};
use tower::ServiceExt;

struct ApiFixture {
    app: Router,
    ctx: Arc<PipelineContext>,
    store: Arc<InMemoryJobStore>,
    _media: tempfile::TempDir,
}

impl ApiFixture {
    fn new() -> Self {
        let media = tempfile::tempdir().unwrap();
        let mut config = SwarmcastConfig::for_testing();
        config.storage.media_root = media.path().to_path_buf();

        let store = Arc::new(InMemoryJobStore::new());
        let registry = Arc::new(SessionRegistry::new(
            Arc::new(SimulatedBackend::new()),
            config.session.clone(),
        ));
        let ctx = Arc::new(PipelineContext::new(
            config,
            store.clone(),
            registry,
            Arc::new(SimulatedEncoder::new()),
        ));
        let service = Arc::new(StreamService::new(Arc::clone(&ctx)));

        Self {
            app: router(AppState::new(service)),
            ctx,
            store,
            _media: media,
        }
    }

    async fn send(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Vec<u8>, Option<String>) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = self
            .app
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();

        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .map(|v| v.to_str().unwrap().to_string());
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, bytes.to_vec(), content_type)
    }

    async fn job(&self, external_id: &str) -> JobId {
        self.store
            .get_or_create(external_id, "magnet:?xt=urn:btih:api")
            .await
            .unwrap()
            .id
    }

    fn write_segment(&self, job_id: JobId, rendition: &str, index: u32) {
        let dir = self.ctx.job_dir(job_id).join(rendition);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(format!("segment_{index:03}.ts")), b"\x47segment-bytes").unwrap();
    }
}

fn json(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).unwrap()
}

#[tokio::test]
async fn test_start_validates_and_creates_job() {
    let api = ApiFixture::new();

    let (status, _, _) = api
        .send(
            Method::POST,
            "/api/jobs/start",
            Some(serde_json::json!({ "source": "", "external_id": "tt1" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body, _) = api
        .send(
            Method::POST,
            "/api/jobs/start",
            Some(serde_json::json!({ "source": "magnet:?xt=urn:btih:a", "external_id": "tt1" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let body = json(&body);
    assert_eq!(body["status"], "PENDING");
    assert_eq!(body["progress"], 0.0);
    assert!(body["id"].as_str().unwrap().parse::<JobId>().is_ok());
}

#[tokio::test]
async fn test_status_endpoint() {
    let api = ApiFixture::new();
    let job_id = api.job("tt2").await;
    api.write_segment(job_id, "720p", 0);

    let (status, body, _) = api
        .send(Method::GET, &format!("/api/jobs/{job_id}/status"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    let body = json(&body);
    assert_eq!(body["status"], "PENDING");
    assert_eq!(body["playable"], false);
    assert_eq!(body["variants"]["720p"]["segments"], 1);
    assert_eq!(body["variants"]["720p"]["static_playlist"], false);
    assert_eq!(body["swarm"]["seeds"], 0);
    assert!(body["problem"].is_null());

    let (status, _, _) = api
        .send(Method::GET, &format!("/api/jobs/{}/status", JobId::new()), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = api
        .send(Method::GET, "/api/jobs/not-a-uuid/status?cleanup=1", None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_playlist_pending_then_ready() {
    let api = ApiFixture::new();
    let job_id = api.job("tt3").await;
    let uri = format!("/api/jobs/{job_id}/playlist");

    let (status, body, _) = api.send(Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json(&body)["status"], "pending");
    let (status, _, _) = api.send(Method::HEAD, &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    api.write_segment(job_id, "720p", 1);
    api.write_segment(job_id, "720p", 0);

    let (status, _, _) = api.send(Method::HEAD, &uri, None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body, content_type) = api.send(Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type.as_deref(), Some("application/vnd.apple.mpegurl"));
    let master = String::from_utf8(body).unwrap();
    assert!(master.contains(&format!("/api/jobs/{job_id}/playlist?res=720p")));

    let (status, body, _) = api.send(Method::GET, &format!("{uri}?res=720p"), None).await;
    assert_eq!(status, StatusCode::OK);
    let media = String::from_utf8(body).unwrap();
    let first = media.find("segment_000.ts").unwrap();
    let second = media.find("segment_001.ts").unwrap();
    assert!(first < second);
    assert!(media.contains("#EXT-X-PLAYLIST-TYPE:EVENT"));

    let (status, _, _) = api.send(Method::GET, &format!("{uri}?res=4k"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    api.store
        .update(job_id, JobUpdate::status(JobStatus::Error))
        .await
        .unwrap();
    let (status, _, _) = api.send(Method::HEAD, &uri, None).await;
    assert_eq!(status, StatusCode::GONE);
}

#[tokio::test]
async fn test_segment_delivery() {
    let api = ApiFixture::new();
    let job_id = api.job("tt4").await;
    api.write_segment(job_id, "480p", 0);
    let base = format!("/api/jobs/{job_id}/segments");

    let (status, body, content_type) = api
        .send(Method::GET, &format!("{base}/480p/segment_000.ts"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type.as_deref(), Some("video/MP2T"));
    assert_eq!(body, b"\x47segment-bytes");

    let (status, _, _) = api
        .send(Method::GET, &format!("{base}/480p/segment_001.ts"), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = api
        .send(Method::GET, &format!("{base}/480p/..segment_000.ts"), None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_segment_range_request() {
    let api = ApiFixture::new();
    let job_id = api.job("tt5").await;
    api.write_segment(job_id, "360p", 2);

    let request = Request::builder()
        .uri(format!("/api/jobs/{job_id}/segments/360p/segment_002.ts"))
        .header(header::RANGE, "bytes=1-7")
        .body(Body::empty())
        .unwrap();
    let response = api.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"segment");
}

#[tokio::test]
async fn test_reset_endpoint() {
    let api = ApiFixture::new();
    let job_id = api.job("tt6").await;
    api.write_segment(job_id, "720p", 0);

    let (status, body, _) = api
        .send(Method::POST, &format!("/api/jobs/{job_id}/reset"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json(&body)["status"], "PENDING");
    assert!(!api.ctx.job_dir(job_id).exists());

    let (status, body, _) = api
        .send(
            Method::POST,
            "/api/jobs/start",
            Some(serde_json::json!({ "source": "magnet:?xt=urn:btih:b", "external_id": "tt7" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let active = json(&body)["id"].as_str().unwrap().to_string();

    let (status, _, _) = api
        .send(Method::POST, &format!("/api/jobs/{active}/reset"), None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
}
