//! Local HTTP surface for the publish agent
//!
//! Exposes the import, publish and stream operations to the hosting layer, and
//! forwards every bus event to WebSocket subscribers on `/events`.

use crate::daemon::{BusyVideos, Daemon, DaemonError};
use crate::import::{ImportError, ImportRequest};
use crate::live::{LiveError, StreamSettings};
use crate::publish::{PublishError, PublishTarget, QueueSnapshot};
use crate::config::ProcessingAgent;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{body::Body, Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Errors that can occur when running the server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Server failed: {0}")]
    Serve(#[from] std::io::Error),
}

/// An operation failure as an HTTP response
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

fn status_for(error: &DaemonError) -> StatusCode {
    match error {
        DaemonError::Profile(_) => StatusCode::BAD_REQUEST,
        DaemonError::Node(_) => StatusCode::BAD_GATEWAY,
        DaemonError::Publish(e) => match e {
            PublishError::NoTargets
            | PublishError::InvalidVideoId(_)
            | PublishError::InvalidExtension(_) => StatusCode::BAD_REQUEST,
            PublishError::Duplicate { .. }
            | PublishError::Tracker(_)
            | PublishError::Finalizing(_) => StatusCode::CONFLICT,
            PublishError::NotPublishing(_) => StatusCode::NOT_FOUND,
            PublishError::Node(_) => StatusCode::BAD_GATEWAY,
        },
        DaemonError::Live(e) => match e {
            LiveError::Tracker(_) => StatusCode::CONFLICT,
            LiveError::Profile(_) | LiveError::InvalidVideoId(_) => StatusCode::BAD_REQUEST,
            LiveError::NotStreaming(_) => StatusCode::NOT_FOUND,
            LiveError::Node(_) => StatusCode::BAD_GATEWAY,
            LiveError::Encode(_) | LiveError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        },
        DaemonError::Import(e) => match e {
            ImportError::InvalidExtension(_) | ImportError::Transfer(_) => StatusCode::BAD_REQUEST,
            ImportError::Tracker(_) | ImportError::Cancelled(_) => StatusCode::CONFLICT,
            ImportError::NotImporting(_) => StatusCode::NOT_FOUND,
            ImportError::Node(_) | ImportError::InvalidVideoId(_) => StatusCode::BAD_GATEWAY,
            ImportError::Probe(_) | ImportError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        },
        DaemonError::Config(_) | DaemonError::Startup(_) | DaemonError::Server(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl From<DaemonError> for ApiError {
    fn from(error: DaemonError) -> Self {
        let status = status_for(&error);
        if status.is_server_error() {
            warn!("Request failed: {}", error);
        } else {
            debug!("Request rejected: {}", error);
        }
        Self::new(status, error.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
struct ImportQuery {
    title: String,
    extension: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImportResponse {
    video_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishRequest {
    source_extension: String,
    jobs: Vec<PublishTarget>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    job_ids: Vec<Uuid>,
}

/// POST /videos/import
async fn start_import(
    State(daemon): State<Arc<Daemon>>,
    Query(query): Query<ImportQuery>,
    headers: HeaderMap,
    body: Body,
) -> ApiResult<Json<ImportResponse>> {
    let total_bytes = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or_else(|| ApiError::new(StatusCode::LENGTH_REQUIRED, "Content-Length required"))?;

    let request = ImportRequest {
        title: query.title,
        description: query.description,
        tags: Vec::new(),
        extension: query.extension,
        total_bytes,
    };
    let video_id = daemon
        .start_import(request, body.into_data_stream())
        .await?;
    Ok(Json(ImportResponse { video_id }))
}

/// POST /videos/:id/import/stop
async fn stop_import(State(daemon): State<Arc<Daemon>>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    daemon.stop_import(&id)?;
    Ok(StatusCode::ACCEPTED)
}

/// POST /videos/:id/publish
async fn start_publish(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<String>,
    Json(request): Json<PublishRequest>,
) -> ApiResult<(StatusCode, Json<PublishResponse>)> {
    let job_ids = daemon
        .start_publish(&id, &request.source_extension, &request.jobs)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(PublishResponse { job_ids })))
}

/// POST /videos/:id/publish/stop
async fn stop_publish(State(daemon): State<Arc<Daemon>>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    daemon.stop_publish(&id)?;
    Ok(StatusCode::ACCEPTED)
}

/// POST /videos/:id/stream/start
async fn start_stream(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<String>,
    Json(settings): Json<StreamSettings>,
) -> ApiResult<StatusCode> {
    daemon.start_stream(&id, settings).await?;
    Ok(StatusCode::ACCEPTED)
}

/// POST /videos/:id/stream/stop
async fn stop_stream(State(daemon): State<Arc<Daemon>>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    daemon.stop_stream(&id)?;
    Ok(StatusCode::ACCEPTED)
}

async fn busy_videos(State(daemon): State<Arc<Daemon>>) -> Json<BusyVideos> {
    Json(daemon.busy_videos())
}

async fn queue(State(daemon): State<Arc<Daemon>>) -> Json<QueueSnapshot> {
    Json(daemon.queue_snapshot())
}

async fn get_agent(State(daemon): State<Arc<Daemon>>) -> Json<ProcessingAgent> {
    Json(daemon.agent())
}

async fn put_agent(
    State(daemon): State<Arc<Daemon>>,
    Json(agent): Json<ProcessingAgent>,
) -> ApiResult<Json<ProcessingAgent>> {
    daemon.update_agent(agent)?;
    Ok(Json(daemon.agent()))
}

/// GET /events
async fn events(State(daemon): State<Arc<Daemon>>, ws: WebSocketUpgrade) -> Response {
    let rx = daemon.subscribe();
    ws.on_upgrade(move |socket| forward_events(socket, rx))
}

async fn forward_events(mut socket: WebSocket, mut rx: broadcast::Receiver<crate::bus::BusMessage>) {
    debug!("Event subscriber connected");
    loop {
        tokio::select! {
            message = rx.recv() => match message {
                Ok(message) => {
                    let text = match serde_json::to_string(&message.event) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Failed to encode event: {}", e);
                            continue;
                        }
                    };
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event subscriber lagging");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            inbound = socket.recv() => match inbound {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    debug!("Event subscriber disconnected");
}

/// Creates the axum Router with every local route
pub fn create_router(daemon: Arc<Daemon>) -> Router {
    Router::new()
        .route("/videos/import", post(start_import))
        .route("/videos/busy", get(busy_videos))
        .route("/videos/:id/import/stop", post(stop_import))
        .route("/videos/:id/publish", post(start_publish))
        .route("/videos/:id/publish/stop", post(stop_publish))
        .route("/videos/:id/stream/start", post(start_stream))
        .route("/videos/:id/stream/stop", post(stop_stream))
        .route("/queue", get(queue))
        .route("/settings/agent", get(get_agent).put(put_agent))
        .route("/events", get(events))
        .layer(DefaultBodyLimit::disable())
        .with_state(daemon)
}

/// Runs the local server on `bind` until `shutdown` is cancelled
pub async fn run_server(
    bind: &str,
    daemon: Arc<Daemon>,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let app = create_router(daemon);

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|source| ServerError::Bind {
            addr: bind.to_string(),
            source,
        })?;
    info!(addr = %bind, "Local server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, GpuVendor};
    use crate::settings::AgentStore;
    use crate::testing::{FakeBackend, FakeNode};
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn app(root: &std::path::Path) -> Router {
        let mut config = Config::default();
        config.storage.videos_root = root.to_path_buf();
        let daemon = Daemon::from_parts(
            config,
            FakeBackend::auto(),
            FakeNode::new(),
            AgentStore::in_memory(ProcessingAgent::cpu()),
        );
        create_router(Arc::new(daemon))
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_busy_videos_empty() {
        let dir = tempfile::tempdir().unwrap();
        let response = app(dir.path())
            .oneshot(Request::builder().uri("/videos/busy").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            json!({"importing": [], "publishing": [], "streaming": []})
        );
    }

    #[tokio::test]
    async fn test_publish_then_duplicate_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());
        let body = json!({
            "sourceExtension": "mp4",
            "jobs": [{"format": "m3u8", "resolution": "720p"}, {"format": "mp4", "resolution": "480p"}]
        });

        let response = app
            .clone()
            .oneshot(post_json("/videos/v1/publish", body.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(response).await["jobIds"].as_array().unwrap().len(), 2);

        let response = app
            .clone()
            .oneshot(post_json("/videos/v1/publish", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = app
            .oneshot(Request::builder().uri("/queue").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(response).await["pending"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_publish_rejects_unknown_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let body = json!({"sourceExtension": "mp4", "jobs": [{"format": "mp4", "resolution": "999p"}]});
        let response = app(dir.path())
            .oneshot(post_json("/videos/v1/publish", body))
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn test_escaping_video_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("videos");
        let outside = dir.path().join("outside/adaptive");
        std::fs::create_dir_all(&outside).unwrap();
        std::fs::write(outside.join("keep.txt"), b"keep").unwrap();
        let app = app(&root);

        let stream = json!({"rtmpPort": 1935, "resolution": "720p"});
        let response = app
            .clone()
            .oneshot(post_json("/videos/..%2Foutside/stream/start", stream))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let publish = json!({"sourceExtension": "mp4", "jobs": [{"format": "mp4", "resolution": "720p"}]});
        let response = app
            .clone()
            .oneshot(post_json("/videos/..%2Foutside/publish", publish))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let publish = json!({"sourceExtension": "../../x", "jobs": [{"format": "mp4", "resolution": "720p"}]});
        let response = app
            .clone()
            .oneshot(post_json("/videos/v1/publish", publish))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(Request::builder().uri("/videos/busy").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(
            body_json(response).await,
            json!({"importing": [], "publishing": [], "streaming": []})
        );
        assert!(outside.join("keep.txt").exists());
    }

    #[tokio::test]
    async fn test_stop_unknown_video_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());
        for uri in ["/videos/nope/publish/stop", "/videos/nope/stream/stop", "/videos/nope/import/stop"] {
            let response = app
                .clone()
                .oneshot(Request::builder().method("POST").uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{}", uri);
        }
    }

    #[tokio::test]
    async fn test_import_requires_length() {
        let dir = tempfile::tempdir().unwrap();
        let response = app(dir.path())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/videos/import?title=clip&extension=mp4")
                    .body(Body::from("abc"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::LENGTH_REQUIRED);
    }

    #[tokio::test]
    async fn test_import_stores_upload() {
        let dir = tempfile::tempdir().unwrap();
        let response = app(dir.path())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/videos/import?title=clip&extension=mp4")
                    .header(header::CONTENT_LENGTH, "5")
                    .body(Body::from("hello"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({"videoId": "imported-video"}));
        let stored = dir.path().join("imported-video/source/imported-video.mp4");
        assert_eq!(std::fs::read(stored).unwrap(), b"hello".to_vec());
    }

    #[tokio::test]
    async fn test_agent_settings_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());

        let request = Request::builder()
            .method("PUT")
            .uri("/settings/agent")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json!({"type": "gpu", "vendor": "", "model": "x"}).to_string()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let request = Request::builder()
            .method("PUT")
            .uri("/settings/agent")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json!({"type": "gpu", "vendor": "AMD", "model": "RX 7900"}).to_string()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::builder().uri("/settings/agent").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let agent: ProcessingAgent = serde_json::from_value(body_json(response).await).unwrap();
        assert_eq!(agent, ProcessingAgent::gpu(GpuVendor::Amd, "RX 7900"));
    }

    #[test]
    fn test_upstream_errors_map_to_bad_gateway() {
        let error = DaemonError::Publish(PublishError::Node(crate::node::NodeError::Status {
            status: 500,
            message: "down".to_string(),
        }));
        assert_eq!(ApiError::from(error).status(), StatusCode::BAD_GATEWAY);
    }
}
