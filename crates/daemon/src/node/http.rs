//! reqwest-backed [`NodeClient`].

use super::{NodeClient, NodeError, VideoDetails, VideoStatus};
use crate::config::NodeConfig;
use crate::encode::{OutputFormat, Resolution, StillKind};
use crate::layout::segment_file_name;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

/// Node API over HTTP with bearer-token auth
#[derive(Debug, Clone)]
pub struct HttpNodeClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
    request_timeout: Duration,
    upload_timeout: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImportReply {
    video_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NextSegmentReply {
    next_expected_segment_index: u64,
}

#[derive(Debug, Deserialize)]
struct BandwidthReply {
    bandwidth: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LengthsBody<'a> {
    length_seconds: f64,
    length_timestamp: &'a str,
}

/// Fail on `{"isError": true}` replies, then decode the rest.
pub(crate) fn decode_reply<R: DeserializeOwned>(value: serde_json::Value) -> Result<R, NodeError> {
    if value.get("isError").and_then(|v| v.as_bool()).unwrap_or(false) {
        let message = value
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("unspecified error")
            .to_string();
        return Err(NodeError::Status {
            status: 200,
            message,
        });
    }
    serde_json::from_value(value).map_err(|e| NodeError::Decode(e.to_string()))
}

fn mime_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("m3u8") => "application/vnd.apple.mpegurl",
        Some("ts") => "video/mp2t",
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        Some("ogv") => "video/ogg",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        _ => "application/octet-stream",
    }
}

async fn file_part(path: &Path) -> Result<Part, NodeError> {
    let file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
    Ok(Part::stream_with_length(body, len)
        .file_name(name)
        .mime_str(mime_for(path))?)
}

impl HttpNodeClient {
    pub fn new(config: &NodeConfig) -> Result<Self, NodeError> {
        // timeouts are per request; uploads get their own
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            upload_timeout: Duration::from_secs(config.upload_timeout_secs),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send<R: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<R, NodeError> {
        let response = request.bearer_auth(&self.token).send().await?;
        let status = response.status();

        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "Node request failed: {}", message);
            return Err(NodeError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| NodeError::Decode(e.to_string()))?;
        decode_reply(value)
    }

    async fn post_json<B: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, NodeError> {
        debug!(path, "POST");
        self.send(self.json_request(Method::POST, path).json(body)).await
    }

    async fn get_json<R: DeserializeOwned>(&self, path: &str) -> Result<R, NodeError> {
        debug!(path, "GET");
        self.send(self.json_request(Method::GET, path)).await
    }

    fn json_request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, self.url(path))
            .timeout(self.request_timeout)
    }

    fn upload_request(&self, path: &str) -> reqwest::RequestBuilder {
        self.client.post(self.url(path)).timeout(self.upload_timeout)
    }

    async fn post_files(&self, path: &str, field: &str, files: &[&Path]) -> Result<(), NodeError> {
        let mut form = Form::new();
        for file in files {
            form = form.part(field.to_string(), file_part(file).await?);
        }
        debug!(path, count = files.len(), "Uploading");
        let _: serde_json::Value = self
            .send(self.upload_request(path).multipart(form))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl NodeClient for HttpNodeClient {
    async fn import_video(&self, details: &VideoDetails) -> Result<String, NodeError> {
        let reply: ImportReply = self.post_json("/videos/import", details).await?;
        Ok(reply.video_id)
    }

    async fn set_source_extension(&self, video_id: &str, extension: &str) -> Result<(), NodeError> {
        let _: serde_json::Value = self
            .post_json(
                &format!("/videos/{}/sourceFileExtension", video_id),
                &json!({ "sourceFileExtension": extension }),
            )
            .await?;
        Ok(())
    }

    async fn set_lengths(&self, video_id: &str, seconds: f64, timestamp: &str) -> Result<(), NodeError> {
        let body = LengthsBody {
            length_seconds: seconds,
            length_timestamp: timestamp,
        };
        let _: serde_json::Value = self
            .post_json(&format!("/videos/{}/lengths", video_id), &body)
            .await?;
        Ok(())
    }

    async fn set_status(&self, video_id: &str, status: VideoStatus) -> Result<(), NodeError> {
        let _: serde_json::Value = self
            .post_json(&format!("/videos/{}/{}", video_id, status.as_str()), &json!({}))
            .await?;
        Ok(())
    }

    async fn upload_adaptive(
        &self,
        video_id: &str,
        format: OutputFormat,
        resolution: Resolution,
        manifest: &Path,
        segments: &[PathBuf],
    ) -> Result<(), NodeError> {
        let mut files: Vec<&Path> = Vec::with_capacity(segments.len() + 1);
        files.push(manifest);
        files.extend(segments.iter().map(PathBuf::as_path));

        self.post_files(
            &format!("/videos/{}/adaptive/{}/{}/upload", video_id, format, resolution),
            "video_files",
            &files,
        )
        .await
    }

    async fn upload_progressive(
        &self,
        video_id: &str,
        format: OutputFormat,
        resolution: Resolution,
        file: &Path,
    ) -> Result<(), NodeError> {
        self.post_files(
            &format!("/videos/{}/progressive/{}/{}/upload", video_id, format, resolution),
            "video_file",
            &[file],
        )
        .await
    }

    async fn upload_still(&self, video_id: &str, kind: StillKind, file: &Path) -> Result<(), NodeError> {
        self.post_files(
            &format!("/videos/{}/{}", video_id, kind.as_str()),
            &format!("{}_file", kind.as_str()),
            &[file],
        )
        .await
    }

    async fn next_expected_segment_index(
        &self,
        video_id: &str,
        format: OutputFormat,
        resolution: Resolution,
    ) -> Result<u64, NodeError> {
        let reply: NextSegmentReply = self
            .get_json(&format!(
                "/videos/{}/adaptive/{}/{}/segments/nextExpectedSegmentIndex",
                video_id, format, resolution
            ))
            .await?;
        Ok(reply.next_expected_segment_index)
    }

    async fn bandwidth(&self, video_id: &str) -> Result<u64, NodeError> {
        let reply: BandwidthReply = self.get_json(&format!("/videos/{}/bandwidth", video_id)).await?;
        Ok(reply.bandwidth)
    }

    async fn remove_segment(
        &self,
        video_id: &str,
        format: OutputFormat,
        resolution: Resolution,
        index: u64,
    ) -> Result<(), NodeError> {
        let _: serde_json::Value = self
            .post_json(
                &format!("/videos/{}/adaptive/{}/{}/segments/remove", video_id, format, resolution),
                &json!({ "segmentName": segment_file_name(resolution, index) }),
            )
            .await?;
        Ok(())
    }
}
