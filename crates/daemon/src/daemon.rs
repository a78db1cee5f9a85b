//! Daemon startup and main loop for the publish agent
//!
//! Wires the publish queue, live sessions, imports, the status bus and the
//! Node link together, and exposes the operations the local surface calls.

use crate::bus::{BusMessage, StatusBus, VideoEvent};
use crate::config::{Config, ConfigError, ProcessingAgent};
use crate::context::Context;
use crate::encode::profile::strategy_for;
use crate::encode::{EncoderBackend, FfmpegBackend, OutputFormat, ProfileError};
use crate::import::{ImportError, ImportManager, ImportRequest};
use crate::layout::VideoLayout;
use crate::live::{LiveError, LiveSessions, StreamSettings};
use crate::node::{HttpNodeClient, NodeClient, NodeError, RealtimeLink};
use crate::publish::{PublishError, PublishQueue, PublishTarget, QueueSnapshot};
use crate::server::{run_server, ServerError};
use crate::settings::AgentStore;
use crate::startup::{run_startup_checks, StartupError};
use crate::tracker::Trackers;
use bytes::Bytes;
use futures::Stream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration or settings file error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    #[error("Unsupported processing agent: {0}")]
    Profile(#[from] ProfileError),

    #[error("Upstream error: {0}")]
    Node(#[from] NodeError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Live(#[from] LiveError),

    #[error(transparent)]
    Import(#[from] ImportError),

    /// Server error
    #[error("Server error: {0}")]
    Server(#[from] ServerError),
}

/// Active videos per activity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusyVideos {
    pub importing: Vec<String>,
    pub publishing: Vec<String>,
    pub streaming: Vec<String>,
}

/// Daemon state containing all runtime components
pub struct Daemon {
    /// Configuration loaded from file and environment
    pub config: Config,
    ctx: Context,
    queue: Arc<PublishQueue>,
    live: LiveSessions,
    imports: ImportManager,
    /// Taken by `run` for the realtime link
    upstream: Mutex<Option<mpsc::UnboundedReceiver<VideoEvent>>>,
}

impl Daemon {
    /// Initialize the daemon with configuration from file
    ///
    /// 1. Load config from file and apply environment overrides
    /// 2. Load the processing-agent settings
    /// 3. Run startup checks (videos root, ffmpeg, ffprobe, agent encoders)
    /// 4. Build the FFmpeg backend and Node client
    pub fn new<P: AsRef<Path>>(config_path: P) -> Result<Self, DaemonError> {
        let config = Config::load(config_path)?;
        Self::with_config(config)
    }

    /// Initialize the daemon with an existing configuration
    pub fn with_config(config: Config) -> Result<Self, DaemonError> {
        let agent = AgentStore::load(&config.storage.settings_path)?;
        run_startup_checks(&config, &agent.snapshot())?;

        let backend = Arc::new(FfmpegBackend::new(
            &config.storage.ffmpeg_path,
            &config.storage.ffprobe_path,
        ));
        let node = Arc::new(HttpNodeClient::new(&config.node)?);
        Ok(Self::from_parts(config, backend, node, agent))
    }

    /// Initialize the daemon without startup checks, from explicit seams
    pub fn from_parts(
        config: Config,
        backend: Arc<dyn EncoderBackend>,
        node: Arc<dyn NodeClient>,
        agent: AgentStore,
    ) -> Self {
        let trackers = Arc::new(Trackers::new(Duration::from_secs(
            config.publish.tracker_retention_secs,
        )));
        let (bus, upstream) = StatusBus::new(trackers.clone());
        let ctx = Context {
            backend,
            node,
            bus: Arc::new(bus),
            trackers,
            layout: VideoLayout::new(&config.storage.videos_root),
            agent: Arc::new(agent),
        };

        let queue = PublishQueue::new(ctx.clone(), config.publish.concurrency_cap.max(1) as usize);
        let live = LiveSessions::new(ctx.clone(), config.live.clone());
        let imports = ImportManager::new(
            ctx.clone(),
            Duration::from_millis(config.import.progress_interval_ms),
        );

        Self {
            config,
            ctx,
            queue,
            live,
            imports,
            upstream: Mutex::new(Some(upstream)),
        }
    }

    pub fn bus(&self) -> &Arc<StatusBus> {
        &self.ctx.bus
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.ctx.bus.subscribe()
    }

    pub fn queue(&self) -> &Arc<PublishQueue> {
        &self.queue
    }

    /// Import a new source; returns the Node-assigned video id.
    pub async fn start_import<S, E>(&self, request: ImportRequest, body: S) -> Result<String, DaemonError>
    where
        S: Stream<Item = Result<Bytes, E>> + Send,
        E: Display + Send,
    {
        Ok(self.imports.import(request, body).await?)
    }

    pub fn stop_import(&self, video_id: &str) -> Result<(), DaemonError> {
        Ok(self.imports.stop(video_id)?)
    }

    /// Queue one job per target; returns the job ids.
    pub async fn start_publish(
        &self,
        video_id: &str,
        source_extension: &str,
        targets: &[PublishTarget],
    ) -> Result<Vec<Uuid>, DaemonError> {
        Ok(self
            .queue
            .start_publish(video_id, source_extension, targets)
            .await?)
    }

    pub fn stop_publish(&self, video_id: &str) -> Result<(), DaemonError> {
        Ok(self.queue.stop_publish(video_id)?)
    }

    pub async fn start_stream(&self, video_id: &str, settings: StreamSettings) -> Result<(), DaemonError> {
        Ok(self.live.start(video_id, settings).await?)
    }

    pub fn stop_stream(&self, video_id: &str) -> Result<(), DaemonError> {
        Ok(self.live.stop(video_id)?)
    }

    pub fn busy_videos(&self) -> BusyVideos {
        let trackers = &self.ctx.trackers;
        BusyVideos {
            importing: trackers.imports.active_ids(),
            publishing: trackers.encoding.active_ids(),
            streaming: trackers.streams.active_ids(),
        }
    }

    pub fn queue_snapshot(&self) -> QueueSnapshot {
        self.queue.snapshot()
    }

    pub fn agent(&self) -> ProcessingAgent {
        self.ctx.agent.snapshot()
    }

    /// Persist and switch the processing agent. Jobs already dispatched keep
    /// the agent they resolved with.
    pub fn update_agent(&self, agent: ProcessingAgent) -> Result<(), DaemonError> {
        strategy_for(OutputFormat::Segmented, &agent)?;
        self.ctx.agent.update(agent)?;
        Ok(())
    }

    /// Run the dispatcher, the realtime link and the local server until
    /// `shutdown` is cancelled or the server fails.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<(), DaemonError> {
        let dispatcher = tokio::spawn(self.queue.clone().run(
            Duration::from_millis(self.config.publish.dispatch_interval_ms),
            shutdown.clone(),
        ));

        let link = match self.upstream.lock().take() {
            Some(upstream) => Some(tokio::spawn(RealtimeLink::new(&self.config.node).run(
                upstream,
                self.ctx.bus.clone(),
                shutdown.clone(),
            ))),
            None => {
                warn!("Realtime link already started");
                None
            }
        };

        info!(bind = %self.config.server.bind, "Publish agent running");
        let result = run_server(&self.config.server.bind, self.clone(), shutdown.clone()).await;

        shutdown.cancel();
        let stopped = self.ctx.trackers.stop_all();
        if stopped > 0 {
            info!(stopped, "Stopped active work on shutdown");
        }
        let _ = dispatcher.await;
        if let Some(link) = link {
            let _ = link.await;
        }

        result.map_err(DaemonError::from)
    }
}
