//! Publish Agent
//!
//! Background service that imports sources, publishes renditions through a
//! bounded job queue, runs live streams with sliding-window segment retention
//! and keeps the Node and local subscribers informed of every transition.

pub mod bus;
pub mod context;
pub mod daemon;
pub mod encode;
pub mod import;
pub mod layout;
pub mod live;
pub mod logging;
pub mod node;
pub mod publish;
pub mod server;
pub mod settings;
pub mod startup;
pub mod tracker;

#[cfg(test)]
mod testing;

pub use publish_agent_config as config;
pub use publish_agent_config::Config;
pub use bus::{BusMessage, StatusBus, StopReason, VideoEvent};
pub use daemon::{BusyVideos, Daemon, DaemonError};
pub use encode::{EncodeError, EncoderBackend, FfmpegBackend, OutputFormat, Resolution};
pub use import::{ImportError, ImportManager, ImportRequest};
pub use live::{LiveError, LiveSessions, StreamSettings};
pub use node::{HttpNodeClient, NodeClient, NodeError};
pub use publish::{JobError, PublishError, PublishQueue, PublishTarget, QueueSnapshot};
pub use server::{create_router, run_server, ApiError, ServerError};
pub use startup::{run_startup_checks, StartupError};
pub use tokio_util::sync::CancellationToken;
pub use tracker::{Cancellation, TrackerError, Trackers};
