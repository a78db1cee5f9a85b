//! Handles shared by the publish queue, live sessions and imports.

use crate::bus::StatusBus;
use crate::encode::EncoderBackend;
use crate::layout::VideoLayout;
use crate::node::NodeClient;
use crate::settings::AgentStore;
use crate::tracker::Trackers;
use std::sync::Arc;

#[derive(Clone)]
pub struct Context {
    pub backend: Arc<dyn EncoderBackend>,
    pub node: Arc<dyn NodeClient>,
    pub bus: Arc<StatusBus>,
    pub trackers: Arc<Trackers>,
    pub layout: VideoLayout,
    pub agent: Arc<AgentStore>,
}
