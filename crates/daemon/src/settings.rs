//! Shared processing-agent setting.
//!
//! Jobs snapshot the agent when they are dispatched; a settings change is
//! persisted first and then swapped in, so in-flight jobs keep the profile
//! they already resolved.

use crate::config::{AgentSettings, ConfigError, ProcessingAgent};
use parking_lot::RwLock;
use std::path::PathBuf;
use tracing::info;

/// Current processing agent plus the file it is persisted to
#[derive(Debug)]
pub struct AgentStore {
    path: Option<PathBuf>,
    current: RwLock<ProcessingAgent>,
}

impl AgentStore {
    /// Load from the settings file (missing file = CPU agent).
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let settings = AgentSettings::load(&path)?;
        Ok(Self {
            path: Some(path),
            current: RwLock::new(settings.processing_agent),
        })
    }

    /// In-memory store that never touches disk
    pub fn in_memory(agent: ProcessingAgent) -> Self {
        Self {
            path: None,
            current: RwLock::new(agent),
        }
    }

    /// Copy of the current agent
    pub fn snapshot(&self) -> ProcessingAgent {
        self.current.read().clone()
    }

    /// Persist `agent`, then make it current.
    pub fn update(&self, agent: ProcessingAgent) -> Result<(), ConfigError> {
        if let Some(path) = &self.path {
            AgentSettings {
                processing_agent: agent.clone(),
            }
            .save(path)?;
        }
        info!(kind = ?agent.kind, vendor = %agent.vendor, model = %agent.model, "Processing agent updated");
        *self.current.write() = agent;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GpuVendor;

    #[test]
    fn test_update_persists_and_swaps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");

        let store = AgentStore::load(&path).unwrap();
        assert_eq!(store.snapshot(), ProcessingAgent::cpu());

        let before = store.snapshot();
        store
            .update(ProcessingAgent::gpu(GpuVendor::Amd, "RX 6800"))
            .unwrap();

        // earlier snapshots are unaffected
        assert_eq!(before, ProcessingAgent::cpu());
        assert_eq!(store.snapshot().vendor, GpuVendor::Amd);

        let reloaded = AgentStore::load(&path).unwrap();
        assert_eq!(reloaded.snapshot(), store.snapshot());
    }

    #[test]
    fn test_failed_persist_keeps_current() {
        let dir = tempfile::tempdir().unwrap();
        // a directory where the file should be makes the rename fail
        let path = dir.path().join("settings.toml");
        std::fs::create_dir_all(path.join("occupied")).unwrap();

        let store = AgentStore {
            path: Some(path),
            current: RwLock::new(ProcessingAgent::cpu()),
        };
        assert!(store
            .update(ProcessingAgent::gpu(GpuVendor::Nvidia, "RTX"))
            .is_err());
        assert_eq!(store.snapshot(), ProcessingAgent::cpu());
    }
}
