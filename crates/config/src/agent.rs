//! Processing-agent settings: which hardware the encoder may use.

use crate::config::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;

/// Kind of processing agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    #[default]
    Cpu,
    Gpu,
}

/// GPU vendor; empty for CPU agents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum GpuVendor {
    #[default]
    #[serde(rename = "")]
    None,
    #[serde(rename = "NVIDIA")]
    Nvidia,
    #[serde(rename = "AMD")]
    Amd,
}

impl std::fmt::Display for GpuVendor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GpuVendor::None => write!(f, ""),
            GpuVendor::Nvidia => write!(f, "NVIDIA"),
            GpuVendor::Amd => write!(f, "AMD"),
        }
    }
}

/// The local hardware encoding capability profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProcessingAgent {
    #[serde(rename = "type", default)]
    pub kind: AgentKind,
    #[serde(default)]
    pub vendor: GpuVendor,
    #[serde(default)]
    pub model: String,
}

impl ProcessingAgent {
    pub fn cpu() -> Self {
        Self::default()
    }

    pub fn gpu(vendor: GpuVendor, model: impl Into<String>) -> Self {
        Self {
            kind: AgentKind::Gpu,
            vendor,
            model: model.into(),
        }
    }
}

/// On-disk layout of the settings file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AgentSettings {
    #[serde(default)]
    pub processing_agent: ProcessingAgent,
}

impl AgentSettings {
    /// Load settings; a missing file yields the default CPU agent.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(toml::from_str(&content)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist settings by writing a sibling temp file and renaming it over the target.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = toml::to_string(self)?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_cpu_agent() {
        let dir = tempfile::tempdir().unwrap();
        let settings = AgentSettings::load(dir.path().join("settings.toml")).unwrap();
        assert_eq!(settings.processing_agent, ProcessingAgent::cpu());
        assert_eq!(settings.processing_agent.vendor, GpuVendor::None);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.toml");

        let settings = AgentSettings {
            processing_agent: ProcessingAgent::gpu(GpuVendor::Nvidia, "RTX 3060"),
        };
        settings.save(&path).unwrap();

        let loaded = AgentSettings::load(&path).unwrap();
        assert_eq!(loaded, settings);
        assert!(!path.with_extension("toml.tmp").exists());
    }

    #[test]
    fn test_parses_vendor_strings() {
        let content = r#"
[processing_agent]
type = "gpu"
vendor = "AMD"
model = "RX 7900"
"#;
        let settings: AgentSettings = toml::from_str(content).unwrap();
        assert_eq!(settings.processing_agent.kind, AgentKind::Gpu);
        assert_eq!(settings.processing_agent.vendor, GpuVendor::Amd);

        let cpu: AgentSettings = toml::from_str("[processing_agent]\ntype = \"cpu\"\nvendor = \"\"\n").unwrap();
        assert_eq!(cpu.processing_agent, ProcessingAgent::cpu());
    }

    #[test]
    fn test_rejects_unknown_vendor() {
        let content = "[processing_agent]\ntype = \"gpu\"\nvendor = \"Intel\"\n";
        assert!(toml::from_str::<AgentSettings>(content).is_err());
    }
}
