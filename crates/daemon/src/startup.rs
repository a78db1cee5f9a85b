//! Startup checks for the publish agent
//!
//! Preflight checks run before the daemon starts:
//! - FFmpeg is runnable and recent enough (5.0+)
//! - FFprobe is runnable
//! - The configured GPU agent's encoders are compiled into FFmpeg
//! - The videos root exists or can be created

use crate::config::{AgentKind, Config, ProcessingAgent};
use crate::encode::profile::strategy_for;
use crate::encode::{OutputFormat, ProfileError};
use std::path::Path;
use std::process::Command;
use thiserror::Error;

/// Oldest FFmpeg major version with the HLS and RTMP listen options we pass
pub const MIN_FFMPEG_MAJOR: u32 = 5;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("FFmpeg version requirement not met: {0}")]
    FfmpegVersion(String),

    #[error("FFprobe not available: {0}")]
    FfprobeUnavailable(String),

    #[error("Encoder '{encoder}' required by the {vendor} agent is not available in FFmpeg")]
    EncoderMissing { encoder: String, vendor: String },

    #[error("Processing agent is not usable: {0}")]
    Agent(#[from] ProfileError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parse FFmpeg version string and extract major version number
///
/// Handles standard (`ffmpeg version 6.1 ...`) and n-prefixed
/// (`ffmpeg version n6.1-...`) formats.
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    let version_part = version_line
        .to_lowercase()
        .split("ffmpeg version")
        .nth(1)?
        .split_whitespace()
        .next()?
        .to_string();

    let version_str = version_part.trim_start_matches('n');
    let major_str = version_str.split(|c| c == '.' || c == '-').next()?;

    major_str.parse().ok()
}

/// Whether `ffmpeg -encoders` output lists `encoder`
pub fn encoder_listed(encoders_output: &str, encoder: &str) -> bool {
    encoders_output
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|name| name == encoder)
}

/// Video encoders a GPU agent needs beyond the software ones.
///
/// Empty for a CPU agent.
pub fn required_gpu_encoders(agent: &ProcessingAgent) -> Result<Vec<&'static str>, StartupError> {
    if agent.kind == AgentKind::Cpu {
        return Ok(Vec::new());
    }

    let mut encoders = Vec::new();
    for format in OutputFormat::ALL {
        let codec = strategy_for(format, agent)?.video_codec;
        if (codec.ends_with("_nvenc") || codec.ends_with("_amf")) && !encoders.contains(&codec) {
            encoders.push(codec);
        }
    }
    Ok(encoders)
}

fn run_stdout(binary: &Path, args: &[&str]) -> Result<String, std::io::Error> {
    let output = Command::new(binary).args(args).output()?;
    if !output.status.success() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("{} {} exited with {}", binary.display(), args.join(" "), output.status),
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Check that FFmpeg runs and is at least [`MIN_FFMPEG_MAJOR`]
pub fn check_ffmpeg_version(ffmpeg: &Path) -> Result<u32, StartupError> {
    let version_output = run_stdout(ffmpeg, &["-version"]).map_err(|e| {
        StartupError::FfmpegVersion(format!("Failed to run {} -version: {}", ffmpeg.display(), e))
    })?;

    let major_version = parse_ffmpeg_version(&version_output).ok_or_else(|| {
        StartupError::FfmpegVersion(format!(
            "Could not parse FFmpeg version from output: {}",
            version_output.lines().next().unwrap_or("(empty)")
        ))
    })?;

    if major_version < MIN_FFMPEG_MAJOR {
        return Err(StartupError::FfmpegVersion(format!(
            "FFmpeg {}.x or newer required, got: {}",
            MIN_FFMPEG_MAJOR, major_version
        )));
    }

    Ok(major_version)
}

/// Check that FFprobe runs
pub fn check_ffprobe_available(ffprobe: &Path) -> Result<(), StartupError> {
    run_stdout(ffprobe, &["-version"])
        .map(|_| ())
        .map_err(|e| StartupError::FfprobeUnavailable(format!("{}: {}", ffprobe.display(), e)))
}

/// Check that every encoder the agent needs is compiled into FFmpeg
pub fn check_agent_encoders(ffmpeg: &Path, agent: &ProcessingAgent) -> Result<(), StartupError> {
    let required = required_gpu_encoders(agent)?;
    if required.is_empty() {
        return Ok(());
    }

    let encoders = run_stdout(ffmpeg, &["-hide_banner", "-encoders"]).map_err(|e| {
        StartupError::FfmpegVersion(format!("Failed to list FFmpeg encoders: {}", e))
    })?;
    for encoder in required {
        if !encoder_listed(&encoders, encoder) {
            return Err(StartupError::EncoderMissing {
                encoder: encoder.to_string(),
                vendor: agent.vendor.to_string(),
            });
        }
    }
    Ok(())
}

/// Run all startup checks in order
///
/// 1. Videos root
/// 2. FFmpeg version
/// 3. FFprobe availability
/// 4. Agent encoders
pub fn run_startup_checks(cfg: &Config, agent: &ProcessingAgent) -> Result<(), StartupError> {
    std::fs::create_dir_all(&cfg.storage.videos_root)?;
    check_ffmpeg_version(&cfg.storage.ffmpeg_path)?;
    check_ffprobe_available(&cfg.storage.ffprobe_path)?;
    check_agent_encoders(&cfg.storage.ffmpeg_path, agent)?;
    Ok(())
}
