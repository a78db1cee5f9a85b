//! Encoding profile resolution
//!
//! Maps a (resolution, output format, processing agent) triple to the ordered
//! encoder argument list. Format/agent branching goes through a strategy table
//! keyed by `(format, agent kind, vendor)`.

use crate::config::{AgentKind, GpuVendor, ProcessingAgent};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// GOP size for segmented output
const SEGMENTED_GOP: &str = "48";

/// Segment length for on-demand segmented output
const VOD_SEGMENT_SECS: u32 = 6;

/// Error type for profile resolution
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProfileError {
    #[error("Unsupported profile: {0}")]
    Unsupported(String),
}

/// Delivery container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OutputFormat {
    #[serde(rename = "m3u8")]
    Segmented,
    #[serde(rename = "mp4")]
    Mp4,
    #[serde(rename = "webm")]
    Webm,
    #[serde(rename = "ogv")]
    Ogv,
}

impl OutputFormat {
    pub const ALL: [OutputFormat; 4] = [
        OutputFormat::Segmented,
        OutputFormat::Mp4,
        OutputFormat::Webm,
        OutputFormat::Ogv,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Segmented => "m3u8",
            OutputFormat::Mp4 => "mp4",
            OutputFormat::Webm => "webm",
            OutputFormat::Ogv => "ogv",
        }
    }

    /// Whether this format produces a manifest plus segments
    pub fn is_segmented(&self) -> bool {
        matches!(self, OutputFormat::Segmented)
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = ProfileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OutputFormat::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| ProfileError::Unsupported(format!("unknown format '{}'", s)))
    }
}

/// Target resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Resolution {
    #[serde(rename = "240p")]
    P240,
    #[serde(rename = "360p")]
    P360,
    #[serde(rename = "480p")]
    P480,
    #[serde(rename = "720p")]
    P720,
    #[serde(rename = "1080p")]
    P1080,
    #[serde(rename = "1440p")]
    P1440,
    #[serde(rename = "2160p")]
    P2160,
}

/// Frame size and bitrates for one resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
    pub video_bitrate_kbps: u32,
    pub audio_bitrate_kbps: u32,
}

impl Resolution {
    pub const ALL: [Resolution; 7] = [
        Resolution::P240,
        Resolution::P360,
        Resolution::P480,
        Resolution::P720,
        Resolution::P1080,
        Resolution::P1440,
        Resolution::P2160,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::P240 => "240p",
            Resolution::P360 => "360p",
            Resolution::P480 => "480p",
            Resolution::P720 => "720p",
            Resolution::P1080 => "1080p",
            Resolution::P1440 => "1440p",
            Resolution::P2160 => "2160p",
        }
    }

    pub fn dimensions(&self) -> Dimensions {
        let (width, height, video_bitrate_kbps, audio_bitrate_kbps) = match self {
            Resolution::P240 => (426, 240, 700, 96),
            Resolution::P360 => (640, 360, 1000, 128),
            Resolution::P480 => (854, 480, 1500, 128),
            Resolution::P720 => (1280, 720, 3000, 192),
            Resolution::P1080 => (1920, 1080, 5000, 256),
            Resolution::P1440 => (2560, 1440, 8000, 256),
            Resolution::P2160 => (3840, 2160, 10000, 256),
        };
        Dimensions {
            width,
            height,
            video_bitrate_kbps,
            audio_bitrate_kbps,
        }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = ProfileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Resolution::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| ProfileError::Unsupported(format!("unknown resolution '{}'", s)))
    }
}

/// How frames are scaled to the target size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scaler {
    /// Software scale + pad
    Cpu,
    /// CUDA scaling, frames stay on the device
    Cuda,
    /// Frames are downloaded for software scaling and uploaded again for the encoder
    HwRoundTrip,
}

/// Encoder template for one `(format, agent kind, vendor)` combination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Strategy {
    pub video_codec: &'static str,
    pub audio_codec: &'static str,
    pub scaler: Scaler,
    pub input_args: &'static [&'static str],
}

const CPU_H264: Strategy = Strategy {
    video_codec: "libx264",
    audio_codec: "aac",
    scaler: Scaler::Cpu,
    input_args: &[],
};

const NVIDIA_H264: Strategy = Strategy {
    video_codec: "h264_nvenc",
    audio_codec: "aac",
    scaler: Scaler::Cuda,
    input_args: &["-hwaccel", "cuda", "-hwaccel_output_format", "cuda"],
};

const AMD_H264: Strategy = Strategy {
    video_codec: "h264_amf",
    audio_codec: "aac",
    scaler: Scaler::HwRoundTrip,
    input_args: &["-hwaccel", "d3d11va", "-hwaccel_output_format", "d3d11"],
};

const CPU_VP9: Strategy = Strategy {
    video_codec: "libvpx-vp9",
    audio_codec: "libopus",
    scaler: Scaler::Cpu,
    input_args: &[],
};

const CPU_THEORA: Strategy = Strategy {
    video_codec: "libtheora",
    audio_codec: "libvorbis",
    scaler: Scaler::Cpu,
    input_args: &[],
};

type StrategyKey = (OutputFormat, AgentKind, GpuVendor);

/// Every supported combination. CPU agents are looked up with `GpuVendor::None`;
/// a GPU agent without a vendor has no entry.
const STRATEGIES: &[(StrategyKey, Strategy)] = &[
    ((OutputFormat::Segmented, AgentKind::Cpu, GpuVendor::None), CPU_H264),
    ((OutputFormat::Segmented, AgentKind::Gpu, GpuVendor::Nvidia), NVIDIA_H264),
    ((OutputFormat::Segmented, AgentKind::Gpu, GpuVendor::Amd), AMD_H264),
    ((OutputFormat::Mp4, AgentKind::Cpu, GpuVendor::None), CPU_H264),
    ((OutputFormat::Mp4, AgentKind::Gpu, GpuVendor::Nvidia), NVIDIA_H264),
    ((OutputFormat::Mp4, AgentKind::Gpu, GpuVendor::Amd), AMD_H264),
    ((OutputFormat::Webm, AgentKind::Cpu, GpuVendor::None), CPU_VP9),
    ((OutputFormat::Webm, AgentKind::Gpu, GpuVendor::Nvidia), CPU_VP9),
    ((OutputFormat::Webm, AgentKind::Gpu, GpuVendor::Amd), CPU_VP9),
    ((OutputFormat::Ogv, AgentKind::Cpu, GpuVendor::None), CPU_THEORA),
    ((OutputFormat::Ogv, AgentKind::Gpu, GpuVendor::Nvidia), CPU_THEORA),
    ((OutputFormat::Ogv, AgentKind::Gpu, GpuVendor::Amd), CPU_THEORA),
];

/// Look up the encoder strategy for a format and agent.
pub fn strategy_for(
    format: OutputFormat,
    agent: &ProcessingAgent,
) -> Result<&'static Strategy, ProfileError> {
    let vendor = match agent.kind {
        AgentKind::Cpu => GpuVendor::None,
        AgentKind::Gpu => agent.vendor,
    };
    let key = (format, agent.kind, vendor);

    STRATEGIES
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, s)| s)
        .ok_or_else(|| {
            ProfileError::Unsupported(format!(
                "no encoder for format {} on {:?} agent with vendor '{}'",
                format, agent.kind, agent.vendor
            ))
        })
}

/// Build the `-vf` filter chain for a scaler and frame size.
pub fn scale_filter(scaler: Scaler, width: u32, height: u32) -> String {
    let cpu = format!(
        "scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2",
        w = width,
        h = height
    );
    match scaler {
        Scaler::Cpu => cpu,
        Scaler::Cuda => format!("scale_cuda={}:{}", width, height),
        Scaler::HwRoundTrip => format!("hwdownload,format=nv12,{},hwupload", cpu),
    }
}

/// Client-relative base URL the Node serves segments from
pub fn segment_base_url(video_id: &str, format: OutputFormat, resolution: Resolution) -> String {
    format!(
        "/external/videos/{}/adaptive/{}/{}/segments/",
        video_id, format, resolution
    )
}

/// Where the encoder reads from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeInput {
    /// A finished source file
    File(PathBuf),
    /// Listen for an inbound live stream at this URL
    Listen(String),
}

/// Options only meaningful for live output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveOptions {
    /// The Node keeps every segment; the playlist grows without bound
    pub retain_remotely: bool,
    /// Playlist length when segments are not retained
    pub list_size: u64,
    pub segment_duration_secs: u32,
}

/// Everything needed to resolve one encoder invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeRequest {
    pub video_id: String,
    pub format: OutputFormat,
    pub resolution: Resolution,
    pub input: EncodeInput,
    /// Manifest path for segmented output, file path otherwise
    pub output: PathBuf,
    /// Segment file pattern (segmented output only)
    pub segment_pattern: Option<PathBuf>,
    pub live: Option<LiveOptions>,
}

/// Resolve the ordered encoder arguments for a request.
///
/// Pure: identical requests and agents always yield identical argument lists.
pub fn resolve_args(
    request: &EncodeRequest,
    agent: &ProcessingAgent,
) -> Result<Vec<String>, ProfileError> {
    if request.live.is_some() && !request.format.is_segmented() {
        return Err(ProfileError::Unsupported(format!(
            "live output must be segmented, got {}",
            request.format
        )));
    }

    let strategy = strategy_for(request.format, agent)?;
    let dims = request.resolution.dimensions();
    let mut args: Vec<String> = Vec::new();

    args.extend(strategy.input_args.iter().map(|s| s.to_string()));

    match &request.input {
        EncodeInput::File(path) => {
            args.push("-i".to_string());
            args.push(path.to_string_lossy().to_string());
        }
        EncodeInput::Listen(url) => {
            args.extend(["-listen".to_string(), "1".to_string()]);
            args.push("-i".to_string());
            args.push(url.clone());
        }
    }

    args.extend([
        "-c:v".to_string(),
        strategy.video_codec.to_string(),
        "-b:v".to_string(),
        format!("{}k", dims.video_bitrate_kbps),
        "-vf".to_string(),
        scale_filter(strategy.scaler, dims.width, dims.height),
        "-c:a".to_string(),
        strategy.audio_codec.to_string(),
        "-b:a".to_string(),
        format!("{}k", dims.audio_bitrate_kbps),
    ]);

    match request.format {
        OutputFormat::Segmented => {
            let segment_secs = request
                .live
                .map(|l| l.segment_duration_secs)
                .unwrap_or(VOD_SEGMENT_SECS);

            args.extend([
                "-g".to_string(),
                SEGMENTED_GOP.to_string(),
                "-sc_threshold".to_string(),
                "0".to_string(),
                "-f".to_string(),
                "hls".to_string(),
                "-hls_time".to_string(),
                segment_secs.to_string(),
            ]);

            if let Some(pattern) = &request.segment_pattern {
                args.push("-hls_segment_filename".to_string());
                args.push(pattern.to_string_lossy().to_string());
            }

            args.push("-hls_base_url".to_string());
            args.push(segment_base_url(
                &request.video_id,
                request.format,
                request.resolution,
            ));

            match request.live {
                None => {
                    args.extend(["-hls_playlist_type".to_string(), "vod".to_string()]);
                }
                Some(live) if live.retain_remotely => {
                    args.extend([
                        "-hls_list_size".to_string(),
                        "0".to_string(),
                        "-hls_playlist_type".to_string(),
                        "event".to_string(),
                    ]);
                }
                Some(live) => {
                    args.extend(["-hls_list_size".to_string(), live.list_size.to_string()]);
                }
            }
        }
        OutputFormat::Mp4 => {
            args.extend(["-movflags".to_string(), "+faststart".to_string()]);
        }
        OutputFormat::Webm | OutputFormat::Ogv => {}
    }

    args.push(request.output.to_string_lossy().to_string());
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn has_flag_with_value(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|pair| pair[0] == flag && pair[1] == value)
    }

    fn has_flag(args: &[String], flag: &str) -> bool {
        args.iter().any(|arg| arg == flag)
    }

    fn vod_request(format: OutputFormat, resolution: Resolution) -> EncodeRequest {
        EncodeRequest {
            video_id: "abc123".to_string(),
            format,
            resolution,
            input: EncodeInput::File(PathBuf::from("/videos/abc123/source/abc123.mkv")),
            output: PathBuf::from("/videos/abc123/out"),
            segment_pattern: format
                .is_segmented()
                .then(|| PathBuf::from("/videos/abc123/segment-%d.ts")),
            live: None,
        }
    }

    fn agents() -> Vec<ProcessingAgent> {
        vec![
            ProcessingAgent::cpu(),
            ProcessingAgent::gpu(GpuVendor::Nvidia, "RTX"),
            ProcessingAgent::gpu(GpuVendor::Amd, "RX"),
        ]
    }

    fn agent_strategy() -> impl proptest::strategy::Strategy<Value = ProcessingAgent> {
        prop::sample::select(agents())
    }

    #[test]
    fn test_every_resolution_has_dimensions() {
        for resolution in Resolution::ALL {
            let dims = resolution.dimensions();
            assert!(dims.width > 0 && dims.height > 0, "{}", resolution);
            assert!(dims.video_bitrate_kbps > 0 && dims.audio_bitrate_kbps > 0);
            assert_eq!(resolution.as_str().parse::<Resolution>().unwrap(), resolution);
        }
    }

    #[test]
    fn test_unknown_names_are_unsupported() {
        assert!(matches!("4320p".parse::<Resolution>(), Err(ProfileError::Unsupported(_))));
        assert!(matches!("avi".parse::<OutputFormat>(), Err(ProfileError::Unsupported(_))));
    }

    #[test]
    fn test_strategy_table_covers_every_combination() {
        for format in OutputFormat::ALL {
            for agent in agents() {
                let strategy = strategy_for(format, &agent).expect("combination defined");
                let hw_format = matches!(format, OutputFormat::Segmented | OutputFormat::Mp4);

                match (hw_format, agent.kind, agent.vendor) {
                    (true, AgentKind::Gpu, GpuVendor::Nvidia) => {
                        assert_eq!(strategy.scaler, Scaler::Cuda);
                        assert_eq!(strategy.video_codec, "h264_nvenc");
                    }
                    (true, AgentKind::Gpu, GpuVendor::Amd) => {
                        assert_eq!(strategy.scaler, Scaler::HwRoundTrip);
                        assert_eq!(strategy.video_codec, "h264_amf");
                    }
                    _ => {
                        assert_eq!(strategy.scaler, Scaler::Cpu);
                        assert!(strategy.input_args.is_empty());
                    }
                }
            }
        }
    }

    #[test]
    fn test_cpu_agent_ignores_stale_vendor() {
        let agent = ProcessingAgent {
            kind: AgentKind::Cpu,
            vendor: GpuVendor::Nvidia,
            model: String::new(),
        };
        let strategy = strategy_for(OutputFormat::Mp4, &agent).unwrap();
        assert_eq!(strategy.video_codec, "libx264");
    }

    #[test]
    fn test_gpu_without_vendor_is_unsupported() {
        let agent = ProcessingAgent::gpu(GpuVendor::None, "");
        let err = strategy_for(OutputFormat::Segmented, &agent).unwrap_err();
        assert!(matches!(err, ProfileError::Unsupported(_)));
    }

    #[test]
    fn test_hw_round_trip_has_download_and_upload() {
        let amd = scale_filter(Scaler::HwRoundTrip, 1280, 720);
        assert!(amd.starts_with("hwdownload,format=nv12,scale=1280:720"));
        assert!(amd.ends_with(",hwupload"));

        let nvidia = scale_filter(Scaler::Cuda, 1280, 720);
        assert_eq!(nvidia, "scale_cuda=1280:720");
        assert!(!nvidia.contains("hwdownload"));
    }

    #[test]
    fn test_segmented_vod_args() {
        let args = resolve_args(
            &vod_request(OutputFormat::Segmented, Resolution::P720),
            &ProcessingAgent::cpu(),
        )
        .unwrap();

        assert!(has_flag_with_value(&args, "-g", "48"));
        assert!(has_flag_with_value(&args, "-sc_threshold", "0"));
        assert!(has_flag_with_value(&args, "-hls_time", "6"));
        assert!(has_flag_with_value(&args, "-hls_playlist_type", "vod"));
        assert!(has_flag_with_value(
            &args,
            "-hls_base_url",
            "/external/videos/abc123/adaptive/m3u8/720p/segments/"
        ));
        assert!(has_flag_with_value(&args, "-b:v", "3000k"));
        assert!(!has_flag(&args, "-movflags"));
        assert_eq!(args.last().unwrap(), "/videos/abc123/out");
    }

    #[test]
    fn test_mp4_requests_faststart() {
        let args = resolve_args(
            &vod_request(OutputFormat::Mp4, Resolution::P1080),
            &ProcessingAgent::gpu(GpuVendor::Nvidia, "RTX"),
        )
        .unwrap();

        assert!(has_flag_with_value(&args, "-movflags", "+faststart"));
        assert!(has_flag_with_value(&args, "-c:v", "h264_nvenc"));
        assert!(has_flag_with_value(&args, "-hwaccel", "cuda"));
        // hardware input args come before the input
        let hw = args.iter().position(|a| a == "-hwaccel").unwrap();
        let input = args.iter().position(|a| a == "-i").unwrap();
        assert!(hw < input);
    }

    #[test]
    fn test_webm_on_gpu_uses_cpu_chain() {
        let args = resolve_args(
            &vod_request(OutputFormat::Webm, Resolution::P480),
            &ProcessingAgent::gpu(GpuVendor::Amd, "RX"),
        )
        .unwrap();

        assert!(has_flag_with_value(&args, "-c:v", "libvpx-vp9"));
        assert!(!has_flag(&args, "-hwaccel"));
        assert!(has_flag_with_value(
            &args,
            "-vf",
            "scale=854:480:force_original_aspect_ratio=decrease,pad=854:480:(ow-iw)/2:(oh-ih)/2"
        ));
    }

    #[test]
    fn test_live_playlist_toggles_on_retention() {
        let mut request = vod_request(OutputFormat::Segmented, Resolution::P720);
        request.input = EncodeInput::Listen("rtmp://0.0.0.0:1935/live/abc123".to_string());
        request.live = Some(LiveOptions {
            retain_remotely: true,
            list_size: 20,
            segment_duration_secs: 4,
        });

        let retained = resolve_args(&request, &ProcessingAgent::cpu()).unwrap();
        assert!(has_flag_with_value(&retained, "-listen", "1"));
        assert!(has_flag_with_value(&retained, "-hls_list_size", "0"));
        assert!(has_flag_with_value(&retained, "-hls_playlist_type", "event"));
        assert!(has_flag_with_value(&retained, "-hls_time", "4"));
        assert!(!has_flag_with_value(&retained, "-hls_playlist_type", "vod"));

        request.live = Some(LiveOptions {
            retain_remotely: false,
            list_size: 20,
            segment_duration_secs: 4,
        });
        let rolling = resolve_args(&request, &ProcessingAgent::cpu()).unwrap();
        assert!(has_flag_with_value(&rolling, "-hls_list_size", "20"));
        assert!(!has_flag(&rolling, "-hls_playlist_type"));
    }

    #[test]
    fn test_live_requires_segmented_output() {
        let mut request = vod_request(OutputFormat::Mp4, Resolution::P720);
        request.live = Some(LiveOptions {
            retain_remotely: false,
            list_size: 20,
            segment_duration_secs: 6,
        });
        assert!(resolve_args(&request, &ProcessingAgent::cpu()).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_resolution_is_pure(
            format in prop::sample::select(OutputFormat::ALL.to_vec()),
            resolution in prop::sample::select(Resolution::ALL.to_vec()),
            agent in agent_strategy(),
        ) {
            let request = vod_request(format, resolution);
            let first = resolve_args(&request, &agent).unwrap();
            let second = resolve_args(&request, &agent).unwrap();
            prop_assert_eq!(first, second);
        }

        #[test]
        fn prop_bitrate_matches_table(
            format in prop::sample::select(OutputFormat::ALL.to_vec()),
            resolution in prop::sample::select(Resolution::ALL.to_vec()),
            agent in agent_strategy(),
        ) {
            let args = resolve_args(&vod_request(format, resolution), &agent).unwrap();
            let dims = resolution.dimensions();
            let expected = format!("{}k", dims.video_bitrate_kbps);
            prop_assert!(has_flag_with_value(&args, "-b:v", &expected));
        }
    }
}
