//! Encoding modules for the publish agent

pub mod ffmpeg;
pub mod profile;
pub mod progress;
pub mod stills;

pub use ffmpeg::{
    run_to_exit, EncodeError, EncoderBackend, EncoderExit, ExitFuture, FfmpegBackend,
    ProcessHandle, RunningEncoder,
};
pub use profile::{
    resolve_args, EncodeInput, EncodeRequest, LiveOptions, OutputFormat, ProfileError, Resolution,
};
pub use progress::{ProgressParser, ProgressTick};
pub use stills::{extract_stills, StillKind};
