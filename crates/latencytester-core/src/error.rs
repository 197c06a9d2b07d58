//! Error types surfaced to the non-real-time caller
//!
//! Only stream setup can fail with an error. Everything that goes wrong
//! inside the audio callback is encoded as analyzer state instead
//! (see [`crate::audio::report::ResultCode`]).

use thiserror::Error;

/// Errors that can occur while opening or starting the duplex streams
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("No audio devices found")]
    NoDevicesFound,

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("No input channels available on {0}")]
    NoInputChannels(String),

    #[error("No output channels available on {0}")]
    NoOutputChannels(String),

    #[error("Permission denied opening {0}")]
    PermissionDenied(String),

    #[error("Device busy: {0}")]
    DeviceBusy(String),

    #[error("Unsupported stream configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Sample rate mismatch: input {input} Hz, output {output} Hz")]
    SampleRateMismatch { input: u32, output: u32 },

    #[error("Failed to build stream: {0}")]
    Build(String),

    #[error("Failed to start stream: {0}")]
    Play(String),

    #[error("Streams are already running")]
    AlreadyRunning,
}

/// Convenience alias for stream setup results
pub type Result<T> = std::result::Result<T, StreamError>;
