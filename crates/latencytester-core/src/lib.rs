//! Latencytester Core - full-duplex round-trip latency measurement
//!
//! This library plays a noise-burst probe on an audio output, records the
//! input, and cross-correlates the two to find the round-trip delay to a
//! fraction of a frame. It contains the duplex stream pairing, the analyzer
//! state machine, and backends for real devices (cpal) and a simulated
//! loopback.

pub mod audio;
pub mod error;
pub mod stats;

pub use audio::delay_line::{InterpolatingDelayLine, InterpolationMode};
pub use audio::duplex::{CallbackResult, DuplexCallback, DuplexFormat, FullDuplexStream};
pub use audio::echo::{EchoAnalyzer, EchoConfig};
pub use audio::latency::FullDuplexLatency;
pub use audio::report::{AnalyzerPhase, LatencyReport, ResultCode};
pub use error::StreamError;

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date stamped by build.rs
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Default sample rate for audio processing
pub const DEFAULT_SAMPLE_RATE: u32 = 48000;
