//! Latencytester - round-trip audio latency measurement
//!
//! This library re-exports the measurement engine from `latencytester-core`
//! and adds the pieces the command-line tool needs: persistent configuration
//! and argument parsing.

pub mod cli;
pub mod config;

pub use latencytester_core::audio;
pub use latencytester_core::error;
pub use latencytester_core::stats;

pub use latencytester_core::{
    AnalyzerPhase, CallbackResult, DuplexCallback, DuplexFormat, EchoAnalyzer, EchoConfig,
    FullDuplexLatency, FullDuplexStream, InterpolatingDelayLine, InterpolationMode, LatencyReport,
    ResultCode, StreamError,
};
pub use latencytester_core::{BUILD_DATE, DEFAULT_SAMPLE_RATE, VERSION};
