//! Analyzer phases, result codes, and the reports built from them
//!
//! Everything here is a plain value type. [`AnalyzerSnapshot`] is `Copy` so
//! the audio thread can publish it through a
//! [`SnapshotCell`](super::snapshot::SnapshotCell) and readers always see a
//! consistent state.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Phase of the measurement state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalyzerPhase {
    /// Outputting silence while the hardware path settles
    #[default]
    Priming,
    /// Emitting the probe
    SendingProbe,
    /// Recording until the capture window is full
    CapturingEcho,
    /// Capture window full, correlation pending
    Correlating,
    /// One measurement attempt finished
    MeasurementComplete,
    /// Final latency available
    Done,
    /// No usable echo after exhausting the iteration budget
    Failed,
}

impl AnalyzerPhase {
    /// Numeric state id, stable for display and diagnostics
    pub fn id(self) -> i32 {
        match self {
            Self::Priming => 0,
            Self::SendingProbe => 1,
            Self::CapturingEcho => 2,
            Self::Correlating => 3,
            Self::MeasurementComplete => 4,
            Self::Done => 5,
            Self::Failed => 6,
        }
    }

    /// Phase for a numeric state id
    pub fn from_id(id: i32) -> Option<Self> {
        Some(match id {
            0 => Self::Priming,
            1 => Self::SendingProbe,
            2 => Self::CapturingEcho,
            3 => Self::Correlating,
            4 => Self::MeasurementComplete,
            5 => Self::Done,
            6 => Self::Failed,
            _ => return None,
        })
    }

    /// True for `Done` and `Failed`
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Upper-case name for reports
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Priming => "PRIMING",
            Self::SendingProbe => "SENDING_PROBE",
            Self::CapturingEcho => "CAPTURING_ECHO",
            Self::Correlating => "CORRELATING",
            Self::MeasurementComplete => "MEASUREMENT_COMPLETE",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for AnalyzerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a measurement run or of a single rejected attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultCode {
    /// Latency measured successfully
    Ok,
    /// Background noise too close to the echo level
    Noisy,
    /// Input is silent or nearly so (no echo reaching the input)
    VolumeTooLow,
    /// Input is clipping
    VolumeTooHigh,
    /// Correlation peak not distinct enough from the background
    Confidence,
    /// Measurement still running, no result yet
    #[default]
    InvalidState,
}

impl ResultCode {
    /// Numeric code, matching the values other latency tools report
    pub fn code(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::Noisy => -99,
            Self::VolumeTooLow => -98,
            Self::VolumeTooHigh => -97,
            Self::Confidence => -96,
            Self::InvalidState => -95,
        }
    }

    /// Result for a numeric code
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => Self::Ok,
            -99 => Self::Noisy,
            -98 => Self::VolumeTooLow,
            -97 => Self::VolumeTooHigh,
            -96 => Self::Confidence,
            -95 => Self::InvalidState,
            _ => return None,
        })
    }

    /// Upper-case name for reports
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Noisy => "ERROR_NOISY",
            Self::VolumeTooLow => "ERROR_VOLUME_TOO_LOW",
            Self::VolumeTooHigh => "ERROR_VOLUME_TOO_HIGH",
            Self::Confidence => "ERROR_CONFIDENCE",
            Self::InvalidState => "ERROR_INVALID_STATE",
        }
    }

    /// Operator-facing explanation
    pub fn description(self) -> &'static str {
        match self {
            Self::Ok => "latency measured",
            Self::Noisy => "background noise too high for a reliable echo",
            Self::VolumeTooLow => "no echo detected, input is silent",
            Self::VolumeTooHigh => "input is clipping, lower the output volume",
            Self::Confidence => "echo not distinct enough from background correlation",
            Self::InvalidState => "measurement not finished",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One accepted latency observation
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Measurement {
    /// Attempt number that produced it (1-based)
    pub iteration: u32,
    /// Round-trip delay in fractional frames
    pub delay_frames: f64,
    /// Raw correlation peak magnitude
    pub peak: f32,
    /// Normalized confidence (0.0 to 1.0)
    pub confidence: f32,
    /// Echo level relative to the probe level
    pub echo_gain: f32,
}

/// Consistent copy of analyzer state, published once per callback
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AnalyzerSnapshot {
    pub phase: AnalyzerPhase,
    pub result: ResultCode,
    /// Callbacks processed
    pub progress: u64,
    /// Measurement attempts finished
    pub iterations: u32,
    /// Attempts accepted as confident measurements
    pub accepted: u32,
    pub sample_rate: u32,
    /// Median accepted delay (final once terminal)
    pub latency_frames: f64,
    /// Mean accepted confidence (final once terminal)
    pub confidence: f32,
    /// Periods whose input and output sizes disagreed
    pub degraded_periods: u64,
}

impl AnalyzerSnapshot {
    /// True for `Done` and `Failed`
    pub fn is_done(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Latency converted to milliseconds at the snapshot's sample rate
    pub fn latency_ms(&self) -> f64 {
        frames_to_ms(self.latency_frames, self.sample_rate)
    }
}

/// Convert a frame count to milliseconds
pub fn frames_to_ms(frames: f64, sample_rate: u32) -> f64 {
    if sample_rate == 0 {
        0.0
    } else {
        frames * 1000.0 / sample_rate as f64
    }
}

/// Human- and machine-readable summary of a measurement
///
/// `Display` renders the text form; `serde` gives the JSON form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyReport {
    pub phase: AnalyzerPhase,
    pub state: i32,
    pub result: ResultCode,
    pub result_code: i32,
    pub progress: u64,
    pub sample_rate: u32,
    pub latency_frames: f64,
    pub latency_ms: f64,
    pub confidence: f32,
    pub accepted: u32,
    pub iterations: u32,
    pub degraded_periods: u64,
}

impl LatencyReport {
    /// True once the run reached `Done` or `Failed`
    pub fn is_done(&self) -> bool {
        self.phase.is_terminal()
    }

    /// True when the run finished with a usable latency
    pub fn is_success(&self) -> bool {
        self.phase == AnalyzerPhase::Done && self.result == ResultCode::Ok
    }
}

impl From<AnalyzerSnapshot> for LatencyReport {
    fn from(s: AnalyzerSnapshot) -> Self {
        Self {
            phase: s.phase,
            state: s.phase.id(),
            result: s.result,
            result_code: s.result.code(),
            progress: s.progress,
            sample_rate: s.sample_rate,
            latency_frames: s.latency_frames,
            latency_ms: s.latency_ms(),
            confidence: s.confidence,
            accepted: s.accepted,
            iterations: s.iterations,
            degraded_periods: s.degraded_periods,
        }
    }
}

impl fmt::Display for LatencyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "progress = {}, state = {} = {}", self.progress, self.state, self.phase)?;
        writeln!(f, "result = {} = {}", self.result_code, self.result)?;
        writeln!(f, "sample rate = {} Hz", self.sample_rate)?;
        match self.phase {
            AnalyzerPhase::Failed => {
                writeln!(f, "FAILED: {}", self.result.description())?;
            }
            _ => {
                writeln!(
                    f,
                    "latency = {:6.1} frames = {:6.2} msec",
                    self.latency_frames, self.latency_ms
                )?;
                writeln!(f, "confidence = {:6.3}", self.confidence)?;
            }
        }
        write!(
            f,
            "measurements = {}/{} accepted, degraded periods = {}",
            self.accepted, self.iterations, self.degraded_periods
        )
    }
}
