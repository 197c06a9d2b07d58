//! Echo analyzer
//!
//! [`EchoAnalyzer`] is the [`LatencyAnalyzer`] configured for an acoustic or
//! cable loopback: it builds the noise-burst probe from its own settings,
//! clamps out-of-range tuning, and tracks how loud the echo comes back.

use serde::{Deserialize, Serialize};

use super::analyzer::{
    AnalyzerConfig, AnalyzerPhase, AnalyzerPublisher, AnalyzerSnapshot, LatencyAnalyzer,
    LatencyReport, Measurement,
};
use super::duplex::{CallbackResult, DuplexCallback, DuplexFormat};
use super::probe::{ProbeSignal, DEFAULT_PROBE_AMPLITUDE, DEFAULT_PROBE_SEED};

/// Shortest probe that still gives a usable correlation peak
const MIN_PROBE_LENGTH: usize = 64;

/// Longest probe; capture and FFT buffers grow with it
const MAX_PROBE_LENGTH: usize = 65_536;

/// Longest measurable round trip, two seconds at 96 kHz
const MAX_LATENCY_FRAMES: usize = 192_000;

/// Echo measurement settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EchoConfig {
    /// Probe length in frames
    pub probe_length: usize,
    pub probe_seed: u32,
    /// Probe peak level (0.0 to 1.0)
    pub probe_amplitude: f32,
    #[serde(flatten)]
    pub analyzer: AnalyzerConfig,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            probe_length: 2048,
            probe_seed: DEFAULT_PROBE_SEED,
            probe_amplitude: DEFAULT_PROBE_AMPLITUDE,
            analyzer: AnalyzerConfig::default(),
        }
    }
}

impl EchoConfig {
    /// Copy with every field pulled into its usable range
    pub fn sanitized(&self) -> Self {
        let mut config = self.clone();

        if config.probe_length < MIN_PROBE_LENGTH {
            tracing::warn!(
                requested = config.probe_length,
                used = MIN_PROBE_LENGTH,
                "Probe too short"
            );
            config.probe_length = MIN_PROBE_LENGTH;
        }
        if config.probe_length > MAX_PROBE_LENGTH {
            tracing::warn!(
                requested = config.probe_length,
                used = MAX_PROBE_LENGTH,
                "Probe too long"
            );
            config.probe_length = MAX_PROBE_LENGTH;
        }
        if !(config.probe_amplitude > 0.0 && config.probe_amplitude <= 1.0) {
            tracing::warn!(
                requested = config.probe_amplitude,
                used = DEFAULT_PROBE_AMPLITUDE,
                "Probe amplitude out of range"
            );
            config.probe_amplitude = DEFAULT_PROBE_AMPLITUDE;
        }

        let analyzer = &mut config.analyzer;
        analyzer.required_measurements = analyzer.required_measurements.max(1);
        if analyzer.max_iterations < analyzer.required_measurements {
            tracing::warn!(
                max_iterations = analyzer.max_iterations,
                required = analyzer.required_measurements,
                "Iteration budget below required measurements, raising it"
            );
            analyzer.max_iterations = analyzer.required_measurements;
        }
        if analyzer.max_latency_frames > MAX_LATENCY_FRAMES {
            tracing::warn!(
                requested = analyzer.max_latency_frames,
                used = MAX_LATENCY_FRAMES,
                "Maximum latency too large"
            );
            analyzer.max_latency_frames = MAX_LATENCY_FRAMES;
        }
        analyzer.min_confidence = analyzer.min_confidence.clamp(0.0, 1.0);
        if !analyzer.probe_offset_frames.is_finite() || analyzer.probe_offset_frames < 0.0 {
            analyzer.probe_offset_frames = 0.0;
        }

        config
    }
}

/// Latency analyzer specialized for echo measurement
pub struct EchoAnalyzer {
    config: EchoConfig,
    inner: LatencyAnalyzer,
}

impl EchoAnalyzer {
    /// Build the probe and analyzer from `config`
    ///
    /// # Example
    /// ```
    /// use latencytester_core::audio::echo::{EchoAnalyzer, EchoConfig};
    ///
    /// let analyzer = EchoAnalyzer::new(EchoConfig::default());
    /// assert_eq!(analyzer.probe().len(), 2048);
    /// assert!(!analyzer.is_done());
    /// ```
    pub fn new(config: EchoConfig) -> Self {
        let config = config.sanitized();
        let probe =
            ProbeSignal::noise_burst(config.probe_length, config.probe_seed, config.probe_amplitude);
        tracing::debug!(
            probe_length = config.probe_length,
            seed = config.probe_seed,
            probe_rms = probe.rms(),
            "Echo probe generated"
        );
        let inner = LatencyAnalyzer::new(config.analyzer.clone(), probe);
        Self { config, inner }
    }

    pub fn config(&self) -> &EchoConfig {
        &self.config
    }

    pub fn probe(&self) -> &ProbeSignal {
        self.inner.probe()
    }

    /// Underlying analyzer
    pub fn analyzer(&self) -> &LatencyAnalyzer {
        &self.inner
    }

    pub fn set_publisher(&mut self, publisher: AnalyzerPublisher) {
        self.inner.set_publisher(publisher);
    }

    pub fn reset(&mut self) {
        self.inner.reset();
    }

    pub fn analyze_data(&mut self) -> bool {
        self.inner.analyze_data()
    }

    pub fn report(&self) -> LatencyReport {
        self.inner.report()
    }

    pub fn snapshot(&self) -> AnalyzerSnapshot {
        self.inner.snapshot()
    }

    pub fn is_done(&self) -> bool {
        self.inner.is_done()
    }

    pub fn phase(&self) -> AnalyzerPhase {
        self.inner.phase()
    }

    pub fn measurements(&self) -> &[Measurement] {
        self.inner.measurements()
    }

    /// Mean echo level relative to the probe over accepted measurements
    pub fn echo_gain(&self) -> Option<f32> {
        mean_echo_gain(self.inner.measurements())
    }
}

/// Mean echo gain, `None` without measurements
pub fn mean_echo_gain(measurements: &[Measurement]) -> Option<f32> {
    if measurements.is_empty() {
        return None;
    }
    let sum: f32 = measurements.iter().map(|m| m.echo_gain).sum();
    Some(sum / measurements.len() as f32)
}

impl DuplexCallback for EchoAnalyzer {
    fn prepare(&mut self, format: &DuplexFormat) {
        self.inner.prepare(format);
    }

    fn on_both_streams_ready(
        &mut self,
        input: &[f32],
        num_input_frames: usize,
        output: &mut [f32],
        num_output_frames: usize,
    ) -> CallbackResult {
        self.inner
            .on_both_streams_ready(input, num_input_frames, output, num_output_frames)
    }
}

impl std::fmt::Debug for EchoAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EchoAnalyzer")
            .field("config", &self.config)
            .field("inner", &self.inner)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::delay_line::{InterpolatingDelayLine, InterpolationMode};
    use crate::audio::report::ResultCode;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_sanitize_fixes_ranges() {
        let mut config = EchoConfig {
            probe_length: 8,
            probe_amplitude: 3.0,
            ..Default::default()
        };
        config.analyzer.required_measurements = 7;
        config.analyzer.max_iterations = 2;
        config.analyzer.min_confidence = 1.5;
        config.analyzer.probe_offset_frames = f64::NAN;

        let fixed = config.sanitized();
        assert_eq!(fixed.probe_length, MIN_PROBE_LENGTH);
        assert_eq!(fixed.probe_amplitude, DEFAULT_PROBE_AMPLITUDE);
        assert_eq!(fixed.analyzer.max_iterations, 7);
        assert_eq!(fixed.analyzer.min_confidence, 1.0);
        assert_eq!(fixed.analyzer.probe_offset_frames, 0.0);
    }

    #[test]
    fn test_sanitize_caps_buffer_sizes() {
        let mut config = EchoConfig {
            probe_length: 10_000_000,
            ..Default::default()
        };
        config.analyzer.max_latency_frames = usize::MAX;

        let fixed = config.sanitized();
        assert_eq!(fixed.probe_length, MAX_PROBE_LENGTH);
        assert_eq!(fixed.analyzer.max_latency_frames, MAX_LATENCY_FRAMES);

        let defaults = EchoConfig::default();
        assert_eq!(defaults.sanitized(), defaults);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EchoConfig =
            serde_json::from_str(r#"{"probe_length": 1024, "required_measurements": 3}"#).unwrap();
        assert_eq!(config.probe_length, 1024);
        assert_eq!(config.analyzer.required_measurements, 3);
        assert_eq!(config.analyzer.max_iterations, 10);
        assert_eq!(config.probe_seed, DEFAULT_PROBE_SEED);
    }

    #[test]
    fn test_echo_gain_tracks_loopback_level() {
        let mut config = EchoConfig {
            probe_length: 512,
            ..Default::default()
        };
        config.analyzer.max_latency_frames = 1024;
        config.analyzer.priming_periods = 1;
        config.analyzer.required_measurements = 2;
        config.analyzer.max_iterations = 4;

        let mut analyzer = EchoAnalyzer::new(config);
        let period = 128;
        analyzer.prepare(&DuplexFormat {
            sample_rate: 48000,
            input_channels: 1,
            output_channels: 1,
            frames_per_period: period,
        });

        let delay = 700;
        let gain = 0.25;
        let mut line = InterpolatingDelayLine::new(delay + period, InterpolationMode::Linear);
        let mut input = vec![0.0f32; period];
        let mut output = vec![0.0f32; period];
        for _ in 0..500 {
            for (i, slot) in input.iter_mut().enumerate() {
                *slot = line.sample_at(delay - 1 - i) * gain;
            }
            analyzer.on_both_streams_ready(&input, period, &mut output, period);
            line.write_slice(&output);
            if analyzer.is_done() {
                break;
            }
        }

        let report = analyzer.report();
        assert_eq!(report.result, ResultCode::Ok);
        assert_abs_diff_eq!(report.latency_frames, delay as f64, epsilon = 0.1);
        let echo_gain = analyzer.echo_gain().unwrap();
        assert_abs_diff_eq!(echo_gain, gain, epsilon = 0.01);
    }

    #[test]
    fn test_no_measurements_no_gain() {
        let analyzer = EchoAnalyzer::new(EchoConfig::default());
        assert_eq!(analyzer.echo_gain(), None);
        assert_eq!(mean_echo_gain(&[]), None);
    }
}
