//! Round-trip latency analyzer
//!
//! [`LatencyAnalyzer`] runs inside the duplex callback. Each measurement
//! pass plays a probe, records the input until the capture window is full,
//! and correlates the capture against the probe to find the echo delay.
//!
//! ```text
//! Priming -> SendingProbe -> CapturingEcho -> Correlating
//!     -> MeasurementComplete -> SendingProbe | Done | Failed
//! ```
//!
//! Every pass opens with `max_latency_frames + probe_len` frames of silence
//! whose input is discarded, so echoes of the previous probe have died out
//! before the next one starts. Each pass also plays a freshly seeded burst:
//! an echo arriving later than the quiet gap still does not correlate with
//! the current probe and is rejected instead of measured.
//!
//! Capture starts with the first probe frame, so correlation lag 0 is the
//! moment the probe left the output. Several passes are combined: the final
//! latency is the median of the accepted delays.
//!
//! All buffers are allocated in [`LatencyAnalyzer::new`]. The callback path
//! only touches pre-sized storage, publishes a `Copy` snapshot through a
//! [`SnapshotCell`], and hands accepted measurements to the control thread
//! with a non-blocking `try_send`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};

use super::correlation::{CorrelationPeak, Correlator, PeakFit};
use super::delay_line::{InterpolatingDelayLine, InterpolationMode};
use super::duplex::{CallbackResult, DuplexCallback, DuplexFormat};
use super::probe::{pass_seed, ProbeSignal};
use super::snapshot::SnapshotCell;
pub use super::report::{AnalyzerPhase, AnalyzerSnapshot, LatencyReport, Measurement, ResultCode};

/// Samples at or above this magnitude count as clipped
const CLIP_LEVEL: f32 = 0.999;

/// Measurement tuning
///
/// Every field has a default, so a partial JSON object is a valid config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Longest round trip that can be measured, in frames
    pub max_latency_frames: usize,
    /// Silent callbacks before the first probe
    pub priming_periods: u32,
    /// Accepted measurements needed to finish
    pub required_measurements: u32,
    /// Attempt budget, accepted or not
    pub max_iterations: u32,
    /// Lowest acceptable correlation confidence
    pub min_confidence: f32,
    /// Captured peak below this means no echo
    pub min_input_level: f32,
    /// Clipped samples tolerated per capture
    pub max_clipped_samples: usize,
    /// Lowest acceptable echo-to-noise ratio
    pub min_snr_db: f32,
    pub interpolation: InterpolationMode,
    pub peak_fit: PeakFit,
    /// Fractional shift applied to the emitted probe, subtracted from results
    pub probe_offset_frames: f64,
    pub input_channel: u16,
    pub output_channel: u16,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            max_latency_frames: 9600,
            priming_periods: 8,
            required_measurements: 5,
            max_iterations: 10,
            min_confidence: 0.5,
            min_input_level: 1e-4,
            max_clipped_samples: 16,
            min_snr_db: 6.0,
            interpolation: InterpolationMode::Cubic,
            peak_fit: PeakFit::Gaussian,
            probe_offset_frames: 0.0,
            input_channel: 0,
            output_channel: 0,
        }
    }
}

impl AnalyzerConfig {
    /// Accepted measurements that still count as a result once the budget
    /// runs out
    pub fn majority(&self) -> u32 {
        self.required_measurements.div_ceil(2).max(1)
    }
}

/// Where the analyzer publishes its progress
///
/// Cloned handles share the same cell and channel.
#[derive(Clone)]
pub struct AnalyzerPublisher {
    pub snapshot: Arc<SnapshotCell>,
    pub measurements: Sender<Measurement>,
    /// Measurements dropped because the channel was full
    pub dropped: Arc<AtomicU64>,
}

/// Why a single attempt was not accepted
fn rejection(
    config: &AnalyzerConfig,
    peak: &CorrelationPeak,
    capture_peak: f32,
    clipped: usize,
    noise_rms: f64,
) -> Option<ResultCode> {
    if capture_peak < config.min_input_level {
        return Some(ResultCode::VolumeTooLow);
    }
    if clipped > config.max_clipped_samples {
        return Some(ResultCode::VolumeTooHigh);
    }
    if noise_rms > 0.0 {
        let snr_db = 20.0 * (peak.echo_rms as f64 / noise_rms).max(1e-12).log10();
        if snr_db < config.min_snr_db as f64 {
            return Some(ResultCode::Noisy);
        }
    }
    if peak.confidence < config.min_confidence {
        return Some(ResultCode::Confidence);
    }
    None
}

/// Median of `values`, sorting them in place
fn median_in_place(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_unstable_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

/// Probe/capture/correlate state machine
pub struct LatencyAnalyzer {
    config: AnalyzerConfig,
    probe: ProbeSignal,
    /// Seed of the first pass's burst, `None` for a fixed waveform
    base_seed: Option<u32>,
    probe_rms: f64,
    /// Probe playback, read back at the configured fractional offset
    emitter: InterpolatingDelayLine,
    /// Recorded input, lag 0 at the oldest sample
    capture: InterpolatingDelayLine,
    capture_len: usize,
    correlator: Correlator,

    phase: AnalyzerPhase,
    result: ResultCode,
    last_rejection: ResultCode,
    sample_rate: u32,
    input_channels: usize,
    output_channels: usize,
    input_channel: usize,
    output_channel: usize,

    priming_done: u32,
    noise_energy: f64,
    noise_frames: u64,
    /// Silent frames before each probe
    quiet_len: usize,
    quiet_remaining: usize,
    /// Frames of probe plus interpolation tail played so far this pass
    emitted: usize,
    emit_len: usize,
    capture_peak: f32,
    clipped: usize,

    iterations: u32,
    accepted: Vec<Measurement>,
    median_scratch: Vec<f64>,
    latency_frames: f64,
    confidence: f32,
    progress: u64,
    degraded_periods: u64,

    publisher: Option<AnalyzerPublisher>,
}

impl LatencyAnalyzer {
    /// Create an analyzer for the given probe
    ///
    /// The capture window holds `2 * probe_len + max_latency_frames` frames,
    /// enough for the whole probe to arrive at the longest measurable delay.
    pub fn new(config: AnalyzerConfig, probe: ProbeSignal) -> Self {
        let offset = config.probe_offset_frames.max(0.0);
        // Cubic reads look up to two samples past the integer delay
        let tail = offset.ceil() as usize + 2;
        let emit_len = probe.len() + tail;
        let quiet_len = config.max_latency_frames + probe.len();
        let capture_len = (2 * probe.len() + config.max_latency_frames).max(emit_len);
        let iterations = config.max_iterations.max(1) as usize;

        let correlator = Correlator::new(&probe, capture_len, config.peak_fit);
        tracing::debug!(
            probe_len = probe.len(),
            capture_len,
            fft_size = correlator.fft_size(),
            "Latency analyzer created"
        );

        Self {
            base_seed: probe.seed(),
            probe_rms: probe.rms(),
            emitter: InterpolatingDelayLine::new(tail + 2, config.interpolation),
            capture: InterpolatingDelayLine::new(capture_len, config.interpolation),
            capture_len,
            correlator,
            probe,
            phase: AnalyzerPhase::Priming,
            result: ResultCode::InvalidState,
            last_rejection: ResultCode::InvalidState,
            sample_rate: crate::DEFAULT_SAMPLE_RATE,
            input_channels: 1,
            output_channels: 1,
            input_channel: 0,
            output_channel: 0,
            priming_done: 0,
            noise_energy: 0.0,
            noise_frames: 0,
            quiet_len,
            quiet_remaining: 0,
            emitted: 0,
            emit_len,
            capture_peak: 0.0,
            clipped: 0,
            iterations: 0,
            accepted: Vec::with_capacity(iterations),
            median_scratch: Vec::with_capacity(iterations),
            latency_frames: 0.0,
            confidence: 0.0,
            progress: 0,
            degraded_periods: 0,
            publisher: None,
            config,
        }
    }

    /// Publish snapshots and measurements to `publisher`
    pub fn set_publisher(&mut self, publisher: AnalyzerPublisher) {
        publisher.snapshot.store(self.snapshot());
        self.publisher = Some(publisher);
    }

    /// Restart from `Priming`, forgetting all measurements
    pub fn reset(&mut self) {
        self.phase = AnalyzerPhase::Priming;
        self.result = ResultCode::InvalidState;
        self.last_rejection = ResultCode::InvalidState;
        self.priming_done = 0;
        self.noise_energy = 0.0;
        self.noise_frames = 0;
        self.iterations = 0;
        self.accepted.clear();
        self.latency_frames = 0.0;
        self.confidence = 0.0;
        self.progress = 0;
        self.degraded_periods = 0;
        self.begin_pass();
        self.phase = AnalyzerPhase::Priming;
        self.publish();
    }

    /// Run the correlation unit of work if a full capture is waiting
    ///
    /// Returns true when an attempt was evaluated. Calling it in any other
    /// phase, or before the window is full, does nothing.
    pub fn analyze_data(&mut self) -> bool {
        if self.phase != AnalyzerPhase::Correlating {
            return false;
        }
        let Some(peak) = self.correlator.correlate(&self.capture) else {
            self.phase = AnalyzerPhase::CapturingEcho;
            return false;
        };

        self.iterations += 1;
        let noise_rms = self.noise_rms();
        match rejection(&self.config, &peak, self.capture_peak, self.clipped, noise_rms) {
            Some(code) => {
                tracing::debug!(
                    iteration = self.iterations,
                    result = %code,
                    capture_peak = self.capture_peak,
                    confidence = peak.confidence,
                    "Measurement rejected"
                );
                self.last_rejection = code;
            }
            None => {
                let measurement = Measurement {
                    iteration: self.iterations,
                    delay_frames: peak.delay_frames - self.config.probe_offset_frames,
                    peak: peak.peak,
                    confidence: peak.confidence,
                    echo_gain: if self.probe_rms > 0.0 {
                        (peak.echo_rms as f64 / self.probe_rms) as f32
                    } else {
                        0.0
                    },
                };
                tracing::debug!(
                    iteration = measurement.iteration,
                    delay_frames = measurement.delay_frames,
                    confidence = measurement.confidence,
                    "Measurement accepted"
                );
                if self.accepted.len() < self.accepted.capacity() {
                    self.accepted.push(measurement);
                }
                if let Some(publisher) = &self.publisher {
                    if publisher.measurements.try_send(measurement).is_err() {
                        publisher.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }

        self.phase = AnalyzerPhase::MeasurementComplete;
        true
    }

    /// Decide what follows a finished attempt
    fn advance(&mut self) {
        let accepted = self.accepted.len() as u32;
        if accepted >= self.config.required_measurements.max(1) {
            self.finish(AnalyzerPhase::Done, ResultCode::Ok);
        } else if self.iterations >= self.config.max_iterations.max(1) {
            if accepted >= self.config.majority() {
                self.finish(AnalyzerPhase::Done, ResultCode::Ok);
            } else {
                self.finish(AnalyzerPhase::Failed, self.last_rejection);
            }
        } else {
            self.begin_pass();
        }
    }

    fn finish(&mut self, phase: AnalyzerPhase, result: ResultCode) {
        self.median_scratch.clear();
        self.median_scratch
            .extend(self.accepted.iter().map(|m| m.delay_frames));
        self.latency_frames = median_in_place(&mut self.median_scratch);
        self.confidence = if self.accepted.is_empty() {
            0.0
        } else {
            self.accepted.iter().map(|m| m.confidence).sum::<f32>() / self.accepted.len() as f32
        };
        self.phase = phase;
        self.result = result;

        tracing::info!(
            phase = %phase,
            result = %result,
            latency_frames = self.latency_frames,
            confidence = self.confidence,
            accepted = self.accepted.len(),
            iterations = self.iterations,
            "Latency measurement finished"
        );
    }

    fn begin_pass(&mut self) {
        if let Some(base) = self.base_seed {
            if self.probe.reseed(pass_seed(base, self.iterations)) {
                self.correlator.set_probe(&self.probe);
                self.probe_rms = self.probe.rms();
            }
        }
        self.quiet_remaining = self.quiet_len;
        self.emitter.clear();
        self.capture.clear();
        self.emitted = 0;
        self.capture_peak = 0.0;
        self.clipped = 0;
        self.phase = AnalyzerPhase::SendingProbe;
    }

    fn record(&mut self, sample: f32) {
        self.capture.write(sample);
        let level = sample.abs();
        if level > self.capture_peak {
            self.capture_peak = level;
        }
        if level >= CLIP_LEVEL {
            self.clipped += 1;
        }
        if self.capture.len() >= self.capture_len {
            self.phase = AnalyzerPhase::Correlating;
        }
    }

    /// Advance one frame, returning the sample for the output channel
    #[inline]
    fn process_frame(&mut self, input: f32) -> f32 {
        match self.phase {
            AnalyzerPhase::Priming => {
                self.noise_energy += input as f64 * input as f64;
                self.noise_frames += 1;
                0.0
            }
            AnalyzerPhase::SendingProbe => {
                if self.quiet_remaining > 0 {
                    self.quiet_remaining -= 1;
                    return 0.0;
                }
                self.emitter.write(self.probe.sample(self.emitted));
                let out = self.emitter.read_at(self.config.probe_offset_frames);
                self.emitted += 1;
                self.record(input);
                if self.emitted >= self.emit_len && self.phase == AnalyzerPhase::SendingProbe {
                    self.phase = AnalyzerPhase::CapturingEcho;
                }
                out
            }
            AnalyzerPhase::CapturingEcho => {
                self.record(input);
                0.0
            }
            _ => 0.0,
        }
    }

    /// Process one period of interleaved audio
    ///
    /// Input shorter than the output is treated as silence for the missing
    /// frames; extra input frames are ignored. Either mismatch counts as a
    /// degraded period.
    pub fn process(
        &mut self,
        input: &[f32],
        num_input_frames: usize,
        output: &mut [f32],
        num_output_frames: usize,
    ) {
        if self.phase == AnalyzerPhase::MeasurementComplete {
            self.advance();
        }

        let in_ch = self.input_channels;
        let out_ch = self.output_channels;
        let input_frames = num_input_frames.min(input.len() / in_ch);
        let frames = num_output_frames.min(output.len() / out_ch);
        if input_frames != frames {
            self.degraded_periods += 1;
            if self.degraded_periods == 1 {
                tracing::warn!(
                    input_frames,
                    output_frames = frames,
                    "Input and output period sizes differ"
                );
            }
        }

        output.fill(0.0);
        for frame in 0..frames {
            let sample = if frame < input_frames {
                input[frame * in_ch + self.input_channel]
            } else {
                0.0
            };
            output[frame * out_ch + self.output_channel] = self.process_frame(sample);
        }

        if self.phase == AnalyzerPhase::Priming {
            self.priming_done += 1;
            if self.priming_done >= self.config.priming_periods {
                tracing::debug!(noise_rms = self.noise_rms(), "Priming finished");
                self.begin_pass();
            }
        }

        if self.phase == AnalyzerPhase::Correlating {
            self.analyze_data();
        }

        self.progress += 1;
        self.publish();
    }

    fn publish(&self) {
        if let Some(publisher) = &self.publisher {
            publisher.snapshot.store(self.snapshot());
        }
    }

    /// Consistent copy of the current state
    pub fn snapshot(&self) -> AnalyzerSnapshot {
        let (latency_frames, confidence) = if self.phase.is_terminal() {
            (self.latency_frames, self.confidence)
        } else {
            self.running_estimate()
        };
        AnalyzerSnapshot {
            phase: self.phase,
            result: if self.phase.is_terminal() {
                self.result
            } else {
                ResultCode::InvalidState
            },
            progress: self.progress,
            iterations: self.iterations,
            accepted: self.accepted.len() as u32,
            sample_rate: self.sample_rate,
            latency_frames,
            confidence,
            degraded_periods: self.degraded_periods,
        }
    }

    /// Latest accepted delay and confidence while still running
    fn running_estimate(&self) -> (f64, f32) {
        self.accepted
            .last()
            .map(|m| (m.delay_frames, m.confidence))
            .unwrap_or((0.0, 0.0))
    }

    pub fn report(&self) -> LatencyReport {
        LatencyReport::from(self.snapshot())
    }

    /// True once `Done` or `Failed`
    pub fn is_done(&self) -> bool {
        self.phase.is_terminal()
    }

    pub fn phase(&self) -> AnalyzerPhase {
        self.phase
    }

    pub fn result(&self) -> ResultCode {
        self.result
    }

    pub fn measurements(&self) -> &[Measurement] {
        &self.accepted
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    pub fn probe(&self) -> &ProbeSignal {
        &self.probe
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Frames in one capture window
    pub fn capture_len(&self) -> usize {
        self.capture_len
    }

    /// Background level measured while priming
    pub fn noise_rms(&self) -> f64 {
        if self.noise_frames == 0 {
            0.0
        } else {
            (self.noise_energy / self.noise_frames as f64).sqrt()
        }
    }
}

impl DuplexCallback for LatencyAnalyzer {
    fn prepare(&mut self, format: &DuplexFormat) {
        if format.sample_rate > 0 {
            self.sample_rate = format.sample_rate;
        }
        self.input_channels = format.input_channels.max(1) as usize;
        self.output_channels = format.output_channels.max(1) as usize;

        self.input_channel = self.config.input_channel as usize;
        if self.input_channel >= self.input_channels {
            tracing::warn!(
                requested = self.input_channel,
                available = self.input_channels,
                "Input channel out of range, using channel 0"
            );
            self.input_channel = 0;
        }
        self.output_channel = self.config.output_channel as usize;
        if self.output_channel >= self.output_channels {
            tracing::warn!(
                requested = self.output_channel,
                available = self.output_channels,
                "Output channel out of range, using channel 0"
            );
            self.output_channel = 0;
        }
        self.reset();
    }

    fn on_both_streams_ready(
        &mut self,
        input: &[f32],
        num_input_frames: usize,
        output: &mut [f32],
        num_output_frames: usize,
    ) -> CallbackResult {
        if self.phase.is_terminal() {
            output.fill(0.0);
            return CallbackResult::Stop;
        }
        self.process(input, num_input_frames, output, num_output_frames);
        CallbackResult::Continue
    }
}

impl std::fmt::Debug for LatencyAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LatencyAnalyzer")
            .field("phase", &self.phase)
            .field("result", &self.result)
            .field("iterations", &self.iterations)
            .field("accepted", &self.accepted.len())
            .field("capture_len", &self.capture_len)
            .finish()
    }
}
