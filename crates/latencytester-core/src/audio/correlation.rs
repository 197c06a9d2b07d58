//! FFT cross-correlation of the probe against the capture window
//!
//! All FFT plans and scratch buffers are created up front, so
//! [`Correlator::correlate`] does not allocate and can run inside an audio
//! callback. One call correlates one full capture window.

use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use serde::{Deserialize, Serialize};

use super::delay_line::InterpolatingDelayLine;
use super::probe::ProbeSignal;

/// Golden ratio conjugate used by the resampled peak search
const INV_PHI: f64 = 0.618_033_988_749_894_8;

/// Iterations of golden-section search (interval shrinks to ~1e-5 frames)
const GOLDEN_ITERATIONS: usize = 24;

/// How the integer correlation peak is refined to sub-sample precision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeakFit {
    /// Integer argmax, no refinement
    Integer,
    /// Parabola through the peak and its two neighbours
    Parabolic,
    /// Parabola through the log magnitudes (exact for a Gaussian main lobe)
    #[default]
    Gaussian,
    /// Golden-section search over correlations evaluated on the
    /// interpolated capture window
    Resampled,
}

/// Result of correlating one capture window
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CorrelationPeak {
    /// Integer lag of the largest correlation magnitude
    pub lag: usize,
    /// Refined delay in (fractional) frames
    pub delay_frames: f64,
    /// Raw correlation magnitude at `lag`
    pub peak: f32,
    /// Peak normalized by probe and capture-segment energies (0.0 to 1.0)
    pub normalized_peak: f32,
    /// Mean correlation magnitude over all candidate lags
    pub mean_magnitude: f32,
    /// Peak strength relative to background correlation (0.0 to 1.0)
    pub confidence: f32,
    /// RMS of the capture segment aligned with the peak
    pub echo_rms: f32,
}

/// FFT-based cross-correlator with pre-allocated buffers
pub struct Correlator {
    probe: Vec<f32>,
    probe_energy: f64,
    capture_len: usize,
    fft_size: usize,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
    /// Conjugated spectrum of the zero-padded probe
    probe_fft: Vec<Complex<f32>>,
    spectrum: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
    /// Capture window copied out of the delay line, oldest first
    capture: Vec<f32>,
    /// Running sum of squared capture samples, `capture_len + 1` long
    prefix_energy: Vec<f64>,
    peak_fit: PeakFit,
}

impl Correlator {
    /// Plan FFTs for correlating `probe` against windows of `capture_len`
    ///
    /// `capture_len` is raised to the probe length if shorter.
    pub fn new(probe: &ProbeSignal, capture_len: usize, peak_fit: PeakFit) -> Self {
        let capture_len = capture_len.max(probe.len());
        let fft_size = (capture_len + probe.len()).next_power_of_two();

        let mut planner = FftPlanner::new();
        let forward = planner.plan_fft_forward(fft_size);
        let inverse = planner.plan_fft_inverse(fft_size);

        let scratch_len = forward
            .get_inplace_scratch_len()
            .max(inverse.get_inplace_scratch_len());

        let mut correlator = Self {
            probe: probe.samples().to_vec(),
            probe_energy: probe.energy(),
            capture_len,
            fft_size,
            forward,
            inverse,
            probe_fft: vec![Complex::new(0.0, 0.0); fft_size],
            spectrum: vec![Complex::new(0.0, 0.0); fft_size],
            scratch: vec![Complex::new(0.0, 0.0); scratch_len],
            capture: vec![0.0; capture_len],
            prefix_energy: vec![0.0; capture_len + 1],
            peak_fit,
        };
        correlator.load_probe_spectrum();
        correlator
    }

    /// Switch to another probe of the same length without allocating
    ///
    /// A probe of a different length is ignored and false is returned.
    pub fn set_probe(&mut self, probe: &ProbeSignal) -> bool {
        if probe.len() != self.probe.len() {
            return false;
        }
        self.probe.copy_from_slice(probe.samples());
        self.probe_energy = probe.energy();
        self.load_probe_spectrum();
        true
    }

    fn load_probe_spectrum(&mut self) {
        let padded = self.probe.iter().copied().chain(std::iter::repeat(0.0));
        for (slot, x) in self.probe_fft.iter_mut().zip(padded) {
            *slot = Complex::new(x, 0.0);
        }
        self.forward
            .process_with_scratch(&mut self.probe_fft, &mut self.scratch);

        // Conjugate for correlation
        for c in &mut self.probe_fft {
            c.im = -c.im;
        }
    }

    /// Correlate a full capture window
    ///
    /// The window must hold at least `capture_len` samples, the most recent
    /// `capture_len` of which are correlated with lag 0 at the oldest one.
    /// Returns `None` for a window that is not full yet.
    pub fn correlate(&mut self, window: &InterpolatingDelayLine) -> Option<CorrelationPeak> {
        if window.len() < self.capture_len || self.probe.is_empty() {
            return None;
        }
        window.copy_ordered(&mut self.capture);

        for (slot, &x) in self.spectrum.iter_mut().zip(self.capture.iter()) {
            *slot = Complex::new(x, 0.0);
        }
        for slot in &mut self.spectrum[self.capture_len..] {
            *slot = Complex::new(0.0, 0.0);
        }

        self.forward
            .process_with_scratch(&mut self.spectrum, &mut self.scratch);
        for (s, p) in self.spectrum.iter_mut().zip(&self.probe_fft) {
            *s *= *p;
        }
        self.inverse
            .process_with_scratch(&mut self.spectrum, &mut self.scratch);

        self.prefix_energy[0] = 0.0;
        for (i, &x) in self.capture.iter().enumerate() {
            self.prefix_energy[i + 1] = self.prefix_energy[i] + x as f64 * x as f64;
        }

        let norm = 1.0 / self.fft_size as f32;
        let max_lag = self.max_lag();
        let mut peak = 0.0f32;
        let mut lag = 0usize;
        let mut sum = 0.0f64;
        for (k, c) in self.spectrum.iter().take(max_lag + 1).enumerate() {
            let magnitude = (c.re * norm).abs();
            sum += magnitude as f64;
            if magnitude > peak {
                peak = magnitude;
                lag = k;
            }
        }
        let mean_magnitude = (sum / (max_lag + 1) as f64) as f32;

        let segment_energy = self.segment_energy(lag);
        let denominator = (self.probe_energy * segment_energy).sqrt();
        let normalized_peak = if denominator > 1e-12 {
            (peak as f64 / denominator).min(1.0) as f32
        } else {
            0.0
        };
        let confidence = if peak > 0.0 {
            (normalized_peak * (1.0 - mean_magnitude / peak)).clamp(0.0, 1.0)
        } else {
            0.0
        };

        let delay_frames = match self.peak_fit {
            PeakFit::Integer => lag as f64,
            PeakFit::Parabolic => lag as f64 + self.parabolic_offset(lag, false),
            PeakFit::Gaussian => lag as f64 + self.parabolic_offset(lag, true),
            PeakFit::Resampled => {
                let start = lag as f64 + self.parabolic_offset(lag, true);
                let sign = if self.spectrum[lag].re < 0.0 { -1.0 } else { 1.0 };
                self.resampled_peak(window, start, sign)
            }
        };

        Some(CorrelationPeak {
            lag,
            delay_frames,
            peak,
            normalized_peak,
            mean_magnitude,
            confidence,
            echo_rms: (segment_energy / self.probe.len() as f64).sqrt() as f32,
        })
    }

    /// Energy of the capture segment starting at `lag`, one probe long
    fn segment_energy(&self, lag: usize) -> f64 {
        let end = (lag + self.probe.len()).min(self.capture_len);
        (self.prefix_energy[end] - self.prefix_energy[lag]).max(0.0)
    }

    fn magnitude(&self, lag: usize) -> f32 {
        (self.spectrum[lag].re / self.fft_size as f32).abs()
    }

    /// Vertex offset of a parabola through the peak and its neighbours
    ///
    /// With `log` set, the parabola is fitted to log magnitudes. Falls back
    /// to linear magnitudes when a neighbour is not positive.
    fn parabolic_offset(&self, lag: usize, log: bool) -> f64 {
        if lag == 0 || lag >= self.max_lag() {
            return 0.0;
        }
        let mut y_prev = self.magnitude(lag - 1) as f64;
        let mut y_peak = self.magnitude(lag) as f64;
        let mut y_next = self.magnitude(lag + 1) as f64;

        if log && y_prev > 0.0 && y_next > 0.0 && y_peak > 0.0 {
            y_prev = y_prev.ln();
            y_peak = y_peak.ln();
            y_next = y_next.ln();
        }

        let denominator = y_prev - 2.0 * y_peak + y_next;
        if denominator >= 0.0 {
            return 0.0;
        }
        (0.5 * (y_prev - y_next) / denominator).clamp(-0.5, 0.5)
    }

    /// Correlation of the probe against the window shifted by a fractional lag
    fn correlation_at(&self, window: &InterpolatingDelayLine, lag: f64) -> f64 {
        let newest = (window.len() - 1) as f64;
        self.probe
            .iter()
            .enumerate()
            .map(|(i, &p)| p as f64 * window.read_at(newest - (lag + i as f64)) as f64)
            .sum()
    }

    /// Golden-section search for the correlation maximum within half a
    /// frame of `start`
    fn resampled_peak(&self, window: &InterpolatingDelayLine, start: f64, sign: f64) -> f64 {
        let mut low = (start - 0.5).max(0.0);
        let mut high = (start + 0.5).min(self.max_lag() as f64);
        if high <= low {
            return start;
        }

        let mut x1 = high - INV_PHI * (high - low);
        let mut x2 = low + INV_PHI * (high - low);
        let mut f1 = sign * self.correlation_at(window, x1);
        let mut f2 = sign * self.correlation_at(window, x2);

        for _ in 0..GOLDEN_ITERATIONS {
            if f1 < f2 {
                low = x1;
                x1 = x2;
                f1 = f2;
                x2 = low + INV_PHI * (high - low);
                f2 = sign * self.correlation_at(window, x2);
            } else {
                high = x2;
                x2 = x1;
                f2 = f1;
                x1 = high - INV_PHI * (high - low);
                f1 = sign * self.correlation_at(window, x1);
            }
        }

        0.5 * (low + high)
    }

    /// Largest candidate lag
    pub fn max_lag(&self) -> usize {
        self.capture_len - self.probe.len()
    }

    /// Capture window length this correlator expects
    pub fn capture_len(&self) -> usize {
        self.capture_len
    }

    /// FFT size in use
    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    /// Peak refinement method
    pub fn peak_fit(&self) -> PeakFit {
        self.peak_fit
    }
}

impl std::fmt::Debug for Correlator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correlator")
            .field("probe_len", &self.probe.len())
            .field("capture_len", &self.capture_len)
            .field("fft_size", &self.fft_size)
            .field("peak_fit", &self.peak_fit)
            .finish()
    }
}
