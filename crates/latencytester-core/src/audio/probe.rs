//! Probe signal generation
//!
//! The probe is a short burst of pseudo-random wideband noise. Noise gives a
//! single sharp, unambiguous correlation peak, unlike tones whose
//! correlation repeats every period. The burst is lightly low-passed so the
//! correlation main lobe spans a few samples, which is what lets the
//! analyzer fit the peak position to a fraction of a sample.
//!
//! Generation is deterministic: the same seed and length always produce a
//! bit-identical probe.

/// Default LCG seed for probe generation
pub const DEFAULT_PROBE_SEED: u32 = 0xDEADBEEF;

/// Default probe amplitude (-6dB for headroom)
pub const DEFAULT_PROBE_AMPLITUDE: f32 = 0.5;

/// Binomial smoothing kernel applied to the raw noise
const SMOOTHING_KERNEL: [f32; 5] = [1.0 / 16.0, 4.0 / 16.0, 6.0 / 16.0, 4.0 / 16.0, 1.0 / 16.0];

/// Longest raised-cosine fade applied to either end of the burst
const MAX_FADE_SAMPLES: usize = 64;

/// Linear congruential white noise source
///
/// Same constants as glibc's `rand()`. Output is uniform in `-1.0..1.0`.
#[derive(Debug, Clone)]
pub struct NoiseGenerator {
    state: u32,
}

impl NoiseGenerator {
    /// Create a generator from a seed
    pub fn new(seed: u32) -> Self {
        Self { state: seed }
    }

    /// Next noise sample in `-1.0..1.0`
    #[inline]
    pub fn next_sample(&mut self) -> f32 {
        self.state = self.state.wrapping_mul(1103515245).wrapping_add(12345);
        let bits = (self.state >> 16) & 0x7FFF;
        (bits as f32 / 16384.0) - 1.0
    }
}

/// Precomputed probe waveform
///
/// Generated bursts can be regenerated in place for the next measurement
/// pass with [`ProbeSignal::reseed`].
///
/// # Example
/// ```
/// use latencytester_core::audio::probe::ProbeSignal;
///
/// let a = ProbeSignal::noise_burst(1024, 42, 0.5);
/// let b = ProbeSignal::noise_burst(1024, 42, 0.5);
/// assert_eq!(a.samples(), b.samples());
/// assert!(a.peak() <= 0.5);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeSignal {
    samples: Vec<f32>,
    energy: f64,
    /// Generator settings, `None` for waveforms supplied by the caller
    burst: Option<BurstParams>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct BurstParams {
    seed: u32,
    amplitude: f32,
}

/// Seed for measurement pass `pass`, pass 0 using `base` itself
///
/// Each pass plays a different burst, so an echo left over from an earlier
/// pass does not correlate with the current probe.
pub fn pass_seed(base: u32, pass: u32) -> u32 {
    base.wrapping_add(pass.wrapping_mul(0x9E37_79B9))
}

/// Render a smoothed, faded noise burst into `samples` without allocating
fn render_burst(samples: &mut [f32], seed: u32, amplitude: f32) {
    const TAPS: usize = SMOOTHING_KERNEL.len();
    let mut noise = NoiseGenerator::new(seed);
    let mut window = [0.0f32; TAPS];
    for slot in window.iter_mut().take(TAPS - 1) {
        *slot = noise.next_sample();
    }
    for sample in samples.iter_mut() {
        window[TAPS - 1] = noise.next_sample();
        *sample = window.iter().zip(&SMOOTHING_KERNEL).map(|(x, k)| x * k).sum();
        window.rotate_left(1);
    }

    let length = samples.len();
    let fade = (length / 8).min(MAX_FADE_SAMPLES);
    for i in 0..fade {
        let phase = std::f32::consts::PI * (i as f32 + 0.5) / fade as f32;
        let gain = 0.5 * (1.0 - phase.cos());
        samples[i] *= gain;
        samples[length - 1 - i] *= gain;
    }

    let peak = samples.iter().fold(0.0f32, |m, x| m.max(x.abs()));
    if peak > 0.0 {
        let scale = amplitude.clamp(0.0, 1.0) / peak;
        for sample in samples.iter_mut() {
            *sample *= scale;
        }
    }
}

fn energy_of(samples: &[f32]) -> f64 {
    samples.iter().map(|&x| x as f64 * x as f64).sum()
}

impl ProbeSignal {
    /// Generate a smoothed, faded noise burst
    ///
    /// # Arguments
    /// * `length` - Probe length in frames
    /// * `seed` - LCG seed
    /// * `amplitude` - Peak absolute value of the result (0.0 to 1.0)
    pub fn noise_burst(length: usize, seed: u32, amplitude: f32) -> Self {
        let mut samples = vec![0.0f32; length];
        render_burst(&mut samples, seed, amplitude);
        Self {
            energy: energy_of(&samples),
            samples,
            burst: Some(BurstParams { seed, amplitude }),
        }
    }

    /// Regenerate a noise burst in place from a new seed
    ///
    /// Returns true when the waveform changed. Waveforms built with
    /// [`ProbeSignal::from_samples`] are left alone. Does not allocate.
    pub fn reseed(&mut self, seed: u32) -> bool {
        let Some(burst) = self.burst.as_mut() else {
            return false;
        };
        if burst.seed == seed {
            return false;
        }
        burst.seed = seed;
        let amplitude = burst.amplitude;
        render_burst(&mut self.samples, seed, amplitude);
        self.energy = energy_of(&self.samples);
        true
    }

    /// Seed of a generated burst
    pub fn seed(&self) -> Option<u32> {
        self.burst.map(|b| b.seed)
    }

    /// Wrap an arbitrary waveform as a probe
    pub fn from_samples(samples: Vec<f32>) -> Self {
        Self {
            energy: energy_of(&samples),
            samples,
            burst: None,
        }
    }

    /// Probe waveform
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Sample at `index`, zero past the end
    #[inline]
    pub fn sample(&self, index: usize) -> f32 {
        self.samples.get(index).copied().unwrap_or(0.0)
    }

    /// Probe length in frames
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True for a zero-length probe
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Sum of squares
    pub fn energy(&self) -> f64 {
        self.energy
    }

    /// Root-mean-square level
    pub fn rms(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            (self.energy / self.samples.len() as f64).sqrt()
        }
    }

    /// Largest absolute sample value
    pub fn peak(&self) -> f32 {
        self.samples.iter().fold(0.0f32, |m, x| m.max(x.abs()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noise_distribution() {
        let mut gen = NoiseGenerator::new(DEFAULT_PROBE_SEED);
        let mut min = f32::MAX;
        let mut max = f32::MIN;
        let mut sum = 0.0f32;
        let n = 1000;

        for _ in 0..n {
            let noise = gen.next_sample();
            min = min.min(noise);
            max = max.max(noise);
            sum += noise;
        }

        assert!(min < -0.8, "Min noise should be < -0.8, got {}", min);
        assert!(max > 0.8, "Max noise should be > 0.8, got {}", max);
        assert!((sum / n as f32).abs() < 0.1, "Mean noise should be near 0");
    }

    #[test]
    fn test_probe_length_and_amplitude() {
        let probe = ProbeSignal::noise_burst(2048, DEFAULT_PROBE_SEED, 0.5);
        assert_eq!(probe.len(), 2048);
        assert!((probe.peak() - 0.5).abs() < 1e-6);
        assert!(probe.energy() > 10.0, "Probe should carry energy");
    }

    #[test]
    fn test_same_seed_is_bit_identical() {
        let a = ProbeSignal::noise_burst(512, 7, 0.5);
        let b = ProbeSignal::noise_burst(512, 7, 0.5);
        let bits_a: Vec<u32> = a.samples().iter().map(|x| x.to_bits()).collect();
        let bits_b: Vec<u32> = b.samples().iter().map(|x| x.to_bits()).collect();
        assert_eq!(bits_a, bits_b);
    }

    #[test]
    fn test_different_seed_differs() {
        let a = ProbeSignal::noise_burst(512, 1, 0.5);
        let b = ProbeSignal::noise_burst(512, 2, 0.5);
        assert_ne!(a.samples(), b.samples());
    }

    #[test]
    fn test_fades_to_silence_at_edges() {
        let probe = ProbeSignal::noise_burst(1024, DEFAULT_PROBE_SEED, 0.5);
        let first = probe.samples()[0].abs();
        let last = probe.samples()[probe.len() - 1].abs();
        assert!(first < 0.01, "Probe should fade in, first sample {}", first);
        assert!(last < 0.01, "Probe should fade out, last sample {}", last);
    }

    #[test]
    fn test_autocorrelation_peak_is_sharp() {
        let probe = ProbeSignal::noise_burst(2048, DEFAULT_PROBE_SEED, 0.5);
        let s = probe.samples();
        let corr = |lag: usize| -> f64 {
            s.iter()
                .zip(&s[lag..])
                .map(|(a, b)| *a as f64 * *b as f64)
                .sum()
        };
        let zero = corr(0);
        assert!(corr(1) < zero);
        assert!(corr(1) > 0.0, "Main lobe should span neighbouring lags");
        for lag in 8..64 {
            assert!(
                corr(lag).abs() < zero * 0.2,
                "Side lobe at lag {} too large",
                lag
            );
        }
    }

    #[test]
    fn test_reseed_matches_fresh_burst() {
        let mut probe = ProbeSignal::noise_burst(1024, DEFAULT_PROBE_SEED, 0.5);
        assert!(probe.reseed(99));
        assert_eq!(probe, ProbeSignal::noise_burst(1024, 99, 0.5));
        assert_eq!(probe.seed(), Some(99));
        assert!(!probe.reseed(99), "Same seed leaves the waveform alone");
    }

    #[test]
    fn test_custom_waveform_is_not_reseeded() {
        let mut probe = ProbeSignal::from_samples(vec![0.0, 1.0, 0.0]);
        assert!(!probe.reseed(5));
        assert_eq!(probe.samples(), &[0.0, 1.0, 0.0]);
        assert_eq!(probe.seed(), None);
    }

    #[test]
    fn test_pass_bursts_are_uncorrelated() {
        assert_eq!(pass_seed(DEFAULT_PROBE_SEED, 0), DEFAULT_PROBE_SEED);
        let a = ProbeSignal::noise_burst(1024, pass_seed(DEFAULT_PROBE_SEED, 0), 0.5);
        let b = ProbeSignal::noise_burst(1024, pass_seed(DEFAULT_PROBE_SEED, 1), 0.5);
        let (sa, sb) = (a.samples(), b.samples());
        let norm = (a.energy() * b.energy()).sqrt();

        for lag in 0..256 {
            let forward: f64 = sa[lag..]
                .iter()
                .zip(sb)
                .map(|(x, y)| *x as f64 * *y as f64)
                .sum();
            let backward: f64 = sb[lag..]
                .iter()
                .zip(sa)
                .map(|(x, y)| *x as f64 * *y as f64)
                .sum();
            assert!(
                forward.abs() / norm < 0.3 && backward.abs() / norm < 0.3,
                "Bursts of consecutive passes correlate at lag {}",
                lag
            );
        }
    }

    #[test]
    fn test_sample_past_end_is_zero() {
        let probe = ProbeSignal::noise_burst(16, 3, 0.5);
        assert_eq!(probe.sample(16), 0.0);
        assert_eq!(probe.sample(1000), 0.0);
    }
}
