//! Fixed-capacity circular sample buffer with fractional-index reads
//!
//! Used in three places:
//! - as the probe emitter, so the probe can be played back shifted by a
//!   fraction of a sample
//! - as the capture window, so the correlator can resample captured audio
//!   at sub-sample offsets
//! - inside the simulated loopback, to inject an exact fractional delay
//!
//! Reads are expressed as a delay relative to the most recently written
//! sample. Any tap that lands on memory that has not been written yet, or
//! beyond the capacity, reads as silence. Nothing here allocates after
//! construction, so every method is safe to call from an audio callback.

use serde::{Deserialize, Serialize};

/// Interpolation used for fractional reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterpolationMode {
    /// 2-point linear interpolation
    Linear,
    /// 4-point cubic Hermite (Catmull-Rom) interpolation
    #[default]
    Cubic,
}

/// Circular delay line with interpolated reads
///
/// # Example
/// ```
/// use latencytester_core::audio::delay_line::{InterpolatingDelayLine, InterpolationMode};
///
/// let mut line = InterpolatingDelayLine::new(8, InterpolationMode::Linear);
/// line.write(1.0);
/// line.write(3.0);
///
/// assert_eq!(line.read_at(0.0), 3.0);
/// assert_eq!(line.read_at(0.5), 2.0);
/// // Nothing has been written three samples back yet
/// assert_eq!(line.read_at(2.0), 0.0);
/// ```
#[derive(Debug, Clone)]
pub struct InterpolatingDelayLine {
    /// Sample storage, `capacity` long
    buffer: Vec<f32>,
    /// Index the next sample will be written to
    write_pos: usize,
    /// Samples written since construction or the last clear
    written: u64,
    /// Interpolation used by `read_at`
    mode: InterpolationMode,
}

impl InterpolatingDelayLine {
    /// Create a delay line holding `capacity` samples
    ///
    /// A zero capacity is bumped to one so the index arithmetic never divides
    /// by zero.
    pub fn new(capacity: usize, mode: InterpolationMode) -> Self {
        Self {
            buffer: vec![0.0; capacity.max(1)],
            write_pos: 0,
            written: 0,
            mode,
        }
    }

    /// Append one sample, overwriting the oldest once full
    #[inline]
    pub fn write(&mut self, sample: f32) {
        self.buffer[self.write_pos] = sample;
        self.write_pos += 1;
        if self.write_pos == self.buffer.len() {
            self.write_pos = 0;
        }
        self.written += 1;
    }

    /// Append a block of samples
    pub fn write_slice(&mut self, samples: &[f32]) {
        for &sample in samples {
            self.write(sample);
        }
    }

    /// Read the sample exactly `delay` samples behind the newest one
    ///
    /// Returns silence for taps outside written memory.
    #[inline]
    pub fn sample_at(&self, delay: usize) -> f32 {
        let capacity = self.buffer.len();
        if delay >= capacity || delay as u64 >= self.written {
            return 0.0;
        }
        let index = (self.write_pos + capacity - 1 - delay) % capacity;
        self.buffer[index]
    }

    /// Read an interpolated value `delay` samples behind the newest one
    ///
    /// `delay` must lie in `0.0..=capacity - 1`. Anything else, NaN included,
    /// returns silence rather than failing.
    pub fn read_at(&self, delay: f64) -> f32 {
        let max_delay = (self.buffer.len() - 1) as f64;
        if !(0.0..=max_delay).contains(&delay) {
            return 0.0;
        }

        let whole = delay.floor();
        let index = whole as usize;
        let frac = (delay - whole) as f32;

        match self.mode {
            InterpolationMode::Linear => {
                let s0 = self.sample_at(index);
                if frac == 0.0 {
                    return s0;
                }
                let s1 = self.sample_at(index + 1);
                s0 + frac * (s1 - s0)
            }
            InterpolationMode::Cubic => {
                // y_m1 is the newer neighbour; at delay 0 there is none, so
                // the newest sample is repeated.
                let y_m1 = self.sample_at(index.saturating_sub(1));
                let y_0 = self.sample_at(index);
                if frac == 0.0 {
                    return y_0;
                }
                let y_1 = self.sample_at(index + 1);
                let y_2 = self.sample_at(index + 2);

                let c0 = y_0;
                let c1 = 0.5 * (y_1 - y_m1);
                let c2 = y_m1 - 2.5 * y_0 + 2.0 * y_1 - 0.5 * y_2;
                let c3 = 0.5 * (y_2 - y_m1) + 1.5 * (y_0 - y_1);

                ((c3 * frac + c2) * frac + c1) * frac + c0
            }
        }
    }

    /// Copy the readable samples, oldest first, into `dst`
    ///
    /// If `dst` is shorter than [`Self::len`], only the most recent samples
    /// are copied. Returns the number of samples written to `dst`.
    pub fn copy_ordered(&self, dst: &mut [f32]) -> usize {
        let count = self.len().min(dst.len());
        for (i, slot) in dst[..count].iter_mut().enumerate() {
            *slot = self.sample_at(count - 1 - i);
        }
        count
    }

    /// Number of samples that can currently be read
    pub fn len(&self) -> usize {
        self.written.min(self.buffer.len() as u64) as usize
    }

    /// True until the first sample is written
    pub fn is_empty(&self) -> bool {
        self.written == 0
    }

    /// True once every slot holds written data
    pub fn is_full(&self) -> bool {
        self.written >= self.buffer.len() as u64
    }

    /// Maximum number of samples held
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Total samples written, including overwritten ones
    pub fn total_written(&self) -> u64 {
        self.written
    }

    /// Interpolation mode in use
    pub fn mode(&self) -> InterpolationMode {
        self.mode
    }

    /// Change the interpolation mode
    pub fn set_mode(&mut self, mode: InterpolationMode) {
        self.mode = mode;
    }

    /// Zero the storage and forget everything written
    pub fn clear(&mut self) {
        self.buffer.fill(0.0);
        self.write_pos = 0;
        self.written = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn ramp(capacity: usize, count: usize, mode: InterpolationMode) -> InterpolatingDelayLine {
        let mut line = InterpolatingDelayLine::new(capacity, mode);
        for i in 0..count {
            line.write(i as f32);
        }
        line
    }

    #[test]
    fn test_integer_reads() {
        let line = ramp(16, 10, InterpolationMode::Linear);
        assert_eq!(line.read_at(0.0), 9.0);
        assert_eq!(line.read_at(3.0), 6.0);
        assert_eq!(line.read_at(9.0), 0.0);
    }

    #[test]
    fn test_linear_fraction() {
        let line = ramp(16, 10, InterpolationMode::Linear);
        assert_relative_eq!(line.read_at(2.25), 6.75, epsilon = 1e-6);
    }

    #[test]
    fn test_cubic_reproduces_ramp() {
        // Hermite interpolation is exact on linear data away from the edges
        let line = ramp(32, 20, InterpolationMode::Cubic);
        for &delay in &[1.5, 4.3, 10.75] {
            let expected = 19.0 - delay as f32;
            assert_relative_eq!(line.read_at(delay), expected, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_unwritten_reads_silence() {
        let line = ramp(16, 4, InterpolationMode::Linear);
        assert_eq!(line.read_at(4.0), 0.0);
        assert_eq!(line.read_at(7.5), 0.0);
        assert_eq!(line.len(), 4);
        assert!(!line.is_full());
    }

    #[test]
    fn test_reads_beyond_capacity_are_silent() {
        let capacity = 8;
        let line = ramp(capacity, 100, InterpolationMode::Cubic);
        assert!(line.is_full());
        for &eps in &[0.0, 0.001, 0.5, 1.0, 1000.0] {
            assert_eq!(line.read_at(capacity as f64 + eps), 0.0);
        }
        assert_eq!(line.read_at(-0.5), 0.0);
        assert_eq!(line.read_at(f64::NAN), 0.0);
        // The last valid tap still reads real data
        assert_eq!(line.read_at((capacity - 1) as f64), 92.0);
    }

    #[test]
    fn test_overwrites_oldest() {
        let line = ramp(4, 6, InterpolationMode::Linear);
        assert_eq!(line.read_at(0.0), 5.0);
        assert_eq!(line.read_at(3.0), 2.0);
        assert_eq!(line.total_written(), 6);
    }

    #[test]
    fn test_copy_ordered() {
        let line = ramp(4, 6, InterpolationMode::Linear);
        let mut out = [0.0f32; 4];
        assert_eq!(line.copy_ordered(&mut out), 4);
        assert_eq!(out, [2.0, 3.0, 4.0, 5.0]);

        let mut short = [0.0f32; 2];
        assert_eq!(line.copy_ordered(&mut short), 2);
        assert_eq!(short, [4.0, 5.0]);
    }

    #[test]
    fn test_clear() {
        let mut line = ramp(8, 8, InterpolationMode::Linear);
        line.clear();
        assert!(line.is_empty());
        assert_eq!(line.read_at(0.0), 0.0);
    }

    #[test]
    fn test_zero_capacity_is_usable() {
        let mut line = InterpolatingDelayLine::new(0, InterpolationMode::Linear);
        line.write(1.0);
        assert_eq!(line.capacity(), 1);
        assert_eq!(line.read_at(0.0), 1.0);
    }
}
