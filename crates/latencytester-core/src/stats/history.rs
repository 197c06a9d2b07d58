//! Measurement history for the control thread
//!
//! Stores accepted measurements with the wall-clock time they were collected
//! and keeps running statistics over them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::audio::report::{frames_to_ms, Measurement};

/// Maximum number of measurements kept
const MAX_HISTORY_SIZE: usize = 1024;

/// A measurement with its collection time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedMeasurement {
    /// When the control thread received it
    pub timestamp: DateTime<Utc>,
    /// Latency in milliseconds at the run's sample rate
    pub latency_ms: f64,
    #[serde(flatten)]
    pub measurement: Measurement,
}

/// Running statistics over the recorded measurements
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningStats {
    /// Most recent latency (ms)
    pub current_latency: f64,
    /// Minimum latency observed (ms)
    pub min_latency: f64,
    /// Maximum latency observed (ms)
    pub max_latency: f64,
    /// Average latency over the kept history (ms)
    pub avg_latency: f64,
    /// Standard deviation over the kept history (ms)
    pub jitter: f64,
    /// Measurement count since the last clear
    pub measurement_count: u64,
    /// Last correlation confidence (0.0 to 1.0)
    pub last_confidence: f32,
}

impl Default for RunningStats {
    fn default() -> Self {
        Self {
            current_latency: 0.0,
            min_latency: f64::MAX,
            max_latency: 0.0,
            avg_latency: 0.0,
            jitter: 0.0,
            measurement_count: 0,
            last_confidence: 0.0,
        }
    }
}

/// Bounded measurement history
#[derive(Debug)]
pub struct MeasurementHistory {
    entries: VecDeque<TimedMeasurement>,
    max_size: usize,
    stats: RunningStats,
}

impl MeasurementHistory {
    pub fn new() -> Self {
        Self::with_capacity(MAX_HISTORY_SIZE)
    }

    /// History keeping at most `max_size` entries
    pub fn with_capacity(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            entries: VecDeque::with_capacity(max_size.min(MAX_HISTORY_SIZE)),
            max_size,
            stats: RunningStats::default(),
        }
    }

    /// Record a measurement
    ///
    /// # Arguments
    /// * `measurement` - Accepted measurement from the analyzer
    /// * `sample_rate` - Rate used to convert frames to milliseconds
    pub fn record(&mut self, measurement: Measurement, sample_rate: u32) {
        let latency_ms = frames_to_ms(measurement.delay_frames, sample_rate);
        if self.entries.len() >= self.max_size {
            self.entries.pop_front();
        }
        self.entries.push_back(TimedMeasurement {
            timestamp: Utc::now(),
            latency_ms,
            measurement,
        });

        self.stats.current_latency = latency_ms;
        self.stats.min_latency = self.stats.min_latency.min(latency_ms);
        self.stats.max_latency = self.stats.max_latency.max(latency_ms);
        self.stats.measurement_count += 1;
        self.stats.last_confidence = measurement.confidence;

        let n = self.entries.len() as f64;
        let mean = self.entries.iter().map(|m| m.latency_ms).sum::<f64>() / n;
        let variance = self
            .entries
            .iter()
            .map(|m| (m.latency_ms - mean).powi(2))
            .sum::<f64>()
            / n;
        self.stats.avg_latency = mean;
        self.stats.jitter = variance.sqrt();
    }

    pub fn entries(&self) -> &VecDeque<TimedMeasurement> {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> &RunningStats {
        &self.stats
    }

    /// Clear all history and reset statistics
    pub fn clear(&mut self) {
        self.entries.clear();
        self.stats = RunningStats::default();
    }

    /// Latency values for plotting (last N points)
    ///
    /// # Returns
    /// Vector of (time_offset_seconds, latency_ms) pairs, newest first
    pub fn latency_plot_data(&self, count: usize) -> Vec<(f64, f64)> {
        let now = Utc::now();
        self.entries
            .iter()
            .rev()
            .take(count)
            .map(|m| {
                let time_offset = (now - m.timestamp).num_milliseconds() as f64 / 1000.0;
                (-time_offset, m.latency_ms)
            })
            .collect()
    }
}

impl Default for MeasurementHistory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn measurement(delay_frames: f64) -> Measurement {
        Measurement {
            iteration: 1,
            delay_frames,
            peak: 1.0,
            confidence: 0.9,
            echo_gain: 0.5,
        }
    }

    #[test]
    fn test_history_creation() {
        let history = MeasurementHistory::new();
        assert!(history.is_empty());
        assert_eq!(history.stats().measurement_count, 0);
    }

    #[test]
    fn test_record() {
        let mut history = MeasurementHistory::new();

        history.record(measurement(240.0), 48000);
        assert_relative_eq!(history.stats().current_latency, 5.0);
        assert_eq!(history.stats().measurement_count, 1);

        history.record(measurement(480.0), 48000);
        assert_relative_eq!(history.stats().current_latency, 10.0);
        assert_relative_eq!(history.stats().min_latency, 5.0);
        assert_relative_eq!(history.stats().max_latency, 10.0);
        assert_relative_eq!(history.stats().avg_latency, 7.5);
        assert_relative_eq!(history.stats().jitter, 2.5);
    }

    #[test]
    fn test_clear() {
        let mut history = MeasurementHistory::new();
        history.record(measurement(100.0), 48000);
        history.clear();
        assert!(history.is_empty());
        assert_eq!(history.stats().measurement_count, 0);
    }

    #[test]
    fn test_history_limit() {
        let mut history = MeasurementHistory::with_capacity(16);
        for i in 0..40 {
            history.record(measurement(i as f64), 48000);
        }
        assert_eq!(history.len(), 16);
        assert_eq!(history.stats().measurement_count, 40);
        assert_eq!(history.entries()[0].measurement.delay_frames, 24.0);
    }

    #[test]
    fn test_plot_data_newest_first() {
        let mut history = MeasurementHistory::new();
        history.record(measurement(48.0), 48000);
        history.record(measurement(96.0), 48000);
        let plot = history.latency_plot_data(10);
        assert_eq!(plot.len(), 2);
        assert_relative_eq!(plot[0].1, 2.0);
        assert!(plot[0].0 <= 0.0);
    }

    #[test]
    fn test_entry_json_is_flat() {
        let mut history = MeasurementHistory::new();
        history.record(measurement(480.0), 48000);
        let json = serde_json::to_string(&history.entries()[0]).unwrap();
        assert!(json.contains("\"delay_frames\":480.0"));
        assert!(json.contains("\"timestamp\""));
    }
}
