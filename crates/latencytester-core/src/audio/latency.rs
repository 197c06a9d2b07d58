//! Full-duplex latency measurement
//!
//! [`FullDuplexLatency`] ties an [`EchoAnalyzer`] to a [`FullDuplexStream`].
//! The analyzer moves into the audio callback on `start()`; from then on the
//! control thread sees it only through a [`LatencyAnalyzerHandle`], which
//! reads the published snapshot and collects accepted measurements.
//!
//! ```no_run
//! use latencytester_core::audio::echo::EchoConfig;
//! use latencytester_core::audio::latency::FullDuplexLatency;
//! use latencytester_core::audio::loopback::LoopbackConfig;
//!
//! let mut latency =
//!     FullDuplexLatency::with_loopback(LoopbackConfig::default(), EchoConfig::default());
//! latency.start().unwrap();
//! while !latency.is_done() {
//!     latency.analyze_data();
//!     std::thread::sleep(std::time::Duration::from_millis(150));
//! }
//! latency.stop();
//! println!("{}", latency.report());
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::Receiver;

use super::analyzer::{
    AnalyzerPhase, AnalyzerPublisher, AnalyzerSnapshot, LatencyReport, Measurement,
};
use super::duplex::{
    AudioBackend, DuplexConfig, DuplexFormat, DuplexStatsSnapshot, FullDuplexStream,
};
use super::echo::{EchoAnalyzer, EchoConfig};
use super::engine::{CpalBackend, CpalConfig};
use super::loopback::{LoopbackBackend, LoopbackConfig};
use super::snapshot::SnapshotCell;
use crate::error::{Result, StreamError};
use crate::stats::history::MeasurementHistory;

/// Capacity of the measurement channel from the audio thread
const MEASUREMENT_CHANNEL_SIZE: usize = 64;

/// Control-thread view of the analyzer running in the callback
pub struct LatencyAnalyzerHandle {
    snapshot: Arc<SnapshotCell>,
    receiver: Receiver<Measurement>,
    dropped: Arc<AtomicU64>,
    history: MeasurementHistory,
}

impl LatencyAnalyzerHandle {
    /// Handle plus the publisher the analyzer writes to
    fn new() -> (Self, AnalyzerPublisher) {
        let snapshot = Arc::new(SnapshotCell::default());
        let (sender, receiver) = crossbeam_channel::bounded(MEASUREMENT_CHANNEL_SIZE);
        let dropped = Arc::new(AtomicU64::new(0));
        let publisher = AnalyzerPublisher {
            snapshot: Arc::clone(&snapshot),
            measurements: sender,
            dropped: Arc::clone(&dropped),
        };
        let handle = Self {
            snapshot,
            receiver,
            dropped,
            history: MeasurementHistory::new(),
        };
        (handle, publisher)
    }

    /// Latest state published by the audio thread
    pub fn snapshot(&self) -> AnalyzerSnapshot {
        self.snapshot.load()
    }

    pub fn phase(&self) -> AnalyzerPhase {
        self.snapshot().phase
    }

    pub fn is_done(&self) -> bool {
        self.snapshot().is_done()
    }

    pub fn report(&self) -> LatencyReport {
        LatencyReport::from(self.snapshot())
    }

    /// Measurements collected so far
    pub fn history(&self) -> &MeasurementHistory {
        &self.history
    }

    /// Measurements lost because the channel was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Move newly published measurements into the history
    fn drain(&mut self) -> usize {
        let sample_rate = self.snapshot().sample_rate;
        let mut count = 0;
        for measurement in self.receiver.try_iter() {
            self.history.record(measurement, sample_rate);
            count += 1;
        }
        count
    }

    fn reset(&mut self) {
        while self.receiver.try_recv().is_ok() {}
        self.history.clear();
        self.snapshot.store(AnalyzerSnapshot::default());
    }
}

/// Round-trip latency measurement over a full-duplex stream
pub struct FullDuplexLatency {
    config: EchoConfig,
    stream: FullDuplexStream,
    analyzer: Option<EchoAnalyzer>,
    handle: LatencyAnalyzerHandle,
    publisher: AnalyzerPublisher,
}

impl FullDuplexLatency {
    /// Measure over any backend
    pub fn new(backend: Box<dyn AudioBackend>, duplex: DuplexConfig, config: EchoConfig) -> Self {
        let (handle, publisher) = LatencyAnalyzerHandle::new();
        let analyzer = EchoAnalyzer::new(config.clone());
        Self {
            config,
            stream: FullDuplexStream::new(backend, duplex),
            analyzer: Some(analyzer),
            handle,
            publisher,
        }
    }

    /// Measure on real audio devices
    pub fn with_cpal(devices: CpalConfig, duplex: DuplexConfig, config: EchoConfig) -> Self {
        Self::new(Box::new(CpalBackend::new(devices)), duplex, config)
    }

    /// Measure a simulated loopback path
    pub fn with_loopback(loopback: LoopbackConfig, config: EchoConfig) -> Self {
        Self::new(
            Box::new(LoopbackBackend::new(loopback)),
            DuplexConfig::default(),
            config,
        )
    }

    /// Open the streams and start measuring
    ///
    /// A second call after `stop()` starts a fresh measurement.
    pub fn start(&mut self) -> Result<DuplexFormat> {
        if self.stream.is_running() {
            return Err(StreamError::AlreadyRunning);
        }
        let mut analyzer = self
            .analyzer
            .take()
            .unwrap_or_else(|| EchoAnalyzer::new(self.config.clone()));
        self.handle.reset();
        analyzer.set_publisher(self.publisher.clone());

        let format = self.stream.start(Box::new(analyzer))?;
        tracing::info!(
            sample_rate = format.sample_rate,
            probe_length = self.config.probe_length,
            "Latency measurement started"
        );
        Ok(format)
    }

    /// Stop the streams; the last published state stays readable
    pub fn stop(&mut self) {
        self.stream.stop();
        self.analyze_data();
    }

    /// Collect measurements published since the last call
    ///
    /// Returns how many were collected. Safe to call at any time; with
    /// nothing new it does nothing.
    pub fn analyze_data(&mut self) -> usize {
        let count = self.handle.drain();
        if count > 0 {
            let snapshot = self.handle.snapshot();
            tracing::debug!(
                new = count,
                accepted = snapshot.accepted,
                iterations = snapshot.iterations,
                phase = %snapshot.phase,
                "Measurements collected"
            );
        }
        count
    }

    pub fn report(&self) -> LatencyReport {
        self.handle.report()
    }

    pub fn is_done(&self) -> bool {
        self.handle.is_done()
    }

    pub fn is_running(&self) -> bool {
        self.stream.is_running()
    }

    pub fn get_latency_analyzer(&self) -> &LatencyAnalyzerHandle {
        &self.handle
    }

    pub fn stream_stats(&self) -> DuplexStatsSnapshot {
        self.stream.stats()
    }

    pub fn config(&self) -> &EchoConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::report::ResultCode;
    use std::time::{Duration, Instant};

    fn quick_config() -> EchoConfig {
        let mut config = EchoConfig {
            probe_length: 512,
            ..Default::default()
        };
        config.analyzer.max_latency_frames = 2048;
        config.analyzer.priming_periods = 2;
        config.analyzer.required_measurements = 3;
        config.analyzer.max_iterations = 6;
        config
    }

    fn run_until_done(latency: &mut FullDuplexLatency) {
        let deadline = Instant::now() + Duration::from_secs(20);
        while !latency.is_done() && Instant::now() < deadline {
            latency.analyze_data();
            std::thread::sleep(Duration::from_millis(10));
        }
        latency.stop();
    }

    #[test]
    fn test_idle_report_is_invalid_state() {
        let latency = FullDuplexLatency::with_loopback(LoopbackConfig::default(), quick_config());
        let report = latency.report();
        assert_eq!(report.phase, AnalyzerPhase::Priming);
        assert_eq!(report.result, ResultCode::InvalidState);
        assert!(!latency.is_done());
    }

    #[test]
    fn test_analyze_data_before_start_is_noop() {
        let mut latency =
            FullDuplexLatency::with_loopback(LoopbackConfig::default(), quick_config());
        assert_eq!(latency.analyze_data(), 0);
        assert_eq!(latency.analyze_data(), 0);
    }

    #[test]
    fn test_loopback_measurement() {
        let loopback = LoopbackConfig {
            delay_frames: 300.0,
            period_frames: 128,
            ..Default::default()
        };
        let mut latency = FullDuplexLatency::with_loopback(loopback, quick_config());
        latency.start().unwrap();
        run_until_done(&mut latency);

        let report = latency.report();
        assert_eq!(report.phase, AnalyzerPhase::Done);
        assert!((report.latency_frames - 300.0).abs() < 0.1, "{}", report);
        assert_eq!(latency.get_latency_analyzer().history().len(), 3);
        assert_eq!(latency.analyze_data(), 0);
    }

    #[test]
    fn test_start_twice_fails() {
        let mut latency =
            FullDuplexLatency::with_loopback(LoopbackConfig::default(), quick_config());
        latency.start().unwrap();
        assert!(matches!(
            latency.start(),
            Err(StreamError::AlreadyRunning)
        ));
        latency.stop();
    }

    #[test]
    fn test_restart_measures_again() {
        let mut latency =
            FullDuplexLatency::with_loopback(LoopbackConfig::default(), quick_config());
        latency.start().unwrap();
        run_until_done(&mut latency);
        assert!(latency.report().is_success());

        latency.start().unwrap();
        run_until_done(&mut latency);
        assert!(latency.report().is_success());
        assert_eq!(latency.get_latency_analyzer().history().len(), 3);
    }
}
