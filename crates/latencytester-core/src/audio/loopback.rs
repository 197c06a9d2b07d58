//! Simulated loopback backend
//!
//! [`LoopbackBackend`] stands in for a sound card with a cable from output
//! to input. A worker thread plays both device callbacks period by period:
//! output channel 0 goes into an [`InterpolatingDelayLine`] and comes back
//! on every input channel `delay_frames` later, scaled by `gain`, with
//! seeded noise added. The delay may be fractional, so the measured latency
//! can be checked against an exact known value.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::delay_line::{InterpolatingDelayLine, InterpolationMode};
use super::duplex::{AudioBackend, DuplexFormat, FollowerHalf, LeaderHalf};
use super::probe::NoiseGenerator;
use crate::error::{Result, StreamError};

/// Synthetic path parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopbackConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub period_frames: usize,
    /// Round-trip delay, at least one period
    pub delay_frames: f64,
    pub gain: f32,
    /// Peak level of the added noise
    pub noise_amplitude: f32,
    pub noise_seed: u32,
    /// Sleep one period between callbacks instead of running flat out
    pub realtime: bool,
    pub interpolation: InterpolationMode,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            sample_rate: crate::DEFAULT_SAMPLE_RATE,
            channels: 1,
            period_frames: 256,
            delay_frames: 480.0,
            gain: 0.5,
            noise_amplitude: 0.0,
            noise_seed: 0x1234_5678,
            realtime: false,
            interpolation: InterpolationMode::Cubic,
        }
    }
}

/// Synthetic path state owned by the worker thread
struct LoopbackPath {
    line: InterpolatingDelayLine,
    noise: NoiseGenerator,
    delay: f64,
    gain: f32,
    noise_amplitude: f32,
    channels: usize,
}

impl LoopbackPath {
    fn new(config: &LoopbackConfig) -> Self {
        let capacity = config.delay_frames.ceil() as usize + config.period_frames + 4;
        Self {
            line: InterpolatingDelayLine::new(capacity, config.interpolation),
            noise: NoiseGenerator::new(config.noise_seed),
            delay: config.delay_frames,
            gain: config.gain,
            noise_amplitude: config.noise_amplitude,
            channels: config.channels.max(1) as usize,
        }
    }

    /// Fill the next input period from output already played
    fn capture(&mut self, input: &mut [f32]) {
        for (i, frame) in input.chunks_mut(self.channels).enumerate() {
            // The newest line sample is the last frame of the previous period
            let echo = self.line.read_at(self.delay - 1.0 - i as f64) * self.gain;
            let value = echo + self.noise.next_sample() * self.noise_amplitude;
            frame.fill(value);
        }
    }

    /// Send a played output period into the path
    fn play(&mut self, output: &[f32]) {
        for frame in output.chunks(self.channels) {
            self.line.write(frame[0]);
        }
    }
}

/// Duplex backend backed by a synthetic delay path
pub struct LoopbackBackend {
    config: LoopbackConfig,
    running: Arc<AtomicBool>,
    periods: Arc<AtomicU64>,
    worker: Option<JoinHandle<()>>,
}

impl LoopbackBackend {
    pub fn new(config: LoopbackConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            periods: Arc::new(AtomicU64::new(0)),
            worker: None,
        }
    }

    pub fn config(&self) -> &LoopbackConfig {
        &self.config
    }

    /// Periods the worker has run
    pub fn periods(&self) -> u64 {
        self.periods.load(Ordering::Relaxed)
    }

    fn validate(&self) -> Result<()> {
        let c = &self.config;
        if c.sample_rate == 0 || c.period_frames == 0 {
            return Err(StreamError::UnsupportedConfig(
                "sample rate and period size must be positive".to_string(),
            ));
        }
        if !c.delay_frames.is_finite() || c.delay_frames < c.period_frames as f64 {
            return Err(StreamError::UnsupportedConfig(format!(
                "loopback delay {} frames is shorter than one period ({} frames)",
                c.delay_frames, c.period_frames
            )));
        }
        if !c.gain.is_finite() || !c.noise_amplitude.is_finite() {
            return Err(StreamError::UnsupportedConfig(
                "gain and noise must be finite".to_string(),
            ));
        }
        Ok(())
    }
}

impl AudioBackend for LoopbackBackend {
    fn negotiate(&mut self) -> Result<DuplexFormat> {
        self.validate()?;
        Ok(DuplexFormat {
            sample_rate: self.config.sample_rate,
            input_channels: self.config.channels.max(1),
            output_channels: self.config.channels.max(1),
            frames_per_period: self.config.period_frames,
        })
    }

    fn start(&mut self, mut leader: LeaderHalf, mut follower: FollowerHalf) -> Result<()> {
        if self.worker.is_some() {
            return Err(StreamError::AlreadyRunning);
        }
        self.validate()?;
        if !matches!(
            (&leader, &follower),
            (LeaderHalf::Output(_), FollowerHalf::Input(_))
                | (LeaderHalf::Input(_), FollowerHalf::Output(_))
        ) {
            return Err(StreamError::UnsupportedConfig(
                "leader and follower drive the same direction".to_string(),
            ));
        }

        let config = self.config.clone();
        let running = Arc::clone(&self.running);
        let periods = Arc::clone(&self.periods);
        running.store(true, Ordering::Relaxed);

        let worker = std::thread::Builder::new()
            .name("loopback".to_string())
            .spawn(move || {
                let mut path = LoopbackPath::new(&config);
                let samples = config.period_frames * path.channels;
                let mut input = vec![0.0f32; samples];
                let mut output = vec![0.0f32; samples];
                let period = Duration::from_secs_f64(
                    config.period_frames as f64 / config.sample_rate as f64,
                );
                tracing::info!(
                    delay_frames = config.delay_frames,
                    gain = config.gain,
                    noise = config.noise_amplitude,
                    "Loopback worker running"
                );

                while running.load(Ordering::Relaxed) {
                    path.capture(&mut input);
                    // Follower side of each period is delivered first
                    match (&mut leader, &mut follower) {
                        (LeaderHalf::Output(leader), FollowerHalf::Input(follower)) => {
                            follower.process(&input);
                            leader.process(&mut output);
                        }
                        (LeaderHalf::Input(leader), FollowerHalf::Output(follower)) => {
                            leader.process(&input);
                            follower.process(&mut output);
                        }
                        _ => break,
                    }
                    path.play(&output);
                    periods.fetch_add(1, Ordering::Relaxed);

                    if config.realtime || leader.is_stopped() {
                        std::thread::sleep(period);
                    }
                }
                tracing::debug!("Loopback worker exited");
            })
            .map_err(|e| StreamError::Play(e.to_string()))?;

        self.worker = Some(worker);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("Loopback worker panicked");
            }
        }
    }

    fn name(&self) -> String {
        format!("loopback ({} frames)", self.config.delay_frames)
    }
}

impl Drop for LoopbackBackend {
    fn drop(&mut self) {
        self.stop();
    }
}
