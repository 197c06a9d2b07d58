//! Full-duplex stream pairing
//!
//! Audio hardware delivers input and output through two independent
//! callbacks. This module turns them into one synchronized callback that
//! sees a block of captured input together with the output block it must
//! fill:
//!
//! - One direction is the **leader**. Its device callback drives the
//!   [`DuplexCallback`].
//! - The other direction is the **follower**. It exchanges samples with the
//!   leader through a lock-free SPSC ring (`ringbuf`), moved directly into
//!   the device closures with no Mutex.
//!
//! The half that consumes from the ring zero-fills any shortfall (underrun)
//! and discards backlog beyond `max_backlog_periods` (overrun). The first
//! `drain_periods` leader periods throw away follower data and emit silence
//! so start-up transients do not skew alignment.
//!
//! Device access lives behind [`AudioBackend`]; see
//! [`crate::audio::engine`] for the cpal backend and
//! [`crate::audio::loopback`] for the simulated one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StreamError};

/// Periods assumed when a backend cannot tell the period size up front
const FALLBACK_PERIOD_FRAMES: usize = 1024;

/// Negotiated stream parameters handed to [`DuplexCallback::prepare`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplexFormat {
    pub sample_rate: u32,
    pub input_channels: u16,
    pub output_channels: u16,
    /// Expected frames per callback, 0 when the device does not say
    pub frames_per_period: usize,
}

impl DuplexFormat {
    /// Period size used for sizing buffers
    pub fn period_frames(&self) -> usize {
        if self.frames_per_period == 0 {
            FALLBACK_PERIOD_FRAMES
        } else {
            self.frames_per_period
        }
    }
}

impl Default for DuplexFormat {
    fn default() -> Self {
        Self {
            sample_rate: crate::DEFAULT_SAMPLE_RATE,
            input_channels: 1,
            output_channels: 1,
            frames_per_period: 0,
        }
    }
}

/// Return value of a duplex callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackResult {
    /// Keep calling
    Continue,
    /// Stop calling; the stream emits silence from now on
    Stop,
}

/// Receiver of synchronized input/output blocks
///
/// `prepare` runs on the control thread before streaming starts and may
/// allocate. `on_both_streams_ready` runs on the audio thread and must not
/// allocate, lock, or block.
pub trait DuplexCallback: Send {
    /// Called once with the negotiated format before the first period
    fn prepare(&mut self, _format: &DuplexFormat) {}

    /// Process one period
    ///
    /// # Arguments
    /// * `input` - Interleaved input, `num_input_frames` frames
    /// * `output` - Interleaved output to fill, `num_output_frames` frames
    fn on_both_streams_ready(
        &mut self,
        input: &[f32],
        num_input_frames: usize,
        output: &mut [f32],
        num_output_frames: usize,
    ) -> CallbackResult;
}

impl<T: DuplexCallback + ?Sized> DuplexCallback for Box<T> {
    fn prepare(&mut self, format: &DuplexFormat) {
        (**self).prepare(format)
    }

    fn on_both_streams_ready(
        &mut self,
        input: &[f32],
        num_input_frames: usize,
        output: &mut [f32],
        num_output_frames: usize,
    ) -> CallbackResult {
        (**self).on_both_streams_ready(input, num_input_frames, output, num_output_frames)
    }
}

/// Adapts a closure to [`DuplexCallback`]
///
/// # Example
/// ```
/// use latencytester_core::audio::duplex::{CallbackResult, DuplexCallback, FnCallback};
///
/// // Copy input straight to output
/// let mut thru = FnCallback::new(|input: &[f32], _, output: &mut [f32], _| {
///     let n = input.len().min(output.len());
///     output[..n].copy_from_slice(&input[..n]);
///     CallbackResult::Continue
/// });
/// let mut out = [0.0f32; 4];
/// thru.on_both_streams_ready(&[0.1, 0.2, 0.3, 0.4], 4, &mut out, 4);
/// assert_eq!(out, [0.1, 0.2, 0.3, 0.4]);
/// ```
pub struct FnCallback<F>(F);

impl<F> FnCallback<F>
where
    F: FnMut(&[f32], usize, &mut [f32], usize) -> CallbackResult + Send,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> DuplexCallback for FnCallback<F>
where
    F: FnMut(&[f32], usize, &mut [f32], usize) -> CallbackResult + Send,
{
    fn on_both_streams_ready(
        &mut self,
        input: &[f32],
        num_input_frames: usize,
        output: &mut [f32],
        num_output_frames: usize,
    ) -> CallbackResult {
        (self.0)(input, num_input_frames, output, num_output_frames)
    }
}

/// Which device callback drives the pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Leader {
    #[default]
    Output,
    Input,
}

/// Synchronization tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DuplexConfig {
    pub leader: Leader,
    /// Leader periods discarded at start-up
    pub drain_periods: u32,
    /// Follower backlog kept before the excess is dropped
    pub max_backlog_periods: u32,
}

impl Default for DuplexConfig {
    fn default() -> Self {
        Self {
            leader: Leader::Output,
            drain_periods: 2,
            max_backlog_periods: 4,
        }
    }
}

/// Counters updated from the audio threads
#[derive(Debug, Default)]
pub struct DuplexStats {
    periods: AtomicU64,
    underruns: AtomicU64,
    overruns: AtomicU64,
    dropped_frames: AtomicU64,
}

/// Point-in-time copy of [`DuplexStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DuplexStatsSnapshot {
    pub periods: u64,
    pub underruns: u64,
    pub overruns: u64,
    pub dropped_frames: u64,
}

impl DuplexStats {
    pub fn snapshot(&self) -> DuplexStatsSnapshot {
        DuplexStatsSnapshot {
            periods: self.periods.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
            dropped_frames: self.dropped_frames.load(Ordering::Relaxed),
        }
    }

    fn period(&self) {
        self.periods.fetch_add(1, Ordering::Relaxed);
    }

    fn underrun(&self) {
        self.underruns.fetch_add(1, Ordering::Relaxed);
    }

    fn overrun(&self, frames: usize) {
        self.overruns.fetch_add(1, Ordering::Relaxed);
        self.dropped_frames.fetch_add(frames as u64, Ordering::Relaxed);
    }
}

/// Drop ring contents above `max_samples`, keeping whole frames
fn discard_backlog(
    consumer: &mut HeapCons<f32>,
    max_samples: usize,
    channels: usize,
    stats: &DuplexStats,
) {
    let excess = consumer.occupied_len().saturating_sub(max_samples);
    let excess = excess.div_ceil(channels) * channels;
    if excess > 0 {
        let skipped = consumer.skip(excess);
        stats.overrun(skipped / channels);
    }
}

/// Output device callback driving the pair
pub struct OutputLeader {
    callback: Box<dyn DuplexCallback>,
    consumer: HeapCons<f32>,
    input: Vec<f32>,
    input_channels: usize,
    output_channels: usize,
    drain_remaining: u32,
    max_backlog: usize,
    stats: Arc<DuplexStats>,
    stopped: bool,
}

impl OutputLeader {
    /// Fill one interleaved output block
    pub fn process(&mut self, output: &mut [f32]) {
        self.stats.period();
        let frames = output.len() / self.output_channels;

        if self.stopped {
            output.fill(0.0);
            return;
        }
        if self.drain_remaining > 0 {
            self.drain_remaining -= 1;
            self.consumer.clear();
            output.fill(0.0);
            return;
        }

        discard_backlog(
            &mut self.consumer,
            self.max_backlog,
            self.input_channels,
            &self.stats,
        );

        let needed = (frames * self.input_channels).min(self.input.len());
        let got = self.consumer.pop_slice(&mut self.input[..needed]);
        if got < needed {
            self.input[got..needed].fill(0.0);
            self.stats.underrun();
        }

        let result = self.callback.on_both_streams_ready(
            &self.input[..needed],
            needed / self.input_channels,
            output,
            frames,
        );
        if result == CallbackResult::Stop {
            tracing::debug!("Duplex callback requested stop");
            self.stopped = true;
        }
    }
}

/// Input device callback feeding an output leader
pub struct InputFollower {
    producer: HeapProd<f32>,
    stats: Arc<DuplexStats>,
    channels: usize,
}

impl InputFollower {
    /// Queue one interleaved input block
    pub fn process(&mut self, input: &[f32]) {
        if self.producer.vacant_len() < input.len() {
            self.stats.overrun(input.len() / self.channels);
            return;
        }
        self.producer.push_slice(input);
    }
}

/// Input device callback driving the pair
pub struct InputLeader {
    callback: Box<dyn DuplexCallback>,
    producer: HeapProd<f32>,
    output: Vec<f32>,
    input_channels: usize,
    output_channels: usize,
    drain_remaining: u32,
    stats: Arc<DuplexStats>,
    stopped: bool,
}

impl InputLeader {
    /// Consume one interleaved input block and queue the rendered output
    pub fn process(&mut self, input: &[f32]) {
        self.stats.period();
        let frames = input.len() / self.input_channels;
        let rendered = (frames * self.output_channels).min(self.output.len());

        if self.drain_remaining > 0 {
            self.drain_remaining -= 1;
            return;
        }

        if self.stopped {
            self.output[..rendered].fill(0.0);
        } else {
            let result = self.callback.on_both_streams_ready(
                input,
                frames,
                &mut self.output[..rendered],
                rendered / self.output_channels,
            );
            if result == CallbackResult::Stop {
                tracing::debug!("Duplex callback requested stop");
                self.stopped = true;
            }
        }

        if self.producer.vacant_len() < rendered {
            self.stats.overrun(rendered / self.output_channels);
            return;
        }
        self.producer.push_slice(&self.output[..rendered]);
    }
}

/// Output device callback playing what an input leader rendered
pub struct OutputFollower {
    consumer: HeapCons<f32>,
    channels: usize,
    max_backlog: usize,
    stats: Arc<DuplexStats>,
    primed: bool,
}

impl OutputFollower {
    /// Fill one interleaved output block
    pub fn process(&mut self, output: &mut [f32]) {
        discard_backlog(
            &mut self.consumer,
            self.max_backlog,
            self.channels,
            &self.stats,
        );

        let got = self.consumer.pop_slice(output);
        if got > 0 {
            self.primed = true;
        }
        if got < output.len() {
            output[got..].fill(0.0);
            // Before the leader's first block arrives silence is expected
            if self.primed {
                self.stats.underrun();
            }
        }
    }
}

/// Half that invokes the duplex callback
pub enum LeaderHalf {
    Output(OutputLeader),
    Input(InputLeader),
}

impl LeaderHalf {
    pub fn role(&self) -> Leader {
        match self {
            Self::Output(_) => Leader::Output,
            Self::Input(_) => Leader::Input,
        }
    }

    /// True once the callback returned [`CallbackResult::Stop`]
    pub fn is_stopped(&self) -> bool {
        match self {
            Self::Output(leader) => leader.stopped,
            Self::Input(leader) => leader.stopped,
        }
    }
}

/// Half that only moves samples through the ring
pub enum FollowerHalf {
    Input(InputFollower),
    Output(OutputFollower),
}

/// Pair a callback with a leader and a follower joined by an SPSC ring
///
/// # Arguments
/// * `format` - Negotiated format; channel counts of zero are treated as one
/// * `config` - Leader choice, drain and backlog limits
/// * `callback` - Already prepared callback
/// * `stats` - Counters shared with the control thread
pub fn split(
    format: &DuplexFormat,
    config: &DuplexConfig,
    callback: Box<dyn DuplexCallback>,
    stats: Arc<DuplexStats>,
) -> (LeaderHalf, FollowerHalf) {
    let input_channels = format.input_channels.max(1) as usize;
    let output_channels = format.output_channels.max(1) as usize;
    let period = format.period_frames();
    let backlog_periods = config.max_backlog_periods.max(1) as usize;
    // Room for the permitted backlog plus the periods in flight
    let ring_periods = backlog_periods + 2;

    match config.leader {
        Leader::Output => {
            let ring = HeapRb::<f32>::new(period * input_channels * ring_periods);
            let (producer, consumer) = ring.split();
            let leader = OutputLeader {
                callback,
                consumer,
                input: vec![0.0; period * input_channels * ring_periods],
                input_channels,
                output_channels,
                drain_remaining: config.drain_periods,
                max_backlog: period * input_channels * backlog_periods,
                stats: Arc::clone(&stats),
                stopped: false,
            };
            let follower = InputFollower {
                producer,
                stats,
                channels: input_channels,
            };
            (LeaderHalf::Output(leader), FollowerHalf::Input(follower))
        }
        Leader::Input => {
            let ring = HeapRb::<f32>::new(period * output_channels * ring_periods);
            let (producer, consumer) = ring.split();
            let leader = InputLeader {
                callback,
                producer,
                output: vec![0.0; period * output_channels * ring_periods],
                input_channels,
                output_channels,
                drain_remaining: config.drain_periods,
                stats: Arc::clone(&stats),
                stopped: false,
            };
            let follower = OutputFollower {
                consumer,
                channels: output_channels,
                max_backlog: period * output_channels * backlog_periods,
                stats,
                primed: false,
            };
            (LeaderHalf::Input(leader), FollowerHalf::Output(follower))
        }
    }
}

/// Device access used by [`FullDuplexStream`]
pub trait AudioBackend {
    /// Open devices and agree on a format both directions support
    fn negotiate(&mut self) -> Result<DuplexFormat>;

    /// Start both directions, follower first
    fn start(&mut self, leader: LeaderHalf, follower: FollowerHalf) -> Result<()>;

    /// Stop both directions; a no-op when not running
    fn stop(&mut self);

    /// Short description for logs
    fn name(&self) -> String;
}

/// Synchronized input/output stream pair
pub struct FullDuplexStream {
    backend: Box<dyn AudioBackend>,
    config: DuplexConfig,
    stats: Arc<DuplexStats>,
    format: Option<DuplexFormat>,
    running: bool,
}

impl FullDuplexStream {
    pub fn new(backend: Box<dyn AudioBackend>, config: DuplexConfig) -> Self {
        Self {
            backend,
            config,
            stats: Arc::new(DuplexStats::default()),
            format: None,
            running: false,
        }
    }

    /// Negotiate, prepare the callback, and start streaming
    ///
    /// Returns the negotiated format, or the first error from either
    /// direction.
    pub fn start(&mut self, mut callback: Box<dyn DuplexCallback>) -> Result<DuplexFormat> {
        if self.running {
            return Err(StreamError::AlreadyRunning);
        }

        let format = self.backend.negotiate()?;
        tracing::info!(
            backend = %self.backend.name(),
            sample_rate = format.sample_rate,
            input_channels = format.input_channels,
            output_channels = format.output_channels,
            frames_per_period = format.frames_per_period,
            leader = ?self.config.leader,
            "Starting full-duplex stream"
        );

        callback.prepare(&format);
        self.stats = Arc::new(DuplexStats::default());
        let (leader, follower) = split(&format, &self.config, callback, Arc::clone(&self.stats));
        self.backend.start(leader, follower)?;

        self.format = Some(format);
        self.running = true;
        Ok(format)
    }

    /// Stop both directions
    pub fn stop(&mut self) {
        if self.running {
            self.backend.stop();
            self.running = false;
            let stats = self.stats.snapshot();
            tracing::info!(
                periods = stats.periods,
                underruns = stats.underruns,
                overruns = stats.overruns,
                "Full-duplex stream stopped"
            );
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Format of the current or most recent run
    pub fn format(&self) -> Option<DuplexFormat> {
        self.format
    }

    pub fn stats(&self) -> DuplexStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn config(&self) -> &DuplexConfig {
        &self.config
    }
}

impl Drop for FullDuplexStream {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn format(frames: usize) -> DuplexFormat {
        DuplexFormat {
            sample_rate: 48000,
            input_channels: 1,
            output_channels: 1,
            frames_per_period: frames,
        }
    }

    fn passthrough() -> Box<dyn DuplexCallback> {
        Box::new(FnCallback::new(
            |input: &[f32], _, output: &mut [f32], _| {
                let n = input.len().min(output.len());
                output[..n].copy_from_slice(&input[..n]);
                output[n..].fill(0.0);
                CallbackResult::Continue
            },
        ))
    }

    fn no_drain(leader: Leader) -> DuplexConfig {
        DuplexConfig {
            leader,
            drain_periods: 0,
            max_backlog_periods: 4,
        }
    }

    #[test]
    fn test_output_leader_passes_input() {
        let stats = Arc::new(DuplexStats::default());
        let (leader, follower) = split(&format(4), &no_drain(Leader::Output), passthrough(), stats);
        let (LeaderHalf::Output(mut leader), FollowerHalf::Input(mut follower)) = (leader, follower)
        else {
            panic!("output leader expected");
        };

        follower.process(&[1.0, 2.0, 3.0, 4.0]);
        let mut out = [0.0f32; 4];
        leader.process(&mut out);
        assert_eq!(out, [1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_output_leader_zero_fills_underrun() {
        let stats = Arc::new(DuplexStats::default());
        let (leader, follower) = split(
            &format(4),
            &no_drain(Leader::Output),
            passthrough(),
            Arc::clone(&stats),
        );
        let (LeaderHalf::Output(mut leader), FollowerHalf::Input(mut follower)) = (leader, follower)
        else {
            panic!("output leader expected");
        };

        follower.process(&[0.5, 0.5]);
        let mut out = [9.0f32; 4];
        leader.process(&mut out);
        assert_eq!(out, [0.5, 0.5, 0.0, 0.0]);
        assert_eq!(stats.snapshot().underruns, 1);
        assert_eq!(stats.snapshot().periods, 1);
    }

    #[test]
    fn test_drain_periods_emit_silence() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let callback = Box::new(FnCallback::new(move |_: &[f32], _, output: &mut [f32], _| {
            counter.fetch_add(1, Ordering::Relaxed);
            output.fill(1.0);
            CallbackResult::Continue
        }));
        let config = DuplexConfig {
            leader: Leader::Output,
            drain_periods: 2,
            max_backlog_periods: 4,
        };
        let stats = Arc::new(DuplexStats::default());
        let (leader, follower) = split(&format(4), &config, callback, stats);
        let (LeaderHalf::Output(mut leader), FollowerHalf::Input(mut follower)) = (leader, follower)
        else {
            panic!("output leader expected");
        };

        let mut out = [0.0f32; 4];
        for _ in 0..2 {
            follower.process(&[0.3; 4]);
            leader.process(&mut out);
            assert_eq!(out, [0.0; 4]);
        }
        assert_eq!(calls.load(Ordering::Relaxed), 0);

        follower.process(&[0.3; 4]);
        leader.process(&mut out);
        assert_eq!(out, [1.0; 4]);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_backlog_is_discarded() {
        let stats = Arc::new(DuplexStats::default());
        let config = DuplexConfig {
            leader: Leader::Output,
            drain_periods: 0,
            max_backlog_periods: 2,
        };
        let (leader, follower) = split(&format(4), &config, passthrough(), Arc::clone(&stats));
        let (LeaderHalf::Output(mut leader), FollowerHalf::Input(mut follower)) = (leader, follower)
        else {
            panic!("output leader expected");
        };

        // Four periods queued, two allowed
        for k in 0..4 {
            follower.process(&[k as f32; 4]);
        }
        let mut out = [0.0f32; 4];
        leader.process(&mut out);

        // Oldest periods dropped, newest kept
        assert_eq!(out, [2.0; 4]);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.overruns, 1);
        assert_eq!(snapshot.dropped_frames, 8);
    }

    #[test]
    fn test_input_leader_renders_output() {
        let stats = Arc::new(DuplexStats::default());
        let (leader, follower) = split(
            &format(4),
            &no_drain(Leader::Input),
            passthrough(),
            Arc::clone(&stats),
        );
        let (LeaderHalf::Input(mut leader), FollowerHalf::Output(mut follower)) = (leader, follower)
        else {
            panic!("input leader expected");
        };

        // Nothing rendered yet: silence without counting an underrun
        let mut out = [7.0f32; 4];
        follower.process(&mut out);
        assert_eq!(out, [0.0; 4]);
        assert_eq!(stats.snapshot().underruns, 0);

        leader.process(&[0.25, 0.5, 0.75, 1.0]);
        follower.process(&mut out);
        assert_eq!(out, [0.25, 0.5, 0.75, 1.0]);

        follower.process(&mut out);
        assert_eq!(stats.snapshot().underruns, 1);
    }

    #[test]
    fn test_stop_result_silences_leader() {
        let callback = Box::new(FnCallback::new(|_: &[f32], _, output: &mut [f32], _| {
            output.fill(1.0);
            CallbackResult::Stop
        }));
        let stats = Arc::new(DuplexStats::default());
        let (leader, _follower) = split(&format(2), &no_drain(Leader::Output), callback, stats);
        let LeaderHalf::Output(mut leader) = leader else {
            panic!("output leader expected");
        };

        let mut out = [0.0f32; 2];
        leader.process(&mut out);
        assert_eq!(out, [1.0, 1.0]);
        leader.process(&mut out);
        assert_eq!(out, [0.0, 0.0]);
    }

    #[test]
    fn test_stereo_frames_stay_aligned() {
        let fmt = DuplexFormat {
            sample_rate: 48000,
            input_channels: 2,
            output_channels: 2,
            frames_per_period: 2,
        };
        let stats = Arc::new(DuplexStats::default());
        let (leader, follower) = split(&fmt, &no_drain(Leader::Output), passthrough(), stats);
        let (LeaderHalf::Output(mut leader), FollowerHalf::Input(mut follower)) = (leader, follower)
        else {
            panic!("output leader expected");
        };

        follower.process(&[1.0, -1.0, 2.0, -2.0]);
        let mut out = [0.0f32; 4];
        leader.process(&mut out);
        assert_eq!(out, [1.0, -1.0, 2.0, -2.0]);
    }

    #[test]
    fn test_leader_roles() {
        let stats = Arc::new(DuplexStats::default());
        let (leader, _) = split(&format(4), &no_drain(Leader::Input), passthrough(), stats);
        assert_eq!(leader.role(), Leader::Input);
    }

    #[test]
    fn test_default_period_fallback() {
        assert_eq!(format(0).period_frames(), FALLBACK_PERIOD_FRAMES);
        assert_eq!(format(256).period_frames(), 256);
    }
}
