//! Lock-free publication of analyzer snapshots
//!
//! [`SnapshotCell`] is a sequence lock over per-field atomics. The audio
//! thread is the only writer and never waits: a store is a fixed number of
//! atomic writes. Readers on the control thread retry (with backoff) while a
//! store is in progress, so a slow reader can never hold up the callback.
//!
//! Only one thread may store at a time. The analyzer that owns the
//! publisher is that thread; concurrent stores are not undefined behavior
//! but can make readers see a mix of the two snapshots.

use std::sync::atomic::{fence, AtomicU64, Ordering};

use crossbeam_utils::Backoff;

use super::report::{AnalyzerPhase, AnalyzerSnapshot, ResultCode};

const FIELDS: usize = 9;

/// Single-writer, wait-free-to-write cell holding an [`AnalyzerSnapshot`]
#[derive(Debug)]
pub struct SnapshotCell {
    /// Odd while a store is in progress
    sequence: AtomicU64,
    fields: [AtomicU64; FIELDS],
}

fn encode(s: &AnalyzerSnapshot) -> [u64; FIELDS] {
    [
        s.phase.id() as u64,
        s.result.code() as i64 as u64,
        s.progress,
        s.iterations as u64,
        s.accepted as u64,
        s.sample_rate as u64,
        s.latency_frames.to_bits(),
        s.confidence.to_bits() as u64,
        s.degraded_periods,
    ]
}

fn decode(raw: &[u64; FIELDS]) -> AnalyzerSnapshot {
    AnalyzerSnapshot {
        phase: AnalyzerPhase::from_id(raw[0] as i32).unwrap_or_default(),
        result: ResultCode::from_code(raw[1] as i64 as i32).unwrap_or_default(),
        progress: raw[2],
        iterations: raw[3] as u32,
        accepted: raw[4] as u32,
        sample_rate: raw[5] as u32,
        latency_frames: f64::from_bits(raw[6]),
        confidence: f32::from_bits(raw[7] as u32),
        degraded_periods: raw[8],
    }
}

impl SnapshotCell {
    pub fn new(snapshot: AnalyzerSnapshot) -> Self {
        let cell = Self {
            sequence: AtomicU64::new(0),
            fields: Default::default(),
        };
        cell.store(snapshot);
        cell
    }

    /// Publish `snapshot`; never blocks
    pub fn store(&self, snapshot: AnalyzerSnapshot) {
        let raw = encode(&snapshot);
        let seq = self.sequence.load(Ordering::Relaxed);
        self.sequence.store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
        for (field, value) in self.fields.iter().zip(raw) {
            field.store(value, Ordering::Relaxed);
        }
        self.sequence.store(seq.wrapping_add(2), Ordering::Release);
    }

    /// Latest complete snapshot
    pub fn load(&self) -> AnalyzerSnapshot {
        let backoff = Backoff::new();
        loop {
            let before = self.sequence.load(Ordering::Acquire);
            if before % 2 == 0 {
                let mut raw = [0u64; FIELDS];
                for (value, field) in raw.iter_mut().zip(&self.fields) {
                    *value = field.load(Ordering::Relaxed);
                }
                fence(Ordering::Acquire);
                if self.sequence.load(Ordering::Relaxed) == before {
                    return decode(&raw);
                }
            }
            backoff.snooze();
        }
    }
}

impl Default for SnapshotCell {
    fn default() -> Self {
        Self::new(AnalyzerSnapshot::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn numbered(n: u64) -> AnalyzerSnapshot {
        AnalyzerSnapshot {
            phase: AnalyzerPhase::CapturingEcho,
            result: ResultCode::InvalidState,
            progress: n,
            iterations: n as u32,
            accepted: n as u32,
            sample_rate: 48000,
            latency_frames: n as f64 + 0.25,
            confidence: (n % 1000) as f32 / 1000.0,
            degraded_periods: n,
        }
    }

    #[test]
    fn test_store_load() {
        let cell = SnapshotCell::default();
        assert_eq!(cell.load(), AnalyzerSnapshot::default());

        let snapshot = AnalyzerSnapshot {
            phase: AnalyzerPhase::Failed,
            result: ResultCode::VolumeTooLow,
            latency_frames: 480.125,
            confidence: 0.75,
            ..numbered(7)
        };
        cell.store(snapshot);
        assert_eq!(cell.load(), snapshot);
    }

    #[test]
    fn test_every_phase_and_code_survives() {
        let cell = SnapshotCell::default();
        let phases = [
            AnalyzerPhase::Priming,
            AnalyzerPhase::SendingProbe,
            AnalyzerPhase::CapturingEcho,
            AnalyzerPhase::Correlating,
            AnalyzerPhase::MeasurementComplete,
            AnalyzerPhase::Done,
            AnalyzerPhase::Failed,
        ];
        let codes = [
            ResultCode::Ok,
            ResultCode::Noisy,
            ResultCode::VolumeTooLow,
            ResultCode::VolumeTooHigh,
            ResultCode::Confidence,
            ResultCode::InvalidState,
        ];
        for phase in phases {
            for result in codes {
                let snapshot = AnalyzerSnapshot {
                    phase,
                    result,
                    ..Default::default()
                };
                cell.store(snapshot);
                assert_eq!(cell.load(), snapshot);
            }
        }
    }

    #[test]
    fn test_reader_never_sees_torn_snapshot() {
        let cell = Arc::new(SnapshotCell::default());
        let running = Arc::new(AtomicBool::new(true));

        let writer = {
            let cell = Arc::clone(&cell);
            let running = Arc::clone(&running);
            std::thread::spawn(move || {
                let mut n = 0u64;
                while running.load(Ordering::Relaxed) {
                    n += 1;
                    cell.store(numbered(n));
                }
                n
            })
        };

        let mut last = 0;
        for _ in 0..200_000 {
            let s = cell.load();
            let n = s.progress;
            if n == 0 {
                continue;
            }
            assert_eq!(s, numbered(n), "Fields from different stores");
            assert!(n >= last, "Snapshots went backwards");
            last = n;
        }
        running.store(false, Ordering::Relaxed);
        assert!(writer.join().unwrap() >= last);
    }
}
