//! Benchmarks for the measurement hot paths
//!
//! Run with: cargo bench --bench correlation

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use latencytester::audio::correlation::{Correlator, PeakFit};
use latencytester::audio::echo::{EchoAnalyzer, EchoConfig};
use latencytester::audio::probe::{ProbeSignal, DEFAULT_PROBE_SEED};
use latencytester::audio::duplex::{DuplexCallback, DuplexFormat};
use latencytester::{InterpolatingDelayLine, InterpolationMode};

/// Capture window holding the probe `delay` frames in
fn capture_with_echo(
    probe: &ProbeSignal,
    capture_len: usize,
    delay: usize,
) -> InterpolatingDelayLine {
    let mut window = InterpolatingDelayLine::new(capture_len, InterpolationMode::Cubic);
    for i in 0..capture_len {
        let sample = if i >= delay && i - delay < probe.len() {
            0.5 * probe.sample(i - delay)
        } else {
            0.0
        };
        window.write(sample);
    }
    window
}

fn bench_correlate(c: &mut Criterion) {
    let mut group = c.benchmark_group("correlate");
    for &probe_len in &[512usize, 2048, 8192] {
        let probe = ProbeSignal::noise_burst(probe_len, DEFAULT_PROBE_SEED, 0.5);
        let capture_len = 2 * probe_len + 9600;
        let window = capture_with_echo(&probe, capture_len, 480);
        let mut correlator = Correlator::new(&probe, capture_len, PeakFit::Gaussian);

        group.bench_with_input(BenchmarkId::from_parameter(probe_len), &window, |b, w| {
            b.iter(|| correlator.correlate(black_box(w)))
        });
    }
    group.finish();
}

fn bench_delay_line_read(c: &mut Criterion) {
    let mut line = InterpolatingDelayLine::new(4096, InterpolationMode::Cubic);
    let probe = ProbeSignal::noise_burst(4096, DEFAULT_PROBE_SEED, 0.5);
    line.write_slice(probe.samples());

    c.bench_function("delay_line_read_cubic_256", |b| {
        b.iter(|| {
            let mut acc = 0.0f32;
            for i in 0..256 {
                acc += line.read_at(black_box(1000.25 + i as f64));
            }
            acc
        })
    });
}

fn bench_analyzer_callback(c: &mut Criterion) {
    let format = DuplexFormat {
        sample_rate: 48000,
        input_channels: 2,
        output_channels: 2,
        frames_per_period: 256,
    };
    let mut analyzer = EchoAnalyzer::new(EchoConfig::default());
    analyzer.prepare(&format);

    let input = vec![0.0f32; 512];
    let mut output = vec![0.0f32; 512];

    c.bench_function("analyzer_period_256_stereo", |b| {
        b.iter(|| {
            if analyzer.is_done() {
                analyzer.reset();
            }
            analyzer.on_both_streams_ready(black_box(&input), 256, &mut output, 256)
        })
    });
}

criterion_group!(
    benches,
    bench_correlate,
    bench_delay_line_read,
    bench_analyzer_callback
);
criterion_main!(benches);
