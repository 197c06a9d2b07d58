//! Latencytester - round-trip audio latency measurement
//!
//! Command-line entry point.

use anyhow::Result;
use latencytester::audio::engine::list_devices as scan_devices;
use latencytester::cli::{self, Command, MeasureOptions};
use latencytester::config::AppConfig;
use latencytester::{AnalyzerPhase, FullDuplexLatency};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Time given to the streams to settle before the first poll
const STARTUP_DELAY: Duration = Duration::from_millis(300);

/// Poll interval while the measurement runs
const POLL_INTERVAL: Duration = Duration::from_millis(150);

fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("latencytester=info".parse().unwrap()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = match cli::parse_args(&args) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!();
            cli::print_help();
            return ExitCode::from(2);
        }
    };

    let outcome = match command {
        Command::Help => {
            cli::print_help();
            return ExitCode::SUCCESS;
        }
        Command::Version => {
            println!(
                "latencytester {} ({})",
                latencytester::VERSION,
                latencytester::BUILD_DATE
            );
            return ExitCode::SUCCESS;
        }
        Command::List => list_devices().map(|_| true),
        Command::Measure(options) => measure(options),
    };

    match outcome {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn list_devices() -> Result<()> {
    println!("Scanning for audio devices...");
    println!();

    let devices = scan_devices()?;
    if devices.is_empty() {
        println!("No audio devices found.");
        return Ok(());
    }

    println!("Found {} device(s):", devices.len());
    println!();
    for (i, device) in devices.iter().enumerate() {
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {}. {}{}", i + 1, device.name, default_marker);
        println!(
            "     Channels: {} in, {} out",
            device.input_channels, device.output_channels
        );
        if !device.sample_rates.is_empty() {
            println!("     Sample rates: {:?}", device.sample_rates);
        }
        println!();
    }
    Ok(())
}

/// Fold command-line overrides into the loaded config
fn apply_overrides(config: &mut AppConfig, options: &MeasureOptions) {
    if let Some(name) = &options.input_device {
        config.devices.input_device = Some(name.clone());
    }
    if let Some(name) = &options.output_device {
        config.devices.output_device = Some(name.clone());
    }
    if let Some(rate) = options.sample_rate {
        config.devices.sample_rate = Some(rate);
        config.loopback.sample_rate = rate;
    }
    if let Some(frames) = options.simulate {
        config.loopback.delay_frames = frames;
    }
    if let Some(level) = options.noise {
        config.loopback.noise_amplitude = level;
    }
}

/// Run one measurement; `Ok(false)` when it finished without a latency
fn measure(options: MeasureOptions) -> Result<bool> {
    let config_path = options.config_path.clone().unwrap_or_else(AppConfig::path);
    let mut config = AppConfig::load_from(&config_path);
    apply_overrides(&mut config, &options);

    if options.save_config {
        config.save(&config_path)?;
    }

    let mut latency = match options.simulate {
        Some(delay) => {
            info!(delay_frames = delay, "Measuring simulated loopback");
            FullDuplexLatency::with_loopback(config.loopback.clone(), config.echo.clone())
        }
        None => FullDuplexLatency::with_cpal(
            config.devices.clone(),
            config.duplex,
            config.echo.clone(),
        ),
    };

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let format = latency.start()?;
    info!(
        sample_rate = format.sample_rate,
        input_channels = format.input_channels,
        output_channels = format.output_channels,
        period_frames = format.period_frames(),
        "Streams running"
    );

    std::thread::sleep(STARTUP_DELAY);

    let mut last_phase: Option<AnalyzerPhase> = None;
    while running.load(Ordering::SeqCst) && !latency.is_done() {
        latency.analyze_data();
        let phase = latency.get_latency_analyzer().phase();
        if last_phase != Some(phase) {
            info!(phase = %phase, "Analyzer state");
            last_phase = Some(phase);
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    latency.stop();
    if !running.load(Ordering::SeqCst) {
        info!("Interrupted");
    }

    let report = latency.report();
    let stats = latency.stream_stats();
    info!(
        periods = stats.periods,
        underruns = stats.underruns,
        overruns = stats.overruns,
        "Stream statistics"
    );

    if options.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report);
    }

    Ok(report.is_success())
}
