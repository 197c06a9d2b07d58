//! Command-line argument parsing

use std::path::PathBuf;

/// What the binary was asked to do
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Print the device list
    List,
    Version,
    Help,
    /// Run a measurement
    Measure(MeasureOptions),
}

/// Options for a measurement run; `None` keeps the configured value
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeasureOptions {
    pub input_device: Option<String>,
    pub output_device: Option<String>,
    pub sample_rate: Option<u32>,
    /// Simulated loopback delay in frames instead of real devices
    pub simulate: Option<f64>,
    pub noise: Option<f32>,
    pub json: bool,
    pub config_path: Option<PathBuf>,
    pub save_config: bool,
}

fn value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str, String> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| format!("{} requires a value", flag))
}

fn number<T: std::str::FromStr>(args: &[String], i: usize, flag: &str) -> Result<T, String> {
    let raw = value(args, i, flag)?;
    raw.parse()
        .map_err(|_| format!("Invalid value for {}: {}", flag, raw))
}

/// Parse arguments, excluding the program name
///
/// # Example
/// ```
/// use latencytester::cli::{parse_args, Command};
///
/// let args: Vec<String> = ["--simulate", "480", "--json"].iter().map(|s| s.to_string()).collect();
/// let Command::Measure(options) = parse_args(&args).unwrap() else { panic!() };
/// assert_eq!(options.simulate, Some(480.0));
/// assert!(options.json);
/// ```
pub fn parse_args(args: &[String]) -> Result<Command, String> {
    let mut options = MeasureOptions::default();
    let mut i = 0;

    while i < args.len() {
        match args[i].as_str() {
            "--list" | "-l" => return Ok(Command::List),
            "--version" | "-v" => return Ok(Command::Version),
            "--help" | "-h" => return Ok(Command::Help),
            "--device" | "-d" => {
                let name = value(args, i, "--device")?.to_string();
                options.input_device = Some(name.clone());
                options.output_device = Some(name);
                i += 2;
                continue;
            }
            "--input" | "-i" => {
                options.input_device = Some(value(args, i, "--input")?.to_string());
                i += 2;
                continue;
            }
            "--output" | "-o" => {
                options.output_device = Some(value(args, i, "--output")?.to_string());
                i += 2;
                continue;
            }
            "--sample-rate" | "-r" => {
                let rate: u32 = number(args, i, "--sample-rate")?;
                if !(8000..=384000).contains(&rate) {
                    return Err(format!("Sample rate out of range: {}", rate));
                }
                options.sample_rate = Some(rate);
                i += 2;
                continue;
            }
            "--simulate" | "-s" => {
                let frames: f64 = number(args, i, "--simulate")?;
                if !frames.is_finite() || frames <= 0.0 {
                    return Err(format!("Simulated delay must be positive: {}", frames));
                }
                options.simulate = Some(frames);
                i += 2;
                continue;
            }
            "--noise" | "-n" => {
                let level: f32 = number(args, i, "--noise")?;
                if !(0.0..=1.0).contains(&level) {
                    return Err(format!("Noise level must be within 0..1: {}", level));
                }
                options.noise = Some(level);
                i += 2;
                continue;
            }
            "--config" | "-c" => {
                options.config_path = Some(PathBuf::from(value(args, i, "--config")?));
                i += 2;
                continue;
            }
            "--json" => options.json = true,
            "--save-config" => options.save_config = true,
            arg => return Err(format!("Unknown argument: {}", arg)),
        }
        i += 1;
    }

    Ok(Command::Measure(options))
}

pub fn print_help() {
    println!("Usage: latencytester [OPTIONS]");
    println!();
    println!("Options:");
    println!("  -l, --list              List available audio devices");
    println!("  -d, --device NAME       Use NAME for both input and output");
    println!("  -i, --input NAME        Input device");
    println!("  -o, --output NAME       Output device");
    println!("  -r, --sample-rate RATE  Sample rate (default: device default)");
    println!("  -s, --simulate FRAMES   Measure a simulated loopback with this delay");
    println!("  -n, --noise LEVEL       Noise level for the simulated loopback (0..1)");
    println!("      --json              Print the report as JSON");
    println!("  -c, --config PATH       Config file (default: platform data dir)");
    println!("      --save-config       Write the effective config back to disk");
    println!("  -v, --version           Show version");
    println!("  -h, --help              Show this help");
    println!();
    println!("Examples:");
    println!("  latencytester -d \"Scarlett 2i2 USB\" -r 48000");
    println!("  latencytester --simulate 480.25 --noise 0.01");
    println!("  latencytester --list");
}
