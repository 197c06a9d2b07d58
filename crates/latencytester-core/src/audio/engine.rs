//! cpal audio backend for device management and stream handling
//!
//! Provides:
//! - Enumerating devices with their channel counts and sample rates
//! - Negotiating one sample rate both directions support
//! - Opening the input and output streams that carry the duplex halves
//!
//! On Windows with the `asio` feature the ASIO host is used; everywhere
//! else the platform default host. The duplex halves are moved directly
//! into the stream closures, so the audio callbacks never take a lock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BuildStreamError, Device, Host, SampleRate, Stream, StreamConfig};
use serde::{Deserialize, Serialize};

use super::duplex::{AudioBackend, DuplexFormat, FollowerHalf, LeaderHalf};
use crate::error::{Result, StreamError};

/// Rates probed when listing devices
const COMMON_RATES: [u32; 6] = [44100, 48000, 88200, 96000, 176400, 192000];

/// Audio device information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device name
    pub name: String,
    /// Whether this is the default input or output device
    pub is_default: bool,
    /// Supported sample rates
    pub sample_rates: Vec<u32>,
    /// Number of input channels
    pub input_channels: u16,
    /// Number of output channels
    pub output_channels: u16,
}

/// Device selection for [`CpalBackend`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpalConfig {
    /// Input device name, default device when `None`
    pub input_device: Option<String>,
    /// Output device name, default device when `None`
    pub output_device: Option<String>,
    /// Requested rate, output device default when `None`
    pub sample_rate: Option<u32>,
    /// Fixed period size, driver default when `None`
    pub buffer_frames: Option<u32>,
}

/// Get the host to use
fn get_host() -> Host {
    #[cfg(all(target_os = "windows", feature = "asio"))]
    {
        match cpal::host_from_id(cpal::HostId::Asio) {
            Ok(host) => return host,
            Err(e) => tracing::warn!("ASIO host unavailable, using default host: {}", e),
        }
    }
    cpal::default_host()
}

/// List available devices
///
/// # Returns
/// Vector of device information for every device the host reports
pub fn list_devices() -> Result<Vec<DeviceInfo>> {
    let host = get_host();
    let mut devices = Vec::new();

    let default_input = host.default_input_device().and_then(|d| d.name().ok());
    let default_output = host.default_output_device().and_then(|d| d.name().ok());

    let all = host
        .devices()
        .map_err(|e| StreamError::Build(e.to_string()))?;
    for device in all {
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        let is_default = default_input.as_deref() == Some(name.as_str())
            || default_output.as_deref() == Some(name.as_str());

        let input_channels = device
            .default_input_config()
            .map(|c| c.channels())
            .unwrap_or(0);
        let output_channels = device
            .default_output_config()
            .map(|c| c.channels())
            .unwrap_or(0);

        let mut sample_rates = Vec::new();
        if let Ok(configs) = device.supported_output_configs() {
            for config in configs {
                for &rate in &COMMON_RATES {
                    if (config.min_sample_rate().0..=config.max_sample_rate().0).contains(&rate)
                        && !sample_rates.contains(&rate)
                    {
                        sample_rates.push(rate);
                    }
                }
            }
        }
        sample_rates.sort();

        devices.push(DeviceInfo {
            name,
            is_default,
            sample_rates,
            input_channels,
            output_channels,
        });
    }

    if devices.is_empty() {
        return Err(StreamError::NoDevicesFound);
    }
    Ok(devices)
}

fn find_device(host: &Host, name: Option<&str>, input: bool) -> Result<Device> {
    match name {
        Some(name) => host
            .devices()
            .map_err(|e| StreamError::Build(e.to_string()))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| StreamError::DeviceNotFound(name.to_string())),
        None if input => host
            .default_input_device()
            .ok_or(StreamError::NoDevicesFound),
        None => host
            .default_output_device()
            .ok_or(StreamError::NoDevicesFound),
    }
}

fn device_label(device: &Device) -> String {
    device.name().unwrap_or_else(|_| "unknown".to_string())
}

/// Map a cpal build failure onto the error taxonomy
fn build_error(device: &str, err: BuildStreamError) -> StreamError {
    match err {
        BuildStreamError::DeviceNotAvailable => StreamError::DeviceBusy(device.to_string()),
        BuildStreamError::StreamConfigNotSupported => {
            StreamError::UnsupportedConfig(format!("{} rejected the stream config", device))
        }
        BuildStreamError::BackendSpecific { err } => {
            let text = err.to_string();
            let lower = text.to_lowercase();
            if lower.contains("permission") || lower.contains("denied") {
                StreamError::PermissionDenied(device.to_string())
            } else if lower.contains("busy") {
                StreamError::DeviceBusy(device.to_string())
            } else {
                StreamError::Build(text)
            }
        }
        other => StreamError::Build(other.to_string()),
    }
}

/// True when `device` accepts `rate` for input (or output)
fn supports_rate(device: &Device, rate: u32, input: bool) -> bool {
    let in_range = |min: SampleRate, max: SampleRate| (min.0..=max.0).contains(&rate);
    if input {
        device
            .supported_input_configs()
            .map(|mut c| c.any(|r| in_range(r.min_sample_rate(), r.max_sample_rate())))
            .unwrap_or(false)
    } else {
        device
            .supported_output_configs()
            .map(|mut c| c.any(|r| in_range(r.min_sample_rate(), r.max_sample_rate())))
            .unwrap_or(false)
    }
}

/// Duplex backend on real audio devices
pub struct CpalBackend {
    config: CpalConfig,
    host: Host,
    input: Option<(Device, StreamConfig)>,
    output: Option<(Device, StreamConfig)>,
    follower_stream: Option<Stream>,
    leader_stream: Option<Stream>,
    running: Arc<AtomicBool>,
}

impl CpalBackend {
    pub fn new(config: CpalConfig) -> Self {
        Self {
            config,
            host: get_host(),
            input: None,
            output: None,
            follower_stream: None,
            leader_stream: None,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    fn build_input(
        &self,
        device: &Device,
        config: &StreamConfig,
        mut process: impl FnMut(&[f32]) + Send + 'static,
    ) -> Result<Stream> {
        let running = Arc::clone(&self.running);
        let callbacks = Arc::new(AtomicU64::new(0));
        let channels = config.channels as usize;
        let label = device_label(device);
        device
            .build_input_stream(
                config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if running.load(Ordering::Relaxed) {
                        process(data);
                        if callbacks.fetch_add(1, Ordering::Relaxed) == 0 {
                            tracing::info!(
                                "Input callback started: {} frames ({} channels)",
                                data.len() / channels.max(1),
                                channels
                            );
                        }
                    }
                },
                move |err| {
                    tracing::error!("Input stream error: {}", err);
                },
                None,
            )
            .map_err(|e| build_error(&label, e))
    }

    fn build_output(
        &self,
        device: &Device,
        config: &StreamConfig,
        mut process: impl FnMut(&mut [f32]) + Send + 'static,
    ) -> Result<Stream> {
        let running = Arc::clone(&self.running);
        let callbacks = Arc::new(AtomicU64::new(0));
        let channels = config.channels as usize;
        let label = device_label(device);
        device
            .build_output_stream(
                config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    if running.load(Ordering::Relaxed) {
                        process(data);
                        if callbacks.fetch_add(1, Ordering::Relaxed) == 0 {
                            tracing::info!(
                                "Output callback started: {} frames ({} channels)",
                                data.len() / channels.max(1),
                                channels
                            );
                        }
                    } else {
                        data.fill(0.0);
                    }
                },
                move |err| {
                    tracing::error!("Output stream error: {}", err);
                },
                None,
            )
            .map_err(|e| build_error(&label, e))
    }
}

impl AudioBackend for CpalBackend {
    fn negotiate(&mut self) -> Result<DuplexFormat> {
        let input_device = find_device(&self.host, self.config.input_device.as_deref(), true)?;
        let output_device = find_device(&self.host, self.config.output_device.as_deref(), false)?;
        let input_name = device_label(&input_device);
        let output_name = device_label(&output_device);

        let default_input = input_device
            .default_input_config()
            .map_err(|_| StreamError::NoInputChannels(input_name.clone()))?;
        let default_output = output_device
            .default_output_config()
            .map_err(|_| StreamError::NoOutputChannels(output_name.clone()))?;
        if default_input.channels() == 0 {
            return Err(StreamError::NoInputChannels(input_name));
        }
        if default_output.channels() == 0 {
            return Err(StreamError::NoOutputChannels(output_name));
        }

        tracing::info!(
            "Device default configs: input {} ({} Hz, {} ch), output {} ({} Hz, {} ch)",
            input_name,
            default_input.sample_rate().0,
            default_input.channels(),
            output_name,
            default_output.sample_rate().0,
            default_output.channels()
        );

        // Configured rate first, then the output default, then the input default
        let mut candidates = Vec::with_capacity(3);
        if let Some(rate) = self.config.sample_rate {
            candidates.push(rate);
        }
        candidates.push(default_output.sample_rate().0);
        candidates.push(default_input.sample_rate().0);

        let rate = candidates
            .iter()
            .copied()
            .find(|&r| supports_rate(&input_device, r, true) && supports_rate(&output_device, r, false))
            .ok_or(StreamError::SampleRateMismatch {
                input: default_input.sample_rate().0,
                output: default_output.sample_rate().0,
            })?;
        if let Some(requested) = self.config.sample_rate {
            if requested != rate {
                tracing::warn!(
                    "Configured rate {} Hz not supported by both devices, using {} Hz",
                    requested,
                    rate
                );
            }
        }

        let buffer_size = match self.config.buffer_frames {
            Some(frames) => cpal::BufferSize::Fixed(frames),
            None => cpal::BufferSize::Default,
        };
        let input_config = StreamConfig {
            channels: default_input.channels(),
            sample_rate: SampleRate(rate),
            buffer_size,
        };
        let output_config = StreamConfig {
            channels: default_output.channels(),
            sample_rate: SampleRate(rate),
            buffer_size,
        };

        let format = DuplexFormat {
            sample_rate: rate,
            input_channels: input_config.channels,
            output_channels: output_config.channels,
            frames_per_period: self.config.buffer_frames.unwrap_or(0) as usize,
        };
        tracing::info!("Effective sample rate: {} Hz", rate);

        self.input = Some((input_device, input_config));
        self.output = Some((output_device, output_config));
        Ok(format)
    }

    fn start(&mut self, leader: LeaderHalf, follower: FollowerHalf) -> Result<()> {
        if self.leader_stream.is_some() {
            return Err(StreamError::AlreadyRunning);
        }
        let (input_device, input_config) = self
            .input
            .clone()
            .ok_or_else(|| StreamError::UnsupportedConfig("streams not negotiated".to_string()))?;
        let (output_device, output_config) = self
            .output
            .clone()
            .ok_or_else(|| StreamError::UnsupportedConfig("streams not negotiated".to_string()))?;

        self.running.store(true, Ordering::Relaxed);

        // Follower first so the leader never waits on a stream that is not
        // yet running
        let (follower_stream, leader_stream) = match (leader, follower) {
            (LeaderHalf::Output(mut leader), FollowerHalf::Input(mut follower)) => {
                let input = self.build_input(&input_device, &input_config, move |data| {
                    follower.process(data)
                })?;
                let output = self.build_output(&output_device, &output_config, move |data| {
                    leader.process(data)
                })?;
                (input, output)
            }
            (LeaderHalf::Input(mut leader), FollowerHalf::Output(mut follower)) => {
                let output = self.build_output(&output_device, &output_config, move |data| {
                    follower.process(data)
                })?;
                let input = self.build_input(&input_device, &input_config, move |data| {
                    leader.process(data)
                })?;
                (output, input)
            }
            _ => {
                self.running.store(false, Ordering::Relaxed);
                return Err(StreamError::UnsupportedConfig(
                    "leader and follower drive the same direction".to_string(),
                ));
            }
        };

        let play = |stream: &Stream| stream.play().map_err(|e| StreamError::Play(e.to_string()));
        if let Err(e) = play(&follower_stream).and_then(|_| play(&leader_stream)) {
            self.running.store(false, Ordering::Relaxed);
            return Err(e);
        }

        self.follower_stream = Some(follower_stream);
        self.leader_stream = Some(leader_stream);

        tracing::info!(
            "Audio streams started: {} -> {} @ {}Hz",
            device_label(&output_device),
            device_label(&input_device),
            input_config.sample_rate.0
        );
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        // Leader first, mirroring start order
        let leader = self.leader_stream.take();
        let follower = self.follower_stream.take();
        if leader.is_some() || follower.is_some() {
            drop(leader);
            drop(follower);
            tracing::info!("Audio streams stopped");
        }
    }

    fn name(&self) -> String {
        format!("cpal ({:?})", self.host.id())
    }
}

impl Drop for CpalBackend {
    fn drop(&mut self) {
        self.stop();
    }
}
