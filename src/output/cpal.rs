//! cpal-backed audio output driver.
//!
//! Drives an output device through the cpal host layer with the
//! pull-callback contract of [`AudioOutput`]:
//!
//! * The data callback zeroes its buffer first, checks the shutdown /
//!   swap / transition flags, try-locks the render-callback mutex
//!   (silence on contention, never a block), silences any unproduced
//!   tail and applies a sample-accurate volume ramp.
//! * During DoP passthrough all silence becomes DoP idle (alternating
//!   0x05/0xFA markers over 0x6969) and volume scaling is disabled, so
//!   the DAC stays locked to DSD instead of popping out of it.
//! * Device changes stop the stream, rebuild it and restart, keeping
//!   the installed render callback.
//!
//! Exclusive (hog) mode: cpal exposes no portable exclusive-access
//! control, so the driver reports it unsupported and only tracks the
//! request. Dedicated backends (ASIO, JACK) are available through the
//! crate features of the same names.

use std::sync::{
    atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
    Arc, Mutex,
};

use ::cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use crate::{
    decoder::StreamFormat,
    error::{Error, Result},
    output::{fill_dop_silence, AudioDeviceInfo, AudioOutput, RenderCallback},
};

/// Sample rates probed when enumerating device capabilities. cpal
/// reports ranges; probing this list turns them into the discrete
/// rates a player actually uses.
pub const SAMPLE_RATES: [u32; 8] = [
    44_100, 48_000, 88_200, 96_000, 176_400, 192_000, 352_800, 384_000,
];

/// State shared with the OS audio thread.
struct Shared {
    render_cb: Mutex<Option<RenderCallback>>,
    running: AtomicBool,
    destroyed: AtomicBool,
    swapping_callback: AtomicBool,
    transitioning: AtomicBool,
    dop_passthrough: AtomicBool,
    dop_marker: AtomicBool,
    volume_bits: AtomicU32,
    channels: AtomicUsize,
    device_lost: AtomicBool,
}

impl Shared {
    fn new() -> Self {
        Self {
            render_cb: Mutex::new(None),
            running: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            swapping_callback: AtomicBool::new(false),
            transitioning: AtomicBool::new(false),
            dop_passthrough: AtomicBool::new(false),
            dop_marker: AtomicBool::new(false),
            volume_bits: AtomicU32::new(1.0_f32.to_bits()),
            channels: AtomicUsize::new(2),
            device_lost: AtomicBool::new(false),
        }
    }

    /// Fills a whole callback buffer with DoP idle, advancing the
    /// shared marker phase.
    fn fill_dop_silence(&self, data: &mut [f32]) {
        let channels = self.channels.load(Ordering::Relaxed).max(1);
        let frames = data.len() / channels;
        let mut marker = self.dop_marker.load(Ordering::Relaxed);
        fill_dop_silence(data, frames, channels, &mut marker);
        self.dop_marker.store(marker, Ordering::Relaxed);
    }
}

/// cpal-backed output driver.
pub struct CpalOutput {
    host: ::cpal::Host,
    shared: Arc<Shared>,
    device: Option<::cpal::Device>,
    stream: Option<::cpal::Stream>,
    format: StreamFormat,
    device_id: u32,
    buffer_size: Option<u32>,
    bit_perfect: bool,
    hog_requested: bool,
}

impl CpalOutput {
    /// Creates a driver on the default host. No device is touched until
    /// [`AudioOutput::open`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            host: ::cpal::default_host(),
            shared: Arc::new(Shared::new()),
            device: None,
            stream: None,
            format: StreamFormat::default(),
            device_id: 0,
            buffer_size: None,
            bit_perfect: false,
            hog_requested: false,
        }
    }

    /// Resolves a numeric device id: 0 is the default device, anything
    /// else indexes the enumeration order.
    fn device_by_id(&self, device_id: u32) -> Option<::cpal::Device> {
        if device_id == 0 {
            return self.host.default_output_device();
        }
        self.host
            .output_devices()
            .ok()?
            .nth(device_id as usize - 1)
    }

    /// Discrete rates the device accepts, probed from the supported
    /// configuration ranges.
    fn supported_rates(&self, device_id: u32) -> Vec<u32> {
        let Some(device) = self.device_by_id(device_id) else {
            return Vec::new();
        };
        let Ok(configs) = device.supported_output_configs() else {
            return Vec::new();
        };

        let mut rates = Vec::new();
        for config in configs {
            for &rate in &SAMPLE_RATES {
                if config
                    .try_with_sample_rate(::cpal::SampleRate(rate))
                    .is_some()
                    && !rates.contains(&rate)
                {
                    rates.push(rate);
                }
            }
        }
        rates.sort_unstable();
        rates
    }

    /// Builds (or rebuilds) the output stream for the current format and
    /// device, wiring the shared state into the data callback.
    fn build_stream(&mut self) -> Result<()> {
        let device = self
            .device
            .clone()
            .ok_or_else(|| Error::device_open_failed("no device selected"))?;

        let channels = u16::try_from(self.format.channels.clamp(1, 8))
            .map_err(|_| Error::invalid_argument("channel count out of range"))?;
        let sample_rate = self.format.sample_rate as u32;

        // Verify the device accepts the format in f32 before building.
        let supported = device
            .supported_output_configs()?
            .any(|config| {
                config.channels() == channels
                    && config.sample_format() == ::cpal::SampleFormat::F32
                    && config
                        .try_with_sample_rate(::cpal::SampleRate(sample_rate))
                        .is_some()
            });
        if !supported {
            return Err(Error::device_open_failed(format!(
                "device does not support {channels} ch f32 at {sample_rate} Hz"
            )));
        }

        let config = ::cpal::StreamConfig {
            channels,
            sample_rate: ::cpal::SampleRate(sample_rate),
            buffer_size: self
                .buffer_size
                .map_or(::cpal::BufferSize::Default, ::cpal::BufferSize::Fixed),
        };

        self.shared
            .channels
            .store(usize::from(channels), Ordering::Relaxed);
        self.shared.device_lost.store(false, Ordering::Relaxed);

        let shared = Arc::clone(&self.shared);
        let mut prev_volume = f32::from_bits(self.shared.volume_bits.load(Ordering::Relaxed));

        let data_cb = move |data: &mut [f32], _: &::cpal::OutputCallbackInfo| {
            // Safe fallback on every early return.
            data.fill(0.0);

            if shared.destroyed.load(Ordering::Acquire) {
                return;
            }

            let is_dop = shared.dop_passthrough.load(Ordering::Relaxed);

            if !shared.running.load(Ordering::Acquire)
                || shared.swapping_callback.load(Ordering::Acquire)
                || shared.transitioning.load(Ordering::Acquire)
            {
                if is_dop {
                    shared.fill_dop_silence(data);
                }
                return;
            }

            let channels = shared.channels.load(Ordering::Relaxed).max(1);
            let frames = data.len() / channels;

            let mut produced = 0;
            if let Ok(mut guard) = shared.render_cb.try_lock() {
                if let Some(render) = guard.as_mut() {
                    produced = render(data, frames);
                }
            }
            // A failed try-lock leaves produced at 0: silence this cycle.

            if is_dop {
                // Keep the marker tracker aligned with the frames the
                // renderer emitted, then pad with valid DoP idle.
                if produced % 2 == 1 {
                    let marker = shared.dop_marker.load(Ordering::Relaxed);
                    shared.dop_marker.store(!marker, Ordering::Relaxed);
                }
                if produced < frames {
                    let mut marker = shared.dop_marker.load(Ordering::Relaxed);
                    fill_dop_silence(
                        &mut data[produced * channels..],
                        frames - produced,
                        channels,
                        &mut marker,
                    );
                    shared.dop_marker.store(marker, Ordering::Relaxed);
                }
                // Volume scaling destroys DoP markers; skip it entirely.
                return;
            }

            if produced < frames {
                data[produced * channels..].fill(0.0);
            }

            // Sample-accurate volume ramp from the previous callback's
            // value.
            let volume = f32::from_bits(shared.volume_bits.load(Ordering::Relaxed));
            if (volume - prev_volume).abs() > f32::EPSILON {
                let step = (volume - prev_volume) / frames.max(1) as f32;
                let mut gain = prev_volume;
                for frame in 0..frames {
                    gain += step;
                    for channel in 0..channels {
                        data[frame * channels + channel] *= gain;
                    }
                }
                prev_volume = volume;
            } else if volume < 1.0 {
                for sample in data.iter_mut() {
                    *sample *= volume;
                }
            }
        };

        let shared_err = Arc::clone(&self.shared);
        let err_cb = move |err: ::cpal::StreamError| {
            error!("audio stream error: {err}");
            if matches!(err, ::cpal::StreamError::DeviceNotAvailable) {
                shared_err.device_lost.store(true, Ordering::Release);
            }
        };

        let stream = device.build_output_stream(&config, data_cb, err_cb, None)?;
        // Some hosts start streams on creation; hold until start().
        let _ = stream.pause();
        self.stream = Some(stream);

        Ok(())
    }

    /// Stop → reconfigure → restart plumbing shared by the set_*
    /// methods; preserves the render callback across the rebuild.
    fn rebuild_running(&mut self) -> Result<()> {
        let was_running = self.is_running();
        self.stop();
        self.stream = None;
        self.build_stream()?;
        if was_running {
            self.start()?;
        }
        Ok(())
    }

    /// Whether the stream's device disappeared (reported by the host's
    /// error callback). Polled by the engine's main-thread tick.
    #[must_use]
    pub fn is_device_lost(&self) -> bool {
        self.shared.device_lost.load(Ordering::Acquire)
    }

    fn looks_built_in(name: &str) -> bool {
        let lower = name.to_ascii_lowercase();
        ["built-in", "builtin", "internal", "macbook", "speakers"]
            .iter()
            .any(|marker| lower.contains(marker))
    }
}

impl Default for CpalOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioOutput for CpalOutput {
    fn open(&mut self, format: &StreamFormat, device_id: u32) -> Result<()> {
        self.close();

        let device = self
            .device_by_id(device_id)
            .ok_or_else(|| Error::device_open_failed(format!("device {device_id} not found")))?;

        info!(
            "opening output: {} at {:.0} Hz, {} ch",
            device.name().as_deref().unwrap_or("UNKNOWN"),
            format.sample_rate,
            format.channels,
        );

        self.device = Some(device);
        self.device_id = device_id;
        self.format = *format;
        self.shared.destroyed.store(false, Ordering::Release);
        self.build_stream()
    }

    fn start(&mut self) -> Result<()> {
        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| Error::unavailable("output not open"))?;
        stream.play()?;
        self.shared.running.store(true, Ordering::Release);
        self.shared.transitioning.store(false, Ordering::Release);
        Ok(())
    }

    fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(stream) = self.stream.as_ref() {
            let _ = stream.pause();
        }
    }

    fn close(&mut self) {
        self.stop();
        self.release_hog_mode();
        self.stream = None;
        self.device = None;
    }

    fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    fn set_render_callback(&mut self, callback: Option<RenderCallback>) {
        // Gate the render path so it skips the cycle instead of
        // blocking on the callback mutex.
        self.shared.swapping_callback.store(true, Ordering::Release);
        {
            let mut guard = self
                .shared
                .render_cb
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            *guard = callback;
        }
        self.shared.swapping_callback.store(false, Ordering::Release);
    }

    fn set_volume(&mut self, volume: f32) {
        self.shared
            .volume_bits
            .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    fn set_device(&mut self, device_id: u32) -> Result<()> {
        let device = self
            .device_by_id(device_id)
            .ok_or_else(|| Error::device_open_failed(format!("device {device_id} not found")))?;
        self.device = Some(device);
        self.device_id = device_id;
        self.rebuild_running()
    }

    fn set_buffer_size(&mut self, frames: u32) -> Result<()> {
        self.buffer_size = Some(frames);
        if self.stream.is_some() {
            self.rebuild_running()?;
        }
        Ok(())
    }

    fn set_sample_rate(&mut self, rate: f64) -> Result<()> {
        self.format.sample_rate = rate;
        if self.stream.is_some() {
            self.rebuild_running()?;
        }
        Ok(())
    }

    fn set_hog_mode(&mut self, enabled: bool) -> bool {
        self.hog_requested = enabled;
        if enabled {
            warn!("exclusive mode requested, but the host layer exposes no exclusive access");
        }
        false
    }

    fn release_hog_mode(&mut self) {
        // Only release what this process owns; with no backing
        // acquisition there is never anything to release.
        self.hog_requested = false;
    }

    fn is_hog_mode_supported(&self) -> bool {
        false
    }

    fn is_exclusive_mode(&self) -> bool {
        false
    }

    fn set_bit_perfect_mode(&mut self, enabled: bool) {
        self.bit_perfect = enabled;
    }

    fn bit_perfect_mode(&self) -> bool {
        self.bit_perfect
    }

    fn set_dop_passthrough(&mut self, enabled: bool) {
        self.shared
            .dop_passthrough
            .store(enabled, Ordering::Release);
    }

    fn set_transitioning(&mut self, transitioning: bool) {
        self.shared
            .transitioning
            .store(transitioning, Ordering::Release);
    }

    fn device_name(&self) -> String {
        self.device
            .as_ref()
            .and_then(|device| device.name().ok())
            .unwrap_or_else(|| String::from("UNKNOWN"))
    }

    fn current_sample_rate(&self) -> f64 {
        self.format.sample_rate
    }

    fn device_nominal_sample_rate(&self) -> f64 {
        self.device
            .as_ref()
            .and_then(|device| device.default_output_config().ok())
            .map_or(0.0, |config| f64::from(config.sample_rate().0))
    }

    fn is_built_in_output(&self) -> bool {
        self.device
            .as_ref()
            .and_then(|device| device.name().ok())
            .is_some_and(|name| Self::looks_built_in(&name))
    }

    fn enumerate_devices(&self) -> Vec<AudioDeviceInfo> {
        let default_name = self
            .host
            .default_output_device()
            .and_then(|device| device.name().ok());

        let Ok(devices) = self.host.output_devices() else {
            return Vec::new();
        };

        devices
            .enumerate()
            .filter_map(|(index, device)| {
                let name = device.name().ok()?;
                let output_channels = device
                    .supported_output_configs()
                    .ok()?
                    .map(|config| usize::from(config.channels()))
                    .max()
                    .unwrap_or(0);
                Some(AudioDeviceInfo {
                    device_id: index as u32 + 1,
                    uid: name.clone(),
                    is_default: default_name.as_deref() == Some(name.as_str()),
                    output_channels,
                    is_alive: true,
                    name,
                })
            })
            .collect()
    }

    fn max_sample_rate(&self, device_id: u32) -> f64 {
        self.supported_rates(device_id)
            .last()
            .map_or(44_100.0, |&rate| f64::from(rate))
    }

    fn nearest_supported_rate(&self, target: f64, device_id: u32) -> f64 {
        let rates = self.supported_rates(device_id);
        if rates.is_empty() {
            return target;
        }
        rates
            .iter()
            .copied()
            .min_by(|&a, &b| {
                let da = (f64::from(a) - target).abs();
                let db = (f64::from(b) - target).abs();
                da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
            })
            .map_or(target, f64::from)
    }

    fn is_built_in_device(&self, device_id: u32) -> bool {
        self.device_by_id(device_id)
            .and_then(|device| device.name().ok())
            .is_some_and(|name| Self::looks_built_in(&name))
    }

    fn device_lost(&self) -> bool {
        self.is_device_lost()
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.shared.destroyed.store(true, Ordering::Release);
        self.set_render_callback(None);
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::CpalOutput;

    #[test]
    fn built_in_heuristic_matches_common_names() {
        assert!(CpalOutput::looks_built_in("MacBook Pro Speakers"));
        assert!(CpalOutput::looks_built_in("Built-in Output"));
        assert!(CpalOutput::looks_built_in("Internal Speakers"));
        assert!(!CpalOutput::looks_built_in("TOPPING D90"));
        assert!(!CpalOutput::looks_built_in("USB DAC 2.0"));
    }
}
