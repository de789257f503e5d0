//! Headless output driver.
//!
//! Implements the full [`AudioOutput`] contract without touching any
//! audio hardware. Used by the test suite and by headless deployments
//! (CI, analysis tools) that drive the engine's render path directly.
//!
//! The driver never spawns an audio thread; a host that wants samples
//! pulls them through [`NullOutput::render_now`], which applies the
//! same flag checks, try-lock, tail-silencing, DoP-silence and volume
//! rules as the real driver.

use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc, Mutex,
};

use crate::{
    decoder::StreamFormat,
    error::{Error, Result},
    output::{fill_dop_silence, AudioDeviceInfo, AudioOutput, RenderCallback},
};

/// Shared flag/callback state, mirroring the real driver's layout.
struct Shared {
    render_cb: Mutex<Option<RenderCallback>>,
    running: AtomicBool,
    swapping_callback: AtomicBool,
    transitioning: AtomicBool,
    dop_passthrough: AtomicBool,
    dop_marker: AtomicBool,
    volume_bits: AtomicU32,
}

/// Output driver that accepts everything and renders on demand.
pub struct NullOutput {
    shared: Arc<Shared>,
    format: StreamFormat,
    open: bool,
    device_id: u32,
    bit_perfect: bool,
    exclusive: bool,
    buffer_size: Option<u32>,
    max_rate: f64,
    supported_rates: Vec<u32>,
    prev_volume: f32,
}

impl NullOutput {
    /// Creates a driver whose fake device supports rates up to 384 kHz.
    #[must_use]
    pub fn new() -> Self {
        Self::with_supported_rates(&[
            44_100, 48_000, 88_200, 96_000, 176_400, 192_000, 352_800, 384_000,
        ])
    }

    /// Creates a driver whose fake device supports exactly the given
    /// rates. Lets tests model limited DACs (for DoP fallback paths).
    #[must_use]
    pub fn with_supported_rates(rates: &[u32]) -> Self {
        Self {
            shared: Arc::new(Shared {
                render_cb: Mutex::new(None),
                running: AtomicBool::new(false),
                swapping_callback: AtomicBool::new(false),
                transitioning: AtomicBool::new(false),
                dop_passthrough: AtomicBool::new(false),
                dop_marker: AtomicBool::new(false),
                volume_bits: AtomicU32::new(1.0_f32.to_bits()),
            }),
            format: StreamFormat::default(),
            open: false,
            device_id: 0,
            bit_perfect: false,
            exclusive: false,
            buffer_size: None,
            max_rate: rates.iter().max().copied().map_or(384_000.0, f64::from),
            supported_rates: rates.to_vec(),
            prev_volume: 1.0,
        }
    }

    /// Pulls `frames` frames through the installed render callback with
    /// the real driver's callback-shell semantics. Returns the number
    /// of frames the callback produced (the buffer is always filled in
    /// full, with silence past that point).
    pub fn render_now(&mut self, buf: &mut [f32], frames: usize) -> usize {
        buf.fill(0.0);

        let shared = &self.shared;
        let is_dop = shared.dop_passthrough.load(Ordering::Relaxed);
        let channels = self.format.channels.max(1);

        if !shared.running.load(Ordering::Acquire)
            || shared.swapping_callback.load(Ordering::Acquire)
            || shared.transitioning.load(Ordering::Acquire)
        {
            if is_dop {
                let mut marker = shared.dop_marker.load(Ordering::Relaxed);
                fill_dop_silence(buf, frames, channels, &mut marker);
                shared.dop_marker.store(marker, Ordering::Relaxed);
            }
            return 0;
        }

        let mut produced = 0;
        if let Ok(mut guard) = shared.render_cb.try_lock() {
            if let Some(render) = guard.as_mut() {
                produced = render(buf, frames);
            }
        }

        if is_dop {
            if produced % 2 == 1 {
                let marker = shared.dop_marker.load(Ordering::Relaxed);
                shared.dop_marker.store(!marker, Ordering::Relaxed);
            }
            if produced < frames {
                let mut marker = shared.dop_marker.load(Ordering::Relaxed);
                fill_dop_silence(
                    &mut buf[produced * channels..],
                    frames - produced,
                    channels,
                    &mut marker,
                );
                shared.dop_marker.store(marker, Ordering::Relaxed);
            }
            return produced;
        }

        if produced < frames {
            buf[produced * channels..frames * channels].fill(0.0);
        }

        let volume = f32::from_bits(shared.volume_bits.load(Ordering::Relaxed));
        if (volume - self.prev_volume).abs() > f32::EPSILON {
            let step = (volume - self.prev_volume) / frames.max(1) as f32;
            let mut gain = self.prev_volume;
            for frame in 0..frames {
                gain += step;
                for channel in 0..channels {
                    buf[frame * channels + channel] *= gain;
                }
            }
            self.prev_volume = volume;
        } else if volume < 1.0 {
            for sample in &mut buf[..frames * channels] {
                *sample *= volume;
            }
        }

        produced
    }
}

impl Default for NullOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioOutput for NullOutput {
    fn open(&mut self, format: &StreamFormat, device_id: u32) -> Result<()> {
        if !self
            .supported_rates
            .iter()
            .any(|&rate| (f64::from(rate) - format.sample_rate).abs() < 1.0)
        {
            return Err(Error::device_open_failed(format!(
                "null device does not support {} Hz",
                format.sample_rate
            )));
        }
        self.format = *format;
        self.device_id = device_id;
        self.open = true;
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        if !self.open {
            return Err(Error::unavailable("output not open"));
        }
        self.shared.running.store(true, Ordering::Release);
        self.shared.transitioning.store(false, Ordering::Release);
        Ok(())
    }

    fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
    }

    fn close(&mut self) {
        self.stop();
        self.open = false;
    }

    fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    fn set_render_callback(&mut self, callback: Option<RenderCallback>) {
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
        self.device_id = device_id;
        // A real driver restarts the stream here; the null stream is
        // "restarted" instantly.
        self.shared.transitioning.store(false, Ordering::Release);
        Ok(())
    }

    fn set_buffer_size(&mut self, frames: u32) -> Result<()> {
        self.buffer_size = Some(frames);
        Ok(())
    }

    fn set_sample_rate(&mut self, rate: f64) -> Result<()> {
        self.format.sample_rate = rate;
        Ok(())
    }

    fn set_hog_mode(&mut self, enabled: bool) -> bool {
        self.exclusive = enabled;
        true
    }

    fn release_hog_mode(&mut self) {
        if self.exclusive {
            self.exclusive = false;
        }
    }

    fn is_hog_mode_supported(&self) -> bool {
        true
    }

    fn is_exclusive_mode(&self) -> bool {
        self.exclusive
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
        String::from("Null Output")
    }

    fn current_sample_rate(&self) -> f64 {
        self.format.sample_rate
    }

    fn device_nominal_sample_rate(&self) -> f64 {
        self.format.sample_rate
    }

    fn is_built_in_output(&self) -> bool {
        false
    }

    fn enumerate_devices(&self) -> Vec<AudioDeviceInfo> {
        vec![AudioDeviceInfo {
            device_id: 1,
            name: String::from("Null Output"),
            uid: String::from("null-output"),
            is_default: true,
            output_channels: 8,
            is_alive: true,
        }]
    }

    fn max_sample_rate(&self, _device_id: u32) -> f64 {
        self.max_rate
    }

    fn nearest_supported_rate(&self, target: f64, _device_id: u32) -> f64 {
        self.supported_rates
            .iter()
            .copied()
            .min_by(|&a, &b| {
                let da = (f64::from(a) - target).abs();
                let db = (f64::from(b) - target).abs();
                da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
            })
            .map_or(target, f64::from)
    }

    fn is_built_in_device(&self, _device_id: u32) -> bool {
        false
    }
}
