//! Audio output drivers.
//!
//! [`AudioOutput`] is the platform boundary: a pull-style device driver
//! that invokes a render callback on the OS audio thread and handles
//! format/rate negotiation, buffer sizing and exclusive (hog) mode
//! without tearing down the upstream render graph.
//!
//! Two implementations ship with the crate:
//! * [`CpalOutput`](cpal::CpalOutput) — the real device driver over the
//!   cpal host layer.
//! * [`NullOutput`](null::NullOutput) — a headless driver with the same
//!   contract, for tests and CI machines without audio hardware.

pub mod cpal;
pub mod null;

use crate::{decoder::StreamFormat, error::Result};

/// The pull-style render callback.
///
/// Runs on the OS audio thread; fills up to `frames` interleaved frames
/// into the buffer and returns how many it actually produced. The driver
/// silences the rest.
pub type RenderCallback = Box<dyn FnMut(&mut [f32], usize) -> usize + Send + 'static>;

/// Descriptor of one output device.
#[derive(Clone, Debug, PartialEq)]
pub struct AudioDeviceInfo {
    /// Session-scoped numeric id; 0 always means the system default.
    pub device_id: u32,
    /// Human-readable device name.
    pub name: String,
    /// Persistent identifier that survives reboots (the host's stable
    /// name where no richer UID exists).
    pub uid: String,
    /// Whether this is the system default output.
    pub is_default: bool,
    /// Output channel count.
    pub output_channels: usize,
    /// Whether the device currently responds to queries.
    pub is_alive: bool,
}

/// DoP idle payload carried in the low 16 bits of silence frames.
///
/// A DoP-locked DAC interprets 0x69 bit patterns as the DSD idle tone;
/// feeding it plain PCM zeros (no marker bytes) would knock it out of
/// DSD mode with an audible pop.
const DOP_IDLE_PAYLOAD: u32 = 0x6969;

/// Encodes one DoP silence sample for the given marker phase.
#[must_use]
pub fn dop_silence_sample(marker: bool) -> f32 {
    let marker_byte: u32 = if marker { 0xFA } else { 0x05 };
    let dop_word = (marker_byte << 16) | DOP_IDLE_PAYLOAD;
    let mut signed24 = dop_word as i32;
    if signed24 & 0x80_0000 != 0 {
        signed24 |= -0x100_0000_i32;
    }
    signed24 as f32 / 8_388_608.0
}

/// Fills `frames` interleaved frames with valid DoP silence, advancing
/// the marker phase in place so alternation continues across calls.
pub fn fill_dop_silence(buf: &mut [f32], frames: usize, channels: usize, marker: &mut bool) {
    for frame in 0..frames {
        let sample = dop_silence_sample(*marker);
        *marker = !*marker;
        for channel in 0..channels {
            buf[frame * channels + channel] = sample;
        }
    }
}

/// The platform audio-output boundary.
///
/// Device changes (`set_sample_rate`, `set_buffer_size`, `set_device`)
/// stop the stream, reconfigure and restart while preserving the render
/// callback. Implementations must never block inside the render path:
/// the callback pointer is guarded by a try-lock and a missed cycle
/// produces silence.
pub trait AudioOutput {
    /// Opens the device at the requested format. `device_id` 0 selects
    /// the system default.
    ///
    /// # Errors
    ///
    /// Returns `DeviceOpenFailed` when neither the requested device nor
    /// a fallback can be opened at the format.
    fn open(&mut self, format: &StreamFormat, device_id: u32) -> Result<()>;

    /// Starts pulling audio through the render callback.
    ///
    /// # Errors
    ///
    /// Returns `DeviceOpenFailed`/`DeviceLost` when the stream cannot
    /// start.
    fn start(&mut self) -> Result<()>;

    /// Stops the stream. The device stays open.
    fn stop(&mut self);

    /// Closes the device, releasing exclusive access if held.
    fn close(&mut self);

    /// Whether the stream is running.
    fn is_running(&self) -> bool;

    /// Installs or clears the render callback. Safe to call while the
    /// stream runs; the in-flight cycle outputs silence.
    fn set_render_callback(&mut self, callback: Option<RenderCallback>);

    /// Sets the device-level volume in [0, 1]. Applied with a
    /// sample-accurate ramp, and never applied to DoP streams.
    fn set_volume(&mut self, volume: f32);

    /// Switches the output device, restarting the stream if it ran.
    ///
    /// # Errors
    ///
    /// Returns `DeviceOpenFailed` when the new device rejects the
    /// current format.
    fn set_device(&mut self, device_id: u32) -> Result<()>;

    /// Requests a device buffer size in frames, restarting the stream
    /// if it ran.
    ///
    /// # Errors
    ///
    /// Returns `DeviceOpenFailed` when reconfiguration fails.
    fn set_buffer_size(&mut self, frames: u32) -> Result<()>;

    /// Changes the device sample rate, restarting the stream if it ran.
    ///
    /// # Errors
    ///
    /// Returns `DeviceOpenFailed` when the device rejects the rate.
    fn set_sample_rate(&mut self, rate: f64) -> Result<()>;

    /// Attempts to acquire (or release) OS-level exclusive control.
    /// Returns whether the request took effect.
    fn set_hog_mode(&mut self, enabled: bool) -> bool;

    /// Releases exclusive control, but only when this process owns it.
    fn release_hog_mode(&mut self);

    /// Whether the backend can express exclusive access at all.
    fn is_hog_mode_supported(&self) -> bool;

    /// Whether exclusive access is currently held.
    fn is_exclusive_mode(&self) -> bool;

    /// Sets the bit-perfect flag; the driver avoids rate conversion of
    /// its own in this mode.
    fn set_bit_perfect_mode(&mut self, enabled: bool);

    /// Current bit-perfect flag.
    fn bit_perfect_mode(&self) -> bool;

    /// Marks the stream as carrying DoP frames: silence becomes DoP
    /// idle and volume scaling is disabled (it would destroy markers).
    fn set_dop_passthrough(&mut self, enabled: bool);

    /// Marks a transition (format change in flight): the render path
    /// emits silence until cleared by the next `start`.
    fn set_transitioning(&mut self, transitioning: bool);

    /// Name of the open device.
    fn device_name(&self) -> String;

    /// Sample rate of the open stream.
    fn current_sample_rate(&self) -> f64;

    /// The device's nominal (hardware) sample rate, when known.
    fn device_nominal_sample_rate(&self) -> f64;

    /// Whether the open device is a built-in output.
    fn is_built_in_output(&self) -> bool;

    /// Enumerates output devices.
    fn enumerate_devices(&self) -> Vec<AudioDeviceInfo>;

    /// Maximum sample rate the device supports.
    fn max_sample_rate(&self, device_id: u32) -> f64;

    /// The supported rate nearest to `target` on the device.
    fn nearest_supported_rate(&self, target: f64, device_id: u32) -> f64;

    /// Whether the given device is a built-in output.
    fn is_built_in_device(&self, device_id: u32) -> bool;

    /// Whether the open device disappeared during playback. Polled by
    /// the engine's main-thread tick; the render path itself never
    /// reports errors inline.
    fn device_lost(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::{dop_silence_sample, fill_dop_silence};

    #[test]
    fn dop_silence_carries_markers_over_idle_payload() {
        for (marker, expected_byte) in [(false, 0x05u8), (true, 0xFAu8)] {
            let sample = dop_silence_sample(marker);
            let word = (sample * 8_388_608.0).round() as i32;
            let unsigned = (word & 0x00FF_FFFF) as u32;
            assert_eq!((unsigned >> 16) as u8, expected_byte);
            assert_eq!(unsigned & 0xFFFF, 0x6969);
        }
    }

    #[test]
    fn dop_silence_alternates_across_frames_and_calls() {
        let mut marker = false;
        let mut buf = vec![0.0_f32; 2 * 5];
        fill_dop_silence(&mut buf, 5, 2, &mut marker);

        let mut last_byte = None;
        for frame in 0..5 {
            let word = (buf[frame * 2] * 8_388_608.0).round() as i32;
            let byte = (((word & 0x00FF_FFFF) as u32) >> 16) as u8;
            if let Some(last) = last_byte {
                assert_ne!(byte, last, "marker repeated at frame {frame}");
            }
            last_byte = Some(byte);
            // Both channels share the marker within a frame.
            let other = (buf[frame * 2 + 1] * 8_388_608.0).round() as i32;
            assert_eq!(word, other);
        }

        // Continuation across calls keeps alternating.
        let mut next = vec![0.0_f32; 2];
        fill_dop_silence(&mut next, 1, 2, &mut marker);
        let word = (next[0] * 8_388_608.0).round() as i32;
        let byte = (((word & 0x00FF_FFFF) as u32) >> 16) as u8;
        assert_ne!(Some(byte), last_byte);
    }
}
