//! Gapless playback and crossfade transitions.
//!
//! Owns the "next track" decoder slot and all crossfade state. The main
//! thread preloads the next track with [`GaplessManager::prepare_next_track`];
//! the render callback performs the equal-power mix and the lock-free
//! swap when the current track's end approaches.
//!
//! # Thread safety
//!
//! The manager lives inside the engine's slot mutex. Main-thread
//! methods are called with the mutex held (a blocking lock); render-
//! thread methods are called with the mutex try-acquired. Nothing here
//! locks internally.
//!
//! # Crossfade shape
//!
//! Equal-power: the outgoing stream fades with `cos(t·π/2)`, the
//! incoming with `sin(t·π/2)`, `t = progress / total`. The squared
//! gains sum to one at every sample, so program loudness holds steady
//! through the blend. When the outgoing decoder dries up mid-fade, only
//! the incoming stream is faded in for the remaining ramp.

use std::path::{Path, PathBuf};

use crate::{
    config::DsdPlaybackMode,
    decoder::{Decoder, DsdDecoder, DsdMode, PcmDecoder, StreamFormat},
    track::{self, SourceKind},
};

/// Crossfade scratch sizing: the widest callback any host is expected
/// to deliver.
const CROSSFADE_BUF_FRAMES: usize = 16_384;

/// A prepared-but-not-yet-playing track.
struct NextTrack {
    decoder: Decoder,
    format: StreamFormat,
    path: PathBuf,
}

/// Result of promoting the next slot into the current slot.
pub struct TransitionResult {
    /// Format of the newly-current stream.
    pub format: StreamFormat,
    /// Path of the newly-current file.
    pub path: PathBuf,
}

/// Preload, swap and crossfade state for track transitions.
pub struct GaplessManager {
    gapless_enabled: bool,
    crossfade_ms: u32,

    next: Option<NextTrack>,
    next_ready: bool,

    /// Latency of the render chain in frames (linear-phase EQ,
    /// convolution). The fade window shifts earlier by this amount so
    /// the blend lands aligned after the chain's delay.
    output_latency_frames: i64,

    crossfading: bool,
    crossfade_progress: i64,
    crossfade_total_frames: i64,
    crossfade_buf: Vec<f32>,
}

impl GaplessManager {
    /// Creates a manager with gapless on and crossfade off.
    #[must_use]
    pub fn new() -> Self {
        Self {
            gapless_enabled: true,
            crossfade_ms: 0,
            next: None,
            next_ready: false,
            output_latency_frames: 0,
            crossfading: false,
            crossfade_progress: 0,
            crossfade_total_frames: 0,
            crossfade_buf: Vec::new(),
        }
    }

    /// Reports the render chain's latency so crossfade timing stays
    /// sample-aligned through latency-bearing DSP. Called on `load` and
    /// whenever the chain's latency changes.
    pub fn set_output_latency(&mut self, frames: usize) {
        self.output_latency_frames = frames as i64;
    }

    /// Enables or disables gapless transitions.
    pub fn set_gapless_enabled(&mut self, enabled: bool) {
        self.gapless_enabled = enabled;
    }

    /// Sets the crossfade duration in milliseconds; 0 disables
    /// crossfading.
    pub fn set_crossfade_ms(&mut self, ms: u32) {
        self.crossfade_ms = ms;
        debug!("crossfade duration set to {ms} ms");
    }

    /// Current crossfade duration in milliseconds.
    #[must_use]
    pub fn crossfade_ms(&self) -> u32 {
        self.crossfade_ms
    }

    /// Whether a format-matched next track is armed for a seamless
    /// transition.
    #[must_use]
    pub fn is_next_ready(&self) -> bool {
        self.next_ready
    }

    /// Format of the prepared next track, if one is loaded.
    #[must_use]
    pub fn next_format(&self) -> Option<StreamFormat> {
        self.next.as_ref().map(|next| next.format)
    }

    /// Sizes the crossfade scratch for the output channel count.
    /// Called from `load()` on the main thread; the render callback
    /// never allocates.
    pub fn preallocate_crossfade_buffer(&mut self, channels: usize) {
        self.crossfade_buf.resize(CROSSFADE_BUF_FRAMES * channels, 0.0);
        self.crossfading = false;
        self.crossfade_progress = 0;
    }

    // ── main thread ──────────────────────────────────────────────────

    /// Opens the next track and arms the ready flag when its format
    /// matches the currently-playing stream exactly (sample rate,
    /// channels, DSD/PCM mode).
    ///
    /// A format mismatch keeps the decoder open but unflagged: `load()`
    /// reuses it through [`take_prepared`](Self::take_prepared) to
    /// avoid a double open on full-format transitions.
    #[expect(clippy::too_many_arguments)]
    pub fn prepare_next_track(
        &mut self,
        path: &Path,
        dsd_mode: DsdPlaybackMode,
        dsd_target_pcm_rate: u32,
        output_max_rate: f64,
        current_rate: f64,
        current_channels: usize,
        current_is_dsd: bool,
    ) {
        // Nothing to do when neither gapless nor crossfade can consume
        // the preload.
        if !self.gapless_enabled && self.crossfade_ms == 0 {
            return;
        }

        debug!("preparing next track: {}", path.display());

        self.next = None;
        self.next_ready = false;

        if let Err(e) = track::preflight(path) {
            debug!("next track failed pre-flight: {e}");
            return;
        }

        let decoder = match track::classify(path) {
            SourceKind::Dsd => {
                let mut opened = None;
                if dsd_mode == DsdPlaybackMode::Dop {
                    match DsdDecoder::open(path, DsdMode::Dop, dsd_target_pcm_rate) {
                        Ok(dsd) => {
                            let rate = dsd.format().sample_rate;
                            if output_max_rate > 0.0 && rate > output_max_rate {
                                debug!(
                                    "next track DoP rate {rate} Hz exceeds device max \
                                     {output_max_rate} Hz, using PCM conversion"
                                );
                            } else {
                                opened = Some(Decoder::Dsd(dsd));
                            }
                        }
                        Err(e) => debug!("next track DoP open failed: {e}"),
                    }
                }
                match opened {
                    Some(decoder) => decoder,
                    None => {
                        match DsdDecoder::open(path, DsdMode::PcmConversion, dsd_target_pcm_rate) {
                            Ok(dsd) => Decoder::Dsd(dsd),
                            Err(e) => {
                                debug!("failed to open next track: {e}");
                                return;
                            }
                        }
                    }
                }
            }
            SourceKind::Pcm => match PcmDecoder::open(path) {
                Ok(pcm) => Decoder::Pcm(pcm),
                Err(e) => {
                    debug!("failed to open next track: {e}");
                    return;
                }
            },
        };

        let format = decoder.format();
        let next_is_dsd = decoder.is_dsd();
        self.next = Some(NextTrack {
            decoder,
            format,
            path: path.to_path_buf(),
        });

        let format_match = (format.sample_rate - current_rate).abs() < 1.0
            && format.channels == current_channels
            && next_is_dsd == current_is_dsd;

        if !format_match {
            debug!(
                "next track format mismatch, will use normal transition \
                 (current: {current_rate} Hz {current_channels} ch dsd {current_is_dsd}; \
                 next: {} Hz {} ch dsd {next_is_dsd})",
                format.sample_rate, format.channels,
            );
            return;
        }

        self.next_ready = true;
        debug!("next track ready: {}", path.display());
    }

    /// Tears down the next slot.
    pub fn cancel_next_track(&mut self) {
        self.next = None;
        self.next_ready = false;
        debug!("next track cancelled");
    }

    /// Hands out the prepared decoder when its path matches, for
    /// `load()` to reuse instead of opening the file a second time.
    pub fn take_prepared(&mut self, path: &Path) -> Option<(Decoder, StreamFormat)> {
        if self.next.as_ref().is_some_and(|next| next.path == path) {
            self.next_ready = false;
            self.next
                .take()
                .map(|next| (next.decoder, next.format))
        } else {
            None
        }
    }

    /// Resets everything: next slot, ready flag, crossfade state.
    pub fn reset(&mut self) {
        self.next = None;
        self.next_ready = false;
        self.crossfading = false;
        self.crossfade_progress = 0;
    }

    // ── render thread (caller holds the slot mutex) ──────────────────

    /// Equal-power gain pair at `progress` of `total` frames.
    #[must_use]
    pub fn crossfade_gains(progress: i64, total: i64) -> (f32, f32) {
        let t = if total > 0 {
            (progress as f32 / total as f32).clamp(0.0, 1.0)
        } else {
            1.0
        };
        let angle = t * std::f32::consts::FRAC_PI_2;
        (angle.cos(), angle.sin())
    }

    /// Whether a crossfade is currently mixing.
    #[must_use]
    pub fn is_crossfading(&self) -> bool {
        self.crossfading
    }

    /// Whether the render callback should begin a crossfade now:
    /// crossfade configured, next slot armed, and the outgoing track is
    /// inside the final crossfade window.
    #[must_use]
    pub fn should_start_crossfade(&self, frames_rendered: i64, total_frames: i64, rate: f64) -> bool {
        if self.crossfading || self.crossfade_ms == 0 || !self.next_ready {
            return false;
        }
        let crossfade_frames = self.crossfade_frames(rate);
        let window_start = total_frames - crossfade_frames - self.output_latency_frames;
        total_frames > crossfade_frames && frames_rendered >= window_start.max(0)
    }

    /// Crossfade length in frames at the given rate.
    #[must_use]
    pub fn crossfade_frames(&self, rate: f64) -> i64 {
        (f64::from(self.crossfade_ms) * rate / 1000.0) as i64
    }

    /// Begins mixing. `frames_rendered` past the window start sets the
    /// starting progress so late starts stay sample-aligned; the window
    /// itself sits `output_latency` frames early (see
    /// [`set_output_latency`](Self::set_output_latency)).
    pub fn start_crossfade(&mut self, frames_rendered: i64, total_frames: i64, crossfade_frames: i64) {
        self.crossfading = true;
        let window_start = total_frames - crossfade_frames - self.output_latency_frames;
        self.crossfade_progress = frames_rendered - window_start.max(0);
        self.crossfade_total_frames = crossfade_frames;
    }

    /// Bookkeeping after producing `frames` mixed frames.
    pub fn advance_crossfade(&mut self, frames: i64) {
        self.crossfade_progress += frames;
    }

    /// Ends the crossfade and clears its state.
    pub fn end_crossfade(&mut self) {
        self.crossfading = false;
        self.crossfade_progress = 0;
    }

    /// Frames of fade consumed so far. At swap time this is the
    /// incoming track's position, because the incoming stream started
    /// at the beginning of the fade.
    #[must_use]
    pub fn crossfade_progress(&self) -> i64 {
        self.crossfade_progress
    }

    /// Whether the fade has consumed its full ramp.
    #[must_use]
    pub fn crossfade_complete(&self) -> bool {
        self.crossfading && self.crossfade_progress >= self.crossfade_total_frames
    }

    /// Mixes the incoming stream into `buf` during a crossfade.
    ///
    /// `frames_read` is what the outgoing decoder produced this cycle.
    /// When it is zero the outgoing track ended mid-fade: the incoming
    /// stream is read directly into `buf` and faded in alone. Returns
    /// the number of frames now in `buf` and advances the fade.
    pub fn mix_incoming(
        &mut self,
        buf: &mut [f32],
        frames_read: usize,
        max_frames: usize,
        channels: usize,
    ) -> usize {
        debug_assert!(self.crossfading);
        let total = self.crossfade_total_frames;
        let progress = self.crossfade_progress;

        let Some(next) = self.next.as_mut() else {
            return frames_read;
        };

        let produced = if frames_read == 0 {
            // Outgoing dried up: fade the incoming stream in alone.
            let incoming = next.decoder.read(buf, max_frames);
            for frame in 0..incoming {
                let (_, gain_in) = Self::crossfade_gains(progress + frame as i64, total);
                for channel in 0..channels {
                    buf[frame * channels + channel] *= gain_in;
                }
            }
            incoming
        } else {
            // Both streams active: sum with the equal-power gains. Cap
            // the incoming read to the pre-sized scratch.
            let capacity = self.crossfade_buf.len() / channels.max(1);
            let wanted = frames_read.min(capacity);
            let incoming = if wanted > 0 {
                next.decoder.read(&mut self.crossfade_buf, wanted)
            } else {
                0
            };

            for frame in 0..frames_read {
                let (gain_out, gain_in) = Self::crossfade_gains(progress + frame as i64, total);
                for channel in 0..channels {
                    let index = frame * channels + channel;
                    let incoming_sample = if frame < incoming {
                        self.crossfade_buf[index]
                    } else {
                        0.0
                    };
                    buf[index] = buf[index] * gain_out + incoming_sample * gain_in;
                }
            }
            frames_read
        };

        self.crossfade_progress += produced as i64;
        produced
    }

    /// Promotes the next slot into `current`.
    ///
    /// Transfers the old decoder's DoP marker state into the
    /// newly-current DSD decoder so the downstream DAC sees
    /// uninterrupted marker alternation, then clears the slot and the
    /// crossfade state. The old decoder is dropped here, closing it.
    pub fn swap_to_current(&mut self, current: &mut Option<Decoder>) -> Option<TransitionResult> {
        let next = self.next.take()?;

        let old_marker = current
            .as_ref()
            .filter(|decoder| decoder.is_dop_mode())
            .map(Decoder::dop_marker_state);

        let mut incoming = next.decoder;
        if let (Some(marker), true) = (old_marker, incoming.is_dop_mode()) {
            incoming.set_dop_marker_state(marker);
        }

        *current = Some(incoming);

        self.next_ready = false;
        self.crossfading = false;
        self.crossfade_progress = 0;

        Some(TransitionResult {
            format: next.format,
            path: next.path,
        })
    }
}

impl Default for GaplessManager {
    fn default() -> Self {
        Self::new()
    }
}
