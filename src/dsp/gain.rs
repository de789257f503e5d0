//! Scalar gain stages and the soft peak limiter.
//!
//! Three small processors share this module because they share a job:
//! keeping levels sane around the non-linear DSP stages.
//!
//! * [`HeadroomGain`] attenuates *before* non-linear DSP so boosts from
//!   EQ or convolution have room to breathe.
//! * [`LevelingGain`] computes a per-track gain from ReplayGain tags or
//!   cached EBU R128 loudness and applies it at the end of the chain
//!   with a sample-accurate ramp, so track changes and settings toggles
//!   never click.
//! * [`Limiter`] is the safety net: a tanh soft knee above 0.95 that
//!   guarantees the output never leaves [-1, 1] regardless of upstream
//!   gain.

use serde::Deserialize;

use crate::{
    config::{LevelingConfig, LevelingMode},
    track::TrackMeta,
    util::{db_to_ratio, ratio_to_db},
};

/// Headroom management mode.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum HeadroomMode {
    /// Unity gain.
    #[default]
    Off,
    /// -3 dB whenever volume levelling, crossfeed or convolution is
    /// active.
    Auto,
    /// User-specified attenuation.
    Manual,
}

/// Pre-DSP headroom attenuation.
///
/// The gain is recomputed by the engine whenever the DSP configuration
/// changes; `compute` is pure so the policy is testable on its own.
#[derive(Clone, Copy, Debug)]
pub struct HeadroomGain {
    mode: HeadroomMode,
    manual_db: f64,
}

impl HeadroomGain {
    /// Attenuation applied in Auto mode when any qualifying DSP is active.
    const AUTO_DB: f64 = -3.0;

    /// Creates a headroom stage in Off mode.
    #[must_use]
    pub fn new() -> Self {
        Self {
            mode: HeadroomMode::Off,
            manual_db: 0.0,
        }
    }

    /// Sets the mode.
    pub fn set_mode(&mut self, mode: HeadroomMode) {
        self.mode = mode;
    }

    /// Current mode.
    #[must_use]
    pub fn mode(&self) -> HeadroomMode {
        self.mode
    }

    /// Sets the manual attenuation in dB; clamped to [-12, 0] at
    /// compute time.
    pub fn set_manual_db(&mut self, db: f64) {
        self.manual_db = db;
    }

    /// Computes the linear headroom gain for the current mode.
    ///
    /// `any_dsp_active` covers volume levelling, crossfeed, and
    /// convolution with a loaded IR.
    #[must_use]
    pub fn compute(&self, any_dsp_active: bool) -> f32 {
        let db = match self.mode {
            HeadroomMode::Off => 0.0,
            HeadroomMode::Auto => {
                if any_dsp_active {
                    Self::AUTO_DB
                } else {
                    0.0
                }
            }
            HeadroomMode::Manual => self.manual_db,
        };
        db_to_ratio(db.clamp(-12.0, 0.0) as f32)
    }
}

impl Default for HeadroomGain {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-track loudness-levelling gain.
///
/// ReplayGain carries a gain recommendation relative to a -18 LUFS
/// reference; R128 carries a measured loudness. Either way the result
/// is clamped to ±12 dB, and ReplayGain is additionally peak-limited so
/// the boosted signal cannot exceed full scale.
#[derive(Clone, Copy, Debug)]
pub struct LevelingGain {
    enabled: bool,
    mode: LevelingMode,
    target_lufs: f64,
}

impl LevelingGain {
    /// ReplayGain reference loudness.
    const REPLAY_GAIN_REFERENCE_LUFS: f64 = -18.0;

    /// Creates a disabled levelling stage targeting -14 LUFS.
    #[must_use]
    pub fn new() -> Self {
        Self {
            enabled: false,
            mode: LevelingMode::Track,
            target_lufs: -14.0,
        }
    }

    /// Applies a settings block.
    pub fn apply_config(&mut self, config: &LevelingConfig) {
        self.enabled = config.enabled;
        self.mode = config.mode;
        self.target_lufs = config.target_lufs;
    }

    /// Whether levelling is enabled.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Enables or disables levelling.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Sets track/album mode.
    pub fn set_mode(&mut self, mode: LevelingMode) {
        self.mode = mode;
    }

    /// Sets the target loudness in LUFS.
    pub fn set_target_lufs(&mut self, lufs: f64) {
        self.target_lufs = lufs;
    }

    /// Current target loudness in LUFS.
    #[must_use]
    pub fn target_lufs(&self) -> f64 {
        self.target_lufs
    }

    /// Computes the linear gain for a track.
    ///
    /// Returns 1.0 when levelling is disabled or the track carries no
    /// loudness information.
    #[must_use]
    pub fn compute(&self, track: &TrackMeta) -> f32 {
        if !self.enabled {
            return 1.0;
        }

        let gain_db = if track.has_replay_gain {
            // ReplayGain is already a gain recommendation against the
            // -18 LUFS reference; shift it to our target.
            let rg_gain = if self.mode == LevelingMode::Album && track.replay_gain_album != 0.0 {
                track.replay_gain_album
            } else {
                track.replay_gain_track
            };
            let mut gain_db = rg_gain + (self.target_lufs - Self::REPLAY_GAIN_REFERENCE_LUFS);

            // Peak limiting: never push the recorded peak past full scale.
            let peak = if self.mode == LevelingMode::Album
                && track.replay_gain_album_peak != 1.0
                && track.replay_gain_album_peak > 0.0
            {
                track.replay_gain_album_peak
            } else {
                track.replay_gain_track_peak
            };
            let linear = f64::powf(10.0, gain_db / 20.0);
            if peak > 0.0 && peak * linear > 1.0 {
                gain_db = 20.0 * (1.0 / peak).log10();
            }
            gain_db
        } else if track.has_r128 && track.r128_loudness != 0.0 {
            self.target_lufs - track.r128_loudness
        } else {
            return 1.0;
        };

        db_to_ratio(gain_db.clamp(-12.0, 12.0) as f32)
    }

    /// The computed gain in dB, for signal-path display.
    #[must_use]
    pub fn gain_db(&self, track: &TrackMeta) -> f32 {
        let linear = self.compute(track);
        if linear <= 0.0 || (linear - 1.0).abs() < f32::EPSILON {
            0.0
        } else {
            ratio_to_db(linear)
        }
    }
}

impl Default for LevelingGain {
    fn default() -> Self {
        Self::new()
    }
}

/// Soft peak limiter.
///
/// For each sample `s` with `|s| > 0.95`, substitutes
/// `sign(s) · (0.95 + 0.05 · tanh((|s| - 0.95) / 0.05))`. The tanh
/// saturates at 1, so output magnitude never exceeds 1.0.
#[derive(Clone, Copy, Debug, Default)]
pub struct Limiter;

impl Limiter {
    /// Knee threshold.
    const THRESHOLD: f32 = 0.95;

    /// Knee range above the threshold.
    const KNEE: f32 = 0.05;

    /// Limits a buffer in place.
    pub fn process(buf: &mut [f32]) {
        for sample in buf {
            let s = *sample;
            if s > Self::THRESHOLD {
                *sample = Self::THRESHOLD + Self::KNEE * ((s - Self::THRESHOLD) / Self::KNEE).tanh();
            } else if s < -Self::THRESHOLD {
                *sample =
                    -Self::THRESHOLD - Self::KNEE * ((-s - Self::THRESHOLD) / Self::KNEE).tanh();
            }
        }
    }
}

/// Applies a linear gain ramp from `from` to `to` across `frames`
/// interleaved frames. Used for the per-callback levelling ramp and the
/// device volume ramp; sample-accurate so gain changes never click.
pub fn apply_gain_ramp(buf: &mut [f32], frames: usize, channels: usize, from: f32, to: f32) {
    if frames == 0 {
        return;
    }
    if (from - to).abs() < f32::EPSILON {
        if (to - 1.0).abs() > f32::EPSILON {
            for sample in &mut buf[..frames * channels] {
                *sample *= to;
            }
        }
        return;
    }

    for frame in 0..frames {
        let t = if frames > 1 {
            frame as f32 / (frames - 1) as f32
        } else {
            1.0
        };
        let gain = from + (to - from) * t;
        for channel in 0..channels {
            buf[frame * channels + channel] *= gain;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{apply_gain_ramp, HeadroomGain, HeadroomMode, LevelingGain, Limiter};
    use crate::config::{LevelingConfig, LevelingMode};
    use crate::track::TrackMeta;

    fn r128_track(loudness: f64) -> TrackMeta {
        TrackMeta {
            has_r128: true,
            r128_loudness: loudness,
            r128_peak: 1.0,
            ..TrackMeta::new("/tmp/track.flac")
        }
    }

    #[test]
    fn headroom_off_is_unity() {
        let headroom = HeadroomGain::new();
        assert!((headroom.compute(true) - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn headroom_auto_engages_with_active_dsp() {
        let mut headroom = HeadroomGain::new();
        headroom.set_mode(HeadroomMode::Auto);
        assert!((headroom.compute(false) - 1.0).abs() < f32::EPSILON);
        let attenuated = headroom.compute(true);
        let expected = 10.0_f32.powf(-3.0 / 20.0);
        assert!((attenuated - expected).abs() < 1e-6);
    }

    #[test]
    fn headroom_manual_is_clamped() {
        let mut headroom = HeadroomGain::new();
        headroom.set_mode(HeadroomMode::Manual);
        headroom.set_manual_db(-40.0);
        let gain = headroom.compute(false);
        let floor = 10.0_f32.powf(-12.0 / 20.0);
        assert!((gain - floor).abs() < 1e-6);

        // Positive manual values clamp to unity: headroom only attenuates.
        headroom.set_manual_db(6.0);
        assert!((headroom.compute(false) - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn r128_gain_matches_target_difference() {
        let mut leveling = LevelingGain::new();
        leveling.apply_config(&LevelingConfig {
            enabled: true,
            mode: LevelingMode::Track,
            target_lufs: -14.0,
        });

        // -20 LUFS track to -14 target: +6 dB.
        let gain = leveling.compute(&r128_track(-20.0));
        assert!((gain - 1.995).abs() < 0.01, "gain {gain}");

        // -10 LUFS track to -14 target: -4 dB.
        let gain = leveling.compute(&r128_track(-10.0));
        assert!((gain - 0.631).abs() < 0.01, "gain {gain}");
    }

    #[test]
    fn gain_is_clamped_to_twelve_db() {
        let mut leveling = LevelingGain::new();
        leveling.apply_config(&LevelingConfig {
            enabled: true,
            mode: LevelingMode::Track,
            target_lufs: -14.0,
        });

        // Absurdly quiet track would want +30 dB; clamp to +12.
        let gain = leveling.compute(&r128_track(-44.0));
        let max = 10.0_f32.powf(12.0 / 20.0);
        assert!((gain - max).abs() < 1e-4);

        // Absurdly loud track clamps to -12.
        let gain = leveling.compute(&r128_track(10.0));
        let min = 10.0_f32.powf(-12.0 / 20.0);
        assert!((gain - min).abs() < 1e-4);
    }

    #[test]
    fn replay_gain_is_peak_limited() {
        let mut leveling = LevelingGain::new();
        leveling.apply_config(&LevelingConfig {
            enabled: true,
            mode: LevelingMode::Track,
            target_lufs: -14.0,
        });

        let track = TrackMeta {
            has_replay_gain: true,
            replay_gain_track: 6.0, // wants +10 dB total
            replay_gain_track_peak: 0.9,
            ..TrackMeta::new("/tmp/loud.flac")
        };
        let gain = leveling.compute(&track);
        // Limited so 0.9 * gain <= 1.0.
        assert!(0.9 * gain <= 1.0 + 1e-6, "gain {gain}");
        assert!((0.9 * gain - 1.0).abs() < 1e-3);
    }

    #[test]
    fn album_mode_prefers_album_tags() {
        let mut leveling = LevelingGain::new();
        leveling.apply_config(&LevelingConfig {
            enabled: true,
            mode: LevelingMode::Album,
            target_lufs: -18.0,
        });

        let track = TrackMeta {
            has_replay_gain: true,
            replay_gain_track: -6.0,
            replay_gain_album: -3.0,
            replay_gain_track_peak: 0.5,
            replay_gain_album_peak: 0.5,
            ..TrackMeta::new("/tmp/album.flac")
        };
        // Target matches the RG reference, so gain = album value = -3 dB.
        let gain = leveling.compute(&track);
        let expected = 10.0_f32.powf(-3.0 / 20.0);
        assert!((gain - expected).abs() < 1e-4);
    }

    #[test]
    fn tracks_without_loudness_data_pass_at_unity() {
        let mut leveling = LevelingGain::new();
        leveling.set_enabled(true);
        let gain = leveling.compute(&TrackMeta::new("/tmp/untagged.mp3"));
        assert!((gain - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn limiter_bounds_output() {
        let mut buf = vec![0.5_f32, -0.5, 1.5, -1.5, 10.0, -10.0, 0.96, -0.96];
        Limiter::process(&mut buf);
        for sample in &buf {
            assert!(sample.abs() <= 1.0, "sample {sample} escaped the limiter");
        }
        // Samples under the knee are untouched.
        assert!((buf[0] - 0.5).abs() < f32::EPSILON);
        assert!((buf[1] + 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn limiter_is_monotonic_through_the_knee() {
        let inputs: Vec<f32> = (0..100).map(|i| 0.9 + i as f32 * 0.01).collect();
        let mut outputs = inputs.clone();
        Limiter::process(&mut outputs);
        for pair in outputs.windows(2) {
            assert!(pair[1] >= pair[0] - 1e-6);
        }
    }

    #[test]
    fn gain_ramp_is_linear_and_monotonic() {
        let frames = 64;
        let mut buf = vec![1.0_f32; frames * 2];
        apply_gain_ramp(&mut buf, frames, 2, 0.0, 1.0);

        assert!((buf[0] - 0.0).abs() < 1e-6);
        assert!((buf[(frames - 1) * 2] - 1.0).abs() < 1e-6);
        for frame in 1..frames {
            assert!(buf[frame * 2] >= buf[(frame - 1) * 2]);
        }
        // Both channels get the same gain per frame.
        for frame in 0..frames {
            assert!((buf[frame * 2] - buf[frame * 2 + 1]).abs() < 1e-6);
        }
    }

    #[test]
    fn constant_unity_ramp_is_a_no_op() {
        let mut buf = vec![0.7_f32; 32];
        let original = buf.clone();
        apply_gain_ramp(&mut buf, 16, 2, 1.0, 1.0);
        assert_eq!(buf, original);
    }
}
