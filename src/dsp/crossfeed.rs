//! Headphone crossfeed.
//!
//! Blends a low-passed copy of the opposite channel into each ear,
//! approximating the acoustic crosstalk of loudspeaker listening. The
//! opposite-channel path is a single-pole low-pass at roughly 700 Hz,
//! attenuated by the selected level preset. Feedback-free: each output
//! depends only on the current inputs and the low-pass state.
//!
//! Stereo only; the render chain skips this stage for other channel
//! counts and whenever HRTF rendering is active.

use serde::Deserialize;

use crate::{dsp::DspStage, util::db_to_ratio};

/// Low-pass corner frequency of the crossfeed path, in Hz.
const CROSSFEED_CUTOFF_HZ: f64 = 700.0;

/// Crossfeed intensity presets.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum CrossfeedLevel {
    /// -6 dB opposite-channel mix.
    #[default]
    Light,
    /// -4.5 dB opposite-channel mix.
    Medium,
    /// -3 dB opposite-channel mix.
    Strong,
}

impl CrossfeedLevel {
    /// Mix attenuation in dB for the preset.
    #[must_use]
    pub fn attenuation_db(self) -> f32 {
        match self {
            Self::Light => -6.0,
            Self::Medium => -4.5,
            Self::Strong => -3.0,
        }
    }

    /// Maps the persisted numeric level (0/1/2) onto a preset.
    #[must_use]
    pub fn from_index(index: u8) -> Self {
        match index {
            1 => Self::Medium,
            2 => Self::Strong,
            _ => Self::Light,
        }
    }

    /// Display label for signal-path reporting.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Light => "Light",
            Self::Medium => "Medium",
            Self::Strong => "Strong",
        }
    }
}

/// Crossfeed stage state.
pub struct CrossfeedProcessor {
    enabled: bool,
    level: CrossfeedLevel,
    /// Smoothing coefficient of the single-pole low-pass.
    alpha: f32,
    /// Mix gain derived from the level preset.
    mix_gain: f32,
    /// Low-pass state, one per ear.
    lp_left: f32,
    lp_right: f32,
}

impl CrossfeedProcessor {
    /// Creates a disabled crossfeed at the Light preset.
    #[must_use]
    pub fn new() -> Self {
        let mut processor = Self {
            enabled: false,
            level: CrossfeedLevel::Light,
            alpha: 0.0,
            mix_gain: db_to_ratio(CrossfeedLevel::Light.attenuation_db()),
            lp_left: 0.0,
            lp_right: 0.0,
        };
        processor.configure(44_100.0);
        processor
    }

    /// Selects the intensity preset.
    pub fn set_level(&mut self, level: CrossfeedLevel) {
        self.level = level;
        self.mix_gain = db_to_ratio(level.attenuation_db());
    }

    /// Current intensity preset.
    #[must_use]
    pub fn level(&self) -> CrossfeedLevel {
        self.level
    }

    fn configure(&mut self, sample_rate: f64) {
        // One-pole coefficient for the ~700 Hz corner.
        let rc = 1.0 / (2.0 * std::f64::consts::PI * CROSSFEED_CUTOFF_HZ);
        let dt = 1.0 / sample_rate.max(1.0);
        self.alpha = (dt / (rc + dt)) as f32;
        self.lp_left = 0.0;
        self.lp_right = 0.0;
    }
}

impl Default for CrossfeedProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl DspStage for CrossfeedProcessor {
    fn prepare(&mut self, sample_rate: f64, _channels: usize) {
        self.configure(sample_rate);
    }

    fn process(&mut self, buf: &mut [f32], frames: usize, channels: usize) {
        if !self.enabled || channels != 2 {
            return;
        }

        let alpha = self.alpha;
        let gain = self.mix_gain;

        for frame in 0..frames {
            let left = buf[frame * 2];
            let right = buf[frame * 2 + 1];

            // Track the opposite channel through the low-pass.
            self.lp_left += alpha * (left - self.lp_left);
            self.lp_right += alpha * (right - self.lp_right);

            buf[frame * 2] = left + self.lp_right * gain;
            buf[frame * 2 + 1] = right + self.lp_left * gain;
        }
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }
}

#[cfg(test)]
mod tests {
    use super::{CrossfeedLevel, CrossfeedProcessor};
    use crate::dsp::DspStage;

    #[test]
    fn level_presets_map_to_documented_attenuation() {
        assert!((CrossfeedLevel::Light.attenuation_db() + 6.0).abs() < f32::EPSILON);
        assert!((CrossfeedLevel::Medium.attenuation_db() + 4.5).abs() < f32::EPSILON);
        assert!((CrossfeedLevel::Strong.attenuation_db() + 3.0).abs() < f32::EPSILON);
    }

    #[test]
    fn disabled_is_transparent() {
        let mut crossfeed = CrossfeedProcessor::new();
        crossfeed.prepare(44_100.0, 2);
        let mut buf = vec![0.5_f32, -0.5, 0.25, -0.25];
        let original = buf.clone();
        crossfeed.process(&mut buf, 2, 2);
        assert_eq!(buf, original);
    }

    #[test]
    fn left_only_signal_bleeds_into_right() {
        let mut crossfeed = CrossfeedProcessor::new();
        crossfeed.set_enabled(true);
        crossfeed.set_level(CrossfeedLevel::Strong);
        crossfeed.prepare(44_100.0, 2);

        // Left-only DC: after the low-pass settles, the right channel
        // carries the attenuated copy.
        let frames = 4_096;
        let mut buf = vec![0.0_f32; frames * 2];
        for frame in 0..frames {
            buf[frame * 2] = 0.8;
        }
        crossfeed.process(&mut buf, frames, 2);

        let right_tail = buf[(frames - 1) * 2 + 1];
        let expected = 0.8 * 10.0_f32.powf(-3.0 / 20.0);
        assert!(
            (right_tail - expected).abs() < 0.02,
            "bleed {right_tail} vs {expected}",
        );
        // Left keeps its direct signal (plus nothing from the silent right).
        assert!((buf[(frames - 1) * 2] - 0.8).abs() < 0.02);
    }

    #[test]
    fn non_stereo_buffers_are_untouched() {
        let mut crossfeed = CrossfeedProcessor::new();
        crossfeed.set_enabled(true);
        crossfeed.prepare(44_100.0, 6);
        let mut buf = vec![0.5_f32; 6 * 16];
        let original = buf.clone();
        crossfeed.process(&mut buf, 16, 6);
        assert_eq!(buf, original);
    }

    #[test]
    fn prepare_clears_filter_state() {
        let mut crossfeed = CrossfeedProcessor::new();
        crossfeed.set_enabled(true);
        crossfeed.prepare(44_100.0, 2);

        let mut buf = vec![1.0_f32; 2 * 512];
        crossfeed.process(&mut buf, 512, 2);

        crossfeed.prepare(48_000.0, 2);
        // First frame after prepare sees no residue from the old state.
        let mut quiet = vec![0.0_f32; 2];
        crossfeed.process(&mut quiet, 1, 2);
        assert_eq!(quiet, vec![0.0, 0.0]);
    }
}
