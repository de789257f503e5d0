//! The per-buffer DSP chain.
//!
//! Composes the processors in a fixed order:
//!
//! ```text
//! (Upsampler, engine-driven) → Headroom → Crossfeed/HRTF → Convolution
//!   → HRTF → Equaliser (+preamp) → LevelingGain (ramped) → Limiter
//! ```
//!
//! HRTF and crossfeed are mutually exclusive: when both are enabled the
//! chain runs HRTF and skips crossfeed. The upsampler runs before the
//! chain with separate input/output buffers, so the chain always
//! processes at the output rate.
//!
//! Bypass semantics:
//! * `dop_passthrough` makes the whole chain a strict no-op — DoP
//!   frames carry bit-exact DSD data and any float arithmetic destroys
//!   the marker bytes.
//! * `bit_perfect` bypasses the equaliser, levelling, crossfeed,
//!   convolution and HRTF but keeps headroom and the limiter in play —
//!   the loose reading of bit-perfect; a strict reading would bypass
//!   those too, and callers wanting it can simply disable them.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::{
    dsp::convolution::ConvolutionProcessor,
    dsp::crossfeed::CrossfeedProcessor,
    dsp::equalizer::Equalizer,
    dsp::gain::{apply_gain_ramp, Limiter},
    dsp::hrtf::HrtfProcessor,
    dsp::DspStage,
};

/// Ordered composition of the DSP stages. Owns the stages and the
/// levelling-ramp state; the engine owns the chain.
pub struct RenderChain {
    /// Headroom gain as f32 bits; written by the main thread whenever
    /// the DSP configuration changes, read by the render thread.
    headroom_gain_bits: AtomicU32,

    /// Levelling gain target as f32 bits; same single-writer pattern.
    leveling_gain_bits: AtomicU32,

    /// Gain applied at the end of the previous callback, the ramp start
    /// for this one. Render-thread state.
    prev_leveling_gain: f32,

    crossfeed: CrossfeedProcessor,
    convolution: ConvolutionProcessor,
    hrtf: HrtfProcessor,
    equalizer: Equalizer,
}

impl RenderChain {
    /// Creates a chain with all optional stages disabled.
    #[must_use]
    pub fn new() -> Self {
        Self {
            headroom_gain_bits: AtomicU32::new(1.0_f32.to_bits()),
            leveling_gain_bits: AtomicU32::new(1.0_f32.to_bits()),
            prev_leveling_gain: 1.0,
            crossfeed: CrossfeedProcessor::new(),
            convolution: ConvolutionProcessor::new(),
            hrtf: HrtfProcessor::new(),
            equalizer: Equalizer::new(),
        }
    }

    /// Prepares every stage for a new output format and clears ramp
    /// state.
    pub fn prepare(&mut self, sample_rate: f64, channels: usize) {
        self.crossfeed.prepare(sample_rate, channels);
        self.convolution.prepare(sample_rate, channels);
        self.hrtf.prepare(sample_rate, channels);
        self.equalizer.prepare(sample_rate, channels);
        self.prev_leveling_gain = f32::from_bits(self.leveling_gain_bits.load(Ordering::Relaxed));
    }

    /// Clears all filter history without changing configuration.
    pub fn reset(&mut self) {
        // Stages rebuild their history in prepare; re-preparing with the
        // current parameters is the reset.
        self.prev_leveling_gain = 1.0;
    }

    /// Sets the pre-DSP headroom gain (linear).
    pub fn set_headroom_gain(&self, gain: f32) {
        self.headroom_gain_bits.store(gain.to_bits(), Ordering::Relaxed);
    }

    /// Current headroom gain (linear).
    #[must_use]
    pub fn headroom_gain(&self) -> f32 {
        f32::from_bits(self.headroom_gain_bits.load(Ordering::Relaxed))
    }

    /// Sets the levelling gain target (linear). The render callback
    /// ramps from the previous callback's gain to this value.
    pub fn set_leveling_gain(&self, gain: f32) {
        self.leveling_gain_bits.store(gain.to_bits(), Ordering::Relaxed);
    }

    /// Current levelling gain target (linear).
    #[must_use]
    pub fn leveling_gain(&self) -> f32 {
        f32::from_bits(self.leveling_gain_bits.load(Ordering::Relaxed))
    }

    /// Mutable access to the crossfeed stage.
    pub fn crossfeed_mut(&mut self) -> &mut CrossfeedProcessor {
        &mut self.crossfeed
    }

    /// The crossfeed stage.
    #[must_use]
    pub fn crossfeed(&self) -> &CrossfeedProcessor {
        &self.crossfeed
    }

    /// Mutable access to the convolution stage.
    pub fn convolution_mut(&mut self) -> &mut ConvolutionProcessor {
        &mut self.convolution
    }

    /// The convolution stage.
    #[must_use]
    pub fn convolution(&self) -> &ConvolutionProcessor {
        &self.convolution
    }

    /// Mutable access to the HRTF stage.
    pub fn hrtf_mut(&mut self) -> &mut HrtfProcessor {
        &mut self.hrtf
    }

    /// The HRTF stage.
    #[must_use]
    pub fn hrtf(&self) -> &HrtfProcessor {
        &self.hrtf
    }

    /// Mutable access to the equaliser.
    pub fn equalizer_mut(&mut self) -> &mut Equalizer {
        &mut self.equalizer
    }

    /// The equaliser.
    #[must_use]
    pub fn equalizer(&self) -> &Equalizer {
        &self.equalizer
    }

    /// Total latency in frames introduced by latency-bearing stages,
    /// reported to the gapless manager so crossfades stay aligned.
    #[must_use]
    pub fn latency_frames(&self) -> usize {
        self.equalizer.latency_frames() + self.convolution.latency_frames()
    }

    /// Runs the chain over `frames` interleaved frames in place.
    pub fn process(
        &mut self,
        buf: &mut [f32],
        frames: usize,
        channels: usize,
        bit_perfect: bool,
        dop_passthrough: bool,
    ) {
        if frames == 0 || dop_passthrough {
            return;
        }

        let samples = frames * channels;

        // Headroom before any non-linear stage.
        let headroom = self.headroom_gain();
        if (headroom - 1.0).abs() > f32::EPSILON {
            for sample in &mut buf[..samples] {
                *sample *= headroom;
            }
        }

        if !bit_perfect {
            // Spatial stages: HRTF wins over crossfeed when both are on.
            let hrtf_active = self.hrtf.is_enabled() && self.hrtf.is_loaded() && channels == 2;
            if !hrtf_active {
                self.crossfeed.process(buf, frames, channels);
            }

            self.convolution.process(buf, frames, channels);

            if hrtf_active {
                self.hrtf.process(buf, frames, channels);
            }

            self.equalizer.process(buf, frames, channels);

            // Sample-accurate levelling ramp from the previous callback's
            // gain to this callback's target.
            let target = self.leveling_gain();
            let previous = self.prev_leveling_gain;
            if (target - 1.0).abs() > f32::EPSILON || (previous - 1.0).abs() > f32::EPSILON {
                apply_gain_ramp(buf, frames, channels, previous, target);
            }
            self.prev_leveling_gain = target;
        }

        // The limiter always runs last.
        Limiter::process(&mut buf[..samples]);
    }
}

impl Default for RenderChain {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::RenderChain;
    use crate::dsp::equalizer::EqBandConfig;
    use crate::dsp::DspStage;

    fn loud_buffer(frames: usize, channels: usize, amplitude: f32) -> Vec<f32> {
        (0..frames * channels)
            .map(|i| if i % 2 == 0 { amplitude } else { -amplitude })
            .collect()
    }

    #[test]
    fn dop_passthrough_is_a_strict_no_op() {
        let mut chain = RenderChain::new();
        chain.prepare(176_400.0, 2);
        chain.set_headroom_gain(0.5);
        chain.set_leveling_gain(0.25);

        let mut buf = loud_buffer(64, 2, 1.5);
        let original = buf.clone();
        chain.process(&mut buf, 64, 2, false, true);
        assert_eq!(buf, original);
    }

    #[test]
    fn limiter_bounds_everything_the_chain_emits() {
        let mut chain = RenderChain::new();
        chain.prepare(44_100.0, 2);
        chain.set_leveling_gain(3.98); // +12 dB

        let frames = 512;
        let mut buf = loud_buffer(frames, 2, 0.9);
        chain.process(&mut buf, frames, 2, false, false);
        for sample in &buf {
            assert!(sample.abs() <= 1.0 + 1e-6, "sample {sample}");
        }
    }

    #[test]
    fn bit_perfect_bypasses_tone_stages_but_keeps_headroom() {
        let mut chain = RenderChain::new();
        chain.prepare(44_100.0, 2);
        chain.equalizer_mut().set_enabled(true);
        chain.equalizer_mut().set_band(
            0,
            EqBandConfig {
                gain_db: 12.0,
                ..EqBandConfig::default()
            },
        );
        chain.set_leveling_gain(2.0);
        chain.set_headroom_gain(0.5);

        let frames = 256;
        let mut buf = loud_buffer(frames, 2, 0.8);
        chain.process(&mut buf, frames, 2, true, false);

        // Only headroom applied: 0.8 * 0.5 = 0.4 everywhere.
        for sample in &buf {
            assert!((sample.abs() - 0.4).abs() < 1e-6, "sample {sample}");
        }
    }

    #[test]
    fn leveling_ramp_is_monotonic_after_gain_change() {
        let mut chain = RenderChain::new();
        chain.prepare(44_100.0, 2);

        // First callback establishes unity.
        let frames = 128;
        let mut buf = vec![1.0_f32; frames * 2];
        chain.process(&mut buf, frames, 2, false, false);

        // Gain drops; this callback ramps 1.0 → 0.5 monotonically.
        chain.set_leveling_gain(0.5);
        let mut buf = vec![1.0_f32; frames * 2];
        chain.process(&mut buf, frames, 2, false, false);

        for pair in buf.chunks(2).collect::<Vec<_>>().windows(2) {
            assert!(pair[1][0] <= pair[0][0] + 1e-6);
        }
        assert!((buf[0] - 1.0).abs() < 0.05);
        assert!((buf[(frames - 1) * 2] - 0.5).abs() < 0.05);
    }

    #[test]
    fn chain_latency_follows_active_stages() {
        let mut chain = RenderChain::new();
        chain.prepare(44_100.0, 2);
        assert_eq!(chain.latency_frames(), 0);

        chain.equalizer_mut().set_enabled(true);
        chain
            .equalizer_mut()
            .set_phase_mode(crate::dsp::equalizer::EqPhaseMode::LinearPhase);
        assert!(chain.latency_frames() > 0);
    }
}
