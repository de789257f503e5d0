//! Sample-rate conversion ahead of the DSP chain.
//!
//! Wraps a high-quality windowed-sinc rational resampler (rubato's
//! `SincFixedIn`). The target rate always stays in the source's sample
//! family (multiples of 44.1 kHz vs 48 kHz) and never downsamples for
//! external DACs; built-in devices clamp to the highest same-family
//! rate they support, because their hardware rate is usually fixed.
//!
//! Quality presets map onto sinc length / oversampling / cutoff
//! recipes of increasing stopband attenuation. All the resampler's
//! kernels are linear-phase FIRs; the filter presets vary window and
//! cutoff, with the minimum-phase preset selecting the shortest kernel
//! to minimise pre-ringing.
//!
//! The engine drives the upsampler with separate input/output buffers
//! through [`Upsampler::process_upsampling`]; the [`DspStage`]
//! `process` is deliberately a no-op, the trait is implemented for the
//! enable/prepare plumbing only.
//!
//! Failure policy: when the resampler cannot be constructed (invalid
//! ratio), the stage degrades silently to pass-through and logs once.

use std::collections::VecDeque;

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use serde::Deserialize;

use crate::dsp::DspStage;

/// Source frames fed to the resampler per processing chunk.
const CHUNK_FRAMES: usize = 1024;

/// Target-rate selection strategy.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum UpsamplingMode {
    /// No upsampling (pass-through).
    #[default]
    None,
    /// Upsample to the DAC's maximum supported rate.
    MaxRate,
    /// 2× the source rate (44.1 → 88.2, 48 → 96).
    Double,
    /// 4× the source rate (44.1 → 176.4, 48 → 192).
    Quadruple,
    /// Highest power-of-two multiple within the DAC maximum.
    PowerOf2,
    /// Always 352.8 / 384 kHz (the DSD256-equivalent PCM rate).
    Dsd256Rate,
    /// User-specified fixed rate.
    Fixed,
}

/// Resampler quality preset.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum UpsamplingQuality {
    /// Shortest kernel, lowest latency.
    Quick,
    /// Light kernel.
    Low,
    /// Balanced kernel.
    Medium,
    /// Long kernel, high stopband attenuation.
    #[default]
    High,
    /// Longest kernel, maximum quality.
    VeryHigh,
}

/// Filter phase/rolloff preset.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum UpsamplingFilter {
    /// Flat passband, symmetric pre/post ringing.
    #[default]
    LinearPhase,
    /// Shortest kernel to minimise pre-ringing.
    MinimumPhase,
    /// Sharp cutoff, more ringing.
    SteepFilter,
    /// Gentle cutoff, less ringing.
    SlowRolloff,
}

/// Rate-conversion stage.
pub struct Upsampler {
    enabled: bool,
    mode: UpsamplingMode,
    quality: UpsamplingQuality,
    filter: UpsamplingFilter,
    fixed_rate: u32,

    input_rate: u32,
    output_rate: u32,
    channels: usize,

    max_dac_rate: u32,
    device_is_built_in: bool,

    resampler: Option<SincFixedIn<f32>>,
    /// Per-channel input accumulators awaiting a full chunk.
    pending: Vec<Vec<f32>>,
    /// Per-channel chunk staging buffers (exactly the resampler's
    /// required input length).
    chunk: Vec<Vec<f32>>,
    /// Resampler output buffers, sized by the resampler itself.
    resampled: Vec<Vec<f32>>,
    /// Interleaved output samples ready to hand out.
    ready: VecDeque<f32>,

    create_failed_logged: bool,
}

impl Upsampler {
    /// Creates a disabled upsampler.
    #[must_use]
    pub fn new() -> Self {
        Self {
            enabled: false,
            mode: UpsamplingMode::None,
            quality: UpsamplingQuality::High,
            filter: UpsamplingFilter::LinearPhase,
            fixed_rate: 352_800,
            input_rate: 44_100,
            output_rate: 44_100,
            channels: 2,
            max_dac_rate: 384_000,
            device_is_built_in: false,
            resampler: None,
            pending: Vec::new(),
            chunk: Vec::new(),
            resampled: Vec::new(),
            ready: VecDeque::new(),
            create_failed_logged: false,
        }
    }

    /// Sets the target-rate mode and reconfigures.
    pub fn set_mode(&mut self, mode: UpsamplingMode) {
        self.mode = mode;
        self.reconfigure();
    }

    /// Current mode.
    #[must_use]
    pub fn mode(&self) -> UpsamplingMode {
        self.mode
    }

    /// Sets the quality preset and reconfigures.
    pub fn set_quality(&mut self, quality: UpsamplingQuality) {
        self.quality = quality;
        self.reconfigure();
    }

    /// Current quality preset.
    #[must_use]
    pub fn quality(&self) -> UpsamplingQuality {
        self.quality
    }

    /// Sets the filter preset and reconfigures.
    pub fn set_filter(&mut self, filter: UpsamplingFilter) {
        self.filter = filter;
        self.reconfigure();
    }

    /// Current filter preset.
    #[must_use]
    pub fn filter(&self) -> UpsamplingFilter {
        self.filter
    }

    /// Sets the fixed target rate, effective when the mode is `Fixed`.
    pub fn set_fixed_rate(&mut self, rate: u32) {
        self.fixed_rate = rate;
        if self.mode == UpsamplingMode::Fixed {
            self.reconfigure();
        }
    }

    /// Tells the upsampler the device's maximum DAC rate.
    pub fn set_max_dac_rate(&mut self, rate: u32) {
        if self.max_dac_rate != rate {
            self.max_dac_rate = rate;
            self.reconfigure();
        }
    }

    /// Tells the upsampler whether the active device is built in.
    pub fn set_device_is_built_in(&mut self, built_in: bool) {
        if self.device_is_built_in != built_in {
            self.device_is_built_in = built_in;
            self.reconfigure();
        }
    }

    /// Sets the source format. Called on every `load()`.
    pub fn set_input_format(&mut self, sample_rate: u32, channels: usize) {
        self.input_rate = sample_rate;
        self.channels = channels.max(1);
        self.reconfigure();
    }

    /// The input sample rate in Hz.
    #[must_use]
    pub fn input_sample_rate(&self) -> u32 {
        self.input_rate
    }

    /// The output sample rate in Hz after conversion.
    #[must_use]
    pub fn output_sample_rate(&self) -> u32 {
        self.output_rate
    }

    /// Whether the stage actually converts (enabled, mode set, rates
    /// differ and the resampler exists).
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.enabled
            && self.mode != UpsamplingMode::None
            && self.output_rate != self.input_rate
            && self.resampler.is_some()
    }

    /// Computes the target output rate for a source rate.
    ///
    /// Stays in the source's rate family and never downsamples unless
    /// the device is built in and physically cannot accept the source
    /// rate, in which case it clamps to the highest supported
    /// same-family rate.
    #[must_use]
    pub fn calculate_target_rate(&self, source_rate: u32) -> u32 {
        let is_44_family = source_rate % 44_100 == 0;

        if self.device_is_built_in && self.max_dac_rate > 0 && self.mode != UpsamplingMode::None {
            let family: &[u32] = if is_44_family {
                &[352_800, 176_400, 88_200, 44_100]
            } else {
                &[384_000, 192_000, 96_000, 48_000]
            };
            return family
                .iter()
                .copied()
                .find(|&rate| rate <= self.max_dac_rate)
                .unwrap_or(source_rate);
        }

        match self.mode {
            UpsamplingMode::None => source_rate,
            UpsamplingMode::Double => {
                let target = source_rate * 2;
                if target <= self.max_dac_rate {
                    target
                } else {
                    source_rate
                }
            }
            UpsamplingMode::Quadruple => {
                let target = source_rate * 4;
                if target <= self.max_dac_rate {
                    target
                } else {
                    source_rate
                }
            }
            UpsamplingMode::PowerOf2 | UpsamplingMode::MaxRate => {
                let family: &[u32] = if is_44_family {
                    &[352_800, 176_400, 88_200]
                } else {
                    &[384_000, 192_000, 96_000]
                };
                family
                    .iter()
                    .copied()
                    .find(|&rate| rate <= self.max_dac_rate)
                    .unwrap_or(source_rate)
            }
            UpsamplingMode::Dsd256Rate => {
                if is_44_family {
                    352_800
                } else {
                    384_000
                }
            }
            UpsamplingMode::Fixed => {
                if self.fixed_rate <= self.max_dac_rate {
                    self.fixed_rate
                } else {
                    self.max_dac_rate
                }
            }
        }
    }

    /// Maps quality and filter presets onto sinc parameters.
    fn interpolation_parameters(&self) -> SincInterpolationParameters {
        let (mut sinc_len, mut f_cutoff, oversampling_factor, interpolation, mut window) =
            match self.quality {
                UpsamplingQuality::Quick => (
                    64,
                    0.91,
                    128,
                    SincInterpolationType::Linear,
                    WindowFunction::Blackman,
                ),
                UpsamplingQuality::Low => (
                    128,
                    0.925,
                    128,
                    SincInterpolationType::Linear,
                    WindowFunction::Blackman2,
                ),
                UpsamplingQuality::Medium => (
                    192,
                    0.94,
                    256,
                    SincInterpolationType::Linear,
                    WindowFunction::BlackmanHarris2,
                ),
                UpsamplingQuality::High => (
                    256,
                    0.95,
                    256,
                    SincInterpolationType::Linear,
                    WindowFunction::BlackmanHarris2,
                ),
                UpsamplingQuality::VeryHigh => (
                    384,
                    0.97,
                    512,
                    SincInterpolationType::Cubic,
                    WindowFunction::BlackmanHarris,
                ),
            };

        match self.filter {
            UpsamplingFilter::LinearPhase => {}
            UpsamplingFilter::MinimumPhase => {
                sinc_len = (sinc_len / 2).max(64);
                window = WindowFunction::Hann;
            }
            UpsamplingFilter::SteepFilter => {
                sinc_len *= 2;
                f_cutoff = 0.98;
            }
            UpsamplingFilter::SlowRolloff => {
                f_cutoff = 0.90;
                window = WindowFunction::Hann2;
            }
        }

        SincInterpolationParameters {
            sinc_len,
            f_cutoff,
            oversampling_factor,
            interpolation,
            window,
        }
    }

    /// Rebuilds the resampler for the current configuration.
    fn reconfigure(&mut self) {
        self.resampler = None;
        self.pending.clear();
        self.chunk.clear();
        self.resampled.clear();
        self.ready.clear();

        if !self.enabled || self.mode == UpsamplingMode::None {
            self.output_rate = self.input_rate;
            return;
        }

        let target = self.calculate_target_rate(self.input_rate);
        if target == self.input_rate {
            self.output_rate = self.input_rate;
            debug!("upsampler: target equals source {} Hz, pass-through", target);
            return;
        }
        if target < self.input_rate && !self.device_is_built_in {
            // Never downsample for an external DAC.
            self.output_rate = self.input_rate;
            debug!(
                "upsampler: target {} Hz below source {} Hz, pass-through",
                target, self.input_rate,
            );
            return;
        }

        let ratio = f64::from(target) / f64::from(self.input_rate);
        match SincFixedIn::<f32>::new(
            ratio,
            2.0,
            self.interpolation_parameters(),
            CHUNK_FRAMES,
            self.channels,
        ) {
            Ok(resampler) => {
                self.output_rate = target;
                let needed = resampler.input_frames_max();
                let out_max = resampler.output_frames_max();
                // Sized for the widest render callback so the audio
                // thread never grows these.
                let worst_case_frames = needed.max(16_384) + needed;
                self.pending = vec![Vec::with_capacity(worst_case_frames); self.channels];
                self.chunk = vec![vec![0.0; needed]; self.channels];
                self.resampled = resampler.output_buffer_allocate(true);
                self.ready =
                    VecDeque::with_capacity((out_max + worst_case_frames * 2) * self.channels);
                self.resampler = Some(resampler);
                self.create_failed_logged = false;
                info!(
                    "upsampler configured: {} -> {} Hz ({:?}, {:?}, ratio {:.4})",
                    self.input_rate, target, self.quality, self.filter, ratio,
                );
            }
            Err(e) => {
                // Degrade silently to pass-through; log once.
                if !self.create_failed_logged {
                    warn!("upsampler creation failed, falling back to pass-through: {e}");
                    self.create_failed_logged = true;
                }
                self.output_rate = self.input_rate;
            }
        }
    }

    /// Converts `input_frames` interleaved frames into `output`,
    /// returning the number of output frames generated.
    ///
    /// Pass-through copy when the stage is inactive. Because the sinc
    /// kernel needs history, the first calls after a reconfigure return
    /// fewer frames than the steady-state ratio would suggest; the
    /// engine zero-fills the remainder of its buffer.
    pub fn process_upsampling(
        &mut self,
        input: &[f32],
        input_frames: usize,
        channels: usize,
        output: &mut [f32],
        max_output_frames: usize,
    ) -> usize {
        if !self.is_active() {
            let frames = input_frames.min(max_output_frames);
            output[..frames * channels].copy_from_slice(&input[..frames * channels]);
            return frames;
        }

        // Deinterleave into the per-channel accumulators.
        for frame in 0..input_frames {
            for channel in 0..channels {
                self.pending[channel].push(input[frame * channels + channel]);
            }
        }

        // Feed the resampler in fixed-size chunks.
        loop {
            let Some(resampler) = self.resampler.as_mut() else {
                break;
            };
            let needed = resampler.input_frames_next();
            if self.pending[0].len() < needed {
                break;
            }

            for channel in 0..channels {
                self.chunk[channel].resize(needed, 0.0);
                self.chunk[channel].copy_from_slice(&self.pending[channel][..needed]);
                self.pending[channel].drain(..needed);
            }

            match resampler.process_into_buffer(&self.chunk, &mut self.resampled, None) {
                Ok((_consumed, produced)) => {
                    for frame in 0..produced {
                        for channel in 0..channels {
                            self.ready.push_back(self.resampled[channel][frame]);
                        }
                    }
                }
                Err(e) => {
                    warn!("upsampler process error: {e}");
                    break;
                }
            }
        }

        // Hand out whatever is ready, up to the caller's limit.
        let available = self.ready.len() / channels;
        let frames = available.min(max_output_frames);
        for frame in 0..frames {
            for channel in 0..channels {
                output[frame * channels + channel] = self.ready.pop_front().unwrap_or(0.0);
            }
        }
        frames
    }

    /// Human-readable description for signal-path display; empty when
    /// inactive.
    #[must_use]
    pub fn description(&self) -> String {
        if !self.is_active() {
            return String::new();
        }
        format!(
            "{:.1} kHz \u{2192} {:.1} kHz ({:?}, {:?})",
            f64::from(self.input_rate) / 1000.0,
            f64::from(self.output_rate) / 1000.0,
            self.quality,
            self.filter,
        )
    }
}

impl Default for Upsampler {
    fn default() -> Self {
        Self::new()
    }
}

impl DspStage for Upsampler {
    fn prepare(&mut self, sample_rate: f64, channels: usize) {
        self.set_input_format(sample_rate as u32, channels);
    }

    /// No-op: upsampling needs separate input/output buffers and goes
    /// through [`Upsampler::process_upsampling`] instead.
    fn process(&mut self, _buf: &mut [f32], _frames: usize, _channels: usize) {}

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        self.reconfigure();
    }
}

#[cfg(test)]
mod tests {
    use super::{Upsampler, UpsamplingMode};
    use crate::dsp::DspStage;

    fn active_upsampler(mode: UpsamplingMode, input_rate: u32) -> Upsampler {
        let mut upsampler = Upsampler::new();
        upsampler.set_max_dac_rate(384_000);
        upsampler.set_mode(mode);
        upsampler.set_enabled(true);
        upsampler.set_input_format(input_rate, 2);
        upsampler
    }

    #[test]
    fn disabled_mode_none_is_pass_through_copy() {
        let mut upsampler = Upsampler::new();
        upsampler.set_input_format(44_100, 2);

        let input: Vec<f32> = (0..256).map(|i| i as f32 / 256.0).collect();
        let mut output = vec![0.0_f32; 256];
        let frames = upsampler.process_upsampling(&input, 128, 2, &mut output, 128);
        assert_eq!(frames, 128);
        assert_eq!(output, input);
    }

    #[test]
    fn pass_through_respects_output_limit() {
        let mut upsampler = Upsampler::new();
        let input = vec![0.5_f32; 2 * 100];
        let mut output = vec![0.0_f32; 2 * 100];
        let frames = upsampler.process_upsampling(&input, 100, 2, &mut output, 60);
        assert_eq!(frames, 60);
    }

    #[test]
    fn target_rate_stays_in_family() {
        let mut upsampler = Upsampler::new();
        upsampler.set_max_dac_rate(384_000);
        upsampler.set_mode(UpsamplingMode::MaxRate);

        assert_eq!(upsampler.calculate_target_rate(44_100), 352_800);
        assert_eq!(upsampler.calculate_target_rate(48_000), 384_000);
        assert_eq!(upsampler.calculate_target_rate(88_200), 352_800);
        assert_eq!(upsampler.calculate_target_rate(96_000), 384_000);
    }

    #[test]
    fn double_and_quadruple_respect_dac_limit() {
        let mut upsampler = Upsampler::new();
        upsampler.set_max_dac_rate(96_000);
        upsampler.set_mode(UpsamplingMode::Double);
        assert_eq!(upsampler.calculate_target_rate(48_000), 96_000);
        // 2x 96k would exceed the DAC; stay at source.
        assert_eq!(upsampler.calculate_target_rate(96_000), 96_000);

        upsampler.set_mode(UpsamplingMode::Quadruple);
        assert_eq!(upsampler.calculate_target_rate(44_100), 44_100);
    }

    #[test]
    fn built_in_device_clamps_to_family_maximum() {
        let mut upsampler = Upsampler::new();
        upsampler.set_max_dac_rate(96_000);
        upsampler.set_device_is_built_in(true);
        upsampler.set_mode(UpsamplingMode::MaxRate);

        // 44.1-family source on a 96 kHz-max built-in: highest 44.1
        // family rate that fits is 88.2 kHz.
        assert_eq!(upsampler.calculate_target_rate(44_100), 88_200);
        // A 192 kHz source gets clamped down, which only built-in
        // devices are allowed to do.
        assert_eq!(upsampler.calculate_target_rate(176_400), 88_200);
    }

    #[test]
    fn fixed_mode_honours_dac_limit() {
        let mut upsampler = Upsampler::new();
        upsampler.set_max_dac_rate(192_000);
        upsampler.set_mode(UpsamplingMode::Fixed);
        upsampler.set_fixed_rate(352_800);
        assert_eq!(upsampler.calculate_target_rate(44_100), 192_000);

        upsampler.set_fixed_rate(176_400);
        assert_eq!(upsampler.calculate_target_rate(44_100), 176_400);
    }

    #[test]
    fn doubling_produces_roughly_twice_the_frames() {
        let mut upsampler = active_upsampler(UpsamplingMode::Double, 44_100);
        assert!(upsampler.is_active());
        assert_eq!(upsampler.output_sample_rate(), 88_200);

        // Push several chunks of a sine through and count output.
        let frames_in = 1024;
        let input: Vec<f32> = (0..frames_in)
            .flat_map(|i| {
                let s = (i as f32 * 0.05).sin() * 0.5;
                [s, s]
            })
            .collect();
        let mut output = vec![0.0_f32; frames_in * 2 * 3];

        let mut total_out = 0;
        let mut total_in = 0;
        for _ in 0..32 {
            total_in += frames_in;
            total_out +=
                upsampler.process_upsampling(&input, frames_in, 2, &mut output, frames_in * 3);
        }

        let ratio = total_out as f64 / total_in as f64;
        assert!(
            (ratio - 2.0).abs() < 0.1,
            "conversion ratio {ratio}, expected ~2.0",
        );
    }

    #[test]
    fn upsampled_signal_stays_bounded() {
        let mut upsampler = active_upsampler(UpsamplingMode::Double, 48_000);
        let frames_in = 1024;
        let input: Vec<f32> = (0..frames_in)
            .flat_map(|i| {
                let s = (i as f32 * 0.1).sin() * 0.9;
                [s, -s]
            })
            .collect();
        let mut output = vec![0.0_f32; frames_in * 2 * 3];
        for _ in 0..8 {
            let produced =
                upsampler.process_upsampling(&input, frames_in, 2, &mut output, frames_in * 3);
            for sample in &output[..produced * 2] {
                assert!(sample.abs() < 1.2, "sample {sample} out of range");
            }
        }
    }

    #[test]
    fn reconfigure_on_input_change_resets_rate() {
        let mut upsampler = active_upsampler(UpsamplingMode::MaxRate, 44_100);
        assert_eq!(upsampler.output_sample_rate(), 352_800);
        upsampler.set_input_format(48_000, 2);
        assert_eq!(upsampler.output_sample_rate(), 384_000);
        upsampler.set_enabled(false);
        assert_eq!(upsampler.output_sample_rate(), 48_000);
    }
}
