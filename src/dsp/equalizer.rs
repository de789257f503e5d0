//! Parametric equaliser: up to 20 biquad bands plus a preamp.
//!
//! Two phase modes are supported:
//! * **Minimum phase** (default): the band cascade runs as direct
//!   biquads — latency-free, the recommended path.
//! * **Linear phase**: the cascade's magnitude response is sampled,
//!   turned into a symmetric impulse response and run through FFT
//!   convolution. This adds half the filter length of delay, reported
//!   through [`Equalizer::latency_frames`] so the gapless manager keeps
//!   crossfades aligned.
//!
//! Coefficients recompute lazily: setters mark the cascade dirty, and
//! `begin_batch_update`/`end_batch_update` let a UI rewrite many bands
//! under a single recomputation. Switching phase modes clears all
//! filter history.

use rustfft::{num_complex::Complex, FftPlanner};
use serde::Deserialize;

use crate::{
    dsp::biquad::{sanitize_frequency, sanitize_q, Biquad, BiquadCoefficients, BiquadType},
    dsp::convolution::FftConvolver,
    dsp::DspStage,
    util::db_to_ratio,
};

/// Maximum number of bands in the cascade.
pub const MAX_BANDS: usize = 20;

/// Length of the synthesized linear-phase impulse response.
const LINEAR_PHASE_TAPS: usize = 4096;

/// Partition size of the linear-phase convolver.
const LINEAR_PHASE_BLOCK: usize = 1024;

/// One equaliser band definition.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct EqBandConfig {
    /// Filter shape of the band.
    pub band_type: BiquadType,
    /// Center/corner frequency in Hz, clamped to [20, 20000].
    pub frequency_hz: f32,
    /// Band gain in dB, clamped to [-24, +24].
    pub gain_db: f32,
    /// Quality factor, clamped to [0.1, 30].
    pub q: f32,
    /// Whether the band participates in the cascade.
    pub enabled: bool,
}

impl Default for EqBandConfig {
    fn default() -> Self {
        Self {
            band_type: BiquadType::Peak,
            frequency_hz: 1_000.0,
            gain_db: 0.0,
            q: 1.0,
            enabled: true,
        }
    }
}

impl EqBandConfig {
    /// Clamps all parameters into their documented ranges.
    #[must_use]
    fn sanitized(mut self, sample_rate: f32) -> Self {
        self.frequency_hz = sanitize_frequency(self.frequency_hz, sample_rate);
        self.gain_db = self.gain_db.clamp(-24.0, 24.0);
        self.q = sanitize_q(self.q);
        self
    }

    /// Whether this band affects the signal at all. A zeroed gain
    /// disables gain-type bands cheaply without removing them.
    #[must_use]
    fn is_active(&self) -> bool {
        if !self.enabled {
            return false;
        }
        match self.band_type {
            BiquadType::Peak | BiquadType::LowShelf | BiquadType::HighShelf => {
                self.gain_db.abs() > 1e-3
            }
            _ => true,
        }
    }
}

/// Phase behaviour of the equaliser.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum EqPhaseMode {
    /// Direct biquads; zero latency.
    #[default]
    MinimumPhase,
    /// FFT-convolved symmetric impulse response; adds
    /// `LINEAR_PHASE_TAPS / 2` frames of delay.
    LinearPhase,
}

/// Parametric equaliser stage.
pub struct Equalizer {
    enabled: bool,
    sample_rate: f64,
    channels: usize,
    preamp_db: f32,
    bands: Vec<EqBandConfig>,
    phase_mode: EqPhaseMode,

    /// Per-channel biquad cascade, one section per band slot.
    filters: Vec<Vec<Biquad>>,
    /// Which band slots are active, mirrored from `bands` at
    /// recalculation time.
    active: Vec<bool>,

    /// Linear-phase engine, rebuilt on recalculation in that mode.
    linear: Option<FftConvolver>,

    dirty: bool,
    batch_depth: usize,
}

impl Equalizer {
    /// Creates a disabled equaliser with no bands.
    #[must_use]
    pub fn new() -> Self {
        Self {
            enabled: false,
            sample_rate: 44_100.0,
            channels: 2,
            preamp_db: 0.0,
            bands: Vec::new(),
            phase_mode: EqPhaseMode::MinimumPhase,
            filters: Vec::new(),
            active: vec![false; MAX_BANDS],
            linear: None,
            dirty: true,
            batch_depth: 0,
        }
    }

    /// Replaces the whole band set. Entries beyond [`MAX_BANDS`] are
    /// dropped.
    pub fn set_bands(&mut self, bands: &[EqBandConfig]) {
        self.bands = bands.iter().copied().take(MAX_BANDS).collect();
        self.mark_dirty();
    }

    /// Updates one band in place. Out-of-range indices are ignored with
    /// a log line rather than panicking mid-session.
    pub fn set_band(&mut self, index: usize, band: EqBandConfig) {
        if index >= MAX_BANDS {
            warn!("eq band index {index} out of range, ignoring");
            return;
        }
        if index >= self.bands.len() {
            self.bands.resize(index + 1, EqBandConfig::default());
        }
        if self.bands[index] != band {
            self.bands[index] = band;
            self.mark_dirty();
        }
    }

    /// Returns the band at `index`, if present.
    #[must_use]
    pub fn band(&self, index: usize) -> Option<EqBandConfig> {
        self.bands.get(index).copied()
    }

    /// Number of configured bands.
    #[must_use]
    pub fn band_count(&self) -> usize {
        self.bands.len()
    }

    /// Sets the preamp gain in dB, clamped to [-24, +24].
    pub fn set_preamp_db(&mut self, db: f32) {
        let clamped = db.clamp(-24.0, 24.0);
        if (clamped - self.preamp_db).abs() > f32::EPSILON {
            self.preamp_db = clamped;
            // The preamp is a scalar; only the linear-phase IR bakes it in.
            if self.phase_mode == EqPhaseMode::LinearPhase {
                self.mark_dirty();
            }
        }
    }

    /// Current preamp gain in dB.
    #[must_use]
    pub fn preamp_db(&self) -> f32 {
        self.preamp_db
    }

    /// Switches between minimum-phase and linear-phase realisation.
    /// All filter history is cleared.
    pub fn set_phase_mode(&mut self, mode: EqPhaseMode) {
        if self.phase_mode != mode {
            self.phase_mode = mode;
            for cascade in &mut self.filters {
                for biquad in cascade {
                    biquad.reset();
                }
            }
            self.linear = None;
            self.mark_dirty();
        }
    }

    /// Current phase mode.
    #[must_use]
    pub fn phase_mode(&self) -> EqPhaseMode {
        self.phase_mode
    }

    /// Starts a batch of band edits; recomputation is deferred until the
    /// matching [`end_batch_update`](Self::end_batch_update).
    pub fn begin_batch_update(&mut self) {
        self.batch_depth += 1;
    }

    /// Ends a batch of band edits and recomputes once.
    pub fn end_batch_update(&mut self) {
        self.batch_depth = self.batch_depth.saturating_sub(1);
        if self.batch_depth == 0 && self.dirty {
            self.recalculate();
        }
    }

    /// Latency in frames contributed by the current realisation.
    #[must_use]
    pub fn latency_frames(&self) -> usize {
        if self.enabled && self.phase_mode == EqPhaseMode::LinearPhase {
            LINEAR_PHASE_TAPS / 2
        } else {
            0
        }
    }

    /// Evaluates the cascade's summed magnitude response in dB at
    /// `num_points` log-spaced frequencies over [20 Hz, 20 kHz].
    ///
    /// UI-only: this recomputes coefficients analytically and never
    /// touches filter state.
    #[must_use]
    pub fn frequency_response(&self, num_points: usize) -> Vec<(f32, f32)> {
        let min_hz: f32 = 20.0;
        let max_hz: f32 = 20_000.0;
        let n = num_points.max(2);
        let sample_rate = self.sample_rate as f32;

        (0..n)
            .map(|i| {
                let ratio = i as f32 / (n - 1) as f32;
                let freq = min_hz * (max_hz / min_hz).powf(ratio);
                let w = 2.0 * std::f32::consts::PI * freq / sample_rate;

                let mut total_db = f64::from(self.preamp_db);
                for band in &self.bands {
                    if !band.is_active() {
                        continue;
                    }
                    let band = band.sanitized(sample_rate);
                    let coeffs = BiquadCoefficients::design(
                        band.band_type,
                        sample_rate,
                        band.frequency_hz,
                        band.gain_db,
                        band.q,
                    );
                    total_db += 10.0 * coeffs.magnitude_squared(w).max(1e-12).log10();
                }

                (freq, total_db as f32)
            })
            .collect()
    }

    fn mark_dirty(&mut self) {
        self.dirty = true;
        if self.batch_depth == 0 {
            self.recalculate();
        }
    }

    /// Recomputes the biquad coefficients (and the linear-phase IR when
    /// in that mode). Runs on the main thread under the engine's slot
    /// mutex, never on the audio thread.
    fn recalculate(&mut self) {
        self.dirty = false;
        let sample_rate = self.sample_rate as f32;

        self.filters
            .resize_with(self.channels, || vec![Biquad::new(); MAX_BANDS]);
        for cascade in &mut self.filters {
            cascade.resize_with(MAX_BANDS, Biquad::new);
        }

        self.active = vec![false; MAX_BANDS];
        for (index, band) in self.bands.iter().enumerate() {
            let band = band.sanitized(sample_rate);
            let active = band.is_active();
            self.active[index] = active;
            let coeffs = if active {
                BiquadCoefficients::design(
                    band.band_type,
                    sample_rate,
                    band.frequency_hz,
                    band.gain_db,
                    band.q,
                )
            } else {
                BiquadCoefficients::identity()
            };
            for cascade in &mut self.filters {
                cascade[index].set_coefficients(coeffs);
            }
        }

        if self.phase_mode == EqPhaseMode::LinearPhase {
            self.linear = Some(self.synthesize_linear_phase());
        } else {
            self.linear = None;
        }
    }

    /// Builds the symmetric impulse response realising the cascade's
    /// magnitude response (preamp included) and wraps it in a convolver.
    fn synthesize_linear_phase(&self) -> FftConvolver {
        let n = LINEAR_PHASE_TAPS;
        let sample_rate = self.sample_rate as f32;
        let mut planner = FftPlanner::<f32>::new();
        let inverse = planner.plan_fft_inverse(n);

        // Sample the target magnitude at the FFT bins; mirror for the
        // negative frequencies so the inverse transform is real.
        let mut spectrum = vec![Complex::new(0.0, 0.0); n];
        let preamp = db_to_ratio(self.preamp_db);
        for bin in 0..=n / 2 {
            let w = 2.0 * std::f32::consts::PI * bin as f32 / n as f32;
            let mut magnitude = f64::from(preamp);
            for band in &self.bands {
                if !band.is_active() {
                    continue;
                }
                let band = band.sanitized(sample_rate);
                let coeffs = BiquadCoefficients::design(
                    band.band_type,
                    sample_rate,
                    band.frequency_hz,
                    band.gain_db,
                    band.q,
                );
                magnitude *= coeffs.magnitude_squared(w).max(0.0).sqrt();
            }

            // Linear phase: delay of N/2 samples.
            let phase = -w * (n as f32 / 2.0);
            let value = Complex::from_polar(magnitude as f32, phase);
            spectrum[bin] = value;
            if bin != 0 && bin != n / 2 {
                spectrum[n - bin] = value.conj();
            }
        }

        inverse.process(&mut spectrum);
        let scale = 1.0 / n as f32;
        let ir: Vec<f32> = spectrum.iter().map(|c| c.re * scale).collect();

        FftConvolver::new(&[ir], LINEAR_PHASE_BLOCK, self.channels)
    }
}

impl Default for Equalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl DspStage for Equalizer {
    fn prepare(&mut self, sample_rate: f64, channels: usize) {
        self.sample_rate = sample_rate;
        self.channels = channels;
        self.filters.clear();
        self.linear = None;
        self.recalculate();
    }

    fn process(&mut self, buf: &mut [f32], frames: usize, channels: usize) {
        if !self.enabled {
            return;
        }
        if self.dirty && self.batch_depth == 0 {
            self.recalculate();
        }

        let preamp = db_to_ratio(self.preamp_db);

        match self.phase_mode {
            EqPhaseMode::MinimumPhase => {
                let active_channels = channels.min(self.filters.len());
                for frame in 0..frames {
                    for channel in 0..active_channels {
                        let mut sample = buf[frame * channels + channel] * preamp;
                        let cascade = &mut self.filters[channel];
                        for (index, biquad) in cascade.iter_mut().enumerate() {
                            if self.active[index] {
                                sample = biquad.process_sample(sample);
                            }
                        }
                        buf[frame * channels + channel] = sample;
                    }
                }
            }
            EqPhaseMode::LinearPhase => {
                // The preamp is baked into the synthesized IR.
                if let Some(convolver) = self.linear.as_mut() {
                    convolver.process(buf, frames, channels);
                }
            }
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
    use super::{EqBandConfig, EqPhaseMode, Equalizer, MAX_BANDS};
    use crate::dsp::biquad::BiquadType;
    use crate::dsp::DspStage;

    fn sine(frequency: f32, sample_rate: f32, frames: usize, amplitude: f32) -> Vec<f32> {
        (0..frames)
            .flat_map(|i| {
                let t = i as f32 / sample_rate;
                let s = amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin();
                [s, s]
            })
            .collect()
    }

    fn rms(buf: &[f32]) -> f32 {
        (buf.iter().map(|s| s * s).sum::<f32>() / buf.len() as f32).sqrt()
    }

    #[test]
    fn peak_boost_amplifies_sine_at_center() {
        let mut eq = Equalizer::new();
        eq.set_enabled(true);
        eq.prepare(44_100.0, 2);
        eq.set_band(
            0,
            EqBandConfig {
                band_type: BiquadType::Peak,
                frequency_hz: 1_000.0,
                gain_db: 6.0,
                q: 1.0,
                enabled: true,
            },
        );

        let frames = 44_100;
        let mut buf = sine(1_000.0, 44_100.0, frames, 0.5);
        eq.process(&mut buf, frames, 2);

        // Skip the settle-in, then compare RMS to the expected +6 dB.
        let steady = &buf[frames / 2..];
        let expected = 0.5 * 10.0_f32.powf(6.0 / 20.0) / 2.0_f32.sqrt();
        let measured = rms(steady);
        assert!(
            (measured - expected).abs() / expected < 0.02,
            "rms {measured} vs expected {expected}",
        );
    }

    #[test]
    fn disabled_eq_is_transparent() {
        let mut eq = Equalizer::new();
        eq.prepare(44_100.0, 2);
        let mut buf = sine(440.0, 44_100.0, 512, 0.5);
        let original = buf.clone();
        eq.process(&mut buf, 512, 2);
        assert_eq!(buf, original);
    }

    #[test]
    fn identical_setups_produce_identical_output() {
        let band = EqBandConfig {
            band_type: BiquadType::Peak,
            frequency_hz: 2_000.0,
            gain_db: -4.0,
            q: 2.0,
            enabled: true,
        };

        let run = |input: &[f32]| {
            let mut eq = Equalizer::new();
            eq.set_enabled(true);
            eq.prepare(48_000.0, 2);
            eq.set_band(0, band);
            // Applying the same setup twice must not disturb state.
            eq.set_band(0, band);
            let mut buf = input.to_vec();
            eq.process(&mut buf, input.len() / 2, 2);
            buf
        };

        let input = sine(2_000.0, 48_000.0, 2_048, 0.4);
        assert_eq!(run(&input), run(&input));
    }

    #[test]
    fn batch_update_defers_recalculation() {
        let mut eq = Equalizer::new();
        eq.set_enabled(true);
        eq.prepare(44_100.0, 2);

        eq.begin_batch_update();
        for i in 0..10 {
            eq.set_band(
                i,
                EqBandConfig {
                    frequency_hz: 100.0 * (i + 1) as f32,
                    gain_db: 3.0,
                    ..EqBandConfig::default()
                },
            );
        }
        eq.end_batch_update();

        assert_eq!(eq.band_count(), 10);
        let mut buf = sine(440.0, 44_100.0, 256, 0.1);
        eq.process(&mut buf, 256, 2);
        assert!(buf.iter().all(|s| s.is_finite()));
    }

    #[test]
    fn flat_response_is_zero_db() {
        let mut eq = Equalizer::new();
        eq.prepare(44_100.0, 2);
        for (freq, db) in eq.frequency_response(64) {
            assert!(freq >= 20.0 && freq <= 20_000.0);
            assert!(db.abs() < 0.01, "flat EQ returned {db} dB at {freq} Hz");
        }
    }

    #[test]
    fn response_shows_boost_near_band() {
        let mut eq = Equalizer::new();
        eq.prepare(44_100.0, 2);
        eq.set_band(
            0,
            EqBandConfig {
                frequency_hz: 1_000.0,
                gain_db: 12.0,
                q: 1.0,
                ..EqBandConfig::default()
            },
        );

        let response = eq.frequency_response(128);
        let peak = response
            .iter()
            .filter(|(f, _)| *f > 800.0 && *f < 1_250.0)
            .map(|(_, db)| *db)
            .fold(f32::MIN, f32::max);
        assert!(peak > 10.0, "peak response {peak} dB");
    }

    #[test]
    fn zero_gain_band_is_inactive() {
        let mut eq = Equalizer::new();
        eq.set_enabled(true);
        eq.prepare(44_100.0, 2);
        eq.set_band(
            0,
            EqBandConfig {
                gain_db: 0.0,
                ..EqBandConfig::default()
            },
        );

        let mut buf = sine(1_000.0, 44_100.0, 512, 0.5);
        let original = buf.clone();
        eq.process(&mut buf, 512, 2);
        for (a, b) in buf.iter().zip(&original) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn band_count_is_capped() {
        let mut eq = Equalizer::new();
        let bands = vec![EqBandConfig::default(); MAX_BANDS + 5];
        eq.set_bands(&bands);
        assert_eq!(eq.band_count(), MAX_BANDS);
    }

    #[test]
    fn linear_phase_reports_latency_and_matches_gain() {
        let mut eq = Equalizer::new();
        eq.set_enabled(true);
        eq.prepare(44_100.0, 2);
        eq.set_phase_mode(EqPhaseMode::LinearPhase);
        assert!(eq.latency_frames() > 0);

        // A flat linear-phase EQ passes a sine at unity gain (after the
        // filter delay settles).
        let frames = 44_100;
        let mut buf = sine(1_000.0, 44_100.0, frames, 0.5);
        eq.process(&mut buf, frames, 2);
        let steady = &buf[frames..]; // skip latency worth of samples
        let measured = rms(steady);
        let expected = 0.5 / 2.0_f32.sqrt();
        assert!(
            (measured - expected).abs() / expected < 0.05,
            "rms {measured} vs {expected}",
        );
    }

    #[test]
    fn phase_mode_switch_resets_latency() {
        let mut eq = Equalizer::new();
        eq.set_enabled(true);
        eq.prepare(44_100.0, 2);
        eq.set_phase_mode(EqPhaseMode::LinearPhase);
        assert!(eq.latency_frames() > 0);
        eq.set_phase_mode(EqPhaseMode::MinimumPhase);
        assert_eq!(eq.latency_frames(), 0);
    }
}
