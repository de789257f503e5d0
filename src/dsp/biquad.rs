//! Second-order IIR filter sections.
//!
//! Coefficients follow the Robert Bristow-Johnson audio cookbook; the
//! section itself is a transposed direct-form II, which keeps the state
//! variables well-scaled for float32 processing.

use crate::util::db_to_ratio;

/// Filter response types realisable by a single biquad section.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BiquadType {
    /// Peaking EQ band.
    #[default]
    Peak,
    /// Low shelf.
    LowShelf,
    /// High shelf.
    HighShelf,
    /// Second-order low-pass.
    LowPass,
    /// Second-order high-pass.
    HighPass,
    /// Notch.
    Notch,
    /// Band-pass (constant 0 dB peak gain).
    BandPass,
}

/// Normalised biquad coefficients (`a0` divided out).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BiquadCoefficients {
    pub b0: f32,
    pub b1: f32,
    pub b2: f32,
    pub a1: f32,
    pub a2: f32,
}

impl BiquadCoefficients {
    /// The identity filter.
    #[must_use]
    pub fn identity() -> Self {
        Self {
            b0: 1.0,
            b1: 0.0,
            b2: 0.0,
            a1: 0.0,
            a2: 0.0,
        }
    }

    /// Computes cookbook coefficients for the given band parameters.
    ///
    /// `frequency` and `q` are clamped to usable ranges relative to the
    /// sample rate before the trigonometry runs, so hostile inputs can
    /// never produce an unstable section.
    #[must_use]
    pub fn design(
        band_type: BiquadType,
        sample_rate: f32,
        frequency: f32,
        gain_db: f32,
        q: f32,
    ) -> Self {
        let frequency = sanitize_frequency(frequency, sample_rate);
        let q = sanitize_q(q);
        let w0 = 2.0 * std::f32::consts::PI * frequency / sample_rate;
        let cos_w0 = w0.cos();
        let sin_w0 = w0.sin();
        let alpha = sin_w0 / (2.0 * q);
        // Shelf/peak amplitude: sqrt of the linear gain.
        let a = db_to_ratio(gain_db / 2.0);

        match band_type {
            BiquadType::Peak => normalize(
                1.0 + alpha * a,
                -2.0 * cos_w0,
                1.0 - alpha * a,
                1.0 + alpha / a,
                -2.0 * cos_w0,
                1.0 - alpha / a,
            ),
            BiquadType::LowShelf => {
                let beta = 2.0 * a.sqrt() * alpha;
                normalize(
                    a * ((a + 1.0) - (a - 1.0) * cos_w0 + beta),
                    2.0 * a * ((a - 1.0) - (a + 1.0) * cos_w0),
                    a * ((a + 1.0) - (a - 1.0) * cos_w0 - beta),
                    (a + 1.0) + (a - 1.0) * cos_w0 + beta,
                    -2.0 * ((a - 1.0) + (a + 1.0) * cos_w0),
                    (a + 1.0) + (a - 1.0) * cos_w0 - beta,
                )
            }
            BiquadType::HighShelf => {
                let beta = 2.0 * a.sqrt() * alpha;
                normalize(
                    a * ((a + 1.0) + (a - 1.0) * cos_w0 + beta),
                    -2.0 * a * ((a - 1.0) + (a + 1.0) * cos_w0),
                    a * ((a + 1.0) + (a - 1.0) * cos_w0 - beta),
                    (a + 1.0) - (a - 1.0) * cos_w0 + beta,
                    2.0 * ((a - 1.0) - (a + 1.0) * cos_w0),
                    (a + 1.0) - (a - 1.0) * cos_w0 - beta,
                )
            }
            BiquadType::LowPass => normalize(
                (1.0 - cos_w0) * 0.5,
                1.0 - cos_w0,
                (1.0 - cos_w0) * 0.5,
                1.0 + alpha,
                -2.0 * cos_w0,
                1.0 - alpha,
            ),
            BiquadType::HighPass => normalize(
                (1.0 + cos_w0) * 0.5,
                -(1.0 + cos_w0),
                (1.0 + cos_w0) * 0.5,
                1.0 + alpha,
                -2.0 * cos_w0,
                1.0 - alpha,
            ),
            BiquadType::Notch => normalize(
                1.0,
                -2.0 * cos_w0,
                1.0,
                1.0 + alpha,
                -2.0 * cos_w0,
                1.0 - alpha,
            ),
            BiquadType::BandPass => normalize(
                alpha,
                0.0,
                -alpha,
                1.0 + alpha,
                -2.0 * cos_w0,
                1.0 - alpha,
            ),
        }
    }

    /// Squared magnitude response at angular frequency `w` (radians per
    /// sample), evaluated analytically from the coefficients.
    #[must_use]
    pub fn magnitude_squared(&self, w: f32) -> f64 {
        let cos_w = f64::from(w.cos());
        let cos_2w = f64::from((2.0 * w).cos());
        let (b0, b1, b2) = (f64::from(self.b0), f64::from(self.b1), f64::from(self.b2));
        let (a1, a2) = (f64::from(self.a1), f64::from(self.a2));

        let num = b0 * b0
            + b1 * b1
            + b2 * b2
            + 2.0 * (b0 * b1 + b1 * b2) * cos_w
            + 2.0 * b0 * b2 * cos_2w;
        let den = 1.0 + a1 * a1 + a2 * a2 + 2.0 * (a1 + a1 * a2) * cos_w + 2.0 * a2 * cos_2w;

        if den.abs() > 1e-12 {
            num / den
        } else {
            1.0
        }
    }
}

/// One biquad section with its state variables.
#[derive(Clone, Debug)]
pub struct Biquad {
    coeffs: BiquadCoefficients,
    z1: f32,
    z2: f32,
}

impl Biquad {
    /// Creates an identity section.
    #[must_use]
    pub fn new() -> Self {
        Self {
            coeffs: BiquadCoefficients::identity(),
            z1: 0.0,
            z2: 0.0,
        }
    }

    /// Replaces the coefficients, keeping filter state.
    pub fn set_coefficients(&mut self, coeffs: BiquadCoefficients) {
        self.coeffs = coeffs;
    }

    /// Returns the current coefficients.
    #[must_use]
    pub fn coefficients(&self) -> BiquadCoefficients {
        self.coeffs
    }

    /// Clears the state variables.
    pub fn reset(&mut self) {
        self.z1 = 0.0;
        self.z2 = 0.0;
    }

    /// Processes one sample (transposed direct-form II).
    #[inline]
    pub fn process_sample(&mut self, sample: f32) -> f32 {
        let y = self.coeffs.b0 * sample + self.z1;
        self.z1 = self.coeffs.b1 * sample - self.coeffs.a1 * y + self.z2;
        self.z2 = self.coeffs.b2 * sample - self.coeffs.a2 * y;
        y
    }
}

impl Default for Biquad {
    fn default() -> Self {
        Self::new()
    }
}

/// Clamps a band frequency to [20 Hz, min(20 kHz, Nyquist - 1)].
#[must_use]
pub fn sanitize_frequency(frequency: f32, sample_rate: f32) -> f32 {
    let nyquist = (sample_rate * 0.5) - 1.0;
    frequency.clamp(20.0, nyquist.min(20_000.0).max(20.0))
}

/// Clamps Q to the supported [0.1, 30] range.
#[must_use]
pub fn sanitize_q(q: f32) -> f32 {
    q.clamp(0.1, 30.0)
}

fn normalize(b0: f32, b1: f32, b2: f32, a0: f32, a1: f32, a2: f32) -> BiquadCoefficients {
    let inv_a0 = if a0.abs() > f32::EPSILON { 1.0 / a0 } else { 1.0 };
    BiquadCoefficients {
        b0: b0 * inv_a0,
        b1: b1 * inv_a0,
        b2: b2 * inv_a0,
        a1: a1 * inv_a0,
        a2: a2 * inv_a0,
    }
}

#[cfg(test)]
mod tests {
    use super::{Biquad, BiquadCoefficients, BiquadType};

    fn response_db(coeffs: &BiquadCoefficients, frequency: f32, sample_rate: f32) -> f64 {
        let w = 2.0 * std::f32::consts::PI * frequency / sample_rate;
        10.0 * coeffs.magnitude_squared(w).max(1e-12).log10()
    }

    #[test]
    fn identity_passes_signal_through() {
        let mut biquad = Biquad::new();
        for sample in [0.0_f32, 0.5, -0.25, 1.0] {
            assert!((biquad.process_sample(sample) - sample).abs() < 1e-7);
        }
    }

    #[test]
    fn peak_boost_is_centered_at_band_frequency() {
        let coeffs = BiquadCoefficients::design(BiquadType::Peak, 48_000.0, 1_000.0, 6.0, 1.0);
        let at_center = response_db(&coeffs, 1_000.0, 48_000.0);
        assert!((at_center - 6.0).abs() < 0.2, "center gain {at_center} dB");
        // Far away the response returns to unity.
        assert!(response_db(&coeffs, 40.0, 48_000.0).abs() < 0.5);
        assert!(response_db(&coeffs, 18_000.0, 48_000.0).abs() < 0.5);
    }

    #[test]
    fn low_pass_attenuates_high_frequencies() {
        let coeffs =
            BiquadCoefficients::design(BiquadType::LowPass, 48_000.0, 1_000.0, 0.0, 0.707);
        assert!(response_db(&coeffs, 100.0, 48_000.0).abs() < 0.5);
        assert!(response_db(&coeffs, 10_000.0, 48_000.0) < -30.0);
    }

    #[test]
    fn notch_kills_the_center_frequency() {
        let coeffs = BiquadCoefficients::design(BiquadType::Notch, 48_000.0, 1_000.0, 0.0, 5.0);
        assert!(response_db(&coeffs, 1_000.0, 48_000.0) < -30.0);
        assert!(response_db(&coeffs, 100.0, 48_000.0).abs() < 0.5);
    }

    #[test]
    fn shelves_reach_their_plateau_gain() {
        let low = BiquadCoefficients::design(BiquadType::LowShelf, 48_000.0, 1_000.0, 6.0, 0.707);
        assert!((response_db(&low, 40.0, 48_000.0) - 6.0).abs() < 0.5);
        assert!(response_db(&low, 18_000.0, 48_000.0).abs() < 0.5);

        let high = BiquadCoefficients::design(BiquadType::HighShelf, 48_000.0, 1_000.0, -6.0, 0.707);
        assert!((response_db(&high, 18_000.0, 48_000.0) + 6.0).abs() < 0.5);
        assert!(response_db(&high, 40.0, 48_000.0).abs() < 0.5);
    }

    #[test]
    fn hostile_parameters_stay_finite() {
        let coeffs =
            BiquadCoefficients::design(BiquadType::Peak, 44_100.0, 1_000_000.0, 100.0, 1e9);
        let mut biquad = Biquad::new();
        biquad.set_coefficients(coeffs);
        let y = biquad.process_sample(0.5);
        assert!(y.is_finite());
    }

    #[test]
    fn stable_filter_decays_after_impulse() {
        let coeffs = BiquadCoefficients::design(BiquadType::Peak, 44_100.0, 100.0, 12.0, 8.0);
        let mut biquad = Biquad::new();
        biquad.set_coefficients(coeffs);
        let mut level = biquad.process_sample(1.0).abs();
        // Run long enough for a stable section to ring down.
        for _ in 0..200_000 {
            level = biquad.process_sample(0.0).abs();
        }
        assert!(level < 1e-4, "ringing level {level}");
    }
}
