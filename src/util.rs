//! Utility traits and functions.
//!
//! This module provides general-purpose utilities including:
//! * Decibel/ratio conversions used throughout the DSP chain
//! * Type conversion traits

/// Converts a gain in decibels to a linear amplitude ratio.
///
/// Uses the amplitude convention `ratio = 10^(dB/20)`.
#[must_use]
pub fn db_to_ratio(db: f32) -> f32 {
    f32::powf(10.0, db / 20.0)
}

/// Converts a linear amplitude ratio to a gain in decibels.
///
/// Uses the amplitude convention `dB = 20·log10(ratio)`. A ratio of zero
/// would be negative infinity; callers are expected to guard against it
/// (see the limiter, which skips exact silence entirely).
#[must_use]
pub fn ratio_to_db(ratio: f32) -> f32 {
    20.0 * ratio.log10()
}

/// Trait for converting numeric values to `f32` with controlled truncation.
///
/// Provides safe conversion to `f32` by:
/// * Clamping values to `f32` range
/// * Preventing infinity values
/// * Preventing NaN values
pub trait ToF32 {
    /// Converts a value to `f32`, clamping to prevent invalid results.
    ///
    /// Values outside the `f32` range are clamped to the nearest valid value:
    /// * Values > `f32::MAX` become `f32::MAX`
    /// * Values < `f32::MIN` become `f32::MIN`
    fn to_f32_lossy(self) -> f32;
}

/// Implements conversion from `f64` to `f32` with range clamping.
impl ToF32 for f64 {
    #[expect(clippy::cast_possible_truncation)]
    fn to_f32_lossy(self) -> f32 {
        self.clamp(f64::from(f32::MIN), f64::from(f32::MAX)) as f32
    }
}
