//! Persisted settings consumed by the playback core.
//!
//! The core reads this state and never writes it: persistence belongs to
//! the settings collaborator outside the crate. [`PlayerConfig`]
//! deserializes from TOML with per-field defaults so a partial file (or
//! none at all) yields a fully usable configuration.
//!
//! # Example
//!
//! ```rust
//! use resona::config::PlayerConfig;
//!
//! let config: PlayerConfig = toml::from_str(
//!     r#"
//!     volume = 0.8
//!     dsd_playback_mode = "dop"
//!
//!     [leveling]
//!     enabled = true
//!     target_lufs = -14.0
//!     "#,
//! )
//! .unwrap();
//! assert!(config.leveling.enabled);
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{
    dsp::equalizer::EqBandConfig,
    dsp::gain::HeadroomMode,
    dsp::upsampler::{UpsamplingFilter, UpsamplingMode, UpsamplingQuality},
    error::Result,
};

/// How DSD sources are played back.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum DsdPlaybackMode {
    /// Convert to PCM through FIR decimation. Works on every device.
    #[default]
    Pcm,
    /// Encode as DSD-over-PCM for a DoP-capable external DAC.
    Dop,
}

/// Volume levelling reference: per-track or per-album loudness.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LevelingMode {
    /// Use track gain/peak.
    #[default]
    Track,
    /// Use album gain/peak when present, falling back to track values.
    Album,
}

/// Upsampler settings block.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct UpsamplingConfig {
    /// Master enable for the upsampler stage.
    pub enabled: bool,
    /// Target-rate selection strategy.
    pub mode: UpsamplingMode,
    /// Resampler quality preset.
    pub quality: UpsamplingQuality,
    /// Filter phase/rolloff preset.
    pub filter: UpsamplingFilter,
    /// Target rate in Hz when `mode` is `Fixed`.
    pub fixed_rate: u32,
}

impl Default for UpsamplingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: UpsamplingMode::default(),
            quality: UpsamplingQuality::default(),
            filter: UpsamplingFilter::default(),
            fixed_rate: 352_800,
        }
    }
}

/// Volume levelling settings block.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct LevelingConfig {
    /// Master enable for volume levelling.
    pub enabled: bool,
    /// Track or album reference.
    pub mode: LevelingMode,
    /// Target loudness in LUFS.
    pub target_lufs: f64,
}

impl Default for LevelingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: LevelingMode::default(),
            target_lufs: -14.0,
        }
    }
}

/// Headroom management settings block.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct HeadroomConfig {
    /// Off, Auto or Manual.
    pub mode: HeadroomMode,
    /// Attenuation in dB applied in Manual mode, clamped to [-12, 0].
    pub manual_db: f64,
}

impl Default for HeadroomConfig {
    fn default() -> Self {
        Self {
            mode: HeadroomMode::default(),
            manual_db: 0.0,
        }
    }
}

/// Crossfeed settings block.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct CrossfeedConfig {
    /// Master enable for the crossfeed stage.
    pub enabled: bool,
    /// Mix level preset: 0 = Light, 1 = Medium, 2 = Strong.
    pub level: u8,
}

/// Convolution (room correction) settings block.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConvolutionConfig {
    /// Master enable for the convolution stage.
    pub enabled: bool,
    /// Path to the WAV impulse response, if one is configured.
    pub ir_path: Option<PathBuf>,
}

/// HRTF (binaural rendering) settings block.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct HrtfConfig {
    /// Master enable for the HRTF stage.
    pub enabled: bool,
    /// Path to the SOFA file carrying the per-ear filters.
    pub sofa_path: Option<PathBuf>,
    /// Virtual speaker angle in degrees, clamped to [10, 90].
    pub speaker_angle: f32,
}

impl Default for HrtfConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sofa_path: None,
            speaker_angle: 30.0,
        }
    }
}

/// Gapless/crossfade settings block.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct GaplessConfig {
    /// Master enable for gapless transitions.
    pub enabled: bool,
    /// Crossfade duration in milliseconds; 0 disables crossfading.
    pub crossfade_ms: u32,
}

impl Default for GaplessConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            crossfade_ms: 0,
        }
    }
}

/// Equaliser settings block: up to 20 bands plus a preamp.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct EqConfig {
    /// Master enable for the equaliser stage.
    pub enabled: bool,
    /// Preamp gain in dB applied before the band cascade.
    pub preamp_db: f32,
    /// Band definitions; entries beyond 20 are ignored.
    pub bands: Vec<EqBandConfig>,
}

impl Default for EqConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            preamp_db: 0.0,
            bands: Vec::new(),
        }
    }
}

/// The complete settings surface the core reads.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlayerConfig {
    /// Device-level volume in [0, 1].
    pub volume: f32,

    /// Persistent UID of the preferred output device, if any. UIDs
    /// survive reboots where numeric device ids do not.
    pub output_device_uid: Option<String>,

    /// Human-readable name of the preferred output device.
    pub output_device_name: Option<String>,

    /// Whether to request exclusive (hog) access to the output device.
    pub exclusive_mode: bool,

    /// Requested device buffer size in frames; `None` keeps the driver
    /// default.
    pub buffer_size: Option<u32>,

    /// DSD playback mode.
    pub dsd_playback_mode: DsdPlaybackMode,

    /// Target PCM rate for DSD-to-PCM conversion. Accepts 44100, 88200,
    /// 176400 or 352800; anything else falls back to 44100.
    pub dsd_output_quality: u32,

    /// Bit-perfect flag: bypass tone-altering DSP.
    pub bit_perfect: bool,

    /// Match the device rate to the source rate for lossless codecs.
    pub auto_sample_rate: bool,

    /// Whether the DSP pipeline (EQ + preamp) runs at all.
    pub dsp_enabled: bool,

    /// Upsampler settings.
    pub upsampling: UpsamplingConfig,

    /// Equaliser settings.
    pub eq: EqConfig,

    /// Volume levelling settings.
    pub leveling: LevelingConfig,

    /// Headroom settings.
    pub headroom: HeadroomConfig,

    /// Crossfeed settings.
    pub crossfeed: CrossfeedConfig,

    /// Convolution settings.
    pub convolution: ConvolutionConfig,

    /// HRTF settings.
    pub hrtf: HrtfConfig,

    /// Gapless/crossfade settings.
    pub gapless: GaplessConfig,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            volume: 1.0,
            output_device_uid: None,
            output_device_name: None,
            exclusive_mode: false,
            buffer_size: None,
            dsd_playback_mode: DsdPlaybackMode::default(),
            dsd_output_quality: 44_100,
            bit_perfect: false,
            auto_sample_rate: false,
            dsp_enabled: true,
            upsampling: UpsamplingConfig::default(),
            eq: EqConfig::default(),
            leveling: LevelingConfig::default(),
            headroom: HeadroomConfig::default(),
            crossfeed: CrossfeedConfig::default(),
            convolution: ConvolutionConfig::default(),
            hrtf: HrtfConfig::default(),
            gapless: GaplessConfig::default(),
        }
    }
}

impl PlayerConfig {
    /// Loads configuration from a TOML file.
    ///
    /// Missing fields take their defaults, so a partial file is fine.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::{DsdPlaybackMode, LevelingMode, PlayerConfig};

    #[test]
    fn empty_config_yields_defaults() {
        let config: PlayerConfig = toml::from_str("").unwrap();
        assert_eq!(config, PlayerConfig::default());
        assert_eq!(config.volume, 1.0);
        assert_eq!(config.dsd_output_quality, 44_100);
        assert!(config.gapless.enabled);
    }

    #[test]
    fn partial_config_overrides_only_named_fields() {
        let config: PlayerConfig = toml::from_str(
            r#"
            bit_perfect = true
            dsd_playback_mode = "dop"

            [leveling]
            enabled = true
            mode = "album"
            target_lufs = -16.5
            "#,
        )
        .unwrap();

        assert!(config.bit_perfect);
        assert_eq!(config.dsd_playback_mode, DsdPlaybackMode::Dop);
        assert!(config.leveling.enabled);
        assert_eq!(config.leveling.mode, LevelingMode::Album);
        assert!((config.leveling.target_lufs - -16.5).abs() < f64::EPSILON);
        // Untouched blocks stay default.
        assert!(!config.crossfeed.enabled);
        assert_eq!(config.volume, 1.0);
    }

    #[test]
    fn eq_bands_deserialize() {
        let config: PlayerConfig = toml::from_str(
            r#"
            [eq]
            enabled = true
            preamp_db = -2.0

            [[eq.bands]]
            band_type = "peak"
            frequency_hz = 1000.0
            gain_db = 6.0
            q = 1.0
            enabled = true
            "#,
        )
        .unwrap();

        assert!(config.eq.enabled);
        assert_eq!(config.eq.bands.len(), 1);
        assert!((config.eq.bands[0].frequency_hz - 1000.0).abs() < f32::EPSILON);
    }
}
