//! Track metadata and source-file classification.
//!
//! This module carries the real-time-visible subset of track metadata —
//! the loudness tags that feed volume levelling — and the pre-flight
//! checks `load()` runs before handing a path to a decoder.
//!
//! Loudness analysis itself is an external collaborator: the engine only
//! consumes cached ReplayGain tags or EBU R128 numbers carried on
//! [`TrackMeta`].

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Source kinds the engine can play, classified by file extension.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SourceKind {
    /// Any container/codec pair the PCM decoder supports.
    Pcm,
    /// Raw 1-bit DSD in a DSF or DFF container.
    Dsd,
}

/// Classifies a path by extension: `.dsf`/`.dff` are DSD, everything
/// else goes through the PCM decoder.
#[must_use]
pub fn classify(path: &Path) -> SourceKind {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("dsf" | "dff") => SourceKind::Dsd,
        _ => SourceKind::Pcm,
    }
}

/// Pre-flight checks run before any decoder sees the file.
///
/// # Errors
///
/// Returns `FileNotFound`, `FileUnreadable` or `FileEmpty` so that
/// `load()` can surface a precise message before attempting a decode.
pub fn preflight(path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(Error::file_not_found(format!(
            "file not found: {}",
            path.display()
        )));
    }

    let metadata = std::fs::metadata(path)
        .map_err(|e| Error::file_unreadable(format!("{}: {e}", path.display())))?;

    if metadata.len() == 0 {
        return Err(Error::file_empty(format!(
            "file is empty: {}",
            path.display()
        )));
    }

    // A stat can succeed where an open would not; probe readability now so
    // the decoder never sees a permission error mid-open.
    std::fs::File::open(path)
        .map_err(|e| Error::file_unreadable(format!("{}: {e}", path.display())))?;

    Ok(())
}

/// Real-time-visible track metadata carried alongside the decoder.
///
/// Only the loudness fields are consumed by the core, through
/// [`LevelingGain`](crate::dsp::gain::LevelingGain). Everything else a
/// library row holds (title, artist, artwork) stays outside the core.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrackMeta {
    /// Path of the source file.
    pub file_path: PathBuf,

    /// Whether ReplayGain tags are present.
    pub has_replay_gain: bool,

    /// ReplayGain track gain in dB.
    pub replay_gain_track: f64,

    /// ReplayGain album gain in dB.
    pub replay_gain_album: f64,

    /// ReplayGain track peak as a linear amplitude.
    pub replay_gain_track_peak: f64,

    /// ReplayGain album peak as a linear amplitude.
    pub replay_gain_album_peak: f64,

    /// Whether a cached EBU R128 measurement is present.
    pub has_r128: bool,

    /// Integrated loudness in LUFS.
    pub r128_loudness: f64,

    /// True peak from the R128 measurement, linear.
    pub r128_peak: f64,
}

impl TrackMeta {
    /// Creates metadata for a path with no loudness information.
    #[must_use]
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: file_path.into(),
            ..Self::default()
        }
    }
}
