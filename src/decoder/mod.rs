//! Unified decoder layer over PCM and DSD sources.
//!
//! Two implementations sit behind one closed sum type:
//! * [`PcmDecoder`] — any container/codec pair Symphonia supports,
//!   decoded to interleaved 32-bit float at the source rate.
//! * [`DsdDecoder`] — raw 1-bit DSD from DSF/DFF containers, emitted
//!   either as band-limited PCM (FIR decimation) or as DoP-encoded
//!   frames for a DoP-capable DAC.
//!
//! The set of implementations is closed, so the polymorphism is a tagged
//! enum rather than a trait object: every call dispatches with a plain
//! `match` and the engine can still reach DSD-only state (DoP marker
//! phase) without downcasting.
//!
//! # Lifecycle
//!
//! A decoder is created open (construction performs the `open`), then
//! serves any number of `read`/`seek` calls until dropped or explicitly
//! closed by its owner replacing the slot. `read` returning 0 signals
//! end of stream; transient decode errors also return 0 frames but leave
//! the decoder open so the engine can advance to the next track.

pub mod dsd;
pub mod pcm;

pub use dsd::{DsdDecoder, DsdMode, DsdRate};
pub use pcm::PcmDecoder;

use crate::error::Result;

/// Descriptor of a decoded PCM stream.
///
/// Invariants: `sample_rate > 0` whenever a decoder is open;
/// `channels` is one of {1, 2, 3, 4, 6, 8}.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StreamFormat {
    /// Output sample rate in Hz. For DoP streams this is the DoP frame
    /// rate (`dsd_rate / 16`), not the DSD bit rate.
    pub sample_rate: f64,

    /// Interleaved channel count, at least 1.
    pub channels: usize,

    /// Informational bit depth of the source before float conversion.
    pub bits_per_sample: u32,

    /// Total output frames, when the container reports a length.
    pub total_frames: Option<i64>,

    /// Stream duration in seconds, 0 when unknown.
    pub duration_secs: f64,
}

/// A decoder for one open source file, polymorphic over PCM and DSD.
///
/// Exclusively owned by the engine's current slot or the gapless
/// manager's next slot; never shared.
pub enum Decoder {
    /// General container/codec decoding via Symphonia.
    Pcm(PcmDecoder),
    /// DSF/DFF parsing with FIR decimation or DoP encoding.
    Dsd(DsdDecoder),
}

impl Decoder {
    /// Reads up to `max_frames` interleaved frames into `buf`.
    ///
    /// Returns the number of frames produced. Short reads are allowed at
    /// end of file; zero means end of stream (or a transient decode
    /// error, which the engine treats the same way).
    pub fn read(&mut self, buf: &mut [f32], max_frames: usize) -> usize {
        match self {
            Self::Pcm(decoder) => decoder.read(buf, max_frames),
            Self::Dsd(decoder) => decoder.read(buf, max_frames),
        }
    }

    /// Seeks to a position in seconds.
    ///
    /// # Errors
    ///
    /// Returns `SeekFailed` when the position is invalid; the playback
    /// position is unchanged in that case.
    pub fn seek(&mut self, secs: f64) -> Result<()> {
        match self {
            Self::Pcm(decoder) => decoder.seek(secs),
            Self::Dsd(decoder) => decoder.seek(secs),
        }
    }

    /// Returns the output stream format.
    #[must_use]
    pub fn format(&self) -> StreamFormat {
        match self {
            Self::Pcm(decoder) => decoder.format(),
            Self::Dsd(decoder) => decoder.format(),
        }
    }

    /// Returns the current playback position in seconds.
    #[must_use]
    pub fn position_seconds(&self) -> f64 {
        match self {
            Self::Pcm(decoder) => decoder.position_seconds(),
            Self::Dsd(decoder) => decoder.position_seconds(),
        }
    }

    /// Returns the codec name for signal-path display, when known.
    #[must_use]
    pub fn codec_name(&self) -> Option<&'static str> {
        match self {
            Self::Pcm(decoder) => decoder.codec_name(),
            Self::Dsd(decoder) => Some(if decoder.is_dop_mode() {
                "DSD (DoP)"
            } else {
                "DSD"
            }),
        }
    }

    /// Whether this source decodes losslessly. Drives the auto
    /// sample-rate feature; the codec list is explicit, not heuristic.
    #[must_use]
    pub fn is_lossless(&self) -> bool {
        match self {
            Self::Pcm(decoder) => decoder.is_lossless(),
            Self::Dsd(_) => true,
        }
    }

    /// Whether the current source is a DSD stream.
    #[must_use]
    pub fn is_dsd(&self) -> bool {
        matches!(self, Self::Dsd(_))
    }

    /// Whether the stream is emitting DoP frames that must pass through
    /// the render chain untouched.
    #[must_use]
    pub fn is_dop_mode(&self) -> bool {
        match self {
            Self::Pcm(_) => false,
            Self::Dsd(decoder) => decoder.is_dop_mode(),
        }
    }

    /// The DSD rate class of the source, for signal-path reporting.
    #[must_use]
    pub fn dsd_rate(&self) -> Option<DsdRate> {
        match self {
            Self::Pcm(_) => None,
            Self::Dsd(decoder) => Some(decoder.dsd_rate()),
        }
    }

    /// The raw DSD bit rate in Hz, 0 for PCM sources.
    #[must_use]
    pub fn dsd_sample_rate_hz(&self) -> f64 {
        match self {
            Self::Pcm(_) => 0.0,
            Self::Dsd(decoder) => decoder.dsd_sample_rate_hz(),
        }
    }

    /// Current DoP marker alternation state, `false` for PCM sources.
    ///
    /// Exposed so a gapless DSD→DSD swap can hand the phase of the
    /// outgoing stream to the incoming one, keeping the DAC locked.
    #[must_use]
    pub fn dop_marker_state(&self) -> bool {
        match self {
            Self::Pcm(_) => false,
            Self::Dsd(decoder) => decoder.dop_marker_state(),
        }
    }

    /// Restores the DoP marker alternation state. No-op for PCM sources.
    pub fn set_dop_marker_state(&mut self, state: bool) {
        if let Self::Dsd(decoder) = self {
            decoder.set_dop_marker_state(state);
        }
    }
}
