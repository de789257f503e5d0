//! Signal-path reporting.
//!
//! Describes the active audio pipeline — source, decoder, DSP stages
//! and output — as an ordered list of display nodes. UI layers render
//! this directly; nothing here feeds back into processing.

/// Quality classification of a signal-path node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SignalQuality {
    /// Lossy-compressed source or stage.
    Lossy,
    /// Bit-exact lossless handling.
    Lossless,
    /// High-resolution material (beyond 16-bit/44.1 kHz or DSD).
    HighRes,
    /// Signal is being enhanced/altered by DSP.
    Enhanced,
    /// Verified bit-perfect delivery to the device.
    BitPerfect,
}

/// One stage in the signal-path display.
#[derive(Clone, Debug)]
pub struct SignalPathNode {
    /// Stage name ("Source", "Decoder", "Upsampling", ...).
    pub label: String,
    /// Main description line.
    pub detail: String,
    /// Secondary description line.
    pub sublabel: String,
    /// Quality classification for display color-coding.
    pub quality: SignalQuality,
}

impl SignalPathNode {
    /// Creates a node with an empty sublabel.
    #[must_use]
    pub fn new(label: &str, detail: impl Into<String>, quality: SignalQuality) -> Self {
        Self {
            label: label.to_string(),
            detail: detail.into(),
            sublabel: String::new(),
            quality,
        }
    }

    /// Sets the secondary line.
    #[must_use]
    pub fn with_sublabel(mut self, sublabel: impl Into<String>) -> Self {
        self.sublabel = sublabel.into();
        self
    }
}

/// The full signal path, source to output.
#[derive(Clone, Debug, Default)]
pub struct SignalPath {
    /// Ordered stage nodes; empty when nothing is loaded.
    pub nodes: Vec<SignalPathNode>,
}

/// Human-readable channel layout name.
#[must_use]
pub fn channel_description(channels: usize) -> String {
    match channels {
        1 => String::from("Mono"),
        2 => String::from("Stereo"),
        3 => String::from("3.0"),
        4 => String::from("4.0"),
        6 => String::from("5.1"),
        8 => String::from("7.1"),
        other => format!("{other}ch"),
    }
}
