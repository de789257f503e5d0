//! Events emitted by the playback core and the device manager.
//!
//! The real-time audio thread never emits events directly: it raises
//! atomic flags that [`AudioEngine::tick`](crate::engine::AudioEngine::tick)
//! polls on the main thread, which then sends the corresponding
//! [`EngineEvent`]. Device events are produced by the
//! [`DeviceManager`](crate::devices::DeviceManager) polling thread.
//!
//! # Example
//!
//! ```rust
//! use resona::events::EngineEvent;
//!
//! fn handle_event(event: &EngineEvent) {
//!     match event {
//!         EngineEvent::PlaybackFinished => println!("end of queue"),
//!         EngineEvent::PositionChanged(secs) => println!("at {secs:.1}s"),
//!         _ => {}
//!     }
//! }
//! ```

use crate::engine::EngineState;

/// Events emitted by the [`AudioEngine`](crate::engine::AudioEngine).
#[derive(Clone, Debug, PartialEq)]
pub enum EngineEvent {
    /// The engine state machine transitioned.
    StateChanged(EngineState),

    /// Playback position advanced, in seconds. Emitted from `tick()` at
    /// roughly the polling interval while playing.
    PositionChanged(f64),

    /// The duration of the current stream changed, in seconds. Emitted on
    /// load and after gapless transitions.
    DurationChanged(f64),

    /// The current track reached end-of-stream with no next track queued.
    PlaybackFinished,

    /// A non-recoverable error occurred; playback has stopped.
    ErrorOccurred(String),

    /// The active signal path changed (source, DSP configuration or
    /// output format). UI layers re-query
    /// [`AudioEngine::signal_path`](crate::engine::AudioEngine::signal_path).
    SignalPathChanged,

    /// A gapless or crossfade transition to the prepared next track
    /// completed inside the render callback.
    GaplessTransitionOccurred,
}

/// Events emitted by the [`DeviceManager`](crate::devices::DeviceManager).
#[derive(Clone, Debug, PartialEq)]
pub enum DeviceEvent {
    /// The set of output devices changed.
    ListChanged,

    /// The system default output device changed to the named device.
    DefaultDeviceChanged(String),

    /// A specific device appeared.
    DeviceConnected {
        /// Stable name reported by the audio host.
        name: String,
    },

    /// A specific device disappeared.
    DeviceDisconnected {
        /// Stable name reported by the audio host.
        name: String,
    },

    /// The requested buffer size was applied, with the confirmed frame
    /// count reported by the driver.
    BufferSizeChanged(u32),

    /// Device enumeration or configuration failed.
    DeviceError(String),
}
