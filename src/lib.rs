//! High-fidelity gapless audio playback engine.
//!
//! **resona** is the real-time playback core of a desktop music player:
//! it turns compressed and uncompressed audio files (FLAC, ALAC, WAV,
//! MP3, AAC, Ogg and the DSD containers DSF/DFF) into a bit-accurate
//! sample stream delivered to an operating-system audio output, with
//! optional DSP, sample-rate conversion, gapless/crossfade transitions
//! and DSD-over-PCM (DoP) encoding.
//!
//! # Core Features
//!
//! * **Unified decoding**: one interface over a general PCM decoder and
//!   a specialised DSD decoder with FIR decimation and DoP modes
//! * **Render chain**: upsampling, headroom, crossfeed, convolution,
//!   HRTF, parametric EQ, volume levelling and a soft peak limiter
//! * **Gapless playback**: preloaded next track with lock-free swap or
//!   equal-power crossfade inside the real-time callback
//! * **Device control**: pull-callback output driver with format/rate
//!   negotiation and hotplug-aware device management
//!
//! # Architecture
//!
//! The library is organized into several key modules:
//!
//! * **Decoding**
//!   - [`decoder`]: PCM and DSD decoders behind one sum type
//!   - [`track`]: track metadata and source classification
//!
//! * **Signal Processing**
//!   - [`dsp`]: the individual DSP stages
//!   - [`chain`]: their fixed-order composition
//!
//! * **Playback**
//!   - [`engine`]: the orchestrator and real-time render path
//!   - [`gapless`]: next-track preload, swap and crossfade
//!
//! * **Platform**
//!   - [`output`]: the audio-output boundary and its drivers
//!   - [`devices`]: device enumeration and hotplug events
//!
//! * **Support**
//!   - [`config`]: the persisted settings the core reads
//!   - [`events`]: engine and device event types
//!   - [`signal_path`]: pipeline reporting for UIs
//!   - [`error`]: error types and handling
//!   - [`util`]: general helpers
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::mpsc;
//!
//! use resona::{
//!     config::PlayerConfig,
//!     engine::AudioEngine,
//!     output::cpal::CpalOutput,
//! };
//!
//! fn example() -> resona::error::Result<()> {
//!     let (event_tx, event_rx) = mpsc::channel();
//!     let output = Box::new(CpalOutput::new());
//!     let mut engine = AudioEngine::new(output, PlayerConfig::default(), event_tx);
//!
//!     engine.load(std::path::Path::new("album/track01.flac"))?;
//!     engine.play()?;
//!
//!     loop {
//!         engine.tick();
//!         while let Ok(event) = event_rx.try_recv() {
//!             println!("{event:?}");
//!         }
//!         std::thread::sleep(resona::engine::TICK_INTERVAL);
//!     }
//! }
//! ```
//!
//! # Concurrency
//!
//! The control plane is plain synchronous code on the caller's thread.
//! The real-time render callback runs on the OS audio thread, never
//! blocks (try-lock only) and never allocates; it communicates back
//! through atomic flags polled by [`engine::AudioEngine::tick`].
//!
//! # Error Handling
//!
//! Errors are handled through the types in the [`error`] module, with
//! most functions returning [`Result`](error::Result).

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![doc(test(attr(ignore)))]

#[macro_use]
extern crate log;

pub mod chain;
pub mod config;
pub mod decoder;
pub mod devices;
pub mod dsp;
pub mod engine;
pub mod error;
pub mod events;
pub mod gapless;
pub mod output;
pub mod signal_path;
pub mod track;
pub mod util;

pub use engine::{AudioEngine, EngineState};
