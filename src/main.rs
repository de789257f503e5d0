//! Command-line player built on the resona engine.
//!
//! This module handles:
//! * Command line argument parsing
//! * Logging configuration
//! * Configuration loading
//! * The main-thread control loop (engine tick + event printing)
//!
//! # Runtime Behavior
//!
//! The binary loads the given files in order, preloading each next
//! track for gapless transitions, and exits when the last one finishes.
//! A `--device ?` listing mirrors what the engine's device layer sees.

use std::{path::PathBuf, process, sync::mpsc, time::Duration};

use clap::{command, Parser, ValueHint};
use log::LevelFilter;

use resona::{
    config::PlayerConfig,
    devices::{CpalEnumerator, DeviceManager},
    engine::{AudioEngine, TICK_INTERVAL},
    error::Result,
    events::{DeviceEvent, EngineEvent},
    output::{cpal::CpalOutput, AudioOutput},
};

/// Build profile indicator for logging.
///
/// Shows "debug" when built without optimizations.
#[cfg(debug_assertions)]
const BUILD_PROFILE: &str = "debug";

/// Build profile indicator for logging.
///
/// Shows "release" when built with optimizations.
#[cfg(not(debug_assertions))]
const BUILD_PROFILE: &str = "release";

/// Group name for mutually exclusive logging options.
const ARGS_GROUP_LOGGING: &str = "logging";

/// Command line arguments as parsed by `clap`.
///
/// All options can be set via environment variables with the `RESONA_`
/// prefix.
#[derive(Clone, Debug, Default, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Audio files to play, in order
    #[arg(value_name = "FILE", value_hint = ValueHint::FilePath, required_unless_present = "list_devices")]
    files: Vec<PathBuf>,

    /// Path to the player configuration file
    #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath, env = "RESONA_CONFIG")]
    config: Option<PathBuf>,

    /// Select the output device by number (see --list-devices)
    ///
    /// If omitted, uses the system default output device.
    #[arg(short, long, env = "RESONA_DEVICE")]
    device: Option<u32>,

    /// List available output devices and exit
    #[arg(long, default_value_t = false)]
    list_devices: bool,

    /// Crossfade duration in milliseconds (0 = gapless without fade)
    #[arg(long, env = "RESONA_CROSSFADE_MS")]
    crossfade_ms: Option<u32>,

    /// Suppress all output except warnings and errors
    #[arg(short, long, default_value_t = false, group = ARGS_GROUP_LOGGING, env = "RESONA_QUIET")]
    quiet: bool,

    /// Enable verbose logging
    ///
    /// Use -v for debug logging
    /// Use -vv for trace logging
    #[arg(short, long, action = clap::ArgAction::Count, group = ARGS_GROUP_LOGGING, env = "RESONA_VERBOSE")]
    verbose: u8,
}

/// Initialize logging system.
///
/// Configures logging based on command line arguments and environment:
/// * `-q` sets Warning level
/// * `-v` sets Debug level
/// * `-vv` sets Trace level
/// * `RUST_LOG` environment variable provides defaults
/// * External crates are limited to Error level unless tracing
fn init_logger(args: &Args) {
    let mut logger = env_logger::Builder::from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    let mut external_level = LevelFilter::Error;
    if args.quiet || args.verbose > 0 {
        let level = match args.verbose {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Debug,
            _ => LevelFilter::max(),
        };

        logger.filter_module(module_path!(), level);
        logger.filter_module("resona", level);

        if level == LevelFilter::Trace {
            external_level = LevelFilter::max();
        }
    }

    for external_module in [
        "cpal",
        "symphonia",
        "symphonia_bundle_flac",
        "symphonia_bundle_mp3",
        "symphonia_codec_aac",
        "symphonia_codec_alac",
        "symphonia_codec_pcm",
        "symphonia_codec_vorbis",
        "symphonia_core",
        "symphonia_format_isomp4",
        "symphonia_format_ogg",
        "symphonia_format_riff",
        "symphonia_metadata",
        "symphonia_utils_xiph",
    ] {
        logger.filter_module(external_module, external_level);
    }

    logger.init();
}

fn main() {
    let args = Args::parse();
    init_logger(&args);

    log::info!(
        "{} {} ({BUILD_PROFILE})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
    );

    if let Err(e) = run(&args) {
        log::error!("{e}");
        process::exit(1);
    }
}

fn run(args: &Args) -> Result<()> {
    let output = CpalOutput::new();

    if args.list_devices {
        for device in output.enumerate_devices() {
            println!(
                "{}: {}{}",
                device.device_id,
                device.name,
                if device.is_default { " (default)" } else { "" },
            );
        }
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => PlayerConfig::load(path)?,
        None => PlayerConfig::default(),
    };
    if let Some(ms) = args.crossfade_ms {
        config.gapless.crossfade_ms = ms;
    }

    let (event_tx, event_rx) = mpsc::channel();
    let (device_tx, device_rx) = mpsc::channel();

    let _device_manager = DeviceManager::new(std::sync::Arc::new(CpalEnumerator), device_tx);

    let mut engine = AudioEngine::new(Box::new(output), config, event_tx);
    if let Some(device_id) = args.device {
        engine.set_output_device(device_id)?;
    }

    let mut queue = args.files.iter();
    let Some(first) = queue.next() else {
        return Ok(());
    };

    engine.load(first)?;
    engine.play()?;

    let mut next = queue.next();
    if let Some(path) = next {
        engine.prepare_next_track(path);
    }

    loop {
        engine.tick();

        let mut finished = false;
        while let Ok(event) = event_rx.try_recv() {
            match event {
                EngineEvent::PositionChanged(_) => {}
                EngineEvent::GaplessTransitionOccurred => {
                    log::info!("gapless transition");
                    // Arm the following track, if any.
                    next = queue.next();
                    if let Some(path) = next {
                        engine.prepare_next_track(path);
                    }
                }
                EngineEvent::PlaybackFinished => {
                    // No preloaded next track matched: advance manually.
                    if let Some(path) = next.take() {
                        engine.load(path)?;
                        engine.play()?;
                        next = queue.next();
                        if let Some(upcoming) = next {
                            engine.prepare_next_track(upcoming);
                        }
                    } else {
                        finished = true;
                    }
                }
                EngineEvent::ErrorOccurred(message) => {
                    log::error!("{message}");
                    finished = true;
                }
                other => log::debug!("{other:?}"),
            }
        }

        while let Ok(event) = device_rx.try_recv() {
            match event {
                DeviceEvent::DeviceError(message) => log::warn!("device error: {message}"),
                other => log::debug!("{other:?}"),
            }
        }

        if finished {
            break;
        }
        std::thread::sleep(TICK_INTERVAL.min(Duration::from_millis(50)));
    }

    Ok(())
}
