//! The playback engine.
//!
//! Orchestrates decoders, the DSP chain, the upsampler, the gapless
//! manager and the output driver. Construction is dependency-injected:
//! the engine owns nothing it didn't receive — the output driver, the
//! settings snapshot and the event channel all come in through
//! [`AudioEngine::new`].
//!
//! # Threading
//!
//! Two threads cooperate:
//! * The **main thread** calls every public method. It may block on the
//!   slot mutex; opens, seeks and stops complete between render cycles
//!   in practice.
//! * The **real-time audio thread** runs [`render`](EngineShared::render)
//!   through the output driver's callback. It only ever try-locks the
//!   slot mutex (silence on contention), performs no heap allocation
//!   (all buffers are sized during `load`), and reports nothing inline:
//!   end-of-stream and gapless transitions raise atomic flags that
//!   [`AudioEngine::tick`] polls at ~50 ms and converts into events.
//!
//! Atomic ordering follows a single-writer pattern: the writer stores
//! with release, the reader loads with acquire (`destroyed`,
//! `shutting_down`, `rt_gapless`, `rt_playback_end`); counters and mode
//! mirrors use relaxed ordering.

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering},
        mpsc::Sender,
        Arc, Mutex,
    },
    time::Duration,
};

use crate::{
    chain::RenderChain,
    config::{DsdPlaybackMode, PlayerConfig},
    decoder::{Decoder, DsdDecoder, DsdMode, PcmDecoder, StreamFormat},
    dsp::convolution::{ConvolutionProcessor, ImpulseResponse},
    dsp::crossfeed::CrossfeedLevel,
    dsp::equalizer::{EqBandConfig, EqPhaseMode},
    dsp::gain::{HeadroomGain, HeadroomMode, LevelingGain},
    dsp::upsampler::{Upsampler, UpsamplingFilter, UpsamplingMode, UpsamplingQuality},
    dsp::DspStage,
    error::{Error, Result},
    events::EngineEvent,
    gapless::GaplessManager,
    output::AudioOutput,
    signal_path::{channel_description, SignalPath, SignalPathNode, SignalQuality},
    track::{self, SourceKind, TrackMeta},
    util::ratio_to_db,
};

/// Interval the host should drive [`AudioEngine::tick`] at.
pub const TICK_INTERVAL: Duration = Duration::from_millis(50);

/// Widest render callback the scratch buffers are sized for.
const MAX_CALLBACK_FRAMES: usize = 16_384;

/// How long the destructor waits for an in-flight render callback.
const SHUTDOWN_DRAIN: Duration = Duration::from_millis(500);

/// Engine state machine.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum EngineState {
    /// Nothing loaded or playback stopped.
    #[default]
    Stopped,
    /// The output stream is pulling audio.
    Playing,
    /// A track is loaded but the stream is stopped.
    Paused,
}

/// Everything the slot mutex protects: both decoder slots (current
/// here, next inside the gapless manager), the render chain, the
/// upsampler and the pre-sized decode scratch.
struct Slots {
    current: Option<Decoder>,
    gapless: GaplessManager,
    chain: RenderChain,
    upsampler: Upsampler,
    decode_buf: Vec<f32>,
}

/// State shared between the main thread and the render callback.
struct EngineShared {
    slots: Mutex<Slots>,

    /// Guarded separately so UI path queries never contend on the
    /// decoder mutex.
    file_path: Mutex<Option<PathBuf>>,

    sample_rate_bits: AtomicU64,
    duration_bits: AtomicU64,
    channels: AtomicUsize,
    frames_rendered: AtomicI64,

    destroyed: AtomicBool,
    shutting_down: AtomicBool,
    rendering_in_progress: AtomicBool,
    rt_gapless_flag: AtomicBool,
    rt_playback_end_flag: AtomicBool,

    using_dsd: AtomicBool,
    dop_mode: AtomicBool,
    bit_perfect: AtomicBool,

    /// Render cycles that found the slot mutex contended and emitted
    /// silence instead of waiting. Diagnostic for the RT-non-blocking
    /// guarantee.
    render_lock_misses: AtomicU64,

    /// Generation counters for background filter loads: a worker only
    /// installs its result if no newer request superseded it while it
    /// was parsing.
    ir_load_generation: AtomicU64,
    sofa_load_generation: AtomicU64,
}

impl EngineShared {
    fn sample_rate(&self) -> f64 {
        f64::from_bits(self.sample_rate_bits.load(Ordering::Relaxed))
    }

    fn set_sample_rate(&self, rate: f64) {
        self.sample_rate_bits.store(rate.to_bits(), Ordering::Relaxed);
    }

    fn duration(&self) -> f64 {
        f64::from_bits(self.duration_bits.load(Ordering::Relaxed))
    }

    fn set_duration(&self, secs: f64) {
        self.duration_bits.store(secs.to_bits(), Ordering::Relaxed);
    }

    /// Adopts a newly-current stream's format after a render-thread
    /// swap. The caller holds the slot mutex; `using_dsd` is written
    /// last so readers never observe a half-updated stream.
    fn adopt_format(&self, format: &StreamFormat, is_dsd: bool, is_dop: bool, path: &Path) {
        self.set_duration(format.duration_secs);
        self.set_sample_rate(format.sample_rate);
        self.channels.store(format.channels, Ordering::Relaxed);
        self.dop_mode.store(is_dop, Ordering::Relaxed);
        self.using_dsd.store(is_dsd, Ordering::Relaxed);

        // Never block the render thread on the path mutex.
        if let Ok(mut guard) = self.file_path.try_lock() {
            *guard = Some(path.to_path_buf());
        }
    }

    /// The render callback. Invoked by the output driver on the OS
    /// audio thread; follows spec'd order: silence fast-paths, try-lock,
    /// decode (through the upsampler when active), crossfade/gapless
    /// handling, DSP chain, atomics.
    fn render(&self, buf: &mut [f32], max_frames: usize) -> usize {
        let channels = self.channels.load(Ordering::Relaxed).max(1);
        let samples = (max_frames * channels).min(buf.len());

        if self.destroyed.load(Ordering::Acquire) || self.shutting_down.load(Ordering::Acquire) {
            buf[..samples].fill(0.0);
            return 0;
        }

        self.rendering_in_progress.store(true, Ordering::Release);

        let Ok(mut slots) = self.slots.try_lock() else {
            // Main thread is loading/seeking/stopping: silence this cycle.
            self.render_lock_misses.fetch_add(1, Ordering::Relaxed);
            buf[..samples].fill(0.0);
            self.rendering_in_progress.store(false, Ordering::Release);
            return 0;
        };
        let slots = &mut *slots;

        let bit_perfect = self.bit_perfect.load(Ordering::Relaxed);
        let using_dsd = self.using_dsd.load(Ordering::Relaxed);
        let dop = self.dop_mode.load(Ordering::Relaxed);
        let upsampler_active = slots.upsampler.is_active() && !bit_perfect && !using_dsd;

        let mut frames_read;
        let mut crossfade_handled_frames = false;

        if upsampler_active {
            // The driver requests frames at the OUTPUT rate; decode the
            // matching number of SOURCE frames into the scratch.
            let ratio = f64::from(slots.upsampler.output_sample_rate())
                / f64::from(slots.upsampler.input_sample_rate().max(1));
            let mut source_frames = (max_frames as f64 / ratio).ceil() as usize;
            let capacity = slots.decode_buf.len() / channels;
            source_frames = source_frames.min(capacity);
            if source_frames == 0 {
                buf[..samples].fill(0.0);
                self.rendering_in_progress.store(false, Ordering::Release);
                return 0;
            }

            frames_read = match slots.current.as_mut() {
                Some(decoder) => decoder.read(&mut slots.decode_buf, source_frames),
                None => 0,
            };

            if frames_read > 0 {
                let generated = slots.upsampler.process_upsampling(
                    &slots.decode_buf,
                    frames_read,
                    channels,
                    buf,
                    max_frames,
                );
                if generated < max_frames {
                    buf[generated * channels..samples].fill(0.0);
                }

                slots
                    .chain
                    .process(buf, generated, channels, bit_perfect, false);

                // Position tracks SOURCE frames, not output frames.
                self.frames_rendered
                    .fetch_add(frames_read as i64, Ordering::Relaxed);
                self.rendering_in_progress.store(false, Ordering::Release);
                return generated;
            }
        } else {
            frames_read = match slots.current.as_mut() {
                Some(decoder) => decoder.read(buf, max_frames),
                None => {
                    self.rendering_in_progress.store(false, Ordering::Release);
                    return 0;
                }
            };

            // Crossfade mixing happens before any DSP, PCM only.
            if !using_dsd {
                let rate = self.sample_rate();
                let total_frames = (self.duration() * rate) as i64;
                let rendered = self.frames_rendered.load(Ordering::Relaxed);

                if frames_read > 0
                    && slots
                        .gapless
                        .should_start_crossfade(rendered, total_frames, rate)
                {
                    let crossfade_frames = slots.gapless.crossfade_frames(rate);
                    slots
                        .gapless
                        .start_crossfade(rendered, total_frames, crossfade_frames);
                }

                if slots.gapless.is_crossfading() {
                    crossfade_handled_frames = true;
                    let outgoing = frames_read;
                    frames_read = slots
                        .gapless
                        .mix_incoming(buf, outgoing, max_frames, channels);
                    if outgoing > 0 {
                        // These frames advanced the outgoing track.
                        self.frames_rendered
                            .fetch_add(frames_read as i64, Ordering::Relaxed);
                    }

                    if slots.gapless.crossfade_complete() {
                        // The incoming stream has been playing for the
                        // whole fade; that is its current position.
                        let progress = slots.gapless.crossfade_progress();
                        if let Some(result) = slots.gapless.swap_to_current(&mut slots.current) {
                            let is_dsd = slots.current.as_ref().is_some_and(Decoder::is_dsd);
                            let is_dop =
                                slots.current.as_ref().is_some_and(Decoder::is_dop_mode);
                            self.adopt_format(&result.format, is_dsd, is_dop, &result.path);
                            self.frames_rendered.store(progress, Ordering::Relaxed);
                            self.rt_gapless_flag.store(true, Ordering::Release);
                        }
                    }
                }
            }

            slots.chain.process(buf, frames_read, channels, bit_perfect, dop);
        }

        if !crossfade_handled_frames {
            self.frames_rendered
                .fetch_add(frames_read as i64, Ordering::Relaxed);
        }

        if frames_read == 0 && !slots.gapless.is_crossfading() {
            if slots.gapless.is_next_ready() {
                // Gapless swap at end of stream: promote the next slot
                // and fill the rest of this buffer from the new stream.
                if let Some(result) = slots.gapless.swap_to_current(&mut slots.current) {
                    let is_dsd = slots.current.as_ref().is_some_and(Decoder::is_dsd);
                    let is_dop = slots.current.as_ref().is_some_and(Decoder::is_dop_mode);
                    self.adopt_format(&result.format, is_dsd, is_dop, &result.path);
                    self.frames_rendered.store(0, Ordering::Relaxed);

                    // Fill the rest of this buffer from the new stream,
                    // through the upsampler when it is driving the rate.
                    let new_frames = if upsampler_active {
                        let ratio = f64::from(slots.upsampler.output_sample_rate())
                            / f64::from(slots.upsampler.input_sample_rate().max(1));
                        let source_frames = ((max_frames as f64 / ratio).ceil() as usize)
                            .min(slots.decode_buf.len() / channels);
                        let source_read = match slots.current.as_mut() {
                            Some(decoder) if source_frames > 0 => {
                                decoder.read(&mut slots.decode_buf, source_frames)
                            }
                            _ => 0,
                        };
                        let generated = if source_read > 0 {
                            slots.upsampler.process_upsampling(
                                &slots.decode_buf,
                                source_read,
                                channels,
                                buf,
                                max_frames,
                            )
                        } else {
                            0
                        };
                        slots
                            .chain
                            .process(buf, generated, channels, bit_perfect, is_dop);
                        self.frames_rendered
                            .fetch_add(source_read as i64, Ordering::Relaxed);
                        generated
                    } else {
                        let read = match slots.current.as_mut() {
                            Some(decoder) => decoder.read(buf, max_frames),
                            None => 0,
                        };
                        slots
                            .chain
                            .process(buf, read, channels, bit_perfect, is_dop);
                        self.frames_rendered
                            .fetch_add(read as i64, Ordering::Relaxed);
                        read
                    };

                    self.rt_gapless_flag.store(true, Ordering::Release);
                    self.rendering_in_progress.store(false, Ordering::Release);
                    return new_frames;
                }
            }

            self.rt_playback_end_flag.store(true, Ordering::Release);
        }

        self.rendering_in_progress.store(false, Ordering::Release);
        frames_read
    }
}

/// The top-level playback orchestrator.
pub struct AudioEngine {
    shared: Arc<EngineShared>,
    output: Box<dyn AudioOutput>,
    event_tx: Sender<EngineEvent>,
    config: PlayerConfig,
    state: EngineState,
    current_device_id: u32,
    current_track: TrackMeta,
    headroom: HeadroomGain,
    leveling: LevelingGain,
}

impl AudioEngine {
    /// Creates an engine from injected collaborators.
    ///
    /// Runs the convolution self-test once (a broken FFT backend must
    /// fail loudly at startup, not corrupt audio later) and applies the
    /// persisted settings to every stage.
    #[must_use]
    pub fn new(
        output: Box<dyn AudioOutput>,
        config: PlayerConfig,
        event_tx: Sender<EngineEvent>,
    ) -> Self {
        ConvolutionProcessor::self_test();

        let shared = Arc::new(EngineShared {
            slots: Mutex::new(Slots {
                current: None,
                gapless: GaplessManager::new(),
                chain: RenderChain::new(),
                upsampler: Upsampler::new(),
                decode_buf: Vec::new(),
            }),
            file_path: Mutex::new(None),
            sample_rate_bits: AtomicU64::new(44_100.0_f64.to_bits()),
            duration_bits: AtomicU64::new(0.0_f64.to_bits()),
            channels: AtomicUsize::new(2),
            frames_rendered: AtomicI64::new(0),
            destroyed: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            rendering_in_progress: AtomicBool::new(false),
            rt_gapless_flag: AtomicBool::new(false),
            rt_playback_end_flag: AtomicBool::new(false),
            using_dsd: AtomicBool::new(false),
            dop_mode: AtomicBool::new(false),
            bit_perfect: AtomicBool::new(config.bit_perfect),
            render_lock_misses: AtomicU64::new(0),
            ir_load_generation: AtomicU64::new(0),
            sofa_load_generation: AtomicU64::new(0),
        });

        let mut engine = Self {
            shared,
            output,
            event_tx,
            config,
            state: EngineState::Stopped,
            current_device_id: 0,
            current_track: TrackMeta::default(),
            headroom: HeadroomGain::new(),
            leveling: LevelingGain::new(),
        };
        engine.apply_config();
        engine
    }

    /// Applies the persisted settings snapshot to every stage.
    fn apply_config(&mut self) {
        self.output.set_bit_perfect_mode(self.config.bit_perfect);
        self.output.set_volume(self.config.volume);
        if self.config.exclusive_mode {
            self.output.set_hog_mode(true);
        }
        if let Some(frames) = self.config.buffer_size {
            let _ = self.output.set_buffer_size(frames);
        }

        self.headroom.set_mode(self.config.headroom.mode);
        self.headroom.set_manual_db(self.config.headroom.manual_db);
        self.leveling.apply_config(&self.config.leveling);

        let max_rate = self.output.max_sample_rate(self.current_device_id) as u32;
        let mut slots = self.lock_slots();
        slots.upsampler.set_max_dac_rate(max_rate);
        slots.upsampler.set_mode(self.config.upsampling.mode);
        slots.upsampler.set_quality(self.config.upsampling.quality);
        slots.upsampler.set_filter(self.config.upsampling.filter);
        slots.upsampler.set_fixed_rate(self.config.upsampling.fixed_rate);
        if self.config.upsampling.enabled {
            slots.upsampler.set_enabled(true);
        }

        slots
            .chain
            .crossfeed_mut()
            .set_level(CrossfeedLevel::from_index(self.config.crossfeed.level));
        slots
            .chain
            .crossfeed_mut()
            .set_enabled(self.config.crossfeed.enabled);

        slots
            .chain
            .convolution_mut()
            .set_enabled(self.config.convolution.enabled);

        slots.chain.hrtf_mut().set_enabled(self.config.hrtf.enabled);
        slots
            .chain
            .hrtf_mut()
            .set_speaker_angle(self.config.hrtf.speaker_angle);

        let eq = slots.chain.equalizer_mut();
        eq.begin_batch_update();
        eq.set_bands(&self.config.eq.bands);
        eq.set_preamp_db(self.config.eq.preamp_db);
        eq.end_batch_update();
        eq.set_enabled(self.config.eq.enabled && self.config.dsp_enabled);

        slots.gapless.set_gapless_enabled(self.config.gapless.enabled);
        slots.gapless.set_crossfade_ms(self.config.gapless.crossfade_ms);
        drop(slots);

        // IR and SOFA parsing can take a while; load off-thread and
        // install under the lock once parsed.
        if self.config.convolution.enabled {
            if let Some(path) = self.config.convolution.ir_path.clone() {
                self.load_impulse_response_async(path);
            }
        }
        if self.config.hrtf.enabled {
            if let Some(path) = self.config.hrtf.sofa_path.clone() {
                self.load_sofa_async(path);
            }
        }

        self.update_headroom_gain();
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, Slots> {
        self.shared
            .slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn notify(&self, event: EngineEvent) {
        if let Err(e) = self.event_tx.send(event) {
            debug!("event receiver gone: {e}");
        }
    }

    // ── transport ────────────────────────────────────────────────────

    /// Loads a file, configures the pipeline for its format and opens
    /// the output device.
    ///
    /// # Errors
    ///
    /// Returns the pre-flight kinds (`FileNotFound`, `FileUnreadable`,
    /// `FileEmpty`), `DecoderOpenFailed`, or `DeviceOpenFailed` after
    /// default-device fallback also fails. Every error is also emitted
    /// as [`EngineEvent::ErrorOccurred`].
    pub fn load(&mut self, path: &Path) -> Result<()> {
        info!("loading {}", path.display());

        if let Err(e) = track::preflight(path) {
            self.notify(EngineEvent::ErrorOccurred(e.to_string()));
            return Err(e);
        }

        self.stop();

        let mut slots = self.lock_slots();
        slots.current = None;

        // A preload with a mismatched format keeps its decoder open
        // exactly so this load can adopt it instead of re-opening.
        let reused = slots.gapless.take_prepared(path);

        let (decoder, format) = match reused {
            Some((decoder, format)) => {
                debug!("adopting preloaded decoder for {}", path.display());
                (decoder, format)
            }
            None => {
                let opened = self.open_decoder(path);
                match opened {
                    Ok(pair) => pair,
                    Err(e) => {
                        drop(slots);
                        self.notify(EngineEvent::ErrorOccurred(e.to_string()));
                        return Err(e);
                    }
                }
            }
        };

        let is_dsd = decoder.is_dsd();
        let is_dop = decoder.is_dop_mode();
        let is_lossless = decoder.is_lossless();

        self.shared.set_sample_rate(format.sample_rate);
        self.shared.set_duration(format.duration_secs);
        self.shared.channels.store(format.channels, Ordering::Relaxed);
        self.shared.dop_mode.store(is_dop, Ordering::Relaxed);
        self.shared.using_dsd.store(is_dsd, Ordering::Relaxed);
        self.shared.frames_rendered.store(0, Ordering::Relaxed);

        // Auto sample rate: lossless sources get the device's nearest
        // supported rate; lossy codecs are left alone.
        let mut auto_target_rate = 0.0;
        if self.config.auto_sample_rate && !is_dsd && is_lossless {
            auto_target_rate = self
                .output
                .nearest_supported_rate(format.sample_rate, self.current_device_id);
            if (auto_target_rate - format.sample_rate).abs() > 0.5 {
                debug!(
                    "auto rate: {} Hz unsupported, nearest {} Hz",
                    format.sample_rate, auto_target_rate,
                );
            }
        }

        // Configure the upsampler against the source format; DoP has
        // its own rate and bypasses it entirely.
        let mut output_format = format;
        if !is_dsd && !self.config.bit_perfect && slots.upsampler.is_enabled() {
            let built_in = self.output.is_built_in_device(self.current_device_id);
            let mut device_rate = self.output.max_sample_rate(self.current_device_id);
            if built_in {
                let nominal = self.output.device_nominal_sample_rate();
                if nominal > 0.0 {
                    device_rate = nominal;
                }
            }
            if auto_target_rate > 0.0 {
                // The device will sit at the source rate; upsampling
                // becomes a no-op rather than fighting the auto switch.
                device_rate = auto_target_rate;
            }
            slots.upsampler.set_device_is_built_in(built_in);
            slots.upsampler.set_max_dac_rate(device_rate as u32);
            slots
                .upsampler
                .set_input_format(format.sample_rate as u32, format.channels);
            if slots.upsampler.is_active() {
                output_format.sample_rate = f64::from(slots.upsampler.output_sample_rate());
                debug!(
                    "upsampling {} -> {} Hz",
                    format.sample_rate, output_format.sample_rate,
                );
            }
        }

        if auto_target_rate > 0.0 && (output_format.sample_rate - auto_target_rate).abs() > 0.5 {
            output_format.sample_rate = auto_target_rate;
        }

        // Pre-size the decode scratch for the worst-case ratio between
        // output and source frames; the render callback never allocates.
        {
            let ratio = if output_format.sample_rate > format.sample_rate {
                output_format.sample_rate / format.sample_rate
            } else {
                1.0
            };
            let max_source_frames = (MAX_CALLBACK_FRAMES as f64 / ratio).ceil() as usize + 64;
            slots.decode_buf.resize(max_source_frames * format.channels, 0.0);
        }
        slots.gapless.preallocate_crossfade_buffer(format.channels);

        // The DSP chain runs at the (possibly upsampled) output rate.
        slots
            .chain
            .prepare(output_format.sample_rate, format.channels);

        // Latency-bearing stages shift the crossfade window so the
        // blend stays aligned at the output.
        let chain_latency = slots.chain.latency_frames();
        slots.gapless.set_output_latency(chain_latency);

        slots.current = Some(decoder);
        drop(slots);

        // Hand the output its callback before opening so a hot start
        // never races an empty callback slot.
        let shared = Arc::clone(&self.shared);
        self.output
            .set_render_callback(Some(Box::new(move |buf, frames| {
                shared.render(buf, frames)
            })));
        self.output.set_dop_passthrough(is_dop);
        self.output.set_volume(self.config.volume);

        if let Err(primary) = self.output.open(&output_format, self.current_device_id) {
            // Requested device failed: fall back to the default device.
            if self.current_device_id != 0 {
                warn!(
                    "device {} failed to open, falling back to default: {primary}",
                    self.current_device_id,
                );
                self.current_device_id = 0;
                if let Err(e) = self.output.open(&output_format, 0) {
                    self.lock_slots().current = None;
                    let error = Error::device_open_failed(format!(
                        "default device also failed: {e}"
                    ));
                    self.notify(EngineEvent::ErrorOccurred(error.to_string()));
                    return Err(error);
                }
            } else {
                self.lock_slots().current = None;
                self.notify(EngineEvent::ErrorOccurred(primary.to_string()));
                return Err(primary);
            }
        }

        {
            let mut guard = self
                .shared
                .file_path
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            *guard = Some(path.to_path_buf());
        }

        self.update_headroom_gain();
        self.update_leveling_gain();

        self.notify(EngineEvent::DurationChanged(self.shared.duration()));
        self.notify(EngineEvent::SignalPathChanged);
        Ok(())
    }

    /// Opens the right decoder for a path, honouring the DSD playback
    /// mode and falling back from DoP to PCM conversion when the device
    /// cannot run at the DoP rate.
    fn open_decoder(&self, path: &Path) -> Result<(Decoder, StreamFormat)> {
        match track::classify(path) {
            SourceKind::Dsd => {
                if self.config.dsd_playback_mode == DsdPlaybackMode::Dop {
                    match DsdDecoder::open(path, DsdMode::Dop, self.config.dsd_output_quality) {
                        Ok(dsd) => {
                            let format = dsd.format();
                            let max_rate = self.output.max_sample_rate(self.current_device_id);
                            if max_rate > 0.0 && format.sample_rate > max_rate {
                                info!(
                                    "DoP needs {} Hz but device max is {} Hz, \
                                     falling back to PCM conversion",
                                    format.sample_rate, max_rate,
                                );
                            } else {
                                return Ok((Decoder::Dsd(dsd), format));
                            }
                        }
                        Err(e) => {
                            // Known-format DSD with failed DoP init:
                            // fall back to PCM silently and log.
                            info!("DoP init failed, falling back to PCM conversion: {e}");
                        }
                    }
                }
                let dsd =
                    DsdDecoder::open(path, DsdMode::PcmConversion, self.config.dsd_output_quality)?;
                let format = dsd.format();
                Ok((Decoder::Dsd(dsd), format))
            }
            SourceKind::Pcm => {
                let pcm = PcmDecoder::open(path)?;
                let format = pcm.format();
                Ok((Decoder::Pcm(pcm), format))
            }
        }
    }

    /// Starts or resumes playback.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` when no source is open, or the output's
    /// start error.
    pub fn play(&mut self) -> Result<()> {
        if self.state == EngineState::Playing {
            return Ok(());
        }
        if self.lock_slots().current.is_none() {
            return Err(Error::unavailable("no source open"));
        }

        self.output.start()?;
        self.state = EngineState::Playing;
        self.notify(EngineEvent::StateChanged(self.state));
        self.notify(EngineEvent::SignalPathChanged);
        Ok(())
    }

    /// Pauses playback, keeping the source open and positioned.
    pub fn pause(&mut self) {
        if self.state != EngineState::Playing {
            return;
        }
        self.output.stop();
        self.state = EngineState::Paused;
        self.notify(EngineEvent::StateChanged(self.state));
    }

    /// Stops playback and closes every decoder. Idempotent; gated by
    /// `shutting_down` so a concurrent end-of-stream cannot re-enter
    /// the render path mid-teardown.
    pub fn stop(&mut self) {
        self.shared.shutting_down.store(true, Ordering::Release);

        // The render callback must stop touching decoders first.
        self.output.set_render_callback(None);
        self.output.stop();
        self.output.close();

        {
            let mut slots = self.lock_slots();
            slots.current = None;
            slots.gapless.reset();
            slots.chain.reset();
        }
        self.shared.using_dsd.store(false, Ordering::Relaxed);
        self.shared.dop_mode.store(false, Ordering::Relaxed);
        self.shared.frames_rendered.store(0, Ordering::Relaxed);
        {
            let mut guard = self
                .shared
                .file_path
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            *guard = None;
        }
        self.state = EngineState::Stopped;

        self.shared.shutting_down.store(false, Ordering::Release);
        self.notify(EngineEvent::StateChanged(self.state));
        self.notify(EngineEvent::SignalPathChanged);
    }

    /// Seeks to a position in seconds.
    ///
    /// # Errors
    ///
    /// Returns `SeekFailed` for invalid positions; playback position is
    /// unchanged in that case.
    pub fn seek(&mut self, secs: f64) -> Result<()> {
        let mut slots = self.lock_slots();
        let Some(decoder) = slots.current.as_mut() else {
            return Err(Error::unavailable("no source open"));
        };
        decoder.seek(secs)?;
        drop(slots);

        self.shared
            .frames_rendered
            .store((secs * self.shared.sample_rate()) as i64, Ordering::Relaxed);
        self.notify(EngineEvent::PositionChanged(secs));
        Ok(())
    }

    /// Current playback position in seconds.
    #[must_use]
    pub fn position(&self) -> f64 {
        let rate = self.shared.sample_rate();
        if rate <= 0.0 {
            return 0.0;
        }
        self.shared.frames_rendered.load(Ordering::Relaxed) as f64 / rate
    }

    /// Duration of the current stream in seconds.
    #[must_use]
    pub fn duration(&self) -> f64 {
        self.shared.duration()
    }

    /// Current engine state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Whether the output stream is actively pulling audio.
    #[must_use]
    pub fn is_output_running(&self) -> bool {
        self.output.is_running()
    }

    /// Path of the current file, if one is loaded.
    #[must_use]
    pub fn current_file(&self) -> Option<PathBuf> {
        self.shared
            .file_path
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Main-thread poll: converts the render thread's atomic flags into
    /// events. Drive this at [`TICK_INTERVAL`]; the render thread never
    /// signals the UI directly.
    pub fn tick(&mut self) {
        if self.shared.rt_gapless_flag.swap(false, Ordering::AcqRel) {
            self.notify(EngineEvent::DurationChanged(self.shared.duration()));
            self.notify(EngineEvent::GaplessTransitionOccurred);
        }

        if self.output.device_lost() {
            error!("output device lost during playback");
            self.stop();
            self.notify(EngineEvent::ErrorOccurred(String::from(
                "audio output device lost",
            )));
            return;
        }

        if self
            .shared
            .rt_playback_end_flag
            .swap(false, Ordering::AcqRel)
        {
            self.output.stop();
            self.state = EngineState::Stopped;
            self.notify(EngineEvent::PlaybackFinished);
            return;
        }

        if self.state == EngineState::Playing {
            self.notify(EngineEvent::PositionChanged(self.position()));
        }
    }

    /// Renders directly through the engine's callback path. This is the
    /// same function the output driver pulls; exposed for headless
    /// hosts and tests.
    pub fn render_audio(&self, buf: &mut [f32], max_frames: usize) -> usize {
        self.shared.render(buf, max_frames)
    }

    /// Returns a `Send` handle onto the render path, equivalent to the
    /// callback the engine installs into its output driver. Lets a
    /// host pull audio from its own thread while the engine stays on
    /// the control thread.
    #[must_use]
    pub fn render_handle(&self) -> RenderHandle {
        RenderHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Render cycles that found the slot mutex contended and produced
    /// silence instead of waiting.
    #[must_use]
    pub fn render_lock_misses(&self) -> u64 {
        self.shared.render_lock_misses.load(Ordering::Relaxed)
    }

    // ── gapless ──────────────────────────────────────────────────────

    /// Preloads the next track for a gapless or crossfade transition.
    pub fn prepare_next_track(&mut self, path: &Path) {
        let max_rate = self.output.max_sample_rate(self.current_device_id);
        let rate = self.shared.sample_rate();
        let channels = self.shared.channels.load(Ordering::Relaxed);
        let using_dsd = self.shared.using_dsd.load(Ordering::Relaxed);

        self.lock_slots().gapless.prepare_next_track(
            path,
            self.config.dsd_playback_mode,
            self.config.dsd_output_quality,
            max_rate,
            rate,
            channels,
            using_dsd,
        );
    }

    /// Cancels a pending next track.
    pub fn cancel_next_track(&mut self) {
        self.lock_slots().gapless.cancel_next_track();
    }

    /// Sets the crossfade duration in milliseconds (0 disables).
    pub fn set_crossfade_duration_ms(&mut self, ms: u32) {
        self.config.gapless.crossfade_ms = ms;
        self.lock_slots().gapless.set_crossfade_ms(ms);
    }

    /// Enables or disables gapless transitions.
    pub fn set_gapless_enabled(&mut self, enabled: bool) {
        self.config.gapless.enabled = enabled;
        self.lock_slots().gapless.set_gapless_enabled(enabled);
    }

    // ── device & format control ──────────────────────────────────────

    /// Sets the device volume (0..1), ramped inside the driver.
    pub fn set_volume(&mut self, volume: f32) {
        self.config.volume = volume.clamp(0.0, 1.0);
        self.output.set_volume(self.config.volume);
    }

    /// Switches the output device, restarting the stream if running.
    ///
    /// # Errors
    ///
    /// Returns the driver's error when the new device rejects the
    /// stream.
    pub fn set_output_device(&mut self, device_id: u32) -> Result<()> {
        let mut device_id = device_id;
        if device_id != 0
            && !self
                .output
                .enumerate_devices()
                .iter()
                .any(|device| device.device_id == device_id)
        {
            warn!("device {device_id} not found, using default");
            device_id = 0;
        }

        if self.output.is_exclusive_mode() {
            self.output.release_hog_mode();
        }

        self.current_device_id = device_id;
        if self.output.is_running() {
            self.output.set_transitioning(true);
            self.output.set_device(device_id)?;
        }

        if self.config.exclusive_mode {
            self.output.set_hog_mode(true);
            self.notify(EngineEvent::SignalPathChanged);
        }

        let max_rate = self.output.max_sample_rate(device_id) as u32;
        self.lock_slots().upsampler.set_max_dac_rate(max_rate);
        Ok(())
    }

    /// Requests a device buffer size in frames.
    ///
    /// # Errors
    ///
    /// Returns the driver's reconfiguration error.
    pub fn set_buffer_size(&mut self, frames: u32) -> Result<()> {
        self.config.buffer_size = Some(frames);
        self.output.set_buffer_size(frames)
    }

    /// Changes the output sample rate, preserving playback position.
    /// The stream is stopped, reconfigured and restarted; there is no
    /// live reconfiguration of an active stream.
    ///
    /// # Errors
    ///
    /// Returns the driver's error when the device rejects the rate.
    pub fn set_sample_rate(&mut self, rate: f64) -> Result<()> {
        if self.state == EngineState::Stopped {
            self.output.set_sample_rate(rate)?;
            self.shared.set_sample_rate(rate);
            return Ok(());
        }

        let position = self.position();
        let was_playing = self.state == EngineState::Playing;

        // Mute the render path while the format changes so stale frames
        // (or stale DoP data) never reach the device mid-switch.
        self.output.set_transitioning(true);
        self.output.stop();
        self.output.set_sample_rate(rate)?;
        self.shared.set_sample_rate(rate);
        {
            let channels = self.shared.channels.load(Ordering::Relaxed);
            self.lock_slots().chain.prepare(rate, channels);
        }

        if was_playing {
            self.output.start()?;
            self.state = EngineState::Playing;
        } else {
            self.state = EngineState::Paused;
        }

        self.shared
            .frames_rendered
            .store((position * rate) as i64, Ordering::Relaxed);
        debug!("sample rate changed to {rate} Hz, resumed at {position:.2}s");
        Ok(())
    }

    /// Sets the bit-perfect flag: EQ, levelling and the spatial stages
    /// are bypassed while headroom and the limiter stay in play.
    pub fn set_bit_perfect_mode(&mut self, enabled: bool) {
        self.config.bit_perfect = enabled;
        self.shared.bit_perfect.store(enabled, Ordering::Relaxed);
        self.output.set_bit_perfect_mode(enabled);
        info!("bit-perfect mode {}", if enabled { "on" } else { "off" });
        self.notify(EngineEvent::SignalPathChanged);
    }

    /// Enables auto sample rate; when playing a lossless source whose
    /// rate differs from the device, switches the device immediately.
    ///
    /// # Errors
    ///
    /// Returns the driver's error when an immediate switch fails.
    pub fn set_auto_sample_rate(&mut self, enabled: bool) -> Result<()> {
        self.config.auto_sample_rate = enabled;
        info!("auto sample rate {}", if enabled { "on" } else { "off" });

        if enabled && self.state != EngineState::Stopped {
            let file_rate = {
                let slots = self.lock_slots();
                slots
                    .current
                    .as_ref()
                    .map_or(0.0, |decoder| decoder.format().sample_rate)
            };
            let current = self.shared.sample_rate();
            if file_rate > 0.0 && (file_rate - current).abs() > 0.5 {
                debug!("auto sample rate: switching {current} -> {file_rate} Hz");
                self.set_sample_rate(file_rate)?;
            }
        }
        Ok(())
    }

    /// Requests or releases exclusive (hog) access to the device.
    pub fn set_exclusive_mode(&mut self, enabled: bool) {
        self.config.exclusive_mode = enabled;
        let ok = self.output.set_hog_mode(enabled);
        if ok {
            info!("exclusive mode {}", if enabled { "on" } else { "off" });
        } else if enabled {
            warn!("exclusive mode could not be acquired");
        }
        self.notify(EngineEvent::SignalPathChanged);
    }

    /// Whether exclusive access is currently held.
    #[must_use]
    pub fn exclusive_mode(&self) -> bool {
        self.output.is_exclusive_mode()
    }

    /// Output devices as reported by the driver.
    #[must_use]
    pub fn available_devices(&self) -> Vec<crate::output::AudioDeviceInfo> {
        self.output.enumerate_devices()
    }

    /// Maximum rate of the active output device.
    #[must_use]
    pub fn max_device_sample_rate(&self) -> f64 {
        self.output.max_sample_rate(self.current_device_id)
    }

    // ── DSP configuration ────────────────────────────────────────────

    /// Reloads the current track so a changed upsampler configuration
    /// takes effect, restoring position and play state.
    ///
    /// # Errors
    ///
    /// Propagates `load`/`seek`/`play` errors from the reload.
    pub fn apply_upsampling_change(&mut self) -> Result<()> {
        let Some(path) = self.current_file() else {
            self.notify(EngineEvent::SignalPathChanged);
            return Ok(());
        };
        if self.state == EngineState::Stopped {
            self.notify(EngineEvent::SignalPathChanged);
            return Ok(());
        }

        let position = self.position();
        let was_playing = self.state == EngineState::Playing;
        debug!("re-applying upsampling config, reloading at {position:.2}s");

        self.load(&path)?;
        self.seek(position)?;
        if was_playing {
            self.play()?;
        }
        Ok(())
    }

    /// Mutates the upsampler configuration. Callers follow with
    /// [`apply_upsampling_change`](Self::apply_upsampling_change) to
    /// restart the stream at the new rate.
    pub fn set_upsampling(
        &mut self,
        enabled: bool,
        mode: UpsamplingMode,
        quality: UpsamplingQuality,
        filter: UpsamplingFilter,
        fixed_rate: u32,
    ) {
        self.config.upsampling.enabled = enabled;
        self.config.upsampling.mode = mode;
        self.config.upsampling.quality = quality;
        self.config.upsampling.filter = filter;
        self.config.upsampling.fixed_rate = fixed_rate;

        let mut slots = self.lock_slots();
        slots.upsampler.set_mode(mode);
        slots.upsampler.set_quality(quality);
        slots.upsampler.set_filter(filter);
        slots.upsampler.set_fixed_rate(fixed_rate);
        slots.upsampler.set_enabled(enabled);
    }

    /// Replaces one equaliser band.
    pub fn set_eq_band(&mut self, index: usize, band: EqBandConfig) {
        self.lock_slots().chain.equalizer_mut().set_band(index, band);
        self.notify(EngineEvent::SignalPathChanged);
    }

    /// Rewrites many equaliser bands under one coefficient
    /// recomputation.
    pub fn set_eq_bands(&mut self, bands: &[EqBandConfig], preamp_db: f32) {
        let mut slots = self.lock_slots();
        let eq = slots.chain.equalizer_mut();
        eq.begin_batch_update();
        eq.set_bands(bands);
        eq.set_preamp_db(preamp_db);
        eq.end_batch_update();
        drop(slots);
        self.notify(EngineEvent::SignalPathChanged);
    }

    /// Enables or disables the equaliser.
    pub fn set_eq_enabled(&mut self, enabled: bool) {
        self.config.eq.enabled = enabled;
        self.lock_slots()
            .chain
            .equalizer_mut()
            .set_enabled(enabled && self.config.dsp_enabled);
        self.notify(EngineEvent::SignalPathChanged);
    }

    /// Switches the equaliser between minimum- and linear-phase modes.
    pub fn set_eq_phase_mode(&mut self, mode: EqPhaseMode) {
        self.lock_slots().chain.equalizer_mut().set_phase_mode(mode);
        self.notify(EngineEvent::SignalPathChanged);
    }

    /// Evaluates the equaliser's frequency response for UI display.
    #[must_use]
    pub fn eq_frequency_response(&self, num_points: usize) -> Vec<(f32, f32)> {
        self.lock_slots()
            .chain
            .equalizer()
            .frequency_response(num_points)
    }

    /// Configures the crossfeed stage.
    pub fn set_crossfeed(&mut self, enabled: bool, level: CrossfeedLevel) {
        self.config.crossfeed.enabled = enabled;
        let mut slots = self.lock_slots();
        slots.chain.crossfeed_mut().set_level(level);
        slots.chain.crossfeed_mut().set_enabled(enabled);
        drop(slots);
        self.update_headroom_gain();
        self.notify(EngineEvent::SignalPathChanged);
    }

    /// Enables/disables convolution and (re)loads its impulse response
    /// off-thread.
    pub fn set_convolution(&mut self, enabled: bool, ir_path: Option<PathBuf>) {
        self.config.convolution.enabled = enabled;
        self.config.convolution.ir_path.clone_from(&ir_path);
        self.lock_slots().chain.convolution_mut().set_enabled(enabled);
        if enabled {
            if let Some(path) = ir_path {
                self.load_impulse_response_async(path);
            }
        }
        self.update_headroom_gain();
        self.notify(EngineEvent::SignalPathChanged);
    }

    /// Enables/disables HRTF rendering and (re)loads the SOFA filters
    /// off-thread.
    pub fn set_hrtf(&mut self, enabled: bool, sofa_path: Option<PathBuf>, speaker_angle: f32) {
        self.config.hrtf.enabled = enabled;
        self.config.hrtf.sofa_path.clone_from(&sofa_path);
        self.config.hrtf.speaker_angle = speaker_angle;

        let mut slots = self.lock_slots();
        slots.chain.hrtf_mut().set_enabled(enabled);
        slots.chain.hrtf_mut().set_speaker_angle(speaker_angle);
        drop(slots);

        if enabled {
            if let Some(path) = sofa_path {
                self.load_sofa_async(path);
            }
        }
        self.notify(EngineEvent::SignalPathChanged);
    }

    /// Parses a WAV impulse response on a worker thread and installs it
    /// under the slot lock. The install is skipped when a newer load
    /// request superseded this one while it was parsing.
    fn load_impulse_response_async(&self, path: PathBuf) {
        let generation = self
            .shared
            .ir_load_generation
            .fetch_add(1, Ordering::AcqRel)
            + 1;
        let shared = Arc::clone(&self.shared);
        let event_tx = self.event_tx.clone();
        std::thread::spawn(move || match ImpulseResponse::load_wav(&path) {
            Ok(ir) => {
                if shared.ir_load_generation.load(Ordering::Acquire) != generation {
                    debug!("impulse response load superseded, discarding {}", path.display());
                    return;
                }
                let mut slots = shared
                    .slots
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                slots.chain.convolution_mut().install_ir(ir, path);
                drop(slots);
                let _ = event_tx.send(EngineEvent::SignalPathChanged);
            }
            Err(e) => {
                warn!("impulse response load failed: {e}");
            }
        });
    }

    /// Parses a SOFA file on a worker thread and installs the filter
    /// set under the slot lock, unless a newer request superseded it.
    fn load_sofa_async(&self, path: PathBuf) {
        let generation = self
            .shared
            .sofa_load_generation
            .fetch_add(1, Ordering::AcqRel)
            + 1;
        let shared = Arc::clone(&self.shared);
        let event_tx = self.event_tx.clone();
        std::thread::spawn(move || {
            match crate::dsp::hrtf::HrtfFilterSet::from_sofa(&path) {
                Ok(filters) => {
                    if shared.sofa_load_generation.load(Ordering::Acquire) != generation {
                        debug!("SOFA load superseded, discarding {}", path.display());
                        return;
                    }
                    let mut slots = shared
                        .slots
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                    slots.chain.hrtf_mut().set_filters(filters);
                    drop(slots);
                    let _ = event_tx.send(EngineEvent::SignalPathChanged);
                }
                Err(e) => {
                    warn!("SOFA load failed: {e}");
                }
            }
        });
    }

    // ── loudness ─────────────────────────────────────────────────────

    /// Announces the current track's metadata (loudness tags) and
    /// recomputes the levelling gain.
    pub fn set_current_track(&mut self, track: TrackMeta) {
        self.current_track = track;
        self.update_leveling_gain();
        self.update_headroom_gain();
    }

    /// Enables volume levelling and sets its parameters.
    pub fn set_volume_leveling(&mut self, enabled: bool, album_mode: bool, target_lufs: f64) {
        self.config.leveling.enabled = enabled;
        self.config.leveling.mode = if album_mode {
            crate::config::LevelingMode::Album
        } else {
            crate::config::LevelingMode::Track
        };
        self.config.leveling.target_lufs = target_lufs;
        self.leveling.apply_config(&self.config.leveling);
        self.update_leveling_gain();
        self.update_headroom_gain();
    }

    /// Sets the headroom mode and manual attenuation.
    pub fn set_headroom(&mut self, mode: HeadroomMode, manual_db: f64) {
        self.config.headroom.mode = mode;
        self.config.headroom.manual_db = manual_db;
        self.headroom.set_mode(mode);
        self.headroom.set_manual_db(manual_db);
        self.update_headroom_gain();
        self.notify(EngineEvent::SignalPathChanged);
    }

    /// Recomputes the levelling gain for the current track; the render
    /// chain ramps to the new value on its next callback.
    fn update_leveling_gain(&self) {
        let gain = self.leveling.compute(&self.current_track);
        let slots = self.lock_slots();
        slots.chain.set_leveling_gain(gain);
        drop(slots);
        debug!(
            "leveling gain {:.3} ({:.1} dB)",
            gain,
            self.leveling.gain_db(&self.current_track),
        );
        self.notify(EngineEvent::SignalPathChanged);
    }

    /// Recomputes the headroom gain. Auto mode engages when levelling,
    /// crossfeed or convolution (with an IR) is active.
    fn update_headroom_gain(&self) {
        let slots = self.lock_slots();
        let any_dsp_active = self.leveling.is_enabled()
            || slots.chain.crossfeed().is_enabled()
            || (slots.chain.convolution().is_enabled() && slots.chain.convolution().has_ir());
        let gain = self.headroom.compute(any_dsp_active);
        slots.chain.set_headroom_gain(gain);
        drop(slots);
        debug!("headroom gain {gain:.3} (dsp active: {any_dsp_active})");
    }

    // ── signal path ──────────────────────────────────────────────────

    /// Builds the signal-path report for the current pipeline.
    #[must_use]
    pub fn signal_path(&self) -> SignalPath {
        let mut path = SignalPath::default();
        if self.current_file().is_none() {
            return path;
        }

        let rate = self.shared.sample_rate();
        let channels = self.shared.channels.load(Ordering::Relaxed);
        let using_dsd = self.shared.using_dsd.load(Ordering::Relaxed);
        let bit_perfect = self.shared.bit_perfect.load(Ordering::Relaxed);

        let slots = self.lock_slots();

        // Source node.
        if let Some(decoder) = slots.current.as_ref() {
            if using_dsd {
                let label = decoder.dsd_rate().map_or("DSD", |class| class.label());
                path.nodes.push(
                    SignalPathNode::new(
                        "Source",
                        format!("{label} \u{2022} {}", channel_description(channels)),
                        SignalQuality::HighRes,
                    )
                    .with_sublabel(format!(
                        "{:.1} MHz",
                        decoder.dsd_sample_rate_hz() / 1_000_000.0,
                    )),
                );
            } else {
                let format = decoder.format();
                let codec = decoder.codec_name().unwrap_or("Unknown");
                let quality = if decoder.is_lossless() {
                    if format.sample_rate > 44_100.0 || format.bits_per_sample > 16 {
                        SignalQuality::HighRes
                    } else {
                        SignalQuality::Lossless
                    }
                } else {
                    SignalQuality::Lossy
                };
                path.nodes.push(SignalPathNode::new(
                    "Source",
                    format!(
                        "{codec} \u{2022} {}-bit / {:.4} kHz \u{2022} {}",
                        format.bits_per_sample,
                        format.sample_rate / 1000.0,
                        channel_description(format.channels),
                    ),
                    quality,
                ));
            }

            // Decoder node.
            if decoder.is_dop_mode() {
                path.nodes.push(
                    SignalPathNode::new("Decoder", "DoP Passthrough", SignalQuality::HighRes)
                        .with_sublabel(format!("DSD over PCM at {:.4} kHz", rate / 1000.0)),
                );
            } else if using_dsd {
                path.nodes.push(SignalPathNode::new(
                    "Decoder",
                    "DSD to PCM Conversion",
                    SignalQuality::Lossless,
                ));
            } else if decoder.is_lossless() {
                path.nodes.push(SignalPathNode::new(
                    "Decoder",
                    "Lossless Decode",
                    SignalQuality::Lossless,
                ));
            } else {
                path.nodes.push(SignalPathNode::new(
                    "Decoder",
                    "Lossy Decode",
                    SignalQuality::Lossy,
                ));
            }
        }

        let mut has_dsp = false;

        // Upsampler node.
        if slots.upsampler.is_active() && !bit_perfect && !using_dsd {
            has_dsp = true;
            path.nodes.push(
                SignalPathNode::new("Upsampling", "Windowed-Sinc Resampler", SignalQuality::Enhanced)
                    .with_sublabel(slots.upsampler.description()),
            );
        }

        // Headroom node.
        let headroom = slots.chain.headroom_gain();
        if self.headroom.mode() != HeadroomMode::Off && (headroom - 1.0).abs() > f32::EPSILON {
            path.nodes.push(
                SignalPathNode::new("Headroom", "", SignalQuality::Enhanced).with_sublabel(
                    format!(
                        "{} \u{00b7} {:.1} dB",
                        if self.headroom.mode() == HeadroomMode::Auto {
                            "Auto"
                        } else {
                            "Manual"
                        },
                        ratio_to_db(headroom),
                    ),
                ),
            );
        }

        // Spatial nodes.
        let hrtf_active =
            slots.chain.hrtf().is_enabled() && slots.chain.hrtf().is_loaded() && channels == 2;
        if slots.chain.crossfeed().is_enabled() && channels == 2 && !hrtf_active && !bit_perfect {
            has_dsp = true;
            path.nodes.push(
                SignalPathNode::new("Crossfeed", "", SignalQuality::Enhanced).with_sublabel(
                    format!("Headphone \u{00b7} {}", slots.chain.crossfeed().level().label()),
                ),
            );
        }
        if slots.chain.convolution().is_enabled() && slots.chain.convolution().has_ir() && !bit_perfect
        {
            has_dsp = true;
            let ir_name = slots
                .chain
                .convolution()
                .ir_path()
                .and_then(|p| p.file_name())
                .map_or_else(String::new, |name| name.to_string_lossy().into_owned());
            path.nodes.push(
                SignalPathNode::new("Convolution", "", SignalQuality::Enhanced)
                    .with_sublabel(format!("Room Correction \u{00b7} {ir_name}")),
            );
        }
        if hrtf_active && !bit_perfect {
            has_dsp = true;
            path.nodes.push(
                SignalPathNode::new("HRTF", "", SignalQuality::Enhanced).with_sublabel(format!(
                    "Binaural \u{00b7} {}\u{00b0}",
                    slots.chain.hrtf().speaker_angle() as i32,
                )),
            );
        }

        // EQ and levelling nodes.
        if slots.chain.equalizer().is_enabled() && !bit_perfect {
            has_dsp = true;
            path.nodes.push(SignalPathNode::new(
                "DSP",
                "Parametric Equalizer",
                SignalQuality::Enhanced,
            ));
        }
        let leveling = slots.chain.leveling_gain();
        if self.leveling.is_enabled() && (leveling - 1.0).abs() > f32::EPSILON && !bit_perfect {
            has_dsp = true;
            let db = ratio_to_db(leveling);
            path.nodes.push(
                SignalPathNode::new(
                    "Volume Leveling",
                    if self.current_track.has_replay_gain {
                        "ReplayGain"
                    } else {
                        "R128"
                    },
                    SignalQuality::Enhanced,
                )
                .with_sublabel(format!("{}{db:.1} dB", if db >= 0.0 { "+" } else { "" })),
            );
        }
        drop(slots);

        // Output node.
        let nominal = self.output.device_nominal_sample_rate();
        let display_rate = if nominal > 0.0 { nominal } else { rate };
        let exclusive = self.output.is_exclusive_mode();
        let mut output_node = SignalPathNode::new(
            "Output",
            format!(
                "{} \u{2022} {:.4} kHz",
                self.output.device_name(),
                display_rate / 1000.0,
            ),
            if has_dsp {
                SignalQuality::Enhanced
            } else if bit_perfect {
                SignalQuality::BitPerfect
            } else {
                SignalQuality::Lossless
            },
        );
        if !has_dsp && bit_perfect {
            output_node.sublabel = String::from("Bit-Perfect");
        }
        if exclusive {
            if !output_node.sublabel.is_empty() {
                output_node.sublabel.push_str(" \u{2022} ");
            }
            output_node.sublabel.push_str("Exclusive Mode");
        }
        path.nodes.push(output_node);

        path
    }
}

/// A `Send` handle onto the engine's render path.
///
/// Clones share the engine's state; rendering through the handle obeys
/// the same try-lock, silence-on-contention rules as the installed
/// output callback.
#[derive(Clone)]
pub struct RenderHandle {
    shared: Arc<EngineShared>,
}

impl RenderHandle {
    /// Renders up to `max_frames` frames into `buf`, returning the
    /// frames produced.
    pub fn render(&self, buf: &mut [f32], max_frames: usize) -> usize {
        self.shared.render(buf, max_frames)
    }
}

impl Drop for AudioEngine {
    /// Shuts the pipeline down in reverse order: silence the callback,
    /// wait for any in-flight render to drain, then the output driver,
    /// decoders and DSP fall with the struct.
    fn drop(&mut self) {
        self.shared.destroyed.store(true, Ordering::Release);
        self.output.set_render_callback(None);
        self.output.stop();

        let deadline = std::time::Instant::now() + SHUTDOWN_DRAIN;
        while self.shared.rendering_in_progress.load(Ordering::Acquire)
            && std::time::Instant::now() < deadline
        {
            std::thread::sleep(Duration::from_millis(10));
        }

        self.output.close();
    }
}

#[cfg(test)]
mod tests {
    use super::{AudioEngine, EngineState};
    use crate::config::PlayerConfig;
    use crate::output::null::NullOutput;
    use std::sync::mpsc;

    fn engine() -> (AudioEngine, mpsc::Receiver<crate::events::EngineEvent>) {
        let (tx, rx) = mpsc::channel();
        let engine = AudioEngine::new(Box::new(NullOutput::new()), PlayerConfig::default(), tx);
        (engine, rx)
    }

    #[test]
    fn renders_silence_before_any_load() {
        let (engine, _rx) = engine();
        let mut buf = vec![0.9_f32; 2 * 256];
        let produced = engine.render_audio(&mut buf, 256);
        assert_eq!(produced, 0);
    }

    #[test]
    fn initial_state_is_stopped() {
        let (engine, _rx) = engine();
        assert_eq!(engine.state(), EngineState::Stopped);
        assert_eq!(engine.position(), 0.0);
        assert!(engine.current_file().is_none());
        assert!(engine.signal_path().nodes.is_empty());
    }

    #[test]
    fn play_without_source_fails() {
        let (mut engine, _rx) = engine();
        assert!(engine.play().is_err());
    }

    #[test]
    fn load_rejects_missing_file() {
        let (mut engine, rx) = engine();
        let err = engine
            .load(std::path::Path::new("/definitely/not/here.flac"))
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::FileNotFound);
        // The failure surfaced as an event too.
        let events: Vec<_> = rx.try_iter().collect();
        assert!(events
            .iter()
            .any(|e| matches!(e, crate::events::EngineEvent::ErrorOccurred(_))));
    }

    #[test]
    fn stop_is_idempotent() {
        let (mut engine, _rx) = engine();
        engine.stop();
        engine.stop();
        assert_eq!(engine.state(), EngineState::Stopped);
    }
}
