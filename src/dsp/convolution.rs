//! Impulse-response convolution (room correction).
//!
//! Implements uniform-partition FFT convolution with a frequency-domain
//! delay line: the impulse response is split into blocks, each block's
//! spectrum is multiplied against a ring of input-block spectra, and the
//! overlap-add tail carries across blocks. Latency is one partition
//! (`block size` frames); all buffers are sized when the processor is
//! prepared, so the audio-thread path never allocates.
//!
//! Impulse responses load from WAV files via `hound` and are linearly
//! resampled when their rate differs from the session rate. A mono IR is
//! applied to every stream channel; a multi-channel IR maps one IR
//! channel per stream channel (extra IR channels are ignored).

use std::{collections::VecDeque, path::Path, path::PathBuf, sync::Arc};

use rustfft::{num_complex::Complex, Fft, FftPlanner};

use crate::{
    dsp::DspStage,
    error::{Error, Result},
};

/// Partition size in frames. Latency of the convolution stage equals
/// one partition.
const BLOCK_SIZE: usize = 4096;

/// A loaded impulse response: one sample vector per channel.
#[derive(Clone, Debug)]
pub struct ImpulseResponse {
    /// Sample rate the IR was recorded at.
    pub sample_rate: u32,
    /// Per-channel samples.
    pub channels: Vec<Vec<f32>>,
}

impl ImpulseResponse {
    /// Loads an impulse response from a WAV file.
    ///
    /// # Errors
    ///
    /// Returns `DecoderOpenFailed` when the file cannot be parsed or has
    /// no samples.
    pub fn load_wav(path: &Path) -> Result<Self> {
        let mut reader = hound::WavReader::open(path)?;
        let spec = reader.spec();
        let channel_count = spec.channels.max(1) as usize;

        let interleaved: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .samples::<f32>()
                .collect::<std::result::Result<_, _>>()?,
            hound::SampleFormat::Int => {
                let scale = 1.0 / (1_i64 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 * scale))
                    .collect::<std::result::Result<_, _>>()?
            }
        };

        if interleaved.is_empty() {
            return Err(Error::decoder_open_failed(format!(
                "impulse response is empty: {}",
                path.display()
            )));
        }

        let frames = interleaved.len() / channel_count;
        let mut channels = vec![Vec::with_capacity(frames); channel_count];
        for (i, sample) in interleaved.iter().enumerate() {
            channels[i % channel_count].push(*sample);
        }

        Ok(Self {
            sample_rate: spec.sample_rate,
            channels,
        })
    }

    /// Returns the IR resampled to `target_rate` with linear
    /// interpolation, or a clone when the rates already match.
    #[must_use]
    pub fn resampled_to(&self, target_rate: u32) -> Self {
        if self.sample_rate == target_rate || self.sample_rate == 0 {
            return self.clone();
        }

        let ratio = f64::from(target_rate) / f64::from(self.sample_rate);
        let channels = self
            .channels
            .iter()
            .map(|samples| {
                let out_len = ((samples.len() as f64) * ratio).round().max(1.0) as usize;
                (0..out_len)
                    .map(|i| {
                        let src = i as f64 / ratio;
                        let base = src.floor() as usize;
                        let next = (base + 1).min(samples.len().saturating_sub(1));
                        let frac = (src - base as f64) as f32;
                        let a = samples.get(base).copied().unwrap_or(0.0);
                        let b = samples.get(next).copied().unwrap_or(0.0);
                        a + (b - a) * frac
                    })
                    .collect()
            })
            .collect();

        Self {
            sample_rate: target_rate,
            channels,
        }
    }
}

/// Per-channel convolution state.
struct ChannelState {
    /// Ring of input-block spectra, newest at `fdl_pos`.
    fdl: Vec<Vec<Complex<f32>>>,
    /// Input accumulator for the current partition.
    input: Vec<f32>,
    input_fill: usize,
    /// Overlap-add tail from the previous block.
    overlap: Vec<f32>,
    /// Output samples ready to hand out; primed with one partition of
    /// silence so output never underflows.
    output: VecDeque<f32>,
}

/// Uniform-partition FFT convolver for one impulse response applied to
/// an interleaved multi-channel stream.
pub struct FftConvolver {
    block_size: usize,
    fft_size: usize,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
    /// Partition spectra per IR channel.
    ir_spectra: Vec<Vec<Vec<Complex<f32>>>>,
    channels: Vec<ChannelState>,
    fdl_pos: usize,
    /// Scratch for FFT work, shared across channels (processing is
    /// sequential).
    scratch_time: Vec<Complex<f32>>,
    scratch_accum: Vec<Complex<f32>>,
}

impl FftConvolver {
    /// Builds a convolver for `stream_channels` channels with the given
    /// per-channel IR and partition size.
    #[must_use]
    pub fn new(ir_channels: &[Vec<f32>], block_size: usize, stream_channels: usize) -> Self {
        let fft_size = block_size * 2;
        let mut planner = FftPlanner::new();
        let forward = planner.plan_fft_forward(fft_size);
        let inverse = planner.plan_fft_inverse(fft_size);

        let longest = ir_channels.iter().map(Vec::len).max().unwrap_or(1).max(1);
        let partitions = longest.div_ceil(block_size);

        let ir_spectra = ir_channels
            .iter()
            .map(|samples| {
                (0..partitions)
                    .map(|p| {
                        let start = p * block_size;
                        let mut buffer = vec![Complex::new(0.0, 0.0); fft_size];
                        for i in 0..block_size {
                            if let Some(&sample) = samples.get(start + i) {
                                buffer[i].re = sample;
                            }
                        }
                        forward.process(&mut buffer);
                        buffer
                    })
                    .collect()
            })
            .collect();

        let channels = (0..stream_channels)
            .map(|_| {
                let mut output = VecDeque::with_capacity(block_size * 3);
                // Prime with one partition of latency.
                output.extend(std::iter::repeat(0.0).take(block_size));
                ChannelState {
                    fdl: vec![vec![Complex::new(0.0, 0.0); fft_size]; partitions],
                    input: vec![0.0; block_size],
                    input_fill: 0,
                    overlap: vec![0.0; block_size],
                    output,
                }
            })
            .collect();

        Self {
            block_size,
            fft_size,
            forward,
            inverse,
            ir_spectra,
            channels,
            fdl_pos: 0,
            scratch_time: vec![Complex::new(0.0, 0.0); fft_size],
            scratch_accum: vec![Complex::new(0.0, 0.0); fft_size],
        }
    }

    /// Latency introduced by the partitioning, in frames.
    #[must_use]
    pub fn latency_frames(&self) -> usize {
        self.block_size
    }

    /// Convolves `frames` interleaved frames in place.
    pub fn process(&mut self, buf: &mut [f32], frames: usize, channels: usize) {
        let active = channels.min(self.channels.len());
        for frame in 0..frames {
            // The FDL position advances once per completed partition; all
            // channels fill in lockstep, so rotate on the last channel.
            for channel in 0..active {
                let sample = buf[frame * channels + channel];
                let fill = self.channels[channel].input_fill;
                self.channels[channel].input[fill] = sample;
                self.channels[channel].input_fill += 1;

                if self.channels[channel].input_fill == self.block_size {
                    let rotate = channel == active - 1;
                    self.process_block(channel, rotate);
                }

                buf[frame * channels + channel] =
                    self.channels[channel].output.pop_front().unwrap_or(0.0);
            }
        }
    }

    /// FFTs the accumulated input block, multiplies against the IR
    /// partitions and overlap-adds one block of output.
    fn process_block(&mut self, channel: usize, rotate_fdl: bool) {
        let block_size = self.block_size;
        let fft_size = self.fft_size;
        let partitions = self.channels[channel].fdl.len();

        // Newest block goes one slot back in the ring.
        let pos = (self.fdl_pos + partitions - 1) % partitions;

        // Forward transform of the zero-padded input block.
        for i in 0..fft_size {
            self.scratch_time[i] = if i < block_size {
                Complex::new(self.channels[channel].input[i], 0.0)
            } else {
                Complex::new(0.0, 0.0)
            };
        }
        self.forward.process(&mut self.scratch_time);
        self.channels[channel].fdl[pos].copy_from_slice(&self.scratch_time);

        // Multiply-accumulate the delay line against the IR partitions.
        let ir = if self.ir_spectra.len() == 1 {
            &self.ir_spectra[0]
        } else {
            &self.ir_spectra[channel.min(self.ir_spectra.len() - 1)]
        };
        self.scratch_accum.fill(Complex::new(0.0, 0.0));
        for p in 0..partitions {
            let block = &self.channels[channel].fdl[(pos + p) % partitions];
            let spectrum = &ir[p];
            for i in 0..fft_size {
                self.scratch_accum[i] += block[i] * spectrum[i];
            }
        }

        // Back to the time domain; rustfft leaves the inverse unscaled.
        self.inverse.process(&mut self.scratch_accum);
        let scale = 1.0 / fft_size as f32;

        let state = &mut self.channels[channel];
        for i in 0..block_size {
            let value = self.scratch_accum[i].re * scale + state.overlap[i];
            state.output.push_back(value);
            state.overlap[i] = self.scratch_accum[block_size + i].re * scale;
        }
        state.input_fill = 0;

        if rotate_fdl {
            self.fdl_pos = pos;
        }
    }
}

/// Room-correction convolution stage.
///
/// Pass-through when disabled or when no impulse response is loaded.
pub struct ConvolutionProcessor {
    enabled: bool,
    sample_rate: f64,
    stream_channels: usize,
    ir: Option<ImpulseResponse>,
    ir_path: Option<PathBuf>,
    convolver: Option<FftConvolver>,
}

impl ConvolutionProcessor {
    /// Creates a disabled processor with no IR.
    #[must_use]
    pub fn new() -> Self {
        Self {
            enabled: false,
            sample_rate: 44_100.0,
            stream_channels: 2,
            ir: None,
            ir_path: None,
            convolver: None,
        }
    }

    /// Verifies the convolution math: a unit impulse through a known IR
    /// must reproduce the IR exactly (within float tolerance).
    ///
    /// # Panics
    ///
    /// Panics when the numerical backend misbehaves. Run once at engine
    /// startup; a broken FFT must fail loudly, not corrupt audio.
    pub fn self_test() {
        let ir = vec![vec![1.0_f32, 0.5, -0.25, 0.125]];
        let block = 64;
        let mut convolver = FftConvolver::new(&ir, block, 1);

        let frames = block * 3;
        let mut buf = vec![0.0_f32; frames];
        buf[0] = 1.0;
        convolver.process(&mut buf, frames, 1);

        // Output is delayed by one partition.
        let latency = convolver.latency_frames();
        for (i, expected) in ir[0].iter().enumerate() {
            let got = buf[latency + i];
            assert!(
                (got - expected).abs() < 1e-4,
                "convolution self-test failed at {i}: got {got}, expected {expected}",
            );
        }
        for (i, &sample) in buf[latency + ir[0].len()..latency + block].iter().enumerate() {
            assert!(
                sample.abs() < 1e-4,
                "convolution self-test trailing garbage at {i}: {sample}",
            );
        }

        debug!("convolution self-test passed");
    }

    /// Loads an impulse response from a WAV file. The convolver is
    /// rebuilt on the next `prepare`, or immediately when the processor
    /// is already prepared.
    ///
    /// # Errors
    ///
    /// Returns `DecoderOpenFailed` when the WAV cannot be parsed.
    pub fn load_ir(&mut self, path: &Path) -> Result<()> {
        let ir = ImpulseResponse::load_wav(path)?;
        info!(
            "convolution IR loaded: {} ({} ch, {} Hz, {} taps)",
            path.display(),
            ir.channels.len(),
            ir.sample_rate,
            ir.channels.first().map_or(0, Vec::len),
        );
        self.ir = Some(ir);
        self.ir_path = Some(path.to_path_buf());
        self.rebuild();
        Ok(())
    }

    /// Installs an already-parsed impulse response. Used by background
    /// loaders that parse the WAV off-thread and only take the engine's
    /// slot lock for this install.
    pub fn install_ir(&mut self, ir: ImpulseResponse, path: PathBuf) {
        self.ir = Some(ir);
        self.ir_path = Some(path);
        self.rebuild();
    }

    /// Drops the loaded impulse response, making the stage pass-through.
    pub fn clear_ir(&mut self) {
        self.ir = None;
        self.ir_path = None;
        self.convolver = None;
    }

    /// Whether an impulse response is loaded.
    #[must_use]
    pub fn has_ir(&self) -> bool {
        self.ir.is_some()
    }

    /// Path of the loaded impulse response, if any.
    #[must_use]
    pub fn ir_path(&self) -> Option<&Path> {
        self.ir_path.as_deref()
    }

    /// Latency in frames, 0 when inactive.
    #[must_use]
    pub fn latency_frames(&self) -> usize {
        if self.enabled {
            self.convolver
                .as_ref()
                .map_or(0, FftConvolver::latency_frames)
        } else {
            0
        }
    }

    fn rebuild(&mut self) {
        self.convolver = self.ir.as_ref().map(|ir| {
            let resampled = ir.resampled_to(self.sample_rate as u32);
            FftConvolver::new(&resampled.channels, BLOCK_SIZE, self.stream_channels)
        });
    }
}

impl Default for ConvolutionProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl DspStage for ConvolutionProcessor {
    fn prepare(&mut self, sample_rate: f64, channels: usize) {
        self.sample_rate = sample_rate;
        self.stream_channels = channels;
        self.rebuild();
    }

    fn process(&mut self, buf: &mut [f32], frames: usize, channels: usize) {
        if !self.enabled {
            return;
        }
        if let Some(convolver) = self.convolver.as_mut() {
            convolver.process(buf, frames, channels);
        }
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }
}
