//! DSD decoder for DSF and DFF containers.
//!
//! Reads raw 1-bit DSD streams and emits either:
//! * **PCM** (default): a per-channel population count over
//!   `decimation_ratio` consecutive bits, scaled to [-1, 1] and passed
//!   through a 64-tap windowed-sinc low-pass, producing float32 at the
//!   configured PCM rate (44.1 kHz by default).
//! * **DoP**: 16 consecutive DSD bits packed into a 24-bit PCM word per
//!   channel with an alternating 0x05/0xFA marker byte, so a DoP-aware
//!   DAC recovers the original bitstream while the OS treats it as PCM.
//!
//! # Container quirks
//!
//! DSF stores bits LSB-first in block-interleaved 4096-byte per-channel
//! blocks; a 256-entry bit-reversal table restores the MSB-first order
//! DSD processing expects. DFF is MSB-first and byte-interleaved with
//! big-endian 8-byte chunk sizes.
//!
//! # DoP marker continuity
//!
//! The marker alternation flag is persistent decoder state. It is
//! exposed through [`DsdDecoder::dop_marker_state`] and restored with
//! [`DsdDecoder::set_dop_marker_state`] so a gapless DSD→DSD swap keeps
//! the alternation unbroken at the DAC.

use std::{
    fs::File,
    io::{BufReader, Read, Seek, SeekFrom},
    path::Path,
};

use crate::{
    decoder::StreamFormat,
    error::{Error, Result},
};

/// Maximum channel count the decoder handles.
const MAX_CHANNELS: usize = 8;

/// Number of taps of the decimation low-pass.
const FIR_TAPS: usize = 64;

/// Low-pass cutoff for PCM conversion, in Hz.
const FIR_CUTOFF_HZ: f64 = 20_000.0;

/// Builds the LSB-first → MSB-first bit-reversal table used for DSF.
const fn build_bit_reverse_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        let mut value = i as u8;
        let mut reversed = 0u8;
        let mut bit = 0;
        while bit < 8 {
            reversed = (reversed << 1) | (value & 1);
            value >>= 1;
            bit += 1;
        }
        table[i] = reversed;
        i += 1;
    }
    table
}

/// LSB-first → MSB-first byte reversal for DSF payloads.
static BIT_REVERSE: [u8; 256] = build_bit_reverse_table();

/// DSD rate classes, at 64×..2048× the CD rate of 44.1 kHz.
///
/// Classification uses half-open intervals at the midpoints between the
/// standard rates so real-world clock tolerance still lands in the right
/// class.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum DsdRate {
    /// 2.8224 MHz.
    Dsd64,
    /// 5.6448 MHz.
    Dsd128,
    /// 11.2896 MHz.
    Dsd256,
    /// 22.5792 MHz.
    Dsd512,
    /// 45.1584 MHz.
    Dsd1024,
    /// 90.3168 MHz and above.
    Dsd2048,
}

impl DsdRate {
    /// Classifies a raw DSD bit rate in Hz.
    ///
    /// Boundaries are the midpoints between adjacent standard rates
    /// (e.g. 4 233 600 Hz between DSD64's 2 822 400 and DSD128's
    /// 5 644 800), so any real-world clock lands in the nearest class.
    #[must_use]
    pub fn classify(rate_hz: u32) -> Self {
        match rate_hz {
            0..=4_233_599 => Self::Dsd64,
            4_233_600..=8_467_199 => Self::Dsd128,
            8_467_200..=16_934_399 => Self::Dsd256,
            16_934_400..=33_868_799 => Self::Dsd512,
            33_868_800..=67_737_599 => Self::Dsd1024,
            _ => Self::Dsd2048,
        }
    }

    /// Display label for signal-path reporting.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Dsd64 => "DSD64",
            Self::Dsd128 => "DSD128",
            Self::Dsd256 => "DSD256",
            Self::Dsd512 => "DSD512",
            Self::Dsd1024 => "DSD1024",
            Self::Dsd2048 => "DSD2048",
        }
    }
}

/// Output mode fixed at open time.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DsdMode {
    /// FIR decimation to band-limited PCM.
    PcmConversion,
    /// DoP encoding for a DoP-capable DAC.
    Dop,
}

/// 64-tap windowed-sinc low-pass with per-channel history.
///
/// The 4-term Blackman-Harris window gives roughly 92 dB of stopband
/// attenuation, enough to keep DSD quantization noise out of the band.
struct FirFilter {
    coeffs: [f32; FIR_TAPS],
    history: [[f32; FIR_TAPS]; MAX_CHANNELS],
    pos: [usize; MAX_CHANNELS],
}

impl FirFilter {
    fn new() -> Self {
        Self {
            coeffs: [0.0; FIR_TAPS],
            history: [[0.0; FIR_TAPS]; MAX_CHANNELS],
            pos: [0; MAX_CHANNELS],
        }
    }

    /// Designs the windowed-sinc low-pass for the given cutoff and
    /// output rate, normalized for unity gain at DC.
    fn design(&mut self, cutoff_hz: f64, output_rate: f64) {
        let fc = cutoff_hz / output_rate;
        let mut sum = 0.0_f64;

        for (i, coeff) in self.coeffs.iter_mut().enumerate() {
            let n = i as f64 - (FIR_TAPS as f64 - 1.0) / 2.0;

            let h = if n.abs() < 1e-4 {
                2.0 * std::f64::consts::PI * fc
            } else {
                (2.0 * std::f64::consts::PI * fc * n).sin() / (std::f64::consts::PI * n)
            };

            let x = i as f64 / (FIR_TAPS as f64 - 1.0);
            let w = 0.358_75 - 0.488_29 * (2.0 * std::f64::consts::PI * x).cos()
                + 0.141_28 * (4.0 * std::f64::consts::PI * x).cos()
                - 0.011_68 * (6.0 * std::f64::consts::PI * x).cos();

            *coeff = (h * w) as f32;
            sum += f64::from(*coeff);
        }

        let inv_sum = (1.0 / sum) as f32;
        for coeff in &mut self.coeffs {
            *coeff *= inv_sum;
        }
    }

    fn reset(&mut self) {
        self.history = [[0.0; FIR_TAPS]; MAX_CHANNELS];
        self.pos = [0; MAX_CHANNELS];
    }

    fn process(&mut self, channel: usize, input: f32) -> f32 {
        let history = &mut self.history[channel];
        let mut p = self.pos[channel];
        history[p] = input;

        let mut output = 0.0;
        for &coeff in &self.coeffs {
            output += history[p] * coeff;
            p = if p == 0 { FIR_TAPS - 1 } else { p - 1 };
        }

        self.pos[channel] = (self.pos[channel] + 1) % FIR_TAPS;
        output
    }
}

/// Which container the file was parsed as.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Container {
    Dsf,
    Dff,
}

/// Decoder for raw 1-bit DSD from DSF/DFF containers.
pub struct DsdDecoder {
    reader: BufReader<File>,

    container: Container,
    channels: usize,
    dsd_rate: u32,
    /// DSD bits per channel in the stream.
    total_dsd_samples: u64,
    /// DSF per-channel block size in bytes.
    block_size: usize,

    mode: DsdMode,
    /// Alternates between false (0x05) and true (0xFA) per DoP frame.
    dop_marker: bool,

    pcm_sample_rate: f64,
    /// DSD bytes consumed per channel per output frame.
    bytes_per_frame: usize,
    total_pcm_frames: i64,

    data_offset: u64,

    pcm_frames_read: i64,

    /// DSF block-deinterleave state: one block per channel.
    dsf_blocks: Vec<Vec<u8>>,
    dsf_block_pos: usize,

    fir: FirFilter,
}

impl DsdDecoder {
    /// Opens a DSF or DFF file in the requested output mode.
    ///
    /// `target_pcm_rate` applies to PCM-conversion mode only. Accepted
    /// targets divide the DSD rate with a byte-aligned ratio (44100,
    /// 88200, 176400 or 352800 for the 44.1 kHz DSD family); anything
    /// else falls back to 44.1 kHz.
    ///
    /// # Errors
    ///
    /// Returns `DecoderOpenFailed` when the container cannot be parsed.
    pub fn open(path: &Path, mode: DsdMode, target_pcm_rate: u32) -> Result<Self> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);

        let file = File::open(path)
            .map_err(|e| Error::file_unreadable(format!("{}: {e}", path.display())))?;
        let mut reader = BufReader::new(file);

        let parsed = match extension.as_deref() {
            Some("dsf") => Self::parse_dsf(&mut reader)?,
            Some("dff") => Self::parse_dff(&mut reader)?,
            other => {
                return Err(Error::decoder_open_failed(format!(
                    "not a DSD container: extension {other:?}"
                )));
            }
        };

        if parsed.channels == 0 || parsed.channels > MAX_CHANNELS {
            return Err(Error::decoder_open_failed(format!(
                "unsupported DSD channel count {}",
                parsed.channels
            )));
        }
        if parsed.dsd_rate == 0 {
            return Err(Error::decoder_open_failed("DSD sample rate missing"));
        }

        let mut decoder = Self {
            reader,
            container: parsed.container,
            channels: parsed.channels,
            dsd_rate: parsed.dsd_rate,
            total_dsd_samples: parsed.total_dsd_samples,
            block_size: parsed.block_size,
            mode,
            dop_marker: false,
            pcm_sample_rate: 0.0,
            bytes_per_frame: 0,
            total_pcm_frames: 0,
            data_offset: parsed.data_offset,
            pcm_frames_read: 0,
            dsf_blocks: Vec::new(),
            dsf_block_pos: 0,
            fir: FirFilter::new(),
        };
        decoder.init_format(target_pcm_rate);
        decoder
            .reader
            .seek(SeekFrom::Start(decoder.data_offset))
            .map_err(|e| Error::decoder_open_failed(format!("seek to data chunk failed: {e}")))?;

        info!(
            "dsd open: {} ({}), {} Hz ({}), {} ch, {:.1}s, mode {:?}",
            path.display(),
            match decoder.container {
                Container::Dsf => "DSF, bits reversed",
                Container::Dff => "DFF, native bit order",
            },
            decoder.dsd_rate,
            decoder.dsd_rate().label(),
            decoder.channels,
            decoder.total_pcm_frames as f64 / decoder.pcm_sample_rate,
            decoder.mode,
        );

        Ok(decoder)
    }

    /// Computes output format parameters for the selected mode.
    fn init_format(&mut self, target_pcm_rate: u32) {
        match self.mode {
            DsdMode::Dop => {
                // 16 DSD bits (2 bytes) per channel per DoP frame.
                self.pcm_sample_rate = f64::from(self.dsd_rate) / 16.0;
                self.bytes_per_frame = 2;
                self.total_pcm_frames = (self.total_dsd_samples / 16) as i64;
                self.dop_marker = false;
            }
            DsdMode::PcmConversion => {
                let target = Self::effective_pcm_target(self.dsd_rate, target_pcm_rate);
                let decimation_ratio = (self.dsd_rate / target) as usize;
                self.bytes_per_frame = decimation_ratio / 8;
                self.pcm_sample_rate = f64::from(target);
                self.total_pcm_frames = (self.total_dsd_samples / decimation_ratio as u64) as i64;
                self.fir.design(FIR_CUTOFF_HZ, self.pcm_sample_rate);
                self.fir.reset();
            }
        }

        if self.container == Container::Dsf {
            self.dsf_blocks = vec![vec![0u8; self.block_size]; self.channels];
            // Force a block read on first access.
            self.dsf_block_pos = self.block_size;
        }
    }

    /// Picks the PCM conversion target: the requested rate if it divides
    /// the DSD rate with a byte-aligned ratio, else 44.1 kHz.
    fn effective_pcm_target(dsd_rate: u32, requested: u32) -> u32 {
        if requested > 0 && dsd_rate % requested == 0 {
            let ratio = dsd_rate / requested;
            if ratio >= 8 && ratio % 8 == 0 {
                return requested;
            }
        }
        if requested != 0 && requested != 44_100 {
            warn!("DSD output target {requested} Hz not byte-aligned, using 44100 Hz");
        }
        44_100
    }

    /// Reads up to `max_frames` output frames into `buf`.
    ///
    /// Returns the number of frames produced; 0 means end of stream.
    pub fn read(&mut self, buf: &mut [f32], max_frames: usize) -> usize {
        let channels = self.channels;
        let max_frames = max_frames.min(buf.len() / channels);
        let frames = match self.mode {
            DsdMode::Dop => self.read_dop(buf, max_frames),
            DsdMode::PcmConversion => self.read_pcm(buf, max_frames),
        };
        self.pcm_frames_read += frames as i64;
        frames
    }

    /// DoP encoding: pack 16 DSD bits into a 24-bit word per channel.
    ///
    /// The 24-bit word is `[marker][dsd_high][dsd_low]` with the marker
    /// alternating 0x05/0xFA each frame. The signed 24-bit value divided
    /// by 2^23 is exact in float32 (24-bit mantissa), so the transport
    /// preserves every DSD bit.
    fn read_dop(&mut self, buf: &mut [f32], max_frames: usize) -> usize {
        let channels = self.channels;
        let mut frame_bytes = [0u8; MAX_CHANNELS * 2];
        let mut frames_written = 0;

        while frames_written < max_frames {
            if !self.read_dsd_frame(&mut frame_bytes, 2) {
                break;
            }

            let marker: u32 = if self.dop_marker { 0xFA } else { 0x05 };
            self.dop_marker = !self.dop_marker;

            for channel in 0..channels {
                let hi = u32::from(frame_bytes[channel * 2]);
                let lo = u32::from(frame_bytes[channel * 2 + 1]);
                let dop_word = (marker << 16) | (hi << 8) | lo;

                let mut signed24 = dop_word as i32;
                if signed24 & 0x80_0000 != 0 {
                    signed24 |= -0x100_0000_i32; // sign-extend bits 24..31
                }

                buf[frames_written * channels + channel] = signed24 as f32 / 8_388_608.0;
            }

            frames_written += 1;
        }

        frames_written
    }

    /// PCM conversion: popcount decimation followed by the FIR low-pass.
    fn read_pcm(&mut self, buf: &mut [f32], max_frames: usize) -> usize {
        let channels = self.channels;
        let bytes_per_frame = self.bytes_per_frame;
        let total_bits = (bytes_per_frame * 8) as f32;
        let scale = 2.0 / total_bits;

        // Worst case DSD2048 → 44.1 kHz is 256 bytes per channel.
        let mut frame_bytes = [0u8; MAX_CHANNELS * 256];
        let mut frames_written = 0;

        while frames_written < max_frames {
            if !self.read_dsd_frame(&mut frame_bytes, bytes_per_frame) {
                break;
            }

            for channel in 0..channels {
                let bytes =
                    &frame_bytes[channel * bytes_per_frame..(channel + 1) * bytes_per_frame];
                let ones: u32 = bytes.iter().map(|byte| byte.count_ones()).sum();

                let raw = ones as f32 * scale - 1.0;
                buf[frames_written * channels + channel] = self.fir.process(channel, raw);
            }

            frames_written += 1;
        }

        frames_written
    }

    /// Reads the DSD bytes of one output frame for all channels into
    /// `out`, laid out `[ch0 bytes..][ch1 bytes..]..`, MSB-first.
    ///
    /// Returns `false` at end of stream.
    fn read_dsd_frame(&mut self, out: &mut [u8], bytes_per_channel: usize) -> bool {
        let channels = self.channels;
        match self.container {
            Container::Dsf => {
                for i in 0..bytes_per_channel {
                    if self.dsf_block_pos >= self.block_size && !self.read_next_dsf_blocks() {
                        return false;
                    }
                    for channel in 0..channels {
                        // DSF is LSB-first; restore MSB-first order.
                        out[channel * bytes_per_channel + i] =
                            BIT_REVERSE[self.dsf_blocks[channel][self.dsf_block_pos] as usize];
                    }
                    self.dsf_block_pos += 1;
                }
                true
            }
            Container::Dff => {
                // DFF interleaves per byte: b0ch0, b0ch1, b1ch0, ...
                let mut interleaved = [0u8; MAX_CHANNELS * 256];
                let wanted = bytes_per_channel * channels;
                match self.reader.read_exact(&mut interleaved[..wanted]) {
                    Ok(()) => {
                        for i in 0..bytes_per_channel {
                            for channel in 0..channels {
                                out[channel * bytes_per_channel + i] =
                                    interleaved[i * channels + channel];
                            }
                        }
                        true
                    }
                    Err(_) => false,
                }
            }
        }
    }

    /// Loads the next set of per-channel DSF blocks. A short block at the
    /// end of the file is zero-padded; no bytes at all means end of
    /// stream.
    fn read_next_dsf_blocks(&mut self) -> bool {
        for channel in 0..self.channels {
            let block = &mut self.dsf_blocks[channel];
            let mut filled = 0;
            while filled < block.len() {
                match self.reader.read(&mut block[filled..]) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(_) => return false,
                }
            }
            if filled == 0 {
                return false;
            }
            block[filled..].fill(0);
        }
        self.dsf_block_pos = 0;
        true
    }

    /// Seeks to a position in seconds.
    ///
    /// Repositions the underlying file, clears FIR history (PCM mode) and
    /// re-derives the DoP marker phase from the target frame parity (DoP
    /// mode) so alternation remains correct from the seek point.
    ///
    /// # Errors
    ///
    /// Returns `SeekFailed` when the position is invalid or the file
    /// cannot be repositioned.
    pub fn seek(&mut self, secs: f64) -> Result<()> {
        if secs < 0.0 || !secs.is_finite() {
            return Err(Error::seek_failed(format!("invalid position {secs}")));
        }

        let pcm_frame = ((secs * self.pcm_sample_rate) as i64).clamp(0, self.total_pcm_frames);
        let dsd_bytes_per_channel = pcm_frame as u64 * self.bytes_per_frame as u64;

        match self.container {
            Container::Dsf => {
                let block_size = self.block_size as u64;
                let block_index = dsd_bytes_per_channel / block_size;
                let pos_in_block = (dsd_bytes_per_channel % block_size) as usize;
                let file_offset = block_index * block_size * self.channels as u64;

                self.reader
                    .seek(SeekFrom::Start(self.data_offset + file_offset))
                    .map_err(|e| Error::seek_failed(format!("seek failed: {e}")))?;
                self.dsf_block_pos = self.block_size;
                if self.read_next_dsf_blocks() {
                    self.dsf_block_pos = pos_in_block;
                }
            }
            Container::Dff => {
                let byte_offset = dsd_bytes_per_channel * self.channels as u64;
                self.reader
                    .seek(SeekFrom::Start(self.data_offset + byte_offset))
                    .map_err(|e| Error::seek_failed(format!("seek failed: {e}")))?;
            }
        }

        self.pcm_frames_read = pcm_frame;

        match self.mode {
            DsdMode::Dop => {
                // Even frame positions carry 0x05, odd 0xFA.
                self.dop_marker = pcm_frame % 2 != 0;
            }
            DsdMode::PcmConversion => {
                // Clear filter history to avoid transients from stale state.
                self.fir.reset();
            }
        }

        Ok(())
    }

    /// Returns the output stream format.
    #[must_use]
    pub fn format(&self) -> StreamFormat {
        StreamFormat {
            sample_rate: self.pcm_sample_rate,
            channels: self.channels,
            bits_per_sample: if self.mode == DsdMode::Dop { 24 } else { 32 },
            total_frames: Some(self.total_pcm_frames),
            duration_secs: if self.total_pcm_frames > 0 && self.pcm_sample_rate > 0.0 {
                self.total_pcm_frames as f64 / self.pcm_sample_rate
            } else {
                0.0
            },
        }
    }

    /// Returns the current playback position in seconds.
    #[must_use]
    pub fn position_seconds(&self) -> f64 {
        if self.pcm_sample_rate <= 0.0 {
            return 0.0;
        }
        self.pcm_frames_read as f64 / self.pcm_sample_rate
    }

    /// The DSD rate class of the source.
    #[must_use]
    pub fn dsd_rate(&self) -> DsdRate {
        DsdRate::classify(self.dsd_rate)
    }

    /// The raw DSD bit rate in Hz.
    #[must_use]
    pub fn dsd_sample_rate_hz(&self) -> f64 {
        f64::from(self.dsd_rate)
    }

    /// Whether the decoder emits DoP frames.
    #[must_use]
    pub fn is_dop_mode(&self) -> bool {
        self.mode == DsdMode::Dop
    }

    /// Current DoP marker alternation state: `false` means the next
    /// frame carries 0x05, `true` means 0xFA.
    #[must_use]
    pub fn dop_marker_state(&self) -> bool {
        self.dop_marker
    }

    /// Restores the DoP marker alternation state, used when a gapless
    /// swap hands the phase of the outgoing stream to this decoder.
    pub fn set_dop_marker_state(&mut self, state: bool) {
        self.dop_marker = state;
    }

    // ── container parsing ────────────────────────────────────────────

    fn parse_dsf(reader: &mut BufReader<File>) -> Result<ParsedContainer> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic).map_err(open_err)?;
        if &magic != b"DSD " {
            return Err(Error::decoder_open_failed("missing DSD chunk"));
        }
        let _chunk_size = read_u64_le(reader)?;
        let _total_file_size = read_u64_le(reader)?;
        let _metadata_offset = read_u64_le(reader)?;

        reader.read_exact(&mut magic).map_err(open_err)?;
        if &magic != b"fmt " {
            return Err(Error::decoder_open_failed("missing fmt chunk"));
        }
        let fmt_chunk_size = read_u64_le(reader)?;
        let _format_version = read_u32_le(reader)?;
        let format_id = read_u32_le(reader)?;
        if format_id != 0 {
            return Err(Error::decoder_open_failed(format!(
                "unsupported DSF format id {format_id}"
            )));
        }
        let _channel_type = read_u32_le(reader)?;
        let channels = read_u32_le(reader)? as usize;
        let dsd_rate = read_u32_le(reader)?;
        let bits_per_sample = read_u32_le(reader)?;
        if bits_per_sample != 1 {
            return Err(Error::decoder_open_failed(format!(
                "unsupported DSF bits per sample {bits_per_sample}"
            )));
        }
        let total_dsd_samples = read_u64_le(reader)?;
        let block_size = read_u32_le(reader)? as usize;
        let _reserved = read_u32_le(reader)?;

        // The fmt chunk starts right after the 28-byte DSD header.
        reader
            .seek(SeekFrom::Start(28 + fmt_chunk_size))
            .map_err(open_err)?;

        reader.read_exact(&mut magic).map_err(open_err)?;
        if &magic != b"data" {
            return Err(Error::decoder_open_failed("missing data chunk"));
        }
        let _data_chunk_size = read_u64_le(reader)?;
        let data_offset = reader.stream_position().map_err(open_err)?;

        Ok(ParsedContainer {
            container: Container::Dsf,
            channels,
            dsd_rate,
            total_dsd_samples,
            block_size: if block_size == 0 { 4096 } else { block_size },
            data_offset,
        })
    }

    fn parse_dff(reader: &mut BufReader<File>) -> Result<ParsedContainer> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic).map_err(open_err)?;
        if &magic != b"FRM8" {
            return Err(Error::decoder_open_failed("missing FRM8 chunk"));
        }
        let _form_size = read_u64_be(reader)?;

        reader.read_exact(&mut magic).map_err(open_err)?;
        if &magic != b"DSD " {
            return Err(Error::decoder_open_failed("not a DSD form"));
        }

        let mut channels = 0usize;
        let mut dsd_rate = 0u32;
        let mut data_offset = 0u64;
        let mut data_size = 0u64;

        loop {
            let mut chunk_id = [0u8; 4];
            if reader.read_exact(&mut chunk_id).is_err() {
                break;
            }
            let chunk_size = read_u64_be(reader)?;

            match &chunk_id {
                b"PROP" => {
                    let mut prop_type = [0u8; 4];
                    reader.read_exact(&mut prop_type).map_err(open_err)?;
                    let mut remaining = chunk_size.saturating_sub(4);

                    while remaining >= 12 {
                        let mut sub_id = [0u8; 4];
                        reader.read_exact(&mut sub_id).map_err(open_err)?;
                        let sub_size = read_u64_be(reader)?;

                        match &sub_id {
                            b"FS  " => {
                                dsd_rate = read_u32_be(reader)?;
                                if sub_size > 4 {
                                    reader
                                        .seek(SeekFrom::Current((sub_size - 4) as i64))
                                        .map_err(open_err)?;
                                }
                            }
                            b"CHNL" => {
                                channels = read_u16_be(reader)? as usize;
                                if sub_size > 2 {
                                    reader
                                        .seek(SeekFrom::Current((sub_size - 2) as i64))
                                        .map_err(open_err)?;
                                }
                            }
                            _ => {
                                reader
                                    .seek(SeekFrom::Current(sub_size as i64))
                                    .map_err(open_err)?;
                            }
                        }
                        remaining = remaining.saturating_sub(12 + sub_size);
                    }
                }
                b"DSD " => {
                    data_offset = reader.stream_position().map_err(open_err)?;
                    data_size = chunk_size;
                    break;
                }
                _ => {
                    reader
                        .seek(SeekFrom::Current(chunk_size as i64))
                        .map_err(open_err)?;
                }
            }
        }

        if data_offset == 0 {
            return Err(Error::decoder_open_failed("missing DSD data chunk"));
        }
        if channels == 0 {
            return Err(Error::decoder_open_failed("missing CHNL chunk"));
        }

        Ok(ParsedContainer {
            container: Container::Dff,
            channels,
            dsd_rate,
            total_dsd_samples: data_size * 8 / channels as u64,
            block_size: 0,
            data_offset,
        })
    }
}

/// Result of container header parsing.
struct ParsedContainer {
    container: Container,
    channels: usize,
    dsd_rate: u32,
    total_dsd_samples: u64,
    block_size: usize,
    data_offset: u64,
}

fn open_err(e: std::io::Error) -> Error {
    Error::decoder_open_failed(format!("truncated container: {e}"))
}

fn read_u16_be(reader: &mut impl Read) -> Result<u16> {
    let mut bytes = [0u8; 2];
    reader.read_exact(&mut bytes).map_err(open_err)?;
    Ok(u16::from_be_bytes(bytes))
}

fn read_u32_le(reader: &mut impl Read) -> Result<u32> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes).map_err(open_err)?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_u32_be(reader: &mut impl Read) -> Result<u32> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes).map_err(open_err)?;
    Ok(u32::from_be_bytes(bytes))
}

fn read_u64_le(reader: &mut impl Read) -> Result<u64> {
    let mut bytes = [0u8; 8];
    reader.read_exact(&mut bytes).map_err(open_err)?;
    Ok(u64::from_le_bytes(bytes))
}

fn read_u64_be(reader: &mut impl Read) -> Result<u64> {
    let mut bytes = [0u8; 8];
    reader.read_exact(&mut bytes).map_err(open_err)?;
    Ok(u64::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::{DsdDecoder, DsdMode, DsdRate, BIT_REVERSE};
    use std::io::Write;
    use std::path::PathBuf;

    /// Builds a minimal stereo DSF file with the given per-channel
    /// payload (LSB-first on disk, as the format specifies).
    pub(crate) fn write_dsf(
        dir: &std::path::Path,
        name: &str,
        dsd_rate: u32,
        channels: u32,
        payload_per_channel: &[u8],
        block_size: u32,
    ) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();

        let blocks_per_channel = payload_per_channel.len().div_ceil(block_size as usize);
        let data_payload_len = blocks_per_channel * block_size as usize * channels as usize;
        let data_chunk_size = 12 + data_payload_len as u64;
        let total_file_size = 28 + 52 + data_chunk_size;

        // DSD chunk.
        file.write_all(b"DSD ").unwrap();
        file.write_all(&28u64.to_le_bytes()).unwrap();
        file.write_all(&total_file_size.to_le_bytes()).unwrap();
        file.write_all(&0u64.to_le_bytes()).unwrap();

        // fmt chunk.
        file.write_all(b"fmt ").unwrap();
        file.write_all(&52u64.to_le_bytes()).unwrap();
        file.write_all(&1u32.to_le_bytes()).unwrap(); // version
        file.write_all(&0u32.to_le_bytes()).unwrap(); // format id: raw DSD
        file.write_all(&2u32.to_le_bytes()).unwrap(); // channel type: stereo
        file.write_all(&channels.to_le_bytes()).unwrap();
        file.write_all(&dsd_rate.to_le_bytes()).unwrap();
        file.write_all(&1u32.to_le_bytes()).unwrap(); // bits per sample
        let sample_count = (payload_per_channel.len() * 8) as u64;
        file.write_all(&sample_count.to_le_bytes()).unwrap();
        file.write_all(&block_size.to_le_bytes()).unwrap();
        file.write_all(&0u32.to_le_bytes()).unwrap(); // reserved

        // data chunk: block-interleaved per channel, zero-padded blocks.
        file.write_all(b"data").unwrap();
        file.write_all(&data_chunk_size.to_le_bytes()).unwrap();
        for block in 0..blocks_per_channel {
            for _ in 0..channels {
                let start = block * block_size as usize;
                let end = (start + block_size as usize).min(payload_per_channel.len());
                let mut chunk = vec![0u8; block_size as usize];
                if start < payload_per_channel.len() {
                    chunk[..end - start].copy_from_slice(&payload_per_channel[start..end]);
                }
                file.write_all(&chunk).unwrap();
            }
        }

        path
    }

    #[test]
    fn bit_reverse_table_matches_reference() {
        assert_eq!(BIT_REVERSE[0x00], 0x00);
        assert_eq!(BIT_REVERSE[0x01], 0x80);
        assert_eq!(BIT_REVERSE[0x80], 0x01);
        assert_eq!(BIT_REVERSE[0xFF], 0xFF);
        assert_eq!(BIT_REVERSE[0xA5], 0xA5);
        // Involution: reversing twice is the identity.
        for i in 0..256 {
            assert_eq!(BIT_REVERSE[BIT_REVERSE[i] as usize] as usize, i);
        }
    }

    #[test]
    fn rate_classification_uses_midpoints() {
        assert_eq!(DsdRate::classify(2_822_400), DsdRate::Dsd64);
        assert_eq!(DsdRate::classify(2_822_500), DsdRate::Dsd64);
        assert_eq!(DsdRate::classify(5_644_800), DsdRate::Dsd128);
        assert_eq!(DsdRate::classify(11_289_600), DsdRate::Dsd256);
        assert_eq!(DsdRate::classify(22_579_200), DsdRate::Dsd512);
        assert_eq!(DsdRate::classify(45_158_400), DsdRate::Dsd1024);
        assert_eq!(DsdRate::classify(90_316_800), DsdRate::Dsd2048);

        // Values past a midpoint land in the class of the NEAREST
        // standard rate, not the one below.
        assert_eq!(DsdRate::classify(5_000_000), DsdRate::Dsd128);
        assert_eq!(DsdRate::classify(4_233_599), DsdRate::Dsd64);
        assert_eq!(DsdRate::classify(4_233_600), DsdRate::Dsd128);
        assert_eq!(DsdRate::classify(10_000_000), DsdRate::Dsd256);
        assert_eq!(DsdRate::classify(67_737_600), DsdRate::Dsd2048);
    }

    #[test]
    fn dop_frames_carry_payload_and_alternating_markers() {
        let dir = tempfile::tempdir().unwrap();
        // Payload bytes chosen so the MSB-first value is recognizable:
        // on-disk DSF bytes are LSB-first, so pre-reverse them here.
        let msb_payload: Vec<u8> = (0u8..64).collect();
        let disk_payload: Vec<u8> = msb_payload
            .iter()
            .map(|&b| BIT_REVERSE[b as usize])
            .collect();
        let path = write_dsf(dir.path(), "dop.dsf", 2_822_400, 2, &disk_payload, 4096);

        let mut decoder = DsdDecoder::open(&path, DsdMode::Dop, 44_100).unwrap();
        let format = decoder.format();
        assert!((format.sample_rate - 2_822_400.0 / 16.0).abs() < f64::EPSILON);

        let frames = 32;
        let mut buf = vec![0.0_f32; frames * 2];
        let produced = decoder.read(&mut buf, frames);
        assert_eq!(produced, disk_payload.len() / 2);

        for frame in 0..produced {
            for channel in 0..2 {
                let sample = buf[frame * 2 + channel];
                let word = (sample * 8_388_608.0).round() as i32;
                let unsigned = (word & 0x00FF_FFFF) as u32;
                let marker = (unsigned >> 16) as u8;
                let expected_marker = if frame % 2 == 0 { 0x05 } else { 0xFA };
                assert_eq!(marker, expected_marker, "frame {frame}");

                // Low 16 bits carry the file's DSD bytes in order.
                let hi = ((unsigned >> 8) & 0xFF) as u8;
                let lo = (unsigned & 0xFF) as u8;
                assert_eq!(hi, msb_payload[frame * 2]);
                assert_eq!(lo, msb_payload[frame * 2 + 1]);
            }
        }
    }

    #[test]
    fn dop_marker_state_survives_and_restores() {
        let dir = tempfile::tempdir().unwrap();
        let payload = vec![0x69u8; 64];
        let path = write_dsf(dir.path(), "marker.dsf", 2_822_400, 2, &payload, 4096);

        let mut decoder = DsdDecoder::open(&path, DsdMode::Dop, 44_100).unwrap();
        let mut buf = vec![0.0_f32; 2 * 3];
        assert_eq!(decoder.read(&mut buf, 3), 3);
        // After an odd number of frames the next marker is 0xFA.
        assert!(decoder.dop_marker_state());

        decoder.set_dop_marker_state(false);
        assert!(!decoder.dop_marker_state());
    }

    #[test]
    fn seek_rederives_marker_parity() {
        let dir = tempfile::tempdir().unwrap();
        let payload = vec![0x55u8; 4096];
        let path = write_dsf(dir.path(), "seekparity.dsf", 2_822_400, 2, &payload, 4096);

        let mut decoder = DsdDecoder::open(&path, DsdMode::Dop, 44_100).unwrap();
        let rate = decoder.format().sample_rate;

        // Seek to an odd frame index.
        let odd_frame = 33.0 / rate;
        decoder.seek(odd_frame).unwrap();
        assert!(decoder.dop_marker_state());

        // And back to an even one.
        decoder.seek(32.0 / rate).unwrap();
        assert!(!decoder.dop_marker_state());
    }

    #[test]
    fn pcm_mode_emits_decimated_frames_in_range() {
        let dir = tempfile::tempdir().unwrap();
        // 0x55 MSB-first alternates bits, a "silent" DSD idle-ish pattern.
        let disk_payload: Vec<u8> = std::iter::repeat(BIT_REVERSE[0x55])
            .take(64 * 200)
            .collect();
        let path = write_dsf(dir.path(), "pcm.dsf", 2_822_400, 2, &disk_payload, 4096);

        let mut decoder = DsdDecoder::open(&path, DsdMode::PcmConversion, 44_100).unwrap();
        let format = decoder.format();
        assert!((format.sample_rate - 44_100.0).abs() < f64::EPSILON);

        let mut buf = vec![0.0_f32; 2 * 128];
        let produced = decoder.read(&mut buf, 128);
        assert!(produced > 0);
        // A balanced bit pattern decimates to (near) silence; every
        // sample stays well inside [-1, 1].
        for sample in &buf[..produced * 2] {
            assert!(sample.abs() <= 1.0);
        }
    }

    #[test]
    fn pcm_target_rate_must_be_byte_aligned() {
        assert_eq!(DsdDecoder::effective_pcm_target(2_822_400, 44_100), 44_100);
        assert_eq!(DsdDecoder::effective_pcm_target(2_822_400, 88_200), 88_200);
        assert_eq!(
            DsdDecoder::effective_pcm_target(2_822_400, 176_400),
            176_400
        );
        assert_eq!(
            DsdDecoder::effective_pcm_target(2_822_400, 352_800),
            352_800
        );
        // 48 kHz does not divide the 44.1-family DSD rate.
        assert_eq!(DsdDecoder::effective_pcm_target(2_822_400, 48_000), 44_100);
        // DSD128 at 352.8 kHz leaves a ratio of 16 — still aligned.
        assert_eq!(
            DsdDecoder::effective_pcm_target(5_644_800, 352_800),
            352_800
        );
    }

    #[test]
    fn position_tracks_frames_read() {
        let dir = tempfile::tempdir().unwrap();
        let payload = vec![0xAAu8; 64 * 100];
        let path = write_dsf(dir.path(), "pos.dsf", 2_822_400, 2, &payload, 4096);

        let mut decoder = DsdDecoder::open(&path, DsdMode::PcmConversion, 44_100).unwrap();
        let mut buf = vec![0.0_f32; 2 * 50];
        let produced = decoder.read(&mut buf, 50);
        assert_eq!(produced, 50);
        assert!((decoder.position_seconds() - 50.0 / 44_100.0).abs() < 1e-9);
    }
}
