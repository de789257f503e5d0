//! General PCM decoder built on Symphonia.
//!
//! Opens a container by path, selects the default audio track,
//! instantiates the matching codec and converts every packet to
//! interleaved 32-bit float at the codec's native rate and channel
//! count. No rate conversion happens here; the upsampler owns that.
//!
//! # Error Handling
//!
//! The decoder implements robust recovery during `read`:
//! * Skips corrupted packets (up to 3 consecutive)
//! * Handles codec reset requests by resetting and reloading the spec
//! * Gracefully handles end of stream
//! * Clears the sample buffer after any decoder error
//!
//! A transient decode error makes `read` return 0 frames but leaves the
//! decoder open, so the engine can treat it as end-of-stream and advance
//! to the next track.
//!
//! # Performance
//!
//! The decoded-packet sample buffer is allocated once per codec spec and
//! reused across reads; `read` itself performs no allocation, which is
//! what allows the real-time callback to call it directly.

use std::{fs::File, path::Path, time::Duration};

use symphonia::core::{
    audio::SampleBuffer,
    codecs::{
        CodecParameters, CodecType, DecoderOptions, CODEC_TYPE_AAC, CODEC_TYPE_ALAC,
        CODEC_TYPE_FLAC, CODEC_TYPE_MP3, CODEC_TYPE_OPUS, CODEC_TYPE_PCM_F32BE,
        CODEC_TYPE_PCM_F32LE, CODEC_TYPE_PCM_F64BE, CODEC_TYPE_PCM_F64LE, CODEC_TYPE_PCM_S16BE,
        CODEC_TYPE_PCM_S16LE, CODEC_TYPE_PCM_S24BE, CODEC_TYPE_PCM_S24LE, CODEC_TYPE_PCM_S32BE,
        CODEC_TYPE_PCM_S32LE, CODEC_TYPE_PCM_S8, CODEC_TYPE_PCM_U16BE, CODEC_TYPE_PCM_U16LE,
        CODEC_TYPE_PCM_U24BE, CODEC_TYPE_PCM_U24LE, CODEC_TYPE_PCM_U32BE, CODEC_TYPE_PCM_U32LE,
        CODEC_TYPE_PCM_U8, CODEC_TYPE_VORBIS,
    },
    errors::Error as SymphoniaError,
    formats::{FormatOptions, FormatReader, SeekMode, SeekTo},
    io::MediaSourceStream,
    meta::MetadataOptions,
    probe::Hint,
    units::Time,
};

use crate::{
    decoder::StreamFormat,
    error::{Error, Result},
};

/// Fallback sample rate when the codec does not report one.
const DEFAULT_SAMPLE_RATE: u32 = 44_100;

/// Maximum number of consecutive corrupted packets to skip before
/// treating the stream as ended.
const MAX_RETRIES: usize = 3;

/// Codec types the auto-sample-rate feature counts as lossless.
///
/// This list is deliberately explicit (FLAC, ALAC and the PCM family);
/// extend it by editing, not by heuristics.
const LOSSLESS_CODECS: &[CodecType] = &[
    CODEC_TYPE_FLAC,
    CODEC_TYPE_ALAC,
    CODEC_TYPE_PCM_S8,
    CODEC_TYPE_PCM_U8,
    CODEC_TYPE_PCM_S16LE,
    CODEC_TYPE_PCM_S16BE,
    CODEC_TYPE_PCM_U16LE,
    CODEC_TYPE_PCM_U16BE,
    CODEC_TYPE_PCM_S24LE,
    CODEC_TYPE_PCM_S24BE,
    CODEC_TYPE_PCM_U24LE,
    CODEC_TYPE_PCM_U24BE,
    CODEC_TYPE_PCM_S32LE,
    CODEC_TYPE_PCM_S32BE,
    CODEC_TYPE_PCM_U32LE,
    CODEC_TYPE_PCM_U32BE,
    CODEC_TYPE_PCM_F32LE,
    CODEC_TYPE_PCM_F32BE,
    CODEC_TYPE_PCM_F64LE,
    CODEC_TYPE_PCM_F64BE,
];

/// PCM decoder for any container/codec pair Symphonia supports.
///
/// Produced samples are interleaved `f32` in [-1, 1] at the codec's
/// native sample rate, with the codec's native channel count clamped to
/// at least 1.
pub struct PcmDecoder {
    /// Format reader (demuxer) for extracting encoded audio packets.
    demuxer: Box<dyn FormatReader>,

    /// Codec decoder for converting encoded packets to PCM samples.
    decoder: Box<dyn symphonia::core::codecs::Decoder>,

    /// Track id of the selected audio stream; packets from other tracks
    /// are skipped.
    track_id: u32,

    /// Codec type, for `codec_name` and the lossless classification.
    codec: CodecType,

    /// Reusable sample buffer holding the last decoded packet.
    buffer: Option<SampleBuffer<f32>>,

    /// Read offset into `buffer`, in interleaved samples.
    position: usize,

    /// Number of audio channels in the stream.
    channels: usize,

    /// Sample rate of the audio stream in Hz.
    sample_rate: u32,

    /// Total frames in the stream, when known.
    total_frames: Option<i64>,

    /// Total duration of the stream, when known.
    total_duration: Option<Duration>,

    /// Informational bit depth of the source.
    bits_per_sample: u32,

    /// Frames handed out so far, driving `position_seconds`.
    frames_decoded: i64,
}

impl std::fmt::Debug for PcmDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PcmDecoder")
            .field("track_id", &self.track_id)
            .field("codec", &self.codec)
            .field("channels", &self.channels)
            .field("sample_rate", &self.sample_rate)
            .field("total_frames", &self.total_frames)
            .field("total_duration", &self.total_duration)
            .field("bits_per_sample", &self.bits_per_sample)
            .field("frames_decoded", &self.frames_decoded)
            .finish_non_exhaustive()
    }
}

impl PcmDecoder {
    /// Opens a container by path and prepares the first audio stream for
    /// decoding.
    ///
    /// # Errors
    ///
    /// Returns `DecoderOpenFailed` when the container cannot be parsed,
    /// no audio stream exists, or codec initialization fails.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| Error::file_unreadable(format!("{}: {e}", path.display())))?;
        let stream = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|ext| ext.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                stream,
                &FormatOptions {
                    enable_gapless: true,
                    ..Default::default()
                },
                &MetadataOptions::default(),
            )
            .map_err(|e| {
                Error::decoder_open_failed(format!("probe failed for {}: {e}", path.display()))
            })?;

        let demuxer = probed.format;
        let track = demuxer
            .default_track()
            .ok_or_else(|| Error::decoder_open_failed("no audio stream in container"))?;
        let track_id = track.id;
        let codec = track.codec_params.codec;

        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| Error::decoder_open_failed(format!("codec init failed: {e}")))?;

        // Re-read the parameters from the live decoder: initialization may
        // surface information the probe alone could not.
        let codec_params = decoder.codec_params();
        let channels = Self::calc_channels(codec_params).unwrap_or(2).max(1);
        let sample_rate = codec_params.sample_rate.unwrap_or(DEFAULT_SAMPLE_RATE);
        let total_frames = Self::calc_total_frames(codec_params);
        let total_duration = Self::calc_total_duration(codec_params);
        let bits_per_sample = codec_params
            .bits_per_sample
            .or(codec_params.bits_per_coded_sample)
            .unwrap_or(16);

        debug!(
            "pcm decoder open: {} Hz, {channels} ch, {bits_per_sample} bit, {:?} frames",
            sample_rate, total_frames,
        );

        Ok(Self {
            demuxer,
            decoder,
            track_id,
            codec,
            buffer: None,
            position: 0,
            channels,
            sample_rate,
            total_frames,
            total_duration,
            bits_per_sample,
            frames_decoded: 0,
        })
    }

    /// Reads up to `max_frames` interleaved frames into `buf`, draining
    /// the residual buffer first, then pulling new packets until the
    /// request is filled or the stream ends.
    ///
    /// Returns the number of frames produced; 0 means end of stream or
    /// an unrecoverable decode error (the decoder stays open either way).
    pub fn read(&mut self, buf: &mut [f32], max_frames: usize) -> usize {
        let channels = self.channels;
        let max_frames = max_frames.min(buf.len() / channels.max(1));
        let mut frames_written = 0;

        while frames_written < max_frames {
            let available = self
                .buffer
                .as_ref()
                .map_or(0, |buffer| buffer.len().saturating_sub(self.position));

            if available == 0 {
                if !self.next_packet() {
                    break;
                }
                continue;
            }

            let wanted = (max_frames - frames_written) * channels;
            let to_copy = available.min(wanted);
            if let Some(buffer) = self.buffer.as_ref() {
                let src = &buffer.samples()[self.position..self.position + to_copy];
                let dst_start = frames_written * channels;
                buf[dst_start..dst_start + to_copy].copy_from_slice(src);
            }
            self.position += to_copy;
            frames_written += to_copy / channels;
        }

        self.frames_decoded += frames_written as i64;
        frames_written
    }

    /// Seeks to a position in seconds.
    ///
    /// Flushes codec state and zeroes the residual buffer; seeking is a
    /// demuxer operation, so the codec is reset to avoid glitches from
    /// stale filter state.
    ///
    /// # Errors
    ///
    /// Returns `SeekFailed` when the demuxer rejects the position. The
    /// playback position is unchanged in that case.
    pub fn seek(&mut self, secs: f64) -> Result<()> {
        if secs < 0.0 || !secs.is_finite() {
            return Err(Error::seek_failed(format!("invalid position {secs}")));
        }

        self.demuxer
            .seek(
                SeekMode::Accurate,
                SeekTo::Time {
                    track_id: Some(self.track_id),
                    time: Time::from(secs),
                },
            )
            .map_err(|e| Error::seek_failed(format!("seek to {secs}s failed: {e}")))?;

        self.decoder.reset();
        self.buffer = None;
        self.position = 0;
        self.frames_decoded = (secs * f64::from(self.sample_rate)) as i64;

        Ok(())
    }

    /// Returns the stream format descriptor.
    #[must_use]
    pub fn format(&self) -> StreamFormat {
        StreamFormat {
            sample_rate: f64::from(self.sample_rate),
            channels: self.channels,
            bits_per_sample: self.bits_per_sample,
            total_frames: self.total_frames,
            duration_secs: self.total_duration.map_or(0.0, |d| d.as_secs_f64()),
        }
    }

    /// Returns the current playback position in seconds.
    #[must_use]
    pub fn position_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames_decoded as f64 / f64::from(self.sample_rate)
    }

    /// Returns the codec name for signal-path display.
    #[must_use]
    pub fn codec_name(&self) -> Option<&'static str> {
        match self.codec {
            CODEC_TYPE_FLAC => Some("FLAC"),
            CODEC_TYPE_ALAC => Some("ALAC"),
            CODEC_TYPE_MP3 => Some("MP3"),
            CODEC_TYPE_AAC => Some("AAC"),
            CODEC_TYPE_VORBIS => Some("Vorbis"),
            CODEC_TYPE_OPUS => Some("Opus"),
            codec if LOSSLESS_CODECS.contains(&codec) => Some("PCM/WAV"),
            _ => None,
        }
    }

    /// Whether the source codec is in the explicit lossless list.
    #[must_use]
    pub fn is_lossless(&self) -> bool {
        LOSSLESS_CODECS.contains(&self.codec)
    }

    /// Extracts the channel count from codec parameters.
    fn calc_channels(codec_params: &CodecParameters) -> Option<usize> {
        codec_params.channels.map(|channels| channels.count())
    }

    /// Total frames from the codec parameters, when reported.
    fn calc_total_frames(codec_params: &CodecParameters) -> Option<i64> {
        codec_params.n_frames.and_then(|n| i64::try_from(n).ok())
    }

    /// Total duration when both time base and frame count are available.
    fn calc_total_duration(codec_params: &CodecParameters) -> Option<Duration> {
        if let (Some(time_base), Some(frames)) = (codec_params.time_base, codec_params.n_frames) {
            Some(time_base.calc_time(frames).into())
        } else {
            None
        }
    }

    /// Updates cached stream parameters after a codec reset.
    fn reload_spec(&mut self) {
        let codec_params = self.decoder.codec_params();

        self.sample_rate = codec_params.sample_rate.unwrap_or(DEFAULT_SAMPLE_RATE);
        self.total_frames = Self::calc_total_frames(codec_params);
        self.total_duration = Self::calc_total_duration(codec_params);
        if let Some(channels) = Self::calc_channels(codec_params) {
            self.channels = channels.max(1);
        }

        // Drop the buffer to force reinitialization with the new spec.
        self.buffer = None;
        self.position = 0;

        debug!(
            "pcm decoder reloaded: {} Hz, {} ch",
            self.sample_rate, self.channels,
        );
    }

    /// Decodes the next packet into the sample buffer.
    ///
    /// Returns `false` at end of stream or after an unrecoverable error;
    /// the internal buffer is cleared in that case so the next read
    /// starts fresh.
    fn next_packet(&mut self) -> bool {
        let mut discarded = 0;
        loop {
            if discarded > MAX_RETRIES {
                error!("discarded too many corrupt packets, giving up on stream");
                self.buffer = None;
                return false;
            }

            let packet = match self.demuxer.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::ResetRequired) => {
                    // The track list changed; recreate the codec decoder.
                    trace!("re-creating pcm decoder after demuxer reset");
                    let Some(track) = self.demuxer.default_track() else {
                        self.buffer = None;
                        return false;
                    };
                    self.track_id = track.id;
                    match symphonia::default::get_codecs()
                        .make(&track.codec_params, &DecoderOptions::default())
                    {
                        Ok(decoder) => {
                            self.decoder = decoder;
                            self.reload_spec();
                            continue;
                        }
                        Err(e) => {
                            error!("decoder re-creation failed: {e}");
                            self.buffer = None;
                            return false;
                        }
                    }
                }
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    // Normal end of stream.
                    self.buffer = None;
                    return false;
                }
                Err(e) => {
                    error!("demuxer error, treating as end of stream: {e}");
                    self.buffer = None;
                    return false;
                }
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    let buffer = match self.buffer.as_mut() {
                        Some(buffer) => buffer,
                        None => self
                            .buffer
                            .insert(SampleBuffer::new(decoded.capacity() as u64, *decoded.spec())),
                    };
                    buffer.copy_interleaved_ref(decoded);
                    self.position = 0;
                    return true;
                }

                // The packet is undecodable; discard it and continue with
                // the next one. The sample buffer must be cleared after
                // any decoder error.
                Err(SymphoniaError::DecodeError(e)) => {
                    error!("discarding malformed packet: {e}");
                    self.buffer = None;
                    discarded += 1;
                }
                Err(SymphoniaError::IoError(e)) => {
                    error!("discarding unreadable packet: {e}");
                    self.buffer = None;
                    discarded += 1;
                }

                // The decoded stream parameters changed mid-stream.
                Err(SymphoniaError::ResetRequired) => {
                    self.decoder.reset();
                    self.reload_spec();
                }

                Err(e) => {
                    error!("unrecoverable decode error: {e}");
                    self.buffer = None;
                    return false;
                }
            }
        }
    }
}
