//! HRTF binaural rendering.
//!
//! Places the stereo image on two virtual loudspeakers at ±`angle`
//! degrees and renders them through head-related transfer functions:
//! each input channel is convolved with the per-ear FIR pair measured
//! nearest its virtual speaker position, so
//!
//! ```text
//! out_left  = L * h_left(-angle)  + R * h_left(+angle)
//! out_right = L * h_right(-angle) + R * h_right(+angle)
//! ```
//!
//! Filter pairs come from a SOFA file. SOFA is netCDF-classic
//! underneath; this module reads exactly the standard
//! `SimpleFreeFieldHRIR` layout (`Data.IR` as `[M][R][N]`,
//! `SourcePosition` as `[M][3]`, `Data.SamplingRate`) and rejects
//! anything else as a load error — the full format is out of scope.
//!
//! HRTF is mutually exclusive with crossfeed; when both are enabled the
//! render chain runs HRTF and skips crossfeed.

use std::path::Path;

use crate::{
    dsp::DspStage,
    error::{Error, Result},
};

/// Default virtual speaker angle in degrees.
pub const DEFAULT_SPEAKER_ANGLE: f32 = 30.0;

/// Allowed virtual speaker angle range in degrees.
pub const SPEAKER_ANGLE_RANGE: (f32, f32) = (10.0, 90.0);

/// Per-ear FIR pairs indexed by source azimuth.
#[derive(Clone, Debug)]
pub struct HrtfFilterSet {
    /// Sample rate the impulse responses were measured at.
    pub sample_rate: u32,
    /// Source azimuth in degrees, 0 = front, counter-clockwise positive
    /// (SOFA convention: 90 = left).
    pub azimuths_deg: Vec<f32>,
    /// Left-ear impulse response per measurement.
    pub left: Vec<Vec<f32>>,
    /// Right-ear impulse response per measurement.
    pub right: Vec<Vec<f32>>,
}

impl HrtfFilterSet {
    /// Loads the filter set from a SOFA file.
    ///
    /// # Errors
    ///
    /// Returns `DecoderOpenFailed` when the file is not netCDF-classic
    /// or does not carry the `SimpleFreeFieldHRIR` variables.
    pub fn from_sofa(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .map_err(|e| Error::file_unreadable(format!("{}: {e}", path.display())))?;
        let file = netcdf::NetcdfClassic::parse(&bytes)?;

        let ir = file
            .variable("Data.IR")
            .ok_or_else(|| Error::decoder_open_failed("SOFA file has no Data.IR variable"))?;
        let positions = file.variable("SourcePosition").ok_or_else(|| {
            Error::decoder_open_failed("SOFA file has no SourcePosition variable")
        })?;
        let rate = file
            .variable("Data.SamplingRate")
            .and_then(|v| v.values.first().copied())
            .unwrap_or(44_100.0);

        if ir.dims.len() != 3 || ir.dims[1] != 2 {
            return Err(Error::decoder_open_failed(format!(
                "unsupported Data.IR layout {:?} (expected [M][2][N])",
                ir.dims
            )));
        }
        let measurements = ir.dims[0];
        let taps = ir.dims[2];
        if positions.dims.len() != 2
            || positions.dims[0] != measurements
            || positions.dims[1] < 2
        {
            return Err(Error::decoder_open_failed(format!(
                "unsupported SourcePosition layout {:?}",
                positions.dims
            )));
        }

        let coords = positions.dims[1];
        let mut azimuths_deg = Vec::new();
        let mut left = Vec::new();
        let mut right = Vec::new();

        for m in 0..measurements {
            let azimuth = positions.values[m * coords] as f32;
            let elevation = positions.values[m * coords + 1] as f32;
            // Horizontal plane only; ±5° absorbs measurement grids that
            // don't sample elevation 0 exactly.
            if elevation.abs() > 5.0 {
                continue;
            }

            let base = m * 2 * taps;
            left.push(
                ir.values[base..base + taps]
                    .iter()
                    .map(|&v| v as f32)
                    .collect(),
            );
            right.push(
                ir.values[base + taps..base + 2 * taps]
                    .iter()
                    .map(|&v| v as f32)
                    .collect(),
            );
            azimuths_deg.push(azimuth.rem_euclid(360.0));
        }

        if azimuths_deg.is_empty() {
            return Err(Error::decoder_open_failed(
                "SOFA file has no horizontal-plane measurements",
            ));
        }

        info!(
            "HRTF loaded: {} ({} positions, {} taps, {} Hz)",
            path.display(),
            azimuths_deg.len(),
            taps,
            rate as u32,
        );

        Ok(Self {
            sample_rate: rate as u32,
            azimuths_deg,
            left,
            right,
        })
    }

    /// Interpolates the per-ear pair for a source azimuth by linearly
    /// blending the two bracketing measurements (circular distance).
    #[must_use]
    pub fn interpolate(&self, azimuth_deg: f32) -> (Vec<f32>, Vec<f32>) {
        let target = azimuth_deg.rem_euclid(360.0);

        let distance = |a: f32| -> f32 {
            let d = (a - target).rem_euclid(360.0);
            d.min(360.0 - d)
        };

        // The two closest measurements on either side of the target.
        let mut nearest = 0;
        let mut second = 0;
        let mut best = f32::MAX;
        let mut best2 = f32::MAX;
        for (index, &azimuth) in self.azimuths_deg.iter().enumerate() {
            let d = distance(azimuth);
            if d < best {
                best2 = best;
                second = nearest;
                best = d;
                nearest = index;
            } else if d < best2 {
                best2 = d;
                second = index;
            }
        }

        let span = best + best2;
        let weight = if span > f32::EPSILON { best2 / span } else { 1.0 };

        let blend = |a: &[f32], b: &[f32]| -> Vec<f32> {
            a.iter()
                .zip(b.iter())
                .map(|(&x, &y)| x * weight + y * (1.0 - weight))
                .collect()
        };

        (
            blend(&self.left[nearest], &self.left[second]),
            blend(&self.right[nearest], &self.right[second]),
        )
    }
}

/// One direct-form FIR with its delay-line history.
struct Fir {
    coeffs: Vec<f32>,
}

impl Fir {
    fn convolve(&self, history: &[f32], pos: usize) -> f32 {
        let len = history.len();
        let mut acc = 0.0;
        let mut p = pos;
        for &coeff in &self.coeffs {
            acc += history[p] * coeff;
            p = if p == 0 { len - 1 } else { p - 1 };
        }
        acc
    }
}

/// Binaural HRTF rendering stage (stereo only).
pub struct HrtfProcessor {
    enabled: bool,
    speaker_angle: f32,
    filters: Option<HrtfFilterSet>,

    // Rendered filter pairs for the two virtual speakers.
    left_to_left: Fir,
    left_to_right: Fir,
    right_to_left: Fir,
    right_to_right: Fir,

    // Input delay lines, one per source channel.
    history_left: Vec<f32>,
    history_right: Vec<f32>,
    history_pos: usize,
}

impl HrtfProcessor {
    /// Creates a disabled HRTF stage with no filters loaded.
    #[must_use]
    pub fn new() -> Self {
        Self {
            enabled: false,
            speaker_angle: DEFAULT_SPEAKER_ANGLE,
            filters: None,
            left_to_left: Fir { coeffs: Vec::new() },
            left_to_right: Fir { coeffs: Vec::new() },
            right_to_left: Fir { coeffs: Vec::new() },
            right_to_right: Fir { coeffs: Vec::new() },
            history_left: Vec::new(),
            history_right: Vec::new(),
            history_pos: 0,
        }
    }

    /// Loads per-ear filters from a SOFA file and renders the virtual
    /// speaker pair.
    ///
    /// # Errors
    ///
    /// Returns `DecoderOpenFailed` on parse failure; the previously
    /// loaded set (if any) stays active.
    pub fn load_sofa(&mut self, path: &Path) -> Result<()> {
        let filters = HrtfFilterSet::from_sofa(path)?;
        self.set_filters(filters);
        Ok(())
    }

    /// Installs an already-loaded filter set.
    pub fn set_filters(&mut self, filters: HrtfFilterSet) {
        self.filters = Some(filters);
        self.render_speakers();
    }

    /// Whether filters are loaded.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.filters.is_some()
    }

    /// Sets the virtual speaker angle in degrees, clamped to [10, 90].
    pub fn set_speaker_angle(&mut self, degrees: f32) {
        self.speaker_angle = degrees.clamp(SPEAKER_ANGLE_RANGE.0, SPEAKER_ANGLE_RANGE.1);
        self.render_speakers();
    }

    /// Current virtual speaker angle in degrees.
    #[must_use]
    pub fn speaker_angle(&self) -> f32 {
        self.speaker_angle
    }

    /// Interpolates the four speaker→ear filters for the current angle.
    fn render_speakers(&mut self) {
        let Some(filters) = self.filters.as_ref() else {
            return;
        };

        // SOFA azimuth is counter-clockwise: the left speaker sits at
        // +angle, the right speaker at 360 - angle.
        let (ll, lr) = filters.interpolate(self.speaker_angle);
        let (rl, rr) = filters.interpolate(360.0 - self.speaker_angle);

        let taps = ll.len().max(1);
        self.left_to_left = Fir { coeffs: ll };
        self.left_to_right = Fir { coeffs: lr };
        self.right_to_left = Fir { coeffs: rl };
        self.right_to_right = Fir { coeffs: rr };

        self.history_left = vec![0.0; taps];
        self.history_right = vec![0.0; taps];
        self.history_pos = 0;
    }
}

impl Default for HrtfProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl DspStage for HrtfProcessor {
    fn prepare(&mut self, _sample_rate: f64, _channels: usize) {
        // Clear delay lines; the filters themselves are rate-agnostic
        // enough for the common 44.1/48 family (SOFA sets ship at the
        // session rates this player uses).
        self.render_speakers();
    }

    fn process(&mut self, buf: &mut [f32], frames: usize, channels: usize) {
        if !self.enabled || channels != 2 || self.history_left.is_empty() {
            return;
        }

        let len = self.history_left.len();
        for frame in 0..frames {
            let input_left = buf[frame * 2];
            let input_right = buf[frame * 2 + 1];

            self.history_left[self.history_pos] = input_left;
            self.history_right[self.history_pos] = input_right;

            let out_left = self.left_to_left.convolve(&self.history_left, self.history_pos)
                + self
                    .right_to_left
                    .convolve(&self.history_right, self.history_pos);
            let out_right = self
                .left_to_right
                .convolve(&self.history_left, self.history_pos)
                + self
                    .right_to_right
                    .convolve(&self.history_right, self.history_pos);

            buf[frame * 2] = out_left;
            buf[frame * 2 + 1] = out_right;

            self.history_pos = (self.history_pos + 1) % len;
        }
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }
}

/// Minimal netCDF-classic reader, just enough for SOFA's standard
/// `SimpleFreeFieldHRIR` layout. Big-endian throughout; CDF-1 and CDF-2
/// offsets are both accepted.
mod netcdf {
    use crate::error::{Error, Result};

    const NC_DIMENSION: u32 = 0x0A;
    const NC_VARIABLE: u32 = 0x0B;
    const NC_ATTRIBUTE: u32 = 0x0C;

    const NC_FLOAT: u32 = 5;
    const NC_DOUBLE: u32 = 6;

    /// One variable's shape and numeric payload (converted to f64).
    pub struct Variable {
        pub dims: Vec<usize>,
        pub values: Vec<f64>,
    }

    /// Parsed file: named numeric variables.
    pub struct NetcdfClassic {
        variables: Vec<(String, Variable)>,
    }

    impl NetcdfClassic {
        pub fn variable(&self, name: &str) -> Option<&Variable> {
            self.variables
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v)
        }

        pub fn parse(bytes: &[u8]) -> Result<Self> {
            let mut cursor = Cursor::new(bytes);

            let magic = cursor.take(4)?;
            if &magic[..3] != b"CDF" {
                return Err(Error::decoder_open_failed("not a netCDF-classic file"));
            }
            let version = magic[3];
            if version != 1 && version != 2 {
                return Err(Error::decoder_open_failed(format!(
                    "unsupported netCDF version {version}"
                )));
            }
            let wide_offsets = version == 2;

            let _numrecs = cursor.read_u32()?;

            // Dimension list.
            let dim_tag = cursor.read_u32()?;
            let dim_count = cursor.read_u32()? as usize;
            let mut dim_sizes = Vec::with_capacity(dim_count);
            if dim_tag == NC_DIMENSION {
                for _ in 0..dim_count {
                    let _name = cursor.read_name()?;
                    dim_sizes.push(cursor.read_u32()? as usize);
                }
            } else if dim_tag != 0 {
                return Err(Error::decoder_open_failed("malformed dimension list"));
            }

            // Global attributes: skipped.
            cursor.skip_attributes()?;

            // Variable list.
            let var_tag = cursor.read_u32()?;
            let var_count = cursor.read_u32()? as usize;
            let mut variables = Vec::new();
            if var_tag == NC_VARIABLE {
                for _ in 0..var_count {
                    let name = cursor.read_name()?;
                    let ndims = cursor.read_u32()? as usize;
                    let mut dims = Vec::with_capacity(ndims);
                    for _ in 0..ndims {
                        let dim_id = cursor.read_u32()? as usize;
                        dims.push(dim_sizes.get(dim_id).copied().unwrap_or(0));
                    }
                    cursor.skip_attributes()?;
                    let nc_type = cursor.read_u32()?;
                    let _vsize = cursor.read_u32()?;
                    let begin = if wide_offsets {
                        cursor.read_u64()? as usize
                    } else {
                        cursor.read_u32()? as usize
                    };

                    // Only float/double variables matter for HRIR data.
                    if nc_type != NC_FLOAT && nc_type != NC_DOUBLE {
                        continue;
                    }

                    let count: usize = dims.iter().product::<usize>().max(1);
                    let width = if nc_type == NC_DOUBLE { 8 } else { 4 };
                    let end = begin
                        .checked_add(count * width)
                        .filter(|&end| end <= bytes.len())
                        .ok_or_else(|| {
                            Error::decoder_open_failed("variable data out of bounds")
                        })?;

                    let data = &bytes[begin..end];
                    let values = if nc_type == NC_DOUBLE {
                        data.chunks_exact(8)
                            .map(|chunk| f64::from_be_bytes(chunk.try_into().unwrap()))
                            .collect()
                    } else {
                        data.chunks_exact(4)
                            .map(|chunk| {
                                f64::from(f32::from_be_bytes(chunk.try_into().unwrap()))
                            })
                            .collect()
                    };

                    variables.push((name, Variable { dims, values }));
                }
            } else if var_tag != 0 {
                return Err(Error::decoder_open_failed("malformed variable list"));
            }

            Ok(Self { variables })
        }
    }

    struct Cursor<'a> {
        bytes: &'a [u8],
        pos: usize,
    }

    impl<'a> Cursor<'a> {
        fn new(bytes: &'a [u8]) -> Self {
            Self { bytes, pos: 0 }
        }

        fn take(&mut self, n: usize) -> Result<&'a [u8]> {
            let end = self
                .pos
                .checked_add(n)
                .filter(|&end| end <= self.bytes.len())
                .ok_or_else(|| Error::decoder_open_failed("truncated netCDF header"))?;
            let slice = &self.bytes[self.pos..end];
            self.pos = end;
            Ok(slice)
        }

        fn read_u32(&mut self) -> Result<u32> {
            Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
        }

        fn read_u64(&mut self) -> Result<u64> {
            Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
        }

        /// Name: u32 length + bytes, padded to a 4-byte boundary.
        fn read_name(&mut self) -> Result<String> {
            let len = self.read_u32()? as usize;
            let padded = len.div_ceil(4) * 4;
            let bytes = self.take(padded)?;
            Ok(String::from_utf8_lossy(&bytes[..len]).into_owned())
        }

        /// Skips one attribute list (tag + payloads).
        fn skip_attributes(&mut self) -> Result<()> {
            let tag = self.read_u32()?;
            let count = self.read_u32()? as usize;
            if tag == 0 {
                return Ok(());
            }
            if tag != NC_ATTRIBUTE {
                return Err(Error::decoder_open_failed("malformed attribute list"));
            }
            for _ in 0..count {
                let _name = self.read_name()?;
                let nc_type = self.read_u32()?;
                let nelems = self.read_u32()? as usize;
                let width = match nc_type {
                    1 | 2 => 1, // byte, char
                    3 => 2,     // short
                    4 | 5 => 4, // int, float
                    6 => 8,     // double
                    _ => {
                        return Err(Error::decoder_open_failed(format!(
                            "unknown attribute type {nc_type}"
                        )));
                    }
                };
                let payload = (nelems * width).div_ceil(4) * 4;
                self.take(payload)?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{HrtfFilterSet, HrtfProcessor};
    use crate::dsp::DspStage;

    /// A synthetic filter set: measurements at 30° and 330° with
    /// distinguishable single-tap IRs.
    fn synthetic_set() -> HrtfFilterSet {
        HrtfFilterSet {
            sample_rate: 44_100,
            azimuths_deg: vec![30.0, 330.0],
            left: vec![vec![0.8, 0.0], vec![0.4, 0.0]],
            right: vec![vec![0.4, 0.0], vec![0.8, 0.0]],
        }
    }

    #[test]
    fn interpolation_at_measured_angle_returns_measurement() {
        let set = synthetic_set();
        let (left, right) = set.interpolate(30.0);
        assert!((left[0] - 0.8).abs() < 1e-6);
        assert!((right[0] - 0.4).abs() < 1e-6);
    }

    #[test]
    fn interpolation_between_angles_blends() {
        let set = synthetic_set();
        // Exactly between 30° and 330° (i.e. 0°): expect the average.
        let (left, _) = set.interpolate(0.0);
        assert!((left[0] - 0.6).abs() < 1e-6, "blend {}", left[0]);
    }

    #[test]
    fn speaker_angle_is_clamped() {
        let mut hrtf = HrtfProcessor::new();
        hrtf.set_speaker_angle(5.0);
        assert!((hrtf.speaker_angle() - 10.0).abs() < f32::EPSILON);
        hrtf.set_speaker_angle(120.0);
        assert!((hrtf.speaker_angle() - 90.0).abs() < f32::EPSILON);
    }

    #[test]
    fn unloaded_processor_is_transparent() {
        let mut hrtf = HrtfProcessor::new();
        hrtf.set_enabled(true);
        hrtf.prepare(44_100.0, 2);
        let mut buf = vec![0.5_f32, -0.5, 0.25, -0.25];
        let original = buf.clone();
        hrtf.process(&mut buf, 2, 2);
        assert_eq!(buf, original);
    }

    #[test]
    fn left_input_reaches_both_ears() {
        let mut hrtf = HrtfProcessor::new();
        hrtf.set_filters(synthetic_set());
        hrtf.set_enabled(true);
        hrtf.set_speaker_angle(30.0);

        // Left-only impulse.
        let mut buf = vec![0.0_f32; 2 * 8];
        buf[0] = 1.0;
        hrtf.process(&mut buf, 8, 2);

        // Speaker at +30° (exact measurement): left ear 0.8, right 0.4.
        assert!((buf[0] - 0.8).abs() < 1e-6, "left ear {}", buf[0]);
        assert!((buf[1] - 0.4).abs() < 1e-6, "right ear {}", buf[1]);
    }

    #[test]
    fn rendering_is_symmetric() {
        let mut left_render = HrtfProcessor::new();
        left_render.set_filters(synthetic_set());
        left_render.set_enabled(true);

        let mut right_render = HrtfProcessor::new();
        right_render.set_filters(synthetic_set());
        right_render.set_enabled(true);

        let mut left_buf = vec![0.0_f32; 2 * 4];
        left_buf[0] = 1.0; // left impulse
        left_render.process(&mut left_buf, 4, 2);

        let mut right_buf = vec![0.0_f32; 2 * 4];
        right_buf[1] = 1.0; // right impulse
        right_render.process(&mut right_buf, 4, 2);

        // Mirror image: left-in left-ear == right-in right-ear.
        assert!((left_buf[0] - right_buf[1]).abs() < 1e-6);
        assert!((left_buf[1] - right_buf[0]).abs() < 1e-6);
    }

    mod sofa {
        use super::super::HrtfFilterSet;
        use std::io::Write;

        /// Builds a minimal CDF-1 SOFA file with M measurements, 2
        /// receivers and N taps.
        fn write_sofa(
            path: &std::path::Path,
            positions: &[(f64, f64)],
            irs: &[(Vec<f64>, Vec<f64>)],
            rate: f64,
        ) {
            let m = positions.len();
            let n = irs[0].0.len();

            let mut header: Vec<u8> = Vec::new();
            header.extend_from_slice(b"CDF\x01");
            header.extend_from_slice(&0u32.to_be_bytes()); // numrecs

            let write_name = |buf: &mut Vec<u8>, name: &str| {
                buf.extend_from_slice(&(name.len() as u32).to_be_bytes());
                buf.extend_from_slice(name.as_bytes());
                let pad = (4 - name.len() % 4) % 4;
                buf.extend(std::iter::repeat(0u8).take(pad));
            };

            // Dimensions: M, R, N, C.
            header.extend_from_slice(&0x0Au32.to_be_bytes());
            header.extend_from_slice(&4u32.to_be_bytes());
            for (name, size) in [("M", m), ("R", 2usize), ("N", n), ("C", 3usize)] {
                write_name(&mut header, name);
                header.extend_from_slice(&(size as u32).to_be_bytes());
            }

            // No global attributes.
            header.extend_from_slice(&0u32.to_be_bytes());
            header.extend_from_slice(&0u32.to_be_bytes());

            // Variables: Data.IR [M,R,N], SourcePosition [M,C],
            // Data.SamplingRate [].
            header.extend_from_slice(&0x0Bu32.to_be_bytes());
            header.extend_from_slice(&3u32.to_be_bytes());

            // Compute the header size first by building var entries with
            // placeholder offsets, then fix them up. Simpler: build the
            // var section twice.
            let build_vars = |offsets: [u32; 3]| {
                let mut vars: Vec<u8> = Vec::new();
                // Data.IR
                write_name(&mut vars, "Data.IR");
                vars.extend_from_slice(&3u32.to_be_bytes());
                for dim_id in [0u32, 1, 2] {
                    vars.extend_from_slice(&dim_id.to_be_bytes());
                }
                vars.extend_from_slice(&0u32.to_be_bytes()); // no attrs tag
                vars.extend_from_slice(&0u32.to_be_bytes());
                vars.extend_from_slice(&6u32.to_be_bytes()); // double
                vars.extend_from_slice(&((m * 2 * n * 8) as u32).to_be_bytes());
                vars.extend_from_slice(&offsets[0].to_be_bytes());
                // SourcePosition
                write_name(&mut vars, "SourcePosition");
                vars.extend_from_slice(&2u32.to_be_bytes());
                for dim_id in [0u32, 3] {
                    vars.extend_from_slice(&dim_id.to_be_bytes());
                }
                vars.extend_from_slice(&0u32.to_be_bytes());
                vars.extend_from_slice(&0u32.to_be_bytes());
                vars.extend_from_slice(&6u32.to_be_bytes());
                vars.extend_from_slice(&((m * 3 * 8) as u32).to_be_bytes());
                vars.extend_from_slice(&offsets[1].to_be_bytes());
                // Data.SamplingRate
                write_name(&mut vars, "Data.SamplingRate");
                vars.extend_from_slice(&0u32.to_be_bytes());
                vars.extend_from_slice(&0u32.to_be_bytes());
                vars.extend_from_slice(&0u32.to_be_bytes());
                vars.extend_from_slice(&6u32.to_be_bytes());
                vars.extend_from_slice(&8u32.to_be_bytes());
                vars.extend_from_slice(&offsets[2].to_be_bytes());
                vars
            };

            let vars_len = build_vars([0, 0, 0]).len();
            let data_start = (header.len() + vars_len) as u32;
            let ir_len = (m * 2 * n * 8) as u32;
            let pos_len = (m * 3 * 8) as u32;
            let offsets = [data_start, data_start + ir_len, data_start + ir_len + pos_len];
            header.extend_from_slice(&build_vars(offsets));

            let mut file = std::fs::File::create(path).unwrap();
            file.write_all(&header).unwrap();
            for (left, right) in irs {
                for value in left {
                    file.write_all(&value.to_be_bytes()).unwrap();
                }
                for value in right {
                    file.write_all(&value.to_be_bytes()).unwrap();
                }
            }
            for (azimuth, elevation) in positions {
                file.write_all(&azimuth.to_be_bytes()).unwrap();
                file.write_all(&elevation.to_be_bytes()).unwrap();
                file.write_all(&1.0_f64.to_be_bytes()).unwrap();
            }
            file.write_all(&rate.to_be_bytes()).unwrap();
        }

        #[test]
        fn loads_minimal_sofa() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("set.sofa");
            write_sofa(
                &path,
                &[(30.0, 0.0), (330.0, 0.0)],
                &[
                    (vec![0.8, 0.1], vec![0.4, 0.05]),
                    (vec![0.4, 0.05], vec![0.8, 0.1]),
                ],
                48_000.0,
            );

            let set = HrtfFilterSet::from_sofa(&path).unwrap();
            assert_eq!(set.sample_rate, 48_000);
            assert_eq!(set.azimuths_deg.len(), 2);
            assert!((set.left[0][0] - 0.8).abs() < 1e-6);
            assert!((set.right[1][0] - 0.8).abs() < 1e-6);
        }

        #[test]
        fn elevated_measurements_are_filtered_out() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("elevated.sofa");
            write_sofa(
                &path,
                &[(30.0, 0.0), (30.0, 45.0)],
                &[
                    (vec![0.8, 0.0], vec![0.4, 0.0]),
                    (vec![0.1, 0.0], vec![0.1, 0.0]),
                ],
                44_100.0,
            );

            let set = HrtfFilterSet::from_sofa(&path).unwrap();
            assert_eq!(set.azimuths_deg.len(), 1);
        }

        #[test]
        fn rejects_non_netcdf_files() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("bogus.sofa");
            std::fs::write(&path, b"definitely not netCDF").unwrap();
            assert!(HrtfFilterSet::from_sofa(&path).is_err());
        }
    }
}
