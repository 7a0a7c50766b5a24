//! Spectral analysis pipeline.
//!
//! One pass windows a block of DC-free samples, runs the forward FFT in
//! place and turns the first half of the spectrum into saturating 16-bit
//! magnitudes. Those bins are then compressed into bands, either through a
//! fixed table of upper bin indices or through an exponential boundary
//! curve, and the high-resolution pass additionally reports the strongest
//! bin.

use crate::config::{SpectrumConfig, HIGH_BANDS, LOW_BANDS, N_HIGH, N_LOW};
use crate::fft::{self, SINE_TABLE, SINE_TABLE_PERIOD};
use crate::math::fixed_sqrt;

/// Inclusive upper bins of the low-rate bands (12.5–162.5 Hz on the 400 Hz stream).
pub const LOW_BAND_MAP: [u8; LOW_BANDS] = [3, 4, 6, 8, 10, 13];

/// Inclusive upper bins of the fixed high-rate table (195 Hz up to Nyquist).
pub const LEGACY_HIGH_BAND_MAP: [u8; HIGH_BANDS] = [
    5, 6, 8, 10, 12, 15, 18, 22, 25, 30, 35, 40, 46, 53, 61, 70, 80, 92, 105, 119, 136, 154, 175,
    199, 225, 255,
];

/// 16.16 growth (≈1.117) giving one band per distinguishable step at N = 512 (32 bands).
pub const GROWTH_FULL_RESOLUTION: u32 = 73_204;
/// 16.16 growth (≈1.160) giving exactly [`HIGH_BANDS`] bands at N = 512.
pub const GROWTH_CANONICAL: u32 = 76_022;

const ONE: u32 = 1 << 16;

/// Phase steps the analysis window sweeps: half a sine period, so the
/// window rises from zero to full scale and back over the block.
pub const WINDOW_PHASE_SPAN: usize = SINE_TABLE_PERIOD / 2;

const _: () = assert!(exponential_band_count(N_HIGH / 2, GROWTH_CANONICAL) == HIGH_BANDS);
const _: () = assert!((LOW_BAND_MAP[LOW_BANDS - 1] as usize) < N_LOW / 2);
const _: () = assert!((LEGACY_HIGH_BAND_MAP[HIGH_BANDS - 1] as usize) < N_HIGH / 2);

/// Spectral pipeline error.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Work buffers do not match the sample block, or a band table reaches
    /// past the available bins.
    InvalidLength,
    /// The transform rejected the block.
    Fft(fft::Error),
}

impl From<fft::Error> for Error {
    fn from(e: fft::Error) -> Self {
        Self::Fft(e)
    }
}

/// How the bins of one band are reduced to a single value.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Aggregate {
    #[default]
    Max,
    Mean,
}

impl Aggregate {
    /// Reduce `bins`; an empty range reports 0.
    pub fn reduce(self, bins: &[u16]) -> u16 {
        match self {
            Aggregate::Max => bins.iter().copied().max().unwrap_or(0),
            Aggregate::Mean => {
                if bins.is_empty() {
                    return 0;
                }
                let sum: u32 = bins.iter().map(|&b| b as u32).sum();
                (sum / bins.len() as u32) as u16
            }
        }
    }
}

/// Compression of the high-resolution bins into [`HIGH_BANDS`] bands.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum HighBands {
    /// Exponential boundary curve with a 16.16 growth constant.
    Curve { growth: u32, aggregate: Aggregate },
    /// [`LEGACY_HIGH_BAND_MAP`], max aggregation.
    Table,
}

impl HighBands {
    pub const CANONICAL: Self = Self::Curve {
        growth: GROWTH_CANONICAL,
        aggregate: Aggregate::Max,
    };

    /// Fill `out` from the magnitude bins of one high-resolution pass.
    ///
    /// A curve yielding fewer bands than `out` holds leaves the tail at 0;
    /// extra bands are dropped.
    pub fn compress(self, magnitudes: &[u16], out: &mut [u16]) -> Result<(), Error> {
        match self {
            HighBands::Curve { growth, aggregate } => {
                out.fill(0);
                for (slot, range) in out.iter_mut().zip(curve_bands(magnitudes.len(), growth)) {
                    *slot = aggregate.reduce(&magnitudes[range]);
                }
                Ok(())
            }
            HighBands::Table => index_map_bands(magnitudes, &LEGACY_HIGH_BAND_MAP, out),
        }
    }
}

impl Default for HighBands {
    fn default() -> Self {
        Self::CANONICAL
    }
}

/// Analysis window coefficient for sample `i` of a `2^log2_n` block, in Q15.
#[inline]
pub fn window_coefficient(i: usize, log2_n: u32) -> i16 {
    SINE_TABLE[(i * WINDOW_PHASE_SPAN) >> log2_n]
}

/// Window `samples`, transform them and write `samples.len() / 2` magnitudes.
///
/// `samples` and `imag` are clobbered. Returns the mean absolute amplitude of
/// the block as it was before windowing.
pub fn analyze(
    samples: &mut [i16],
    imag: &mut [i16],
    magnitudes: &mut [u16],
    magnitude_shift: u8,
) -> Result<u16, Error> {
    let n = samples.len();
    if !n.is_power_of_two() || imag.len() != n || magnitudes.len() < n / 2 {
        return Err(Error::InvalidLength);
    }
    let log2_n = n.trailing_zeros();

    let mut total: u32 = 0;
    for (i, s) in samples.iter_mut().enumerate() {
        total += s.unsigned_abs() as u32;
        *s = ((window_coefficient(i, log2_n) as i32 * *s as i32) >> 16) as i16;
    }
    let energy = (total >> log2_n) as u16;

    imag.fill(0);
    fft::fix_fft(samples, imag, false)?;

    for ((mag, &re), &im) in magnitudes.iter_mut().zip(samples.iter()).zip(imag.iter()).take(n / 2) {
        let power = (re as i32 * re as i32) as u32 + (im as i32 * im as i32) as u32;
        let root = fixed_sqrt(power.min(i32::MAX as u32) as i32) >> magnitude_shift;
        *mag = root.clamp(0, 0xFFFF) as u16;
    }

    Ok(energy)
}

/// Max-aggregate bands from a table of ascending inclusive upper bins.
///
/// Band 0 is the single bin `table[0]`; band `i` spans
/// `table[i - 1] + 1 ..= table[i]`.
pub fn index_map_bands(magnitudes: &[u16], table: &[u8], out: &mut [u16]) -> Result<(), Error> {
    if table.len() != out.len() {
        return Err(Error::InvalidLength);
    }
    let Some(&last) = table.last() else {
        return Ok(());
    };
    if last as usize >= magnitudes.len() {
        return Err(Error::InvalidLength);
    }

    let mut start = table[0] as usize;
    for (slot, &top) in out.iter_mut().zip(table.iter()) {
        let end = top as usize + 1;
        *slot = Aggregate::Max.reduce(&magnitudes[start.min(end)..end]);
        start = end;
    }
    Ok(())
}

/// Upper bin boundaries of the exponential curve.
///
/// Each step computes `acc = acc * growth + 1.0` in 16.16 and yields the
/// integer part. The sequence is strictly increasing and ends with the first
/// boundary that reaches `half_n`.
#[derive(Debug, Clone)]
pub struct ExponentialBoundaries {
    acc: u32,
    growth: u32,
    half_n: usize,
    done: bool,
}

/// Boundaries for `half_n` bins; growth below 1.0 is raised to 1.0.
pub const fn exponential_boundaries(half_n: usize, growth: u32) -> ExponentialBoundaries {
    ExponentialBoundaries {
        acc: 0,
        growth: if growth < ONE { ONE } else { growth },
        half_n,
        done: false,
    }
}

const fn next_accumulator(acc: u32, growth: u32) -> u32 {
    (((acc as u64 * growth as u64) >> 16) as u32).saturating_add(ONE)
}

impl Iterator for ExponentialBoundaries {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.done {
            return None;
        }
        self.acc = next_accumulator(self.acc, self.growth);
        let boundary = (self.acc >> 16) as usize;
        if boundary >= self.half_n {
            self.done = true;
        }
        Some(boundary)
    }
}

/// Number of bands [`exponential_boundaries`] yields.
pub const fn exponential_band_count(half_n: usize, growth: u32) -> usize {
    let growth = if growth < ONE { ONE } else { growth };
    let mut acc = 0;
    let mut count = 0;
    loop {
        acc = next_accumulator(acc, growth);
        count += 1;
        if (acc >> 16) as usize >= half_n {
            return count;
        }
    }
}

/// Bin ranges `(previous, boundary]` of the curve, clamped to the last bin.
pub fn curve_bands(half_n: usize, growth: u32) -> impl Iterator<Item = core::ops::Range<usize>> {
    let last = half_n.saturating_sub(1);
    let mut previous = 0;
    exponential_boundaries(half_n, growth).map(move |boundary| {
        let start = (previous + 1).min(last + 1);
        let end = boundary.min(last) + 1;
        previous = boundary;
        start.min(end)..end
    })
}

/// Strongest bin of one pass.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Peak {
    /// Bin index; 0 when every bin above DC is silent.
    pub bin: u16,
    pub magnitude: u16,
}

impl Peak {
    /// Frequency of the peak bin for a `n`-point transform at `sample_rate_hz`.
    pub fn hz(&self, sample_rate_hz: u32, n: usize) -> u16 {
        peak_hz(self.bin as usize, sample_rate_hz, n)
    }
}

/// Largest magnitude over bins `1..`; the lowest bin wins ties.
pub fn find_peak(magnitudes: &[u16]) -> Peak {
    let mut peak = Peak::default();
    for (bin, &m) in magnitudes.iter().enumerate().skip(1) {
        if m > peak.magnitude {
            peak = Peak {
                bin: bin as u16,
                magnitude: m,
            };
        }
    }
    peak
}

/// `bin * sample_rate / n`, saturated to 16 bits.
pub fn peak_hz(bin: usize, sample_rate_hz: u32, n: usize) -> u16 {
    if n == 0 {
        return 0;
    }
    let hz = bin as u64 * sample_rate_hz as u64 / n as u64;
    hz.min(u16::MAX as u64) as u16
}

/// Result of one analysis cycle.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Spectrum {
    pub low_bands: [u16; LOW_BANDS],
    pub high_bands: [u16; HIGH_BANDS],
    /// Mean absolute amplitude of the high-rate block.
    pub energy: u16,
    /// Mean absolute amplitude of the low-rate snapshot.
    pub low_energy: u16,
    pub peak: Peak,
    pub peak_hz: u16,
}

/// Owns the FFT scratch space for both passes of a cycle.
pub struct Analyzer {
    config: SpectrumConfig,
    imag: [i16; N_HIGH],
    magnitudes: [u16; N_HIGH / 2],
}

impl Analyzer {
    pub const fn new(config: SpectrumConfig) -> Self {
        Self {
            config,
            imag: [0; N_HIGH],
            magnitudes: [0; N_HIGH / 2],
        }
    }

    pub fn config(&self) -> &SpectrumConfig {
        &self.config
    }

    /// Run the low-rate and high-rate passes. Both blocks are clobbered.
    pub fn run(&mut self, low: &mut [i16; N_LOW], high: &mut [i16; N_HIGH]) -> Result<Spectrum, Error> {
        let mut spectrum = Spectrum::default();
        let shift = self.config.magnitude_shift;

        spectrum.low_energy = analyze(
            low,
            &mut self.imag[..N_LOW],
            &mut self.magnitudes[..N_LOW / 2],
            shift,
        )?;
        index_map_bands(&self.magnitudes[..N_LOW / 2], &LOW_BAND_MAP, &mut spectrum.low_bands)?;

        spectrum.energy = analyze(high, &mut self.imag, &mut self.magnitudes, shift)?;
        spectrum.peak = find_peak(&self.magnitudes);
        spectrum.peak_hz = spectrum.peak.hz(self.config.sample_rate_hz, N_HIGH);
        self.config
            .high_bands
            .compress(&self.magnitudes, &mut spectrum.high_bands)?;

        Ok(spectrum)
    }
}
