//! Board constants and runtime configuration.
//!
//! Buffer sizes and the frame layout are compile-time constants; everything
//! that only changes scaling or timing lives in [`Config`].

use crate::spectrum::HighBands;

/// Audio capture rate (Hz).
pub const SAMPLE_RATE_HZ: u32 = 20_000;

/// High-resolution window length (samples per ping-pong side).
pub const N_HIGH: usize = 1 << LOG2_N_HIGH;
/// log2 of [`N_HIGH`].
pub const LOG2_N_HIGH: u32 = 9;

/// Low-rate ring length (decimated samples).
pub const N_LOW: usize = 1 << LOG2_N_LOW;
/// log2 of [`N_LOW`].
pub const LOG2_N_LOW: u32 = 5;

/// Analog channels reported next to the audio channel.
pub const AUX_CHANNELS: usize = 6;

/// Bands computed from the low-rate stream.
pub const LOW_BANDS: usize = 6;
/// Bands computed from the high-rate stream.
pub const HIGH_BANDS: usize = 26;

/// Raw samples averaged into one low-rate sample (20 kHz → 400 Hz).
pub const DEFAULT_DECIMATION: u16 = 50;

/// Default watchdog budget for one accelerometer transaction.
pub const DEFAULT_TRANSACTION_TIMEOUT_MS: u32 = 10;

/// Default wait before retrying a failed accelerometer initialisation.
pub const DEFAULT_INIT_RETRY_MS: u32 = 20;

/// Capture-side scaling, used by the sample interrupt.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CaptureConfig {
    /// Raw samples per decimated sample (`K`). Must be non-zero.
    pub decimation: u16,
    /// DC filter shift; the average moves by `1 / 2^dc_shift` of the error per sample.
    pub dc_shift: u8,
    /// Left shift applied to the raw 12-bit audio reading.
    pub audio_shift: u8,
    /// Initial DC estimate, in the scaled sample domain.
    pub dc_initial: i16,
}

impl CaptureConfig {
    pub const fn new() -> Self {
        Self {
            decimation: DEFAULT_DECIMATION,
            dc_shift: 16,
            audio_shift: 3,
            dc_initial: 16384,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Spectral pipeline parameters.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SpectrumConfig {
    /// Rate of the high-resolution stream, used for the peak frequency estimate.
    pub sample_rate_hz: u32,
    /// Right shift applied to the fixed-point magnitude before saturation.
    pub magnitude_shift: u8,
    /// How the high-resolution bins are compressed into [`HIGH_BANDS`] bands.
    pub high_bands: HighBands,
}

impl SpectrumConfig {
    pub const fn new() -> Self {
        Self {
            sample_rate_hz: SAMPLE_RATE_HZ,
            magnitude_shift: 4,
            high_bands: HighBands::CANONICAL,
        }
    }
}

impl Default for SpectrumConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Accelerometer transaction parameters.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AccelConfig {
    /// 7-bit device address.
    pub address: u8,
    /// First data register of the burst read (auto-increment is added by the poller).
    pub data_register: u8,
    /// Watchdog budget for one transaction; `None` disables the watchdog.
    pub transaction_timeout_ms: Option<u32>,
    /// Minimum time between failed initialisation attempts.
    pub init_retry_ms: u32,
}

impl AccelConfig {
    pub const fn new() -> Self {
        Self {
            address: crate::accel::lis3dh::ADDRESS,
            data_register: crate::accel::lis3dh::OUT_X_L,
            transaction_timeout_ms: Some(DEFAULT_TRANSACTION_TIMEOUT_MS),
            init_retry_ms: DEFAULT_INIT_RETRY_MS,
        }
    }
}

impl Default for AccelConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Board configuration.
///
/// ```
/// use sensorboard::config::{AccelConfig, Config};
///
/// let mut accel = AccelConfig::default();
/// accel.transaction_timeout_ms = None;
/// let config = Config::default().with_accel(accel);
/// assert_eq!(config.accel.transaction_timeout_ms, None);
/// ```
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    pub capture: CaptureConfig,
    pub spectrum: SpectrumConfig,
    pub accel: AccelConfig,
    /// Left shift applied to the auxiliary channels in the output frame.
    pub aux_shift: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub const fn new() -> Self {
        Self {
            capture: CaptureConfig::new(),
            spectrum: SpectrumConfig::new(),
            accel: AccelConfig::new(),
            aux_shift: 4,
        }
    }

    pub const fn with_capture(mut self, capture: CaptureConfig) -> Self {
        self.capture = capture;
        self
    }

    pub const fn with_spectrum(mut self, spectrum: SpectrumConfig) -> Self {
        self.spectrum = spectrum;
        self
    }

    pub const fn with_accel(mut self, accel: AccelConfig) -> Self {
        self.accel = accel;
        self
    }

    pub const fn with_aux_shift(mut self, aux_shift: u8) -> Self {
        self.aux_shift = aux_shift;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_scaling() {
        let cfg = Config::default();
        assert_eq!(cfg.capture.decimation, 50);
        assert_eq!(cfg.capture.audio_shift, 3);
        assert_eq!(cfg.spectrum.magnitude_shift, 4);
        assert_eq!(cfg.aux_shift, 4);
        assert_eq!(cfg.accel.address, 0x18);
        assert_eq!(cfg.accel.transaction_timeout_ms, Some(10));
        assert_eq!(cfg.accel.init_retry_ms, 20);
    }

    #[test]
    fn builders_replace_one_group() {
        let mut capture = CaptureConfig::default();
        capture.decimation = 4;
        let cfg = Config::default().with_capture(capture).with_aux_shift(0);
        assert_eq!(cfg.capture.decimation, 4);
        assert_eq!(cfg.aux_shift, 0);
        assert_eq!(cfg.spectrum, SpectrumConfig::default());
    }

    #[test]
    fn window_sizes_are_powers_of_two() {
        assert!(N_HIGH.is_power_of_two());
        assert!(N_LOW.is_power_of_two());
        assert_eq!(N_HIGH, 512);
        assert_eq!(N_LOW, 32);
    }
}
