use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use sensorboard::accel::{AccelPoller, AccelSample};
use sensorboard::bus::{self, MillisClock, Transport};
use sensorboard::capture::{AdcScan, ADC_MAX, FrameExchange};
use sensorboard::config::{Config, SpectrumConfig, AUX_CHANNELS, N_HIGH, SAMPLE_RATE_HZ};
use sensorboard::sim::{self, SimBus};
use sensorboard::spectrum::{Aggregate, HighBands, GROWTH_FULL_RESOLUTION};
use sensorboard::{SensorBoard, SummaryFrame};

/// Samples per millisecond tick at the capture rate.
const SAMPLES_PER_MS: u32 = SAMPLE_RATE_HZ / 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BandLayout {
    Canonical,
    FullResolution,
    Table,
}

impl From<BandLayout> for HighBands {
    fn from(layout: BandLayout) -> Self {
        match layout {
            BandLayout::Canonical => HighBands::CANONICAL,
            BandLayout::FullResolution => HighBands::Curve {
                growth: GROWTH_FULL_RESOLUTION,
                aggregate: Aggregate::Max,
            },
            BandLayout::Table => HighBands::Table,
        }
    }
}

/// Fault injection, counted in capture windows.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Faults {
    /// NACK one phase of the accelerometer read every this many windows.
    pub nack_every: Option<u32>,
    /// Lose one bus event every this many windows.
    pub drop_event_every: Option<u32>,
    /// Device initialisation fails for the first this many windows.
    pub fail_init_windows: u32,
    /// Skip the main-loop pass every this many windows.
    pub stall_every: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Profile {
    pub tone_hz: f64,
    /// Peak deviation from mid-scale, in ADC counts.
    pub amplitude: f64,
    pub frames: u32,
    pub accel: [i16; 3],
    pub aux: [u16; AUX_CHANNELS],
    pub high_bands: BandLayout,
    pub faults: Faults,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            tone_hz: 2500.0,
            amplitude: 1000.0,
            frames: 16,
            accel: [0, 0, 2048],
            aux: [0; AUX_CHANNELS],
            high_bands: BandLayout::Canonical,
            faults: Faults::default(),
        }
    }
}

impl Profile {
    pub fn load(path: &Path) -> Result<Self> {
        let text =
            fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid profile {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_hjson::from_str(text)?)
    }

    fn config(&self) -> Config {
        let mut spectrum = SpectrumConfig::default();
        spectrum.high_bands = self.high_bands.into();
        Config::default().with_spectrum(spectrum)
    }

    fn audio(&self, n: u64) -> u16 {
        let phase = 2.0 * std::f64::consts::PI * self.tone_hz * n as f64 / SAMPLE_RATE_HZ as f64;
        let mid = (ADC_MAX as f64 + 1.0) / 2.0;
        (mid + self.amplitude * phase.sin())
            .round()
            .clamp(0.0, ADC_MAX as f64) as u16
    }
}

/// One main-loop cycle as printed by `--json`.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub window: u32,
    pub side: usize,
    pub overruns: u32,
    pub accel_mode: String,
    pub frame: SummaryFrame,
}

#[derive(Debug, Default)]
pub struct Outcome {
    pub reports: Vec<Report>,
    /// Every frame as it left the transport.
    pub stream: Vec<u8>,
    pub completed_reads: u32,
    pub resets: u32,
    pub overruns: u32,
}

#[derive(Default)]
struct Capture(Vec<u8>);

impl Transport for Capture {
    fn send(&mut self, bytes: &[u8]) {
        self.0.extend_from_slice(bytes);
    }
}

fn every(period: Option<u32>, window: u32) -> bool {
    matches!(period, Some(p) if p > 0 && (window + 1) % p == 0)
}

pub fn run(profile: &Profile) -> Result<Outcome> {
    let config = profile.config();
    let mut exchange = FrameExchange::new();
    let (mut producer, consumer) = exchange.split(config.capture);
    let poller = AccelPoller::new(config.accel);
    let bus = bus::shared(SimBus::with_address(config.accel.address));
    let clock = MillisClock::new();
    let mut board = SensorBoard::new(
        config,
        consumer,
        &poller,
        &bus,
        bus::SharedI2c(&bus),
        Capture::default(),
        &clock,
    );

    let faults = &profile.faults;
    bus.lock(|b| {
        let mut b = b.borrow_mut();
        b.set_acceleration(AccelSample {
            x: profile.accel[0],
            y: profile.accel[1],
            z: profile.accel[2],
        });
        b.set_fail_init(faults.fail_init_windows > 0);
    });
    if let Err(e) = board.init() {
        log::warn!("Initial accelerometer set-up failed: {}", e);
    }

    log::info!(
        "Simulating {} windows of a {} Hz tone, amplitude {}",
        profile.frames,
        profile.tone_hz,
        profile.amplitude
    );

    let mut outcome = Outcome::default();
    let mut n: u64 = 0;
    for window in 0..profile.frames {
        bus.lock(|b| {
            let mut b = b.borrow_mut();
            b.set_fail_init(window < faults.fail_init_windows);
            if every(faults.nack_every, window) {
                b.nack_after((window % 3) as u8);
            }
            if every(faults.drop_event_every, window) {
                b.drop_next_event();
            }
        });

        for _ in 0..N_HIGH {
            producer.on_sample(&AdcScan {
                audio: profile.audio(n),
                aux: profile.aux,
            });
            n += 1;
            if n % SAMPLES_PER_MS as u64 == 0 {
                clock.tick();
            }
        }

        if every(faults.stall_every, window) {
            log::debug!("Window {}: main loop stalled", window);
            continue;
        }

        if let Some(cycle) = board.service()? {
            outcome.reports.push(Report {
                window,
                side: cycle.side,
                overruns: cycle.overruns,
                accel_mode: format!("{:?}", poller.mode()),
                frame: cycle.frame,
            });
        }
        sim::pump(&bus, &poller);
    }

    outcome.stream = core::mem::take(&mut board.transport_mut().0);
    outcome.completed_reads = poller.completed();
    outcome.resets = poller.resets();
    outcome.overruns = outcome.reports.last().map_or(0, |r| r.overruns);

    log::info!(
        "{} frames sent, {} accelerometer reads, {} resets, {} overruns",
        outcome.reports.len(),
        outcome.completed_reads,
        outcome.resets,
        outcome.overruns
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sensorboard::frame::{Endian, FrameScanner, FRAME_LEN};

    #[test]
    fn parses_hjson_profile() {
        let profile = Profile::parse(
            r#"
            {
              # a quiet 1 kHz tone
              tone_hz: 1000
              amplitude: 200
              high_bands: full-resolution
              faults: {
                nack_every: 4
              }
            }
            "#,
        )
        .unwrap();
        assert_eq!(profile.tone_hz, 1000.0);
        assert_eq!(profile.amplitude, 200.0);
        assert_eq!(profile.frames, 16);
        assert_eq!(profile.high_bands, BandLayout::FullResolution);
        assert_eq!(profile.faults.nack_every, Some(4));
        assert_eq!(profile.faults.fail_init_windows, 0);

        assert!(Profile::parse("{ tone: 5 }").is_err());
    }

    #[test]
    fn clean_run_reads_accelerometer_every_cycle() {
        let profile = Profile {
            frames: 4,
            accel: [10, -20, 30],
            ..Profile::default()
        };
        let outcome = run(&profile).unwrap();

        assert_eq!(outcome.reports.len(), 4);
        assert_eq!(outcome.completed_reads, 4);
        assert_eq!(outcome.resets, 0);
        assert_eq!(outcome.overruns, 0);
        // The first frame carries the sample read back during set-up.
        for r in &outcome.reports {
            assert_eq!(r.frame.peak_hz, 2500);
            assert_eq!(r.accel_mode, "Starting");
            assert_eq!(r.frame.accel, [10, -20, 30]);
        }

        assert_eq!(outcome.stream.len(), 4 * FRAME_LEN);
        let mut scanner = FrameScanner::new(Endian::NATIVE);
        let mut decoded = Vec::new();
        scanner.extend(&outcome.stream, |f| decoded.push(f));
        assert_eq!(decoded.len(), 4);
        assert_eq!(decoded[3], outcome.reports[3].frame);
    }

    #[test]
    fn nacks_force_resets() {
        let profile = Profile {
            frames: 4,
            faults: Faults {
                nack_every: Some(1),
                ..Faults::default()
            },
            ..Profile::default()
        };
        let outcome = run(&profile).unwrap();
        assert_eq!(outcome.reports.len(), 4);
        assert_eq!(outcome.completed_reads, 0);
        assert_eq!(outcome.resets, 4);
    }

    #[test]
    fn stalls_show_up_as_overruns() {
        let profile = Profile {
            frames: 6,
            faults: Faults {
                stall_every: Some(2),
                ..Faults::default()
            },
            ..Profile::default()
        };
        let outcome = run(&profile).unwrap();
        assert_eq!(outcome.reports.len(), 3);
        assert_eq!(outcome.overruns, 2);
    }
}
