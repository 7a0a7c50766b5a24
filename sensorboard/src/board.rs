//! Main-loop side of the board.
//!
//! [`SensorBoard`] owns everything the main loop touches: the consumer half
//! of the capture exchange, the analysis scratch space, the transport and
//! the blocking I2C handle used to configure the accelerometer. It shares
//! the accelerometer poller and the bus with the interrupt handlers. Each
//! [`SensorBoard::service`] call is one loop iteration.

use embedded_hal_1::i2c::I2c;

use crate::accel::{self, AccelPoller, Mode};
use crate::bus::{BusControl, Clock, SharedBus, Transport};
use crate::capture::Consumer;
use crate::config::{Config, AUX_CHANNELS};
use crate::frame::{SummaryFrame, FRAME_LEN};
use crate::spectrum::{self, Analyzer, Spectrum};

/// Board error
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    Accel(accel::Error),
    Spectrum(spectrum::Error),
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Accel(e) => write!(f, "accelerometer error: {:?}", e),
            Error::Spectrum(e) => write!(f, "spectrum error: {:?}", e),
        }
    }
}

impl core::error::Error for Error {}

impl From<accel::Error> for Error {
    fn from(e: accel::Error) -> Self {
        Self::Accel(e)
    }
}

impl From<spectrum::Error> for Error {
    fn from(e: spectrum::Error) -> Self {
        Self::Spectrum(e)
    }
}

/// Outcome of one analysis cycle.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Cycle {
    /// The frame that went out.
    pub frame: SummaryFrame,
    pub spectrum: Spectrum,
    /// Which ping-pong side was analysed.
    pub side: usize,
    /// Capture overruns so far.
    pub overruns: u32,
}

/// Shift 12-bit readings up to 16-bit full scale.
fn normalize_aux(raw: &[u16; AUX_CHANNELS], shift: u8) -> [u16; AUX_CHANNELS] {
    let shift = shift.min(16);
    raw.map(|v| ((v as u32) << shift).min(u16::MAX as u32) as u16)
}

pub struct SensorBoard<'a, B, I, T, C> {
    consumer: Consumer<'a>,
    accel: &'a AccelPoller,
    bus: &'a SharedBus<B>,
    i2c: I,
    transport: T,
    clock: C,
    analyzer: Analyzer,
    aux_shift: u8,
    init_retry_ms: u32,
    /// When the last initialisation attempt failed.
    failed_init_ms: Option<u32>,
    out: [u8; FRAME_LEN],
    reported_overruns: u32,
}

impl<'a, B, I, T, C> SensorBoard<'a, B, I, T, C>
where
    B: BusControl,
    I: I2c,
    T: Transport,
    C: Clock,
{
    /// `i2c` is only driven from [`init`](Self::init) and [`service`](Self::service),
    /// never while `bus` is locked. [`SharedI2c`](crate::bus::SharedI2c) over
    /// the same bus takes the lock per transaction.
    pub fn new(
        config: Config,
        consumer: Consumer<'a>,
        accel: &'a AccelPoller,
        bus: &'a SharedBus<B>,
        i2c: I,
        transport: T,
        clock: C,
    ) -> Self {
        Self {
            consumer,
            accel,
            bus,
            i2c,
            transport,
            clock,
            analyzer: Analyzer::new(config.spectrum),
            aux_shift: config.aux_shift,
            init_retry_ms: config.accel.init_retry_ms,
            failed_init_ms: None,
            out: [0; FRAME_LEN],
            reported_overruns: 0,
        }
    }

    /// Configure the accelerometer. Blocks on the I2C handle.
    pub fn init(&mut self) -> Result<(), Error> {
        let now = self.clock.now_ms();
        match self.accel.reinitialize(&mut self.i2c) {
            Ok(()) => {
                self.failed_init_ms = None;
                Ok(())
            }
            Err(e) => {
                self.failed_init_ms = Some(now);
                Err(e.into())
            }
        }
    }

    fn init_due(&self, now_ms: u32) -> bool {
        match self.failed_init_ms {
            None => true,
            Some(at) => now_ms.wrapping_sub(at) >= self.init_retry_ms,
        }
    }

    /// One main-loop iteration. Returns `Ok(None)` when no frame was ready.
    ///
    /// An accelerometer stuck in [`Mode::NeedsReset`] is re-initialised
    /// first. Failed attempts are retried no sooner than
    /// [`AccelConfig::init_retry_ms`](crate::config::AccelConfig::init_retry_ms)
    /// later; meanwhile frames still go out with the last good sample.
    pub fn service(&mut self) -> Result<Option<Cycle>, Error> {
        let now = self.clock.now_ms();
        if self.accel.mode() == Mode::NeedsReset && self.init_due(now) {
            if let Err(e) = self.init() {
                warn!(
                    "accelerometer re-init failed, retry in {} ms: {:?}",
                    self.init_retry_ms, e
                );
            }
        }

        let accel = self.accel;
        self.bus
            .lock(|bus| accel.check_timeout(&mut *bus.borrow_mut(), now));

        let Some(mut side) = self.consumer.try_take() else {
            return Ok(None);
        };
        let index = side.index();

        // The read runs on the bus interrupts while the FFTs run here.
        self.bus
            .lock(|bus| accel.request_poll(&mut *bus.borrow_mut(), now));

        let buffers = &mut *side;
        let spectrum = self.analyzer.run(&mut buffers.low, &mut buffers.high)?;
        let aux = normalize_aux(&buffers.aux, self.aux_shift);
        drop(side);

        let frame = SummaryFrame {
            low_bands: spectrum.low_bands,
            high_bands: spectrum.high_bands,
            energy: spectrum.energy,
            peak_magnitude: spectrum.peak.magnitude,
            peak_hz: spectrum.peak_hz,
            accel: accel.latest_sample().axes(),
            aux,
        };
        frame.encode(&mut self.out);
        self.transport.send(&self.out);

        let overruns = self.consumer.overruns();
        if overruns != self.reported_overruns {
            warn!(
                "capture overrun: {} frames lost ({} total)",
                overruns.wrapping_sub(self.reported_overruns),
                overruns
            );
            self.reported_overruns = overruns;
        }
        trace!("frame {} peak {} Hz", index, frame.peak_hz);

        Ok(Some(Cycle {
            frame,
            spectrum,
            side: index,
            overruns,
        }))
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn accel(&self) -> &AccelPoller {
        self.accel
    }

    pub fn i2c_mut(&mut self) -> &mut I {
        &mut self.i2c
    }
}
