use core::cell::Cell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embedded_hal_1::i2c::{Error as _, I2c};

use super::lis3dh::{self, AUTO_INCREMENT, SAMPLE_LEN};
use super::transaction::{step, Command, Event, Mode};
use super::{AccelSample, Error};
use crate::bus::{BusControl, BusError, BusEvent};
use crate::config::AccelConfig;

#[derive(Debug, Copy, Clone)]
struct State {
    mode: Mode,
    started_ms: u32,
    sample: AccelSample,
    completed: u32,
    resets: u32,
}

/// Drives the accelerometer transaction from the main loop and the bus/DMA
/// interrupts.
///
/// All methods take `&self`; the state lives behind a critical-section
/// mutex so one poller can be shared by every context that delivers events.
/// Bus commands run inside that critical section.
pub struct AccelPoller {
    state: Mutex<CriticalSectionRawMutex, Cell<State>>,
    config: AccelConfig,
}

impl AccelPoller {
    /// A new poller starts in [`Mode::NeedsReset`]: the device has to be
    /// configured with [`reinitialize`](Self::reinitialize) first.
    pub const fn new(config: AccelConfig) -> Self {
        Self {
            state: Mutex::new(Cell::new(State {
                mode: Mode::NeedsReset,
                started_ms: 0,
                sample: AccelSample { x: 0, y: 0, z: 0 },
                completed: 0,
                resets: 0,
            })),
            config,
        }
    }

    pub fn config(&self) -> &AccelConfig {
        &self.config
    }

    pub fn mode(&self) -> Mode {
        self.state.lock(|s| s.get().mode)
    }

    /// Last committed sample; zero until the first read completes.
    pub fn latest_sample(&self) -> AccelSample {
        self.state.lock(|s| s.get().sample)
    }

    /// Transactions that made it back to [`Mode::Idle`].
    pub fn completed(&self) -> u32 {
        self.state.lock(|s| s.get().completed)
    }

    /// Transactions abandoned into [`Mode::NeedsReset`].
    pub fn resets(&self) -> u32 {
        self.state.lock(|s| s.get().resets)
    }

    /// Kick off a background read. Outside [`Mode::Idle`] this forces a reset.
    pub fn request_poll<B: BusControl>(&self, bus: &mut B, now_ms: u32) {
        self.state
            .lock(|s| self.dispatch(s, bus, Event::PollRequested, None, now_ms));
    }

    /// Bus interrupt entry.
    pub fn on_bus_event<B: BusControl>(&self, bus: &mut B, event: BusEvent) {
        self.state.lock(|s| {
            let now = s.get().started_ms;
            self.dispatch(s, bus, Event::Bus(event), None, now)
        });
    }

    /// Receive-DMA completion entry; `raw` is the DMA destination buffer.
    pub fn on_dma_complete<B: BusControl>(&self, bus: &mut B, raw: &[u8; SAMPLE_LEN]) {
        self.state.lock(|s| {
            let now = s.get().started_ms;
            self.dispatch(s, bus, Event::DmaComplete, Some(raw), now)
        });
    }

    /// Abandon a transaction that has been on the bus for longer than the
    /// configured budget. Returns `true` if it was abandoned.
    pub fn check_timeout<B: BusControl>(&self, bus: &mut B, now_ms: u32) -> bool {
        let Some(limit) = self.config.transaction_timeout_ms else {
            return false;
        };
        self.state.lock(|s| {
            let state = s.get();
            let elapsed = now_ms.wrapping_sub(state.started_ms);
            if !state.mode.in_flight() || elapsed <= limit {
                return false;
            }
            warn!(
                "accelerometer transaction stuck in {:?} for {} ms",
                state.mode,
                elapsed
            );
            self.dispatch(s, bus, Event::Timeout, None, now_ms);
            true
        })
    }

    /// Write the configuration registers, read one sample back and return
    /// to [`Mode::Idle`].
    ///
    /// Blocks on `i2c`. While the mode is [`Mode::NeedsReset`] every bus
    /// and DMA event is ignored, so interrupts may keep firing meanwhile.
    /// The read-back becomes [`Self::latest_sample`].
    pub fn reinitialize<I: I2c>(&self, i2c: &mut I) -> Result<(), Error> {
        let address = self.config.address;
        debug!("configuring accelerometer at {:#x}", address);
        self.state.lock(|s| {
            let mut state = s.get();
            state.mode = Mode::NeedsReset;
            s.set(state);
        });

        let sample = match lis3dh::init(i2c, address)
            .and_then(|()| lis3dh::read_sample(i2c, address, self.config.data_register))
        {
            Ok(sample) => sample,
            Err(e) => {
                let e: BusError = e.kind().into();
                debug!("accelerometer init failed: {:?}", e);
                return Err(Error::Init(e));
            }
        };

        self.state.lock(|s| {
            let mut state = s.get();
            state.mode = Mode::Idle;
            state.sample = sample;
            s.set(state);
        });
        info!("accelerometer ready");
        Ok(())
    }

    fn dispatch<B: BusControl>(
        &self,
        cell: &Cell<State>,
        bus: &mut B,
        event: Event,
        raw: Option<&[u8; SAMPLE_LEN]>,
        now_ms: u32,
    ) {
        let mut state = cell.get();
        let transition = step(state.mode, event);

        for &command in transition.commands.iter() {
            match command {
                Command::StartWrite => bus.start_write(self.config.address, 1),
                Command::SendRegister => bus.send_byte(self.config.data_register | AUTO_INCREMENT),
                Command::StartRead => bus.start_read(self.config.address, SAMPLE_LEN as u8),
                Command::Stop => bus.stop(),
                Command::Listen(irq) => bus.listen(irq),
                Command::Unlisten(irq) => bus.unlisten(irq),
                Command::Commit => {
                    if let Some(raw) = raw {
                        state.sample = AccelSample::from_le_bytes(raw);
                    }
                }
            }
        }

        match (state.mode, transition.mode) {
            (Mode::Idle, Mode::Starting) => state.started_ms = now_ms,
            (Mode::Stopping, Mode::Idle) => state.completed = state.completed.wrapping_add(1),
            (from, Mode::NeedsReset) if from != Mode::NeedsReset => {
                warn!("accelerometer transaction reset: {:?} in {:?}", event, from);
                state.resets = state.resets.wrapping_add(1);
            }
            _ => {}
        }
        state.mode = transition.mode;
        cell.set(state);
    }
}
