//! Accelerometer read transaction as a pure transition function.
//!
//! ```text
//!   Idle --poll--> Starting --transmit-ready--> SendingRegister
//!     ^                                               |
//!     |                                     transfer-complete
//!   stop-detected                                     v
//!     |                                            Reading
//!  Stopping <----------------DMA complete------------+
//! ```
//!
//! Any bus error, timeout or out-of-sequence event ends in `NeedsReset`,
//! which only a device re-initialisation leaves.

use heapless::Vec;

use crate::bus::{BusEvent, BusInterrupt};

/// Transaction state.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Mode {
    Idle,
    Starting,
    SendingRegister,
    Reading,
    Stopping,
    NeedsReset,
}

impl Mode {
    /// A transaction is on the bus.
    pub fn in_flight(self) -> bool {
        matches!(
            self,
            Mode::Starting | Mode::SendingRegister | Mode::Reading | Mode::Stopping
        )
    }
}

/// Input to [`step`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Event {
    /// The main loop wants a new sample.
    PollRequested,
    Bus(BusEvent),
    /// The receive DMA channel finished.
    DmaComplete,
    /// The transaction watchdog expired.
    Timeout,
}

/// Hardware action requested by a transition, executed in order.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Command {
    /// Start, device address, write direction, one byte.
    StartWrite,
    /// Send the first data register with the auto-increment bit.
    SendRegister,
    /// Repeated start, read direction, one sample via DMA.
    StartRead,
    Stop,
    Listen(BusInterrupt),
    Unlisten(BusInterrupt),
    /// Publish the bytes the DMA channel deposited.
    Commit,
}

/// Commands one transition can issue at most.
pub const MAX_COMMANDS: usize = 4;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Transition {
    pub mode: Mode,
    pub commands: Vec<Command, MAX_COMMANDS>,
}

impl Transition {
    fn to(mode: Mode, commands: &[Command]) -> Self {
        // Every table entry below fits MAX_COMMANDS.
        let commands = Vec::from_slice(commands).unwrap_or_default();
        Self { mode, commands }
    }

    fn stay(mode: Mode) -> Self {
        Self::to(mode, &[])
    }

    fn reset() -> Self {
        Self::to(
            Mode::NeedsReset,
            &[
                Command::Stop,
                Command::Unlisten(BusInterrupt::TransmitReady),
                Command::Unlisten(BusInterrupt::TransferComplete),
            ],
        )
    }
}

/// Next mode and the commands that get there.
pub fn step(mode: Mode, event: Event) -> Transition {
    use BusEvent::*;
    use Command::*;

    match (mode, event) {
        // Bus errors included: only re-initialisation leaves this mode, and
        // it may be driving the bus while these events arrive.
        (Mode::NeedsReset, _) => Transition::stay(Mode::NeedsReset),

        // Errors are checked before any state-specific handling.
        (_, Event::Bus(Error(_))) => Transition::reset(),

        (Mode::Idle, Event::PollRequested) => Transition::to(
            Mode::Starting,
            &[StartWrite, Listen(BusInterrupt::TransmitReady)],
        ),
        // A second start on top of a live transaction would corrupt the bus.
        (_, Event::PollRequested) => Transition::reset(),

        (Mode::Idle, Event::Bus(_)) | (Mode::Idle, Event::Timeout) => Transition::stay(Mode::Idle),

        (Mode::Starting, Event::Bus(TransmitReady)) => Transition::to(
            Mode::SendingRegister,
            &[
                SendRegister,
                Unlisten(BusInterrupt::TransmitReady),
                Listen(BusInterrupt::TransferComplete),
            ],
        ),
        (Mode::SendingRegister, Event::Bus(TransferComplete)) => Transition::to(
            Mode::Reading,
            &[Unlisten(BusInterrupt::TransferComplete), StartRead],
        ),
        (Mode::Reading, Event::DmaComplete) => Transition::to(Mode::Stopping, &[Commit, Stop]),
        (Mode::Stopping, Event::Bus(StopDetected)) => Transition::stay(Mode::Idle),

        // Wrong bus event for the phase, DMA outside Reading, or the watchdog.
        _ => Transition::reset(),
    }
}
