//! Seams between the real-time core and the board peripherals.
//!
//! The accelerometer transaction only needs a handful of non-blocking bus
//! primitives ([`BusControl`]) plus event delivery from the bus and DMA
//! interrupts. Raw interrupt status words are turned into events by
//! [`BusStatus`].

use core::cell::RefCell;
use core::sync::atomic::{AtomicU32, Ordering};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embedded_hal_1::i2c::{ErrorKind, ErrorType, I2c, NoAcknowledgeSource, Operation};

/// Bus error
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusError {
    /// Bus error
    Bus,
    /// Arbitration loss
    Arbitration,
    /// NACK received
    Nack,
    /// Timeout
    Timeout,
    /// Overrun/underrun
    Overrun,
    /// Anything else the HAL reports
    Other,
}

impl From<ErrorKind> for BusError {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Bus => Self::Bus,
            ErrorKind::ArbitrationLoss => Self::Arbitration,
            ErrorKind::NoAcknowledge(_) => Self::Nack,
            ErrorKind::Overrun => Self::Overrun,
            _ => Self::Other,
        }
    }
}

impl embedded_hal_1::i2c::Error for BusError {
    fn kind(&self) -> ErrorKind {
        match *self {
            Self::Bus => ErrorKind::Bus,
            Self::Arbitration => ErrorKind::ArbitrationLoss,
            Self::Nack => ErrorKind::NoAcknowledge(NoAcknowledgeSource::Unknown),
            Self::Overrun => ErrorKind::Overrun,
            Self::Timeout | Self::Other => ErrorKind::Other,
        }
    }
}

/// Bus interrupts the transaction enables and disables as it goes.
///
/// Stop-detected and error interrupts stay enabled from initialisation on.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusInterrupt {
    TransmitReady,
    TransferComplete,
}

/// One bus interrupt condition.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusEvent {
    /// The transmit data register can take the next byte.
    TransmitReady,
    /// The programmed byte count went out and the bus is held for a restart.
    TransferComplete,
    /// A stop condition was seen.
    StopDetected,
    Error(BusError),
}

/// Non-blocking bus primitives, called from interrupt context.
pub trait BusControl {
    /// Start condition, 7-bit `address`, write direction, `byte_count` bytes to follow.
    fn start_write(&mut self, address: u8, byte_count: u8);
    /// Queue one data byte.
    fn send_byte(&mut self, value: u8);
    /// Repeated start in read direction; the `byte_count` bytes are received by DMA.
    fn start_read(&mut self, address: u8, byte_count: u8);
    /// Generate a stop condition.
    fn stop(&mut self);
    fn listen(&mut self, interrupt: BusInterrupt);
    fn unlisten(&mut self, interrupt: BusInterrupt);
}

/// Bus handle shared between the main loop and the bus interrupts.
pub type SharedBus<B> = Mutex<CriticalSectionRawMutex, RefCell<B>>;

/// Wrap `bus` for sharing.
pub const fn shared<B>(bus: B) -> SharedBus<B> {
    Mutex::new(RefCell::new(bus))
}

/// Blocking [`I2c`] access to a [`SharedBus`].
///
/// The lock is held for one transaction at a time, so interrupts run between
/// the register writes of a multi-step sequence.
pub struct SharedI2c<'a, B>(pub &'a SharedBus<B>);

impl<B: ErrorType> ErrorType for SharedI2c<'_, B> {
    type Error = B::Error;
}

impl<B: I2c> I2c for SharedI2c<'_, B> {
    fn transaction(&mut self, address: u8, operations: &mut [Operation<'_>]) -> Result<(), Self::Error> {
        self.0.lock(|bus| bus.borrow_mut().transaction(address, operations))
    }
}

/// Event decoded from a status word, plus the flags the HAL must clear for it.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Decoded {
    pub event: BusEvent,
    pub clear: u32,
}

/// Raw interrupt status word of the bus peripheral.
///
/// Exactly one event is decoded per call. Error flags win over everything
/// else; among the rest the transaction order applies (transmit-ready,
/// transfer-complete, stop). Only the flags behind the returned event are
/// reported in [`Decoded::clear`], so anything still pending raises the
/// interrupt again and is decoded on the next entry.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BusStatus(pub u32);

impl BusStatus {
    pub const TRANSMIT_READY: u32 = 1 << 1;
    pub const NACK: u32 = 1 << 4;
    pub const STOP_DETECTED: u32 = 1 << 5;
    pub const TRANSFER_COMPLETE: u32 = 1 << 6;
    pub const BUS_ERROR: u32 = 1 << 8;
    pub const ARBITRATION_LOST: u32 = 1 << 9;
    pub const OVERRUN: u32 = 1 << 10;
    pub const TIMEOUT: u32 = 1 << 12;

    pub const ERRORS: u32 =
        Self::NACK | Self::BUS_ERROR | Self::ARBITRATION_LOST | Self::OVERRUN | Self::TIMEOUT;

    pub fn decode(self) -> Option<Decoded> {
        let bits = self.0;

        let errors = bits & Self::ERRORS;
        if errors != 0 {
            let error = if errors & Self::BUS_ERROR != 0 {
                BusError::Bus
            } else if errors & Self::ARBITRATION_LOST != 0 {
                BusError::Arbitration
            } else if errors & Self::NACK != 0 {
                BusError::Nack
            } else if errors & Self::OVERRUN != 0 {
                BusError::Overrun
            } else {
                BusError::Timeout
            };
            // All error flags go at once: the transaction is over either way.
            return Some(Decoded {
                event: BusEvent::Error(error),
                clear: errors,
            });
        }

        let (event, flag) = if bits & Self::TRANSMIT_READY != 0 {
            (BusEvent::TransmitReady, Self::TRANSMIT_READY)
        } else if bits & Self::TRANSFER_COMPLETE != 0 {
            (BusEvent::TransferComplete, Self::TRANSFER_COMPLETE)
        } else if bits & Self::STOP_DETECTED != 0 {
            (BusEvent::StopDetected, Self::STOP_DETECTED)
        } else {
            return None;
        };
        Some(Decoded { event, clear: flag })
    }
}

/// Outgoing frame transport, fire-and-forget.
pub trait Transport {
    fn send(&mut self, bytes: &[u8]);
}

/// Free-running millisecond counter.
pub trait Clock {
    fn now_ms(&self) -> u32;
}

/// Millisecond counter advanced by the periodic tick interrupt.
///
/// Only the tick interrupt writes it, with a plain load/store pair.
pub struct MillisClock {
    ms: AtomicU32,
}

impl MillisClock {
    pub const fn new() -> Self {
        Self { ms: AtomicU32::new(0) }
    }

    /// Advance by one millisecond. Call from the tick interrupt only.
    pub fn tick(&self) {
        let now = self.ms.load(Ordering::Relaxed);
        self.ms.store(now.wrapping_add(1), Ordering::Relaxed);
    }

    /// Advance by `ms`. Call from the tick source only.
    pub fn advance(&self, ms: u32) {
        let now = self.ms.load(Ordering::Relaxed);
        self.ms.store(now.wrapping_add(ms), Ordering::Relaxed);
    }
}

impl Default for MillisClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MillisClock {
    fn now_ms(&self) -> u32 {
        self.ms.load(Ordering::Relaxed)
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now_ms(&self) -> u32 {
        (**self).now_ms()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_take_priority() {
        let s = BusStatus(BusStatus::TRANSMIT_READY | BusStatus::NACK | BusStatus::STOP_DETECTED);
        assert_eq!(
            s.decode(),
            Some(Decoded {
                event: BusEvent::Error(BusError::Nack),
                clear: BusStatus::NACK,
            })
        );

        let s = BusStatus(BusStatus::NACK | BusStatus::ARBITRATION_LOST | BusStatus::BUS_ERROR);
        let d = s.decode().unwrap();
        assert_eq!(d.event, BusEvent::Error(BusError::Bus));
        assert_eq!(d.clear, BusStatus::NACK | BusStatus::ARBITRATION_LOST | BusStatus::BUS_ERROR);
    }

    #[test]
    fn clears_only_the_consumed_flag() {
        let s = BusStatus(BusStatus::TRANSFER_COMPLETE | BusStatus::STOP_DETECTED | (1 << 15));
        let d = s.decode().unwrap();
        assert_eq!(d.event, BusEvent::TransferComplete);
        assert_eq!(d.clear, BusStatus::TRANSFER_COMPLETE);

        let rest = BusStatus(s.0 & !d.clear);
        let d = rest.decode().unwrap();
        assert_eq!(d.event, BusEvent::StopDetected);
        assert_eq!(d.clear, BusStatus::STOP_DETECTED);

        assert_eq!(BusStatus(1 << 15).decode(), None);
        assert_eq!(BusStatus(0).decode(), None);
    }

    #[test]
    fn error_kind_mapping() {
        use embedded_hal_1::i2c::Error as _;
        assert_eq!(
            BusError::from(ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address)),
            BusError::Nack
        );
        assert_eq!(BusError::from(ErrorKind::ArbitrationLoss), BusError::Arbitration);
        assert_eq!(BusError::from(ErrorKind::Other), BusError::Other);
        assert_eq!(BusError::from(BusError::Overrun.kind()), BusError::Overrun);
    }

    #[test]
    fn millis_clock_wraps() {
        let clock = MillisClock::new();
        clock.tick();
        clock.tick();
        assert_eq!(clock.now_ms(), 2);
        clock.advance(u32::MAX);
        assert_eq!(clock.now_ms(), 1);
    }
}
