//! Simulated accelerometer bus.
//!
//! [`SimBus`] stands in for the I2C peripheral with a LIS3DH attached. Each
//! [`BusControl`] call queues the event the real peripheral would raise;
//! [`pump`] delivers them to an [`AccelPoller`] the way the bus and DMA
//! interrupts would. The same type answers blocking [`I2c`] transactions,
//! so device initialisation runs against the same register file.

use heapless::Deque;

use embedded_hal_1::i2c::{ErrorType, I2c, Operation};

use crate::accel::lis3dh::{self, AUTO_INCREMENT, SAMPLE_LEN};
use crate::accel::{AccelPoller, AccelSample};
use crate::bus::{BusControl, BusError, BusEvent, BusInterrupt, SharedBus};

/// Operations recorded by [`SimBus`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusOp {
    StartWrite { address: u8, byte_count: u8 },
    SendByte(u8),
    StartRead { address: u8, byte_count: u8 },
    Stop,
    Listen(BusInterrupt),
    Unlisten(BusInterrupt),
    /// Blocking register write through [`I2c`].
    WriteRegister { register: u8, value: u8 },
}

/// Something the simulated hardware is about to signal.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SimEvent {
    Bus(BusEvent),
    Dma([u8; SAMPLE_LEN]),
}

const LOG_LEN: usize = 32;
const REGISTERS: usize = 0x40;

/// LIS3DH on a simulated bus.
pub struct SimBus {
    address: u8,
    registers: [u8; REGISTERS],
    pointer: u8,
    pending: Deque<SimEvent, 4>,
    transmit_ready: bool,
    transfer_complete: bool,
    log: Deque<BusOp, LOG_LEN>,
    nack_in: Option<u8>,
    fail_init: bool,
    drop_next: bool,
}

impl SimBus {
    pub fn new() -> Self {
        Self::with_address(lis3dh::ADDRESS)
    }

    pub fn with_address(address: u8) -> Self {
        Self {
            address,
            registers: [0; REGISTERS],
            pointer: 0,
            pending: Deque::new(),
            transmit_ready: false,
            transfer_complete: false,
            log: Deque::new(),
            nack_in: None,
            fail_init: false,
            drop_next: false,
        }
    }

    /// Load the output registers with `sample`.
    pub fn set_acceleration(&mut self, sample: AccelSample) {
        let start = lis3dh::OUT_X_L as usize;
        self.registers[start..start + SAMPLE_LEN].copy_from_slice(&sample.to_le_bytes());
    }

    pub fn register(&self, register: u8) -> u8 {
        self.registers[register as usize % REGISTERS]
    }

    /// The next transaction command is answered with a NACK.
    pub fn nack_next(&mut self) {
        self.nack_after(0);
    }

    /// Let `commands` transaction commands through, then NACK the one after.
    pub fn nack_after(&mut self, commands: u8) {
        self.nack_in = Some(commands);
    }

    /// Blocking transactions fail until cleared.
    pub fn set_fail_init(&mut self, fail: bool) {
        self.fail_init = fail;
    }

    /// The next event the hardware would raise is lost.
    pub fn drop_next_event(&mut self) {
        self.drop_next = true;
    }

    /// Most recent operations, oldest first.
    pub fn log(&self) -> impl Iterator<Item = &BusOp> {
        self.log.iter()
    }

    pub fn clear_log(&mut self) {
        self.log.clear();
    }

    pub fn listening(&self, interrupt: BusInterrupt) -> bool {
        match interrupt {
            BusInterrupt::TransmitReady => self.transmit_ready,
            BusInterrupt::TransferComplete => self.transfer_complete,
        }
    }

    /// Pop the next event whose interrupt is enabled. Masked events are discarded.
    pub fn next_event(&mut self) -> Option<SimEvent> {
        while let Some(event) = self.pending.pop_front() {
            let enabled = match event {
                SimEvent::Bus(BusEvent::TransmitReady) => self.transmit_ready,
                SimEvent::Bus(BusEvent::TransferComplete) => self.transfer_complete,
                _ => true,
            };
            if enabled {
                return Some(event);
            }
        }
        None
    }

    fn record(&mut self, op: BusOp) {
        if self.log.is_full() {
            self.log.pop_front();
        }
        let _ = self.log.push_back(op);
    }

    fn raise(&mut self, event: SimEvent) {
        if core::mem::take(&mut self.drop_next) {
            return;
        }
        if self.pending.is_full() {
            self.pending.pop_front();
        }
        let _ = self.pending.push_back(event);
    }

    /// Raise `event`, or the pending NACK, for a command addressed to `address`.
    fn answer(&mut self, address: u8, event: SimEvent) {
        let nack = match self.nack_in {
            Some(0) => {
                self.nack_in = None;
                true
            }
            Some(n) => {
                self.nack_in = Some(n - 1);
                false
            }
            None => false,
        };
        if nack || address != self.address {
            self.raise(SimEvent::Bus(BusEvent::Error(BusError::Nack)));
        } else {
            self.raise(event);
        }
    }

    fn read_registers(&mut self, out: &mut [u8], auto_increment: bool) {
        for b in out.iter_mut() {
            *b = self.registers[self.pointer as usize % REGISTERS];
            if auto_increment {
                self.pointer = self.pointer.wrapping_add(1);
            }
        }
    }
}

impl Default for SimBus {
    fn default() -> Self {
        Self::new()
    }
}

impl BusControl for SimBus {
    fn start_write(&mut self, address: u8, byte_count: u8) {
        self.record(BusOp::StartWrite { address, byte_count });
        self.answer(address, SimEvent::Bus(BusEvent::TransmitReady));
    }

    fn send_byte(&mut self, value: u8) {
        self.record(BusOp::SendByte(value));
        self.pointer = value & !AUTO_INCREMENT;
        let address = self.address;
        self.answer(address, SimEvent::Bus(BusEvent::TransferComplete));
    }

    fn start_read(&mut self, address: u8, byte_count: u8) {
        self.record(BusOp::StartRead { address, byte_count });
        let mut raw = [0u8; SAMPLE_LEN];
        let n = (byte_count as usize).min(SAMPLE_LEN);
        self.read_registers(&mut raw[..n], true);
        self.answer(address, SimEvent::Dma(raw));
    }

    fn stop(&mut self) {
        self.record(BusOp::Stop);
        self.raise(SimEvent::Bus(BusEvent::StopDetected));
    }

    fn listen(&mut self, interrupt: BusInterrupt) {
        self.record(BusOp::Listen(interrupt));
        match interrupt {
            BusInterrupt::TransmitReady => self.transmit_ready = true,
            BusInterrupt::TransferComplete => self.transfer_complete = true,
        }
    }

    fn unlisten(&mut self, interrupt: BusInterrupt) {
        self.record(BusOp::Unlisten(interrupt));
        match interrupt {
            BusInterrupt::TransmitReady => self.transmit_ready = false,
            BusInterrupt::TransferComplete => self.transfer_complete = false,
        }
    }
}

impl ErrorType for SimBus {
    type Error = BusError;
}

impl I2c for SimBus {
    fn transaction(&mut self, address: u8, operations: &mut [Operation<'_>]) -> Result<(), Self::Error> {
        if self.fail_init || address != self.address {
            return Err(BusError::Nack);
        }
        let mut auto_increment = false;
        for op in operations {
            match op {
                Operation::Write(bytes) => {
                    let Some((&register, data)) = bytes.split_first() else {
                        continue;
                    };
                    self.pointer = register & !AUTO_INCREMENT;
                    auto_increment = register & AUTO_INCREMENT != 0;
                    for &value in data {
                        let register = self.pointer;
                        self.registers[register as usize % REGISTERS] = value;
                        self.record(BusOp::WriteRegister { register, value });
                        if auto_increment {
                            self.pointer = self.pointer.wrapping_add(1);
                        }
                    }
                }
                Operation::Read(buf) => self.read_registers(buf, auto_increment),
            }
        }
        Ok(())
    }
}

/// Deliver queued events to `poller` until the bus goes quiet.
///
/// Each event is handled under the shared-bus lock, like an interrupt
/// handler would. Returns the number of events delivered.
pub fn pump(bus: &SharedBus<SimBus>, poller: &AccelPoller) -> usize {
    let mut delivered = 0;
    loop {
        let handled = bus.lock(|cell| {
            let mut bus = cell.borrow_mut();
            match bus.next_event() {
                Some(SimEvent::Bus(event)) => poller.on_bus_event(&mut *bus, event),
                Some(SimEvent::Dma(raw)) => poller.on_dma_complete(&mut *bus, &raw),
                None => return false,
            }
            true
        });
        if !handled {
            return delivered;
        }
        delivered += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::Mode;
    use crate::bus;
    use crate::config::AccelConfig;

    fn ready(bus: &SharedBus<SimBus>) -> AccelPoller {
        let poller = AccelPoller::new(AccelConfig::default());
        poller.reinitialize(&mut bus::SharedI2c(bus)).unwrap();
        poller
    }

    #[test]
    fn init_writes_control_registers() {
        let bus = bus::shared(SimBus::new());
        let _poller = ready(&bus);
        bus.lock(|b| {
            let b = b.borrow();
            assert_eq!(b.register(lis3dh::CTRL_REG1), lis3dh::CTRL_REG1_VALUE);
            assert_eq!(b.register(lis3dh::CTRL_REG4), lis3dh::CTRL_REG4_VALUE);
            let log: std::vec::Vec<_> = b.log().copied().collect();
            assert_eq!(
                log,
                [
                    BusOp::WriteRegister { register: 0x20, value: 0b0101_0111 },
                    BusOp::WriteRegister { register: 0x23, value: 0b1011_1000 },
                ]
            );
        });
    }

    #[test]
    fn background_poll_reads_device_sample() {
        let bus = bus::shared(SimBus::new());
        let poller = ready(&bus);
        let sample = AccelSample { x: 1024, y: -2048, z: 16000 };
        bus.lock(|b| b.borrow_mut().set_acceleration(sample));

        bus.lock(|b| poller.request_poll(&mut *b.borrow_mut(), 0));
        assert_eq!(pump(&bus, &poller), 4);
        assert_eq!(poller.mode(), Mode::Idle);
        assert_eq!(poller.latest_sample(), sample);
        assert_eq!(poller.completed(), 1);
    }

    #[test]
    fn nack_in_any_phase_ends_in_needs_reset() {
        // 0 NACKs the address, 1 the register byte, 2 the read restart.
        for phase in 0..3 {
            let bus = bus::shared(SimBus::new());
            let poller = ready(&bus);
            bus.lock(|b| {
                let mut b = b.borrow_mut();
                b.clear_log();
                b.nack_after(phase);
                poller.request_poll(&mut *b, 0);
            });
            pump(&bus, &poller);

            assert_eq!(poller.mode(), Mode::NeedsReset, "phase {phase}");
            assert_eq!(poller.completed(), 0);
            assert_eq!(poller.resets(), 1);
            bus.lock(|b| {
                let b = b.borrow();
                assert!(b.log().any(|op| *op == BusOp::Stop));
                assert!(!b.listening(BusInterrupt::TransmitReady));
                assert!(!b.listening(BusInterrupt::TransferComplete));
            });
        }
    }

    #[test]
    fn lost_event_is_caught_by_watchdog() {
        let bus = bus::shared(SimBus::new());
        let poller = ready(&bus);

        bus.lock(|b| {
            let mut b = b.borrow_mut();
            poller.request_poll(&mut *b, 0);
            let _ = b.next_event();
            b.drop_next_event();
            poller.on_bus_event(&mut *b, BusEvent::TransmitReady);
        });
        assert_eq!(pump(&bus, &poller), 0);
        assert_eq!(poller.mode(), Mode::SendingRegister);

        assert!(bus.lock(|b| poller.check_timeout(&mut *b.borrow_mut(), 11)));
        pump(&bus, &poller);
        assert_eq!(poller.mode(), Mode::NeedsReset);

        poller.reinitialize(&mut bus::SharedI2c(&bus)).unwrap();
        assert_eq!(poller.mode(), Mode::Idle);
    }

    #[test]
    fn failing_init_reports_bus_error() {
        let bus = bus::shared(SimBus::new());
        bus.lock(|b| b.borrow_mut().set_fail_init(true));
        let poller = AccelPoller::new(AccelConfig::default());
        let result = poller.reinitialize(&mut bus::SharedI2c(&bus));
        assert_eq!(result, Err(crate::accel::Error::Init(BusError::Nack)));
    }

    #[test]
    fn init_reads_back_current_acceleration() {
        let bus = bus::shared(SimBus::new());
        let sample = AccelSample { x: 512, y: -512, z: 16384 };
        bus.lock(|b| b.borrow_mut().set_acceleration(sample));
        let poller = ready(&bus);
        assert_eq!(poller.mode(), Mode::Idle);
        assert_eq!(poller.latest_sample(), sample);
        assert_eq!(poller.completed(), 0);
    }

    #[test]
    fn blocking_read_matches_registers() {
        let mut sim = SimBus::new();
        let sample = AccelSample { x: -1, y: 2, z: -3 };
        sim.set_acceleration(sample);
        let read = lis3dh::read_sample(&mut sim, lis3dh::ADDRESS, lis3dh::OUT_X_L).unwrap();
        assert_eq!(read, sample);
        assert_eq!(
            lis3dh::read_sample(&mut sim, 0x19, lis3dh::OUT_X_L),
            Err(BusError::Nack)
        );
    }
}
