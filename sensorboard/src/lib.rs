#![cfg_attr(not(test), no_std)]
#![doc = "Real-time core of the SB1.0 sensor board."]
#![doc = ""]
#![doc = "Audio capture with ping-pong and decimated buffers, fixed-point spectral"]
#![doc = "analysis, the SB1.0 summary frame and the interrupt-driven accelerometer"]
#![doc = "transaction. Peripherals are reached through the traits in [`bus`]."]

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

pub mod accel;
pub mod board;
pub mod bus;
pub mod capture;
pub mod config;
pub mod fft;
pub mod frame;
pub mod math;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod spectrum;

pub use board::{Cycle, SensorBoard};
pub use config::Config;
pub use frame::SummaryFrame;
