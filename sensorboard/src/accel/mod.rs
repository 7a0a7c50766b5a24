//! 3-axis accelerometer polled over I2C in the background.

pub mod lis3dh;
mod poller;
pub mod transaction;

pub use poller::AccelPoller;
pub use transaction::{step, Command, Event, Mode, Transition};

use crate::bus::BusError;

/// Accelerometer error
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Writing the configuration registers failed.
    Init(BusError),
}

/// Raw axis readings as the device reports them.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AccelSample {
    pub x: i16,
    pub y: i16,
    pub z: i16,
}

impl AccelSample {
    /// Decode OUT_X_L..OUT_Z_H.
    pub fn from_le_bytes(raw: &[u8; lis3dh::SAMPLE_LEN]) -> Self {
        Self {
            x: i16::from_le_bytes([raw[0], raw[1]]),
            y: i16::from_le_bytes([raw[2], raw[3]]),
            z: i16::from_le_bytes([raw[4], raw[5]]),
        }
    }

    pub fn to_le_bytes(self) -> [u8; lis3dh::SAMPLE_LEN] {
        let [x0, x1] = self.x.to_le_bytes();
        let [y0, y1] = self.y.to_le_bytes();
        let [z0, z1] = self.z.to_le_bytes();
        [x0, x1, y0, y1, z0, z1]
    }

    pub fn axes(self) -> [i16; 3] {
        [self.x, self.y, self.z]
    }
}
