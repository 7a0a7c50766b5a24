//! LIS3DH register map and blocking set-up.

use embedded_hal_1::i2c::I2c;

use super::AccelSample;

/// 7-bit address with SDO/SA0 tied low.
pub const ADDRESS: u8 = 0x18;

pub const CTRL_REG1: u8 = 0x20;
pub const CTRL_REG4: u8 = 0x23;
/// First of the six output registers (X low byte).
pub const OUT_X_L: u8 = 0x28;
/// Set in a register address to step through consecutive registers.
pub const AUTO_INCREMENT: u8 = 0x80;

/// ODR 100 Hz, normal power, X/Y/Z enabled.
pub const CTRL_REG1_VALUE: u8 = 0b0101_0111;
/// Block data update, little endian, ±16 g, high resolution.
pub const CTRL_REG4_VALUE: u8 = 0b1011_1000;

/// Bytes in one X/Y/Z sample.
pub const SAMPLE_LEN: usize = 6;

/// Put the device into continuous 100 Hz high-resolution sampling.
pub fn init<I: I2c>(i2c: &mut I, address: u8) -> Result<(), I::Error> {
    write_register(i2c, address, CTRL_REG1, CTRL_REG1_VALUE)?;
    write_register(i2c, address, CTRL_REG4, CTRL_REG4_VALUE)
}

pub fn write_register<I: I2c>(i2c: &mut I, address: u8, register: u8, value: u8) -> Result<(), I::Error> {
    i2c.write(address, &[register, value])
}

/// Blocking read of one sample starting at `register`.
pub fn read_sample<I: I2c>(i2c: &mut I, address: u8, register: u8) -> Result<AccelSample, I::Error> {
    let mut raw = [0u8; SAMPLE_LEN];
    i2c.write_read(address, &[register | AUTO_INCREMENT], &mut raw)?;
    Ok(AccelSample::from_le_bytes(&raw))
}
