//! Fixed-point radix-2 FFT.
//!
//! In-place decimation-in-time transform over separate real and imaginary
//! `i16` arrays, driven by one quantised sine table. The spectral pipeline
//! reads the same table to build its analysis window, so the table layout
//! is part of the public contract:
//!
//! - one period is [`SINE_TABLE_PERIOD`] phase steps;
//! - [`SINE_TABLE`] holds the first three quarters of that period,
//!   `SINE_TABLE[i] = round(32767 * sin(2π i / SINE_TABLE_PERIOD))`;
//! - cosine is read a quarter period ahead, `SINE_TABLE[i + SINE_TABLE_PERIOD / 4]`.

use core::f64::consts::PI;

/// Phase steps in one full sine period.
pub const SINE_TABLE_PERIOD: usize = 1 << LOG2_SINE_TABLE_PERIOD;
/// log2 of [`SINE_TABLE_PERIOD`]; also the largest supported transform order.
pub const LOG2_SINE_TABLE_PERIOD: u32 = 10;
/// Entries stored in [`SINE_TABLE`].
pub const SINE_TABLE_LEN: usize = SINE_TABLE_PERIOD - SINE_TABLE_PERIOD / 4;

/// Q15 sine over three quarters of a period.
pub static SINE_TABLE: [i16; SINE_TABLE_LEN] = build_sine_table();

/// FFT error.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Arrays differ in length, the length is not a power of two, or it
    /// exceeds [`SINE_TABLE_PERIOD`].
    InvalidLength,
}

const fn sin_q15(i: usize) -> i16 {
    let half = SINE_TABLE_PERIOD / 2;
    let quarter = SINE_TABLE_PERIOD / 4;

    let (mut idx, sign) = if i < half { (i, 1.0) } else { (i - half, -1.0) };
    if idx > quarter {
        idx = half - idx;
    }

    // Taylor series on [0, π/2]; the 12th term is far below one Q15 LSB.
    let x = idx as f64 * (2.0 * PI / SINE_TABLE_PERIOD as f64);
    let x2 = x * x;
    let mut term = x;
    let mut sum = x;
    let mut n = 1;
    while n < 12 {
        term = -term * x2 / ((2 * n) * (2 * n + 1)) as f64;
        sum += term;
        n += 1;
    }

    let v = sign * sum * 32767.0;
    if v >= 0.0 {
        (v + 0.5) as i16
    } else {
        (v - 0.5) as i16
    }
}

const fn build_sine_table() -> [i16; SINE_TABLE_LEN] {
    let mut table = [0i16; SINE_TABLE_LEN];
    let mut i = 0;
    while i < SINE_TABLE_LEN {
        table[i] = sin_q15(i);
        i += 1;
    }
    table
}

/// Q15 multiply, rounded.
#[inline(always)]
pub const fn fix_mpy(a: i16, b: i16) -> i16 {
    let c = (a as i32 * b as i32) >> 14;
    ((c >> 1) + (c & 1)) as i16
}

/// Transform `re`/`im` in place.
///
/// The forward transform halves every stage, so its output is the DFT
/// divided by N. The inverse transform only halves a stage when some value
/// exceeds 16383 and returns how many stages it halved; multiply the output
/// by `2^scale` to restore amplitude.
pub fn fix_fft(re: &mut [i16], im: &mut [i16], inverse: bool) -> Result<u32, Error> {
    let n = re.len();
    if n != im.len() || !n.is_power_of_two() || n > SINE_TABLE_PERIOD {
        return Err(Error::InvalidLength);
    }

    // Decimation in time: bit-reverse the input order.
    let nn = n - 1;
    let mut mr = 0usize;
    for m in 1..=nn {
        let mut l = n;
        loop {
            l >>= 1;
            if mr + l <= nn {
                break;
            }
        }
        mr = (mr & (l - 1)) + l;
        if mr > m {
            re.swap(m, mr);
            im.swap(m, mr);
        }
    }

    let mut scale = 0;
    let mut l = 1usize;
    let mut stage = 0u32;
    while l < n {
        let shift = if inverse {
            let big = re
                .iter()
                .zip(im.iter())
                .any(|(r, i)| r.unsigned_abs() > 16383 || i.unsigned_abs() > 16383);
            if big {
                scale += 1;
            }
            big
        } else {
            true
        };

        let istep = l << 1;
        let k = LOG2_SINE_TABLE_PERIOD - 1 - stage;
        for m in 0..l {
            let j = m << k;
            let mut wr = SINE_TABLE[j + SINE_TABLE_PERIOD / 4];
            let mut wi = -SINE_TABLE[j];
            if inverse {
                wi = -wi;
            }
            if shift {
                wr >>= 1;
                wi >>= 1;
            }

            let mut i = m;
            while i < n {
                let j = i + l;
                let tr = (fix_mpy(wr, re[j]) as i32 - fix_mpy(wi, im[j]) as i32) as i16;
                let ti = (fix_mpy(wr, im[j]) as i32 + fix_mpy(wi, re[j]) as i32) as i16;
                let mut qr = re[i];
                let mut qi = im[i];
                if shift {
                    qr >>= 1;
                    qi >>= 1;
                }
                re[j] = (qr as i32 - tr as i32) as i16;
                im[j] = (qi as i32 - ti as i32) as i16;
                re[i] = (qr as i32 + tr as i32) as i16;
                im[i] = (qi as i32 + ti as i32) as i16;
                i += istep;
            }
        }

        stage += 1;
        l = istep;
    }

    Ok(scale)
}
