//! Square-root primitives.

/// `floor(sqrt(x))`, one result bit per iteration.
pub const fn integer_sqrt(x: u32) -> u16 {
    let mut res: u16 = 0;
    let mut add: u16 = 0x8000;
    let mut i = 0;
    while i < 16 {
        let temp = res | add;
        let g2 = temp as u32 * temp as u32;
        if x >= g2 {
            res = temp;
        }
        add >>= 1;
        i += 1;
    }
    res
}

/// Fractional bits of the [`fixed_sqrt`] input and output.
pub const FIXED_FRAC_BITS: u32 = 16;

/// Square root in 16.16 fixed point, rounded to nearest.
///
/// Fed a plain integer `x`, the result is `sqrt(x) * 256`: eight more
/// fractional bits than [`integer_sqrt`], which is what the magnitude path
/// uses to keep quiet bins distinguishable.
///
/// Only non-negative inputs are meaningful. A negative input returns the
/// negated root of its magnitude, so the function stays monotonic.
pub const fn fixed_sqrt(x: i32) -> i32 {
    let neg = x < 0;
    let mut num = x.unsigned_abs();
    let mut result: u32 = 0;

    let mut bit: u32 = if num & 0xFFF0_0000 != 0 { 1 << 30 } else { 1 << 18 };
    while bit > num {
        bit >>= 2;
    }

    // Two passes keep every intermediate in 32 bits: the first yields the
    // top 24 bits of the root, the second the low 8.
    let mut pass = 0;
    while pass < 2 {
        while bit != 0 {
            if num >= result + bit {
                num -= result + bit;
                result = (result >> 1) + bit;
            } else {
                result >>= 1;
            }
            bit >>= 2;
        }

        if pass == 0 {
            if num > 0xFFFF {
                // num cannot be shifted by 16; fold in result + 0.5 instead.
                num -= result;
                num = (num << 16) - 0x8000;
                result = (result << 16) + 0x8000;
            } else {
                num <<= 16;
                result <<= 16;
            }
            bit = 1 << 14;
        }
        pass += 1;
    }

    if num > result {
        result += 1;
    }

    if neg {
        -(result as i32)
    } else {
        result as i32
    }
}
