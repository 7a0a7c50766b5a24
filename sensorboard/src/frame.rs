//! SB1.0 summary frame.
//!
//! Fixed layout, multi-byte fields in the byte order of the producing core:
//!
//! | Offset | Field | Type |
//! |-------:|-------|------|
//! | 0  | magic `"SB1.0"` | 5 bytes |
//! | 5  | low bands | 6 × u16 |
//! | 17 | high bands | 26 × u16 |
//! | 69 | energy | u16 |
//! | 71 | peak magnitude | u16 |
//! | 73 | peak frequency (Hz) | u16 |
//! | 75 | accelerometer x, y, z | 3 × i16 |
//! | 81 | analog channels | 6 × u16 |
//! | 93 | trailer `"END"` | 3 bytes |

use heapless::Vec;

use crate::config::{AUX_CHANNELS, HIGH_BANDS, LOW_BANDS};

pub const MAGIC: [u8; 5] = *b"SB1.0";
pub const TRAILER: [u8; 3] = *b"END";

/// Encoded frame length.
pub const FRAME_LEN: usize =
    MAGIC.len() + 2 * (LOW_BANDS + HIGH_BANDS + 3 + 3 + AUX_CHANNELS) + TRAILER.len();

const _: () = assert!(FRAME_LEN == 96);

/// Frame decode error.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Fewer than [`FRAME_LEN`] bytes.
    Truncated,
    /// Missing `"SB1.0"`.
    BadHeader,
    /// Missing `"END"`.
    BadTrailer,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Truncated => write!(f, "frame shorter than {} bytes", FRAME_LEN),
            Error::BadHeader => write!(f, "missing SB1.0 header"),
            Error::BadTrailer => write!(f, "missing END trailer"),
        }
    }
}

impl core::error::Error for Error {}

/// Byte order of the multi-byte fields.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    #[cfg(target_endian = "little")]
    pub const NATIVE: Self = Self::Little;
    #[cfg(target_endian = "big")]
    pub const NATIVE: Self = Self::Big;
}

/// Contents of one output frame.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SummaryFrame {
    pub low_bands: [u16; LOW_BANDS],
    pub high_bands: [u16; HIGH_BANDS],
    pub energy: u16,
    pub peak_magnitude: u16,
    pub peak_hz: u16,
    pub accel: [i16; 3],
    /// Auxiliary channels, already shifted to 16-bit full scale.
    pub aux: [u16; AUX_CHANNELS],
}

struct Writer<'a> {
    buf: &'a mut [u8; FRAME_LEN],
    pos: usize,
    endian: Endian,
}

impl Writer<'_> {
    fn bytes(&mut self, b: &[u8]) {
        self.buf[self.pos..self.pos + b.len()].copy_from_slice(b);
        self.pos += b.len();
    }

    fn u16(&mut self, v: u16) {
        let b = match self.endian {
            Endian::Little => v.to_le_bytes(),
            Endian::Big => v.to_be_bytes(),
        };
        self.bytes(&b);
    }

    fn u16s(&mut self, vs: &[u16]) {
        for &v in vs {
            self.u16(v);
        }
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    endian: Endian,
}

impl Reader<'_> {
    fn u16(&mut self) -> u16 {
        let b = [self.buf[self.pos], self.buf[self.pos + 1]];
        self.pos += 2;
        match self.endian {
            Endian::Little => u16::from_le_bytes(b),
            Endian::Big => u16::from_be_bytes(b),
        }
    }

    fn u16s<const N: usize>(&mut self) -> [u16; N] {
        let mut out = [0; N];
        for v in out.iter_mut() {
            *v = self.u16();
        }
        out
    }
}

impl SummaryFrame {
    /// Encode in the native byte order.
    pub fn encode(&self, out: &mut [u8; FRAME_LEN]) {
        self.encode_with(out, Endian::NATIVE)
    }

    pub fn encode_with(&self, out: &mut [u8; FRAME_LEN], endian: Endian) {
        let mut w = Writer { buf: out, pos: 0, endian };
        w.bytes(&MAGIC);
        w.u16s(&self.low_bands);
        w.u16s(&self.high_bands);
        w.u16(self.energy);
        w.u16(self.peak_magnitude);
        w.u16(self.peak_hz);
        for &axis in &self.accel {
            w.u16(axis as u16);
        }
        w.u16s(&self.aux);
        w.bytes(&TRAILER);
        debug_assert_eq!(w.pos, FRAME_LEN);
    }

    /// Decode the first [`FRAME_LEN`] bytes of `bytes`.
    pub fn decode(bytes: &[u8], endian: Endian) -> Result<Self, Error> {
        if bytes.len() < FRAME_LEN {
            return Err(Error::Truncated);
        }
        if bytes[..MAGIC.len()] != MAGIC {
            return Err(Error::BadHeader);
        }
        if bytes[FRAME_LEN - TRAILER.len()..FRAME_LEN] != TRAILER {
            return Err(Error::BadTrailer);
        }

        let mut r = Reader {
            buf: bytes,
            pos: MAGIC.len(),
            endian,
        };
        let low_bands = r.u16s();
        let high_bands = r.u16s();
        let energy = r.u16();
        let peak_magnitude = r.u16();
        let peak_hz = r.u16();
        let accel = r.u16s::<3>().map(|v| v as i16);
        let aux = r.u16s();

        Ok(Self {
            low_bands,
            high_bands,
            energy,
            peak_magnitude,
            peak_hz,
            accel,
            aux,
        })
    }
}

fn is_magic_prefix(bytes: &[u8]) -> bool {
    let n = bytes.len().min(MAGIC.len());
    bytes[..n] == MAGIC[..n]
}

/// Finds frames in a byte stream that may start mid-frame or carry noise.
pub struct FrameScanner {
    buf: Vec<u8, FRAME_LEN>,
    endian: Endian,
    skipped: usize,
}

impl FrameScanner {
    pub const fn new(endian: Endian) -> Self {
        Self {
            buf: Vec::new(),
            endian,
            skipped: 0,
        }
    }

    /// Bytes discarded while resynchronising.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Feed one byte; returns a frame when its last byte arrives.
    pub fn push(&mut self, byte: u8) -> Option<SummaryFrame> {
        // Never full here: a full buffer is consumed before returning.
        if self.buf.push(byte).is_err() {
            self.drop_front();
        }
        self.resync();

        if !self.buf.is_full() {
            return None;
        }
        match SummaryFrame::decode(&self.buf, self.endian) {
            Ok(frame) => {
                self.buf.clear();
                Some(frame)
            }
            Err(_) => {
                self.drop_front();
                self.resync();
                None
            }
        }
    }

    /// Feed a chunk, calling `on_frame` for every complete frame.
    pub fn extend(&mut self, bytes: &[u8], mut on_frame: impl FnMut(SummaryFrame)) {
        for &b in bytes {
            if let Some(frame) = self.push(b) {
                on_frame(frame);
            }
        }
    }

    fn drop_front(&mut self) {
        if !self.buf.is_empty() {
            self.buf.remove(0);
            self.skipped += 1;
        }
    }

    fn resync(&mut self) {
        while !self.buf.is_empty() && !is_magic_prefix(&self.buf) {
            self.drop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame() -> SummaryFrame {
        let mut f = SummaryFrame::default();
        for (i, b) in f.low_bands.iter_mut().enumerate() {
            *b = 100 + i as u16;
        }
        for (i, b) in f.high_bands.iter_mut().enumerate() {
            *b = 0x1000 + i as u16;
        }
        f.energy = 1234;
        f.peak_magnitude = 0xFFFF;
        f.peak_hz = 2500;
        f.accel = [-1, 16384, -32768];
        f.aux = [0x0FFF << 4, 0, 1 << 4, 2 << 4, 3 << 4, 4 << 4];
        f
    }

    #[test]
    fn markers_bracket_fixed_payload() {
        let mut out = [0u8; FRAME_LEN];
        sample_frame().encode(&mut out);
        assert_eq!(&out[..5], b"SB1.0");
        assert_eq!(&out[FRAME_LEN - 3..], b"END");
        assert_eq!(FRAME_LEN, 5 + 88 + 3);
    }

    #[test]
    fn little_endian_field_offsets() {
        let mut out = [0u8; FRAME_LEN];
        sample_frame().encode_with(&mut out, Endian::Little);
        assert_eq!(&out[5..7], &100u16.to_le_bytes());
        assert_eq!(&out[17..19], &0x1000u16.to_le_bytes());
        assert_eq!(&out[69..71], &1234u16.to_le_bytes());
        assert_eq!(&out[71..73], &[0xFF, 0xFF]);
        assert_eq!(&out[73..75], &2500u16.to_le_bytes());
        assert_eq!(&out[75..77], &(-1i16).to_le_bytes());
        assert_eq!(&out[79..81], &(-32768i16).to_le_bytes());
        assert_eq!(&out[81..83], &0xFFF0u16.to_le_bytes());
    }

    #[test]
    fn decode_reads_back_either_order() {
        let frame = sample_frame();
        for endian in [Endian::Little, Endian::Big] {
            let mut out = [0u8; FRAME_LEN];
            frame.encode_with(&mut out, endian);
            assert_eq!(SummaryFrame::decode(&out, endian), Ok(frame));
        }
        let mut big = [0u8; FRAME_LEN];
        frame.encode_with(&mut big, Endian::Big);
        assert_eq!(&big[5..7], &[0, 100]);
    }

    #[test]
    fn decode_rejects_damaged_frames() {
        let mut out = [0u8; FRAME_LEN];
        sample_frame().encode(&mut out);

        assert_eq!(SummaryFrame::decode(&out[..FRAME_LEN - 1], Endian::NATIVE), Err(Error::Truncated));

        let mut bad = out;
        bad[2] = b'2';
        assert_eq!(SummaryFrame::decode(&bad, Endian::NATIVE), Err(Error::BadHeader));

        let mut bad = out;
        bad[FRAME_LEN - 1] = 0;
        assert_eq!(SummaryFrame::decode(&bad, Endian::NATIVE), Err(Error::BadTrailer));
    }

    #[test]
    fn scanner_skips_leading_garbage() {
        let frame = sample_frame();
        let mut encoded = [0u8; FRAME_LEN];
        frame.encode(&mut encoded);

        let mut stream = std::vec::Vec::new();
        stream.extend_from_slice(b"xxSBSB1");
        stream.extend_from_slice(&encoded);
        stream.extend_from_slice(&encoded);

        let mut scanner = FrameScanner::new(Endian::NATIVE);
        let mut found = std::vec::Vec::new();
        scanner.extend(&stream, |f| found.push(f));
        assert_eq!(found, [frame, frame]);
        assert_eq!(scanner.skipped(), 7);
    }

    #[test]
    fn scanner_recovers_from_a_cut_frame() {
        let frame = sample_frame();
        let mut encoded = [0u8; FRAME_LEN];
        frame.encode(&mut encoded);

        // First frame loses its last 10 bytes; the next one must still be found.
        let mut stream = std::vec::Vec::new();
        stream.extend_from_slice(&encoded[..FRAME_LEN - 10]);
        stream.extend_from_slice(&encoded);

        let mut scanner = FrameScanner::new(Endian::NATIVE);
        let mut found = std::vec::Vec::new();
        scanner.extend(&stream, |f| found.push(f));
        assert_eq!(found, [frame]);
        assert_eq!(scanner.skipped(), FRAME_LEN - 10);
    }
}
