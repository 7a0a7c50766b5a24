//! Capture and downsample buffer manager.
//!
//! The sample interrupt owns a [`Producer`]; the main loop owns the matching
//! [`Consumer`]. Per raw sample the producer tracks the DC level, feeds the
//! low-rate decimator and appends the DC-free sample to the active half of a
//! ping-pong buffer. When that half is full it also receives the linearised
//! low-rate ring and the auxiliary channel readings, then it is published to
//! the consumer and the producer moves on to the other half.
//!
//! Publication uses load/store atomics only, so the exchange also works on
//! cores without compare-and-swap. The producer is expected to run in an
//! interrupt that preempts the consumer on the same core.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use crate::config::{CaptureConfig, AUX_CHANNELS, N_HIGH, N_LOW};

/// Highest meaningful raw ADC reading (12-bit converter).
pub const ADC_MAX: u16 = 0x0FFF;

/// One conversion sequence: the audio channel plus the auxiliary channels.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AdcScan {
    pub audio: u16,
    pub aux: [u16; AUX_CHANNELS],
}

/// One half of the ping-pong buffer together with the data captured with it.
#[derive(Debug, Clone)]
pub struct Side {
    /// DC-free high-rate samples.
    pub high: [i16; N_HIGH],
    /// Low-rate ring in insertion order, oldest first.
    pub low: [i16; N_LOW],
    /// Raw auxiliary readings at the moment the side filled up.
    pub aux: [u16; AUX_CHANNELS],
}

impl Side {
    pub const fn new() -> Self {
        Self {
            high: [0; N_HIGH],
            low: [0; N_LOW],
            aux: [0; AUX_CHANNELS],
        }
    }
}

impl Default for Side {
    fn default() -> Self {
        Self::new()
    }
}

/// Exponential moving average with 16 fractional bits.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DcAverage {
    avg: i32,
    shift: u8,
}

impl DcAverage {
    pub const fn new(initial: i16, shift: u8) -> Self {
        Self {
            avg: (initial as i32) << 16,
            shift: if shift > 31 { 31 } else { shift },
        }
    }

    /// `avg += ((sample << 16) - avg) >> shift`
    #[inline]
    pub fn update(&mut self, sample: i16) {
        let error = ((sample as i32) << 16) - self.avg;
        self.avg += error >> self.shift;
    }

    /// Integer part of the average.
    #[inline]
    pub fn value(&self) -> i16 {
        (self.avg >> 16) as i16
    }
}

/// Averaging decimator feeding a ring of [`N_LOW`] samples.
#[derive(Debug, Clone)]
pub struct Decimator {
    ring: [i16; N_LOW],
    head: usize,
    acc: i32,
    count: u16,
    ratio: u16,
}

impl Decimator {
    /// `ratio` raw samples per output sample; 0 is treated as 1.
    pub const fn new(ratio: u16) -> Self {
        Self {
            ring: [0; N_LOW],
            head: 0,
            acc: 0,
            count: 0,
            ratio: if ratio == 0 { 1 } else { ratio },
        }
    }

    /// Accumulate one sample; every `ratio` samples write `mean - dc` at the head.
    #[inline]
    pub fn push(&mut self, sample: i16, dc: i16) {
        self.acc += sample as i32;
        self.count += 1;
        if self.count >= self.ratio {
            let mean = self.acc / self.ratio as i32;
            self.ring[self.head] = (mean - dc as i32) as i16;
            self.head = (self.head + 1) % N_LOW;
            self.acc = 0;
            self.count = 0;
        }
    }

    /// Next write slot.
    pub fn head(&self) -> usize {
        self.head
    }

    /// Copy the ring into `out` starting at the head, oldest sample first.
    pub fn linearize(&self, out: &mut [i16; N_LOW]) {
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = self.ring[(self.head + i) % N_LOW];
        }
    }
}

/// Storage shared between the sample interrupt and the main loop.
pub struct FrameExchange {
    sides: [UnsafeCell<Side>; 2],
    ready: AtomicBool,
    ready_side: AtomicU8,
    in_use: AtomicBool,
    overruns: AtomicU32,
}

// SAFETY: the producer only writes the side it is filling and the consumer
// only touches the side it was handed. A side changes hands only through
// the `ready` flag (Release/Acquire), and the producer never flips onto a
// side while the consumer holds a `ReadyFrame` for it.
unsafe impl Sync for FrameExchange {}

impl FrameExchange {
    pub const fn new() -> Self {
        Self {
            sides: [UnsafeCell::new(Side::new()), UnsafeCell::new(Side::new())],
            ready: AtomicBool::new(false),
            ready_side: AtomicU8::new(1),
            in_use: AtomicBool::new(false),
            overruns: AtomicU32::new(0),
        }
    }

    /// Split into the interrupt half and the main-loop half.
    pub fn split(&mut self, config: CaptureConfig) -> (Producer<'_>, Consumer<'_>) {
        let this: &Self = self;
        (
            Producer {
                exchange: this,
                active: 0,
                write_pos: 0,
                dc: DcAverage::new(config.dc_initial, config.dc_shift),
                decimator: Decimator::new(config.decimation),
                audio_shift: config.audio_shift,
            },
            Consumer { exchange: this },
        )
    }
}

impl Default for FrameExchange {
    fn default() -> Self {
        Self::new()
    }
}

/// Sample-interrupt half of a [`FrameExchange`].
pub struct Producer<'a> {
    exchange: &'a FrameExchange,
    active: usize,
    write_pos: usize,
    dc: DcAverage,
    decimator: Decimator,
    audio_shift: u8,
}

impl<'a> Producer<'a> {
    /// Scale a raw audio reading into the 15-bit sample domain.
    #[inline]
    fn scale(&self, raw: u16) -> i16 {
        let scaled = (raw.min(ADC_MAX) as u32) << self.audio_shift.min(16);
        scaled.min(i16::MAX as u32) as i16
    }

    /// Process one conversion sequence. Returns `true` when a side was published.
    pub fn on_sample(&mut self, scan: &AdcScan) -> bool {
        let sample = self.scale(scan.audio);

        self.dc.update(sample);
        let dc = self.dc.value();
        self.decimator.push(sample, dc);

        // SAFETY: `active` is never the side lent to the consumer; the flip below
        // is skipped while a `ReadyFrame` is alive.
        let side = unsafe { &mut *self.exchange.sides[self.active].get() };
        side.high[self.write_pos] = (sample as i32 - dc as i32) as i16;
        self.write_pos += 1;

        if self.write_pos < N_HIGH {
            return false;
        }
        self.write_pos = 0;

        let ex = self.exchange;
        if ex.in_use.load(Ordering::Acquire) {
            // The consumer still holds the other side: drop this one and refill it.
            self.count_overrun();
            return false;
        }
        if ex.ready.load(Ordering::Relaxed) {
            self.count_overrun();
        }

        self.decimator.linearize(&mut side.low);
        side.aux = scan.aux;

        ex.ready_side.store(self.active as u8, Ordering::Release);
        self.active ^= 1;
        ex.ready.store(true, Ordering::Release);
        true
    }

    fn count_overrun(&self) {
        let overruns = &self.exchange.overruns;
        overruns.store(overruns.load(Ordering::Relaxed).wrapping_add(1), Ordering::Relaxed);
    }

    /// Side currently being filled.
    pub fn active_side(&self) -> usize {
        self.active
    }

    /// Samples already written into the active side.
    pub fn write_pos(&self) -> usize {
        self.write_pos
    }

    /// Current DC estimate in the scaled sample domain.
    pub fn dc_level(&self) -> i16 {
        self.dc.value()
    }

    /// Write slot of the low-rate ring.
    pub fn low_head(&self) -> usize {
        self.decimator.head()
    }
}

/// Main-loop half of a [`FrameExchange`].
pub struct Consumer<'a> {
    exchange: &'a FrameExchange,
}

impl<'a> Consumer<'a> {
    /// Whether a completed side is waiting.
    pub fn frame_ready(&self) -> bool {
        self.exchange.ready.load(Ordering::Acquire)
    }

    /// Claim the most recently completed side.
    ///
    /// The ready flag is cleared before the side is handed out. The side
    /// stays with the caller until the returned guard is dropped; the
    /// producer keeps refilling its own side in the meantime.
    ///
    /// With nothing pending, only the ready flag is read: an idle call never
    /// blocks the producer from publishing.
    pub fn try_take(&mut self) -> Option<ReadyFrame<'_>> {
        let ex = self.exchange;
        if !ex.ready.load(Ordering::Acquire) {
            return None;
        }
        // A publish landing before this store only moves `ready_side` to the
        // newer side; after it the producer cannot flip.
        ex.in_use.store(true, Ordering::SeqCst);
        ex.ready.store(false, Ordering::Relaxed);
        let index = ex.ready_side.load(Ordering::Acquire) as usize & 1;

        // SAFETY: `in_use` is set, so the producer will not flip onto this side
        // until the guard drops.
        let side = unsafe { &mut *ex.sides[index].get() };
        Some(ReadyFrame {
            side,
            index,
            in_use: &ex.in_use,
        })
    }

    /// Completed sides that were dropped or overwritten before being taken.
    pub fn overruns(&self) -> u32 {
        self.exchange.overruns.load(Ordering::Relaxed)
    }
}

/// A completed side, lent to the main loop.
pub struct ReadyFrame<'a> {
    side: &'a mut Side,
    index: usize,
    in_use: &'a AtomicBool,
}

impl ReadyFrame<'_> {
    /// Which half of the ping-pong buffer this is.
    pub fn index(&self) -> usize {
        self.index
    }
}

impl Deref for ReadyFrame<'_> {
    type Target = Side;

    fn deref(&self) -> &Side {
        self.side
    }
}

impl DerefMut for ReadyFrame<'_> {
    fn deref_mut(&mut self) -> &mut Side {
        self.side
    }
}

impl Drop for ReadyFrame<'_> {
    fn drop(&mut self) {
        self.in_use.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(audio: u16) -> AdcScan {
        AdcScan {
            audio,
            aux: [audio; AUX_CHANNELS],
        }
    }

    /// Straight-line model of the per-sample arithmetic.
    struct Model {
        avg: i32,
        acc: i32,
        count: u16,
        decimated: Vec<i16>,
        high: Vec<i16>,
        cfg: CaptureConfig,
    }

    impl Model {
        fn new(cfg: CaptureConfig) -> Self {
            Self {
                avg: (cfg.dc_initial as i32) << 16,
                acc: 0,
                count: 0,
                decimated: Vec::new(),
                high: Vec::new(),
                cfg,
            }
        }

        fn feed(&mut self, raw: u16) {
            let s = ((raw.min(ADC_MAX) as i32) << self.cfg.audio_shift).min(i16::MAX as i32);
            self.avg += ((s << 16) - self.avg) >> self.cfg.dc_shift;
            let dc = self.avg >> 16;
            self.acc += s;
            self.count += 1;
            if self.count == self.cfg.decimation {
                self.decimated.push((self.acc / self.cfg.decimation as i32 - dc) as i16);
                self.acc = 0;
                self.count = 0;
            }
            self.high.push((s - dc) as i16);
        }
    }

    #[test]
    fn one_window_flips_exactly_once() {
        let mut exchange = FrameExchange::new();
        let (mut producer, mut consumer) = exchange.split(CaptureConfig::default());

        for i in 0..N_HIGH - 1 {
            assert!(!producer.on_sample(&scan(2048)), "sample {i}");
        }
        assert_eq!(producer.active_side(), 0);
        assert!(!consumer.frame_ready());
        assert!(consumer.try_take().is_none());

        assert!(producer.on_sample(&scan(2048)));
        assert_eq!(producer.active_side(), 1);
        assert_eq!(producer.write_pos(), 0);

        let frame = consumer.try_take().unwrap();
        assert_eq!(frame.index(), 0);
        drop(frame);
        assert!(consumer.try_take().is_none(), "flag must be cleared on take");
        assert_eq!(consumer.overruns(), 0);
    }

    #[test]
    fn ready_side_is_untouched_while_the_other_fills() {
        let mut exchange = FrameExchange::new();
        let (mut producer, mut consumer) = exchange.split(CaptureConfig::default());

        for i in 0..N_HIGH {
            producer.on_sample(&scan(1000 + (i % 7) as u16));
        }
        let frame = consumer.try_take().unwrap();
        let before = frame.high;

        for _ in 0..N_HIGH / 2 {
            producer.on_sample(&scan(4000));
        }
        assert_eq!(frame.high, before);
        assert_eq!(frame.aux, [1000 + ((N_HIGH - 1) % 7) as u16; AUX_CHANNELS]);
    }

    #[test]
    fn samples_match_dc_model() {
        let cfg = CaptureConfig::default();
        let mut model = Model::new(cfg);
        let mut exchange = FrameExchange::new();
        let (mut producer, mut consumer) = exchange.split(cfg);

        // A slow ramp with a step keeps the DC filter moving.
        let raw: Vec<u16> = (0..N_HIGH).map(|i| if i < 200 { 3000 } else { 500 + i as u16 }).collect();
        for &r in &raw {
            model.feed(r);
            producer.on_sample(&scan(r));
        }
        let frame = consumer.try_take().unwrap();
        assert_eq!(&frame.high[..], &model.high[..]);
        assert_eq!(producer.dc_level() as i32, model.avg >> 16);
    }

    #[test]
    fn constant_input_fills_ring_in_insertion_order() {
        let mut cfg = CaptureConfig::default();
        cfg.decimation = (N_HIGH / N_LOW) as u16;
        let mut model = Model::new(cfg);
        let mut exchange = FrameExchange::new();
        let (mut producer, mut consumer) = exchange.split(cfg);

        // K * N_LOW samples of one value: exactly one window.
        for _ in 0..cfg.decimation as usize * N_LOW {
            model.feed(3000);
            producer.on_sample(&scan(3000));
        }
        assert_eq!(producer.low_head(), 0);
        let frame = consumer.try_take().unwrap();
        assert_eq!(model.decimated.len(), N_LOW);
        assert_eq!(&frame.low[..], &model.decimated[..]);
        // Each entry is the constant minus the DC estimate at that moment.
        assert!(frame.low.windows(2).all(|w| w[0] >= w[1]));
        assert!(frame.low[0] > 0);
    }

    #[test]
    fn snapshot_relinearises_wrapped_ring() {
        let cfg = CaptureConfig::default();
        let mut model = Model::new(cfg);
        let mut exchange = FrameExchange::new();
        let (mut producer, mut consumer) = exchange.split(cfg);

        let mut last = None;
        for i in 0..4 * N_HIGH {
            let raw = 1000 + ((i / cfg.decimation as usize) * 40 % 3000) as u16;
            model.feed(raw);
            producer.on_sample(&scan(raw));
            if let Some(frame) = consumer.try_take() {
                last = Some(frame.low);
            }
        }
        let low = last.unwrap();
        let produced = model.decimated.len();
        assert!(produced > N_LOW);
        assert_eq!(&low[..], &model.decimated[produced - N_LOW..]);
    }

    #[test]
    fn decimator_uses_window_mean() {
        let mut d = Decimator::new(4);
        for s in [10, 20, 30, 40] {
            d.push(s, 5);
        }
        let mut out = [0i16; N_LOW];
        d.linearize(&mut out);
        assert_eq!(out[N_LOW - 1], 20);
        assert_eq!(d.head(), 1);
    }

    #[test]
    fn untaken_frame_counts_as_overrun() {
        let mut exchange = FrameExchange::new();
        let (mut producer, mut consumer) = exchange.split(CaptureConfig::default());

        for _ in 0..2 * N_HIGH {
            producer.on_sample(&scan(2048));
        }
        assert_eq!(consumer.overruns(), 1);
        // The newest side is handed out.
        assert_eq!(consumer.try_take().unwrap().index(), 1);
    }

    #[test]
    fn held_frame_is_never_overwritten() {
        let mut exchange = FrameExchange::new();
        let (mut producer, mut consumer) = exchange.split(CaptureConfig::default());

        for _ in 0..N_HIGH {
            producer.on_sample(&scan(100));
        }
        let frame = consumer.try_take().unwrap();
        let held = frame.high;

        // Flipping would hand side 0 back to the producer, so both windows are dropped.
        let mut published = 0;
        for _ in 0..2 * N_HIGH {
            published += producer.on_sample(&scan(4095)) as u32;
        }
        assert_eq!(published, 0);
        assert_eq!(frame.high, held);
        assert_eq!(producer.active_side(), 1);
        drop(frame);
        assert_eq!(consumer.overruns(), 2);

        for _ in 0..N_HIGH {
            producer.on_sample(&scan(4095));
        }
        assert_eq!(consumer.try_take().unwrap().index(), 1);
    }

    #[test]
    fn idle_take_leaves_producer_free_to_publish() {
        let mut exchange = FrameExchange::new();
        let (mut producer, mut consumer) = exchange.split(CaptureConfig::default());

        for _ in 0..N_HIGH - 1 {
            producer.on_sample(&scan(2048));
        }
        assert!(consumer.try_take().is_none());
        assert!(!producer.exchange.in_use.load(Ordering::Relaxed));

        // The window completes right after the idle check: it must still flip.
        let published = producer.on_sample(&scan(2048));
        assert!(published);
        assert_eq!(producer.active_side(), 1);
        assert_eq!(consumer.overruns(), 0);
        assert_eq!(consumer.try_take().unwrap().index(), 0);
    }

    #[test]
    fn polling_every_sample_never_counts_overruns() {
        let mut exchange = FrameExchange::new();
        let (mut producer, mut consumer) = exchange.split(CaptureConfig::default());

        let mut taken = std::vec::Vec::new();
        for i in 0..4 * N_HIGH {
            producer.on_sample(&scan(1000 + (i % 13) as u16));
            match consumer.try_take() {
                Some(frame) => taken.push(frame.index()),
                None => assert!(!producer.exchange.in_use.load(Ordering::Relaxed)),
            }
        }
        assert_eq!(taken, [0, 1, 0, 1]);
        assert_eq!(consumer.overruns(), 0);
    }

    #[test]
    fn raw_readings_are_clamped_to_twelve_bits() {
        let mut exchange = FrameExchange::new();
        let mut cfg = CaptureConfig::default();
        cfg.dc_initial = 0;
        cfg.dc_shift = 31;
        let (mut producer, mut consumer) = exchange.split(cfg);
        for _ in 0..N_HIGH {
            producer.on_sample(&scan(u16::MAX));
        }
        let frame = consumer.try_take().unwrap();
        assert!(frame.high.iter().all(|&s| s == (ADC_MAX << 3) as i16));
    }
}
