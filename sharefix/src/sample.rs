//! Hardware sample sources.
//!
//! A [`SampleStream`] is one counter for one event on one thread. Samples are
//! drained in passes: `start_iterate` snapshots what the producer has written
//! so far, `next`/`next_timed` walk that snapshot, and the read position is
//! committed back once the snapshot is exhausted or `abort_iterate` is called.
//!
//! [`PerfStream`] reads a kernel perf ring. [`ReplayStream`] is fed by hand and
//! backs the simulator and tests. [`ThreadSampler`] bundles one stream per
//! tracked event for a thread.

use std::{
    collections::VecDeque,
    os::fd::{AsRawFd, OwnedFd},
    ptr::NonNull,
    sync::atomic::{AtomicU64, Ordering},
};

use log::{debug, warn};

use crate::{Address, Error, Result, system};

pub const DEFAULT_SAMPLING_PERIOD: u64 = 10_000;
pub const DEFAULT_RING_PAGES_LOG2: u32 = 6;

const RECORD_HEADER_SIZE: usize = 8;

/// One observed access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub address: Address,
    pub time: Option<u64>,
}

/// Layout of a sample record, fixed when the stream is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordShape {
    Address,
    AddressTime,
}

impl RecordShape {
    #[inline]
    pub const fn from_timed(timed: bool) -> Self {
        if timed { Self::AddressTime } else { Self::Address }
    }

    #[inline]
    pub const fn record_size(self) -> usize {
        match self {
            Self::Address => RECORD_HEADER_SIZE + 8,
            Self::AddressTime => RECORD_HEADER_SIZE + 16,
        }
    }
}

// ── Nested disable ────────────────────────────────────────────────────

/// Depth counter for re-entrant suspension.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisableNesting {
    depth: u32,
    saved_enabled: bool,
}

impl DisableNesting {
    /// Returns true when this is the outermost suspension of an enabled stream.
    #[inline]
    pub fn push(&mut self, enabled: bool) -> bool {
        self.depth += 1;
        if self.depth == 1 {
            self.saved_enabled = enabled;
            return enabled;
        }
        false
    }

    /// Returns true when the outermost suspension ends and the stream was enabled.
    #[inline]
    pub fn pop(&mut self) -> bool {
        if self.depth == 0 {
            return false;
        }
        self.depth -= 1;
        self.depth == 0 && self.saved_enabled
    }

    #[inline]
    pub fn depth(&self) -> u32 {
        self.depth
    }
}

// ── SampleStream ──────────────────────────────────────────────────────

pub trait SampleStream {
    fn event(&self) -> u64;
    fn shape(&self) -> RecordShape;
    fn is_ok(&self) -> bool;

    fn open(&mut self, enable: bool) -> Result<()>;
    fn close(&mut self);

    fn is_enabled(&self) -> bool;
    fn enable(&mut self) -> bool;
    fn disable(&mut self) -> bool;

    fn nesting_mut(&mut self) -> &mut DisableNesting;

    fn store_disable(&mut self) {
        let enabled = self.is_enabled();
        if self.nesting_mut().push(enabled) {
            self.disable();
        }
    }

    fn restore_disable(&mut self) {
        if self.nesting_mut().pop() {
            self.enable();
        }
    }

    /// Snapshots the pending samples. Returns false if nothing can be read.
    fn start_iterate(&mut self) -> bool;
    /// Next sample of the snapshot, `None` once it is exhausted.
    fn next_sample(&mut self) -> Option<Sample>;
    /// Drops the rest of the snapshot.
    fn abort_iterate(&mut self);

    fn next(&mut self) -> Option<Address> {
        debug_assert_eq!(self.shape(), RecordShape::Address);
        self.next_sample().map(|sample| sample.address)
    }

    fn next_timed(&mut self) -> Option<(Address, u64)> {
        debug_assert_eq!(self.shape(), RecordShape::AddressTime);
        self.next_sample()
            .map(|sample| (sample.address, sample.time.unwrap_or(0)))
    }
}

// ── Ring parsing ──────────────────────────────────────────────────────

/// Read position inside a perf data ring between a snapshot's tail and head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingCursor {
    pub head: u64,
    pub tail: u64,
}

#[inline]
fn ring_read<const N: usize>(data: &[u8], pos: u64) -> [u8; N] {
    let mask = data.len() - 1;
    let mut out = [0u8; N];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = data[(pos as usize).wrapping_add(i) & mask];
    }
    out
}

impl RingCursor {
    pub fn new(tail: u64, head: u64) -> Self {
        Self { head, tail }
    }

    #[inline]
    pub fn is_exhausted(&self) -> bool {
        self.tail >= self.head
    }

    /// Decodes the next well-formed sample record of `shape` from `data`.
    ///
    /// `data` is the ring's data area and must be a power of two in length.
    /// Records of another type or size are skipped. A zero-sized or truncated
    /// record ends the pass.
    pub fn next_record(&mut self, data: &[u8], shape: RecordShape) -> Option<Sample> {
        debug_assert!(data.len().is_power_of_two());
        while !self.is_exhausted() {
            let header: [u8; RECORD_HEADER_SIZE] = ring_read(data, self.tail);
            let kind = u32::from_ne_bytes([header[0], header[1], header[2], header[3]]);
            let size = u16::from_ne_bytes([header[6], header[7]]) as u64;

            if size == 0 || self.tail + size > self.head {
                self.tail = self.head;
                return None;
            }
            let start = self.tail;
            self.tail += size;

            if kind != system::PERF_RECORD_SAMPLE || size as usize != shape.record_size() {
                continue;
            }

            let body = start + RECORD_HEADER_SIZE as u64;
            return Some(match shape {
                RecordShape::Address => Sample {
                    address: u64::from_ne_bytes(ring_read(data, body)) as Address,
                    time: None,
                },
                RecordShape::AddressTime => Sample {
                    time: Some(u64::from_ne_bytes(ring_read(data, body))),
                    address: u64::from_ne_bytes(ring_read(data, body + 8)) as Address,
                },
            });
        }
        None
    }
}

// ── PerfStream ────────────────────────────────────────────────────────

struct RingMapping {
    base: NonNull<u8>,
    page_size: usize,
    data_size: usize,
}

impl RingMapping {
    #[inline]
    fn control(&self, offset: usize) -> &AtomicU64 {
        // SAFETY: offset lies inside the first (control) page and is 8-byte aligned
        unsafe { &*(self.base.as_ptr().add(offset) as *const AtomicU64) }
    }

    #[inline]
    fn data(&self) -> &[u8] {
        // SAFETY: the data area follows the control page and is data_size bytes
        unsafe {
            std::slice::from_raw_parts(self.base.as_ptr().add(self.page_size), self.data_size)
        }
    }

    #[inline]
    fn len(&self) -> usize {
        self.page_size + self.data_size
    }
}

/// One kernel perf counter with its mapped sample ring.
pub struct PerfStream {
    attr: system::PerfEventAttr,
    shape: RecordShape,
    ring_pages_log2: u32,
    fd: Option<OwnedFd>,
    ring: Option<RingMapping>,
    cursor: Option<RingCursor>,
    enabled: bool,
    nesting: DisableNesting,
    ok: bool,
}

// SAFETY: the ring mapping is owned by the stream and only touched through
// &mut self or by the kernel
unsafe impl Send for PerfStream {}

impl PerfStream {
    pub fn new(event: u64, period: u64, ring_pages_log2: u32, timed: bool) -> Self {
        Self {
            attr: system::PerfEventAttr::raw_sampling(event, period, timed),
            shape: RecordShape::from_timed(timed),
            ring_pages_log2,
            fd: None,
            ring: None,
            cursor: None,
            enabled: false,
            nesting: DisableNesting::default(),
            ok: true,
        }
    }

    fn unavailable(&mut self, source: std::io::Error) -> Error {
        self.ok = false;
        Error::PerfUnavailable {
            event: self.attr.config,
            source,
        }
    }

    fn commit_tail(&mut self) {
        if let (Some(ring), Some(cursor)) = (&self.ring, self.cursor.take()) {
            ring.control(system::DATA_TAIL_OFFSET)
                .store(cursor.tail, Ordering::Release);
        }
    }
}

impl SampleStream for PerfStream {
    fn event(&self) -> u64 {
        self.attr.config
    }

    fn shape(&self) -> RecordShape {
        self.shape
    }

    fn is_ok(&self) -> bool {
        self.ok
    }

    fn open(&mut self, enable: bool) -> Result<()> {
        let fd = system::perf_event_open(&self.attr).map_err(|e| self.unavailable(e))?;

        let page_size = system::page_size();
        let data_size = (1usize << self.ring_pages_log2) * page_size;
        let base = system::map_shared(fd.as_raw_fd(), page_size + data_size)
            .map_err(|e| self.unavailable(e))?;

        self.fd = Some(fd);
        self.ring = Some(RingMapping {
            base,
            page_size,
            data_size,
        });
        self.ok = true;
        debug!("opened perf event {:#x}", self.attr.config);

        if enable && !self.enable() {
            return Err(self.unavailable(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    fn close(&mut self) {
        if self.enabled {
            self.disable();
        }
        if let Some(ring) = self.ring.take() {
            system::unmap_memory(ring.base, ring.len());
        }
        self.fd = None;
        self.cursor = None;
        self.ok = false;
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn enable(&mut self) -> bool {
        let Some(fd) = &self.fd else { return true };
        if system::perf_enable(fd.as_raw_fd(), true).is_err() {
            return false;
        }
        self.enabled = true;
        true
    }

    fn disable(&mut self) -> bool {
        let Some(fd) = &self.fd else { return true };
        if system::perf_enable(fd.as_raw_fd(), false).is_err() {
            return false;
        }
        self.enabled = false;
        true
    }

    fn nesting_mut(&mut self) -> &mut DisableNesting {
        &mut self.nesting
    }

    fn start_iterate(&mut self) -> bool {
        let Some(ring) = &self.ring else { return false };
        let head = ring.control(system::DATA_HEAD_OFFSET).load(Ordering::Acquire);
        let tail = ring.control(system::DATA_TAIL_OFFSET).load(Ordering::Relaxed);
        self.cursor = Some(RingCursor::new(tail, head));
        true
    }

    fn next_sample(&mut self) -> Option<Sample> {
        let shape = self.shape;
        let sample = match (&self.ring, &mut self.cursor) {
            (Some(ring), Some(cursor)) => cursor.next_record(ring.data(), shape),
            _ => return None,
        };
        if sample.is_none() {
            self.commit_tail();
        }
        sample
    }

    fn abort_iterate(&mut self) {
        if let Some(cursor) = &mut self.cursor {
            cursor.tail = cursor.head;
        }
        self.commit_tail();
    }
}

impl Drop for PerfStream {
    fn drop(&mut self) {
        self.close();
    }
}

// ── ReplayStream ──────────────────────────────────────────────────────

/// A stream fed by [`ReplayStream::record`] instead of hardware.
#[derive(Debug)]
pub struct ReplayStream {
    event: u64,
    shape: RecordShape,
    pending: VecDeque<Sample>,
    snapshot: Option<usize>,
    open: bool,
    enabled: bool,
    nesting: DisableNesting,
}

impl ReplayStream {
    pub fn new(event: u64, timed: bool) -> Self {
        Self {
            event,
            shape: RecordShape::from_timed(timed),
            pending: VecDeque::new(),
            snapshot: None,
            open: false,
            enabled: false,
            nesting: DisableNesting::default(),
        }
    }

    /// Records a sample if the stream is counting. Returns whether it was kept.
    pub fn record(&mut self, address: Address, time: u64) -> bool {
        if !self.open || !self.enabled {
            return false;
        }
        let time = match self.shape {
            RecordShape::Address => None,
            RecordShape::AddressTime => Some(time),
        };
        self.pending.push_back(Sample { address, time });
        true
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

impl SampleStream for ReplayStream {
    fn event(&self) -> u64 {
        self.event
    }

    fn shape(&self) -> RecordShape {
        self.shape
    }

    fn is_ok(&self) -> bool {
        self.open
    }

    fn open(&mut self, enable: bool) -> Result<()> {
        self.open = true;
        self.enabled = enable;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
        self.enabled = false;
        self.pending.clear();
        self.snapshot = None;
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn enable(&mut self) -> bool {
        self.enabled = self.open;
        self.open
    }

    fn disable(&mut self) -> bool {
        self.enabled = false;
        true
    }

    fn nesting_mut(&mut self) -> &mut DisableNesting {
        &mut self.nesting
    }

    fn start_iterate(&mut self) -> bool {
        if !self.open {
            return false;
        }
        self.snapshot = Some(self.pending.len());
        true
    }

    fn next_sample(&mut self) -> Option<Sample> {
        let remaining = self.snapshot.as_mut()?;
        if *remaining == 0 {
            self.snapshot = None;
            return None;
        }
        *remaining -= 1;
        self.pending.pop_front()
    }

    fn abort_iterate(&mut self) {
        if let Some(remaining) = self.snapshot.take() {
            self.pending.drain(..remaining);
        }
    }
}

// ── ThreadSampler ─────────────────────────────────────────────────────

/// All streams of one thread, drained as a single sequence.
#[derive(Debug, Default)]
pub struct ThreadSampler<S> {
    streams: Vec<S>,
    iterate_id: usize,
}

impl<S: SampleStream> ThreadSampler<S> {
    pub fn new(streams: Vec<S>) -> Self {
        Self {
            streams,
            iterate_id: 0,
        }
    }

    /// Opens every stream. Succeeds if at least one event is available.
    pub fn open(&mut self, enable: bool) -> Result<()> {
        let mut opened = 0;
        for stream in &mut self.streams {
            match stream.open(enable) {
                Ok(()) => opened += 1,
                Err(err) => warn!("{err}"),
            }
        }
        if opened == 0 {
            return Err(Error::NoSamplingEvents);
        }
        Ok(())
    }

    pub fn close(&mut self) {
        for stream in &mut self.streams {
            stream.close();
        }
    }

    pub fn is_ok(&self) -> bool {
        self.streams.iter().any(S::is_ok)
    }

    pub fn enable(&mut self) -> bool {
        self.live().fold(true, |ok, stream| stream.enable() && ok)
    }

    pub fn disable(&mut self) -> bool {
        self.live().fold(true, |ok, stream| stream.disable() && ok)
    }

    pub fn is_enabled(&self) -> bool {
        self.streams.iter().any(S::is_enabled)
    }

    pub fn store_disable(&mut self) {
        self.live().for_each(S::store_disable);
    }

    pub fn restore_disable(&mut self) {
        self.live().for_each(S::restore_disable);
    }

    pub fn start_iterate(&mut self) -> bool {
        self.iterate_id = 0;
        let mut any = false;
        for stream in self.live() {
            any |= stream.start_iterate();
        }
        any
    }

    pub fn next_sample(&mut self) -> Option<Sample> {
        while let Some(stream) = self.streams.get_mut(self.iterate_id) {
            if stream.is_ok() {
                if let Some(sample) = stream.next_sample() {
                    return Some(sample);
                }
            }
            self.iterate_id += 1;
        }
        None
    }

    pub fn abort_iterate(&mut self) {
        self.live().for_each(S::abort_iterate);
        self.iterate_id = self.streams.len();
    }

    pub fn streams(&self) -> &[S] {
        &self.streams
    }

    pub fn streams_mut(&mut self) -> &mut [S] {
        &mut self.streams
    }

    fn live(&mut self) -> impl Iterator<Item = &mut S> {
        self.streams.iter_mut().filter(|stream| stream.is_ok())
    }
}

impl ThreadSampler<PerfStream> {
    /// One hardware stream per event.
    pub fn perf(events: &[u64], period: u64, ring_pages_log2: u32, timed: bool) -> Self {
        Self::new(
            events
                .iter()
                .map(|&event| PerfStream::new(event, period, ring_pages_log2, timed))
                .collect(),
        )
    }
}

impl ThreadSampler<ReplayStream> {
    pub fn replay(events: &[u64], timed: bool) -> Self {
        Self::new(
            events
                .iter()
                .map(|&event| ReplayStream::new(event, timed))
                .collect(),
        )
    }

    /// Records `address` on the stream at `index`.
    pub fn record(&mut self, index: usize, address: Address, time: u64) -> bool {
        self.streams
            .get_mut(index)
            .is_some_and(|stream| stream.record(address, time))
    }
}
