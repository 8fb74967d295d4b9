use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard};

use crate::error::{Result, SessionError};

use super::segment::{AccumulatorState, PcmFormat, ScratchBuffer, Segment, SegmentAccumulator};

/// Metadata accompanying one delivered chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmDelivery {
    pub channels: u16,
    pub sample_rate: u32,
    /// Frames in the chunk as reported by the decoder
    pub sample_count: u32,
    pub bits_per_sample: u16,
    /// Bytes actually written into the prepared buffer
    pub byte_size: usize,
    /// Presentation timestamp in the source's timebase ticks
    pub pts: i64,
}

impl PcmDelivery {
    pub fn format(&self) -> PcmFormat {
        PcmFormat {
            sample_rate: self.sample_rate,
            channels: self.channels,
            bits_per_sample: self.bits_per_sample,
        }
    }
}

/// The two entry points a PCM-producing decoder calls
pub trait DecodeBridge: Send + Sync {
    /// Lock the session and return a destination of at least `requested_size` bytes
    fn on_prepare(&self, requested_size: usize) -> Result<PcmBuffer<'_>>;

    /// Consume the filled buffer, releasing the lock before returning
    fn on_deliver(&self, buffer: PcmBuffer<'_>, delivery: PcmDelivery) -> Result<()>;
}

/// Receives segments as they complete. Called with the session lock held, so
/// implementations must not block.
pub trait SegmentHandoff: Send + Sync {
    fn hand_off(&self, segment: Segment);
}

#[cfg(test)]
impl SegmentHandoff for crossbeam_channel::Sender<Segment> {
    fn hand_off(&self, segment: Segment) {
        self.send(segment).unwrap();
    }
}

struct BridgeState {
    scratch: ScratchBuffer,
    accumulator: SegmentAccumulator,
    deliveries: u64,
}

/// Writable destination for one decoder chunk. Holds the session lock.
pub struct PcmBuffer<'a> {
    guard: MutexGuard<'a, BridgeState>,
    len: usize,
}

impl Deref for PcmBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard.scratch.as_slice()[..self.len]
    }
}

impl DerefMut for PcmBuffer<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut self.guard.scratch.as_mut_slice()[..len]
    }
}

/// Bridge owning the session's accumulator and scratch buffer
pub struct SessionBridge<H> {
    state: Mutex<BridgeState>,
    handoff: H,
}

impl<H: SegmentHandoff> SessionBridge<H> {
    /// Bridge whose segments start in `initial` format, until the decoder
    /// reports otherwise
    pub fn new(initial: PcmFormat, handoff: H) -> Result<Self> {
        initial.validate()?;
        Ok(Self {
            state: Mutex::new(BridgeState {
                scratch: ScratchBuffer::new(),
                accumulator: SegmentAccumulator::new(initial)?,
                deliveries: 0,
            }),
            handoff,
        })
    }

    pub fn handoff(&self) -> &H {
        &self.handoff
    }

    #[cfg(test)]
    pub fn format(&self) -> PcmFormat {
        self.lock().accumulator.format()
    }

    pub fn write_offset(&self) -> usize {
        self.lock().accumulator.write_offset()
    }

    pub fn segment_capacity(&self) -> usize {
        self.lock().accumulator.capacity()
    }

    /// Segments handed off so far
    pub fn segments_completed(&self) -> u64 {
        self.lock().accumulator.next_sequence()
    }

    /// Bytes sitting in the unfinished segment, e.g. at end of stream
    pub fn pending_bytes(&self) -> usize {
        self.write_offset()
    }

    fn lock(&self) -> MutexGuard<'_, BridgeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<H: SegmentHandoff> DecodeBridge for SessionBridge<H> {
    fn on_prepare(&self, requested_size: usize) -> Result<PcmBuffer<'_>> {
        let mut guard = self.lock();
        if requested_size > guard.scratch.capacity() {
            log::trace!("Growing scratch buffer to {} bytes", requested_size);
        }
        guard.scratch.ensure_capacity(requested_size)?;
        Ok(PcmBuffer {
            guard,
            len: requested_size,
        })
    }

    fn on_deliver(&self, buffer: PcmBuffer<'_>, delivery: PcmDelivery) -> Result<()> {
        let PcmBuffer { mut guard, len } = buffer;
        if delivery.byte_size > len {
            return Err(SessionError::DeliveryOverrun {
                delivered: delivery.byte_size,
                prepared: len,
            });
        }

        let format = delivery.format();
        format.validate()?;
        let state = &mut *guard;
        state.deliveries += 1;

        let current = state.accumulator.format();
        if format != current {
            log::info!(
                "PCM format changed: {} Hz x{} {}-bit -> {} Hz x{} {}-bit",
                current.sample_rate,
                current.channels,
                current.bits_per_sample,
                format.sample_rate,
                format.channels,
                format.bits_per_sample
            );
            let was_filling = state.accumulator.state() == AccumulatorState::Filling;
            let discarded = state.accumulator.reformat(format)?;
            if was_filling {
                log::warn!("Discarded {} bytes of partial segment after format change", discarded);
            }
        }

        let expected = delivery.sample_count as usize * format.frame_size();
        if expected != delivery.byte_size {
            log::trace!(
                "Delivery reports {} frames but {} bytes (expected {})",
                delivery.sample_count,
                delivery.byte_size,
                expected
            );
        }

        let BridgeState {
            scratch,
            accumulator,
            deliveries,
        } = state;
        let deliveries = *deliveries;
        let bytes = &scratch.as_slice()[..delivery.byte_size];
        accumulator.write(bytes, Some(delivery.pts), |segment| {
            log::debug!(
                "Segment {} complete ({} bytes, {} deliveries so far)",
                segment.sequence(),
                segment.data().len(),
                deliveries
            );
            self.handoff.hand_off(segment);
        })?;
        Ok(())
    }
}
