use crate::error::{Result, SessionError};

/// Interleaved signed little-endian PCM layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl PcmFormat {
    pub fn bytes_per_sample(&self) -> usize {
        (self.bits_per_sample as usize).div_ceil(8)
    }

    /// Bytes per interleaved frame (one sample for every channel)
    pub fn frame_size(&self) -> usize {
        self.bytes_per_sample() * self.channels as usize
    }

    /// Bytes in one second of audio
    pub fn bytes_per_second(&self) -> usize {
        self.sample_rate as usize * self.frame_size()
    }

    pub fn validate(&self) -> Result<()> {
        if !matches!(self.bits_per_sample, 8 | 16 | 24 | 32) {
            return Err(SessionError::UnsupportedFormat(format!(
                "{} bits per sample",
                self.bits_per_sample
            )));
        }
        if self.channels == 0 || self.sample_rate == 0 {
            return Err(SessionError::UnsupportedFormat(format!(
                "{} channels at {} Hz",
                self.channels, self.sample_rate
            )));
        }
        Ok(())
    }
}

/// Reusable destination buffer that only ever grows
#[derive(Debug, Default)]
pub struct ScratchBuffer {
    data: Vec<u8>,
}

impl ScratchBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make at least `n` bytes addressable. Reallocates only when `n` exceeds
    /// the current capacity.
    pub fn ensure_capacity(&mut self, n: usize) -> Result<()> {
        if n > self.data.len() {
            let additional = n - self.data.len();
            self.data
                .try_reserve_exact(additional)
                .map_err(SessionError::out_of_memory("scratch buffer", n))?;
            self.data.resize(n, 0);
        }
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// A completed, immutable second of PCM
#[derive(Debug)]
pub struct Segment {
    sequence: u64,
    format: PcmFormat,
    start_pts: Option<i64>,
    data: Vec<u8>,
}

impl Segment {
    /// Handoff number, starting at 0 for the first segment of a session
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn format(&self) -> PcmFormat {
        self.format
    }

    /// Timestamp of the first chunk written into this segment
    pub fn start_pts(&self) -> Option<i64> {
        self.start_pts
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[cfg(test)]
    pub(crate) fn from_parts(sequence: u64, format: PcmFormat, data: Vec<u8>) -> Self {
        Self {
            sequence,
            format,
            start_pts: None,
            data,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulatorState {
    Empty,
    Filling,
}

/// Fills fixed-capacity segments from arbitrary-sized chunks
#[derive(Debug)]
pub struct SegmentAccumulator {
    format: PcmFormat,
    capacity: usize,
    current: Vec<u8>,
    start_pts: Option<i64>,
    next_sequence: u64,
}

impl SegmentAccumulator {
    /// Accumulator producing one-second segments in `format`
    pub fn new(format: PcmFormat) -> Result<Self> {
        Self::with_capacity(format, format.bytes_per_second())
    }

    pub fn with_capacity(format: PcmFormat, capacity: usize) -> Result<Self> {
        Ok(Self {
            format,
            capacity,
            current: allocate_segment(capacity)?,
            start_pts: None,
            next_sequence: 0,
        })
    }

    pub fn format(&self) -> PcmFormat {
        self.format
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn write_offset(&self) -> usize {
        self.current.len()
    }

    pub fn state(&self) -> AccumulatorState {
        if self.current.is_empty() {
            AccumulatorState::Empty
        } else {
            AccumulatorState::Filling
        }
    }

    /// Sequence number the next completed segment will carry
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Switch to a new format. Returns the number of bytes of partial data
    /// that had to be discarded.
    pub fn reformat(&mut self, format: PcmFormat) -> Result<usize> {
        let discarded = self.current.len();
        let capacity = format.bytes_per_second();
        if capacity != self.capacity {
            self.current = allocate_segment(capacity)?;
            self.capacity = capacity;
        } else {
            self.current.clear();
        }
        self.format = format;
        self.start_pts = None;
        Ok(discarded)
    }

    /// Copy `bytes` in, splitting across segment boundaries. Every segment that
    /// fills up is passed to `on_full` in order, and a fresh one takes its
    /// place before the next byte is written.
    pub fn write<F>(&mut self, mut bytes: &[u8], pts: Option<i64>, mut on_full: F) -> Result<usize>
    where
        F: FnMut(Segment),
    {
        let mut completed = 0;
        while !bytes.is_empty() {
            if self.current.is_empty() {
                self.start_pts = pts;
            }
            let room = self.capacity - self.current.len();
            let take = room.min(bytes.len());
            self.current.extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];

            if self.current.len() == self.capacity {
                let fresh = allocate_segment(self.capacity)?;
                let data = std::mem::replace(&mut self.current, fresh);
                let segment = Segment {
                    sequence: self.next_sequence,
                    format: self.format,
                    start_pts: self.start_pts.take(),
                    data,
                };
                self.next_sequence += 1;
                completed += 1;
                on_full(segment);
            }
        }
        Ok(completed)
    }
}

fn allocate_segment(capacity: usize) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    data.try_reserve_exact(capacity)
        .map_err(SessionError::out_of_memory("segment buffer", capacity))?;
    Ok(data)
}
