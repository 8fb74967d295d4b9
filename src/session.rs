use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::audio::decode::{self, DecodeSummary};
use crate::audio::{AnalysisPool, AnalysisSink, PcmFormat, SessionBridge, Shutdown};
use crate::config::Config;
use crate::error::{Result, SessionError};

/// Totals reported when a session finishes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub segments: u64,
    pub dropped: u64,
    /// Bytes of an unfinished segment left over at end of stream
    pub discarded_bytes: usize,
    pub decode: Option<DecodeSummary>,
}

pub struct Session {
    bridge: Arc<SessionBridge<AnalysisPool>>,
    chunk_size: usize,
    stop: Arc<AtomicBool>,
    decoder: Option<JoinHandle<Result<DecodeSummary>>>,
    closed: bool,
}

impl Session {
    /// Session without a decoder. Drive it through `bridge()`.
    pub fn new(config: &Config, sink: Arc<dyn AnalysisSink>) -> Result<Self> {
        config.analysis.validate()?;
        config.session.validate()?;

        let initial = PcmFormat {
            sample_rate: config.analysis.sampling_frequency,
            channels: 1,
            bits_per_sample: config.analysis.bits_per_sample,
        };
        let pool = AnalysisPool::new(&config.analysis, &config.session, sink)?;
        let bridge = SessionBridge::new(initial, pool)?;
        log::debug!(
            "Session ready: {} Hz assumed, {} byte segments",
            initial.sample_rate,
            bridge.segment_capacity()
        );

        Ok(Self {
            bridge: Arc::new(bridge),
            chunk_size: config.session.chunk_size,
            stop: Arc::new(AtomicBool::new(false)),
            decoder: None,
            closed: false,
        })
    }

    /// Open `source` and start decoding it in chunks of `chunk_size` frames
    pub fn create(source: &str, chunk_size: usize, config: &Config, sink: Arc<dyn AnalysisSink>) -> Result<Self> {
        if chunk_size == 0 {
            return Err(SessionError::InvalidConfig("chunk_size must be non-zero".into()));
        }
        let decoder_source = decode::open_source(source)?;
        log::info!("Opened source: {}", source);
        for (key, value) in decoder_source.tags() {
            log::info!("  {}: {}", key, value);
        }

        let mut session = Self::new(config, sink)?;
        session.chunk_size = chunk_size;
        let handle = decode::spawn_decoder(
            decoder_source,
            Arc::clone(&session.bridge),
            chunk_size,
            Arc::clone(&session.stop),
        )?;
        session.decoder = Some(handle);
        Ok(session)
    }

    /// Decoder-facing entry points
    #[cfg(test)]
    pub fn bridge(&self) -> &Arc<SessionBridge<AnalysisPool>> {
        &self.bridge
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn is_decoding(&self) -> bool {
        self.decoder.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Wait for the decoder to reach end of stream, analyse every queued
    /// segment, then shut down.
    pub fn finish(mut self) -> Result<SessionSummary> {
        let decode = self.join_decoder();
        let discarded_bytes = self.bridge.pending_bytes();
        if discarded_bytes > 0 {
            log::debug!("Discarding {} bytes of partial segment at end of stream", discarded_bytes);
        }
        self.bridge.handoff().shutdown(Shutdown::Drain);
        self.closed = true;

        let summary = SessionSummary {
            segments: self.bridge.segments_completed(),
            dropped: self.bridge.handoff().dropped(),
            discarded_bytes,
            decode: decode?,
        };
        log::info!(
            "Session finished: {} segments, {} dropped",
            summary.segments,
            summary.dropped
        );
        Ok(summary)
    }

    /// Stop decoding and abandon in-flight analysis. No result is published
    /// once this returns.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.stop.store(true, Ordering::SeqCst);
        if let Err(e) = self.join_decoder() {
            log::warn!("Decoder ended with error: {}", e);
        }
        self.bridge.handoff().shutdown(Shutdown::Cancel);
        self.closed = true;
        log::info!("Session closed after {} segments", self.bridge.segments_completed());
    }

    fn join_decoder(&mut self) -> Result<Option<DecodeSummary>> {
        match self.decoder.take() {
            Some(handle) => {
                let result = handle.join().map_err(|_| SessionError::DecoderPanicked)?;
                result.map(Some)
            }
            None => Ok(None),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}
