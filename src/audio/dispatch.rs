use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::config::{AnalysisConfig, OverflowPolicy, SessionConfig};
use crate::error::{AnalysisError, Result, SessionError};

use super::bridge::SegmentHandoff;
use super::segment::Segment;
use super::spectrum::{SpectralAnalyzer, Spectrum};

/// How often idle workers wake up to check for cancellation
const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Outcome of one segment, tagged with its sequence number
#[derive(Debug, Clone)]
pub enum AnalysisEvent {
    Spectrum(Spectrum),
    Failed { sequence: u64, error: AnalysisError },
    /// Segment evicted or rejected by the overflow policy
    Dropped { sequence: u64 },
}

impl AnalysisEvent {
    pub fn sequence(&self) -> u64 {
        match self {
            AnalysisEvent::Spectrum(spectrum) => spectrum.sequence,
            AnalysisEvent::Failed { sequence, .. } | AnalysisEvent::Dropped { sequence } => *sequence,
        }
    }
}

/// Consumer of analysis results. `Dropped` events are published from the
/// decode thread, so `publish` should not block.
pub trait AnalysisSink: Send + Sync + 'static {
    fn publish(&self, event: AnalysisEvent);
}

impl AnalysisSink for Sender<AnalysisEvent> {
    fn publish(&self, event: AnalysisEvent) {
        let _ = self.send(event);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// Analyse everything already queued, then stop
    Drain,
    /// Abandon queued and in-flight work
    Cancel,
}

pub struct AnalysisPool {
    jobs: Mutex<Option<Sender<Segment>>>,
    backlog: Receiver<Segment>,
    policy: OverflowPolicy,
    cancel: Arc<AtomicBool>,
    sink: Arc<dyn AnalysisSink>,
    workers_alive: Mutex<Option<Receiver<()>>>,
    dropped: AtomicU64,
    _pool: rayon::ThreadPool,
}

impl AnalysisPool {
    pub fn new(analysis: &AnalysisConfig, session: &SessionConfig, sink: Arc<dyn AnalysisSink>) -> Result<Self> {
        let (jobs_tx, jobs_rx) = if session.queue_bound == 0 {
            unbounded()
        } else {
            bounded(session.queue_bound)
        };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(session.workers)
            .thread_name(|i| format!("pcmscope-analysis-{i}"))
            .build()
            .map_err(|e| SessionError::Io(std::io::Error::other(e.to_string())))?;

        let cancel = Arc::new(AtomicBool::new(false));
        let (alive_tx, alive_rx) = bounded::<()>(0);
        for _ in 0..session.workers {
            let jobs = jobs_rx.clone();
            let config = analysis.clone();
            let cancel = Arc::clone(&cancel);
            let sink = Arc::clone(&sink);
            let alive = alive_tx.clone();
            pool.spawn(move || worker_loop(jobs, config, cancel, sink, alive));
        }
        drop(alive_tx);

        log::debug!(
            "Analysis pool: {} workers, queue bound {}, overflow {:?}",
            session.workers,
            session.queue_bound,
            session.overflow
        );

        Ok(Self {
            jobs: Mutex::new(Some(jobs_tx)),
            backlog: jobs_rx,
            policy: session.overflow,
            cancel,
            sink,
            workers_alive: Mutex::new(Some(alive_rx)),
            dropped: AtomicU64::new(0),
            _pool: pool,
        })
    }

    /// Segments dropped by the overflow policy so far
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Segments waiting for a worker
    #[cfg(test)]
    pub fn queued(&self) -> usize {
        self.backlog.len()
    }

    /// Stop accepting segments and wait for every worker to exit. Nothing is
    /// published once this returns.
    pub fn shutdown(&self, mode: Shutdown) {
        if mode == Shutdown::Cancel {
            self.cancel.store(true, Ordering::SeqCst);
        }
        self.jobs.lock().unwrap_or_else(|e| e.into_inner()).take();

        let alive = self.workers_alive.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(alive) = alive {
            // Errors out once the last worker drops its sender
            let _ = alive.recv();
            let abandoned = self.backlog.try_iter().count();
            if abandoned > 0 {
                log::debug!("Discarded {} queued segments on shutdown", abandoned);
            }
            log::debug!("Analysis pool stopped ({:?})", mode);
        }
        self.cancel.store(true, Ordering::SeqCst);
    }

    fn report_dropped(&self, sequence: u64, reason: &str) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        log::warn!("Analysis queue full: {} segment {}", reason, sequence);
        self.sink.publish(AnalysisEvent::Dropped { sequence });
    }
}

impl SegmentHandoff for AnalysisPool {
    fn hand_off(&self, segment: Segment) {
        if self.cancel.load(Ordering::SeqCst) {
            return;
        }
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = jobs.as_ref() else {
            log::debug!("Segment {} arrived after shutdown", segment.sequence());
            return;
        };

        let mut segment = segment;
        loop {
            match tx.try_send(segment) {
                Ok(()) => return,
                Err(TrySendError::Disconnected(_)) => return,
                Err(TrySendError::Full(rejected)) => match self.policy {
                    OverflowPolicy::Reject => {
                        self.report_dropped(rejected.sequence(), "rejected");
                        return;
                    }
                    OverflowPolicy::DropOldest => {
                        if let Ok(oldest) = self.backlog.try_recv() {
                            self.report_dropped(oldest.sequence(), "evicted");
                        }
                        segment = rejected;
                    }
                },
            }
        }
    }
}

impl Drop for AnalysisPool {
    fn drop(&mut self) {
        self.shutdown(Shutdown::Cancel);
    }
}

fn worker_loop(
    jobs: Receiver<Segment>,
    config: AnalysisConfig,
    cancel: Arc<AtomicBool>,
    sink: Arc<dyn AnalysisSink>,
    _alive: Sender<()>,
) {
    let mut analyzer = SpectralAnalyzer::new(config.clone());
    loop {
        if cancel.load(Ordering::SeqCst) {
            break;
        }
        let segment = match jobs.recv_timeout(WORKER_POLL_INTERVAL) {
            Ok(segment) => segment,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        let sequence = segment.sequence();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| analyzer.analyze(&segment, &cancel)));
        let event = match outcome {
            Ok(Ok(spectrum)) => AnalysisEvent::Spectrum(spectrum),
            Ok(Err(AnalysisError::Cancelled)) => {
                log::debug!("Analysis of segment {} abandoned", sequence);
                break;
            }
            Ok(Err(error)) => {
                log::warn!("Analysis of segment {} failed: {}", sequence, error);
                AnalysisEvent::Failed { sequence, error }
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                log::warn!("Analysis of segment {} panicked: {}", sequence, message);
                analyzer = SpectralAnalyzer::new(config.clone());
                AnalysisEvent::Failed {
                    sequence,
                    error: AnalysisError::Panicked(message),
                }
            }
        };

        if cancel.load(Ordering::SeqCst) {
            break;
        }
        sink.publish(event);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::segment::PcmFormat;
    use std::time::Instant;

    fn mono16(rate: u32) -> PcmFormat {
        PcmFormat {
            sample_rate: rate,
            channels: 1,
            bits_per_sample: 16,
        }
    }

    fn silent_segment(sequence: u64) -> Segment {
        Segment::from_parts(sequence, mono16(8000), vec![0; 16_000])
    }

    fn small_config() -> AnalysisConfig {
        AnalysisConfig {
            sampling_frequency: 8000,
            fft_size: 2000,
            ..AnalysisConfig::default()
        }
    }

    /// Sink that parks workers on spectrum results until released
    struct GatedSink {
        gate: Receiver<()>,
        events: Sender<AnalysisEvent>,
    }

    impl AnalysisSink for GatedSink {
        fn publish(&self, event: AnalysisEvent) {
            if matches!(event, AnalysisEvent::Spectrum(_)) {
                let _ = self.gate.recv();
            }
            let _ = self.events.send(event);
        }
    }

    #[test]
    fn drained_pool_analyses_every_segment() {
        let (tx, rx) = unbounded();
        let session = SessionConfig {
            workers: 2,
            queue_bound: 0,
            ..SessionConfig::default()
        };
        let pool = AnalysisPool::new(&small_config(), &session, Arc::new(tx)).unwrap();
        for seq in 0..5 {
            pool.hand_off(silent_segment(seq));
        }
        pool.shutdown(Shutdown::Drain);

        let mut seqs: Vec<u64> = rx.try_iter().map(|e| e.sequence()).collect();
        seqs.sort_unstable();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn handoff_latency_independent_of_analysis() {
        let (gate_tx, gate_rx) = unbounded();
        let (events_tx, events_rx) = unbounded();
        let sink = Arc::new(GatedSink {
            gate: gate_rx,
            events: events_tx,
        });
        let session = SessionConfig {
            workers: 1,
            queue_bound: 2,
            overflow: OverflowPolicy::DropOldest,
            ..SessionConfig::default()
        };
        let pool = AnalysisPool::new(&small_config(), &session, sink).unwrap();

        let started = Instant::now();
        for seq in 0..20 {
            pool.hand_off(silent_segment(seq));
        }
        let elapsed = started.elapsed();
        assert!(elapsed < Duration::from_secs(1), "handoff blocked for {:?}", elapsed);
        assert!(pool.dropped() > 0);

        drop(gate_tx);
        pool.shutdown(Shutdown::Cancel);
        let dropped = events_rx
            .try_iter()
            .filter(|e| matches!(e, AnalysisEvent::Dropped { .. }))
            .count() as u64;
        assert_eq!(dropped, pool.dropped());
    }

    #[test]
    fn drop_oldest_keeps_newest_segments() {
        let (gate_tx, gate_rx) = unbounded();
        let (events_tx, events_rx) = unbounded();
        let session = SessionConfig {
            workers: 1,
            queue_bound: 2,
            overflow: OverflowPolicy::DropOldest,
            ..SessionConfig::default()
        };
        let pool = AnalysisPool::new(
            &small_config(),
            &session,
            Arc::new(GatedSink {
                gate: gate_rx,
                events: events_tx,
            }),
        )
        .unwrap();

        // Segment 0 occupies the worker, which then blocks in the sink
        pool.hand_off(silent_segment(0));
        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.queued() > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        for seq in 1..=4 {
            pool.hand_off(silent_segment(seq));
        }
        let dropped: Vec<u64> = events_rx.try_iter().map(|e| e.sequence()).collect();
        assert_eq!(dropped, vec![1, 2]);

        for _ in 0..3 {
            gate_tx.send(()).unwrap();
        }
        pool.shutdown(Shutdown::Drain);
        let analysed: Vec<u64> = events_rx.try_iter().map(|e| e.sequence()).collect();
        assert_eq!(analysed, vec![0, 3, 4]);
    }

    #[test]
    fn reject_drops_newest_segment() {
        let (gate_tx, gate_rx) = unbounded();
        let (events_tx, events_rx) = unbounded();
        let session = SessionConfig {
            workers: 1,
            queue_bound: 1,
            overflow: OverflowPolicy::Reject,
            ..SessionConfig::default()
        };
        let pool = AnalysisPool::new(
            &small_config(),
            &session,
            Arc::new(GatedSink {
                gate: gate_rx,
                events: events_tx,
            }),
        )
        .unwrap();

        pool.hand_off(silent_segment(0));
        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.queued() > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        pool.hand_off(silent_segment(1));
        pool.hand_off(silent_segment(2));
        let dropped: Vec<u64> = events_rx.try_iter().map(|e| e.sequence()).collect();
        assert_eq!(dropped, vec![2]);
        drop(gate_tx);
        pool.shutdown(Shutdown::Cancel);
    }

    #[test]
    fn nothing_published_after_cancel() {
        let (tx, rx) = unbounded();
        let session = SessionConfig {
            workers: 2,
            queue_bound: 0,
            ..SessionConfig::default()
        };
        let pool = AnalysisPool::new(&AnalysisConfig::default(), &session, Arc::new(tx)).unwrap();
        for seq in 0..10 {
            pool.hand_off(Segment::from_parts(seq, mono16(44100), vec![0; 88_200]));
        }
        pool.shutdown(Shutdown::Cancel);
        let published = rx.try_iter().count();

        // Anything handed off after teardown is ignored
        pool.hand_off(silent_segment(99));
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(rx.try_iter().count(), 0);
        assert!(published <= 10);
    }

    #[test]
    fn failed_analysis_is_reported_and_pool_continues() {
        let (tx, rx) = unbounded();
        let session = SessionConfig {
            workers: 1,
            queue_bound: 0,
            ..SessionConfig::default()
        };
        let pool = AnalysisPool::new(&small_config(), &session, Arc::new(tx)).unwrap();
        let odd = PcmFormat {
            sample_rate: 8000,
            channels: 1,
            bits_per_sample: 12,
        };
        pool.hand_off(Segment::from_parts(0, odd, vec![0; 16_000]));
        pool.hand_off(silent_segment(1));
        pool.shutdown(Shutdown::Drain);

        let events: Vec<AnalysisEvent> = rx.try_iter().collect();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[0],
            AnalysisEvent::Failed {
                sequence: 0,
                error: AnalysisError::UnsupportedBitDepth(12)
            }
        ));
        assert!(matches!(&events[1], AnalysisEvent::Spectrum(s) if s.sequence == 1));
    }
}
