use serde::Deserialize;
use std::path::Path;

use crate::error::{Result, SessionError};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

/// Spectral analysis tunables
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AnalysisConfig {
    /// Sample rate assumed until the decoder reports the real one
    #[serde(default = "default_sampling_frequency")]
    pub sampling_frequency: u32,
    /// Bit depth assumed until the decoder reports the real one
    #[serde(default = "default_bits_per_sample")]
    pub bits_per_sample: u16,
    /// Transform size (`numSamplesPerFFT`), independent of segment length
    #[serde(default = "default_fft_size")]
    pub fft_size: usize,
    /// Analysis window duration in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u32,
    #[serde(default = "default_hamming_alpha")]
    pub hamming_alpha: f64,
    #[serde(default = "default_hamming_beta")]
    pub hamming_beta: f64,
    /// Decibel value reported for silent or degenerate bins
    #[serde(default = "default_db_floor")]
    pub db_floor: f64,
}

/// What to do with a completed segment when the analysis queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued segment to make room
    DropOldest,
    /// Drop the segment that just completed
    Reject,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SessionConfig {
    /// Maximum frames per decoder delivery
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Pending segments allowed in the analysis queue (0 = unbounded)
    #[serde(default = "default_queue_bound")]
    pub queue_bound: usize,
    #[serde(default = "default_overflow")]
    pub overflow: OverflowPolicy,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            sampling_frequency: default_sampling_frequency(),
            bits_per_sample: default_bits_per_sample(),
            fft_size: default_fft_size(),
            window_ms: default_window_ms(),
            hamming_alpha: default_hamming_alpha(),
            hamming_beta: default_hamming_beta(),
            db_floor: default_db_floor(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            workers: default_workers(),
            queue_bound: default_queue_bound(),
            overflow: default_overflow(),
        }
    }
}

impl AnalysisConfig {
    /// Samples per analysis window at the given rate
    pub fn window_sample_size(&self, sample_rate: u32) -> usize {
        (self.window_ms as u64 * sample_rate as u64 / 1000) as usize
    }

    pub fn validate(&self) -> Result<()> {
        if self.fft_size == 0 {
            return Err(SessionError::InvalidConfig("fft_size must be non-zero".into()));
        }
        if self.sampling_frequency == 0 {
            return Err(SessionError::InvalidConfig(
                "sampling_frequency must be non-zero".into(),
            ));
        }
        if self.window_sample_size(self.sampling_frequency) < 2 {
            return Err(SessionError::InvalidConfig(format!(
                "window of {} ms is shorter than 2 samples at {} Hz",
                self.window_ms, self.sampling_frequency
            )));
        }
        if !self.db_floor.is_finite() {
            return Err(SessionError::InvalidConfig("db_floor must be finite".into()));
        }
        Ok(())
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(SessionError::InvalidConfig("chunk_size must be non-zero".into()));
        }
        if self.workers == 0 {
            return Err(SessionError::InvalidConfig("workers must be non-zero".into()));
        }
        Ok(())
    }
}

fn default_sampling_frequency() -> u32 { 44100 }
fn default_bits_per_sample() -> u16 { 16 }
fn default_fft_size() -> usize { 11025 }
fn default_window_ms() -> u32 { 5 }
fn default_hamming_alpha() -> f64 { 0.54 }
fn default_hamming_beta() -> f64 { 0.46 }
fn default_db_floor() -> f64 { -120.0 }
fn default_chunk_size() -> usize { 1024 }
fn default_workers() -> usize { 2 }
fn default_queue_bound() -> usize { 8 }
fn default_overflow() -> OverflowPolicy { OverflowPolicy::DropOldest }

pub fn load_config(path: &Path) -> Option<Config> {
    let content = std::fs::read_to_string(path).ok()?;
    toml::from_str(&content).ok()
}
