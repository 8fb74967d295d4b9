use clap::Parser;
use std::path::PathBuf;

use crate::config::{Config, OverflowPolicy};

#[derive(Parser, Debug)]
#[command(name = "pcmscope", about = "Streaming one-second STFT analysis of decoded audio")]
pub struct Cli {
    /// Input audio file (WAV, MP3, FLAC, OGG, AAC)
    pub input: PathBuf,

    /// Config file (defaults to pcmscope.toml or the user config dir)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Maximum frames per decoder delivery
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Transform size in points
    #[arg(long)]
    pub fft_size: Option<usize>,

    /// Analysis window duration in milliseconds
    #[arg(long)]
    pub window_ms: Option<u32>,

    /// Analysis worker threads
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Pending segments before the overflow policy applies (0 = unbounded)
    #[arg(long)]
    pub queue_bound: Option<usize>,

    /// What to drop when the analysis queue is full
    #[arg(long, value_enum)]
    pub overflow: Option<OverflowPolicy>,

    /// Emit one JSON object per segment instead of a text summary
    #[arg(long)]
    pub json: bool,

    /// Include every bin in JSON output
    #[arg(long, requires = "json")]
    pub full: bool,
}

impl Cli {
    /// Apply flags that were given on the command line over `config`
    pub fn apply_to(&self, config: &mut Config) {
        if let Some(v) = self.chunk_size { config.session.chunk_size = v; }
        if let Some(v) = self.fft_size { config.analysis.fft_size = v; }
        if let Some(v) = self.window_ms { config.analysis.window_ms = v; }
        if let Some(v) = self.workers { config.session.workers = v; }
        if let Some(v) = self.queue_bound { config.session.queue_bound = v; }
        if let Some(v) = self.overflow { config.session.overflow = v; }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config() {
        let cli = Cli::parse_from(["pcmscope", "song.mp3", "--fft-size", "2048", "--overflow", "reject"]);
        let mut config = Config::default();
        cli.apply_to(&mut config);
        assert_eq!(config.analysis.fft_size, 2048);
        assert_eq!(config.session.overflow, OverflowPolicy::Reject);
        assert_eq!(config.session.chunk_size, 1024);
    }

    #[test]
    fn full_requires_json() {
        assert!(Cli::try_parse_from(["pcmscope", "song.mp3", "--full"]).is_err());
    }
}
