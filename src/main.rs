mod audio;
mod cli;
mod config;
mod error;
mod report;
mod session;

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::RecvTimeoutError;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use cli::Cli;
use config::Config;
use report::ReportWriter;
use session::Session;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();

    // Load config: explicit --config path, or auto-detect pcmscope.toml / global config
    let config_path = cli.config.clone().or_else(|| {
        let local = PathBuf::from("pcmscope.toml");
        if local.exists() {
            return Some(local);
        }
        if let Some(home) = dirs::home_dir() {
            let xdg = home.join(".config").join("pcmscope").join("config.toml");
            if xdg.exists() {
                return Some(xdg);
            }
        }
        if let Some(config_dir) = dirs::config_dir() {
            let platform = config_dir.join("pcmscope").join("config.toml");
            if platform.exists() {
                return Some(platform);
            }
        }
        None
    });
    let mut config = Config::default();
    if let Some(ref path) = config_path {
        if let Some(cfg) = config::load_config(path) {
            log::info!("Loaded config from {}", path.display());
            config = cfg;
        } else {
            log::warn!("Failed to load config from {}", path.display());
        }
    }
    cli.apply_to(&mut config);

    if !cli.input.exists() {
        anyhow::bail!("Input file not found: {}", cli.input.display());
    }
    let input = cli
        .input
        .to_str()
        .context("Input path contains invalid UTF-8")?;

    log::info!("pcmscope - streaming spectral analysis");
    log::info!("Input: {}", cli.input.display());
    log::info!(
        "FFT: {} points, {} ms Hamming window, floor {} dB",
        config.analysis.fft_size,
        config.analysis.window_ms,
        config.analysis.db_floor
    );
    log::info!(
        "Workers: {}, queue bound: {}, overflow: {:?}",
        config.session.workers,
        config.session.queue_bound,
        config.session.overflow
    );

    let (events_tx, events_rx) = crossbeam_channel::unbounded();
    let session = Session::create(input, config.session.chunk_size, &config, Arc::new(events_tx))
        .with_context(|| format!("Failed to start session for {}", cli.input.display()))?;
    log::info!("Decoding in chunks of {} frames", session.chunk_size());

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("[{elapsed_precise}] {spinner} {msg}")
            .unwrap(),
    );
    pb.enable_steady_tick(Duration::from_millis(120));

    let mut writer = ReportWriter::new(cli.json, cli.full);
    let emit = |pb: &ProgressBar, lines: Vec<String>| {
        if !lines.is_empty() {
            pb.suspend(|| lines.iter().for_each(|line| println!("{line}")));
        }
    };

    loop {
        match events_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(event) => {
                let lines = writer.push(event);
                emit(&pb, lines);
                pb.set_message(format!("{} segments analysed", writer.analysed()));
            }
            Err(RecvTimeoutError::Timeout) => {
                if !session.is_decoding() {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let summary = session.finish().context("Decoding failed")?;
    for event in events_rx.try_iter() {
        let lines = writer.push(event);
        emit(&pb, lines);
    }
    let lines = writer.flush();
    emit(&pb, lines);

    pb.finish_with_message(format!("{} segments analysed", writer.analysed()));
    log::info!(
        "Done: {} segments, {} analysed, {} dropped",
        summary.segments,
        writer.analysed(),
        summary.dropped
    );
    Ok(())
}
