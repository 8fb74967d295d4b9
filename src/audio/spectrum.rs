use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use serde::Serialize;

use crate::config::AnalysisConfig;
use crate::error::AnalysisError;

use super::segment::{PcmFormat, Segment};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SpectrumBin {
    pub frequency_hz: f64,
    pub magnitude_db: f64,
}

/// Full spectrum of one segment
#[derive(Debug, Clone, Serialize)]
pub struct Spectrum {
    pub sequence: u64,
    pub sample_rate: u32,
    pub start_pts: Option<i64>,
    /// Bins that had zero or non-finite magnitude and were clamped to the floor
    pub degenerate_bins: usize,
    pub bins: Vec<SpectrumBin>,
}

impl Spectrum {
    /// Width of one bin in Hz
    pub fn bin_width(&self) -> f64 {
        self.sample_rate as f64 / self.bins.len() as f64
    }

    /// Loudest bin at or below Nyquist
    pub fn peak(&self) -> Option<SpectrumBin> {
        let nyquist = self.sample_rate as f64 / 2.0;
        self.bins
            .iter()
            .filter(|b| b.frequency_hz <= nyquist)
            .copied()
            .max_by(|a, b| a.magnitude_db.total_cmp(&b.magnitude_db))
    }
}

/// Per-worker analyzer. Caches the FFT plan and window coefficients, so each
/// worker thread owns one.
pub struct SpectralAnalyzer {
    config: AnalysisConfig,
    fft: Arc<dyn Fft<f64>>,
    windows: HashMap<usize, Vec<f64>>,
}

impl SpectralAnalyzer {
    pub fn new(config: AnalysisConfig) -> Self {
        let mut planner = FftPlanner::<f64>::new();
        let fft = planner.plan_fft_forward(config.fft_size);
        Self {
            config,
            fft,
            windows: HashMap::new(),
        }
    }

    /// Analyse one segment. Hamming windows at 50% overlap are written into
    /// `fft_size` points, each overwriting the tail of the one before.
    /// `cancel` is checked between windows; once it is set the partial work
    /// is thrown away.
    pub fn analyze(&mut self, segment: &Segment, cancel: &AtomicBool) -> Result<Spectrum, AnalysisError> {
        let format = segment.format();
        let fft_size = self.config.fft_size;
        let window_size = self.config.window_sample_size(format.sample_rate);
        if window_size < 2 {
            return Err(AnalysisError::WindowTooShort {
                window_ms: self.config.window_ms,
                sample_rate: format.sample_rate,
            });
        }
        let samples = first_channel(segment.data(), format, fft_size)?;

        let mut input: Vec<Complex<f64>> = Vec::new();
        input
            .try_reserve_exact(fft_size)
            .map_err(|_| AnalysisError::OutOfMemory(fft_size))?;
        input.resize(fft_size, Complex::new(0.0, 0.0));

        let coefficients = self.window(window_size);
        let stride = window_size / 2;
        let mut start = 0;
        while start < fft_size {
            if cancel.load(Ordering::Relaxed) {
                return Err(AnalysisError::Cancelled);
            }
            let end = (start + window_size).min(fft_size);
            for pos in start..end {
                let sample = samples.get(pos).copied().unwrap_or(0.0);
                input[pos].re = sample * coefficients[pos - start];
            }
            start += stride;
        }

        if cancel.load(Ordering::Relaxed) {
            return Err(AnalysisError::Cancelled);
        }
        self.fft.process(&mut input);

        let floor = self.config.db_floor;
        let sample_rate = format.sample_rate as f64;
        let mut degenerate_bins = 0;
        let bins: Vec<SpectrumBin> = input
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let db = 20.0 * c.norm().log10();
                let magnitude_db = if db.is_finite() && db >= floor {
                    db
                } else {
                    degenerate_bins += 1;
                    floor
                };
                SpectrumBin {
                    frequency_hz: i as f64 * sample_rate / fft_size as f64,
                    magnitude_db,
                }
            })
            .collect();

        Ok(Spectrum {
            sequence: segment.sequence(),
            sample_rate: format.sample_rate,
            start_pts: segment.start_pts(),
            degenerate_bins,
            bins,
        })
    }

    fn window(&mut self, size: usize) -> &[f64] {
        let alpha = self.config.hamming_alpha;
        let beta = self.config.hamming_beta;
        self.windows
            .entry(size)
            .or_insert_with(|| hamming_window(size, alpha, beta))
    }
}

fn hamming_window(size: usize, alpha: f64, beta: f64) -> Vec<f64> {
    (0..size)
        .map(|n| alpha - beta * (2.0 * std::f64::consts::PI * n as f64 / (size - 1) as f64).cos())
        .collect()
}

/// Decode up to `limit` samples of channel 0 as raw integer amplitudes
fn first_channel(data: &[u8], format: PcmFormat, limit: usize) -> Result<Vec<f64>, AnalysisError> {
    let width = format.bytes_per_sample();
    let stride = format.frame_size();
    if stride == 0 {
        return Ok(Vec::new());
    }
    let decode: fn(&[u8]) -> f64 = match format.bits_per_sample {
        8 => |b| b[0] as i8 as f64,
        16 => |b| i16::from_le_bytes([b[0], b[1]]) as f64,
        24 => |b| (i32::from_le_bytes([0, b[0], b[1], b[2]]) >> 8) as f64,
        32 => |b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64,
        other => return Err(AnalysisError::UnsupportedBitDepth(other)),
    };
    Ok(data
        .chunks_exact(stride)
        .take(limit)
        .map(|frame| decode(&frame[..width]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mono16(rate: u32) -> PcmFormat {
        PcmFormat {
            sample_rate: rate,
            channels: 1,
            bits_per_sample: 16,
        }
    }

    fn segment_from_samples(samples: &[i16], format: PcmFormat) -> Segment {
        let data = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        Segment::from_parts(0, format, data)
    }

    fn sine(freq: f64, rate: u32, len: usize, amplitude: f64) -> Vec<i16> {
        (0..len)
            .map(|i| {
                let t = i as f64 / rate as f64;
                (amplitude * (2.0 * std::f64::consts::PI * freq * t).sin()) as i16
            })
            .collect()
    }

    /// Input the transform should see: each window overwrites the tail of the
    /// one before, so position `n` keeps the coefficient of the last window
    /// starting at or before it.
    fn tiled_input(samples: &[f64], fft_size: usize, window: &[f64]) -> Vec<f64> {
        let stride = window.len() / 2;
        (0..fft_size)
            .map(|n| samples.get(n).copied().unwrap_or(0.0) * window[n % stride])
            .collect()
    }

    fn dft_magnitude(input: &[f64], k: usize) -> f64 {
        let n = input.len() as f64;
        let (re, im) = input.iter().enumerate().fold((0.0, 0.0), |(re, im), (i, x)| {
            let angle = -2.0 * std::f64::consts::PI * k as f64 * i as f64 / n;
            (re + x * angle.cos(), im + x * angle.sin())
        });
        (re * re + im * im).sqrt()
    }

    #[test]
    fn later_window_overwrites_overlap() {
        let rate = 8000;
        let config = AnalysisConfig {
            fft_size: 1000,
            ..AnalysisConfig::default()
        };
        let window_size = config.window_sample_size(rate);
        assert_eq!(window_size, 40);
        let samples = vec![1000i16; rate as usize];
        let segment = segment_from_samples(&samples, mono16(rate));

        let spectrum = SpectralAnalyzer::new(config)
            .analyze(&segment, &AtomicBool::new(false))
            .unwrap();

        let window = hamming_window(window_size, 0.54, 0.46);
        let flat = vec![1000.0; rate as usize];
        let dc: f64 = tiled_input(&flat, 1000, &window).iter().sum();
        let expected = 20.0 * dc.log10();
        assert!(
            (spectrum.bins[0].magnitude_db - expected).abs() < 1e-9,
            "DC bin {} dB, expected {} dB",
            spectrum.bins[0].magnitude_db,
            expected
        );
    }

    #[test]
    fn bins_match_direct_dft_of_tiled_input() {
        let rate = 8000;
        let fft_size = 1000;
        let config = AnalysisConfig {
            fft_size,
            ..AnalysisConfig::default()
        };
        let samples: Vec<i16> = (0..rate as usize)
            .map(|i| {
                let t = i as f64 / rate as f64;
                let tone = 6000.0 * (2.0 * std::f64::consts::PI * 440.0 * t).sin();
                let ramp = ((i * 37) % 2000) as f64 - 1000.0;
                (tone + ramp) as i16
            })
            .collect();
        let segment = segment_from_samples(&samples, mono16(rate));

        let spectrum = SpectralAnalyzer::new(config.clone())
            .analyze(&segment, &AtomicBool::new(false))
            .unwrap();

        let window = hamming_window(config.window_sample_size(rate), 0.54, 0.46);
        let decoded: Vec<f64> = samples.iter().map(|&s| s as f64).collect();
        let input = tiled_input(&decoded, fft_size, &window);
        for k in [0, 1, 7, 55, 123, 250, 499] {
            let expected = dft_magnitude(&input, k);
            let actual = 10f64.powf(spectrum.bins[k].magnitude_db / 20.0);
            assert!(
                (actual - expected).abs() <= 1e-6 * expected.max(1.0),
                "bin {}: {} vs {}",
                k,
                actual,
                expected
            );
        }
    }

    #[test]
    fn silent_second_is_all_floor() {
        let config = AnalysisConfig::default();
        let floor = config.db_floor;
        let segment = Segment::from_parts(0, mono16(44100), vec![0; 88_200]);
        let mut analyzer = SpectralAnalyzer::new(config);

        let spectrum = analyzer.analyze(&segment, &AtomicBool::new(false)).unwrap();

        assert_eq!(spectrum.bins.len(), 11025);
        assert_eq!(spectrum.degenerate_bins, 11025);
        assert!(spectrum
            .bins
            .iter()
            .all(|b| b.magnitude_db == floor && b.magnitude_db.is_finite()));
    }

    #[test]
    fn sine_peak_within_one_bin() {
        let rate = 44100;
        let mut analyzer = SpectralAnalyzer::new(AnalysisConfig::default());
        for freq in [440.0, 1000.0, 5000.0] {
            let segment = segment_from_samples(&sine(freq, rate, rate as usize, 12000.0), mono16(rate));
            let spectrum = analyzer.analyze(&segment, &AtomicBool::new(false)).unwrap();
            let peak = spectrum.peak().unwrap();
            assert!(
                (peak.frequency_hz - freq).abs() <= spectrum.bin_width(),
                "peak at {} Hz for a {} Hz sine",
                peak.frequency_hz,
                freq
            );
        }
    }

    #[test]
    fn bin_frequencies_follow_rate_and_size() {
        let config = AnalysisConfig {
            fft_size: 1000,
            ..AnalysisConfig::default()
        };
        let segment = segment_from_samples(&sine(100.0, 8000, 8000, 1000.0), mono16(8000));
        let spectrum = SpectralAnalyzer::new(config)
            .analyze(&segment, &AtomicBool::new(false))
            .unwrap();
        assert_eq!(spectrum.bins.len(), 1000);
        assert_eq!(spectrum.bins[0].frequency_hz, 0.0);
        assert!((spectrum.bins[1].frequency_hz - 8.0).abs() < 1e-9);
        assert!((spectrum.bins[999].frequency_hz - 7992.0).abs() < 1e-9);
    }

    #[test]
    fn short_segment_is_zero_padded() {
        let config = AnalysisConfig {
            fft_size: 4096,
            ..AnalysisConfig::default()
        };
        let segment = segment_from_samples(&sine(1000.0, 8000, 1000, 8000.0), mono16(8000));
        let spectrum = SpectralAnalyzer::new(config)
            .analyze(&segment, &AtomicBool::new(false))
            .unwrap();
        assert_eq!(spectrum.bins.len(), 4096);
        assert!(spectrum.bins.iter().all(|b| b.magnitude_db.is_finite()));
    }

    #[test]
    fn only_first_channel_is_inspected() {
        let rate = 8000;
        let config = AnalysisConfig {
            fft_size: 2000,
            ..AnalysisConfig::default()
        };
        // Left channel silent, right channel loud
        let loud = sine(1000.0, rate, rate as usize, 12000.0);
        let data = loud
            .iter()
            .flat_map(|s| [0i16, *s])
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let stereo = PcmFormat {
            sample_rate: rate,
            channels: 2,
            bits_per_sample: 16,
        };
        let spectrum = SpectralAnalyzer::new(config.clone())
            .analyze(&Segment::from_parts(0, stereo, data), &AtomicBool::new(false))
            .unwrap();
        assert!(spectrum.bins.iter().all(|b| b.magnitude_db == config.db_floor));
    }

    #[test]
    fn decodes_24_bit_sign_extension() {
        let format = PcmFormat {
            sample_rate: 8000,
            channels: 1,
            bits_per_sample: 24,
        };
        let data = vec![0xff, 0xff, 0xff, 0x00, 0x00, 0x40];
        let samples = first_channel(&data, format, 10).unwrap();
        assert_eq!(samples, vec![-1.0, 4_194_304.0]);
    }

    #[test]
    fn cancelled_analysis_returns_error() {
        let segment = Segment::from_parts(0, mono16(44100), vec![0; 88_200]);
        let result = SpectralAnalyzer::new(AnalysisConfig::default())
            .analyze(&segment, &AtomicBool::new(true));
        assert_eq!(result.unwrap_err(), AnalysisError::Cancelled);
    }

    #[test]
    fn low_rate_window_too_short_fails() {
        let config = AnalysisConfig {
            window_ms: 1,
            ..AnalysisConfig::default()
        };
        let segment = Segment::from_parts(3, mono16(1000), vec![0; 2000]);
        let result = SpectralAnalyzer::new(config).analyze(&segment, &AtomicBool::new(false));
        assert!(matches!(result, Err(AnalysisError::WindowTooShort { .. })));
    }

    #[test]
    fn hamming_endpoints_and_centre() {
        let w = hamming_window(221, 0.54, 0.46);
        assert!((w[0] - 0.08).abs() < 1e-12);
        assert!((w[220] - 0.08).abs() < 1e-12);
        assert!((w[110] - 1.0).abs() < 1e-12);
    }
}
