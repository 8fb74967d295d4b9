use serde::Serialize;

use super::spectrum::Spectrum;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FrequencyBand {
    SubBass,    // <= 60 Hz
    Bass,       // <= 250 Hz
    LowMids,    // <= 2 kHz
    HighMids,   // <= 4 kHz
    Presence,   // <= 6 kHz
    Brilliance, // <= 16 kHz
    OutOfRange,
}

impl FrequencyBand {
    /// Bands in ascending order, excluding `OutOfRange`
    pub const AUDIBLE: [FrequencyBand; 6] = [
        FrequencyBand::SubBass,
        FrequencyBand::Bass,
        FrequencyBand::LowMids,
        FrequencyBand::HighMids,
        FrequencyBand::Presence,
        FrequencyBand::Brilliance,
    ];

    pub fn classify(frequency_hz: f64) -> Self {
        if frequency_hz <= 60.0 {
            FrequencyBand::SubBass
        } else if frequency_hz <= 250.0 {
            FrequencyBand::Bass
        } else if frequency_hz <= 2000.0 {
            FrequencyBand::LowMids
        } else if frequency_hz <= 4000.0 {
            FrequencyBand::HighMids
        } else if frequency_hz <= 6000.0 {
            FrequencyBand::Presence
        } else if frequency_hz <= 16000.0 {
            FrequencyBand::Brilliance
        } else {
            FrequencyBand::OutOfRange
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            FrequencyBand::SubBass => "sub-bass",
            FrequencyBand::Bass => "bass",
            FrequencyBand::LowMids => "low-mids",
            FrequencyBand::HighMids => "high-mids",
            FrequencyBand::Presence => "presence",
            FrequencyBand::Brilliance => "brilliance",
            FrequencyBand::OutOfRange => "out-of-range",
        }
    }
}

/// Mean magnitude (dB) per audible band, over bins up to Nyquist
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BandDistribution {
    pub sub_bass: Option<f64>,
    pub bass: Option<f64>,
    pub low_mids: Option<f64>,
    pub high_mids: Option<f64>,
    pub presence: Option<f64>,
    pub brilliance: Option<f64>,
}

impl BandDistribution {
    pub fn from_spectrum(spectrum: &Spectrum) -> Self {
        let nyquist = spectrum.sample_rate as f64 / 2.0;
        let mut sums = [0.0f64; 6];
        let mut counts = [0usize; 6];
        for bin in spectrum.bins.iter().filter(|b| b.frequency_hz <= nyquist) {
            let band = FrequencyBand::classify(bin.frequency_hz);
            if let Some(idx) = FrequencyBand::AUDIBLE.iter().position(|b| *b == band) {
                sums[idx] += bin.magnitude_db;
                counts[idx] += 1;
            }
        }
        let mean = |i: usize| (counts[i] > 0).then(|| sums[i] / counts[i] as f64);
        Self {
            sub_bass: mean(0),
            bass: mean(1),
            low_mids: mean(2),
            high_mids: mean(3),
            presence: mean(4),
            brilliance: mean(5),
        }
    }

    pub fn get(&self, band: FrequencyBand) -> Option<f64> {
        match band {
            FrequencyBand::SubBass => self.sub_bass,
            FrequencyBand::Bass => self.bass,
            FrequencyBand::LowMids => self.low_mids,
            FrequencyBand::HighMids => self.high_mids,
            FrequencyBand::Presence => self.presence,
            FrequencyBand::Brilliance => self.brilliance,
            FrequencyBand::OutOfRange => None,
        }
    }

    /// Audible band with the highest mean level
    pub fn dominant(&self) -> Option<FrequencyBand> {
        FrequencyBand::AUDIBLE
            .iter()
            .filter_map(|&band| self.get(band).map(|level| (band, level)))
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(band, _)| band)
    }
}
