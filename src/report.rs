use std::collections::BTreeMap;

use serde::Serialize;

use crate::audio::{AnalysisEvent, BandDistribution, FrequencyBand, Spectrum, SpectrumBin};

#[derive(Debug, Serialize)]
struct SegmentReport<'a> {
    sequence: u64,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    start_pts: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bin_width_hz: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    peak: Option<SpectrumBin>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bands: Option<BandDistribution>,
    #[serde(skip_serializing_if = "Option::is_none")]
    degenerate_bins: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bins: Option<&'a [SpectrumBin]>,
}

pub struct ReportWriter {
    json: bool,
    full: bool,
    next: u64,
    pending: BTreeMap<u64, AnalysisEvent>,
    analysed: u64,
}

impl ReportWriter {
    pub fn new(json: bool, full: bool) -> Self {
        Self {
            json,
            full,
            next: 0,
            pending: BTreeMap::new(),
            analysed: 0,
        }
    }

    /// Segments successfully analysed so far
    pub fn analysed(&self) -> u64 {
        self.analysed
    }

    /// Buffer `event` and return every line that is now in order
    pub fn push(&mut self, event: AnalysisEvent) -> Vec<String> {
        if matches!(event, AnalysisEvent::Spectrum(_)) {
            self.analysed += 1;
        }
        self.pending.insert(event.sequence(), event);
        let mut lines = Vec::new();
        while let Some(event) = self.pending.remove(&self.next) {
            lines.push(self.render(&event));
            self.next += 1;
        }
        lines
    }

    /// Emit whatever is left, skipping gaps
    pub fn flush(&mut self) -> Vec<String> {
        let pending = std::mem::take(&mut self.pending);
        let lines = pending.values().map(|event| self.render(event)).collect();
        if let Some(last) = pending.keys().next_back() {
            self.next = last + 1;
        }
        lines
    }

    fn render(&self, event: &AnalysisEvent) -> String {
        if self.json {
            let report = self.report(event);
            serde_json::to_string(&report).unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"))
        } else {
            render_text(event)
        }
    }

    fn report<'a>(&self, event: &'a AnalysisEvent) -> SegmentReport<'a> {
        let mut report = SegmentReport {
            sequence: event.sequence(),
            status: "",
            start_pts: None,
            bin_width_hz: None,
            peak: None,
            bands: None,
            degenerate_bins: None,
            error: None,
            bins: None,
        };
        match event {
            AnalysisEvent::Spectrum(spectrum) => {
                report.status = "analysed";
                report.start_pts = spectrum.start_pts;
                report.bin_width_hz = Some(spectrum.bin_width());
                report.peak = spectrum.peak();
                report.bands = Some(BandDistribution::from_spectrum(spectrum));
                report.degenerate_bins = Some(spectrum.degenerate_bins);
                if self.full {
                    report.bins = Some(&spectrum.bins);
                }
            }
            AnalysisEvent::Failed { error, .. } => {
                report.status = "failed";
                report.error = Some(error.to_string());
            }
            AnalysisEvent::Dropped { .. } => report.status = "dropped",
        }
        report
    }
}

fn render_text(event: &AnalysisEvent) -> String {
    match event {
        AnalysisEvent::Spectrum(spectrum) => render_spectrum(spectrum),
        AnalysisEvent::Failed { sequence, error } => format!("segment {:>4}  analysis failed: {}", sequence, error),
        AnalysisEvent::Dropped { sequence } => format!("segment {:>4}  dropped (analysis queue full)", sequence),
    }
}

fn render_spectrum(spectrum: &Spectrum) -> String {
    let bands = BandDistribution::from_spectrum(spectrum);
    let mut line = format!("segment {:>4}", spectrum.sequence);
    match spectrum.peak() {
        Some(peak) => line.push_str(&format!(
            "  peak {:>8.1} Hz {:>7.1} dB",
            peak.frequency_hz, peak.magnitude_db
        )),
        None => line.push_str("  no bins"),
    }
    for band in FrequencyBand::AUDIBLE {
        if let Some(level) = bands.get(band) {
            line.push_str(&format!("  {} {:.1}", band.label(), level));
        }
    }
    if let Some(dominant) = bands.dominant() {
        line.push_str(&format!("  [{}]", dominant.label()));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AnalysisError;

    fn spectrum(sequence: u64) -> AnalysisEvent {
        AnalysisEvent::Spectrum(Spectrum {
            sequence,
            sample_rate: 8000,
            start_pts: Some(sequence as i64 * 8000),
            degenerate_bins: 0,
            bins: (0..100)
                .map(|i| SpectrumBin {
                    frequency_hz: i as f64 * 80.0,
                    magnitude_db: if i == 10 { 30.0 } else { -10.0 },
                })
                .collect(),
        })
    }

    #[test]
    fn out_of_order_results_are_emitted_in_sequence() {
        let mut writer = ReportWriter::new(false, false);
        assert!(writer.push(spectrum(1)).is_empty());
        assert!(writer.push(AnalysisEvent::Dropped { sequence: 2 }).is_empty());
        let lines = writer.push(spectrum(0));
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("segment    0"));
        assert!(lines[1].starts_with("segment    1"));
        assert!(lines[2].contains("dropped"));
        assert_eq!(writer.analysed(), 2);
    }

    #[test]
    fn flush_skips_gaps() {
        let mut writer = ReportWriter::new(false, false);
        writer.push(spectrum(3));
        writer.push(AnalysisEvent::Failed {
            sequence: 5,
            error: AnalysisError::UnsupportedBitDepth(12),
        });
        let lines = writer.flush();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains("unsupported bit depth 12"));
        assert_eq!(writer.push(spectrum(6)).len(), 1);
    }

    #[test]
    fn json_report_has_peak_and_bands() {
        let mut writer = ReportWriter::new(true, false);
        let line = writer.push(spectrum(0)).remove(0);
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["status"], "analysed");
        assert_eq!(value["peak"]["frequency_hz"], 800.0);
        assert!(value["bands"]["low_mids"].as_f64().is_some());
        assert!(value.get("bins").is_none());
    }

    #[test]
    fn full_json_includes_bins() {
        let mut writer = ReportWriter::new(true, true);
        let line = writer.push(spectrum(0)).remove(0);
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["bins"].as_array().map(|b| b.len()), Some(100));
    }
}
