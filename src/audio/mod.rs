pub mod bands;
pub mod bridge;
pub mod decode;
pub mod dispatch;
pub mod segment;
pub mod spectrum;

pub use bands::{BandDistribution, FrequencyBand};
pub use bridge::SessionBridge;
pub use dispatch::{AnalysisEvent, AnalysisPool, AnalysisSink, Shutdown};
pub use segment::PcmFormat;
pub use spectrum::{Spectrum, SpectrumBin};
