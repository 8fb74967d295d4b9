use std::collections::TryReserveError;

use thiserror::Error;

/// Fatal errors for a session and its decode bridge
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Out of memory allocating {what} ({bytes} bytes)")]
    OutOfMemory { what: &'static str, bytes: usize },

    #[error("Invalid source {source_id}: {reason}")]
    InvalidSource { source_id: String, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unsupported PCM format: {0}")]
    UnsupportedFormat(String),

    #[error("Decoder delivered {delivered} bytes into a {prepared} byte buffer")]
    DeliveryOverrun { delivered: usize, prepared: usize },

    #[error("Decoder thread panicked")]
    DecoderPanicked,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    pub(crate) fn out_of_memory(what: &'static str, bytes: usize) -> impl FnOnce(TryReserveError) -> Self {
        move |_| SessionError::OutOfMemory { what, bytes }
    }
}

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, SessionError>;

/// Per-segment analysis failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnalysisError {
    #[error("analysis cancelled")]
    Cancelled,

    #[error("out of memory allocating {0} transform points")]
    OutOfMemory(usize),

    #[error("unsupported bit depth {0}")]
    UnsupportedBitDepth(u16),

    #[error("window of {window_ms} ms at {sample_rate} Hz is shorter than 2 samples")]
    WindowTooShort { window_ms: u32, sample_rate: u32 },

    #[error("transform panicked: {0}")]
    Panicked(String),
}
