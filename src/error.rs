use thiserror::Error;

/// Error taxonomy for the exFAT driver.
///
/// `Format` covers every malformed on-disk structure (bad signature,
/// geometry overflow, checksum mismatch, undersized bitmap) and is never
/// silently corrected. `Io` wraps device failures unchanged; nothing is
/// retried internally.
#[derive(Debug, Error)]
pub enum ExfatError {
    #[error("Format: {0}")]
    Format(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Read-only: {0}")]
    ReadOnly(String),
    #[error("Invalid entry: {0}")]
    InvalidEntry(String),
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("Closed: {0}")]
    Closed(String),
}
