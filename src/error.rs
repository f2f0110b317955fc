//! Error taxonomy for the record engine.

use thiserror::Error;

/// Everything that can go wrong while decoding, building or scanning
/// HIPO v6 records.
#[derive(Error, Debug)]
pub enum HipoError {
    /// Underlying read/write failed or returned short.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Magic number did not match `0xC0DA0100` in either byte order.
    #[error("not a hipo record: magic number mismatch")]
    NotHipo,

    /// Header version field was not 6.
    #[error("unsupported header version: {0} (expected 6)")]
    BadVersion(u8),

    /// Header fields are internally inconsistent (header length,
    /// index length, record length).
    #[error("malformed header: {0}")]
    BadHeader(String),

    /// `check_record_number_sequence` is enabled and an out-of-order
    /// record number was observed.
    #[error("record number out of sequence: expected {expected}, found {found}")]
    BadRecordNumber { expected: u32, found: u32 },

    /// Caller-provided output buffer cannot hold the requested data at
    /// the requested offset.
    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    /// Event ordinal outside `[0, max_events)`.
    #[error("event index {index} out of range (max {max})")]
    IndexOutOfRange { index: i64, max: usize },

    /// The compression codec rejected its input.
    #[error("compression error: {0}")]
    CompressError(String),

    /// A barrier wait was interrupted by `error_alert()` or shutdown.
    #[error("alerted: {0}")]
    Alerted(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, HipoError>;
