//! Error types for IT and S3M module parsing

use thiserror::Error;

/// Errors that can occur when parsing IT or S3M modules
#[derive(Debug, Error)]
pub enum ItError {
    /// File is too small to be a valid module
    #[error("file too small to be a valid IT/S3M module")]
    TooSmall,
    /// Invalid magic bytes
    #[error("invalid magic bytes (expected 'IMPM' or 'SCRM')")]
    InvalidMagic,
    /// Unsupported format version
    #[error("unsupported IT version: 0x{0:04X}")]
    UnsupportedVersion(u16),
    /// Too many channels (max 64)
    #[error("too many channels: {0} (max 64)")]
    TooManyChannels(u8),
    /// Too many patterns (max 200)
    #[error("too many patterns: {0} (max 200)")]
    TooManyPatterns(u16),
    /// Too many instruments (max 200)
    #[error("too many instruments: {0} (max 200)")]
    TooManyInstruments(u16),
    /// Too many samples (max 200)
    #[error("too many samples: {0} (max 200)")]
    TooManySamples(u16),
    /// Invalid pattern data
    #[error("invalid pattern data at index {0}")]
    InvalidPattern(u16),
    /// Invalid instrument data
    #[error("invalid instrument data at index {0}")]
    InvalidInstrument(u16),
    /// Invalid sample data
    #[error("invalid sample data at index {0}")]
    InvalidSample(u16),
    /// Sample uses convert flags the replayer does not support
    #[error("unsupported sample convert flags: 0x{0:02X}")]
    UnsupportedSampleConvert(u8),
    /// A file offset points outside the buffer
    #[error("offset out of range: 0x{0:08X}")]
    OffsetOutOfRange(u32),
    /// Compressed sample data is corrupt
    #[error("sample decompression error: {0}")]
    DecompressionError(&'static str),
    /// Unexpected end of file
    #[error("unexpected end of file")]
    UnexpectedEof,
    /// IO error during parsing
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
