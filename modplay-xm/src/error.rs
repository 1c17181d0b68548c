//! Error types for XM and MOD module parsing

use thiserror::Error;

/// Errors that can occur when parsing XM or MOD modules
#[derive(Debug, Error)]
pub enum XmError {
    /// File is too small to be a valid module
    #[error("file too small to be a valid XM/MOD module")]
    TooSmall,
    /// Invalid magic bytes (expected "Extended Module: ")
    #[error("invalid magic bytes (expected 'Extended Module: ')")]
    InvalidMagic,
    /// Unsupported XM format version
    #[error("unsupported XM version: 0x{0:04X}")]
    UnsupportedVersion(u16),
    /// Channel count out of range or odd
    #[error("invalid channel count: {0}")]
    InvalidChannelCount(u16),
    /// Too many patterns (max 256)
    #[error("too many patterns: {0} (max 256)")]
    TooManyPatterns(u16),
    /// Too many instruments (max 128)
    #[error("too many instruments: {0} (max 128)")]
    TooManyInstruments(u16),
    /// Invalid pattern data
    #[error("invalid pattern data at index {0}")]
    InvalidPattern(u16),
    /// Invalid instrument data
    #[error("invalid instrument data at index {0}")]
    InvalidInstrument(u16),
    /// No recognised MOD signature and the data fails 15-sample sanity checks
    #[error("not a recognised MOD file")]
    NotAMod,
    /// Unexpected end of file
    #[error("unexpected end of file")]
    UnexpectedEof,
    /// IO error during parsing
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
