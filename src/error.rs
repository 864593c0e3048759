// src/error.rs
//
// Error taxonomy for the ingest pipeline, the store and the view engine.
// None of these are fatal: callers log them and degrade to "no data".

use thiserror::Error;

/// A framed line was dropped. The parser has already resynchronised.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("checksum mismatch (byte sum 0x{sum:02X})")]
    Checksum { sum: u8 },

    #[error("invalid character 0x{0:02X} inside frame")]
    InvalidHex(u8),

    #[error("malformed frame ({nibbles} hex digits)")]
    Malformed { nibbles: usize },

    #[error("frame exceeds {0} bytes")]
    Overflow(usize),
}

/// A payload could not be turned into a typed packet.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClassifyError {
    #[error("unrecognised payload ({len} bytes)")]
    Unrecognized { len: usize },

    #[error("{kind} payload truncated: need {need} bytes, got {got}")]
    Truncated {
        kind: &'static str,
        need: usize,
        got: usize,
    },

    #[error("inconsistent payload: {0}")]
    Inconsistent(&'static str),

    #[error("{0} packets carry no sensor record")]
    NoRecord(&'static str),
}

/// Persistence failures. Logged at the store boundary.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store is not open")]
    NotOpen,

    #[error("no data for sid 0x{0:08X}")]
    NoData(u32),

    #[error("invalid local date {0}")]
    Calendar(String),
}

/// View index or window problems. Scroll and zoom paths clamp instead of returning these.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ViewBoundsError {
    #[error("duration {duration}s is not a multiple of width {width}")]
    UnalignedDuration { duration: i64, width: usize },

    #[error("index {index} outside 0..{limit}")]
    OutOfRange { index: i64, limit: usize },
}

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialise settings: {0}")]
    Serialise(#[from] toml::ser::Error),
}

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
