use std::io;

/// Failures that cross a module boundary.
///
/// Anomalous hit attribution, pinned types and true sharing are handled where
/// they are found and never show up here.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("perf event {event:#x} unavailable: {source}")]
    PerfUnavailable {
        event: u64,
        #[source]
        source: io::Error,
    },

    #[error("no sampling event could be opened")]
    NoSamplingEvents,

    #[error("no space left to relocate a {size} byte instance")]
    RelocationExhausted { size: usize },

    #[error("invalid settings: {0}")]
    InvalidSettings(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
