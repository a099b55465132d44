use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Failed to open capture {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Unrecognized capture format: {0}")]
    Format(String),
    #[error("Capture framing error after frame {frame}: {message}")]
    Framing { frame: u64, message: String },
    #[error("Unsupported link type {0}")]
    UnsupportedLinkType(String),
    #[error("Live capture error: {0}")]
    Live(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Malformed frame {frame}: {message}")]
    Malformed { frame: u64, message: String },
}
