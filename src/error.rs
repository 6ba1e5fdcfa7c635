//! Error types for the monitor core

use thiserror::Error;

/// Telemetry store failures
#[derive(Debug, Error)]
pub enum StoreError {
    /// Ring lookup past the ring capacity
    #[error("offset {offset} out of range (capacity {capacity})")]
    OffsetOutOfRange { offset: usize, capacity: usize },

    /// Readings log I/O
    #[error("readings log I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Malformed or unroutable client requests
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown route: {0}")]
    UnknownRoute(String),

    #[error("missing parameter: {0}")]
    MissingParameter(&'static str),

    #[error("invalid value for {name}: {value}")]
    InvalidParameter { name: &'static str, value: String },

    #[error("no subscribed client with id {0}")]
    UnknownClient(u32),
}

/// The writer side of the dispatch queue is gone
#[derive(Debug, Error, PartialEq, Eq)]
#[error("dispatch queue closed")]
pub struct QueueClosed;
