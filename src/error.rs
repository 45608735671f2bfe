use std::io;

use thiserror::Error;

use crate::plan::BroadcastTarget;

/// Errors that reject a wake request before any packet is sent.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WakeError {
    #[error("invalid MAC address format: {0:?}")]
    InvalidMacFormat(String),

    #[error("invalid port {0}, expected 1-65535")]
    InvalidPort(i64),

    #[error("unknown device '{0}'")]
    UnknownDevice(String),
}

/// A single failed send. Recorded in the report, never propagated.
#[derive(Debug, Error)]
#[error("send to {target} failed: {source}")]
pub struct TransmissionError {
    pub target: BroadcastTarget,
    #[source]
    pub source: io::Error,
}

impl TransmissionError {
    pub fn kind(&self) -> io::ErrorKind {
        self.source.kind()
    }
}
