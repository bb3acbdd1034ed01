use crate::types::ScanKind;
use thiserror::Error;

/// Failures surfaced by the scan engine.
///
/// Resolution, dial and handshake errors are terminal for one task only;
/// `QueueClosed` is the only one that ends a worker loop.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("failed to resolve {origin}: {reason}")]
    Resolution { origin: String, reason: String },

    #[error("could not dial {target}: {reason}")]
    Dial { target: String, reason: String },

    #[error("TLS handshake with {target} failed: {reason}")]
    Handshake { target: String, reason: String },

    #[error("task queue for {kind} is full (capacity {capacity})")]
    QueueFull { kind: ScanKind, capacity: usize },

    #[error("task queue is closed")]
    QueueClosed,

    #[error("host is not a valid ip, cidr or domain: {0}")]
    InvalidTarget(String),

    #[error("ping of {target} failed: {reason}")]
    Ping { target: String, reason: String },
}

impl ScanError {
    pub(crate) fn resolution(origin: &str, reason: impl ToString) -> Self {
        Self::Resolution {
            origin: origin.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn dial(target: impl ToString, reason: impl ToString) -> Self {
        Self::Dial {
            target: target.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn handshake(target: impl ToString, reason: impl ToString) -> Self {
        Self::Handshake {
            target: target.to_string(),
            reason: reason.to_string(),
        }
    }
}
