use std::io;

use thiserror::Error;

/// Crate-level error type.
///
/// The protocol treats peers as trusted: a `Protocol` error means a peer is
/// misbehaving or internal state is inconsistent, and the process carrying
/// the error exits non-zero rather than attempting recovery.
#[derive(Debug, Error)]
pub enum DsmError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl DsmError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, DsmError>;
