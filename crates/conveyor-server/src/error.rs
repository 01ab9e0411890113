//! Server error types.

use std::io;

use thiserror::Error;

/// Server error type.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] conveyor_core::ProtocolError),

    #[error("{0}")]
    Core(#[from] conveyor_core::Error),

    #[error("Not initialized: {0}")]
    NotInitialized(&'static str),

    #[error("Unknown log {0}")]
    UnknownLog(u64),

    #[error("Unknown reader {0}")]
    UnknownReader(usize),

    #[error("Shutdown in progress")]
    ShutdownInProgress,
}

pub type Result<T> = std::result::Result<T, ServerError>;
