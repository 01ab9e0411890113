//! Error types for conveyor.

use std::io;

use thiserror::Error;

/// Main error type for conveyor.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not initialized: {0}")]
    NotInitialized(&'static str),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Shutdown in progress")]
    ShutdownInProgress,

    #[error("Timed out")]
    TimedOut,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Wire protocol errors.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid message type: {0}")]
    InvalidMessageType(u8),

    #[error("Invalid {what} enum value: {value}")]
    InvalidEnum { what: &'static str, value: u8 },

    #[error("Truncated message: missing {0}")]
    Truncated(&'static str),

    #[error("Invalid varint encoding")]
    InvalidVarint,

    #[error("Invalid frame version: {0}")]
    InvalidFrameVersion(u8),

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Sequence number regression: {seqno} < {prev_seqno}")]
    SeqnoRegression { seqno: u64, prev_seqno: u64 },
}

pub type Result<T> = std::result::Result<T, Error>;
