//! Client error types.

use std::io;

use thiserror::Error;

/// Client error type.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] conveyor_core::ProtocolError),

    #[error("{0}")]
    Core(#[from] conveyor_core::Error),

    #[error("Invalid subscription handle")]
    InvalidHandle,

    #[error("No server for shard {0}")]
    NoServer(u32),

    #[error("Worker queue full, retry")]
    QueueFull,

    #[error("Client is shutting down")]
    ShuttingDown,
}

pub type Result<T> = std::result::Result<T, ClientError>;
