//! conveyor-core - Wire protocol and I/O plumbing shared by the conveyor
//! client and server.
//!
//! This crate provides:
//! - The message codec (`message`, `coding`) for every wire message kind.
//! - Frame encoding and the stream-multiplexing socket (`frame`, `socket`,
//!   `stream`) that carries many logical streams over one connection.
//! - The cooperative event loop (`event_loop`) that every worker thread
//!   runs: mio poll, bounded command queue, periodic tick.
//! - Small shared utilities: timeout lists and stream-ID allocation.

pub mod coding;
pub mod error;
pub mod event_loop;
pub mod frame;
pub mod message;
pub mod socket;
pub mod stream;
pub mod timeout_list;
pub mod types;

pub use error::{Error, ProtocolError, Result};
pub use message::*;
pub use types::*;
