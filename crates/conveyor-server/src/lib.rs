//! conveyor-server - The fan-out engine.
//!
//! Data path: storage -> log tailer -> control room -> subscriber hosts.
//! The tailer preserves per-log ordering across asynchronous storage
//! callbacks; the control room maintains per-topic subscriber sets and
//! fans records out; the rocketeer server is the generic subscription
//! endpoint that applications plug delivery logic into.

pub mod control_room;
pub mod error;
pub mod log_tailer;
pub mod options;
pub mod rocketeer;
pub mod router;
pub mod storage;
pub mod topic_manager;

pub use error::{Result, ServerError};
pub use rocketeer::{InboundID, Rocketeer, RocketeerServer, TerminationSource};
