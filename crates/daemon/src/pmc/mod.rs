//! PMC protocol engine
//!
//! Speaks the CR-framed ASCII protocol of the Peripheral/Baseboard
//! Controller over the serial link: one command outstanding at a time,
//! asynchronous ALERT interrupts multiplexed into a broadcast stream.

pub mod engine;
pub mod frame;
pub mod registers;

pub use engine::{Button, PmcClient, PmcInterrupt};
pub use frame::Frame;
pub use registers::{Access, Encoding, Register, Value};

use thiserror::Error;

/// Errors surfaced by the protocol engine.
#[derive(Debug, Error)]
pub enum PmcError {
    /// Transport-level failure on the serial link
    #[error("serial link I/O error: {0}")]
    LinkIO(String),

    /// A frame violated the wire grammar
    #[error("malformed frame: {0}")]
    FrameMalformed(String),

    /// The PMC answered `ERR`
    #[error("command rejected by PMC: {0}")]
    CommandRejected(String),

    /// No completion before the request deadline
    #[error("timeout waiting for PMC response to {0}")]
    Timeout(String),

    /// A well-formed frame arrived that does not belong to the pending request
    #[error("unexpected frame: {0}")]
    UnexpectedFrame(String),

    /// The operation is not available on this register
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

impl From<std::io::Error> for PmcError {
    fn from(err: std::io::Error) -> Self {
        PmcError::LinkIO(err.to_string())
    }
}
