//! Connection error types.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Fatal connection errors. Any of these tears the connection down; they
/// are reported once through the error callback and never retried here.
#[derive(Debug, Error)]
pub enum ConnError {
    /// I/O error on the underlying stream.
    #[error("stream I/O error: {0}")]
    Io(#[from] io::Error),

    /// Inbound bytes did not decode as a valid packet.
    #[error("bad wire encoding: {0}")]
    BadEncoding(String),

    /// A well-formed frame carried no recognized packet variant.
    #[error("unknown top-level message type")]
    UnknownMsgType,

    /// A data packet referenced a channel this connection does not carry.
    #[error("unknown channel {id}")]
    UnknownChannel {
        /// The channel id as it appeared on the wire.
        id: i32,
    },

    /// A packet payload or reassembled message exceeded its size bound.
    #[error("message too long: {size} bytes (max: {max})")]
    MessageTooLong {
        /// Observed size in bytes.
        size: usize,
        /// The configured maximum.
        max: usize,
    },

    /// The peer did not answer a ping in time.
    #[error("no pong received within {timeout:?}")]
    PongTimeout {
        /// The configured pong deadline.
        timeout: Duration,
    },

    /// A connection task panicked; the payload is the panic message.
    #[error("connection task panicked: {0}")]
    Panic(String),

    /// `start` was called on a connection that is already running.
    #[error("connection already started")]
    AlreadyStarted,
}

/// Result type for connection operations.
pub type ConnResult<T> = Result<T, ConnError>;
