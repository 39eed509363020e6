//! # braid-conn
//!
//! Multiplexed channel connections over a single full-duplex byte stream.
//!
//! A [`Connection`] carries many independent logical channels of
//! length-delimited messages across one stream (typically a TCP socket,
//! possibly wrapped by an outer encryption layer). It provides:
//!
//! - Per-channel bounded send queues with priority-weighted fair scheduling
//! - Fragmentation of messages into fixed-size wire packets with an
//!   end-of-message marker, reassembled in order on the far side
//! - A ping/pong keepalive that detects a dead peer within a bounded time
//! - Strict validation of inbound framing with typed errors
//! - Orderly shutdown, including a flush-then-stop mode that drains queues
//!
//! # Architecture
//!
//! Each connection runs two tokio tasks that split the stream between them:
//!
//! ```text
//! application ──Send/TrySend──► channel queues ─┐
//!                                               ▼
//!                          Send loop ── codec ──► stream
//!                              ▲ pong requests / pong arrivals
//!                          Receive loop ◄── codec ── stream
//!                              │
//!                              └──► on_receive(channel, bytes)
//! ```
//!
//! Fatal errors from either task (including panics) funnel into a single
//! `on_error` invocation, after which the connection is stopped.
//!
//! # Usage
//!
//! ```ignore
//! use braid_conn::{ChannelDescriptor, ConnConfig, Connection};
//!
//! let conn = Connection::new(
//!     stream,
//!     vec![ChannelDescriptor::new(0x01).with_priority(5)],
//!     |channel, bytes| println!("got {} bytes on {channel}", bytes.len()),
//!     |err| eprintln!("connection failed: {err}"),
//!     ConnConfig::default(),
//! );
//! conn.start()?;
//! conn.send(0x01, &b"hello"[..]).await;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;

mod flow;
mod liveness;

// Re-export main types
pub use channel::{ChannelDescriptor, ChannelStatus};
pub use config::ConnConfig;
pub use connection::{Connection, ConnectionState, ConnectionStatus};
pub use error::{ConnError, ConnResult};
