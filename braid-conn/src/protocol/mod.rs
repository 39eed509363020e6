//! Wire protocol layer.
//!
//! This module contains:
//! - The packet union (ping / pong / data fragment) in its protobuf wire
//!   form, which is the compatibility boundary with peers
//! - The varint length-delimited framing codec

pub mod framing;
pub mod packets;

// Re-export main types
pub use framing::PacketCodec;
pub use packets::{max_packet_size, packet, Packet, PacketMsg, PacketPing, PacketPong};
