//! Packet definitions in protobuf wire form.
//!
//! The message structs are written out by hand rather than generated from a
//! schema file, so the crate builds without protoc. Field numbers and types
//! are fixed: changing them breaks compatibility with every peer.

use prost::Message;

/// Keepalive request. Carries no fields.
#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct PacketPing {}

/// Keepalive answer. Carries no fields.
#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct PacketPong {}

/// One fragment of a channel message. The final fragment of a message
/// carries `eof = true`.
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct PacketMsg {
    /// Channel the fragment belongs to. Wire type is int32 for schema
    /// evolution headroom; valid channels fit in a u8.
    #[prost(int32, tag = "1")]
    pub channel_id: i32,
    /// True on the last fragment of a message.
    #[prost(bool, tag = "2")]
    pub eof: bool,
    /// Fragment payload.
    #[prost(bytes = "vec", tag = "3")]
    pub data: Vec<u8>,
}

/// The tagged packet union that frames carry.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Packet {
    /// Exactly one variant is set on a valid packet.
    #[prost(oneof = "packet::Sum", tags = "1, 2, 3")]
    pub sum: Option<packet::Sum>,
}

/// Nested types for [`Packet`].
pub mod packet {
    /// The packet variants.
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Sum {
        /// Keepalive request.
        #[prost(message, tag = "1")]
        Ping(super::PacketPing),
        /// Keepalive answer.
        #[prost(message, tag = "2")]
        Pong(super::PacketPong),
        /// Channel message fragment.
        #[prost(message, tag = "3")]
        Msg(super::PacketMsg),
    }
}

impl Packet {
    /// A ping packet.
    pub fn ping() -> Self {
        Packet {
            sum: Some(packet::Sum::Ping(PacketPing {})),
        }
    }

    /// A pong packet.
    pub fn pong() -> Self {
        Packet {
            sum: Some(packet::Sum::Pong(PacketPong {})),
        }
    }

    /// Total bytes this packet occupies on the wire, length prefix included.
    pub fn frame_len(&self) -> usize {
        let body = self.encoded_len();
        prost::length_delimiter_len(body) + body
    }
}

impl From<PacketMsg> for Packet {
    fn from(msg: PacketMsg) -> Self {
        Packet {
            sum: Some(packet::Sum::Msg(msg)),
        }
    }
}

/// The largest frame body a reader accepts for a given payload bound:
/// the serialized size of a data packet with a full payload and the widest
/// possible header fields.
pub fn max_packet_size(max_payload: usize) -> usize {
    Packet::from(PacketMsg {
        channel_id: i32::MAX,
        eof: true,
        data: vec![0; max_payload],
    })
    .encoded_len()
}

#[cfg(test)]
mod tests {
    use super::*;

    // Known-good serializations shared with other implementations of the
    // protocol. These must never change.
    const PING_HEX: &str = "0a00";
    const PONG_HEX: &str = "1200";
    const MSG_HEX: &str =
        "1a2208011a1e64617461207472616e736d6974746564206f766572207468652077697265";

    fn sample_msg() -> Packet {
        Packet::from(PacketMsg {
            channel_id: 1,
            eof: false,
            data: b"data transmitted over the wire".to_vec(),
        })
    }

    #[test]
    fn test_wire_vectors_encode() {
        for (packet, expected) in [
            (Packet::ping(), PING_HEX),
            (Packet::pong(), PONG_HEX),
            (sample_msg(), MSG_HEX),
        ] {
            let mut buf = Vec::new();
            packet.encode(&mut buf).unwrap();
            assert_eq!(hex::encode(&buf), expected);
        }
    }

    #[test]
    fn test_wire_vectors_decode() {
        for (expected, bytes) in [
            (Packet::ping(), PING_HEX),
            (Packet::pong(), PONG_HEX),
            (sample_msg(), MSG_HEX),
        ] {
            let decoded = Packet::decode(hex::decode(bytes).unwrap().as_slice()).unwrap();
            assert_eq!(decoded, expected);
        }
    }

    #[test]
    fn test_frame_len_matches_encoding() {
        let packet = sample_msg();
        let mut buf = Vec::new();
        packet.encode_length_delimited(&mut buf).unwrap();
        assert_eq!(packet.frame_len(), buf.len());
    }

    #[test]
    fn test_max_packet_size_bounds_real_packets() {
        let max = max_packet_size(1024);
        let packet = Packet::from(PacketMsg {
            channel_id: 255,
            eof: true,
            data: vec![0xAB; 1024],
        });
        assert!(packet.encoded_len() <= max);

        // A payload one byte over the bound does not fit.
        let oversize = Packet::from(PacketMsg {
            channel_id: 0,
            eof: false,
            data: vec![0; 1025],
        });
        assert!(oversize.encoded_len() > max);
    }

    #[test]
    fn test_empty_union_is_distinguishable() {
        let empty = Packet { sum: None };
        assert_eq!(empty.encoded_len(), 0);
        let decoded = Packet::decode(&[][..]).unwrap();
        assert!(decoded.sum.is_none());
    }
}
