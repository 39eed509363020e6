//! Varint length-delimited packet framing codec.
//!
//! Frames are encoded as:
//! - varint: body length in bytes
//! - N bytes: protobuf-encoded [`Packet`]
//!
//! The decoder refuses frames longer than the configured maximum before
//! buffering the body, so an abusive peer cannot make us allocate.

use bytes::{Buf, BytesMut};
use prost::Message;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{ConnError, ConnResult};
use crate::protocol::packets::{packet, Packet};

/// A varint length prefix never legitimately needs more than 10 bytes.
const MAX_VARINT_LEN: usize = 10;

/// Codec for length-prefixed protobuf packet framing.
#[derive(Debug)]
pub struct PacketCodec {
    /// Largest accepted frame body, derived from the payload size bound.
    max_frame_len: usize,
}

impl PacketCodec {
    /// Create a codec that rejects frame bodies larger than `max_frame_len`.
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }

    /// Try to read a varint length prefix from the front of `src` without
    /// consuming it. Returns the decoded length and the prefix width, or
    /// `None` if more bytes are needed.
    fn read_length_prefix(src: &BytesMut) -> ConnResult<Option<(u64, usize)>> {
        let mut value: u64 = 0;
        for (i, &byte) in src.iter().take(MAX_VARINT_LEN).enumerate() {
            value |= u64::from(byte & 0x7f) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(Some((value, i + 1)));
            }
        }
        if src.len() >= MAX_VARINT_LEN {
            return Err(ConnError::BadEncoding(
                "length prefix exceeds varint bounds".to_string(),
            ));
        }
        Ok(None)
    }
}

impl Decoder for PacketCodec {
    type Item = (packet::Sum, usize);
    type Error = ConnError;

    fn decode(&mut self, src: &mut BytesMut) -> ConnResult<Option<Self::Item>> {
        let Some((announced_len, prefix_len)) = Self::read_length_prefix(src)? else {
            return Ok(None);
        };

        if announced_len > self.max_frame_len as u64 {
            return Err(ConnError::MessageTooLong {
                size: announced_len.try_into().unwrap_or(usize::MAX),
                max: self.max_frame_len,
            });
        }
        let body_len = announced_len as usize;

        let frame_len = prefix_len + body_len;
        if src.len() < frame_len {
            // Reserve space for the full frame to avoid reallocations
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(prefix_len);
        let body = src.split_to(body_len).freeze();

        let packet = Packet::decode(body).map_err(|e| ConnError::BadEncoding(e.to_string()))?;
        match packet.sum {
            Some(sum) => Ok(Some((sum, frame_len))),
            None => Err(ConnError::UnknownMsgType),
        }
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = ConnError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> ConnResult<()> {
        let body_len = packet.encoded_len();
        if body_len > self.max_frame_len {
            return Err(ConnError::MessageTooLong {
                size: body_len,
                max: self.max_frame_len,
            });
        }

        dst.reserve(prost::length_delimiter_len(body_len) + body_len);
        packet
            .encode_length_delimited(dst)
            .map_err(|e| ConnError::BadEncoding(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packets::{max_packet_size, PacketMsg, PacketPing};

    fn test_codec() -> PacketCodec {
        PacketCodec::new(max_packet_size(1024))
    }

    #[test]
    fn test_roundtrip_ping() {
        let mut codec = test_codec();
        let mut buf = BytesMut::new();

        codec.encode(Packet::ping(), &mut buf).unwrap();
        let (sum, len) = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(sum, packet::Sum::Ping(PacketPing {}));
        assert_eq!(len, Packet::ping().frame_len());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_roundtrip_msg() {
        let mut codec = test_codec();
        let original = PacketMsg {
            channel_id: 7,
            eof: true,
            data: b"fragment".to_vec(),
        };

        let mut buf = BytesMut::new();
        codec.encode(Packet::from(original.clone()), &mut buf).unwrap();

        let (sum, _) = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(sum, packet::Sum::Msg(original));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame() {
        let mut codec = test_codec();
        let mut buf = BytesMut::new();
        codec
            .encode(
                Packet::from(PacketMsg {
                    channel_id: 1,
                    eof: false,
                    data: vec![0u8; 100],
                }),
                &mut buf,
            )
            .unwrap();

        // Withhold the tail of the frame
        let mut partial = buf.split_to(buf.len() - 10);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        // Deliver the rest
        partial.unsplit(buf);
        assert!(codec.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn test_empty_buffer() {
        let mut codec = test_codec();
        let mut buf = BytesMut::new();
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_garbage_is_bad_encoding() {
        let mut codec = test_codec();
        let mut buf = BytesMut::from(&[0x01, 0x02, 0x03, 0x04, 0x05][..]);

        let result = codec.decode(&mut buf);
        assert!(matches!(result, Err(ConnError::BadEncoding(_))));
    }

    #[test]
    fn test_unbounded_varint_is_bad_encoding() {
        let mut codec = test_codec();
        let mut buf = BytesMut::from(&[0x80u8; 10][..]);

        let result = codec.decode(&mut buf);
        assert!(matches!(result, Err(ConnError::BadEncoding(_))));
    }

    #[test]
    fn test_oversize_frame_rejected_by_prefix() {
        let mut codec = test_codec();
        let max = max_packet_size(1024);

        // Length prefix alone announces an oversize body; no body needed.
        let mut buf = BytesMut::new();
        prost::encoding::encode_varint((max + 1) as u64, &mut buf);

        let result = codec.decode(&mut buf);
        assert!(matches!(result, Err(ConnError::MessageTooLong { .. })));
    }

    #[test]
    fn test_oversize_payload_rejected_on_encode() {
        let mut codec = test_codec();
        let mut buf = BytesMut::new();

        let result = codec.encode(
            Packet::from(PacketMsg {
                channel_id: 1,
                eof: true,
                data: vec![0u8; 1024 + 100],
            }),
            &mut buf,
        );
        assert!(matches!(result, Err(ConnError::MessageTooLong { .. })));
    }

    #[test]
    fn test_empty_union_is_unknown_msg_type() {
        let mut codec = test_codec();
        // A zero-length body decodes as a packet with no variant set.
        let mut buf = BytesMut::from(&[0x00][..]);

        let result = codec.decode(&mut buf);
        assert!(matches!(result, Err(ConnError::UnknownMsgType)));
    }

    #[test]
    fn test_multiple_frames() {
        let mut codec = test_codec();
        let mut buf = BytesMut::new();

        codec.encode(Packet::ping(), &mut buf).unwrap();
        codec.encode(Packet::pong(), &mut buf).unwrap();

        let (first, _) = codec.decode(&mut buf).unwrap().unwrap();
        let (second, _) = codec.decode(&mut buf).unwrap().unwrap();

        assert!(matches!(first, packet::Sum::Ping(_)));
        assert!(matches!(second, packet::Sum::Pong(_)));
        assert!(buf.is_empty());
    }
}
