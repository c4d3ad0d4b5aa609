//! Data Channel Establishment Protocol.
//!
//! [RFC8832]: https://datatracker.ietf.org/doc/html/rfc8832
//!
//! A data channel is opened in-band: the opener sends DATA_CHANNEL_OPEN
//! on the stream it picked, the other side answers with DATA_CHANNEL_ACK
//! on the same stream.  Both messages travel with PPID 50.

use crate::Error;

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// WebRTC DCEP
pub const PPID_DCEP: u32 = 50;
/// WebRTC String
pub const PPID_STRING: u32 = 51;
/// WebRTC Binary
pub const PPID_BINARY: u32 = 53;
/// WebRTC String Empty, the payload is a single ignored byte.
pub const PPID_STRING_EMPTY: u32 = 56;
/// WebRTC Binary Empty, the payload is a single ignored byte.
pub const PPID_BINARY_EMPTY: u32 = 57;

const MESSAGE_ACK: u8 = 0x02;
const MESSAGE_OPEN: u8 = 0x03;

/// the upper bit of the channel type selects unordered delivery.
pub const CHANNEL_UNORDERED: u8 = 0x80;

/// DATA_CHANNEL_OPEN
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |  Message Type |  Channel Type |            Priority           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                    Reliability Parameter                      |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |         Label Length          |       Protocol Length         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// \                                                               /
/// |                             Label                             |
/// /                                                               \
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// \                                                               /
/// |                            Protocol                           |
/// /                                                               \
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChannelOpen {
    pub channel_type: u8,
    pub priority: u16,
    pub reliability: u32,
    pub label: String,
    pub protocol: String,
}

impl DataChannelOpen {
    /// a reliable, ordered channel.
    pub fn reliable(label: &str) -> Self {
        Self {
            label: label.to_string(),
            protocol: String::new(),
            channel_type: 0,
            reliability: 0,
            priority: 0,
        }
    }

    pub fn is_unordered(&self) -> bool {
        self.channel_type & CHANNEL_UNORDERED != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DcepMessage {
    Open(DataChannelOpen),
    Ack,
}

impl DcepMessage {
    /// # Test
    ///
    /// ```
    /// use restream_service::sctp::datachannel::*;
    ///
    /// let buffer = [
    ///     0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00,
    ///     0x63, 0x68, 0x61, 0x74,
    /// ];
    ///
    /// let message = DcepMessage::decode(&buffer).unwrap();
    /// assert_eq!(message, DcepMessage::Open(DataChannelOpen::reliable("chat")));
    /// assert_eq!(&message.encode()[..], &buffer[..]);
    ///
    /// assert_eq!(DcepMessage::decode(&[0x02]).unwrap(), DcepMessage::Ack);
    /// assert!(DcepMessage::decode(&buffer[..14]).is_err());
    /// ```
    pub fn decode(mut bytes: &[u8]) -> Result<Self, Error> {
        if bytes.is_empty() {
            return Err(Error::Codec(codec::Error::MalformedHeader));
        }

        match bytes.get_u8() {
            MESSAGE_ACK => Ok(Self::Ack),
            MESSAGE_OPEN => {
                if bytes.len() < 11 {
                    return Err(Error::Codec(codec::Error::MalformedHeader));
                }

                let channel_type = bytes.get_u8();
                let priority = bytes.get_u16();
                let reliability = bytes.get_u32();
                let label_len = bytes.get_u16() as usize;
                let protocol_len = bytes.get_u16() as usize;
                if bytes.len() < label_len + protocol_len {
                    return Err(Error::Codec(codec::Error::MalformedHeader));
                }

                let label = std::str::from_utf8(&bytes[..label_len])
                    .map_err(|e| Error::Codec(e.into()))?;
                let protocol = std::str::from_utf8(&bytes[label_len..label_len + protocol_len])
                    .map_err(|e| Error::Codec(e.into()))?;

                Ok(Self::Open(DataChannelOpen {
                    label: label.to_string(),
                    protocol: protocol.to_string(),
                    channel_type,
                    reliability,
                    priority,
                }))
            }
            _ => Err(Error::Codec(codec::Error::UnknownMessageType)),
        }
    }

    pub fn encode(&self) -> Bytes {
        match self {
            Self::Ack => Bytes::from_static(&[MESSAGE_ACK]),
            Self::Open(open) => {
                let mut bytes = BytesMut::with_capacity(12 + open.label.len() + open.protocol.len());
                bytes.put_u8(MESSAGE_OPEN);
                bytes.put_u8(open.channel_type);
                bytes.put_u16(open.priority);
                bytes.put_u32(open.reliability);
                bytes.put_u16(open.label.len() as u16);
                bytes.put_u16(open.protocol.len() as u16);
                bytes.put(open.label.as_bytes());
                bytes.put(open.protocol.as_bytes());
                bytes.freeze()
            }
        }
    }
}
