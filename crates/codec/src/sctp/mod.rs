//! ## Stream Control Transmission Protocol
//!
//! [RFC4960]: https://datatracker.ietf.org/doc/html/rfc4960
//! [RFC8261]: https://datatracker.ietf.org/doc/html/rfc8261
//!
//! WebRTC data channels run SCTP on top of DTLS [RFC8261], the packets
//! decoded here are the DTLS application data records.

pub mod cause;
pub mod chunk;

use bytes::{BufMut, Bytes, BytesMut};

use self::chunk::Chunk;
use crate::{Error, crypto::crc32c};

pub const COMMON_HEADER_SIZE: usize = 12;

/// SCTP Common Header Format
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |     Source Port Number        |     Destination Port Number   |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                      Verification Tag                         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Checksum                            |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// The checksum is the CRC32c of the whole packet computed with the
/// checksum field set to zero.  Unlike every other field it is stored in
/// little-endian byte order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub source_port: u16,
    pub destination_port: u16,
    pub verification_tag: u32,
    pub chunks: Vec<Chunk>,
}

impl Packet {
    /// total size of the packet on the wire.
    pub fn len(&self) -> usize {
        COMMON_HEADER_SIZE + self.chunks.iter().map(|it| it.wire_len()).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// # Test
    ///
    /// ```
    /// use restream_codec::sctp::{Packet, chunk::Chunk};
    ///
    /// let packet = Packet {
    ///     source_port: 5000,
    ///     destination_port: 5000,
    ///     verification_tag: 0x01020304,
    ///     chunks: vec![Chunk::CookieAck, Chunk::Shutdown { cumulative_tsn: 9 }],
    /// };
    ///
    /// let bytes = packet.encode();
    /// assert_eq!(bytes.len(), 24);
    /// assert_eq!(Packet::decode(&bytes).unwrap(), packet);
    ///
    /// let mut corrupted = bytes.to_vec();
    /// corrupted[13] ^= 0x01;
    /// assert!(Packet::decode(&corrupted).is_err());
    /// ```
    pub fn encode(&self) -> Bytes {
        let mut bytes = BytesMut::with_capacity(self.len());
        bytes.put_u16(self.source_port);
        bytes.put_u16(self.destination_port);
        bytes.put_u32(self.verification_tag);
        bytes.put_u32(0);

        for chunk in &self.chunks {
            chunk.write_to(&mut bytes);
        }

        let checksum = crc32c(&[&bytes[..]]);
        bytes[8..12].copy_from_slice(&checksum.to_le_bytes());
        bytes.freeze()
    }

    /// Verification tag of a packet, read without validating anything
    /// else.
    pub fn peek_verification_tag(bytes: &[u8]) -> Option<u32> {
        if bytes.len() < COMMON_HEADER_SIZE {
            return None;
        }

        Some(u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < COMMON_HEADER_SIZE {
            return Err(Error::MalformedHeader);
        }

        let checksum = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        if crc32c(&[&bytes[..8], &[0u8; 4], &bytes[12..]]) != checksum {
            return Err(Error::InvalidChecksum);
        }

        let mut body = Bytes::copy_from_slice(&bytes[COMMON_HEADER_SIZE..]);
        let mut chunks = Vec::with_capacity(2);
        while !body.is_empty() {
            let (chunk, size) = Chunk::decode(&body)?;
            chunks.push(chunk);
            let _ = body.split_to(size);
        }

        Ok(Self {
            source_port: u16::from_be_bytes([bytes[0], bytes[1]]),
            destination_port: u16::from_be_bytes([bytes[2], bytes[3]]),
            verification_tag: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            chunks,
        })
    }
}
