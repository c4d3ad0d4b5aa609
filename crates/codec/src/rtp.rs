use bytes::{Buf, BufMut, Bytes};

use crate::Error;

const VERSION_MASK: u8 = 0b1100_0000;
const PADDING_MASK: u8 = 0b0010_0000;
const EXTENSION_MASK: u8 = 0b0001_0000;
const CSRC_COUNT_MASK: u8 = 0b0000_1111;
const MARKER_MASK: u8 = 0b1000_0000;
const PAYLOAD_TYPE_MASK: u8 = 0b0111_1111;

pub const FIXED_HEADER_SIZE: usize = 12;

/// RTP header extension.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |      defined by profile       |           length              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                        header extension                       |
/// |                             ....                              |
/// ```
///
/// The length field counts the number of 32-bit words in the extension,
/// excluding the four-octet extension header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderExtension {
    pub profile: u16,
    pub data: Bytes,
}

/// RTP Header.
///
/// ### RTP Fixed Header Fields
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///  |V=2|P|X|  CC   |M|     PT      |       sequence number         |
///  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///  |                           timestamp                           |
///  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///  |           synchronization source (SSRC) identifier            |
///  +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
///  |            contributing source (CSRC) identifiers             |
///  |                             ....                              |
///  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    /// This field identifies the version of RTP, only version 2 is
    /// accepted.
    pub version: u8,
    /// If the padding bit is set, the packet contains one or more
    /// additional padding octets at the end which are not part of the
    /// payload.  The last octet of the padding contains a count of how
    /// many padding octets should be ignored, including itself.
    pub padding: bool,
    /// The interpretation of the marker is defined by a profile.  It is
    /// intended to allow significant events such as frame boundaries to
    /// be marked in the packet stream.
    pub marker: bool,
    /// This field identifies the format of the RTP payload and determines
    /// its interpretation by the application.
    pub payload_type: u8,
    /// The sequence number increments by one for each RTP data packet
    /// sent, and may be used by the receiver to detect packet loss and to
    /// restore packet sequence.
    pub sequence_number: u16,
    /// The timestamp reflects the sampling instant of the first octet in
    /// the RTP data packet.
    pub timestamp: u32,
    /// The SSRC field identifies the synchronization source.
    pub ssrc: u32,
    /// The CSRC list identifies the contributing sources for the payload
    /// contained in this packet.  At most 15 can be identified.
    pub csrc: Vec<u32>,
    /// Present when the extension bit is set.
    pub extension: Option<HeaderExtension>,
}

impl RtpHeader {
    /// header size in bytes, including CSRC list and extension.
    ///
    /// # Test
    ///
    /// ```
    /// use restream_codec::rtp::RtpHeader;
    ///
    /// let buffer = [
    ///     0x80, 0x72, 0x04, 0xf1, 0xf8, 0x87, 0x3f, 0xad, 0x67, 0xfe,
    ///     0x9d, 0xfc,
    /// ];
    ///
    /// let header = RtpHeader::decode(&buffer[..]).unwrap();
    /// assert_eq!(header.len(), 12);
    /// ```
    pub fn len(&self) -> usize {
        FIXED_HEADER_SIZE
            + self.csrc.len() * 4
            + self.extension.as_ref().map(|it| 4 + it.data.len()).unwrap_or(0)
    }

    #[inline]
    pub fn csrc_count(&self) -> u8 {
        self.csrc.len() as u8
    }

    #[inline]
    pub fn has_extension(&self) -> bool {
        self.extension.is_some()
    }

    /// # Test
    ///
    /// ```
    /// use restream_codec::rtp::RtpHeader;
    ///
    /// let buffer = [
    ///     0x90, 0xf2, 0x04, 0xf1, 0xf8, 0x87, 0x3f, 0xad, 0x67, 0xfe,
    ///     0x9d, 0xfc, 0xbe, 0xde, 0x00, 0x01, 0x10, 0xff, 0x00, 0x00,
    /// ];
    ///
    /// let header = RtpHeader::decode(&buffer[..]).unwrap();
    /// assert_eq!(header.padding, false);
    /// assert_eq!(header.marker, true);
    /// assert_eq!(header.payload_type, 114);
    /// assert_eq!(header.sequence_number, 1265);
    /// assert_eq!(header.timestamp, 4169613229);
    /// assert_eq!(header.ssrc, 1744739836);
    /// assert_eq!(header.extension.as_ref().unwrap().profile, 0xbede);
    /// assert_eq!(header.len(), 20);
    ///
    /// assert!(RtpHeader::decode(&buffer[..16]).is_err());
    /// ```
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < FIXED_HEADER_SIZE {
            return Err(Error::MalformedHeader);
        }

        let mut reader = bytes;
        let basic = reader.get_u8();
        let version = (basic & VERSION_MASK) >> 6;
        if version != 2 {
            return Err(Error::MalformedHeader);
        }

        let padding = basic & PADDING_MASK != 0;
        let extension = basic & EXTENSION_MASK != 0;
        let csrc_count = (basic & CSRC_COUNT_MASK) as usize;

        let second = reader.get_u8();
        let mut header = Self {
            version,
            padding,
            marker: second & MARKER_MASK != 0,
            payload_type: second & PAYLOAD_TYPE_MASK,
            sequence_number: reader.get_u16(),
            timestamp: reader.get_u32(),
            ssrc: reader.get_u32(),
            csrc: Vec::new(),
            extension: None,
        };

        if reader.remaining() < csrc_count * 4 {
            return Err(Error::MalformedHeader);
        }

        if csrc_count > 0 {
            header.csrc = (0..csrc_count).map(|_| reader.get_u32()).collect();
        }

        if extension {
            if reader.remaining() < 4 {
                return Err(Error::MalformedHeader);
            }

            let profile = reader.get_u16();
            let size = reader.get_u16() as usize * 4;
            if reader.remaining() < size {
                return Err(Error::MalformedHeader);
            }

            header.extension = Some(HeaderExtension {
                data: Bytes::copy_from_slice(&reader[..size]),
                profile,
            });

            reader.advance(size);
        }

        // The last octet of the padding counts itself, the padding can
        // never reach into the header.
        if padding {
            let count = bytes[bytes.len() - 1] as usize;
            if count == 0 || count > reader.remaining() {
                return Err(Error::MalformedHeader);
            }
        }

        Ok(header)
    }

    /// write the header to a buffer.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use restream_codec::rtp::RtpHeader;
    ///
    /// let buffer = [
    ///     0x80, 0x72, 0x04, 0xf1, 0xf8, 0x87, 0x3f, 0xad, 0x67, 0xfe,
    ///     0x9d, 0xfc,
    /// ];
    ///
    /// let header = RtpHeader {
    ///     version: 2,
    ///     padding: false,
    ///     marker: false,
    ///     payload_type: 114,
    ///     sequence_number: 1265,
    ///     timestamp: 4169613229,
    ///     ssrc: 1744739836,
    ///     csrc: Vec::new(),
    ///     extension: None,
    /// };
    ///
    /// let mut writer = BytesMut::new();
    /// header.write_to(&mut writer);
    /// assert_eq!(&writer[..], &buffer[..]);
    /// ```
    pub fn write_to<B: BufMut>(&self, bytes: &mut B) {
        let mut basic = (self.version << 6) | (self.csrc.len() as u8 & CSRC_COUNT_MASK);
        if self.padding {
            basic |= PADDING_MASK;
        }

        if self.extension.is_some() {
            basic |= EXTENSION_MASK;
        }

        let mut second = self.payload_type & PAYLOAD_TYPE_MASK;
        if self.marker {
            second |= MARKER_MASK;
        }

        bytes.put_u8(basic);
        bytes.put_u8(second);
        bytes.put_u16(self.sequence_number);
        bytes.put_u32(self.timestamp);
        bytes.put_u32(self.ssrc);

        for item in &self.csrc {
            bytes.put_u32(*item);
        }

        if let Some(extension) = &self.extension {
            bytes.put_u16(extension.profile);
            bytes.put_u16((extension.data.len() / 4) as u16);
            bytes.put(&extension.data[..]);
        }
    }

    /// re-serialize the header in place at the start of `bytes`.
    ///
    /// The header must still occupy the same number of bytes it was
    /// decoded from, the payload that follows is never moved.
    pub fn encode(&self, bytes: &mut [u8]) -> Result<usize, Error> {
        let size = self.len();
        if bytes.len() < size || self.csrc.len() > 15 {
            return Err(Error::InvalidInput);
        }

        let mut writer = &mut bytes[..size];
        self.write_to(&mut writer);
        Ok(size)
    }
}

/// SSRC of the sender of an RTCP packet.
///
/// Every RTCP packet type starts with the common header followed by the
/// SSRC of the packet sender.
///
/// # Test
///
/// ```
/// use restream_codec::rtp::rtcp_sender_ssrc;
///
/// let buffer = [0x81, 0xc9, 0x00, 0x07, 0x12, 0x34, 0x56, 0x78];
/// assert_eq!(rtcp_sender_ssrc(&buffer), Some(0x12345678));
/// assert_eq!(rtcp_sender_ssrc(&buffer[..6]), None);
/// ```
pub fn rtcp_sender_ssrc(bytes: &[u8]) -> Option<u32> {
    if bytes.len() < 8 || bytes[0] >> 6 != 2 {
        return None;
    }

    Some(u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]))
}

/// Rewrite the sender SSRC of every packet of a compound RTCP datagram.
///
/// Returns the number of packets rewritten, a packet whose length runs
/// past the end of the datagram is an error and leaves the rest as is.
///
/// # Test
///
/// ```
/// use restream_codec::rtp::{rewrite_rtcp_sender_ssrc, rtcp_sender_ssrc};
///
/// let mut buffer = [
///     0x80, 0xc9, 0x00, 0x01, 0x12, 0x34, 0x56, 0x78,
///     0x81, 0xca, 0x00, 0x01, 0x12, 0x34, 0x56, 0x78,
/// ];
///
/// assert_eq!(rewrite_rtcp_sender_ssrc(&mut buffer, 0x5555).unwrap(), 2);
/// assert_eq!(rtcp_sender_ssrc(&buffer), Some(0x5555));
/// assert_eq!(rtcp_sender_ssrc(&buffer[8..]), Some(0x5555));
/// assert!(rewrite_rtcp_sender_ssrc(&mut buffer[..12], 0x5555).is_err());
/// ```
pub fn rewrite_rtcp_sender_ssrc(bytes: &mut [u8], ssrc: u32) -> Result<usize, Error> {
    let mut offset = 0;
    let mut count = 0;

    while offset + 4 <= bytes.len() {
        if bytes[offset] >> 6 != 2 {
            return Err(Error::MalformedHeader);
        }

        let size = (u16::from_be_bytes([bytes[offset + 2], bytes[offset + 3]]) as usize + 1) * 4;
        if offset + size > bytes.len() {
            return Err(Error::MalformedHeader);
        }

        // a packet of only the common header names no sender.
        if size >= 8 {
            bytes[offset + 4..offset + 8].copy_from_slice(&ssrc.to_be_bytes());
            count += 1;
        }

        offset += size;
    }

    Ok(count)
}
