//! ## Wire formats of the WebRTC transport stack
//!
//! [RFC5389]: https://tools.ietf.org/html/rfc5389
//! [RFC3550]: https://tools.ietf.org/html/rfc3550
//! [RFC4960]: https://tools.ietf.org/html/rfc4960
//! [RFC7983]: https://tools.ietf.org/html/rfc7983
//!
//! A browser-compatible media connection multiplexes several protocols
//! over a single UDP 5-tuple: STUN [RFC5389] for connectivity checks,
//! DTLS for key negotiation and for carrying SCTP [RFC4960] data channel
//! traffic, and SRTP/SRTCP for the media itself [RFC3550].  This crate
//! only deals with the binary layout of these protocols; it owns no
//! sockets, no clocks and no connection state.
//!
//! The first byte of every datagram is enough to tell the protocols
//! apart, as described in [RFC7983], see [`PacketKind`].

pub mod crypto;
pub mod rtp;
pub mod sctp;
pub mod stun;

use std::str::Utf8Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    InvalidInput,
    MalformedHeader,
    TruncatedAttribute,
    UnknownMessageType,
    NotFoundMagicNumber,
    NotFoundIntegrity,
    IntegrityFailed,
    FingerprintFailed,
    InvalidChecksum,
    ProtocolViolation(&'static str),
    Utf8Error(Utf8Error),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<Utf8Error> for Error {
    fn from(value: Utf8Error) -> Self {
        Self::Utf8Error(value)
    }
}

/// Demultiplexing of the protocols sharing one transport address.
///
/// [RFC7983]: https://tools.ietf.org/html/rfc7983
///
/// ```text
///                  +----------------+
///                  |        [0..3] -+--> forward to STUN
///                  |                |
///                  |      [16..19] -+--> forward to ZRTP
///                  |                |
///      packet -->  |      [20..63] -+--> forward to DTLS
///                  |                |
///                  |      [64..79] -+--> forward to TURN Channel
///                  |                |
///                  |    [128..191] -+--> forward to RTP/RTCP
///                  +----------------+
/// ```
///
/// RTP and RTCP share the `[128..191]` range, they are told apart by the
/// payload type octet: RTCP packet types 192-223 collide with RTP payload
/// types 64-95 once the marker bit is set, which no dynamic payload
/// mapping uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Stun,
    Dtls,
    Rtp,
    Rtcp,
    Unknown,
}

impl PacketKind {
    /// # Test
    ///
    /// ```
    /// use restream_codec::PacketKind;
    ///
    /// assert_eq!(PacketKind::classify(&[0x00, 0x01]), PacketKind::Stun);
    /// assert_eq!(PacketKind::classify(&[0x16, 0xfe]), PacketKind::Dtls);
    /// assert_eq!(PacketKind::classify(&[0x80, 0x60]), PacketKind::Rtp);
    /// assert_eq!(PacketKind::classify(&[0x80, 0xc8]), PacketKind::Rtcp);
    /// assert_eq!(PacketKind::classify(&[0x40, 0x00]), PacketKind::Unknown);
    /// assert_eq!(PacketKind::classify(&[]), PacketKind::Unknown);
    /// ```
    pub fn classify(bytes: &[u8]) -> Self {
        let Some(first) = bytes.first() else {
            return Self::Unknown;
        };

        match first {
            0..=3 => Self::Stun,
            20..=63 => Self::Dtls,
            128..=191 => match bytes.get(1) {
                Some(pt) if (192..=223).contains(pt) => Self::Rtcp,
                Some(_) => Self::Rtp,
                None => Self::Unknown,
            },
            _ => Self::Unknown,
        }
    }
}

/// compute padding size.
///
/// STUN attributes, SCTP chunks and SCTP error causes are all aligned
/// to a multiple of 4 bytes on the wire.
///
/// # Test
///
/// ```
/// use restream_codec::alignment_32;
///
/// assert_eq!(alignment_32(4), 0);
/// assert_eq!(alignment_32(0), 0);
/// assert_eq!(alignment_32(5), 3);
/// assert_eq!(alignment_32(6), 2);
/// ```
#[inline(always)]
pub fn alignment_32(size: usize) -> usize {
    let range = size % 4;
    if size == 0 || range == 0 {
        return 0;
    }

    4 - range
}

/// smallest multiple of 4 that can hold `size` bytes.
///
/// # Test
///
/// ```
/// use restream_codec::padded;
///
/// assert_eq!(padded(5), 8);
/// assert_eq!(padded(8), 8);
/// assert_eq!(padded(0), 0);
/// ```
#[inline(always)]
pub fn padded(size: usize) -> usize {
    size + alignment_32(size)
}
