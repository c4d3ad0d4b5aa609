use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{FromPrimitive, IntoPrimitive};

use crate::{Error, alignment_32, padded};

/// Error cause codes.
///
/// [RFC4960]: https://datatracker.ietf.org/doc/html/rfc4960#section-3.3.10
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |           Cause Code          |       Cause Length            |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// /                    Cause-Specific Information                 /
/// \                                                               \
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// Cause Length is the semantic length of the cause including the code
/// and length fields.  On the wire a cause is followed by zero padding up
/// to the next multiple of 4, the padding is not counted in Cause Length.
///
/// Cause Code
/// ---------      ----------------
///  1              Invalid Stream Identifier
///  2              Missing Mandatory Parameter
///  3              Stale Cookie Error
///  4              Out of Resource
///  5              Unresolvable Address
///  6              Unrecognized Chunk Type
///  7              Invalid Mandatory Parameter
///  8              Unrecognized Parameters
///  9              No User Data
/// 10              Cookie Received While Shutting Down
/// 11              Restart of an Association with New Addresses
/// 12              User-Initiated Abort
/// 13              Protocol Violation
#[repr(u16)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, FromPrimitive, IntoPrimitive)]
pub enum CauseCode {
    InvalidStreamIdentifier = 1,
    MissingMandatoryParameter = 2,
    StaleCookie = 3,
    OutOfResource = 4,
    UnresolvableAddress = 5,
    UnrecognizedChunkType = 6,
    InvalidMandatoryParameter = 7,
    UnrecognizedParameters = 8,
    NoUserData = 9,
    CookieWhileShuttingDown = 10,
    RestartWithNewAddresses = 11,
    UserInitiatedAbort = 12,
    ProtocolViolation = 13,
    #[num_enum(catch_all)]
    Unknown(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCause {
    /// Indicates endpoint received a DATA chunk sent to a nonexistent
    /// stream.  The 16-bit stream identifier is followed by 16 reserved
    /// bits.
    InvalidStreamIdentifier { stream: u16 },
    /// Indicates that one or more mandatory TLV parameters are missing
    /// in a received INIT or INIT ACK.  The value is the list of the
    /// missing 16-bit parameter types, without a count field.
    MissingMandatoryParameter { parameters: Vec<u16> },
    /// Indicates the receipt of a valid State Cookie that has expired,
    /// the staleness is measured in microseconds.
    StaleCookie { staleness: u32 },
    /// Indicates that the sender is out of resource.
    OutOfResource,
    /// Indicates that the sender is not able to resolve the specified
    /// address parameter.
    UnresolvableAddress { address: Bytes },
    /// This error cause is returned to the originator of the chunk if
    /// the receiver does not understand the chunk and the upper bits of
    /// the 'Chunk Type' are set to 01 or 11.  The value is the whole
    /// unrecognized chunk.
    UnrecognizedChunkType { chunk: Bytes },
    /// This error cause is returned to the originator of an INIT or INIT
    /// ACK chunk when one of the mandatory parameters is set to an
    /// invalid value.
    InvalidMandatoryParameter,
    /// This error cause is returned to the originator of the INIT ACK
    /// chunk if the receiver does not recognize one or more optional TLV
    /// parameters in the INIT ACK chunk.
    UnrecognizedParameters { parameters: Bytes },
    /// This error cause is returned to the originator of a DATA chunk if
    /// a received DATA chunk has no user data.
    NoUserData { tsn: u32 },
    /// A COOKIE ECHO was received while the endpoint was in the
    /// SHUTDOWN-ACK-SENT state.
    CookieWhileShuttingDown,
    /// An INIT was received on an existing association, but the INIT
    /// added addresses to the association that were previously not part
    /// of the association.
    RestartWithNewAddresses { addresses: Bytes },
    /// This error cause MAY be included in ABORT chunks that are sent
    /// because of an upper-layer request.
    UserInitiatedAbort { reason: Bytes },
    /// This error cause MAY be included in ABORT chunks that are sent
    /// because an SCTP endpoint detects a protocol violation of the peer
    /// that is not covered by the error causes above.
    ProtocolViolation { information: Bytes },
    /// Any cause code not in the table above, kept as is.
    Unknown { code: u16, value: Bytes },
}

impl ErrorCause {
    pub fn code(&self) -> CauseCode {
        match self {
            Self::InvalidStreamIdentifier { .. } => CauseCode::InvalidStreamIdentifier,
            Self::MissingMandatoryParameter { .. } => CauseCode::MissingMandatoryParameter,
            Self::StaleCookie { .. } => CauseCode::StaleCookie,
            Self::OutOfResource => CauseCode::OutOfResource,
            Self::UnresolvableAddress { .. } => CauseCode::UnresolvableAddress,
            Self::UnrecognizedChunkType { .. } => CauseCode::UnrecognizedChunkType,
            Self::InvalidMandatoryParameter => CauseCode::InvalidMandatoryParameter,
            Self::UnrecognizedParameters { .. } => CauseCode::UnrecognizedParameters,
            Self::NoUserData { .. } => CauseCode::NoUserData,
            Self::CookieWhileShuttingDown => CauseCode::CookieWhileShuttingDown,
            Self::RestartWithNewAddresses { .. } => CauseCode::RestartWithNewAddresses,
            Self::UserInitiatedAbort { .. } => CauseCode::UserInitiatedAbort,
            Self::ProtocolViolation { .. } => CauseCode::ProtocolViolation,
            Self::Unknown { code, .. } => CauseCode::from(*code),
        }
    }

    fn value_len(&self) -> usize {
        match self {
            Self::InvalidStreamIdentifier { .. } => 4,
            Self::MissingMandatoryParameter { parameters } => parameters.len() * 2,
            Self::StaleCookie { .. } => 4,
            Self::OutOfResource => 0,
            Self::UnresolvableAddress { address } => address.len(),
            Self::UnrecognizedChunkType { chunk } => chunk.len(),
            Self::InvalidMandatoryParameter => 0,
            Self::UnrecognizedParameters { parameters } => parameters.len(),
            Self::NoUserData { .. } => 4,
            Self::CookieWhileShuttingDown => 0,
            Self::RestartWithNewAddresses { addresses } => addresses.len(),
            Self::UserInitiatedAbort { reason } => reason.len(),
            Self::ProtocolViolation { information } => information.len(),
            Self::Unknown { value, .. } => value.len(),
        }
    }

    /// the Cause Length field, header included and padding excluded.
    ///
    /// # Test
    ///
    /// ```
    /// use restream_codec::sctp::cause::ErrorCause;
    ///
    /// let cause = ErrorCause::MissingMandatoryParameter { parameters: vec![7] };
    /// assert_eq!(cause.semantic_len(), 6);
    /// assert_eq!(cause.wire_len(), 8);
    ///
    /// let cause = ErrorCause::OutOfResource;
    /// assert_eq!(cause.semantic_len(), 4);
    /// assert_eq!(cause.wire_len(), 4);
    /// ```
    pub fn semantic_len(&self) -> usize {
        4 + self.value_len()
    }

    /// the number of bytes the cause occupies on the wire.
    pub fn wire_len(&self) -> usize {
        padded(self.semantic_len())
    }

    pub fn write_to(&self, bytes: &mut BytesMut) {
        bytes.put_u16(self.code().into());
        bytes.put_u16(self.semantic_len() as u16);

        match self {
            Self::InvalidStreamIdentifier { stream } => {
                bytes.put_u16(*stream);
                bytes.put_u16(0);
            }
            Self::MissingMandatoryParameter { parameters } => {
                for kind in parameters {
                    bytes.put_u16(*kind);
                }
            }
            Self::StaleCookie { staleness } => bytes.put_u32(*staleness),
            Self::NoUserData { tsn } => bytes.put_u32(*tsn),
            Self::UnresolvableAddress { address: value }
            | Self::UnrecognizedChunkType { chunk: value }
            | Self::UnrecognizedParameters { parameters: value }
            | Self::RestartWithNewAddresses { addresses: value }
            | Self::UserInitiatedAbort { reason: value }
            | Self::ProtocolViolation { information: value }
            | Self::Unknown { value, .. } => bytes.put(&value[..]),
            Self::OutOfResource | Self::InvalidMandatoryParameter | Self::CookieWhileShuttingDown => {
            }
        }

        let psize = alignment_32(self.semantic_len());
        if psize > 0 {
            bytes.put(&[0u8; 3][..psize]);
        }
    }

    /// decode one cause from the front of `bytes`, returns the cause and
    /// the number of bytes it occupied including padding.
    pub fn decode(bytes: &Bytes) -> Result<(Self, usize), Error> {
        if bytes.len() < 4 {
            return Err(Error::ProtocolViolation("truncated error cause"));
        }

        let code = u16::from_be_bytes([bytes[0], bytes[1]]);
        let size = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        if size < 4 || size > bytes.len() {
            return Err(Error::ProtocolViolation("invalid error cause length"));
        }

        let value = bytes.slice(4..size);

        let cause = match CauseCode::from(code) {
            CauseCode::InvalidStreamIdentifier => Self::InvalidStreamIdentifier {
                stream: fixed(&value, 4)?.get_u16(),
            },
            CauseCode::MissingMandatoryParameter => {
                if value.len() % 2 != 0 {
                    return Err(Error::ProtocolViolation("invalid error cause length"));
                }

                Self::MissingMandatoryParameter {
                    parameters: value
                        .chunks_exact(2)
                        .map(|it| u16::from_be_bytes([it[0], it[1]]))
                        .collect(),
                }
            }
            CauseCode::StaleCookie => Self::StaleCookie {
                staleness: fixed(&value, 4)?.get_u32(),
            },
            CauseCode::OutOfResource => {
                fixed(&value, 0)?;
                Self::OutOfResource
            }
            CauseCode::UnresolvableAddress => Self::UnresolvableAddress { address: value },
            CauseCode::UnrecognizedChunkType => Self::UnrecognizedChunkType { chunk: value },
            CauseCode::InvalidMandatoryParameter => {
                fixed(&value, 0)?;
                Self::InvalidMandatoryParameter
            }
            CauseCode::UnrecognizedParameters => Self::UnrecognizedParameters { parameters: value },
            CauseCode::NoUserData => Self::NoUserData {
                tsn: fixed(&value, 4)?.get_u32(),
            },
            CauseCode::CookieWhileShuttingDown => {
                fixed(&value, 0)?;
                Self::CookieWhileShuttingDown
            }
            CauseCode::RestartWithNewAddresses => Self::RestartWithNewAddresses { addresses: value },
            CauseCode::UserInitiatedAbort => Self::UserInitiatedAbort { reason: value },
            CauseCode::ProtocolViolation => Self::ProtocolViolation { information: value },
            CauseCode::Unknown(code) => Self::Unknown { code, value },
        };

        Ok((cause, padded(size).min(bytes.len())))
    }

    /// decode every cause bundled in a chunk value.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::{Bytes, BytesMut};
    /// use restream_codec::sctp::cause::ErrorCause;
    ///
    /// let causes = vec![
    ///     ErrorCause::InvalidStreamIdentifier { stream: 3 },
    ///     ErrorCause::ProtocolViolation { information: Bytes::from_static(b"bad") },
    ///     ErrorCause::MissingMandatoryParameter { parameters: vec![7, 9] },
    /// ];
    ///
    /// let mut bytes = BytesMut::new();
    /// for cause in &causes {
    ///     cause.write_to(&mut bytes);
    /// }
    ///
    /// assert_eq!(bytes.len(), 8 + 8 + 8);
    /// assert_eq!(ErrorCause::decode_all(bytes.freeze()).unwrap(), causes);
    /// ```
    pub fn decode_all(mut bytes: Bytes) -> Result<Vec<Self>, Error> {
        let mut causes = Vec::new();
        while !bytes.is_empty() {
            let (cause, size) = Self::decode(&bytes)?;
            causes.push(cause);
            bytes.advance(size);
        }

        Ok(causes)
    }
}

fn fixed(value: &Bytes, len: usize) -> Result<Bytes, Error> {
    if value.len() != len {
        return Err(Error::ProtocolViolation("invalid error cause length"));
    }

    Ok(value.clone())
}
