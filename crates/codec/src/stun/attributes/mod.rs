pub mod address;
pub mod error;

use std::{fmt::Debug, net::SocketAddr};

use bytes::{Buf, BufMut};
use num_enum::{FromPrimitive, IntoPrimitive};

use crate::{
    Error,
    stun::attributes::{address::XAddress, error::ErrorType},
};

/// STUN Attributes Registry
///
/// [RFC8126]: https://datatracker.ietf.org/doc/html/rfc8126
/// [RFC8489]: https://datatracker.ietf.org/doc/html/rfc8489
/// [RFC8445]: https://datatracker.ietf.org/doc/html/rfc8445
///
/// A STUN attribute type is a hex number in the range 0x0000-0xFFFF.
/// STUN attribute types in the range 0x0000-0x7FFF are considered
/// comprehension-required; STUN attribute types in the range
/// 0x8000-0xFFFF are considered comprehension-optional.  A STUN agent
/// handles unknown comprehension-required and comprehension-optional
/// attributes differently.
///
/// Comprehension-required range (0x0000-0x7FFF):
/// 0x0001: MAPPED-ADDRESS
/// 0x0006: USERNAME
/// 0x0008: MESSAGE-INTEGRITY
/// 0x0009: ERROR-CODE
/// 0x000A: UNKNOWN-ATTRIBUTES
/// 0x0014: REALM
/// 0x0015: NONCE
/// 0x0020: XOR-MAPPED-ADDRESS
/// 0x0024: PRIORITY [RFC8445]
/// 0x0025: USE-CANDIDATE [RFC8445]
///
/// Comprehension-optional range (0x8000-0xFFFF)
/// 0x8022: SOFTWARE
/// 0x8023: ALTERNATE-SERVER
/// 0x8028: FINGERPRINT
/// 0x8029: ICE-CONTROLLED [RFC8445]
/// 0x802A: ICE-CONTROLLING [RFC8445]
///
/// Attribute types that are not in this table decode as
/// [`AttributeType::Unknown`] carrying the raw number, the value is kept
/// as opaque bytes.
#[repr(u16)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, FromPrimitive, IntoPrimitive)]
pub enum AttributeType {
    MappedAddress = 0x0001,
    UserName = 0x0006,
    MessageIntegrity = 0x0008,
    ErrorCode = 0x0009,
    UnknownAttributes = 0x000A,
    Realm = 0x0014,
    Nonce = 0x0015,
    XorMappedAddress = 0x0020,
    Priority = 0x0024,
    UseCandidate = 0x0025,
    Software = 0x8022,
    AlternateServer = 0x8023,
    Fingerprint = 0x8028,
    IceControlled = 0x8029,
    IceControlling = 0x802A,
    #[num_enum(catch_all)]
    Unknown(u16),
}

impl AttributeType {
    /// whether an agent that does not understand this attribute must
    /// reject the message.
    ///
    /// # Test
    ///
    /// ```
    /// use restream_codec::stun::attributes::AttributeType;
    ///
    /// assert!(AttributeType::UserName.is_comprehension_required());
    /// assert!(!AttributeType::Fingerprint.is_comprehension_required());
    /// assert!(!AttributeType::from(0xC057).is_comprehension_required());
    /// ```
    pub fn is_comprehension_required(self) -> bool {
        u16::from(self) < 0x8000
    }
}

/// dyn stun message attribute.
pub trait Attribute<'a> {
    type Error: Debug;

    /// current attribute inner type.
    type Item;

    /// current attribute type.
    const TYPE: AttributeType;

    /// write the current attribute to the bytes.
    #[allow(unused_variables)]
    fn serialize<B: BufMut>(value: Self::Item, bytes: &mut B, transaction_id: &[u8; 12]) {}

    /// convert bytes to current attribute.
    fn deserialize(bytes: &'a [u8], transaction_id: &[u8; 12]) -> Result<Self::Item, Self::Error>;
}

/// [RFC8265]: https://datatracker.ietf.org/doc/html/rfc8265
/// [RFC3629]: https://datatracker.ietf.org/doc/html/rfc3629
///
/// The USERNAME attribute is used for message integrity.  It identifies
/// the username and password combination used in the message-integrity
/// check.
///
/// For ICE connectivity checks the username is the concatenation of the
/// remote and the local username fragments separated by a colon, i.e.
/// `"RFRAG:LFRAG"` as seen by the sender.
///
/// The value of USERNAME is a variable-length value containing the
/// authentication username.  It MUST contain a UTF-8-encoded [RFC3629]
/// sequence of fewer than 509 bytes and MUST have been processed using
/// the OpaqueString profile [RFC8265].
#[derive(Debug, Clone, Copy)]
pub struct UserName;

impl<'a> Attribute<'a> for UserName {
    type Error = Error;
    type Item = &'a str;

    const TYPE: AttributeType = AttributeType::UserName;

    fn serialize<B: BufMut>(value: Self::Item, bytes: &mut B, _: &[u8; 12]) {
        bytes.put(value.as_bytes());
    }

    fn deserialize(bytes: &'a [u8], _: &[u8; 12]) -> Result<Self::Item, Self::Error> {
        Ok(std::str::from_utf8(bytes)?)
    }
}

/// The SOFTWARE attribute contains a textual description of the software
/// being used by the agent sending the message.  It is used by clients
/// and servers.  Its value SHOULD include manufacturer and version
/// number.
#[derive(Debug, Clone, Copy)]
pub struct Software;

impl<'a> Attribute<'a> for Software {
    type Error = Error;
    type Item = &'a str;

    const TYPE: AttributeType = AttributeType::Software;

    fn serialize<B: BufMut>(value: Self::Item, bytes: &mut B, _: &[u8; 12]) {
        bytes.put(value.as_bytes());
    }

    fn deserialize(bytes: &'a [u8], _: &[u8; 12]) -> Result<Self::Item, Self::Error> {
        Ok(std::str::from_utf8(bytes)?)
    }
}

/// The MESSAGE-INTEGRITY attribute contains an HMAC-SHA1 of the STUN
/// message.  The MESSAGE-INTEGRITY attribute can be present in any STUN
/// message type.  Since it uses the SHA-1 hash, the HMAC will be 20
/// bytes.
///
/// The key for the HMAC depends on which credential mechanism is in use.
/// ICE uses the short-term mechanism, where the key is the password of
/// the agent receiving the request, as exchanged over signaling.
///
/// The text used as input to HMAC is the STUN message, up to and
/// including the attribute preceding the MESSAGE-INTEGRITY attribute.
/// The Length field of the STUN message header is adjusted to point to
/// the end of the MESSAGE-INTEGRITY attribute.  The value of the
/// MESSAGE-INTEGRITY attribute is set to a dummy value.
#[derive(Debug, Clone, Copy)]
pub struct MessageIntegrity;

impl<'a> Attribute<'a> for MessageIntegrity {
    type Error = Error;
    type Item = &'a [u8];

    const TYPE: AttributeType = AttributeType::MessageIntegrity;

    fn serialize<B: BufMut>(value: Self::Item, bytes: &mut B, _: &[u8; 12]) {
        bytes.put(value);
    }

    fn deserialize(bytes: &'a [u8], _: &[u8; 12]) -> Result<Self::Item, Self::Error> {
        if bytes.len() != 20 {
            return Err(Error::InvalidInput);
        }

        Ok(bytes)
    }
}

/// The XOR-MAPPED-ADDRESS attribute is identical to the MAPPED-ADDRESS
/// attribute, except that the reflexive transport address is obfuscated
/// through the XOR function.
///
/// A successful ICE binding response carries the source transport
/// address of the request in this attribute, which is how an agent
/// learns its peer-reflexive address.
#[derive(Debug, Clone, Copy)]
pub struct XorMappedAddress;

impl<'a> Attribute<'a> for XorMappedAddress {
    type Error = Error;
    type Item = SocketAddr;

    const TYPE: AttributeType = AttributeType::XorMappedAddress;

    fn serialize<B: BufMut>(value: Self::Item, bytes: &mut B, transaction_id: &[u8; 12]) {
        XAddress::serialize(&value, transaction_id, bytes, true)
    }

    fn deserialize(bytes: &'a [u8], transaction_id: &[u8; 12]) -> Result<Self::Item, Self::Error> {
        XAddress::deserialize(bytes, transaction_id, true)
    }
}

/// The MAPPED-ADDRESS attribute indicates a reflexive transport address
/// of the client.  This attribute is used only by servers for achieving
/// backwards compatibility with [RFC3489] clients.
///
/// [RFC3489]: https://datatracker.ietf.org/doc/html/rfc3489
#[derive(Debug, Clone, Copy)]
pub struct MappedAddress;

impl<'a> Attribute<'a> for MappedAddress {
    type Error = Error;
    type Item = SocketAddr;

    const TYPE: AttributeType = AttributeType::MappedAddress;

    fn serialize<B: BufMut>(value: Self::Item, bytes: &mut B, transaction_id: &[u8; 12]) {
        XAddress::serialize(&value, transaction_id, bytes, false)
    }

    fn deserialize(bytes: &'a [u8], transaction_id: &[u8; 12]) -> Result<Self::Item, Self::Error> {
        XAddress::deserialize(bytes, transaction_id, false)
    }
}

/// The ERROR-CODE attribute is used in error response messages.  It
/// contains a numeric error code value in the range of 300 to 699 plus a
/// textual reason phrase encoded in UTF-8.
///
/// ```text
/// 0                   1                   2                   3
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |           Reserved, should be 0         |Class|     Number    |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |      Reason Phrase (variable)                                ..
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCode<'a> {
    pub code: u16,
    pub message: &'a str,
}

impl From<ErrorType> for ErrorCode<'_> {
    /// # Test
    ///
    /// ```
    /// use restream_codec::stun::attributes::{ErrorCode, error::ErrorType};
    ///
    /// let error = ErrorCode::from(ErrorType::Unauthorized);
    /// assert_eq!(error.code, 401);
    /// assert_eq!(error.message, "Unauthorized");
    /// ```
    fn from(value: ErrorType) -> Self {
        Self {
            code: value.code(),
            message: value.into(),
        }
    }
}

impl<'a> Attribute<'a> for ErrorCode<'a> {
    type Error = Error;
    type Item = ErrorCode<'a>;

    const TYPE: AttributeType = AttributeType::ErrorCode;

    fn serialize<B: BufMut>(value: Self::Item, bytes: &mut B, _: &[u8; 12]) {
        bytes.put_u16(0);
        bytes.put_u8((value.code / 100) as u8);
        bytes.put_u8((value.code % 100) as u8);
        bytes.put(value.message.as_bytes());
    }

    fn deserialize(mut bytes: &'a [u8], _: &[u8; 12]) -> Result<Self::Item, Self::Error> {
        if bytes.len() < 4 {
            return Err(Error::InvalidInput);
        }

        bytes.advance(2);
        let class = (bytes.get_u8() & 0x07) as u16;
        let number = bytes.get_u8() as u16;

        Ok(Self {
            code: class * 100 + number,
            message: std::str::from_utf8(bytes)?,
        })
    }
}

/// The FINGERPRINT attribute MAY be present in all STUN messages.
///
/// The value of the attribute is computed as the CRC-32 of the STUN
/// message up to (but excluding) the FINGERPRINT attribute itself,
/// XOR'ed with the 32-bit value 0x5354554e.
#[derive(Debug, Clone, Copy)]
pub struct Fingerprint;

impl<'a> Attribute<'a> for Fingerprint {
    type Error = Error;
    type Item = u32;

    const TYPE: AttributeType = AttributeType::Fingerprint;

    fn serialize<B: BufMut>(value: Self::Item, bytes: &mut B, _: &[u8; 12]) {
        bytes.put_u32(value)
    }

    fn deserialize(mut bytes: &'a [u8], _: &[u8; 12]) -> Result<Self::Item, Self::Error> {
        if bytes.len() != 4 {
            return Err(Error::InvalidInput);
        }

        Ok(bytes.get_u32())
    }
}

/// The PRIORITY attribute indicates the priority that is to be
/// associated with a peer-reflexive candidate, if one will be discovered
/// by this check.  It is a 32-bit unsigned integer.
#[derive(Debug, Clone, Copy)]
pub struct Priority;

impl<'a> Attribute<'a> for Priority {
    type Error = Error;
    type Item = u32;

    const TYPE: AttributeType = AttributeType::Priority;

    fn serialize<B: BufMut>(value: Self::Item, bytes: &mut B, _: &[u8; 12]) {
        bytes.put_u32(value)
    }

    fn deserialize(mut bytes: &'a [u8], _: &[u8; 12]) -> Result<Self::Item, Self::Error> {
        if bytes.len() != 4 {
            return Err(Error::InvalidInput);
        }

        Ok(bytes.get_u32())
    }
}

/// The USE-CANDIDATE attribute indicates that the candidate pair
/// resulting from this check will be used for transmission of data.  The
/// attribute has no content (the Length field of the attribute is zero);
/// it serves as a flag.
#[derive(Debug, Clone, Copy)]
pub struct UseCandidate;

impl<'a> Attribute<'a> for UseCandidate {
    type Error = Error;
    type Item = ();

    const TYPE: AttributeType = AttributeType::UseCandidate;

    fn deserialize(_: &'a [u8], _: &[u8; 12]) -> Result<Self::Item, Self::Error> {
        Ok(())
    }
}

/// The ICE-CONTROLLING attribute is present in a Binding request.  The
/// attribute indicates that the client believes it is currently in the
/// controlling role.  The content of the attribute is a 64-bit unsigned
/// integer in network byte order, which contains a random number used
/// for tie-breaking of role conflicts.
#[derive(Debug, Clone, Copy)]
pub struct IceControlling;

impl<'a> Attribute<'a> for IceControlling {
    type Error = Error;
    type Item = u64;

    const TYPE: AttributeType = AttributeType::IceControlling;

    fn serialize<B: BufMut>(value: Self::Item, bytes: &mut B, _: &[u8; 12]) {
        bytes.put_u64(value)
    }

    fn deserialize(mut bytes: &'a [u8], _: &[u8; 12]) -> Result<Self::Item, Self::Error> {
        if bytes.len() != 8 {
            return Err(Error::InvalidInput);
        }

        Ok(bytes.get_u64())
    }
}

/// The ICE-CONTROLLED attribute is present in a Binding request.  The
/// attribute indicates that the client believes it is currently in the
/// controlled role.  The content of the attribute is a 64-bit unsigned
/// integer in network byte order, which contains a random number used
/// for tie-breaking of role conflicts.
#[derive(Debug, Clone, Copy)]
pub struct IceControlled;

impl<'a> Attribute<'a> for IceControlled {
    type Error = Error;
    type Item = u64;

    const TYPE: AttributeType = AttributeType::IceControlled;

    fn serialize<B: BufMut>(value: Self::Item, bytes: &mut B, _: &[u8; 12]) {
        bytes.put_u64(value)
    }

    fn deserialize(mut bytes: &'a [u8], _: &[u8; 12]) -> Result<Self::Item, Self::Error> {
        if bytes.len() != 8 {
            return Err(Error::InvalidInput);
        }

        Ok(bytes.get_u64())
    }
}
