//! ## Session Traversal Utilities for NAT (STUN)
//!
//! [RFC8445]: https://tools.ietf.org/html/rfc8445
//! [RFC8489]: https://tools.ietf.org/html/rfc8489
//!
//! STUN messages are encoded in binary using network-oriented format
//! (most significant byte or octet first, also commonly known as big-
//! endian).  All STUN messages comprise a 20-byte header followed by
//! zero or more attributes [RFC8489].  Interactive Connectivity
//! Establishment (ICE) [RFC8445] is the STUN usage this crate serves.

pub mod attributes;
pub mod methods;

use bytes::{BufMut, BytesMut};

use crate::{
    Error, alignment_32,
    crypto::{fingerprint, hmac_sha1},
    stun::{
        attributes::{Attribute, AttributeType},
        methods::{Method, MessageClass, MessageType},
    },
};

pub const MAGIC_NUMBER: u32 = 0x2112A442;

/// One attribute as it appears on the wire: the type tag and the value
/// without its padding.
///
/// The length reported by `value.len()` is the true unpadded length,
/// the padding up to the next multiple of 4 only exists on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawAttribute<'a> {
    pub kind: AttributeType,
    pub value: &'a [u8],
}

pub struct MessageEncoder<'a> {
    transaction_id: [u8; 12],
    bytes: &'a mut BytesMut,
}

impl<'a> MessageEncoder<'a> {
    pub fn new(kind: MessageType, transaction_id: &[u8; 12], bytes: &'a mut BytesMut) -> Self {
        bytes.clear();
        bytes.put_u16(kind.into());
        bytes.put_u16(0);
        bytes.put_u32(MAGIC_NUMBER);
        bytes.put(transaction_id.as_slice());

        Self {
            transaction_id: *transaction_id,
            bytes,
        }
    }

    /// rely on old message to create new message.
    ///
    /// The transaction id of a response must match the request it
    /// answers, so responses are always built from the request.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use restream_codec::stun::methods::*;
    /// use restream_codec::stun::*;
    ///
    /// let buffer = [
    ///     0x00u8, 0x01, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42, 0x72, 0x6d, 0x49,
    ///     0x42, 0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b,
    /// ];
    ///
    /// let mut buf = BytesMut::new();
    /// let old = Message::decode(&buffer[..]).unwrap();
    /// MessageEncoder::extend(BINDING_REQUEST, &old, &mut buf).flush(None);
    ///
    /// assert_eq!(&buf[..], &buffer[..]);
    /// ```
    pub fn extend(kind: MessageType, reader: &Message<'_>, bytes: &'a mut BytesMut) -> Self {
        Self::new(kind, reader.transaction_id(), bytes)
    }

    /// append attribute.
    ///
    /// append attribute to message attribute list.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use restream_codec::stun::attributes::*;
    /// use restream_codec::stun::methods::*;
    /// use restream_codec::stun::*;
    ///
    /// let token = [
    ///     0x72, 0x6d, 0x49, 0x42, 0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b,
    /// ];
    ///
    /// let new_buf = [
    ///     0x00u8, 0x01, 0x00, 0x0c, 0x21, 0x12, 0xa4, 0x42, 0x72, 0x6d, 0x49,
    ///     0x42, 0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b, 0x00, 0x06, 0x00,
    ///     0x05, 0x70, 0x61, 0x6e, 0x64, 0x61, 0x00, 0x00, 0x00,
    /// ];
    ///
    /// let mut buf = BytesMut::new();
    /// let mut message = MessageEncoder::new(BINDING_REQUEST, &token, &mut buf);
    /// message.append::<UserName>("panda");
    /// message.flush(None);
    ///
    /// assert_eq!(&new_buf[..], &buf[..]);
    /// ```
    pub fn append<'c, T: Attribute<'c>>(&mut self, value: T::Item) {
        self.bytes.put_u16(T::TYPE.into());

        // reserve the length field and fill it in once the value
        // has been written.
        let os = self.bytes.len();
        self.bytes.put_u16(0);
        T::serialize(value, self.bytes, &self.transaction_id);

        let size = self.bytes.len() - os - 2;
        self.bytes[os..os + 2].copy_from_slice(&(size as u16).to_be_bytes());

        // if you need to padding,
        // padding in the zero bytes.
        let psize = alignment_32(size);
        if psize > 0 {
            self.bytes.put(&[0u8; 3][..psize]);
        }
    }

    /// append an attribute with an opaque value, the type number is
    /// written as is.
    pub fn append_raw(&mut self, kind: AttributeType, value: &[u8]) {
        self.bytes.put_u16(kind.into());
        self.bytes.put_u16(value.len() as u16);
        self.bytes.put(value);

        let psize = alignment_32(value.len());
        if psize > 0 {
            self.bytes.put(&[0u8; 3][..psize]);
        }
    }

    /// finish the message.
    ///
    /// Writes the attribute list size into the header, and when a key
    /// is given, appends MESSAGE-INTEGRITY keyed with it followed by
    /// FINGERPRINT.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use restream_codec::stun::methods::*;
    /// use restream_codec::stun::*;
    ///
    /// let token = [
    ///     0x72, 0x6d, 0x49, 0x42, 0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b,
    /// ];
    ///
    /// let mut buf = BytesMut::with_capacity(1280);
    /// MessageEncoder::new(BINDING_REQUEST, &token, &mut buf).flush(Some(&b"password"[..]));
    ///
    /// assert_eq!(buf.len(), 20 + 24 + 8);
    ///
    /// let message = Message::decode(&buf[..]).unwrap();
    /// assert!(message.verify_integrity(b"password").is_ok());
    /// assert!(message.verify_integrity(b"wrong").is_err());
    /// assert!(message.verify_fingerprint().is_ok());
    /// ```
    pub fn flush(&mut self, integrity: Option<&[u8]>) {
        // write attribute list size.
        self.set_len(self.bytes.len() - 20);

        if let Some(key) = integrity {
            self.checksum(key);
        }
    }

    /// append MessageIntegrity and Fingerprint attribute.
    fn checksum(&mut self, key: &[u8]) {
        // the length covers the MessageIntegrity attribute while
        // the digest is computed.
        self.set_len(self.bytes.len() - 20 + 24);

        let hmac = hmac_sha1(key, &[&self.bytes[..]]);
        self.bytes.put_u16(AttributeType::MessageIntegrity.into());
        self.bytes.put_u16(20);
        self.bytes.put(hmac.as_slice());

        // the length covers the Fingerprint attribute while the crc
        // is computed.
        self.set_len(self.bytes.len() - 20 + 8);

        let fingerprint = fingerprint(&self.bytes[..]);
        self.bytes.put_u16(AttributeType::Fingerprint.into());
        self.bytes.put_u16(4);
        self.bytes.put_u32(fingerprint);
    }

    // set stun message header size.
    fn set_len(&mut self, len: usize) {
        self.bytes[2..4].copy_from_slice((len as u16).to_be_bytes().as_slice());
    }
}

#[derive(Debug, Clone)]
pub struct Message<'a> {
    kind: MessageType,
    transaction_id: [u8; 12],
    attributes: Vec<RawAttribute<'a>>,
    /// message source bytes, empty for messages built in memory.
    bytes: &'a [u8],
    /// offset of the MessageIntegrity attribute header.
    integrity: Option<usize>,
    /// offset of the Fingerprint attribute header.
    fingerprint: Option<usize>,
}

impl PartialEq for Message<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.transaction_id == other.transaction_id
            && self.attributes == other.attributes
    }
}

impl Eq for Message<'_> {}

impl<'a> Message<'a> {
    pub fn new(
        kind: MessageType,
        transaction_id: [u8; 12],
        attributes: Vec<RawAttribute<'a>>,
    ) -> Self {
        Self {
            kind,
            transaction_id,
            attributes,
            bytes: &[],
            integrity: None,
            fingerprint: None,
        }
    }

    #[inline]
    pub fn kind(&self) -> MessageType {
        self.kind
    }

    #[inline]
    pub fn method(&self) -> Method {
        self.kind.method
    }

    #[inline]
    pub fn class(&self) -> MessageClass {
        self.kind.class
    }

    /// message transaction id.
    #[inline]
    pub fn transaction_id(&self) -> &[u8; 12] {
        &self.transaction_id
    }

    /// all attributes in the order they appear in the message.
    #[inline]
    pub fn attributes(&self) -> &[RawAttribute<'a>] {
        &self.attributes
    }

    /// get attribute.
    ///
    /// get attribute from message attribute list.
    ///
    /// # Test
    ///
    /// ```
    /// use restream_codec::stun::attributes::*;
    /// use restream_codec::stun::*;
    ///
    /// let buffer = [
    ///     0x00u8, 0x01, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42, 0x72, 0x6d, 0x49,
    ///     0x42, 0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b,
    /// ];
    ///
    /// let message = Message::decode(&buffer[..]).unwrap();
    ///
    /// assert!(message.get::<UserName>().is_none());
    /// ```
    pub fn get<T: Attribute<'a>>(&self) -> Option<T::Item> {
        let attribute = self.attributes.iter().find(|it| it.kind == T::TYPE)?;
        T::deserialize(attribute.value, &self.transaction_id).ok()
    }

    /// whether an attribute of this type is present.
    pub fn contains(&self, kind: AttributeType) -> bool {
        self.attributes.iter().any(|it| it.kind == kind)
    }

    /// check MessageIntegrity attribute.
    ///
    /// return whether the `MessageIntegrity` attribute contained in the
    /// message can pass the check with the given short-term key.
    pub fn verify_integrity(&self, key: &[u8]) -> Result<(), Error> {
        let offset = self.integrity.ok_or(Error::NotFoundIntegrity)?;
        let integrity = &self.bytes[offset + 4..offset + 24];

        let size_buf = ((offset - 20 + 24) as u16).to_be_bytes();
        let body = [&self.bytes[0..2], &size_buf[..], &self.bytes[4..offset]];

        if integrity != hmac_sha1(key, &body).as_slice() {
            return Err(Error::IntegrityFailed);
        }

        Ok(())
    }

    /// check Fingerprint attribute.
    pub fn verify_fingerprint(&self) -> Result<(), Error> {
        let offset = self.fingerprint.ok_or(Error::FingerprintFailed)?;
        let value = u32::from_be_bytes([
            self.bytes[offset + 4],
            self.bytes[offset + 5],
            self.bytes[offset + 6],
            self.bytes[offset + 7],
        ]);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.bytes[0..2]);
        hasher.update(&((offset - 20 + 8) as u16).to_be_bytes());
        hasher.update(&self.bytes[4..offset]);

        if value != hasher.finalize() ^ 0x5354_554e {
            return Err(Error::FingerprintFailed);
        }

        Ok(())
    }

    /// # Test
    ///
    /// ```
    /// use restream_codec::stun::attributes::*;
    /// use restream_codec::stun::methods::*;
    /// use restream_codec::stun::*;
    ///
    /// let buffer: [u8; 20] = [
    ///     0x00, 0x01, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42, 0x72, 0x6d, 0x49, 0x42,
    ///     0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b,
    /// ];
    ///
    /// let message = Message::decode(&buffer[..]).unwrap();
    ///
    /// assert_eq!(message.kind(), BINDING_REQUEST);
    /// assert!(message.get::<UserName>().is_none());
    /// ```
    pub fn decode(bytes: &'a [u8]) -> Result<Self, Error> {
        // There must be at least a complete header.
        if bytes.len() < 20 {
            return Err(Error::MalformedHeader);
        }

        let kind = MessageType::try_from(u16::from_be_bytes([bytes[0], bytes[1]]))?;

        // Check whether the magic number is the same.
        if bytes[4..8] != MAGIC_NUMBER.to_be_bytes() {
            return Err(Error::NotFoundMagicNumber);
        }

        // The length field does not include the 20 bytes of the header and
        // is always a multiple of 4, every attribute is padded.
        let size = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        if size % 4 != 0 || bytes.len() < size + 20 {
            return Err(Error::MalformedHeader);
        }

        let bytes = &bytes[..size + 20];
        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&bytes[8..20]);

        let mut attributes = Vec::with_capacity(8);
        let mut integrity = None;
        let mut fingerprint = None;
        let mut offset = 20;

        while offset < bytes.len() {
            if bytes.len() - offset < 4 {
                return Err(Error::TruncatedAttribute);
            }

            let kind = AttributeType::from(u16::from_be_bytes([bytes[offset], bytes[offset + 1]]));
            let len = u16::from_be_bytes([bytes[offset + 2], bytes[offset + 3]]) as usize;

            // check if the attribute length has overflowed.
            if bytes.len() - offset - 4 < len {
                return Err(Error::TruncatedAttribute);
            }

            match kind {
                AttributeType::MessageIntegrity if len == 20 && integrity.is_none() => {
                    integrity = Some(offset)
                }
                AttributeType::Fingerprint if len == 4 && fingerprint.is_none() => {
                    fingerprint = Some(offset)
                }
                _ => (),
            }

            attributes.push(RawAttribute {
                value: &bytes[offset + 4..offset + 4 + len],
                kind,
            });

            // the message length is a multiple of 4 and so is every
            // attribute start, the padding always fits.
            offset += 4 + len + alignment_32(len);
        }

        Ok(Self {
            kind,
            transaction_id,
            attributes,
            bytes,
            integrity,
            fingerprint,
        })
    }

    /// serialize the message.
    ///
    /// Attributes are written in order, each padded with zero bytes to a
    /// multiple of 4.  For a message produced by [`Message::decode`] the
    /// output is identical to the input bytes, as long as the sender
    /// padded with zeros.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use restream_codec::stun::*;
    ///
    /// let buffer = [
    ///     0x00u8, 0x01, 0x00, 0x0c, 0x21, 0x12, 0xa4, 0x42, 0x72, 0x6d, 0x49,
    ///     0x42, 0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b, 0x00, 0x06, 0x00,
    ///     0x05, 0x70, 0x61, 0x6e, 0x64, 0x61, 0x00, 0x00, 0x00,
    /// ];
    ///
    /// let message = Message::decode(&buffer[..]).unwrap();
    /// assert_eq!(message.attributes()[0].value.len(), 5);
    ///
    /// let mut bytes = BytesMut::new();
    /// message.encode(&mut bytes);
    /// assert_eq!(&bytes[..], &buffer[..]);
    /// ```
    pub fn encode(&self, bytes: &mut BytesMut) {
        let mut encoder = MessageEncoder::new(self.kind, &self.transaction_id, bytes);
        for attribute in &self.attributes {
            encoder.append_raw(attribute.kind, attribute.value);
        }

        encoder.flush(None);
    }

    /// # Test
    ///
    /// ```
    /// use restream_codec::stun::*;
    ///
    /// let buffer: [u8; 20] = [
    ///     0x00, 0x01, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42, 0x72, 0x6d, 0x49, 0x42,
    ///     0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b,
    /// ];
    ///
    /// let size = Message::message_size(&buffer[..]).unwrap();
    ///
    /// assert_eq!(size, 20);
    /// ```
    pub fn message_size(buffer: &[u8]) -> Result<usize, Error> {
        if buffer.len() < 20 || buffer[0] >> 6 != 0 {
            return Err(Error::MalformedHeader);
        }

        Ok(u16::from_be_bytes([buffer[2], buffer[3]]) as usize + 20)
    }
}
