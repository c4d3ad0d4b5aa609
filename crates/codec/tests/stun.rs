use anyhow::Result;
use bytes::BytesMut;
use restream_codec::{
    Error, PacketKind,
    stun::{
        Message, MessageEncoder, RawAttribute,
        attributes::{error::ErrorType, *},
        methods::*,
    },
};

const TOKEN: [u8; 12] = [
    0x72, 0x6d, 0x49, 0x42, 0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b,
];

#[test]
#[rustfmt::skip]
fn test_binding_request_with_unknown_attribute() -> Result<()> {
    let buffer = [
        0x00, 0x01, 0x00, 0x0c, 0x21, 0x12, 0xa4, 0x42,
        0x72, 0x6d, 0x49, 0x42, 0x72, 0x52, 0x64, 0x48,
        0x57, 0x62, 0x4b, 0x2b, 0x00, 0x20, 0x00, 0x08,
        0x00, 0x01, 0xe0, 0xda, 0x5e, 0x12, 0xa4, 0x43,
    ];

    let message = Message::decode(&buffer[..])?;
    assert_eq!(message.kind(), BINDING_REQUEST);
    assert_eq!(message.method(), Method::Binding);
    assert_eq!(message.class(), MessageClass::Request);
    assert_eq!(message.transaction_id(), &TOKEN);
    assert_eq!(message.attributes().len(), 1);
    assert_eq!(message.attributes()[0].kind, AttributeType::XorMappedAddress);
    assert_eq!(message.attributes()[0].value.len(), 8);
    assert_eq!(message.get::<XorMappedAddress>(), Some("127.0.0.1:49608".parse()?));

    let mut bytes = BytesMut::new();
    message.encode(&mut bytes);
    assert_eq!(&bytes[..], &buffer[..]);

    Ok(())
}

#[test]
#[rustfmt::skip]
fn test_unknown_attribute_type_is_kept() -> Result<()> {
    let buffer = [
        0x00, 0x01, 0x00, 0x08, 0x21, 0x12, 0xa4, 0x42,
        0x72, 0x6d, 0x49, 0x42, 0x72, 0x52, 0x64, 0x48,
        0x57, 0x62, 0x4b, 0x2b, 0xc0, 0x57, 0x00, 0x04,
        0x00, 0x01, 0x00, 0x0a,
    ];

    let message = Message::decode(&buffer[..])?;
    assert_eq!(
        message.attributes(),
        &[RawAttribute {
            kind: AttributeType::Unknown(0xc057),
            value: &[0x00, 0x01, 0x00, 0x0a],
        }]
    );

    let mut bytes = BytesMut::new();
    message.encode(&mut bytes);
    assert_eq!(&bytes[..], &buffer[..]);

    Ok(())
}

#[test]
fn test_ice_connectivity_check() -> Result<()> {
    let mut bytes = BytesMut::with_capacity(1280);
    {
        let mut encoder = MessageEncoder::new(BINDING_REQUEST, &TOKEN, &mut bytes);
        encoder.append::<UserName>("remote:local");
        encoder.append::<Priority>(1853824767);
        encoder.append::<IceControlling>(0x1234_5678_9abc_def0);
        encoder.append::<UseCandidate>(());
        encoder.flush(Some(&b"password"[..]));
    }

    assert_eq!(PacketKind::classify(&bytes), PacketKind::Stun);
    assert_eq!(Message::message_size(&bytes)?, bytes.len());

    let message = Message::decode(&bytes[..])?;
    assert_eq!(message.get::<UserName>(), Some("remote:local"));
    assert_eq!(message.get::<Priority>(), Some(1853824767));
    assert_eq!(message.get::<IceControlling>(), Some(0x1234_5678_9abc_def0));
    assert_eq!(message.get::<IceControlled>(), None);
    assert!(message.contains(AttributeType::UseCandidate));
    assert!(message.contains(AttributeType::MessageIntegrity));

    message.verify_integrity(b"password")?;
    message.verify_fingerprint()?;
    assert_eq!(message.verify_integrity(b"other"), Err(Error::IntegrityFailed));

    Ok(())
}

#[test]
fn test_binding_error_response() -> Result<()> {
    let mut bytes = BytesMut::with_capacity(1280);
    {
        let mut encoder = MessageEncoder::new(BINDING_REQUEST.error(), &TOKEN, &mut bytes);
        encoder.append::<ErrorCode>(ErrorCode::from(ErrorType::RoleConflict));
        encoder.flush(None);
    }

    let message = Message::decode(&bytes[..])?;
    assert_eq!(message.kind(), BINDING_ERROR);
    assert_eq!(message.get::<ErrorCode>(), Some(ErrorCode::from(ErrorType::RoleConflict)));
    assert_eq!(message.verify_integrity(b"password"), Err(Error::NotFoundIntegrity));

    Ok(())
}

#[test]
#[rustfmt::skip]
fn test_malformed_messages() {
    // shorter than a header
    assert_eq!(Message::decode(&[0x00, 0x01, 0x00]), Err(Error::MalformedHeader));

    // bad magic cookie
    let buffer = [
        0x00, 0x01, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x43,
        0x72, 0x6d, 0x49, 0x42, 0x72, 0x52, 0x64, 0x48,
        0x57, 0x62, 0x4b, 0x2b,
    ];

    assert_eq!(Message::decode(&buffer[..]), Err(Error::NotFoundMagicNumber));

    // message type out of range
    let buffer = [
        0xc0, 0x01, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42,
        0x72, 0x6d, 0x49, 0x42, 0x72, 0x52, 0x64, 0x48,
        0x57, 0x62, 0x4b, 0x2b,
    ];

    assert_eq!(Message::decode(&buffer[..]), Err(Error::UnknownMessageType));

    // attribute length runs past the message
    let buffer = [
        0x00, 0x01, 0x00, 0x08, 0x21, 0x12, 0xa4, 0x42,
        0x72, 0x6d, 0x49, 0x42, 0x72, 0x52, 0x64, 0x48,
        0x57, 0x62, 0x4b, 0x2b, 0x00, 0x06, 0x00, 0x10,
        0x70, 0x61, 0x6e, 0x64,
    ];

    assert_eq!(Message::decode(&buffer[..]), Err(Error::TruncatedAttribute));
}
