#![cfg(test)]

use bytes::BytesMut;
use proptest::{array, char::range, collection::vec, option, prelude::*, prop_oneof};

use codec::{
    Error, PacketKind,
    rtp::RtpHeader,
    stun::{
        Message, MessageEncoder,
        attributes::{AttributeType, IceControlling, Priority, Software, UseCandidate, UserName},
        methods::{BINDING_INDICATION, BINDING_REQUEST, BINDING_RESPONSE, MessageType},
    },
};

#[derive(Debug, Clone)]
struct GeneratedMessage {
    bytes: Vec<u8>,
    transaction_id: [u8; 12],
    username: Option<String>,
    software: Option<String>,
    priority: Option<u32>,
    password: Option<String>,
}

fn text_token(max_len: usize) -> impl Strategy<Value = String> {
    vec(
        prop_oneof![
            Just('-'),
            Just('_'),
            Just(':'),
            range('0', '9'),
            range('a', 'z'),
            range('A', 'Z'),
        ],
        0..=max_len,
    )
    .prop_map(|chars| chars.into_iter().collect())
}

fn message_types() -> impl Strategy<Value = MessageType> {
    prop_oneof![
        Just(BINDING_REQUEST),
        Just(BINDING_RESPONSE),
        Just(BINDING_INDICATION),
    ]
}

fn valid_messages() -> impl Strategy<Value = GeneratedMessage> {
    (
        message_types(),
        array::uniform12(any::<u8>()),
        option::of(text_token(64)),
        option::of(text_token(32)),
        option::of(any::<u32>()),
        option::of(text_token(24)),
    )
        .prop_map(|(kind, transaction_id, username, software, priority, password)| {
            let mut buf = BytesMut::with_capacity(1024);

            {
                let mut encoder = MessageEncoder::new(kind, &transaction_id, &mut buf);
                if let Some(value) = &username {
                    encoder.append::<UserName>(value);
                }

                if let Some(value) = &software {
                    encoder.append::<Software>(value);
                }

                if let Some(value) = priority {
                    encoder.append::<Priority>(value);
                    encoder.append::<IceControlling>(value as u64);
                    encoder.append::<UseCandidate>(());
                }

                encoder.flush(password.as_ref().map(|it| it.as_bytes()));
            }

            GeneratedMessage {
                bytes: buf.to_vec(),
                transaction_id,
                username,
                software,
                priority,
                password,
            }
        })
}

proptest! {
    /// Arbitrary bytes never panic the decoders, and whatever the STUN
    /// decoder accepts only borrows from the input.
    #[test]
    fn decode_respects_invariants(data in vec(any::<u8>(), 0..=2048)) {
        let _ = PacketKind::classify(&data);
        let _ = RtpHeader::decode(&data);

        if let Ok(message) = Message::decode(&data) {
            prop_assert_eq!(message.transaction_id().len(), 12);

            let base = data.as_ptr() as usize;
            for attribute in message.attributes() {
                let start = attribute.value.as_ptr() as usize;
                prop_assert!(start >= base && start + attribute.value.len() <= base + data.len());
            }

            if message.contains(AttributeType::MessageIntegrity) {
                let result = message.verify_integrity(b"password");
                prop_assert!(matches!(result, Ok(()) | Err(Error::IntegrityFailed)));
            }
        }
    }
}

proptest! {
    /// Messages built with the encoder decode back to the same view.
    #[test]
    fn valid_messages_roundtrip(msg in valid_messages()) {
        let message = Message::decode(&msg.bytes);
        prop_assert!(message.is_ok(), "expected STUN message");
        let message = message.unwrap();

        prop_assert_eq!(message.transaction_id(), &msg.transaction_id);
        prop_assert_eq!(message.get::<UserName>(), msg.username.as_deref());
        prop_assert_eq!(message.get::<Software>(), msg.software.as_deref());
        prop_assert_eq!(message.get::<Priority>(), msg.priority);
        prop_assert_eq!(message.get::<UseCandidate>().is_some(), msg.priority.is_some());

        if let Some(password) = &msg.password {
            prop_assert!(message.verify_integrity(password.as_bytes()).is_ok());
            prop_assert!(message.verify_fingerprint().is_ok());
        }
    }
}
