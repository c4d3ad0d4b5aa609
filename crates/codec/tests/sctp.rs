use anyhow::Result;
use bytes::{Bytes, BytesMut};
use restream_codec::{
    Error,
    sctp::{
        Packet,
        cause::{CauseCode, ErrorCause},
        chunk::{Chunk, ChunkType, Data, Init, Parameter, Sack},
    },
};

#[test]
fn test_missing_mandatory_parameter_lengths() -> Result<()> {
    let cause = ErrorCause::MissingMandatoryParameter { parameters: vec![Parameter::STATE_COOKIE] };
    assert_eq!(cause.code(), CauseCode::MissingMandatoryParameter);
    assert_eq!(cause.semantic_len(), 6);
    assert_eq!(cause.wire_len(), 8);

    let mut bytes = BytesMut::new();
    cause.write_to(&mut bytes);
    assert_eq!(&bytes[..], &[0x00, 0x02, 0x00, 0x06, 0x00, 0x07, 0x00, 0x00]);

    let (decoded, size) = ErrorCause::decode(&bytes.freeze())?;
    assert_eq!(decoded, cause);
    assert_eq!(size, 8);

    Ok(())
}

#[test]
fn test_every_cause_reports_its_lengths() {
    let causes = [
        (ErrorCause::InvalidStreamIdentifier { stream: 1 }, 8, 8),
        (ErrorCause::StaleCookie { staleness: 100 }, 8, 8),
        (ErrorCause::OutOfResource, 4, 4),
        (ErrorCause::UnresolvableAddress { address: Bytes::from_static(&[0; 5]) }, 9, 12),
        (ErrorCause::UnrecognizedChunkType { chunk: Bytes::from_static(&[0x40, 0, 0, 4]) }, 8, 8),
        (ErrorCause::InvalidMandatoryParameter, 4, 4),
        (ErrorCause::UnrecognizedParameters { parameters: Bytes::from_static(&[0; 6]) }, 10, 12),
        (ErrorCause::NoUserData { tsn: 9 }, 8, 8),
        (ErrorCause::CookieWhileShuttingDown, 4, 4),
        (ErrorCause::RestartWithNewAddresses { addresses: Bytes::from_static(&[0; 8]) }, 12, 12),
        (ErrorCause::UserInitiatedAbort { reason: Bytes::from_static(b"bye") }, 7, 8),
        (ErrorCause::ProtocolViolation { information: Bytes::new() }, 4, 4),
        (ErrorCause::Unknown { code: 0x100, value: Bytes::from_static(&[1]) }, 5, 8),
    ];

    for (cause, semantic, wire) in causes {
        assert_eq!(cause.semantic_len(), semantic, "{:?}", cause);
        assert_eq!(cause.wire_len(), wire, "{:?}", cause);

        let mut bytes = BytesMut::new();
        cause.write_to(&mut bytes);
        assert_eq!(bytes.len(), wire);
    }
}

#[test]
fn test_packet_with_data_and_sack() -> Result<()> {
    let packet = Packet {
        source_port: 5000,
        destination_port: 5000,
        verification_tag: 0xdeadbeef,
        chunks: vec![
            Chunk::Data(Data {
                unordered: false,
                beginning: true,
                ending: false,
                tsn: 100,
                stream: 1,
                ssn: 0,
                ppid: 53,
                payload: Bytes::from_static(b"abcde"),
            }),
            Chunk::Sack(Sack {
                cumulative_tsn: 99,
                a_rwnd: 131072,
                gap_blocks: vec![(2, 3)],
                duplicates: vec![97],
            }),
        ],
    };

    let bytes = packet.encode();
    assert_eq!(bytes.len(), 12 + 24 + 24);
    assert_eq!(Packet::peek_verification_tag(&bytes), Some(0xdeadbeef));
    assert_eq!(Packet::decode(&bytes)?, packet);

    Ok(())
}

#[test]
fn test_init_parameters() -> Result<()> {
    let init = Init {
        initiate_tag: 1,
        a_rwnd: 131072,
        outbound_streams: 1024,
        inbound_streams: 1024,
        initial_tsn: 42,
        parameters: vec![
            Parameter::new(Parameter::STATE_COOKIE, Bytes::from_static(b"cookie")),
            Parameter::new(Parameter::FORWARD_TSN_SUPPORTED, Bytes::new()),
        ],
    };

    let chunk = Chunk::InitAck(init.clone());
    assert_eq!(chunk.semantic_len(), 4 + 16 + 12 + 4);
    assert_eq!(chunk.kind(), ChunkType::InitAck);

    let mut bytes = BytesMut::new();
    chunk.write_to(&mut bytes);
    let (decoded, size) = Chunk::decode(&bytes.freeze())?;
    assert_eq!(size, 36);

    let Chunk::InitAck(decoded) = decoded else {
        return Err(anyhow::anyhow!("Expected InitAck"));
    };

    assert_eq!(decoded, init);
    assert_eq!(
        decoded.parameter(Parameter::STATE_COOKIE).map(|it| it.value.clone()),
        Some(Bytes::from_static(b"cookie"))
    );

    Ok(())
}

#[test]
fn test_zero_length_chunk_is_a_protocol_violation() {
    let mut bytes = BytesMut::new();
    bytes.extend_from_slice(&[0x13, 0x88, 0x13, 0x88, 0, 0, 0, 1, 0, 0, 0, 0]);
    bytes.extend_from_slice(&[0x0b, 0x00, 0x00, 0x00]);

    let checksum = restream_codec::crypto::crc32c(&[&bytes[..]]);
    bytes[8..12].copy_from_slice(&checksum.to_le_bytes());

    assert!(matches!(Packet::decode(&bytes), Err(Error::ProtocolViolation(_))));
}

#[test]
fn test_bad_checksum() {
    let packet = Packet {
        source_port: 5000,
        destination_port: 5000,
        verification_tag: 1,
        chunks: vec![Chunk::CookieAck],
    };

    let mut bytes = packet.encode().to_vec();
    bytes[8] ^= 0xff;

    assert_eq!(Packet::decode(&bytes), Err(Error::InvalidChecksum));
    assert_eq!(Packet::decode(&bytes[..6]), Err(Error::MalformedHeader));
}

#[test]
fn test_unknown_chunk_is_kept() -> Result<()> {
    let chunk = Chunk::Unknown {
        kind: 0xc1,
        flags: 0x05,
        value: Bytes::from_static(&[1, 2, 3]),
    };

    assert_eq!(chunk.kind(), ChunkType::Unknown(0xc1));
    assert_eq!(chunk.to_bytes(), Bytes::from_static(&[0xc1, 0x05, 0x00, 0x07, 1, 2, 3]));

    let (decoded, size) = Chunk::decode(&chunk.to_bytes())?;
    assert_eq!(decoded, chunk);
    assert_eq!(size, 7);

    Ok(())
}
