use std::time::{Duration, Instant};

use anyhow::Result;
use bytes::Bytes;
use codec::{
    crypto::crc32c,
    sctp::{
        Packet,
        cause::ErrorCause,
        chunk::{Chunk, Data, Init, Parameter},
    },
};
use restream_service::{
    Error,
    sctp::{
        Association, AssociationState, SctpEvent, SctpOptions,
        datachannel::{PPID_BINARY, PPID_DCEP, PPID_STRING},
    },
};

/// deliver everything in flight, both ways, until both sides are quiet.
fn pump(a: &mut Association, b: &mut Association, now: Instant) {
    for _ in 0..64 {
        let mut moved = false;

        while let Some(packet) = a.poll_transmit() {
            b.handle_input(&packet, now);
            moved = true;
        }

        while let Some(packet) = b.poll_transmit() {
            a.handle_input(&packet, now);
            moved = true;
        }

        if !moved {
            break;
        }
    }
}

fn events(association: &mut Association) -> Vec<SctpEvent> {
    std::iter::from_fn(|| association.poll_event()).collect()
}

fn established(now: Instant) -> Result<(Association, Association)> {
    let mut client = Association::new(SctpOptions::default(), now);
    let mut server = Association::new(SctpOptions::default(), now);

    client.connect(now)?;
    pump(&mut client, &mut server, now);

    assert_eq!(events(&mut client), vec![SctpEvent::Connected]);
    assert_eq!(events(&mut server), vec![SctpEvent::Connected]);
    Ok((client, server))
}

/// verification tag the server expects, read from a packet the client
/// sends it.
fn server_tag(client: &mut Association, server: &mut Association, now: Instant) -> Result<u32> {
    client.send(0, PPID_BINARY, Bytes::from_static(b"probe"), false, now)?;

    let packet = client
        .poll_transmit()
        .ok_or(anyhow::anyhow!("nothing sent"))?;

    let tag = Packet::peek_verification_tag(&packet).ok_or(anyhow::anyhow!("short packet"))?;
    server.handle_input(&packet, now);
    pump(client, server, now);
    events(server);

    Ok(tag)
}

#[test]
fn test_four_way_handshake() -> Result<()> {
    let now = Instant::now();
    let mut client = Association::new(SctpOptions::default(), now);
    let mut server = Association::new(SctpOptions::default(), now);

    assert!(matches!(
        client.send(0, PPID_BINARY, Bytes::from_static(b"early"), false, now),
        Err(Error::InvalidState)
    ));

    client.connect(now)?;
    assert_eq!(client.state(), AssociationState::CookieWait);
    assert!(matches!(client.connect(now), Err(Error::InvalidState)));

    let init = client.poll_transmit().ok_or(anyhow::anyhow!("no init"))?;
    assert_eq!(Packet::peek_verification_tag(&init), Some(0));
    assert!(matches!(Packet::decode(&init)?.chunks[..], [Chunk::Init(_)]));

    // the passive side keeps no state until the cookie comes back.
    server.handle_input(&init, now);
    assert_eq!(server.state(), AssociationState::Closed);

    let init_ack = server.poll_transmit().ok_or(anyhow::anyhow!("no init ack"))?;
    client.handle_input(&init_ack, now);
    assert_eq!(client.state(), AssociationState::CookieEchoed);

    let cookie_echo = client.poll_transmit().ok_or(anyhow::anyhow!("no cookie echo"))?;
    server.handle_input(&cookie_echo, now);
    assert!(server.is_established());

    let cookie_ack = server.poll_transmit().ok_or(anyhow::anyhow!("no cookie ack"))?;
    client.handle_input(&cookie_ack, now);
    assert!(client.is_established());
    assert_eq!(client.poll_timeout(), None);

    // a duplicated COOKIE ECHO is answered again without a new event.
    events(&mut server);
    server.handle_input(&cookie_echo, now);
    assert!(server.is_established());
    assert!(events(&mut server).is_empty());

    let packet = Packet::decode(&server.poll_transmit().ok_or(anyhow::anyhow!("no cookie ack"))?)?;
    assert_eq!(packet.chunks, vec![Chunk::CookieAck]);

    Ok(())
}

#[test]
fn test_fragmented_message() -> Result<()> {
    let now = Instant::now();
    let (mut client, mut server) = established(now)?;

    let payload: Bytes = (0..3000).map(|it| it as u8).collect::<Vec<u8>>().into();
    client.send(1, PPID_BINARY, payload.clone(), false, now)?;

    let packets: Vec<Bytes> = std::iter::from_fn(|| client.poll_transmit()).collect();
    assert_eq!(packets.len(), 3);
    assert!(packets.iter().all(|it| it.len() <= 1200));
    assert!(client.poll_timeout().is_some());

    for packet in &packets {
        server.handle_input(packet, now);
    }

    assert_eq!(
        events(&mut server),
        vec![SctpEvent::Message {
            stream: 1,
            ppid: PPID_BINARY,
            data: payload,
        }]
    );

    pump(&mut client, &mut server, now);

    // everything is acknowledged, nothing left to retransmit.
    assert_eq!(client.poll_timeout(), None);
    Ok(())
}

#[test]
fn test_retransmission_after_loss() -> Result<()> {
    let now = Instant::now();
    let (mut client, mut server) = established(now)?;

    client.send(2, PPID_STRING, Bytes::from_static(b"hello"), false, now)?;
    let lost = client.poll_transmit().ok_or(anyhow::anyhow!("nothing sent"))?;
    drop(lost);

    let deadline = client.poll_timeout().ok_or(anyhow::anyhow!("no t3 timer"))?;
    client.handle_timeout(deadline);
    pump(&mut client, &mut server, deadline);

    assert_eq!(
        events(&mut server),
        vec![SctpEvent::Message {
            stream: 2,
            ppid: PPID_STRING,
            data: Bytes::from_static(b"hello"),
        }]
    );

    assert_eq!(client.poll_timeout(), None);
    Ok(())
}

#[test]
fn test_unordered_message_skips_gap() -> Result<()> {
    let now = Instant::now();
    let (mut client, mut server) = established(now)?;

    client.send(2, PPID_STRING, Bytes::from_static(b"first"), false, now)?;
    let lost = client.poll_transmit().ok_or(anyhow::anyhow!("nothing sent"))?;
    drop(lost);

    // one single chunk and one fragmented unordered message behind the gap.
    let payload: Bytes = (0..3000).map(|it| it as u8).collect::<Vec<u8>>().into();
    client.send(3, PPID_STRING, Bytes::from_static(b"second"), true, now)?;
    client.send(3, PPID_BINARY, payload.clone(), true, now)?;

    // the fragments arrive last one first.
    let mut packets: Vec<Bytes> = std::iter::from_fn(|| client.poll_transmit()).collect();
    packets.reverse();

    for packet in &packets {
        server.handle_input(packet, now);
    }

    assert_eq!(
        events(&mut server),
        vec![
            SctpEvent::Message {
                stream: 3,
                ppid: PPID_BINARY,
                data: payload,
            },
            SctpEvent::Message {
                stream: 3,
                ppid: PPID_STRING,
                data: Bytes::from_static(b"second"),
            },
        ]
    );

    let deadline = client.poll_timeout().ok_or(anyhow::anyhow!("no t3 timer"))?;
    client.handle_timeout(deadline);
    pump(&mut client, &mut server, deadline);

    // only the ordered message is left, nothing is delivered twice.
    assert_eq!(
        events(&mut server),
        vec![SctpEvent::Message {
            stream: 2,
            ppid: PPID_STRING,
            data: Bytes::from_static(b"first"),
        }]
    );

    Ok(())
}

#[test]
fn test_retransmission_limit() -> Result<()> {
    let now = Instant::now();
    let (mut client, _server) = established(now)?;

    client.send(0, PPID_BINARY, Bytes::from_static(b"void"), false, now)?;
    while let Some(deadline) = client.poll_timeout() {
        client.handle_timeout(deadline);
        while client.poll_transmit().is_some() {}
    }

    assert_eq!(client.state(), AssociationState::Closed);
    assert_eq!(client.close_reason(), Some("retransmission limit reached"));
    Ok(())
}

#[test]
fn test_data_channel_open() -> Result<()> {
    let now = Instant::now();
    let (mut client, mut server) = established(now)?;

    client.open_channel(1, "chat", now)?;
    assert!(matches!(client.open_channel(1, "chat", now), Err(Error::InvalidState)));

    pump(&mut client, &mut server, now);

    assert_eq!(
        events(&mut server),
        vec![SctpEvent::DataChannelOpened {
            stream: 1,
            label: "chat".to_string(),
        }]
    );

    assert_eq!(
        events(&mut client),
        vec![SctpEvent::DataChannelOpened {
            stream: 1,
            label: "chat".to_string(),
        }]
    );

    assert_eq!(server.channel(1), Some("chat"));
    assert_eq!(client.channel(1), Some("chat"));

    // the ACK is not delivered as a message.
    server.send(1, PPID_STRING, Bytes::from_static(b"hi"), false, now)?;
    pump(&mut client, &mut server, now);
    assert_eq!(
        events(&mut client),
        vec![SctpEvent::Message {
            stream: 1,
            ppid: PPID_STRING,
            data: Bytes::from_static(b"hi"),
        }]
    );

    Ok(())
}

#[test]
fn test_send_rejects_invalid_messages() -> Result<()> {
    let now = Instant::now();
    let (mut client, _server) = established(now)?;

    for (stream, payload) in [
        (0, Bytes::new()),
        (1024, Bytes::from_static(b"x")),
        (0, Bytes::from(vec![0u8; 256 * 1024 + 1])),
    ] {
        assert!(matches!(
            client.send(stream, PPID_BINARY, payload, false, now),
            Err(Error::Codec(codec::Error::InvalidInput))
        ));
    }

    assert!(client.poll_transmit().is_none());
    Ok(())
}

#[test]
fn test_graceful_shutdown() -> Result<()> {
    let now = Instant::now();
    let (mut client, mut server) = established(now)?;

    client.send(0, PPID_BINARY, Bytes::from_static(b"last words"), false, now)?;
    client.shutdown(now);

    // queued data goes first.
    assert_eq!(client.state(), AssociationState::ShutdownPending);

    pump(&mut client, &mut server, now);

    assert_eq!(client.state(), AssociationState::Closed);
    assert_eq!(server.state(), AssociationState::Closed);
    assert_eq!(client.close_reason(), Some("shutdown complete"));
    assert_eq!(server.close_reason(), Some("shutdown complete"));

    assert_eq!(
        events(&mut server),
        vec![
            SctpEvent::Message {
                stream: 0,
                ppid: PPID_BINARY,
                data: Bytes::from_static(b"last words"),
            },
            SctpEvent::Closed {
                reason: "shutdown complete".to_string(),
            },
        ]
    );

    assert_eq!(
        events(&mut client),
        vec![SctpEvent::Closed {
            reason: "shutdown complete".to_string(),
        }]
    );

    Ok(())
}

#[test]
fn test_abort() -> Result<()> {
    let now = Instant::now();
    let (mut client, mut server) = established(now)?;

    client.abort("going away");
    client.abort("twice");
    assert_eq!(client.close_reason(), Some("going away"));

    pump(&mut client, &mut server, now);
    assert_eq!(server.state(), AssociationState::Closed);
    assert!(
        server
            .close_reason()
            .is_some_and(|it| it.starts_with("aborted by peer"))
    );

    Ok(())
}

#[test]
fn test_zero_length_chunk_aborts() -> Result<()> {
    let now = Instant::now();
    let (mut client, mut server) = established(now)?;
    let tag = server_tag(&mut client, &mut server, now)?;

    let mut packet = Vec::with_capacity(16);
    packet.extend(5000u16.to_be_bytes());
    packet.extend(5000u16.to_be_bytes());
    packet.extend(tag.to_be_bytes());
    packet.extend([0u8; 4]);
    packet.extend([0u8; 4]);

    let checksum = crc32c(&[&packet[..]]);
    packet[8..12].copy_from_slice(&checksum.to_le_bytes());

    server.handle_input(&packet, now);
    assert_eq!(server.state(), AssociationState::Closed);
    assert_eq!(server.close_reason(), Some("chunk length below header size"));

    let abort = Packet::decode(&server.poll_transmit().ok_or(anyhow::anyhow!("no abort"))?)?;
    assert!(matches!(
        &abort.chunks[..],
        [Chunk::Abort { causes, .. }] if matches!(causes[..], [ErrorCause::ProtocolViolation { .. }])
    ));

    Ok(())
}

#[test]
fn test_bad_checksum_and_foreign_tag_are_dropped() -> Result<()> {
    let now = Instant::now();
    let (mut client, mut server) = established(now)?;
    let tag = server_tag(&mut client, &mut server, now)?;

    let mut corrupted = Packet {
        source_port: 5000,
        destination_port: 5000,
        verification_tag: tag,
        chunks: vec![Chunk::Abort {
            reflected: false,
            causes: Vec::new(),
        }],
    }
    .encode()
    .to_vec();

    corrupted[9] ^= 0xff;
    server.handle_input(&corrupted, now);

    let foreign = Packet {
        source_port: 5000,
        destination_port: 5000,
        verification_tag: tag.wrapping_add(1),
        chunks: vec![Chunk::Abort {
            reflected: false,
            causes: Vec::new(),
        }],
    }
    .encode();

    server.handle_input(&foreign, now);

    assert!(server.is_established());
    assert!(server.poll_transmit().is_none());
    Ok(())
}

#[test]
fn test_empty_data_reports_no_user_data() -> Result<()> {
    let now = Instant::now();
    let (mut client, mut server) = established(now)?;

    client.send(0, PPID_BINARY, Bytes::from_static(b"first"), false, now)?;
    let first = Packet::decode(&client.poll_transmit().ok_or(anyhow::anyhow!("nothing sent"))?)?;
    let Some(Chunk::Data(data)) = first.chunks.first().cloned() else {
        anyhow::bail!("no data chunk");
    };

    let empty = Packet {
        chunks: vec![Chunk::Data(Data {
            payload: Bytes::new(),
            ..data
        })],
        ..first
    }
    .encode();

    server.handle_input(&empty, now);

    let reply = Packet::decode(&server.poll_transmit().ok_or(anyhow::anyhow!("no reply"))?)?;
    let mut no_user_data = false;
    let mut acknowledged = false;
    for chunk in reply.chunks {
        match chunk {
            Chunk::Error { causes } => {
                no_user_data = causes.contains(&ErrorCause::NoUserData { tsn: data.tsn });
            }
            Chunk::Sack(sack) => acknowledged = sack.cumulative_tsn == data.tsn,
            _ => (),
        }
    }

    assert!(no_user_data);
    assert!(acknowledged);
    assert!(events(&mut server).is_empty());
    assert!(server.is_established());
    Ok(())
}

#[test]
fn test_init_ack_without_cookie() -> Result<()> {
    let now = Instant::now();
    let mut client = Association::new(SctpOptions::default(), now);
    client.connect(now)?;

    let init = Packet::decode(&client.poll_transmit().ok_or(anyhow::anyhow!("no init"))?)?;
    let Some(Chunk::Init(init)) = init.chunks.first().cloned() else {
        anyhow::bail!("no init chunk");
    };

    let init_ack = Packet {
        source_port: 5000,
        destination_port: 5000,
        verification_tag: init.initiate_tag,
        chunks: vec![Chunk::InitAck(Init {
            initiate_tag: 77,
            a_rwnd: 65536,
            outbound_streams: 16,
            inbound_streams: 16,
            initial_tsn: 1,
            parameters: Vec::new(),
        })],
    }
    .encode();

    client.handle_input(&init_ack, now);
    assert_eq!(client.close_reason(), Some("init ack without state cookie"));

    let abort = Packet::decode(&client.poll_transmit().ok_or(anyhow::anyhow!("no abort"))?)?;
    assert_eq!(abort.verification_tag, 77);
    assert_eq!(
        abort.chunks,
        vec![Chunk::Abort {
            reflected: false,
            causes: vec![ErrorCause::MissingMandatoryParameter {
                parameters: vec![Parameter::STATE_COOKIE],
            }],
        }]
    );

    Ok(())
}

#[test]
fn test_stale_cookie() -> Result<()> {
    let now = Instant::now();
    let mut client = Association::new(SctpOptions::default(), now);
    let mut server = Association::new(SctpOptions::default(), now);

    client.connect(now)?;
    let init = client.poll_transmit().ok_or(anyhow::anyhow!("no init"))?;
    server.handle_input(&init, now);
    let init_ack = server.poll_transmit().ok_or(anyhow::anyhow!("no init ack"))?;
    client.handle_input(&init_ack, now);

    let cookie_echo = client.poll_transmit().ok_or(anyhow::anyhow!("no cookie echo"))?;
    let later = now + Duration::from_secs(61);
    server.handle_input(&cookie_echo, later);
    assert_eq!(server.state(), AssociationState::Closed);

    let error = server.poll_transmit().ok_or(anyhow::anyhow!("no error"))?;
    client.handle_input(&error, later);
    assert_eq!(client.close_reason(), Some("stale cookie"));

    Ok(())
}

#[test]
fn test_init_retransmission_limit() -> Result<()> {
    let now = Instant::now();
    let mut client = Association::new(SctpOptions::default(), now);
    client.connect(now)?;

    let mut retransmits = 0;
    while let Some(deadline) = client.poll_timeout() {
        client.handle_timeout(deadline);
        while client.poll_transmit().is_some() {
            retransmits += 1;
        }
    }

    assert_eq!(retransmits, 8);
    assert_eq!(client.close_reason(), Some("init retransmission limit reached"));

    // a closed association never reconnects.
    assert!(matches!(client.connect(now), Err(Error::InvalidState)));
    Ok(())
}

#[test]
fn test_ppid_constants() {
    assert_eq!(PPID_DCEP, 50);
    assert_eq!(PPID_STRING, 51);
    assert_eq!(PPID_BINARY, 53);
}
