use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Result;
use bytes::{Bytes, BytesMut};
use codec::{
    PacketKind,
    stun::{
        Message, MessageEncoder,
        attributes::{IceControlling, Priority, UseCandidate, UserName, XorMappedAddress},
        methods::{BINDING_REQUEST, BINDING_RESPONSE, MessageClass},
    },
};
use parking_lot::Mutex;
use restream_service::{
    CandidateDescriptor, ConnectionHandle, Error, Interface, Service, ServiceHandler,
    ServiceOptions, Transmit,
    dtls::{Certificate, DtlsEvent, DtlsOptions, DtlsRole, DtlsSession},
    ice::IceOptions,
    peer::{ConnectionState, PeerOptions, SsrcRemap},
    sctp::{Association, SctpEvent, SctpOptions, datachannel::PPID_STRING},
    srtp::SrtpContext,
};

const BROWSER_UFRAG: &str = "brws";
const BROWSER_PWD: &str = "browserpasswordbrowserpw";
const SSRC: u32 = 0xABCD1234;

fn listen() -> SocketAddr {
    "127.0.0.1:5000".parse().unwrap()
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Record {
    State(ConnectionHandle, ConnectionState),
    Channel(ConnectionHandle, u16, String),
    Message(ConnectionHandle, u16, u32, Vec<u8>),
    Closed(ConnectionHandle, String),
}

#[derive(Default, Clone)]
struct Recorder {
    records: Arc<Mutex<Vec<Record>>>,
}

impl Recorder {
    fn take(&self) -> Vec<Record> {
        std::mem::take(&mut *self.records.lock())
    }
}

impl ServiceHandler for Recorder {
    fn on_state_changed(&self, handle: ConnectionHandle, state: ConnectionState) {
        self.records.lock().push(Record::State(handle, state));
    }

    fn on_data_channel(&self, handle: ConnectionHandle, stream: u16, label: &str) {
        self.records
            .lock()
            .push(Record::Channel(handle, stream, label.to_string()));
    }

    fn on_message(&self, handle: ConnectionHandle, stream: u16, ppid: u32, data: &[u8]) {
        self.records
            .lock()
            .push(Record::Message(handle, stream, ppid, data.to_vec()));
    }

    fn on_closed(&self, handle: ConnectionHandle, reason: &str) {
        self.records
            .lock()
            .push(Record::Closed(handle, reason.to_string()));
    }
}

fn setup(sctp: bool) -> Result<(Service<Recorder>, Recorder)> {
    setup_with(PeerOptions {
        sctp: sctp.then(SctpOptions::default),
        ..Default::default()
    })
}

fn setup_with(peer: PeerOptions) -> Result<(Service<Recorder>, Recorder)> {
    let recorder = Recorder::default();
    let service = Service::new(ServiceOptions {
        interfaces: vec![Interface {
            listen: listen(),
            external: listen(),
        }],
        peer,
        pool_capacity: 16,
        buffer_size: 1500,
        handler: recorder.clone(),
    })?;

    Ok((service, recorder))
}

fn rtp(seq: u16) -> Vec<u8> {
    let mut bytes = vec![0x80, 0x60];
    bytes.extend(seq.to_be_bytes());
    bytes.extend(0x3e80u32.to_be_bytes());
    bytes.extend(SSRC.to_be_bytes());
    bytes.extend((0..160).map(|it| it as u8));
    bytes
}

/// The remote side of a connection: a controlling ICE agent, the DTLS
/// client and optionally the SCTP association, driven by hand.
struct Browser {
    address: SocketAddr,
    dtls: DtlsSession,
    srtp: Option<SrtpContext>,
    sctp: Option<Association>,
    with_sctp: bool,
    sctp_events: Vec<SctpEvent>,
    media: Vec<Bytes>,
}

impl Browser {
    fn new(service: &Service<Recorder>, address: SocketAddr, with_sctp: bool, now: Instant) -> Result<(Self, Certificate)> {
        let certificate = Certificate::generate()?;
        let dtls = DtlsSession::new(
            &certificate.context()?,
            &format!("sha-256 {}", service.fingerprint()),
            DtlsOptions {
                role: DtlsRole::Client,
                ..Default::default()
            },
            now,
        )?;

        Ok((
            Self {
                sctp_events: Vec::new(),
                media: Vec::new(),
                srtp: None,
                sctp: None,
                with_sctp,
                address,
                dtls,
            },
            certificate,
        ))
    }

    fn binding_request(&self, local_ufrag: &str, local_pwd: &str) -> BytesMut {
        let mut buf = BytesMut::with_capacity(1500);

        {
            let username = format!("{}:{}", local_ufrag, BROWSER_UFRAG);
            let mut message = MessageEncoder::new(BINDING_REQUEST, &[3u8; 12], &mut buf);
            message.append::<UserName>(&username);
            message.append::<Priority>(2130706431);
            message.append::<IceControlling>(7);
            message.append::<UseCandidate>(());
            message.flush(Some(local_pwd.as_bytes()));
        }

        buf
    }

    fn receive(
        &mut self,
        service: &Service<Recorder>,
        transmit: Transmit,
        now: Instant,
    ) -> Result<()> {
        assert_eq!(transmit.destination, self.address);
        assert_eq!(transmit.source, listen());

        match PacketKind::classify(&transmit.contents) {
            PacketKind::Stun => {
                let request = Message::decode(&transmit.contents)?;
                if request.class() != MessageClass::Request {
                    return Ok(());
                }

                let mut buf = BytesMut::with_capacity(1500);

                {
                    let mut message = MessageEncoder::extend(BINDING_RESPONSE, &request, &mut buf);
                    message.append::<XorMappedAddress>(listen());
                    message.flush(Some(BROWSER_PWD.as_bytes()));
                }

                service.handle_input(self.address, listen(), &buf, now)?;
            }
            PacketKind::Dtls => {
                self.dtls.handle_input(&transmit.contents, now)?;
                self.flush(now)?;
            }
            PacketKind::Rtp | PacketKind::Rtcp => self.media.push(transmit.contents),
            PacketKind::Unknown => anyhow::bail!("unexpected datagram"),
        }

        Ok(())
    }

    fn flush(&mut self, now: Instant) -> Result<()> {
        while let Some(event) = self.dtls.poll_event() {
            match event {
                DtlsEvent::Connected => {
                    let material = self
                        .dtls
                        .keying_material()
                        .ok_or(anyhow::anyhow!("no keying material"))?;

                    self.srtp = Some(SrtpContext::new(&material.remote, material.profile));

                    if self.with_sctp {
                        let mut sctp = Association::new(SctpOptions::default(), now);
                        sctp.connect(now)?;
                        self.sctp = Some(sctp);
                    }
                }
                DtlsEvent::ApplicationData(bytes) => {
                    if let Some(sctp) = &mut self.sctp {
                        sctp.handle_input(&bytes, now);
                    }
                }
                DtlsEvent::Closed => (),
            }
        }

        if let Some(sctp) = &mut self.sctp {
            while let Some(packet) = sctp.poll_transmit() {
                self.dtls.send(&packet)?;
            }

            while let Some(event) = sctp.poll_event() {
                self.sctp_events.push(event);
            }
        }

        Ok(())
    }

    fn unprotect(&mut self, packet: &[u8]) -> Result<Vec<u8>> {
        let srtp = self.srtp.as_mut().ok_or(anyhow::anyhow!("no srtp context"))?;
        Ok(srtp.unprotect_rtp(packet)?)
    }

    fn unprotect_rtcp(&mut self, packet: &[u8]) -> Result<Vec<u8>> {
        let srtp = self.srtp.as_mut().ok_or(anyhow::anyhow!("no srtp context"))?;
        Ok(srtp.unprotect_rtcp(packet)?)
    }
}

/// exchange datagrams between the service and one browser until both
/// are quiet.
fn pump(
    service: &Service<Recorder>,
    handle: ConnectionHandle,
    browser: &mut Browser,
    now: Instant,
) -> Result<()> {
    for _ in 0..32 {
        let mut moved = false;

        service.handle_timeout(handle, now)?;
        while let Some(transmit) = service.poll_transmit(handle) {
            browser.receive(service, transmit, now)?;
            moved = true;
        }

        browser.flush(now)?;
        while let Some(record) = browser.dtls.poll_transmit() {
            service.handle_input(browser.address, listen(), &record, now)?;
            moved = true;
        }

        if !moved {
            break;
        }
    }

    Ok(())
}

fn connect(
    service: &Service<Recorder>,
    address: SocketAddr,
    with_sctp: bool,
    now: Instant,
) -> Result<(ConnectionHandle, Browser)> {
    let (mut browser, certificate) = Browser::new(service, address, with_sctp, now)?;
    let handle =
        service.create_peer_connection(&format!("sha-256 {}", certificate.fingerprint()), now)?;

    service.set_remote_credentials(handle, BROWSER_UFRAG, BROWSER_PWD)?;
    service.add_remote_candidate(
        handle,
        &CandidateDescriptor {
            candidate: Some(format!(
                "candidate:1 1 udp 2130706431 {} {} typ host",
                address.ip(),
                address.port()
            )),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: Some(BROWSER_UFRAG.to_string()),
        },
        now,
    )?;

    let description = service.local_description(handle)?;
    let request = browser.binding_request(&description.ufrag, &description.pwd);
    assert_eq!(service.handle_input(address, listen(), &request, now)?, Some(handle));

    pump(service, handle, &mut browser, now)?;
    Ok((handle, browser))
}

#[test]
fn test_local_description() -> Result<()> {
    let (service, _) = setup(true)?;
    let now = Instant::now();

    let handle = service.create_peer_connection("sha-256 00:11", now)?;
    let description = service.local_description(handle)?;

    assert_eq!(description.ufrag.len(), 8);
    assert_eq!(description.pwd.len(), 24);
    assert_eq!(description.fingerprint, format!("sha-256 {}", service.fingerprint()));
    assert_eq!(description.setup, "passive");
    assert_eq!(description.candidates.len(), 1);
    assert!(description.candidates[0].contains("127.0.0.1 5000 typ host"));
    assert!(description.end_of_candidates);
    assert_eq!(description.sctp_port, Some(5000));

    let other = service.create_peer_connection("sha-256 00:11", now)?;
    assert_ne!(handle, other);
    assert_ne!(service.local_description(other)?.ufrag, description.ufrag);

    Ok(())
}

#[test]
fn test_remote_candidate_validation() -> Result<()> {
    let (service, _) = setup(false)?;
    let now = Instant::now();
    let handle = service.create_peer_connection("sha-256 00:11", now)?;

    let candidate = "candidate:1 1 udp 2130706431 192.0.2.1 40000 typ host".to_string();

    let missing_candidate = CandidateDescriptor {
        sdp_mid: Some("0".to_string()),
        ..Default::default()
    };

    let missing_mid = CandidateDescriptor {
        candidate: Some(candidate.clone()),
        ..Default::default()
    };

    assert!(matches!(
        service.add_remote_candidate(handle, &missing_candidate, now),
        Err(Error::InvalidCandidate)
    ));

    assert!(matches!(
        service.add_remote_candidate(handle, &missing_mid, now),
        Err(Error::InvalidCandidate)
    ));

    // end of candidates.
    service.add_remote_candidate(
        handle,
        &CandidateDescriptor {
            candidate: Some(String::new()),
            sdp_mid: Some("0".to_string()),
            ..Default::default()
        },
        now,
    )?;

    assert!(matches!(
        service.add_remote_candidate(
            handle,
            &CandidateDescriptor {
                candidate: Some("candidate:garbage".to_string()),
                sdp_mid: Some("0".to_string()),
                ..Default::default()
            },
            now,
        ),
        Err(Error::InvalidCandidate)
    ));

    service.add_remote_candidate(
        handle,
        &CandidateDescriptor {
            candidate: Some(candidate),
            sdp_mid: Some("0".to_string()),
            ..Default::default()
        },
        now,
    )?;

    Ok(())
}

#[test]
fn test_unknown_connection() -> Result<()> {
    let (service, _) = setup(false)?;
    let unknown = ConnectionHandle(999);

    assert!(matches!(
        service.set_remote_credentials(unknown, "a", "b"),
        Err(Error::NotFound)
    ));

    assert!(matches!(service.local_description(unknown), Err(Error::NotFound)));
    assert!(matches!(
        service.on_inbound_media(unknown, &rtp(1), 0, 172),
        Err(Error::NotFound)
    ));

    assert_eq!(service.state(unknown), None);
    assert!(service.close_connection(unknown).is_empty());

    // nothing routes a datagram from a stranger.
    assert_eq!(
        service.handle_input("192.0.2.1:1".parse()?, listen(), &rtp(1), Instant::now())?,
        None
    );

    Ok(())
}

#[test]
fn test_connect_and_close() -> Result<()> {
    let (service, recorder) = setup(false)?;
    let now = Instant::now();
    let address: SocketAddr = "127.0.0.1:40000".parse()?;

    let (handle, browser) = connect(&service, address, false, now)?;
    assert_eq!(service.state(handle), Some(ConnectionState::Connected));
    assert_eq!(service.connected(), vec![handle]);
    assert!(browser.dtls.is_established());

    let records = recorder.take();
    assert!(records.contains(&Record::State(handle, ConnectionState::Checking)));
    assert_eq!(records.last(), Some(&Record::State(handle, ConnectionState::Connected)));

    // the DTLS close_notify goes out on the nominated pair.
    let transmits = service.close_connection(handle);
    assert!(!transmits.is_empty());
    assert!(transmits.iter().all(|it| it.destination == address));

    assert_eq!(service.state(handle), None);
    assert!(service.connected().is_empty());
    assert!(service.close_connection(handle).is_empty());

    let closed: Vec<Record> = recorder
        .take()
        .into_iter()
        .filter(|it| matches!(it, Record::Closed(..)))
        .collect();

    assert_eq!(
        closed,
        vec![Record::Closed(handle, "closed by application".to_string())]
    );

    Ok(())
}

#[test]
fn test_fingerprint_mismatch_fails_connection() -> Result<()> {
    let (service, recorder) = setup(false)?;
    let now = Instant::now();
    let address: SocketAddr = "127.0.0.1:40001".parse()?;

    let (mut browser, _) = Browser::new(&service, address, false, now)?;
    let stranger = Certificate::generate()?;
    let handle =
        service.create_peer_connection(&format!("sha-256 {}", stranger.fingerprint()), now)?;

    service.set_remote_credentials(handle, BROWSER_UFRAG, BROWSER_PWD)?;
    service.add_remote_candidate(
        handle,
        &CandidateDescriptor {
            candidate: Some("candidate:1 1 udp 2130706431 127.0.0.1 40001 typ host".to_string()),
            sdp_mid: Some("0".to_string()),
            ..Default::default()
        },
        now,
    )?;

    let description = service.local_description(handle)?;
    let request = browser.binding_request(&description.ufrag, &description.pwd);
    service.handle_input(address, listen(), &request, now)?;

    let result = pump(&service, handle, &mut browser, now);
    assert!(result.is_err());
    assert_eq!(service.state(handle), None);

    // the datagram that failed the connection leaves no route behind.
    assert_eq!(service.route(address, &[0x16, 0xfe, 0xfd, 0x00]), None);

    let records = recorder.take();
    assert!(records.contains(&Record::State(handle, ConnectionState::Failed)));
    assert!(records.iter().any(|it| matches!(it, Record::Closed(h, _) if *h == handle)));

    Ok(())
}

#[test]
fn test_media_fan_out_keeps_independent_rollover_counters() -> Result<()> {
    let (service, _) = setup(false)?;
    let now = Instant::now();

    let (first, mut first_browser) = connect(&service, "127.0.0.1:40010".parse()?, false, now)?;

    for seq in [65534, 65535] {
        let packet = rtp(seq);
        let transmits = service.on_upstream_packet(&packet, 0, packet.len())?;
        assert_eq!(transmits.len(), 1);
        assert_eq!(transmits[0].0, first);
        assert_eq!(first_browser.unprotect(&transmits[0].1.contents)?, packet);
    }

    let (second, mut second_browser) =
        connect(&service, "127.0.0.1:40011".parse()?, false, now + Duration::from_millis(10))?;

    service.set_remap(
        second,
        Some(SsrcRemap {
            ssrc: 0x5555,
            payload_type: Some(111),
        }),
    )?;

    for seq in [0, 1] {
        // the packet sits at an offset inside a larger receive buffer.
        let packet = rtp(seq);
        let mut raw = vec![0u8; 4];
        raw.extend(&packet);

        let transmits = service.on_upstream_packet(&raw, 4, packet.len())?;
        assert_eq!(transmits.len(), 2);

        for (handle, transmit) in transmits {
            if handle == first {
                assert_eq!(first_browser.unprotect(&transmit.contents)?, packet);
            } else {
                let received = second_browser.unprotect(&transmit.contents)?;
                assert_eq!(&received[8..12], &0x5555u32.to_be_bytes());
                assert_eq!(received[1] & 0x7f, 111);
                assert_eq!(&received[12..], &packet[12..]);
            }
        }
    }

    assert_eq!(service.outbound_roc(first, SSRC), Some(1));
    assert_eq!(service.outbound_roc(second, 0x5555), Some(0));
    assert_eq!(service.outbound_roc(second, SSRC), None);

    let statistics = service.statistics(first).ok_or(anyhow::anyhow!("no statistics"))?;
    assert_eq!(statistics.packets_sent, 4);

    // every buffer went back to the pool.
    assert_eq!(service.pool().available(), 16);

    Ok(())
}

#[test]
fn test_invalid_upstream_packet_is_rejected_once() -> Result<()> {
    let (service, _) = setup(false)?;
    let now = Instant::now();
    let (_, _browser) = connect(&service, "127.0.0.1:40020".parse()?, false, now)?;

    assert!(service.on_upstream_packet(&[0x80, 0x60, 0x00], 0, 3).is_err());
    assert!(service.on_upstream_packet(&rtp(1), 0, 500).is_err());
    assert!(service.on_upstream_packet(&[0u8; 20], 0, 20).is_err());

    Ok(())
}

#[test]
fn test_media_before_connected_is_dropped() -> Result<()> {
    let (service, _) = setup(false)?;
    let now = Instant::now();
    let handle = service.create_peer_connection("sha-256 00:11", now)?;

    let packet = rtp(1);
    assert_eq!(service.on_inbound_media(handle, &packet, 0, packet.len())?, None);
    assert!(service.on_upstream_packet(&packet, 0, packet.len())?.is_empty());

    let statistics = service.statistics(handle).ok_or(anyhow::anyhow!("no statistics"))?;
    assert_eq!(statistics.packets_dropped, 1);
    assert_eq!(statistics.packets_sent, 0);

    Ok(())
}

#[test]
fn test_data_channel() -> Result<()> {
    let (service, recorder) = setup(true)?;
    let now = Instant::now();
    let (handle, mut browser) = connect(&service, "127.0.0.1:40030".parse()?, true, now)?;

    assert!(browser.sctp_events.contains(&SctpEvent::Connected));

    browser
        .sctp
        .as_mut()
        .ok_or(anyhow::anyhow!("no association"))?
        .open_channel(0, "chat", now)?;

    pump(&service, handle, &mut browser, now)?;
    assert!(recorder.take().contains(&Record::Channel(handle, 0, "chat".to_string())));

    service.send_data(handle, 0, Bytes::from_static(b"hello"), false, now)?;
    pump(&service, handle, &mut browser, now)?;
    assert!(browser.sctp_events.contains(&SctpEvent::Message {
        stream: 0,
        ppid: PPID_STRING,
        data: Bytes::from_static(b"hello"),
    }));

    browser
        .sctp
        .as_mut()
        .ok_or(anyhow::anyhow!("no association"))?
        .send(0, PPID_STRING, Bytes::from_static(b"world"), false, now)?;

    pump(&service, handle, &mut browser, now)?;
    assert!(recorder.take().contains(&Record::Message(
        handle,
        0,
        PPID_STRING,
        b"world".to_vec()
    )));

    Ok(())
}

#[test]
fn test_server_reflexive_gathering() -> Result<()> {
    let server: SocketAddr = "127.0.0.1:3478".parse()?;
    let (service, _) = setup_with(PeerOptions {
        ice: IceOptions {
            stun_server: Some(server),
            ..Default::default()
        },
        ..Default::default()
    })?;

    let now = Instant::now();
    let handle = service.create_peer_connection("sha-256 00:11", now)?;
    assert!(!service.local_description(handle)?.end_of_candidates);

    let transmit = service
        .poll_transmit(handle)
        .ok_or(anyhow::anyhow!("no gather request"))?;

    assert_eq!(transmit.destination, server);
    assert_eq!(transmit.source, listen());

    let request = Message::decode(&transmit.contents)?;
    assert_eq!(request.class(), MessageClass::Request);

    let mapped: SocketAddr = "203.0.113.7:61000".parse()?;
    let mut buf = BytesMut::with_capacity(1500);

    {
        let mut message = MessageEncoder::extend(BINDING_RESPONSE, &request, &mut buf);
        message.append::<XorMappedAddress>(mapped);
        message.flush(None);
    }

    // no USERNAME, and the server address was never seen before.
    assert_eq!(service.route(server, &buf), Some(handle));
    assert_eq!(service.handle_input(server, listen(), &buf, now)?, Some(handle));

    let description = service.local_description(handle)?;
    assert!(description.end_of_candidates);
    assert_eq!(description.candidates.len(), 2);
    assert!(description.candidates[1].contains("203.0.113.7 61000 typ srflx"));

    // the transaction is answered, a duplicate belongs to nobody.
    assert_eq!(service.route(server, &buf), None);

    Ok(())
}

#[test]
fn test_check_response_is_routed_before_the_browser_checks() -> Result<()> {
    let (service, _) = setup(false)?;
    let now = Instant::now();
    let browser: SocketAddr = "127.0.0.1:6000".parse()?;

    let handle = service.create_peer_connection("sha-256 00:11", now)?;
    service.set_remote_credentials(handle, BROWSER_UFRAG, BROWSER_PWD)?;
    service.add_remote_candidate(
        handle,
        &CandidateDescriptor {
            candidate: Some("candidate:1 1 udp 2130706431 127.0.0.1 6000 typ host".to_string()),
            sdp_mid: Some("0".to_string()),
            ..Default::default()
        },
        now,
    )?;

    service.handle_timeout(handle, now)?;

    let check = service
        .poll_transmit(handle)
        .ok_or(anyhow::anyhow!("no connectivity check"))?;

    assert_eq!(check.destination, browser);

    let request = Message::decode(&check.contents)?;
    let mut buf = BytesMut::with_capacity(1500);

    {
        let mut message = MessageEncoder::extend(BINDING_RESPONSE, &request, &mut buf);
        message.append::<XorMappedAddress>(listen());
        message.flush(Some(BROWSER_PWD.as_bytes()));
    }

    assert_eq!(service.route(browser, &buf), Some(handle));
    assert_eq!(service.handle_input(browser, listen(), &buf, now)?, Some(handle));

    // the pair succeeded, so the address is known for DTLS now.
    assert_eq!(service.route(browser, &[0x16, 0xfe, 0xfd, 0x00]), Some(handle));
    assert_eq!(service.state(handle), Some(ConnectionState::Checking));

    Ok(())
}

#[test]
fn test_sender_report_follows_remap() -> Result<()> {
    let (service, _) = setup(false)?;
    let now = Instant::now();
    let (handle, mut browser) = connect(&service, "127.0.0.1:40040".parse()?, false, now)?;

    service.set_remap(
        handle,
        Some(SsrcRemap {
            ssrc: 0x5555,
            payload_type: None,
        }),
    )?;

    let mut report = vec![0x80, 0xc8, 0x00, 0x06];
    report.extend(SSRC.to_be_bytes());
    report.extend([0u8; 20]);

    let transmits = service.on_upstream_packet(&report, 0, report.len())?;
    assert_eq!(transmits.len(), 1);

    let received = browser.unprotect_rtcp(&transmits[0].1.contents)?;
    assert_eq!(&received[4..8], &0x5555u32.to_be_bytes());
    assert_eq!(&received[8..], &report[8..]);

    // without a remap the report is forwarded as is.
    service.set_remap(handle, None)?;

    let transmits = service.on_upstream_packet(&report, 0, report.len())?;
    assert_eq!(browser.unprotect_rtcp(&transmits[0].1.contents)?, report);

    Ok(())
}
