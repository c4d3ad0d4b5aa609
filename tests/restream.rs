use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};

use anyhow::{Result, anyhow};
use bytes::BytesMut;
use codec::{
    PacketKind,
    stun::{
        Message, MessageEncoder,
        attributes::{IceControlling, Priority, UseCandidate, UserName, XorMappedAddress},
        methods::{BINDING_REQUEST, BINDING_RESPONSE, MessageClass},
    },
};
use rtp_restream::{
    Restream,
    config::{Config, Interface},
};
use service::{
    CandidateDescriptor, ConnectionHandle,
    dtls::{Certificate, DtlsEvent, DtlsOptions, DtlsRole, DtlsSession},
    peer::ConnectionState,
    srtp::SrtpContext,
};
use tokio::{net::UdpSocket, time::sleep};

const BROWSER_UFRAG: &str = "brws";
const BROWSER_PWD: &str = "browserpasswordbrowserpw";
const SSRC: u32 = 0x1234ABCD;

fn config() -> Config {
    let base = rand::random_range(20000..60000u16);
    let peer = SocketAddr::from(([127, 0, 0, 1], base + 1));

    let mut config = Config::default();
    config.server.upstream = SocketAddr::from(([127, 0, 0, 1], base));
    config.server.interfaces = vec![Interface {
        listen: peer,
        external: peer,
    }];

    config.sctp.enabled = false;
    config.pool.buffers = 64;
    config
}

async fn start(config: Config) -> Result<Restream> {
    let restream = Restream::bind(config).await?;

    {
        let restream = restream.clone();
        tokio::spawn(async move { restream.run().await });
    }

    Ok(restream)
}

fn rtp(seq: u16) -> Vec<u8> {
    let mut bytes = vec![0x80, 0x60];
    bytes.extend(seq.to_be_bytes());
    bytes.extend((seq as u32 * 160).to_be_bytes());
    bytes.extend(SSRC.to_be_bytes());
    bytes.extend([0x5a; 160]);
    bytes
}

/// waits until `check` holds, polling every 20 milliseconds.
async fn eventually<F>(mut check: F) -> Result<()>
where
    F: FnMut() -> bool,
{
    for _ in 0..250 {
        if check() {
            return Ok(());
        }

        sleep(Duration::from_millis(20)).await;
    }

    Err(anyhow!("condition not reached"))
}

struct Browser {
    socket: UdpSocket,
    server: SocketAddr,
    dtls: DtlsSession,
    srtp: Option<SrtpContext>,
    closed: bool,
}

impl Browser {
    async fn connect(restream: &Restream) -> Result<(Self, ConnectionHandle)> {
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        let address = socket.local_addr()?;
        let server = restream.service().interfaces()[0].listen;

        let certificate = Certificate::generate()?;
        let handle =
            restream.create_peer_connection(&format!("sha-256 {}", certificate.fingerprint()))?;

        restream.set_remote_credentials(handle, BROWSER_UFRAG, BROWSER_PWD)?;
        restream.add_remote_candidate(
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
        )?;

        let description = restream.local_description(handle)?;
        let dtls = DtlsSession::new(
            &certificate.context()?,
            &description.fingerprint,
            DtlsOptions {
                role: DtlsRole::Client,
                ..Default::default()
            },
            Instant::now(),
        )?;

        let browser = Self {
            srtp: None,
            closed: false,
            socket,
            server,
            dtls,
        };

        let mut buf = BytesMut::with_capacity(1500);

        {
            let username = format!("{}:{}", description.ufrag, BROWSER_UFRAG);
            let mut message = MessageEncoder::new(BINDING_REQUEST, &[9u8; 12], &mut buf);
            message.append::<UserName>(&username);
            message.append::<Priority>(2130706431);
            message.append::<IceControlling>(11);
            message.append::<UseCandidate>(());
            message.flush(Some(description.pwd.as_bytes()));
        }

        browser.socket.send_to(&buf, server).await?;
        Ok((browser, handle))
    }

    async fn flush(&mut self) -> Result<()> {
        let now = Instant::now();
        if self.dtls.poll_timeout().is_some_and(|it| it <= now) {
            self.dtls.handle_timeout(now)?;
        }

        while let Some(record) = self.dtls.poll_transmit() {
            self.socket.send_to(&record, self.server).await?;
        }

        while let Some(event) = self.dtls.poll_event() {
            match event {
                DtlsEvent::Connected => {
                    let material = self
                        .dtls
                        .keying_material()
                        .ok_or(anyhow!("no keying material"))?;

                    self.srtp = Some(SrtpContext::new(&material.remote, material.profile));
                }
                DtlsEvent::Closed => self.closed = true,
                DtlsEvent::ApplicationData(_) => (),
            }
        }

        Ok(())
    }

    /// Receive one datagram, answering connectivity checks and feeding
    /// DTLS records. Returns the decrypted RTP packet if it was media.
    async fn receive(&mut self) -> Result<Option<Vec<u8>>> {
        self.flush().await?;

        let mut buffer = [0u8; 1500];
        let Ok(received) =
            tokio::time::timeout(Duration::from_millis(50), self.socket.recv_from(&mut buffer))
                .await
        else {
            return Ok(None);
        };

        let (size, source) = received?;
        let bytes = &buffer[..size];

        match PacketKind::classify(bytes) {
            PacketKind::Stun => {
                let request = Message::decode(bytes)?;
                if request.class() == MessageClass::Request {
                    let mut buf = BytesMut::with_capacity(1500);

                    {
                        let mut message =
                            MessageEncoder::extend(BINDING_RESPONSE, &request, &mut buf);
                        message.append::<XorMappedAddress>(source);
                        message.flush(Some(BROWSER_PWD.as_bytes()));
                    }

                    self.socket.send_to(&buf, source).await?;
                }
            }
            PacketKind::Dtls => {
                self.dtls.handle_input(bytes, Instant::now())?;
                self.flush().await?;
            }
            PacketKind::Rtp => {
                if let Some(srtp) = &mut self.srtp {
                    return Ok(Some(srtp.unprotect_rtp(bytes)?));
                }
            }
            _ => (),
        }

        Ok(None)
    }
}

#[tokio::test]
async fn test_upstream_media_reaches_browser() -> Result<()> {
    let restream = start(config()).await?;
    let upstream = UdpSocket::bind("127.0.0.1:0").await?;
    let upstream_addr = restream.upstream_addr()?;

    let (mut browser, handle) = Browser::connect(&restream).await?;

    let mut seq = 0u16;
    let mut received = None;
    for _ in 0..200 {
        if browser.srtp.is_some() {
            seq += 1;
            upstream.send_to(&rtp(seq), upstream_addr).await?;
        }

        if let Some(packet) = browser.receive().await? {
            received = Some(packet);
            break;
        }
    }

    let packet = received.ok_or(anyhow!("no media received"))?;
    assert_eq!(&packet[8..12], &SSRC.to_be_bytes());
    assert_eq!(&packet[12..], &[0x5a; 160]);

    assert_eq!(restream.service().state(handle), Some(ConnectionState::Connected));
    assert!(restream.statistics().upstream().received_pkts >= 1);

    let counts = restream
        .peer_statistics(handle)
        .ok_or(anyhow!("no peer statistics"))?;
    assert!(counts.send_pkts >= 1);
    assert!(counts.received_pkts >= 1);

    restream.close_connection(handle).await?;
    assert_eq!(restream.service().state(handle), None);
    assert!(restream.peer_statistics(handle).is_none());

    // the close_notify reaches the browser.
    for _ in 0..40 {
        browser.receive().await?;
        if browser.closed {
            break;
        }
    }

    assert!(browser.closed);

    // closing twice is fine.
    restream.close_connection(handle).await?;

    Ok(())
}

#[tokio::test]
async fn test_invalid_upstream_datagram_is_counted() -> Result<()> {
    let restream = start(config()).await?;
    let upstream = UdpSocket::bind("127.0.0.1:0").await?;
    let upstream_addr = restream.upstream_addr()?;

    // version 0 is not RTP.
    upstream.send_to(&[0u8; 20], upstream_addr).await?;
    upstream.send_to(&rtp(1), upstream_addr).await?;

    eventually(|| restream.statistics().upstream().received_pkts == 2).await?;

    let counts = restream.statistics().upstream();
    assert_eq!(counts.error_pkts, 1);
    assert_eq!(counts.received_bytes, 20 + 172);

    Ok(())
}

#[tokio::test]
async fn test_media_is_not_sent_before_connected() -> Result<()> {
    let restream = start(config()).await?;
    let upstream = UdpSocket::bind("127.0.0.1:0").await?;
    let upstream_addr = restream.upstream_addr()?;

    let handle = restream.create_peer_connection("sha-256 00:11")?;
    upstream.send_to(&rtp(1), upstream_addr).await?;

    eventually(|| restream.statistics().upstream().received_pkts == 1).await?;

    let counts = restream
        .peer_statistics(handle)
        .ok_or(anyhow!("no peer statistics"))?;
    assert_eq!(counts.send_pkts, 0);
    assert_eq!(restream.service().state(handle), Some(ConnectionState::New));

    Ok(())
}

#[tokio::test]
async fn test_invalid_candidate_is_rejected() -> Result<()> {
    let restream = start(config()).await?;
    let handle = restream.create_peer_connection("sha-256 00:11")?;

    let result = restream.add_remote_candidate(
        handle,
        &CandidateDescriptor {
            candidate: Some("candidate:1 1 udp 2130706431 127.0.0.1 40000 typ host".to_string()),
            ..Default::default()
        },
    );

    assert!(result.is_err());

    Ok(())
}

#[test]
fn test_default_config_maps_to_peer_options() {
    let config = Config::default();
    assert_eq!(config.server.upstream, "0.0.0.0:5004".parse().unwrap());
    assert!(config.server.interfaces.is_empty());
    assert_eq!(config.pool.buffers, 4096);
    assert_eq!(config.pool.buffer_size, 1500);

    let options = config.peer_options();
    assert_eq!(options.ice.check_interval, Duration::from_millis(50));
    assert_eq!(options.ice.consent_timeout, Duration::from_secs(30));
    assert_eq!(options.ice.gathering_timeout, Duration::from_secs(30));
    assert_eq!(options.ice.stun_server, None);
    assert_eq!(options.dtls.role, DtlsRole::Server);
    assert_eq!(options.dtls.max_flights, 6);
    assert_eq!(options.sctp.map(|it| it.port), Some(5000));
}
